//! Generic variance annotations and the shared argument-vector cache.
//!
//! An instantiation with more than one argument does not store its arguments inline; its
//! composition slot points at an out-of-line vector. Instantiations over the same argument
//! vector share one buffer, so argument-list identity can be compared by address. The
//! [`GenericCompositionCache`] owns that de-duplication.

use dashmap::{mapref::entry::Entry, DashMap};
use strum::{Display, FromRepr};
use tracing::trace;

use crate::{
    memory::{Address, PointerMode},
    Result,
};

/// Variance of one generic parameter, stored as one byte per parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display)]
#[repr(u8)]
pub enum GenericVariance {
    /// Invariant
    NonVariant = 0,
    /// `out T`
    Covariant = 1,
    /// `in T`
    Contravariant = 2,
    /// Covariance that arrays get for reference-type elements
    ArrayCovariant = 0x20,
}

type CompositionKey = (PointerMode, Vec<Address>);

/// De-duplicates out-of-line generic argument vectors.
///
/// Keyed by the storage mode as well as the arguments, since a relative vector and an
/// absolute vector over the same arguments have different bytes.
#[derive(Default)]
pub struct GenericCompositionCache {
    entries: DashMap<CompositionKey, Address>,
}

impl GenericCompositionCache {
    /// Creates an empty cache
    #[must_use]
    pub fn new() -> Self {
        GenericCompositionCache {
            entries: DashMap::new(),
        }
    }

    /// Number of distinct argument vectors
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no vector has been interned yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the shared vector for `arguments`, calling `allocate` on first use.
    ///
    /// The shard holding the key stays locked while `allocate` runs, so two threads interning
    /// the same vector never allocate it twice.
    ///
    /// # Errors
    /// Propagates the error of `allocate`; nothing is cached in that case.
    pub fn get_or_allocate<F>(
        &self,
        mode: PointerMode,
        arguments: &[Address],
        allocate: F,
    ) -> Result<Address>
    where
        F: FnOnce() -> Result<Address>,
    {
        match self.entries.entry((mode, arguments.to_vec())) {
            Entry::Occupied(entry) => {
                trace!(arity = arguments.len(), address = %entry.get(), "generic composition hit");
                Ok(*entry.get())
            }
            Entry::Vacant(entry) => {
                let address = allocate()?;
                trace!(arity = arguments.len(), %address, "generic composition miss");
                entry.insert(address);
                Ok(address)
            }
        }
    }
}
