//! Addresses inside a runtime address space.

use std::fmt;

/// A location inside an [`crate::memory::AddressSpace`].
///
/// Descriptors never hold live Rust references to each other; every cross-record link is an
/// `Address` that is looked up through the space that owns the target. The value `0` is the
/// null address and is never handed out by an allocator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub u64);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// Creates an address from a raw value
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Address(value)
    }

    /// Returns the raw address value
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the null address
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns the address `bytes` past this one.
    #[must_use]
    pub const fn add(&self, bytes: u64) -> Address {
        Address(self.0.wrapping_add(bytes))
    }

    /// Returns this address displaced by a signed byte count.
    #[must_use]
    pub const fn displace(&self, displacement: i64) -> Address {
        Address(self.0.wrapping_add_signed(displacement))
    }

    /// Signed distance from `self` to `target`, or `None` if it does not fit an `i64`.
    #[must_use]
    pub fn distance_to(&self, target: Address) -> Option<i64> {
        let delta = i128::from(target.0) - i128::from(self.0);
        i64::try_from(delta).ok()
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

impl From<Address> for u64 {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{:x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}
