// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![deny(unsafe_code)]

//! # methodtable
//!
//! The runtime type-descriptor format of a managed runtime, in pure Rust.
//!
//! Every type known to the runtime is described by one compact, variable-shaped record: its
//! instance size, virtual method table, implemented interfaces and, for generic, array,
//! pointer and function-pointer types, the data that composes it from other types. The record
//! is consulted on every allocation, virtual call, interface dispatch, cast and GC scan, so
//! the position of every field has to be computed exactly and cheaply.
//!
//! This crate provides:
//!
//! - **Bit-exact decoding** of the flags word, the kind-dependent base-size word and the
//!   ordered optional fields
//! - **Absolute and relative pointers** behind one read contract, chosen once per descriptor
//! - **A read-only handle** ([`MethodTable`]) whose accessors never allocate or lock
//! - **A construction-phase builder** ([`descriptor::MethodTableBuilder`]) that enforces field
//!   order and publishes in a single step
//! - **Interface dispatch maps** with standard/default and instance/static partitions
//! - **Shared generic argument vectors** de-duplicated across instantiations
//! - **Structural validation** for records mapped from untrusted images
//!
//! ## Quick Start
//!
//! ```rust
//! use methodtable::prelude::*;
//!
//! let registry = TypeRegistry::new(RegistryConfig::x64());
//!
//! // A two-element sz-array of int
//! let int32 = registry
//!     .begin(&DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Int32))?
//!     .publish()?;
//! let array = registry
//!     .begin(
//!         &DescriptorHeader::new(
//!             TypeShape::Parameterized(ParameterizedShape::sz_array(&Target::X64)),
//!             ElementType::SzArray,
//!         )
//!         .component_size(4)
//!         .related_type(int32.address()),
//!     )?
//!     .publish()?;
//!
//! assert!(array.is_sz_array());
//! assert_eq!(array.array_rank(), 1);
//! assert_eq!(array.related_parameter_type(), int32.address());
//! # Ok::<(), methodtable::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`memory`] - addresses, bounds-checked byte I/O, the append-only address space and the
//!   pointer indirection layer
//! - [`descriptor`] - flags, shapes, the field offset calculator, accessors, builder, dispatch
//!   maps, generics and validation
//! - [`registry`] - [`TypeRegistry`], the program-lifetime owner of everything published
//! - [`config`] - [`Target`] and [`RegistryConfig`]
//!
//! ## Contract Violations
//!
//! Accessors on a published descriptor do not return errors. Asking for a field the
//! descriptor does not have, or for an interpretation its kind does not support, fires a
//! debug assertion; release builds return a defined but meaningless value. Errors
//! ([`Error`]) are reserved for construction, image mapping and validation.
//!
//! ## Logging
//!
//! Segment publication, descriptor publication, argument-vector sharing and validation
//! failures are reported through [`tracing`]. The library never installs a subscriber.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust
/// use methodtable::prelude::*;
///
/// let registry = TypeRegistry::new(RegistryConfig::default());
/// assert_eq!(registry.descriptor_count(), 0);
/// ```
pub mod prelude;

/// Target description and registry configuration.
pub mod config;

/// Type descriptors: flags, layout, accessors, builder, dispatch maps and generics.
pub mod descriptor;

/// Addresses, byte I/O, the address space and pointer indirection.
pub mod memory;

/// The program-lifetime owner of published descriptors.
pub mod registry;

/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
///
/// # Examples
///
/// ```rust
/// use methodtable::{Result, TypeRegistry};
/// use methodtable::memory::Address;
///
/// fn kind_name(registry: &TypeRegistry, address: Address) -> Result<String> {
///     Ok(registry.method_table_at(address)?.kind().to_string())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `methodtable` Error type
///
/// # Examples
///
/// ```rust
/// use methodtable::{Error, TypeRegistry};
/// use methodtable::config::RegistryConfig;
/// use methodtable::memory::Address;
///
/// let registry = TypeRegistry::new(RegistryConfig::x64());
/// match registry.method_table_at(Address::new(0x1234)) {
///     Err(Error::Unmapped(address)) => println!("nothing at {address}"),
///     Err(error) => println!("error: {error}"),
///     Ok(_) => unreachable!(),
/// }
/// ```
pub use error::Error;

pub use config::{RegistryConfig, Target};
pub use descriptor::MethodTable;
pub use registry::TypeRegistry;
