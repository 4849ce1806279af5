//! The type-descriptor format.
//!
//! A descriptor is a self-describing, variable-length record. This module splits it into the
//! pieces a reader needs, leaves first:
//!
//! - [`flags`] - decoding of the packed flags word into kind, element type and attributes
//! - [`shape`] - the kind-dependent meaning of the base-size word
//! - [`layout`] - the fixed prefix and the ordered walk over optional fields
//! - [`table`] - [`MethodTable`], the read-only handle with every accessor
//! - [`dispatch`] - interface dispatch maps
//! - [`generics`] - variance annotations and shared argument vectors
//! - [`builder`] - [`DescriptorHeader`] and [`MethodTableBuilder`] for runtime construction
//! - [`validation`] - structural checks for records of unknown origin
//!
//! # Record Layout
//!
//! ```text
//! +---------------------------+  0
//! | flags            u32      |
//! | base size        u32      |
//! | related type     pointer  |
//! | vtable slots     u16      |
//! | interfaces       u16      |
//! | hash code        u32      |
//! +---------------------------+  16 + P
//! | vtable           P * n    |
//! | interface map    P * m    |
//! +---------------------------+
//! | optional fields, in DescriptorField order, present ones only  |
//! +---------------------------+
//! ```

pub mod builder;
pub mod dispatch;
pub mod flags;
pub mod generics;
pub mod layout;
pub mod shape;
pub mod table;
pub mod validation;

pub use builder::{DescriptorHeader, MethodTableBuilder};
pub use dispatch::{
    DispatchCounts, DispatchKind, DispatchMap, DispatchMapBuilder, DispatchMapEntry,
    StaticDispatchMapEntry,
};
pub use flags::{
    DescriptorFlags, DynamicTypeFlags, ElementType, ExtendedFlags, TypeFlags, TypeKind,
};
pub use generics::{GenericCompositionCache, GenericVariance};
pub use layout::{
    descriptor_size, field_offset, present_fields, DescriptorField, DynamicFlagsSource,
    FieldSlot, FixedPrefix,
};
pub use shape::{ParameterizedShape, TypeShape};
pub use table::MethodTable;
pub use validation::{validate_descriptor, validate_prefix, validate_staged};
