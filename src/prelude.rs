//! # methodtable Prelude
//!
//! This module provides a convenient prelude for the most commonly used types from the
//! methodtable library. Import it to get quick access to everything needed to build, publish
//! and read descriptors.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all methodtable operations
pub use crate::Error;

/// The result type used throughout methodtable
pub use crate::Result;

/// Target layout and registry configuration
pub use crate::config::{RegistryConfig, Target};

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Owner of all published descriptors
pub use crate::registry::TypeRegistry;

/// Read-only descriptor handle
pub use crate::descriptor::MethodTable;

/// Construction-phase types
pub use crate::descriptor::{DescriptorHeader, MethodTableBuilder};

// ================================================================================================
// Descriptor Format
// ================================================================================================

/// Flags word decoding
pub use crate::descriptor::{
    DescriptorFlags, DynamicTypeFlags, ElementType, ExtendedFlags, TypeFlags, TypeKind,
};

/// Base-size interpretations and optional fields
pub use crate::descriptor::{DescriptorField, ParameterizedShape, TypeShape};

/// Interface dispatch
pub use crate::descriptor::{DispatchKind, DispatchMap, DispatchMapBuilder};

/// Generic variance
pub use crate::descriptor::GenericVariance;

// ================================================================================================
// Memory
// ================================================================================================

/// Addresses and reference lists
pub use crate::memory::{Address, DescriptorList, PointerMode};
