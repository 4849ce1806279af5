//! The kind-dependent meaning of the base-size word.
//!
//! The second word of the fixed prefix is reused by every kind: a GC size for canonical types
//! and arrays, a parameter count for generic definitions, a shape tag for pointers and byrefs,
//! and a packed flags+count for function pointers. [`TypeShape`] is the in-memory view with
//! one variant per reading; the single `u32` only exists at the byte boundary
//! ([`TypeShape::encode`] / [`TypeShape::decode`]).

use crate::{
    config::Target,
    descriptor::flags::{TypeKind, FUNCTION_POINTER_FLAGS_MASK, FUNCTION_POINTER_UNMANAGED},
};

/// Shape tag of a parameterized descriptor.
///
/// Two parameterized types over the same element are only equivalent if their shapes match
/// exactly, which is why the multi-dimensional array rank is part of the shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterizedShape {
    /// Unmanaged pointer (raw shape 0)
    Pointer,
    /// Managed reference (raw shape 1)
    ByRef,
    /// Array; the raw shape is the array's GC base size
    Array {
        /// Base size, at least the single-dimension array base size
        base_size: u32,
    },
}

impl ParameterizedShape {
    /// Raw shape value of an unmanaged pointer
    pub const POINTER_SHAPE: u32 = 0;
    /// Raw shape value of a managed reference
    pub const BYREF_SHAPE: u32 = 1;

    /// Shape of a single-dimension, zero-lower-bound array on `target`
    #[must_use]
    pub fn sz_array(target: &Target) -> Self {
        ParameterizedShape::Array {
            base_size: target.sz_array_base_size(),
        }
    }

    /// Shape of a multi-dimensional array of `rank` on `target`.
    ///
    /// Each dimension adds a lower and an upper `Int32` bound to the base size.
    #[must_use]
    pub fn md_array(target: &Target, rank: u32) -> Self {
        ParameterizedShape::Array {
            base_size: target.sz_array_base_size() + rank * 2 * 4,
        }
    }

    /// The raw shape value
    #[must_use]
    pub fn raw(&self) -> u32 {
        match *self {
            ParameterizedShape::Pointer => Self::POINTER_SHAPE,
            ParameterizedShape::ByRef => Self::BYREF_SHAPE,
            ParameterizedShape::Array { base_size } => base_size,
        }
    }

    /// Decodes a raw shape value
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            Self::POINTER_SHAPE => ParameterizedShape::Pointer,
            Self::BYREF_SHAPE => ParameterizedShape::ByRef,
            base_size => ParameterizedShape::Array { base_size },
        }
    }
}

/// Kind-tagged reading of the base-size word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeShape {
    /// Canonical type: GC base size of an instance
    Object {
        /// Size of a heap instance including header and descriptor pointer
        base_size: u32,
    },
    /// Pointer, byref or array
    Parameterized(ParameterizedShape),
    /// Open generic definition
    GenericDefinition {
        /// Number of generic parameters
        parameter_count: u16,
    },
    /// Function pointer signature
    FunctionPointer {
        /// Number of parameters stored inline after the generic fields
        parameter_count: u32,
        /// Unmanaged calling convention
        is_unmanaged: bool,
    },
}

impl TypeShape {
    /// The descriptor kind this shape belongs to
    #[must_use]
    pub fn kind(&self) -> TypeKind {
        match self {
            TypeShape::Object { .. } => TypeKind::Canonical,
            TypeShape::Parameterized(_) => TypeKind::Parameterized,
            TypeShape::GenericDefinition { .. } => TypeKind::GenericTypeDefinition,
            TypeShape::FunctionPointer { .. } => TypeKind::FunctionPointer,
        }
    }

    /// Encodes the shape into the raw base-size word
    #[must_use]
    pub fn encode(&self) -> u32 {
        match *self {
            TypeShape::Object { base_size } => base_size,
            TypeShape::Parameterized(shape) => shape.raw(),
            TypeShape::GenericDefinition { parameter_count } => u32::from(parameter_count),
            TypeShape::FunctionPointer {
                parameter_count,
                is_unmanaged,
            } => {
                debug_assert!(
                    parameter_count & FUNCTION_POINTER_FLAGS_MASK == 0,
                    "function pointer parameter count overflows into flag bits"
                );
                let flags = if is_unmanaged {
                    FUNCTION_POINTER_UNMANAGED
                } else {
                    0
                };
                (parameter_count & !FUNCTION_POINTER_FLAGS_MASK) | flags
            }
        }
    }

    /// Decodes the raw base-size word under `kind`
    #[must_use]
    pub fn decode(kind: TypeKind, raw: u32) -> Self {
        match kind {
            TypeKind::Canonical => TypeShape::Object { base_size: raw },
            TypeKind::Parameterized => TypeShape::Parameterized(ParameterizedShape::from_raw(raw)),
            TypeKind::GenericTypeDefinition => TypeShape::GenericDefinition {
                parameter_count: raw as u16,
            },
            TypeKind::FunctionPointer => TypeShape::FunctionPointer {
                parameter_count: raw & !FUNCTION_POINTER_FLAGS_MASK,
                is_unmanaged: raw & FUNCTION_POINTER_UNMANAGED != 0,
            },
        }
    }

    /// Number of inline function-pointer parameters, zero for every other shape
    #[must_use]
    pub fn function_pointer_parameter_count(&self) -> u32 {
        match *self {
            TypeShape::FunctionPointer {
                parameter_count, ..
            } => parameter_count,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameterized_shapes() {
        assert_eq!(ParameterizedShape::from_raw(0), ParameterizedShape::Pointer);
        assert_eq!(ParameterizedShape::from_raw(1), ParameterizedShape::ByRef);
        assert_eq!(
            ParameterizedShape::sz_array(&Target::X64),
            ParameterizedShape::Array { base_size: 24 }
        );
        assert_eq!(ParameterizedShape::md_array(&Target::X64, 2).raw(), 24 + 16);
        assert_eq!(ParameterizedShape::md_array(&Target::X86, 3).raw(), 12 + 24);
    }

    #[test]
    fn function_pointer_packing() {
        let shape = TypeShape::FunctionPointer {
            parameter_count: 3,
            is_unmanaged: true,
        };
        let raw = shape.encode();
        assert_eq!(raw, 0x8000_0003);
        assert_eq!(TypeShape::decode(TypeKind::FunctionPointer, raw), shape);
        assert_eq!(shape.function_pointer_parameter_count(), 3);
    }

    #[test]
    fn kind_follows_variant() {
        let shapes = [
            TypeShape::Object { base_size: 24 },
            TypeShape::Parameterized(ParameterizedShape::ByRef),
            TypeShape::GenericDefinition { parameter_count: 2 },
            TypeShape::FunctionPointer {
                parameter_count: 0,
                is_unmanaged: false,
            },
        ];
        for shape in shapes {
            assert_eq!(TypeShape::decode(shape.kind(), shape.encode()), shape);
        }
        assert_eq!(
            TypeShape::Object { base_size: 24 }.function_pointer_parameter_count(),
            0
        );
    }
}
