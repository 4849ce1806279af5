//! Flags word decoding: type kind, element type and attribute bits.
//!
//! The first field of every descriptor is a packed 32-bit word:
//!
//! ```text
//!  31  30..26        25..18           17..16   15..0
//! +---+------------+----------------+--------+-----------------------------------+
//! | C | element    | attribute bits | kind   | component size   (C = 1)          |
//! |   | type       |                |        | extended flags   (C = 0)          |
//! +---+------------+----------------+--------+-----------------------------------+
//! ```
//!
//! The low half is overloaded: strings and arrays store their per-element size there, every
//! other type stores [`ExtendedFlags`] plus two small packed counts. The top bit tells the
//! two interpretations apart and [`DescriptorFlags`] never reports both as non-zero.
//!
//! # Key Types
//! - [`DescriptorFlags`] - Decoder over the raw word
//! - [`TypeFlags`] - Attribute bits in the upper half
//! - [`ExtendedFlags`] - Attribute bits in the lower half
//! - [`TypeKind`], [`ElementType`] - The two enumerations packed into the upper half
//! - [`DynamicTypeFlags`] - The separate word stored by runtime-built descriptors

use bitflags::bitflags;
use strum::{Display, EnumCount, EnumIter, FromRepr};

/// Bitmask selecting the [`TypeKind`] bits
pub const TYPE_KIND_MASK: u32 = 0x0003_0000;
/// Shift of the [`TypeKind`] bits
pub const TYPE_KIND_SHIFT: u32 = 16;
/// Bitmask selecting the [`ElementType`] bits
pub const ELEMENT_TYPE_MASK: u32 = 0x7C00_0000;
/// Shift of the [`ElementType`] bits
pub const ELEMENT_TYPE_SHIFT: u32 = 26;
/// Bitmask of the overloaded low half
pub const LOW_HALF_MASK: u32 = 0x0000_FFFF;

/// Bitmask of the value-type field padding inside the extended flags
pub const VALUE_TYPE_FIELD_PADDING_MASK: u16 = 0x00E0;
/// Shift of the value-type field padding inside the extended flags
pub const VALUE_TYPE_FIELD_PADDING_SHIFT: u16 = 5;
/// Bitmask of the log2 nullable value offset inside the extended flags
pub const NULLABLE_VALUE_OFFSET_MASK: u16 = 0x0700;
/// Shift of the log2 nullable value offset inside the extended flags
pub const NULLABLE_VALUE_OFFSET_SHIFT: u16 = 8;

/// Component size of `System.String` (one UTF-16 code unit)
pub const STRING_COMPONENT_SIZE: u16 = 2;

/// Unmanaged calling convention bit in a function-pointer descriptor's base size
pub const FUNCTION_POINTER_UNMANAGED: u32 = 0x8000_0000;
/// Mask of all flag bits in a function-pointer descriptor's base size
pub const FUNCTION_POINTER_FLAGS_MASK: u32 = FUNCTION_POINTER_UNMANAGED;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Attribute bits in the upper half of the flags word
    pub struct TypeFlags: u32 {
        /// Type needs a dispatch map for interface resolution
        const HAS_DISPATCH_MAP = 0x0004_0000;
        /// Descriptor was built at runtime by a type loader
        const IS_DYNAMIC_TYPE = 0x0008_0000;
        /// Type has a finalizer
        const HAS_FINALIZER = 0x0010_0000;
        /// Type has virtual slots stored out of line in a sealed vtable
        const HAS_SEALED_VTABLE_ENTRIES = 0x0040_0000;
        /// Generic type with at least one co- or contra-variant parameter
        const GENERIC_VARIANCE = 0x0080_0000;
        /// Instances contain GC references
        const HAS_POINTERS = 0x0100_0000;
        /// Type is an instantiated generic
        const IS_GENERIC = 0x0200_0000;
        /// Low half holds a component size instead of extended flags
        const HAS_COMPONENT_SIZE = 0x8000_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    /// Attribute bits in the low half of the flags word (only without a component size)
    pub struct ExtendedFlags: u16 {
        /// Finalizer runs eagerly
        const HAS_EAGER_FINALIZER = 0x0001;
        /// Finalizer is critical
        const HAS_CRITICAL_FINALIZER = 0x0002;
        /// Type is a tracked reference with a finalizer
        const IS_TRACKED_REFERENCE_WITH_FINALIZER = 0x0004;
        /// Type implements `IDynamicInterfaceCastable`
        const IDYNAMIC_INTERFACE_CASTABLE = 0x0008;
        /// Value type that may only live on the stack
        const IS_BYREF_LIKE = 0x0010;
        /// Instances need 8-byte alignment on 32-bit targets
        const REQUIRES_ALIGN8 = 0x1000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Pointer-sized word stored by runtime-built descriptors, gating the static-storage fields
    pub struct DynamicTypeFlags: u64 {
        /// Class constructor runs lazily on first access
        const HAS_LAZY_CCTOR = 0x1;
        /// A GC statics pointer follows the flags word
        const HAS_GC_STATICS = 0x2;
        /// A non-GC statics pointer follows
        const HAS_NON_GC_STATICS = 0x4;
        /// A thread statics index follows
        const HAS_THREAD_STATICS = 0x8;
    }
}

/// The four descriptor kinds, each with its own reading of the base size and related type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, Display)]
#[repr(u32)]
pub enum TypeKind {
    /// Concrete, non-parameterized type; related type is the base type
    Canonical = 0,
    /// Function pointer; related type is the return type
    FunctionPointer = 1,
    /// Pointer, byref or array; related type is the element type
    Parameterized = 2,
    /// Open generic definition; base size holds the parameter count
    GenericTypeDefinition = 3,
}

impl TypeKind {
    /// Kind bits as they appear in the flags word
    #[must_use]
    pub fn to_flags(self) -> u32 {
        (self as u32) << TYPE_KIND_SHIFT
    }
}

/// Element type tag, used to recognise primitives, value types and parameterized subtypes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromRepr,
    EnumIter,
    EnumCount,
    Display,
)]
#[repr(u8)]
pub enum ElementType {
    /// Not yet classified
    Unknown = 0x00,
    /// `void`
    Void = 0x01,
    /// `bool`
    Boolean = 0x02,
    /// `char`
    Char = 0x03,
    /// `sbyte`
    SByte = 0x04,
    /// `byte`
    Byte = 0x05,
    /// `short`
    Int16 = 0x06,
    /// `ushort`
    UInt16 = 0x07,
    /// `int`
    Int32 = 0x08,
    /// `uint`
    UInt32 = 0x09,
    /// `long`
    Int64 = 0x0A,
    /// `ulong`
    UInt64 = 0x0B,
    /// `nint`
    IntPtr = 0x0C,
    /// `nuint`
    UIntPtr = 0x0D,
    /// `float`
    Single = 0x0E,
    /// `double`
    Double = 0x0F,
    /// Any other value type
    ValueType = 0x10,
    /// `Nullable<T>`
    Nullable = 0x12,
    /// Reference type
    Class = 0x14,
    /// Interface
    Interface = 0x15,
    /// `System.Array`
    SystemArray = 0x16,
    /// Multi-dimensional array
    Array = 0x17,
    /// Single-dimension, zero-lower-bound array
    SzArray = 0x18,
    /// Managed reference
    ByRef = 0x19,
    /// Unmanaged pointer
    Pointer = 0x1A,
    /// Function pointer
    FunctionPointer = 0x1B,
}

impl ElementType {
    /// Element type bits as they appear in the flags word
    #[must_use]
    pub fn to_flags(self) -> u32 {
        (self as u32) << ELEMENT_TYPE_SHIFT
    }
}

/// Packs a value-type field padding count into extended flag bits.
#[must_use]
pub fn pack_value_type_field_padding(padding: u8) -> u16 {
    (u16::from(padding) << VALUE_TYPE_FIELD_PADDING_SHIFT) & VALUE_TYPE_FIELD_PADDING_MASK
}

/// Packs a nullable value offset (a power of two, 1..=128) into extended flag bits.
#[must_use]
pub fn pack_nullable_value_offset(offset: u8) -> u16 {
    debug_assert!(offset.is_power_of_two(), "nullable value offset must be a power of two");
    let log2 = offset.max(1).trailing_zeros() as u16;
    (log2 << NULLABLE_VALUE_OFFSET_SHIFT) & NULLABLE_VALUE_OFFSET_MASK
}

/// Decoder over the raw flags word of a descriptor.
///
/// Every accessor is a pure function of the word. Accessors that only make sense for one
/// interpretation of the low half, or for one family of element types, assert that
/// precondition in debug builds.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorFlags(pub u32);

impl DescriptorFlags {
    /// Wraps a raw flags word
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        DescriptorFlags(raw)
    }

    /// The raw flags word
    #[must_use]
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Attribute bits of the upper half
    #[must_use]
    pub fn attributes(&self) -> TypeFlags {
        TypeFlags::from_bits_truncate(self.0)
    }

    /// Returns true if the low half holds a component size
    #[must_use]
    pub fn has_component_size(&self) -> bool {
        self.0 & TypeFlags::HAS_COMPONENT_SIZE.bits() != 0
    }

    /// Per-element size of strings and arrays, zero for every other type
    #[must_use]
    pub fn component_size(&self) -> u16 {
        if self.has_component_size() {
            (self.0 & LOW_HALF_MASK) as u16
        } else {
            0
        }
    }

    /// Raw extended-flags half, zero when the low half holds a component size
    #[must_use]
    pub fn extended_flags_raw(&self) -> u16 {
        if self.has_component_size() {
            0
        } else {
            (self.0 & LOW_HALF_MASK) as u16
        }
    }

    /// Attribute bits of the extended-flags half
    #[must_use]
    pub fn extended_flags(&self) -> ExtendedFlags {
        ExtendedFlags::from_bits_truncate(self.extended_flags_raw())
    }

    /// The descriptor kind
    #[must_use]
    pub fn kind(&self) -> TypeKind {
        match (self.0 & TYPE_KIND_MASK) >> TYPE_KIND_SHIFT {
            0 => TypeKind::Canonical,
            1 => TypeKind::FunctionPointer,
            2 => TypeKind::Parameterized,
            _ => TypeKind::GenericTypeDefinition,
        }
    }

    /// Raw five-bit element type value
    #[must_use]
    pub fn element_type_raw(&self) -> u8 {
        ((self.0 & ELEMENT_TYPE_MASK) >> ELEMENT_TYPE_SHIFT) as u8
    }

    /// The element type tag; undefined tag values decode as [`ElementType::Unknown`]
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        let raw = self.element_type_raw();
        let decoded = ElementType::from_repr(raw);
        debug_assert!(decoded.is_some(), "undefined element type {raw:#x}");
        decoded.unwrap_or(ElementType::Unknown)
    }

    /// Concrete, non-generic-definition kind
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.kind() == TypeKind::Canonical
    }

    /// Pointer, byref or array kind
    #[must_use]
    pub fn is_parameterized(&self) -> bool {
        self.kind() == TypeKind::Parameterized
    }

    /// Open generic definition kind
    #[must_use]
    pub fn is_generic_type_definition(&self) -> bool {
        self.kind() == TypeKind::GenericTypeDefinition
    }

    /// Function pointer kind
    #[must_use]
    pub fn is_function_pointer(&self) -> bool {
        self.kind() == TypeKind::FunctionPointer
    }

    /// Canonical type or generic definition
    #[must_use]
    pub fn is_def_type(&self) -> bool {
        matches!(
            self.kind(),
            TypeKind::Canonical | TypeKind::GenericTypeDefinition
        )
    }

    /// Instantiated generic type
    #[must_use]
    pub fn is_generic(&self) -> bool {
        self.attributes().contains(TypeFlags::IS_GENERIC)
    }

    /// Built at runtime by a type loader
    #[must_use]
    pub fn is_dynamic_type(&self) -> bool {
        self.attributes().contains(TypeFlags::IS_DYNAMIC_TYPE)
    }

    /// Has a finalizer
    #[must_use]
    pub fn is_finalizable(&self) -> bool {
        self.attributes().contains(TypeFlags::HAS_FINALIZER)
    }

    /// Instances contain GC references
    #[must_use]
    pub fn contains_gc_pointers(&self) -> bool {
        self.attributes().contains(TypeFlags::HAS_POINTERS)
    }

    /// A dispatch map reference is present
    #[must_use]
    pub fn has_dispatch_map(&self) -> bool {
        self.attributes().contains(TypeFlags::HAS_DISPATCH_MAP)
    }

    /// A sealed vtable reference is present
    #[must_use]
    pub fn has_sealed_vtable_entries(&self) -> bool {
        self.attributes()
            .contains(TypeFlags::HAS_SEALED_VTABLE_ENTRIES)
    }

    /// Generic with co- or contra-variant parameters
    #[must_use]
    pub fn has_generic_variance(&self) -> bool {
        self.attributes().contains(TypeFlags::GENERIC_VARIANCE)
    }

    /// Value type, including primitives, enums and `Nullable<T>`
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.element_type() < ElementType::Class
    }

    /// Primitive or enum
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        self.element_type() < ElementType::ValueType
    }

    /// `Nullable<T>`
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.element_type() == ElementType::Nullable
    }

    /// Interface type
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.element_type() == ElementType::Interface
    }

    /// Any array, single- or multi-dimensional
    #[must_use]
    pub fn is_array(&self) -> bool {
        matches!(
            self.element_type(),
            ElementType::Array | ElementType::SzArray
        )
    }

    /// Unmanaged pointer type
    #[must_use]
    pub fn is_pointer(&self) -> bool {
        self.element_type() == ElementType::Pointer
    }

    /// Managed reference type
    #[must_use]
    pub fn is_byref(&self) -> bool {
        self.element_type() == ElementType::ByRef
    }

    /// `System.String`, the only canonical type with a component size
    #[must_use]
    pub fn is_string(&self) -> bool {
        self.component_size() == STRING_COMPONENT_SIZE && self.is_canonical()
    }

    /// Stack-only value type
    #[must_use]
    pub fn is_byref_like(&self) -> bool {
        self.is_value_type() && self.extended_flags().contains(ExtendedFlags::IS_BYREF_LIKE)
    }

    /// Instances need 8-byte alignment; meaningless for strings and arrays
    #[must_use]
    pub fn requires_align8(&self) -> bool {
        debug_assert!(
            !self.has_component_size(),
            "requires_align8 queried for array or string"
        );
        self.extended_flags()
            .contains(ExtendedFlags::REQUIRES_ALIGN8)
    }

    /// Tracked reference with a finalizer
    #[must_use]
    pub fn is_tracked_reference_with_finalizer(&self) -> bool {
        self.extended_flags()
            .contains(ExtendedFlags::IS_TRACKED_REFERENCE_WITH_FINALIZER)
    }

    /// Implements `IDynamicInterfaceCastable`
    #[must_use]
    pub fn is_idynamic_interface_castable(&self) -> bool {
        self.extended_flags()
            .contains(ExtendedFlags::IDYNAMIC_INTERFACE_CASTABLE)
    }

    /// Finalizer runs eagerly
    #[must_use]
    pub fn has_eager_finalizer(&self) -> bool {
        self.extended_flags()
            .contains(ExtendedFlags::HAS_EAGER_FINALIZER)
    }

    /// Finalizer is critical
    #[must_use]
    pub fn has_critical_finalizer(&self) -> bool {
        self.extended_flags()
            .contains(ExtendedFlags::HAS_CRITICAL_FINALIZER)
    }

    /// Padding added after the fields of a boxed value type
    #[must_use]
    pub fn value_type_field_padding(&self) -> u32 {
        debug_assert!(self.is_value_type(), "field padding queried for reference type");
        u32::from(
            (self.extended_flags_raw() & VALUE_TYPE_FIELD_PADDING_MASK)
                >> VALUE_TYPE_FIELD_PADDING_SHIFT,
        )
    }

    /// Offset of the value inside a `Nullable<T>`
    #[must_use]
    pub fn nullable_value_offset(&self) -> u8 {
        debug_assert!(self.is_nullable(), "nullable offset queried for non-nullable");
        let log2 =
            (self.extended_flags_raw() & NULLABLE_VALUE_OFFSET_MASK) >> NULLABLE_VALUE_OFFSET_SHIFT;
        1u8 << log2
    }
}

impl std::fmt::Debug for DescriptorFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("DescriptorFlags");
        debug
            .field("raw", &format_args!("0x{:08x}", self.0))
            .field("kind", &self.kind())
            .field("element_type", &ElementType::from_repr(self.element_type_raw()))
            .field("attributes", &self.attributes());
        if self.has_component_size() {
            debug.field("component_size", &self.component_size());
        } else {
            debug.field("extended", &format_args!("0x{:04x}", self.extended_flags_raw()));
        }
        debug.finish()
    }
}
