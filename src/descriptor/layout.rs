//! Fixed prefix and the variable-position field calculator.
//!
//! A descriptor is a fixed prefix, a vtable, an interface map and then a run of optional
//! fields in one total order ([`DescriptorField`]). Whether a field is present depends on
//! flag bits in the prefix, on the function-pointer parameter count, and for the last three
//! fields on the dynamic-flags word stored earlier in the same record. The offset of any
//! field is therefore found by walking the order from the top and adding the width of every
//! present field before it.
//!
//! The walk is re-run for every query. It is a handful of flag tests and additions, and
//! presence differs per descriptor, so there is nothing worth caching.
//!
//! # Examples
//!
//! ```rust
//! use methodtable::config::Target;
//! use methodtable::descriptor::{
//!     field_offset, DescriptorField, DescriptorFlags, DynamicTypeFlags, ElementType,
//!     FixedPrefix, TypeFlags,
//! };
//! use methodtable::memory::Address;
//!
//! let prefix = FixedPrefix {
//!     flags: DescriptorFlags::new(
//!         ElementType::Class.to_flags() | TypeFlags::HAS_FINALIZER.bits(),
//!     ),
//!     raw_base_size: 24,
//!     related_type: Address::NULL,
//!     num_vtable_slots: 3,
//!     num_interfaces: 1,
//!     hash_code: 0,
//! };
//!
//! // 24-byte prefix, 3 vtable slots, 1 interface, then two 4-byte relative slots
//! let none = DynamicTypeFlags::empty();
//! let offset = field_offset(&prefix, &Target::X64, &none, DescriptorField::Finalizer);
//! assert_eq!(offset, 24 + 3 * 8 + 8 + 4 + 4);
//! ```

use std::ops::ControlFlow;

use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    config::Target,
    descriptor::{
        flags::{DescriptorFlags, DynamicTypeFlags},
        shape::TypeShape,
    },
    memory::{
        io::{read_le_at, read_ptr_at, write_le_at, write_ptr_at},
        Address, PointerMode,
    },
    Result,
};

/// The optional fields after the interface map, in storage order.
///
/// The declaration order of the variants IS the storage order; `PartialOrd`/`Ord` follow it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, EnumCount, Display,
)]
pub enum DescriptorField {
    /// Indirection cell holding the owning type manager (always present)
    TypeManagerIndirection,
    /// Writable memory owned by the class library (always present)
    WritableData,
    /// Interface dispatch map (present with `HAS_DISPATCH_MAP`)
    DispatchMap,
    /// Finalizer entry point (present with `HAS_FINALIZER`)
    Finalizer,
    /// Out-of-line sealed virtual slots (present with `HAS_SEALED_VTABLE_ENTRIES`)
    SealedVirtualSlots,
    /// Open generic definition (present for instantiated generics)
    GenericDefinition,
    /// Argument list, or variance array for a variant definition
    GenericComposition,
    /// Inline parameter list of a function pointer
    FunctionPointerParameters,
    /// Template a runtime-built descriptor was cloned from (dynamic only)
    DynamicTemplateType,
    /// Dynamic-flags word (dynamic only)
    DynamicTypeFlags,
    /// GC statics storage (dynamic, `HAS_GC_STATICS`)
    DynamicGcStatics,
    /// Non-GC statics storage (dynamic, `HAS_NON_GC_STATICS`)
    DynamicNonGcStatics,
    /// Thread statics index (dynamic, `HAS_THREAD_STATICS`)
    DynamicThreadStaticsIndex,
}

impl DescriptorField {
    /// Fields that only runtime-built descriptors carry; they are always full pointer width.
    #[must_use]
    pub fn is_dynamic_only(&self) -> bool {
        *self >= DescriptorField::DynamicTemplateType
    }

    /// Fields whose presence is read from the dynamic-flags word.
    #[must_use]
    pub fn is_dynamic_flags_gated(&self) -> bool {
        self.dynamic_gate().is_some()
    }

    /// The dynamic-flags bit that announces this field
    #[must_use]
    pub fn dynamic_gate(&self) -> Option<DynamicTypeFlags> {
        match self {
            DescriptorField::DynamicGcStatics => Some(DynamicTypeFlags::HAS_GC_STATICS),
            DescriptorField::DynamicNonGcStatics => Some(DynamicTypeFlags::HAS_NON_GC_STATICS),
            DescriptorField::DynamicThreadStaticsIndex => {
                Some(DynamicTypeFlags::HAS_THREAD_STATICS)
            }
            _ => None,
        }
    }
}

/// The fixed prefix shared by every descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPrefix {
    /// Packed flags word
    pub flags: DescriptorFlags,
    /// Kind-dependent base-size word, see [`TypeShape`]
    pub raw_base_size: u32,
    /// Base type (canonical) or element/return type (parameterized, function pointer)
    pub related_type: Address,
    /// Number of pointer-sized vtable slots after the prefix
    pub num_vtable_slots: u16,
    /// Number of interface-map entries after the vtable
    pub num_interfaces: u16,
    /// Type hash code
    pub hash_code: u32,
}

impl FixedPrefix {
    /// Decodes the prefix from the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than the prefix.
    pub fn read(data: &[u8], target: &Target) -> Result<Self> {
        let mut offset = 0;
        let flags = DescriptorFlags::new(read_le_at::<u32>(data, &mut offset)?);
        let raw_base_size = read_le_at::<u32>(data, &mut offset)?;
        let related_type = Address(read_ptr_at(data, &mut offset, target.pointer_size)?);
        let num_vtable_slots = read_le_at::<u16>(data, &mut offset)?;
        let num_interfaces = read_le_at::<u16>(data, &mut offset)?;
        let hash_code = read_le_at::<u32>(data, &mut offset)?;

        Ok(FixedPrefix {
            flags,
            raw_base_size,
            related_type,
            num_vtable_slots,
            num_interfaces,
            hash_code,
        })
    }

    /// Encodes the prefix at the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than the prefix.
    pub fn write(&self, data: &mut [u8], target: &Target) -> Result<()> {
        let mut offset = 0;
        write_le_at(data, &mut offset, self.flags.raw())?;
        write_le_at(data, &mut offset, self.raw_base_size)?;
        write_ptr_at(data, &mut offset, target.pointer_size, self.related_type.0)?;
        write_le_at(data, &mut offset, self.num_vtable_slots)?;
        write_le_at(data, &mut offset, self.num_interfaces)?;
        write_le_at(data, &mut offset, self.hash_code)?;
        Ok(())
    }

    /// The kind-tagged reading of the base-size word
    #[must_use]
    pub fn shape(&self) -> TypeShape {
        TypeShape::decode(self.flags.kind(), self.raw_base_size)
    }

    /// Storage mode of every reference-typed optional field
    #[must_use]
    pub fn pointer_mode(&self, target: &Target) -> PointerMode {
        PointerMode::for_descriptor(target, self.flags.is_dynamic_type())
    }

    /// Offset of the first vtable slot
    #[must_use]
    pub fn vtable_offset(&self, target: &Target) -> u32 {
        target.fixed_prefix_size()
    }

    /// Offset of the first interface-map entry
    #[must_use]
    pub fn interface_map_offset(&self, target: &Target) -> u32 {
        self.vtable_offset(target) + u32::from(self.num_vtable_slots) * target.pointer_size
    }

    /// Offset of the first optional field
    #[must_use]
    pub fn optional_fields_offset(&self, target: &Target) -> u32 {
        self.interface_map_offset(target) + u32::from(self.num_interfaces) * target.pointer_size
    }

    /// Presence predicate of `field`, given the dynamic flags decoded so far.
    #[must_use]
    pub fn is_field_present(&self, field: DescriptorField, dynamic: DynamicTypeFlags) -> bool {
        let flags = &self.flags;
        match field {
            DescriptorField::TypeManagerIndirection | DescriptorField::WritableData => true,
            DescriptorField::DispatchMap => flags.has_dispatch_map(),
            DescriptorField::Finalizer => flags.is_finalizable(),
            DescriptorField::SealedVirtualSlots => flags.has_sealed_vtable_entries(),
            DescriptorField::GenericDefinition => flags.is_generic(),
            DescriptorField::GenericComposition => {
                flags.is_generic()
                    || (flags.is_generic_type_definition() && flags.has_generic_variance())
            }
            DescriptorField::FunctionPointerParameters => flags.is_function_pointer(),
            DescriptorField::DynamicTemplateType | DescriptorField::DynamicTypeFlags => {
                flags.is_dynamic_type()
            }
            DescriptorField::DynamicGcStatics
            | DescriptorField::DynamicNonGcStatics
            | DescriptorField::DynamicThreadStaticsIndex => {
                flags.is_dynamic_type()
                    && field
                        .dynamic_gate()
                        .is_some_and(|gate| dynamic.contains(gate))
            }
        }
    }

    /// Bytes occupied by `field` when it is present.
    #[must_use]
    pub fn field_size(&self, field: DescriptorField, target: &Target) -> u32 {
        let reference = self.pointer_mode(target).width(target);
        match field {
            DescriptorField::FunctionPointerParameters => {
                self.shape()
                    .function_pointer_parameter_count()
                    .saturating_mul(reference)
            }
            field if field.is_dynamic_only() => target.pointer_size,
            _ => reference,
        }
    }
}

/// Supplies the dynamic-flags word while a walk passes over it.
pub trait DynamicFlagsSource {
    /// The dynamic-flags word stored at `offset` of the record being walked
    fn dynamic_flags_at(&self, offset: u32) -> DynamicTypeFlags;
}

/// A known value, used before the record exists (sizing) or after it was checked (validation).
impl DynamicFlagsSource for DynamicTypeFlags {
    fn dynamic_flags_at(&self, _offset: u32) -> DynamicTypeFlags {
        *self
    }
}

/// Reads the word from the record's own bytes.
pub struct RecordBytes<'a> {
    data: &'a [u8],
    pointer_size: u32,
}

impl<'a> RecordBytes<'a> {
    /// Wraps the bytes of a record that starts at `data[0]`
    #[must_use]
    pub fn new(data: &'a [u8], target: &Target) -> Self {
        RecordBytes {
            data,
            pointer_size: target.pointer_size,
        }
    }
}

impl DynamicFlagsSource for RecordBytes<'_> {
    fn dynamic_flags_at(&self, offset: u32) -> DynamicTypeFlags {
        let mut cursor = offset as usize;
        match read_ptr_at(self.data, &mut cursor, self.pointer_size) {
            Ok(raw) => DynamicTypeFlags::from_bits_truncate(raw),
            Err(_) => {
                debug_assert!(false, "dynamic flags word at {offset} outside record");
                DynamicTypeFlags::empty()
            }
        }
    }
}

/// One optional field as seen by the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlot {
    /// Which field
    pub field: DescriptorField,
    /// Offset the field has (or would have) in the record
    pub offset: u32,
    /// Bytes occupied; zero when absent
    pub size: u32,
    /// Presence predicate
    pub present: bool,
}

/// Walks the optional fields in order, handing each slot to `visit`.
///
/// Returns `Break` with the visitor's value if it stopped early, otherwise `Continue` with the
/// total record size.
pub fn walk_fields<S, B, F>(
    prefix: &FixedPrefix,
    target: &Target,
    source: &S,
    mut visit: F,
) -> ControlFlow<B, u32>
where
    S: DynamicFlagsSource + ?Sized,
    F: FnMut(&FieldSlot) -> ControlFlow<B>,
{
    let mut offset = prefix.optional_fields_offset(target);
    let mut dynamic = DynamicTypeFlags::empty();

    for field in DescriptorField::iter() {
        let present = prefix.is_field_present(field, dynamic);
        let size = if present {
            prefix.field_size(field, target)
        } else {
            0
        };
        let slot = FieldSlot {
            field,
            offset,
            size,
            present,
        };

        visit(&slot)?;

        if present && field == DescriptorField::DynamicTypeFlags {
            dynamic = source.dynamic_flags_at(offset);
        }
        offset = offset.saturating_add(size);
    }

    ControlFlow::Continue(offset)
}

/// Byte offset of `field` from the start of the record.
///
/// Requesting an absent field is a contract violation: it asserts in debug builds and returns
/// the position the field would occupy otherwise.
#[must_use]
pub fn field_offset<S: DynamicFlagsSource + ?Sized>(
    prefix: &FixedPrefix,
    target: &Target,
    source: &S,
    field: DescriptorField,
) -> u32 {
    let found = walk_fields(prefix, target, source, |slot| {
        if slot.field == field {
            debug_assert!(
                slot.present,
                "field {field} is not present in this descriptor"
            );
            ControlFlow::Break(slot.offset)
        } else {
            ControlFlow::Continue(())
        }
    });

    match found {
        ControlFlow::Break(offset) | ControlFlow::Continue(offset) => offset,
    }
}

/// Total size of the record described by `prefix`.
#[must_use]
pub fn descriptor_size<S: DynamicFlagsSource + ?Sized>(
    prefix: &FixedPrefix,
    target: &Target,
    source: &S,
) -> u32 {
    match walk_fields::<_, (), _>(prefix, target, source, |_| ControlFlow::Continue(())) {
        ControlFlow::Break(()) => 0,
        ControlFlow::Continue(size) => size,
    }
}

/// Reads the dynamic-flags word of a record without trusting its length.
///
/// Returns the empty set for descriptors built ahead of time.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the flags word lies outside `data`.
pub fn stored_dynamic_flags(
    prefix: &FixedPrefix,
    data: &[u8],
    target: &Target,
) -> Result<DynamicTypeFlags> {
    if !prefix.flags.is_dynamic_type() {
        return Ok(DynamicTypeFlags::empty());
    }

    let mut offset = field_offset(
        prefix,
        target,
        &DynamicTypeFlags::empty(),
        DescriptorField::DynamicTypeFlags,
    ) as usize;
    let raw = read_ptr_at(data, &mut offset, target.pointer_size)?;
    Ok(DynamicTypeFlags::from_bits_truncate(raw))
}

/// Every present optional field with its offset and size, in storage order.
#[must_use]
pub fn present_fields<S: DynamicFlagsSource + ?Sized>(
    prefix: &FixedPrefix,
    target: &Target,
    source: &S,
) -> Vec<FieldSlot> {
    let mut slots = Vec::with_capacity(DescriptorField::COUNT);
    let _ = walk_fields::<_, (), _>(prefix, target, source, |slot| {
        if slot.present {
            slots.push(*slot);
        }
        ControlFlow::Continue(())
    });
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::flags::{ElementType, TypeFlags, TypeKind};

    fn prefix(flags: u32, raw_base_size: u32, vtable: u16, interfaces: u16) -> FixedPrefix {
        FixedPrefix {
            flags: DescriptorFlags::new(flags),
            raw_base_size,
            related_type: Address::NULL,
            num_vtable_slots: vtable,
            num_interfaces: interfaces,
            hash_code: 0,
        }
    }

    const NONE: DynamicTypeFlags = DynamicTypeFlags::empty();

    #[test]
    fn always_present_fields() {
        let p = prefix(ElementType::Class.to_flags(), 24, 2, 1);
        let base = 24 + 2 * 8 + 8;
        assert_eq!(
            field_offset(&p, &Target::X64, &NONE, DescriptorField::TypeManagerIndirection),
            base
        );
        assert_eq!(
            field_offset(&p, &Target::X64, &NONE, DescriptorField::WritableData),
            base + 4
        );
        assert_eq!(descriptor_size(&p, &Target::X64, &NONE), base + 8);

        // Without relative pointer support both slots are full width
        let absolute = Target::X64.with_relative_pointers(false);
        assert_eq!(descriptor_size(&p, &absolute, &NONE), base + 16);
    }

    #[test]
    fn every_optional_field_in_order() {
        let flags = (TypeFlags::HAS_DISPATCH_MAP
            | TypeFlags::HAS_FINALIZER
            | TypeFlags::HAS_SEALED_VTABLE_ENTRIES
            | TypeFlags::IS_GENERIC)
            .bits()
            | ElementType::Class.to_flags();
        let p = prefix(flags, 32, 0, 0);
        let fields = present_fields(&p, &Target::X64, &NONE);
        let names: Vec<_> = fields.iter().map(|slot| slot.field).collect();
        assert_eq!(
            names,
            vec![
                DescriptorField::TypeManagerIndirection,
                DescriptorField::WritableData,
                DescriptorField::DispatchMap,
                DescriptorField::Finalizer,
                DescriptorField::SealedVirtualSlots,
                DescriptorField::GenericDefinition,
                DescriptorField::GenericComposition,
            ]
        );
        for (index, slot) in fields.iter().enumerate() {
            assert_eq!(slot.offset, 24 + 4 * index as u32);
            assert_eq!(slot.size, 4);
        }
    }

    #[test]
    fn absent_fields_do_not_advance() {
        let finalizable =
            prefix(ElementType::Class.to_flags() | TypeFlags::HAS_FINALIZER.bits(), 24, 0, 0);
        let with_map = prefix(
            ElementType::Class.to_flags()
                | (TypeFlags::HAS_FINALIZER | TypeFlags::HAS_DISPATCH_MAP).bits(),
            24,
            0,
            0,
        );
        let a = field_offset(&finalizable, &Target::X64, &NONE, DescriptorField::Finalizer);
        let b = field_offset(&with_map, &Target::X64, &NONE, DescriptorField::Finalizer);
        assert_eq!(b, a + 4);
    }

    #[test]
    fn variant_generic_definition_has_composition_only() {
        let p = prefix(
            TypeKind::GenericTypeDefinition.to_flags()
                | ElementType::Interface.to_flags()
                | TypeFlags::GENERIC_VARIANCE.bits(),
            2,
            0,
            0,
        );
        assert!(!p.is_field_present(DescriptorField::GenericDefinition, NONE));
        assert!(p.is_field_present(DescriptorField::GenericComposition, NONE));
        assert_eq!(
            field_offset(&p, &Target::X64, &NONE, DescriptorField::GenericComposition),
            24 + 8
        );

        let invariant = prefix(
            TypeKind::GenericTypeDefinition.to_flags() | ElementType::Interface.to_flags(),
            2,
            0,
            0,
        );
        assert!(!invariant.is_field_present(DescriptorField::GenericComposition, NONE));
    }

    #[test]
    fn function_pointer_parameters_scale_with_count() {
        let shape = TypeShape::FunctionPointer {
            parameter_count: 3,
            is_unmanaged: false,
        };
        let p = prefix(
            TypeKind::FunctionPointer.to_flags() | ElementType::FunctionPointer.to_flags(),
            shape.encode(),
            0,
            0,
        );
        let start = field_offset(
            &p,
            &Target::X64,
            &NONE,
            DescriptorField::FunctionPointerParameters,
        );
        assert_eq!(start, 24 + 8);
        assert_eq!(descriptor_size(&p, &Target::X64, &NONE), start + 3 * 4);
        assert_eq!(descriptor_size(&p, &Target::X86, &NONE), 20 + 8 + 3 * 4);
    }

    #[test]
    fn dynamic_fields_are_gated_by_the_stored_word() {
        let p = prefix(
            ElementType::Class.to_flags() | TypeFlags::IS_DYNAMIC_TYPE.bits(),
            24,
            1,
            0,
        );
        // Dynamic descriptors store full pointers everywhere
        let template = field_offset(&p, &Target::X64, &NONE, DescriptorField::DynamicTemplateType);
        assert_eq!(template, 24 + 8 + 8 + 8);
        let flags_at = field_offset(&p, &Target::X64, &NONE, DescriptorField::DynamicTypeFlags);
        assert_eq!(flags_at, template + 8);

        let statics = DynamicTypeFlags::HAS_GC_STATICS | DynamicTypeFlags::HAS_THREAD_STATICS;
        assert_eq!(
            field_offset(&p, &Target::X64, &statics, DescriptorField::DynamicGcStatics),
            flags_at + 8
        );
        assert_eq!(
            field_offset(&p, &Target::X64, &statics, DescriptorField::DynamicThreadStaticsIndex),
            flags_at + 16
        );
        assert_eq!(descriptor_size(&p, &Target::X64, &statics), flags_at + 24);
        assert_eq!(descriptor_size(&p, &Target::X64, &NONE), flags_at + 8);
    }

    #[test]
    fn record_bytes_source_reads_the_word() {
        let p = prefix(
            ElementType::Class.to_flags() | TypeFlags::IS_DYNAMIC_TYPE.bits(),
            24,
            0,
            0,
        );
        let flags_at = field_offset(&p, &Target::X64, &NONE, DescriptorField::DynamicTypeFlags);
        let mut data = vec![0u8; 128];
        data[flags_at as usize] = DynamicTypeFlags::HAS_NON_GC_STATICS.bits() as u8;

        let source = RecordBytes::new(&data, &Target::X64);
        assert_eq!(
            field_offset(&p, &Target::X64, &source, DescriptorField::DynamicNonGcStatics),
            flags_at + 8
        );
        assert_eq!(
            stored_dynamic_flags(&p, &data, &Target::X64).unwrap(),
            DynamicTypeFlags::HAS_NON_GC_STATICS
        );
        assert!(stored_dynamic_flags(&p, &data[..flags_at as usize], &Target::X64).is_err());
    }

    #[test]
    fn offsets_are_monotonic() {
        let flags = (TypeFlags::HAS_DISPATCH_MAP
            | TypeFlags::HAS_FINALIZER
            | TypeFlags::IS_GENERIC
            | TypeFlags::IS_DYNAMIC_TYPE)
            .bits()
            | ElementType::Class.to_flags();
        let p = prefix(flags, 24, 5, 2);
        let all = DynamicTypeFlags::all();
        let mut last = 0;
        let _ = walk_fields::<_, (), _>(&p, &Target::X64, &all, |slot| {
            assert!(slot.offset >= last);
            last = slot.offset;
            ControlFlow::Continue(())
        });
        assert!(descriptor_size(&p, &Target::X64, &all) >= last);
    }

    #[test]
    fn prefix_round_trip_x86() {
        let p = FixedPrefix {
            flags: DescriptorFlags::new(0x8000_0002),
            raw_base_size: 12,
            related_type: Address(0x1234),
            num_vtable_slots: 7,
            num_interfaces: 2,
            hash_code: 0xCAFE_BABE,
        };
        let mut data = vec![0u8; Target::X86.fixed_prefix_size() as usize];
        p.write(&mut data, &Target::X86).unwrap();
        assert_eq!(FixedPrefix::read(&data, &Target::X86).unwrap(), p);
        assert!(FixedPrefix::read(&data[..10], &Target::X86).is_err());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "is not present in this descriptor")]
    fn absent_field_is_contract_violation() {
        let p = prefix(ElementType::Class.to_flags(), 24, 0, 0);
        let _ = field_offset(&p, &Target::X64, &NONE, DescriptorField::DispatchMap);
    }

    #[test]
    fn only_trailing_statics_are_gated() {
        for field in DescriptorField::iter() {
            assert_eq!(
                field.is_dynamic_flags_gated(),
                field > DescriptorField::DynamicTypeFlags,
                "{field}"
            );
        }
        assert_eq!(
            DescriptorField::DynamicNonGcStatics.dynamic_gate(),
            Some(DynamicTypeFlags::HAS_NON_GC_STATICS)
        );
        assert_eq!(DescriptorField::DynamicTemplateType.dynamic_gate(), None);
    }
}
