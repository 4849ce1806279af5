//! Read-only handle to a published descriptor.
//!
//! [`MethodTable`] is what consumers hold: a reference into a published segment plus the
//! decoded fixed prefix. Every accessor decodes what it needs from the prefix, asks the layout
//! walk for the position of any variable field and follows the stored reference through the
//! pointer layer. The handle has no write operations; descriptors are only written through
//! [`crate::descriptor::MethodTableBuilder`] before publication.
//!
//! # Contract
//!
//! Accessors do not return errors. Querying a field the descriptor does not have, or an
//! interpretation its kind does not support (the base size of a generic definition, the rank
//! of a non-array), is a caller bug: it fires a debug assertion and yields a defined but
//! meaningless value in release builds. Callers check presence (`flags().has_dispatch_map()`,
//! `flags().is_array()`, ...) first. Use [`crate::descriptor::validate_descriptor`] on records
//! of unknown origin.
//!
//! # Examples
//!
//! ```rust
//! use methodtable::prelude::*;
//!
//! let registry = TypeRegistry::new(RegistryConfig::x64());
//! let header = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class)
//!     .vtable_slots(1);
//! let mut builder = registry.begin(&header)?;
//! builder.set_vtable_slot(0, Address::new(0xdead_0000))?;
//! let table = builder.publish()?;
//!
//! assert_eq!(table.base_size(), 24);
//! assert_eq!(table.vtable_slot(0), Address::new(0xdead_0000));
//! assert!(!table.flags().is_value_type());
//! # Ok::<(), methodtable::Error>(())
//! ```

use std::sync::Arc;

use crate::{
    config::Target,
    descriptor::{
        dispatch::{DispatchKind, DispatchMap},
        flags::{DescriptorFlags, DynamicTypeFlags, ElementType, TypeKind},
        generics::GenericVariance,
        layout::{
            descriptor_size, field_offset, stored_dynamic_flags, DescriptorField, FixedPrefix,
            RecordBytes,
        },
        shape::{ParameterizedShape, TypeShape},
    },
    memory::{io::read_ptr_at, Address, AddressSpace, DescriptorList, Pointer, PointerMode, Segment},
    Error, Result,
};

/// Handle to one published descriptor.
///
/// Cheap to clone. Two handles compare equal when they refer to the same address.
#[derive(Clone)]
pub struct MethodTable<'a> {
    space: &'a AddressSpace,
    segment: Arc<Segment>,
    start: usize,
    address: Address,
    prefix: FixedPrefix,
}

impl<'a> MethodTable<'a> {
    /// Opens the descriptor at `address`.
    ///
    /// Checks that the prefix is readable and that the whole record, as sized by its own
    /// flags, fits inside the segment. Field contents are not checked.
    ///
    /// # Errors
    /// Returns [`Error::Unmapped`] if `address` is not published, or [`Error::OutOfBounds`]
    /// if the record is truncated.
    pub fn open(space: &'a AddressSpace, address: Address) -> Result<Self> {
        let segment = space.segment(address).ok_or(Error::Unmapped(address))?;
        let start = segment.offset_of(address).ok_or(Error::Unmapped(address))?;
        let target = space.target();

        let data = &segment.bytes()[start..];
        let prefix = FixedPrefix::read(data, &target)?;
        let dynamic = stored_dynamic_flags(&prefix, data, &target)?;
        if descriptor_size(&prefix, &target, &dynamic) as usize > data.len() {
            return Err(Error::OutOfBounds);
        }

        Ok(MethodTable {
            space,
            segment,
            start,
            address,
            prefix,
        })
    }

    fn related(&self, address: Address) -> Option<MethodTable<'a>> {
        if address.is_null() {
            return None;
        }
        match MethodTable::open(self.space, address) {
            Ok(table) => Some(table),
            Err(error) => {
                debug_assert!(
                    false,
                    "descriptor {} references unreadable {address}: {error}",
                    self.address
                );
                None
            }
        }
    }

    fn record(&self) -> &[u8] {
        &self.segment.bytes()[self.start..]
    }

    fn target(&self) -> Target {
        self.space.target()
    }

    fn read_reference(&self, offset: u32, mode: PointerMode) -> Address {
        let target = self.target();
        match Pointer::decode(self.record(), offset as usize, self.address, mode, &target) {
            Ok(pointer) => pointer.resolve(),
            Err(error) => {
                debug_assert!(false, "unreadable slot at offset {offset}: {error}");
                Address::NULL
            }
        }
    }

    fn read_word(&self, offset: u32) -> u64 {
        let mut cursor = offset as usize;
        match read_ptr_at(self.record(), &mut cursor, self.target().pointer_size) {
            Ok(value) => value,
            Err(error) => {
                debug_assert!(false, "unreadable word at offset {offset}: {error}");
                0
            }
        }
    }

    fn read_field(&self, field: DescriptorField) -> Address {
        let offset = self.offset_of(field);
        if field.is_dynamic_only() {
            Address(self.read_word(offset))
        } else {
            self.read_reference(offset, self.pointer_mode())
        }
    }

    /// The space this descriptor is published in
    #[must_use]
    pub fn space(&self) -> &'a AddressSpace {
        self.space
    }

    /// Address of the descriptor
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// The decoded fixed prefix
    #[must_use]
    pub fn prefix(&self) -> &FixedPrefix {
        &self.prefix
    }

    /// The flags word decoder
    #[must_use]
    pub fn flags(&self) -> DescriptorFlags {
        self.prefix.flags
    }

    /// Descriptor kind
    #[must_use]
    pub fn kind(&self) -> TypeKind {
        self.prefix.flags.kind()
    }

    /// Element type tag
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.prefix.flags.element_type()
    }

    /// Kind-tagged reading of the base-size word
    #[must_use]
    pub fn shape(&self) -> TypeShape {
        self.prefix.shape()
    }

    /// Storage mode of this descriptor's reference fields
    #[must_use]
    pub fn pointer_mode(&self) -> PointerMode {
        self.prefix.pointer_mode(&self.target())
    }

    /// Type hash code
    #[must_use]
    pub fn hash_code(&self) -> u32 {
        self.prefix.hash_code
    }

    /// Number of vtable slots
    #[must_use]
    pub fn num_vtable_slots(&self) -> u16 {
        self.prefix.num_vtable_slots
    }

    /// Number of implemented interfaces
    #[must_use]
    pub fn num_interfaces(&self) -> u16 {
        self.prefix.num_interfaces
    }

    /// Returns true if `field` is stored in this descriptor
    #[must_use]
    pub fn has_field(&self, field: DescriptorField) -> bool {
        self.prefix.is_field_present(field, self.dynamic_flags_word())
    }

    /// Byte offset of `field` from the descriptor address; the field must be present.
    #[must_use]
    pub fn offset_of(&self, field: DescriptorField) -> u32 {
        let source = RecordBytes::new(self.record(), &self.target());
        field_offset(&self.prefix, &self.target(), &source, field)
    }

    /// Address of `field`; the field must be present.
    #[must_use]
    pub fn field_address(&self, field: DescriptorField) -> Address {
        self.address.add(u64::from(self.offset_of(field)))
    }

    /// Total size of the record
    #[must_use]
    pub fn size(&self) -> u32 {
        let source = RecordBytes::new(self.record(), &self.target());
        descriptor_size(&self.prefix, &self.target(), &source)
    }

    fn dynamic_flags_word(&self) -> DynamicTypeFlags {
        if !self.prefix.flags.is_dynamic_type() {
            return DynamicTypeFlags::empty();
        }
        DynamicTypeFlags::from_bits_truncate(
            self.read_word(self.offset_of(DescriptorField::DynamicTypeFlags)),
        )
    }

    /// GC base size of an instance; valid for canonical types and arrays only
    #[must_use]
    pub fn base_size(&self) -> u32 {
        let flags = self.prefix.flags;
        debug_assert!(
            flags.is_canonical() || flags.is_array(),
            "base_size queried for {} descriptor",
            flags.kind()
        );
        self.prefix.raw_base_size
    }

    /// Element size of arrays and strings, zero otherwise
    #[must_use]
    pub fn component_size(&self) -> u16 {
        self.prefix.flags.component_size()
    }

    /// Rank of an array; 1 for single-dimension arrays
    #[must_use]
    pub fn array_rank(&self) -> u32 {
        match self.multi_dimensional_array_rank() {
            0 => 1,
            rank => rank,
        }
    }

    /// Rank of a multi-dimensional array; 0 for single-dimension arrays
    #[must_use]
    pub fn multi_dimensional_array_rank(&self) -> u32 {
        debug_assert!(self.prefix.flags.is_array(), "array rank queried for non-array");
        let bounds = self
            .prefix
            .raw_base_size
            .saturating_sub(self.target().sz_array_base_size());
        bounds / (2 * 4)
    }

    /// Single-dimension, zero-lower-bound array
    #[must_use]
    pub fn is_sz_array(&self) -> bool {
        self.prefix.flags.is_array()
            && self.prefix.raw_base_size == self.target().sz_array_base_size()
    }

    /// Array with explicit bounds
    #[must_use]
    pub fn is_multi_dimensional_array(&self) -> bool {
        self.prefix.flags.is_array()
            && self.prefix.raw_base_size > self.target().sz_array_base_size()
    }

    /// Size of the unboxed value: base size minus object header, descriptor pointer and
    /// field padding
    #[must_use]
    pub fn value_type_size(&self) -> u32 {
        debug_assert!(
            self.prefix.flags.is_value_type(),
            "value_type_size queried for reference type"
        );
        let target = self.target();
        let overhead = target.object_header_size()
            + target.pointer_size
            + self.prefix.flags.value_type_field_padding();
        self.base_size().saturating_sub(overhead)
    }

    /// Related type of a canonical descriptor, null otherwise
    #[must_use]
    pub fn base_type(&self) -> Address {
        if self.prefix.flags.is_canonical() {
            self.prefix.related_type
        } else {
            Address::NULL
        }
    }

    /// Base type of a non-array descriptor
    #[must_use]
    pub fn non_array_base_type(&self) -> Address {
        debug_assert!(!self.prefix.flags.is_array(), "non_array_base_type queried for array");
        self.base_type()
    }

    /// Element type descriptor of a pointer, byref or array
    #[must_use]
    pub fn related_parameter_type(&self) -> Address {
        debug_assert!(
            self.prefix.flags.is_parameterized(),
            "related parameter type queried for {} descriptor",
            self.kind()
        );
        self.prefix.related_type
    }

    /// Shape of a parameterized descriptor
    #[must_use]
    pub fn parameterized_type_shape(&self) -> ParameterizedShape {
        debug_assert!(self.prefix.flags.is_parameterized(), "shape queried for non-parameterized");
        ParameterizedShape::from_raw(self.prefix.raw_base_size)
    }

    /// Return type of a function pointer
    #[must_use]
    pub fn function_pointer_return_type(&self) -> Address {
        debug_assert!(
            self.prefix.flags.is_function_pointer(),
            "return type queried for {} descriptor",
            self.kind()
        );
        self.prefix.related_type
    }

    /// Number of function-pointer parameters
    #[must_use]
    pub fn num_function_pointer_parameters(&self) -> u32 {
        debug_assert!(
            self.prefix.flags.is_function_pointer(),
            "parameter count queried for non-function-pointer"
        );
        self.shape().function_pointer_parameter_count()
    }

    /// Function pointer uses the unmanaged calling convention
    #[must_use]
    pub fn is_unmanaged_function_pointer(&self) -> bool {
        debug_assert!(
            self.prefix.flags.is_function_pointer(),
            "calling convention queried for non-function-pointer"
        );
        matches!(
            self.shape(),
            TypeShape::FunctionPointer {
                is_unmanaged: true,
                ..
            }
        )
    }

    /// Parameter types of a function pointer
    #[must_use]
    pub fn function_pointer_parameters(&self) -> DescriptorList {
        let count = self.num_function_pointer_parameters();
        DescriptorList::new(
            self.pointer_mode(),
            self.field_address(DescriptorField::FunctionPointerParameters),
            count as usize,
        )
    }

    /// Entry point stored in vtable slot `index`
    #[must_use]
    pub fn vtable_slot(&self, index: u16) -> Address {
        debug_assert!(
            index < self.prefix.num_vtable_slots,
            "vtable slot {index} out of range {}",
            self.prefix.num_vtable_slots
        );
        let target = self.target();
        let offset = self.prefix.vtable_offset(&target) + u32::from(index) * target.pointer_size;
        Address(self.read_word(offset))
    }

    /// Implemented interfaces, in interface-map order
    #[must_use]
    pub fn interface_map(&self) -> DescriptorList {
        let target = self.target();
        DescriptorList::new(
            PointerMode::Absolute,
            self.address
                .add(u64::from(self.prefix.interface_map_offset(&target))),
            usize::from(self.prefix.num_interfaces),
        )
    }

    /// Indirection cell of the owning type manager
    #[must_use]
    pub fn type_manager_indirection(&self) -> Address {
        self.read_field(DescriptorField::TypeManagerIndirection)
    }

    /// Owning type manager, read through the indirection cell
    #[must_use]
    pub fn type_manager(&self) -> Address {
        let cell = self.type_manager_indirection();
        if cell.is_null() {
            return Address::NULL;
        }
        match self.space.read_ptr(cell, self.target().pointer_size) {
            Ok(value) => Address(value),
            Err(error) => {
                debug_assert!(false, "type manager cell {cell} unreadable: {error}");
                Address::NULL
            }
        }
    }

    /// Writable data owned by the class library
    #[must_use]
    pub fn writable_data(&self) -> Address {
        self.read_field(DescriptorField::WritableData)
    }

    /// Address of the dispatch map blob; requires `HAS_DISPATCH_MAP`
    #[must_use]
    pub fn dispatch_map_address(&self) -> Address {
        self.read_field(DescriptorField::DispatchMap)
    }

    /// The dispatch map, or `None` if the type has none
    #[must_use]
    pub fn dispatch_map(&self) -> Option<DispatchMap> {
        if !self.prefix.flags.has_dispatch_map() {
            return None;
        }
        let address = self.dispatch_map_address();
        match DispatchMap::open(self.space, address) {
            Ok(map) => Some(map),
            Err(error) => {
                debug_assert!(false, "dispatch map at {address} unreadable: {error}");
                None
            }
        }
    }

    /// Implementation slot for an interface method, or `None` when the type has no override
    #[must_use]
    pub fn resolve_interface_method(
        &self,
        interface_index: u16,
        interface_method_slot: u16,
        kind: DispatchKind,
    ) -> Option<u16> {
        self.dispatch_map()?
            .resolve(interface_index, interface_method_slot, kind)
    }

    /// Finalizer entry point; requires `HAS_FINALIZER`
    #[must_use]
    pub fn finalizer_code(&self) -> Address {
        self.read_field(DescriptorField::Finalizer)
    }

    /// Entry point stored in sealed virtual slot `slot`
    #[must_use]
    pub fn sealed_virtual_slot(&self, slot: u16) -> Address {
        let mode = self.pointer_mode();
        let table = self.read_field(DescriptorField::SealedVirtualSlots);
        let entry = table.add(u64::from(slot) * u64::from(mode.width(&self.target())));
        match Pointer::load(self.space, entry, mode) {
            Ok(pointer) => pointer.resolve(),
            Err(error) => {
                debug_assert!(false, "sealed slot {slot} unreadable: {error}");
                Address::NULL
            }
        }
    }

    /// Open generic definition of an instantiated type
    #[must_use]
    pub fn generic_definition_address(&self) -> Address {
        debug_assert!(
            self.prefix.flags.is_generic(),
            "generic definition queried for non-generic"
        );
        self.read_field(DescriptorField::GenericDefinition)
    }

    /// Handle to the open generic definition
    #[must_use]
    pub fn generic_definition(&self) -> Option<MethodTable<'a>> {
        self.related(self.generic_definition_address())
    }

    /// Declared parameter count of a generic definition
    #[must_use]
    pub fn generic_parameter_count(&self) -> u32 {
        debug_assert!(
            self.prefix.flags.is_generic_type_definition(),
            "parameter count queried for {} descriptor",
            self.kind()
        );
        match self.shape() {
            TypeShape::GenericDefinition { parameter_count } => u32::from(parameter_count),
            _ => 0,
        }
    }

    /// Number of generic arguments; read from the definition for instantiated types
    #[must_use]
    pub fn generic_arity(&self) -> u32 {
        if self.prefix.flags.is_generic_type_definition() {
            return self.generic_parameter_count();
        }
        self.generic_definition()
            .map_or(0, |definition| definition.generic_parameter_count())
    }

    /// Arguments of an instantiated generic.
    ///
    /// A single argument lives in the composition slot itself. Larger vectors live out of line
    /// and are shared between every instantiation over the same arguments.
    #[must_use]
    pub fn generic_arguments(&self) -> DescriptorList {
        debug_assert!(
            self.prefix.flags.is_generic(),
            "generic arguments queried for non-generic"
        );
        let arity = self.generic_arity() as usize;
        let mode = self.pointer_mode();
        if arity == 1 {
            return DescriptorList::new(
                mode,
                self.field_address(DescriptorField::GenericComposition),
                1,
            );
        }
        DescriptorList::new(mode, self.read_field(DescriptorField::GenericComposition), arity)
    }

    /// Underlying type of `Nullable<T>`
    #[must_use]
    pub fn nullable_type(&self) -> Address {
        debug_assert!(self.prefix.flags.is_nullable(), "nullable type queried for non-nullable");
        self.generic_arguments().get(self.space, 0)
    }

    /// Per-parameter variance, or `None` if the generic declares none.
    ///
    /// Only definitions store the annotations; instantiated types read them through their
    /// definition.
    #[must_use]
    pub fn generic_variance(&self) -> Option<Vec<GenericVariance>> {
        let flags = self.prefix.flags;
        if !flags.has_generic_variance() {
            return None;
        }
        if flags.is_generic() {
            return self.generic_definition()?.generic_variance();
        }
        if !flags.is_generic_type_definition() {
            debug_assert!(false, "variance flag on {} descriptor", self.kind());
            return None;
        }

        let count = self.generic_parameter_count() as usize;
        let address = self.read_field(DescriptorField::GenericComposition);
        match self.space.read_bytes(address, count) {
            Ok(bytes) => Some(
                bytes
                    .into_iter()
                    .map(|raw| {
                        let variance = GenericVariance::from_repr(raw);
                        debug_assert!(variance.is_some(), "unknown variance byte 0x{raw:02x}");
                        variance.unwrap_or(GenericVariance::NonVariant)
                    })
                    .collect(),
            ),
            Err(error) => {
                debug_assert!(false, "variance at {address} unreadable: {error}");
                None
            }
        }
    }

    /// Template a runtime-built descriptor was cloned from
    #[must_use]
    pub fn dynamic_template_type(&self) -> Address {
        self.read_field(DescriptorField::DynamicTemplateType)
    }

    /// Dynamic-flags word of a runtime-built descriptor
    #[must_use]
    pub fn dynamic_type_flags(&self) -> DynamicTypeFlags {
        debug_assert!(
            self.prefix.flags.is_dynamic_type(),
            "dynamic flags queried for static descriptor"
        );
        self.dynamic_flags_word()
    }

    /// Runtime-built type whose class constructor still has to run
    #[must_use]
    pub fn is_dynamic_type_with_cctor(&self) -> bool {
        self.prefix.flags.is_dynamic_type()
            && self
                .dynamic_flags_word()
                .contains(DynamicTypeFlags::HAS_LAZY_CCTOR)
    }

    /// GC statics storage; requires `HAS_GC_STATICS`
    #[must_use]
    pub fn dynamic_gc_statics_data(&self) -> Address {
        self.read_field(DescriptorField::DynamicGcStatics)
    }

    /// Non-GC statics storage; requires `HAS_NON_GC_STATICS`
    #[must_use]
    pub fn dynamic_non_gc_statics_data(&self) -> Address {
        self.read_field(DescriptorField::DynamicNonGcStatics)
    }

    /// Thread statics index; requires `HAS_THREAD_STATICS`
    #[must_use]
    pub fn dynamic_thread_statics_index(&self) -> u32 {
        let offset = self.offset_of(DescriptorField::DynamicThreadStaticsIndex);
        self.read_word(offset) as u32
    }
}

impl PartialEq for MethodTable<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for MethodTable<'_> {}

impl std::fmt::Debug for MethodTable<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodTable")
            .field("address", &self.address)
            .field("flags", &self.prefix.flags)
            .field("shape", &self.shape())
            .field("vtable_slots", &self.prefix.num_vtable_slots)
            .field("interfaces", &self.prefix.num_interfaces)
            .finish()
    }
}
