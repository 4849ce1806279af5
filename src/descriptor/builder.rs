//! Construction-phase writer for runtime-built descriptors.
//!
//! A descriptor is built in two steps. [`DescriptorHeader`] describes the fixed prefix: shape,
//! element type, attribute bits, counts and (for runtime-built types) the dynamic-flags word.
//! Those determine which optional fields exist and so the exact size of the record.
//! [`crate::TypeRegistry::begin`] turns a header into a [`MethodTableBuilder`], which owns a
//! private buffer at a reserved address and exposes one setter per field.
//!
//! Optional fields are written in layout order, each at most once, and only if the header
//! made them present. Fields left unwritten stay null. [`MethodTableBuilder::publish`] hands
//! the buffer to the address space in one step and returns the read-only
//! [`MethodTable`]; before that no reader can reach the address.
//!
//! # Examples
//!
//! ```rust
//! use methodtable::prelude::*;
//!
//! let registry = TypeRegistry::new(RegistryConfig::x64());
//! let header = DescriptorHeader::new(TypeShape::Object { base_size: 32 }, ElementType::Class)
//!     .with_attributes(TypeFlags::HAS_FINALIZER)
//!     .vtable_slots(2);
//!
//! let mut builder = registry.begin(&header)?;
//! builder.set_vtable_slot(0, Address::new(0x7000_0000))?;
//! builder.set_vtable_slot(1, Address::new(0x7000_0040))?;
//! builder.set_finalizer(Address::new(0x7000_0100))?;
//! let table = builder.publish()?;
//!
//! assert_eq!(table.finalizer_code(), Address::new(0x7000_0100));
//! # Ok::<(), methodtable::Error>(())
//! ```

use tracing::{debug, warn};

use crate::{
    config::Target,
    descriptor::{
        dispatch::DispatchMapBuilder,
        flags::{
            pack_nullable_value_offset, pack_value_type_field_padding, DescriptorFlags,
            DynamicTypeFlags, ElementType, ExtendedFlags, TypeFlags,
        },
        generics::GenericVariance,
        layout::{descriptor_size, field_offset, DescriptorField, FixedPrefix},
        shape::TypeShape,
        table::MethodTable,
        validation::{validate_prefix, validate_staged},
    },
    memory::{io::write_ptr_at, Address, Pointer, PointerMode, SegmentKind},
    registry::TypeRegistry,
    Error, Result,
};

/// Description of a descriptor's fixed prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeader {
    shape: TypeShape,
    element_type: ElementType,
    attributes: TypeFlags,
    component_size: Option<u16>,
    extended_flags: u16,
    related_type: Address,
    num_vtable_slots: u16,
    num_interfaces: u16,
    hash_code: u32,
    dynamic: Option<DynamicTypeFlags>,
}

impl DescriptorHeader {
    /// Starts a header for a descriptor of `shape` tagged `element_type`
    #[must_use]
    pub fn new(shape: TypeShape, element_type: ElementType) -> Self {
        DescriptorHeader {
            shape,
            element_type,
            attributes: TypeFlags::empty(),
            component_size: None,
            extended_flags: 0,
            related_type: Address::NULL,
            num_vtable_slots: 0,
            num_interfaces: 0,
            hash_code: 0,
            dynamic: None,
        }
    }

    /// Adds attribute bits.
    ///
    /// `HAS_COMPONENT_SIZE` and `IS_DYNAMIC_TYPE` are ignored here; they follow from
    /// [`Self::component_size`] and [`Self::dynamic`].
    #[must_use]
    pub fn with_attributes(mut self, attributes: TypeFlags) -> Self {
        self.attributes |=
            attributes - (TypeFlags::HAS_COMPONENT_SIZE | TypeFlags::IS_DYNAMIC_TYPE);
        self
    }

    /// Element size of an array or string
    #[must_use]
    pub fn component_size(mut self, size: u16) -> Self {
        self.component_size = Some(size);
        self
    }

    /// Adds extended flag bits
    #[must_use]
    pub fn extended_flags(mut self, flags: ExtendedFlags) -> Self {
        self.extended_flags |= flags.bits();
        self
    }

    /// Padding after the fields of a boxed value type
    #[must_use]
    pub fn value_type_field_padding(mut self, padding: u8) -> Self {
        self.extended_flags |= pack_value_type_field_padding(padding);
        self
    }

    /// Offset of the value inside `Nullable<T>`, a power of two
    #[must_use]
    pub fn nullable_value_offset(mut self, offset: u8) -> Self {
        self.extended_flags |= pack_nullable_value_offset(offset);
        self
    }

    /// Base type, element type or return type, depending on the shape
    #[must_use]
    pub fn related_type(mut self, related: Address) -> Self {
        self.related_type = related;
        self
    }

    /// Number of vtable slots
    #[must_use]
    pub fn vtable_slots(mut self, count: u16) -> Self {
        self.num_vtable_slots = count;
        self
    }

    /// Number of implemented interfaces
    #[must_use]
    pub fn interfaces(mut self, count: u16) -> Self {
        self.num_interfaces = count;
        self
    }

    /// Type hash code
    #[must_use]
    pub fn hash_code(mut self, hash: u32) -> Self {
        self.hash_code = hash;
        self
    }

    /// Marks the descriptor as built at runtime, with the given dynamic-flags word
    #[must_use]
    pub fn dynamic(mut self, flags: DynamicTypeFlags) -> Self {
        self.dynamic = Some(flags);
        self
    }

    /// Dynamic-flags word, empty for descriptors built ahead of time
    #[must_use]
    pub fn dynamic_flags(&self) -> DynamicTypeFlags {
        self.dynamic.unwrap_or_default()
    }

    /// Packs the flags word.
    ///
    /// # Errors
    /// Returns [`Error::InvalidHeader`] if both a component size and extended flags were
    /// requested, or the component size is zero.
    pub fn flags(&self) -> Result<DescriptorFlags> {
        let mut raw = self.shape.kind().to_flags()
            | self.element_type.to_flags()
            | self.attributes.bits();

        match self.component_size {
            Some(_) if self.extended_flags != 0 => {
                return Err(Error::InvalidHeader(
                    "component size and extended flags share the low half".to_string(),
                ))
            }
            Some(0) => {
                return Err(Error::InvalidHeader(
                    "component size must be non-zero".to_string(),
                ))
            }
            Some(size) => raw |= TypeFlags::HAS_COMPONENT_SIZE.bits() | u32::from(size),
            None => raw |= u32::from(self.extended_flags),
        }
        if self.dynamic.is_some() {
            raw |= TypeFlags::IS_DYNAMIC_TYPE.bits();
        }

        Ok(DescriptorFlags::new(raw))
    }

    /// Encodes and checks the fixed prefix for `target`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidHeader`] for an inconsistent header.
    pub fn prefix(&self, target: &Target) -> Result<FixedPrefix> {
        let prefix = FixedPrefix {
            flags: self.flags()?,
            raw_base_size: self.shape.encode(),
            related_type: self.related_type,
            num_vtable_slots: self.num_vtable_slots,
            num_interfaces: self.num_interfaces,
            hash_code: self.hash_code,
        };

        validate_prefix(&prefix, target).map_err(|error| match error {
            Error::Malformed { message, .. } => Error::InvalidHeader(message),
            other => other,
        })?;
        Ok(prefix)
    }

    /// Size of the record this header describes
    ///
    /// # Errors
    /// Same as [`Self::prefix`].
    pub fn size(&self, target: &Target) -> Result<u32> {
        let prefix = self.prefix(target)?;
        Ok(descriptor_size(&prefix, target, &self.dynamic_flags()))
    }
}

/// Writer for one descriptor between [`crate::TypeRegistry::begin`] and
/// [`MethodTableBuilder::publish`].
pub struct MethodTableBuilder<'r> {
    registry: &'r TypeRegistry,
    target: Target,
    prefix: FixedPrefix,
    dynamic: DynamicTypeFlags,
    address: Address,
    data: Vec<u8>,
    last_field: Option<DescriptorField>,
    generic_definition: Option<Address>,
}

impl<'r> MethodTableBuilder<'r> {
    pub(crate) fn new(registry: &'r TypeRegistry, header: &DescriptorHeader) -> Result<Self> {
        let target = registry.target();
        let prefix = header.prefix(&target)?;
        let dynamic = header.dynamic_flags();
        let size = descriptor_size(&prefix, &target, &dynamic) as usize;
        let address = registry.space().reserve(size)?;

        let mut data = vec![0u8; size];
        prefix.write(&mut data, &target)?;
        if prefix.flags.is_dynamic_type() {
            let mut offset =
                field_offset(&prefix, &target, &dynamic, DescriptorField::DynamicTypeFlags)
                    as usize;
            write_ptr_at(&mut data, &mut offset, target.pointer_size, dynamic.bits())?;
        }

        Ok(MethodTableBuilder {
            registry,
            target,
            prefix,
            dynamic,
            address,
            data,
            last_field: None,
            generic_definition: None,
        })
    }

    /// Address the descriptor will be published at
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// The encoded fixed prefix
    #[must_use]
    pub fn prefix(&self) -> &FixedPrefix {
        &self.prefix
    }

    /// Storage mode of this descriptor's reference fields
    #[must_use]
    pub fn pointer_mode(&self) -> PointerMode {
        self.prefix.pointer_mode(&self.target)
    }

    /// Checks that `field` may be written now and returns its offset. Does not consume it.
    fn slot(&self, field: DescriptorField) -> Result<usize> {
        if !self.prefix.is_field_present(field, self.dynamic) {
            return Err(Error::FieldNotPresent(field));
        }
        if let Some(last) = self.last_field {
            if field <= last {
                return Err(Error::FieldOrder { field, last });
            }
        }
        Ok(field_offset(&self.prefix, &self.target, &self.dynamic, field) as usize)
    }

    fn store(&mut self, offset: usize, value: Address, mode: PointerMode) -> Result<()> {
        let slot = self.address.add(offset as u64);
        Pointer::encode(value, slot, mode)?.write(&mut self.data, offset, &self.target)
    }

    fn write_reference(&mut self, field: DescriptorField, value: Address) -> Result<()> {
        let offset = self.slot(field)?;
        let mode = if field.is_dynamic_only() {
            PointerMode::Absolute
        } else {
            self.pointer_mode()
        };
        self.store(offset, value, mode)?;
        self.last_field = Some(field);
        Ok(())
    }

    /// Stores the entry point of vtable slot `index`
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if `index` is past the declared slot count.
    pub fn set_vtable_slot(&mut self, index: u16, code: Address) -> Result<()> {
        if index >= self.prefix.num_vtable_slots {
            return Err(Error::OutOfBounds);
        }
        let offset = self.prefix.vtable_offset(&self.target) as usize
            + usize::from(index) * self.target.pointer_size as usize;
        self.store(offset, code, PointerMode::Absolute)
    }

    /// Stores interface-map entry `index`
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if `index` is past the declared interface count.
    pub fn set_interface(&mut self, index: u16, interface: Address) -> Result<()> {
        if index >= self.prefix.num_interfaces {
            return Err(Error::OutOfBounds);
        }
        let offset = self.prefix.interface_map_offset(&self.target) as usize
            + usize::from(index) * self.target.pointer_size as usize;
        self.store(offset, interface, PointerMode::Absolute)
    }

    /// Stores the type-manager indirection cell
    ///
    /// # Errors
    /// Returns [`Error::FieldOrder`] if a later field was already written.
    pub fn set_type_manager_indirection(&mut self, cell: Address) -> Result<()> {
        self.write_reference(DescriptorField::TypeManagerIndirection, cell)
    }

    /// Stores the writable-data pointer
    ///
    /// # Errors
    /// Returns [`Error::FieldOrder`] if a later field was already written.
    pub fn set_writable_data(&mut self, data: Address) -> Result<()> {
        self.write_reference(DescriptorField::WritableData, data)
    }

    /// Allocates `map` and links it
    ///
    /// # Errors
    /// Returns [`Error::FieldNotPresent`] without `HAS_DISPATCH_MAP`, or any allocation error.
    pub fn set_dispatch_map(&mut self, map: &DispatchMapBuilder) -> Result<()> {
        self.slot(DescriptorField::DispatchMap)?;
        let address = self.registry.allocate_dispatch_map(map)?;
        self.write_reference(DescriptorField::DispatchMap, address)
    }

    /// Stores the finalizer entry point
    ///
    /// # Errors
    /// Returns [`Error::FieldNotPresent`] without `HAS_FINALIZER`.
    pub fn set_finalizer(&mut self, code: Address) -> Result<()> {
        self.write_reference(DescriptorField::Finalizer, code)
    }

    /// Allocates the sealed vtable in this descriptor's pointer mode and links it
    ///
    /// # Errors
    /// Returns [`Error::FieldNotPresent`] without `HAS_SEALED_VTABLE_ENTRIES`.
    pub fn set_sealed_virtual_slots(&mut self, slots: &[Address]) -> Result<()> {
        self.slot(DescriptorField::SealedVirtualSlots)?;
        let address = self
            .registry
            .allocate_pointer_list(self.pointer_mode(), slots)?;
        self.write_reference(DescriptorField::SealedVirtualSlots, address)
    }

    /// Stores the open generic definition of an instantiated type
    ///
    /// # Errors
    /// Returns [`Error::FieldNotPresent`] without `IS_GENERIC`.
    pub fn set_generic_definition(&mut self, definition: Address) -> Result<()> {
        self.write_reference(DescriptorField::GenericDefinition, definition)?;
        self.generic_definition = Some(definition);
        Ok(())
    }

    /// Stores the generic arguments; requires the definition to be set first.
    ///
    /// One argument is stored in the composition slot itself. Longer vectors are interned in
    /// the registry and shared with every other instantiation over the same arguments.
    ///
    /// # Errors
    /// Returns [`Error::GenericArityMismatch`] if the count differs from the definition's
    /// parameter count, [`Error::Malformed`] if no definition was written, or
    /// [`Error::FieldNotPresent`] without `IS_GENERIC`.
    pub fn set_generic_arguments(&mut self, arguments: &[Address]) -> Result<()> {
        self.slot(DescriptorField::GenericComposition)?;
        let Some(definition) = self.generic_definition else {
            return Err(malformed_error!(
                "generic arguments written before the generic definition"
            ));
        };

        let expected = self
            .registry
            .method_table_at(definition)
            .ok()
            .filter(|table| table.flags().is_generic_type_definition())
            .map(|table| table.generic_parameter_count())
            .ok_or_else(|| malformed_error!("{} is not a generic definition", definition))?;
        if expected as usize != arguments.len() {
            return Err(Error::GenericArityMismatch {
                expected,
                actual: arguments.len(),
            });
        }

        let value = match arguments {
            [single] => *single,
            _ => self
                .registry
                .intern_generic_arguments(self.pointer_mode(), arguments)?,
        };
        self.write_reference(DescriptorField::GenericComposition, value)
    }

    /// Allocates the variance array of a variant generic definition and links it
    ///
    /// # Errors
    /// Returns [`Error::GenericArityMismatch`] if the count differs from the declared
    /// parameter count, or [`Error::FieldNotPresent`] unless the header is a generic
    /// definition with `GENERIC_VARIANCE`.
    pub fn set_generic_variance(&mut self, variance: &[GenericVariance]) -> Result<()> {
        let TypeShape::GenericDefinition { parameter_count } = self.prefix.shape() else {
            return Err(Error::FieldNotPresent(DescriptorField::GenericComposition));
        };
        self.slot(DescriptorField::GenericComposition)?;
        if usize::from(parameter_count) != variance.len() {
            return Err(Error::GenericArityMismatch {
                expected: u32::from(parameter_count),
                actual: variance.len(),
            });
        }

        let address = self.registry.allocate_variance(variance)?;
        self.write_reference(DescriptorField::GenericComposition, address)
    }

    /// Stores the parameter types of a function pointer
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the count differs from the shape's parameter count.
    pub fn set_function_pointer_parameters(&mut self, parameters: &[Address]) -> Result<()> {
        let offset = self.slot(DescriptorField::FunctionPointerParameters)?;
        let expected = self.prefix.shape().function_pointer_parameter_count() as usize;
        if parameters.len() != expected {
            return Err(malformed_error!(
                "function pointer declares {} parameters, got {}",
                expected,
                parameters.len()
            ));
        }

        let mode = self.pointer_mode();
        let width = mode.width(&self.target) as usize;
        for (index, parameter) in parameters.iter().enumerate() {
            self.store(offset + index * width, *parameter, mode)?;
        }
        self.last_field = Some(DescriptorField::FunctionPointerParameters);
        Ok(())
    }

    /// Stores the template a runtime-built descriptor was cloned from
    ///
    /// # Errors
    /// Returns [`Error::FieldNotPresent`] for descriptors built ahead of time.
    pub fn set_dynamic_template_type(&mut self, template: Address) -> Result<()> {
        self.write_reference(DescriptorField::DynamicTemplateType, template)
    }

    /// Stores the GC statics pointer
    ///
    /// # Errors
    /// Returns [`Error::FieldNotPresent`] without `HAS_GC_STATICS`.
    pub fn set_dynamic_gc_statics(&mut self, statics: Address) -> Result<()> {
        self.write_reference(DescriptorField::DynamicGcStatics, statics)
    }

    /// Stores the non-GC statics pointer
    ///
    /// # Errors
    /// Returns [`Error::FieldNotPresent`] without `HAS_NON_GC_STATICS`.
    pub fn set_dynamic_non_gc_statics(&mut self, statics: Address) -> Result<()> {
        self.write_reference(DescriptorField::DynamicNonGcStatics, statics)
    }

    /// Stores the thread statics index
    ///
    /// # Errors
    /// Returns [`Error::FieldNotPresent`] without `HAS_THREAD_STATICS`.
    pub fn set_dynamic_thread_statics_index(&mut self, index: u32) -> Result<()> {
        self.write_reference(
            DescriptorField::DynamicThreadStaticsIndex,
            Address(u64::from(index)),
        )
    }

    /// Publishes the descriptor and returns its read-only handle.
    ///
    /// With [`crate::config::RegistryConfig::validate_on_publish`] the finished record is
    /// validated before it is installed; a rejected record never becomes readable and its
    /// reserved address stays unmapped.
    ///
    /// # Errors
    /// Returns any validation or publication error.
    pub fn publish(self) -> Result<MethodTable<'r>> {
        let size = self.data.len();
        let space = self.registry.space();

        if self.registry.config().validate_on_publish {
            if let Err(error) = validate_staged(space, self.address, &self.data, self.address) {
                warn!(address = %self.address, %error, "descriptor rejected before publication");
                return Err(error);
            }
        }

        space.publish(self.address, SegmentKind::Descriptor, self.data)?;

        let table = MethodTable::open(space, self.address)?;
        self.registry.record(self.address);
        debug!(
            address = %self.address,
            size,
            kind = %self.prefix.flags.kind(),
            mode = ?self.prefix.pointer_mode(&self.target),
            "published descriptor"
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RegistryConfig, descriptor::shape::ParameterizedShape};

    #[test]
    fn header_flags() {
        let header = DescriptorHeader::new(
            TypeShape::Parameterized(ParameterizedShape::sz_array(&Target::X64)),
            ElementType::SzArray,
        )
        .component_size(4)
        .with_attributes(TypeFlags::HAS_POINTERS | TypeFlags::HAS_COMPONENT_SIZE);
        let flags = header.flags().unwrap();
        assert!(flags.has_component_size());
        assert_eq!(flags.component_size(), 4);
        assert!(flags.contains_gc_pointers());
        assert!(flags.is_array());
        assert!(!flags.is_dynamic_type());
    }

    #[test]
    fn header_rejects_shared_low_half() {
        let header = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class)
            .component_size(2)
            .extended_flags(ExtendedFlags::HAS_EAGER_FINALIZER);
        assert!(matches!(header.flags(), Err(Error::InvalidHeader(_))));

        let zero = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class)
            .component_size(0);
        assert!(matches!(zero.flags(), Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn header_rejects_mismatched_shape() {
        let header = DescriptorHeader::new(
            TypeShape::Parameterized(ParameterizedShape::Pointer),
            ElementType::ByRef,
        )
        .related_type(Address(0x1000));
        assert!(matches!(
            header.prefix(&Target::X64),
            Err(Error::InvalidHeader(_))
        ));
    }

    #[test]
    fn field_order_is_enforced() {
        let registry = TypeRegistry::new(RegistryConfig::x64());
        let header = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class)
            .with_attributes(TypeFlags::HAS_FINALIZER);
        let mut builder = registry.begin(&header).unwrap();

        builder.set_finalizer(Address(0x5000)).unwrap();
        assert!(matches!(
            builder.set_writable_data(Address(0x6000)),
            Err(Error::FieldOrder {
                field: DescriptorField::WritableData,
                last: DescriptorField::Finalizer
            })
        ));
        assert!(matches!(
            builder.set_finalizer(Address(0x5000)),
            Err(Error::FieldOrder { .. })
        ));
        assert!(matches!(
            builder.set_generic_definition(Address(0x7000)),
            Err(Error::FieldNotPresent(DescriptorField::GenericDefinition))
        ));
        assert!(matches!(
            builder.set_vtable_slot(0, Address(0x1)),
            Err(Error::OutOfBounds)
        ));
    }

    #[test]
    fn rejected_write_does_not_consume_field() {
        let registry = TypeRegistry::new(RegistryConfig::x64());
        let header = DescriptorHeader::new(
            TypeShape::FunctionPointer {
                parameter_count: 2,
                is_unmanaged: false,
            },
            ElementType::FunctionPointer,
        )
        .related_type(Address(0x1000));
        let mut builder = registry.begin(&header).unwrap();

        assert!(builder
            .set_function_pointer_parameters(&[Address(0x2000)])
            .is_err());
        builder
            .set_function_pointer_parameters(&[Address(0x2000), Address(0x3000)])
            .unwrap();
        let table = builder.publish().unwrap();
        let parameters: Vec<_> = table
            .function_pointer_parameters()
            .iter(registry.space())
            .collect();
        assert_eq!(parameters, vec![Address(0x2000), Address(0x3000)]);
    }

    #[test]
    fn rejected_publish_stays_unobservable() {
        let registry = TypeRegistry::new(RegistryConfig::x64());
        // Announces a dispatch map that is never set
        let header = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class)
            .with_attributes(TypeFlags::HAS_DISPATCH_MAP);

        let builder = registry.begin(&header).unwrap();
        let address = builder.address();
        assert!(matches!(builder.publish(), Err(Error::Malformed { .. })));

        assert!(matches!(
            registry.method_table_at(address),
            Err(Error::Unmapped(_))
        ));
        assert!(registry.space().segment(address).is_none());
        assert_eq!(registry.descriptor_count(), 0);
    }
}
