//! Factories for descriptors used across unit tests.

use crate::{
    config::RegistryConfig,
    descriptor::{
        DescriptorHeader, ElementType, GenericVariance, MethodTable, TypeFlags, TypeShape,
    },
    memory::Address,
    registry::TypeRegistry,
};

/// x64 registry with publish-time validation
pub fn registry() -> TypeRegistry {
    TypeRegistry::new(RegistryConfig::x64())
}

/// Reference type with a 24-byte instance and no optional fields
pub fn class_header() -> DescriptorHeader {
    DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class)
}

/// Publishes `header` with no fields set
pub fn publish<'r>(registry: &'r TypeRegistry, header: &DescriptorHeader) -> MethodTable<'r> {
    registry.begin(header).unwrap().publish().unwrap()
}

/// A fresh, unrelated reference type
pub fn class(registry: &TypeRegistry) -> Address {
    publish(registry, &class_header()).address()
}

/// Open generic interface definition with `arity` parameters, optionally variant
pub fn generic_definition<'r>(
    registry: &'r TypeRegistry,
    arity: u16,
    variance: Option<&[GenericVariance]>,
) -> MethodTable<'r> {
    let mut header = DescriptorHeader::new(
        TypeShape::GenericDefinition {
            parameter_count: arity,
        },
        ElementType::Interface,
    );
    if variance.is_some() {
        header = header.with_attributes(TypeFlags::GENERIC_VARIANCE);
    }

    let mut builder = registry.begin(&header).unwrap();
    if let Some(variance) = variance {
        builder.set_generic_variance(variance).unwrap();
    }
    builder.publish().unwrap()
}

/// Instantiation of `definition` over `arguments`
pub fn instantiate<'r>(
    registry: &'r TypeRegistry,
    definition: &MethodTable<'_>,
    arguments: &[Address],
) -> MethodTable<'r> {
    let mut header =
        DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Interface)
            .with_attributes(TypeFlags::IS_GENERIC);
    if definition.flags().has_generic_variance() {
        header = header.with_attributes(TypeFlags::GENERIC_VARIANCE);
    }

    let mut builder = registry.begin(&header).unwrap();
    builder.set_generic_definition(definition.address()).unwrap();
    builder.set_generic_arguments(arguments).unwrap();
    builder.publish().unwrap()
}
