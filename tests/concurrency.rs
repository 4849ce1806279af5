//! Concurrent construction and reading of descriptors sharing one registry.

use rayon::prelude::*;

use methodtable::prelude::*;

fn class(registry: &TypeRegistry) -> Address {
    let header = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class);
    registry.begin(&header).unwrap().publish().unwrap().address()
}

fn definition(registry: &TypeRegistry) -> Address {
    let header = DescriptorHeader::new(
        TypeShape::GenericDefinition { parameter_count: 2 },
        ElementType::Interface,
    )
    .with_attributes(TypeFlags::GENERIC_VARIANCE);

    let mut builder = registry.begin(&header).unwrap();
    builder
        .set_generic_variance(&[GenericVariance::Covariant, GenericVariance::Contravariant])
        .unwrap();
    builder.publish().unwrap().address()
}

fn instantiate(registry: &TypeRegistry, definition: Address, arguments: &[Address]) -> Address {
    let header = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Interface)
        .with_attributes(TypeFlags::IS_GENERIC | TypeFlags::GENERIC_VARIANCE);

    let mut builder = registry.begin(&header).unwrap();
    builder.set_generic_definition(definition).unwrap();
    builder.set_generic_arguments(arguments).unwrap();
    builder.publish().unwrap().address()
}

#[test]
fn parallel_instantiations_share_argument_vectors() {
    let registry = TypeRegistry::new(RegistryConfig::x64());
    let classes: Vec<Address> = (0..4).map(|_| class(&registry)).collect();
    let definition = definition(&registry);

    let pairs: Vec<[Address; 2]> = classes
        .iter()
        .flat_map(|first| classes.iter().map(move |second| [*first, *second]))
        .collect();

    // Every pair is instantiated eight times from whichever worker picks it up.
    let built: Vec<([Address; 2], Address)> = (0..pairs.len() * 8)
        .into_par_iter()
        .map(|index| {
            let arguments = pairs[index % pairs.len()];
            (arguments, instantiate(&registry, definition, &arguments))
        })
        .collect();

    assert_eq!(registry.composition_count(), pairs.len());
    assert_eq!(registry.descriptor_count(), classes.len() + 1 + built.len());

    for pair in &pairs {
        let heads: Vec<Address> = built
            .iter()
            .filter(|(arguments, _)| arguments == pair)
            .map(|(_, address)| {
                registry
                    .method_table_at(*address)
                    .unwrap()
                    .generic_arguments()
                    .head()
            })
            .collect();
        assert_eq!(heads.len(), 8);
        assert!(heads.iter().all(|head| *head == heads[0]));
    }

    assert!(registry.validate().is_empty());
}

#[test]
fn parallel_readers_see_published_values() {
    let registry = TypeRegistry::new(RegistryConfig::x64());
    let classes: Vec<Address> = (0..3).map(|_| class(&registry)).collect();
    let definition = definition(&registry);
    let instantiation = instantiate(&registry, definition, &classes[..2]);

    let mismatches = (0..256)
        .into_par_iter()
        .filter(|_| {
            let table = registry.method_table_at(instantiation).unwrap();
            let arguments: Vec<Address> =
                table.generic_arguments().iter(registry.space()).collect();
            let definition_ok = table.generic_definition_address() == definition;
            let variance_ok = table.generic_variance()
                == Some(vec![GenericVariance::Covariant, GenericVariance::Contravariant]);
            arguments != classes[..2] || !definition_ok || !variance_ok
        })
        .count();

    assert_eq!(mismatches, 0);
}

#[test]
fn builders_publish_concurrently_with_readers() {
    let registry = TypeRegistry::new(RegistryConfig::x64());
    let anchor = class(&registry);

    rayon::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|_| {
                for _ in 0..32 {
                    class(&registry);
                }
            });
        }
        for _ in 0..4 {
            scope.spawn(|_| {
                for _ in 0..32 {
                    let table = registry.method_table_at(anchor).unwrap();
                    assert_eq!(table.base_size(), 24);
                    assert_eq!(table.element_type(), ElementType::Class);
                }
            });
        }
    });

    assert_eq!(registry.descriptor_count(), 1 + 4 * 32);
    assert!(registry.validate().is_empty());
}
