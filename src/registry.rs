//! Program-lifetime owner of every descriptor and its out-of-line data.
//!
//! [`TypeRegistry`] ties the pieces together: an [`AddressSpace`] holding published segments,
//! the [`GenericCompositionCache`] that shares argument vectors, and the list of descriptor
//! addresses published so far. Nothing is ever removed, so a [`MethodTable`] handle stays
//! valid for as long as the registry is alive.
//!
//! Descriptors arrive two ways:
//! - built at runtime through [`TypeRegistry::begin`] and [`MethodTableBuilder::publish`]
//! - produced ahead of time as a byte image and mapped with [`TypeRegistry::map_image`]
//!
//! # Thread Safety
//!
//! `TypeRegistry` is `Send + Sync`. Any number of threads may build, publish and read
//! descriptors at the same time; each builder is owned by one thread until it publishes.
//!
//! # Examples
//!
//! ```rust
//! use methodtable::prelude::*;
//!
//! let registry = TypeRegistry::new(RegistryConfig::x64());
//! let header = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class);
//! let object = registry.begin(&header)?.publish()?;
//!
//! let reopened = registry.method_table_at(object.address())?;
//! assert_eq!(reopened, object);
//! assert!(registry.validate().is_empty());
//! # Ok::<(), methodtable::Error>(())
//! ```

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::{
    config::{RegistryConfig, Target},
    descriptor::{
        validate_descriptor, validate_staged, DescriptorHeader, DispatchMapBuilder,
        GenericCompositionCache, GenericVariance, MethodTable, MethodTableBuilder,
    },
    memory::{Address, AddressSpace, Pointer, PointerMode, SegmentKind},
    Error, Result,
};

/// Owner of all published descriptors.
pub struct TypeRegistry {
    config: RegistryConfig,
    space: AddressSpace,
    compositions: GenericCompositionCache,
    published: boxcar::Vec<Address>,
}

impl TypeRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        let space = AddressSpace::new(
            config.target,
            config.base_address,
            config.segment_alignment,
        );
        TypeRegistry {
            config,
            space,
            compositions: GenericCompositionCache::new(),
            published: boxcar::Vec::new(),
        }
    }

    /// The configuration this registry was created with
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The target descriptors are laid out for
    #[must_use]
    pub fn target(&self) -> Target {
        self.config.target
    }

    /// The underlying address space
    #[must_use]
    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// Starts building a descriptor described by `header`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidHeader`] for an inconsistent header, or an allocation error.
    pub fn begin(&self, header: &DescriptorHeader) -> Result<MethodTableBuilder<'_>> {
        MethodTableBuilder::new(self, header)
    }

    /// Opens the descriptor at `address`.
    ///
    /// # Errors
    /// Returns [`Error::Unmapped`] or [`Error::OutOfBounds`], see [`MethodTable::open`].
    pub fn method_table_at(&self, address: Address) -> Result<MethodTable<'_>> {
        MethodTable::open(&self.space, address)
    }

    /// Maps a producer-built image at `base` and registers the descriptors at
    /// `descriptor_offsets` inside it.
    ///
    /// With [`RegistryConfig::validate_on_publish`] every listed descriptor is validated
    /// against the image before it is mapped, so an image with a defective descriptor is
    /// never installed.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] for an offset outside the image, the first validation
    /// error, or [`Error::SegmentOverlap`] if the image cannot be placed at `base`.
    pub fn map_image(
        &self,
        base: Address,
        image: Vec<u8>,
        descriptor_offsets: &[usize],
    ) -> Result<Vec<Address>> {
        let len = image.len();
        if descriptor_offsets.iter().any(|offset| *offset >= len) {
            return Err(Error::OutOfBounds);
        }

        let addresses: Vec<Address> = descriptor_offsets
            .iter()
            .map(|offset| base.add(*offset as u64))
            .collect();

        if self.config.validate_on_publish {
            for address in &addresses {
                validate_staged(&self.space, base, &image, *address)?;
            }
        }
        self.space.map_at(base, image)?;

        for address in &addresses {
            self.record(*address);
        }

        debug!(%base, len, descriptors = addresses.len(), "mapped image");
        Ok(addresses)
    }

    pub(crate) fn record(&self, address: Address) {
        self.published.push(address);
    }

    /// Number of registered descriptors
    #[must_use]
    pub fn descriptor_count(&self) -> usize {
        self.published.count()
    }

    /// Addresses of all registered descriptors, in registration order
    pub fn descriptors(&self) -> impl Iterator<Item = Address> + '_ {
        self.published.iter().map(|(_, address)| *address)
    }

    /// Number of distinct shared generic argument vectors
    #[must_use]
    pub fn composition_count(&self) -> usize {
        self.compositions.len()
    }

    /// Allocates and publishes `len` bytes of out-of-line data.
    ///
    /// # Errors
    /// Propagates allocation errors and errors returned by `fill`.
    pub fn allocate_data<F>(&self, len: usize, fill: F) -> Result<Address>
    where
        F: FnOnce(Address, &mut [u8]) -> Result<()>,
    {
        self.space.allocate(SegmentKind::Data, len, fill)
    }

    /// Publishes a dispatch map blob.
    ///
    /// # Errors
    /// Returns the encoding or allocation error.
    pub fn allocate_dispatch_map(&self, map: &DispatchMapBuilder) -> Result<Address> {
        self.allocate_data(map.size(), |_, data| map.encode_into(data))
    }

    /// Publishes a list of references stored in `mode`, each relative to its own slot.
    ///
    /// # Errors
    /// Returns [`Error::DisplacementOverflow`] if a relative entry cannot reach its target.
    pub fn allocate_pointer_list(&self, mode: PointerMode, targets: &[Address]) -> Result<Address> {
        let target = self.target();
        let width = mode.width(&target) as usize;
        self.allocate_data(width * targets.len(), |base, data| {
            for (index, value) in targets.iter().enumerate() {
                let offset = index * width;
                Pointer::encode(*value, base.add(offset as u64), mode)?.write(
                    data,
                    offset,
                    &target,
                )?;
            }
            Ok(())
        })
    }

    /// Publishes a variance array, one byte per generic parameter.
    ///
    /// # Errors
    /// Returns the allocation error.
    pub fn allocate_variance(&self, variance: &[GenericVariance]) -> Result<Address> {
        self.allocate_data(variance.len(), |_, data| {
            for (byte, value) in data.iter_mut().zip(variance) {
                *byte = *value as u8;
            }
            Ok(())
        })
    }

    /// Returns the shared argument vector for `arguments` in `mode`, publishing it on first
    /// use.
    ///
    /// # Errors
    /// Returns the allocation error of the first use.
    pub fn intern_generic_arguments(
        &self,
        mode: PointerMode,
        arguments: &[Address],
    ) -> Result<Address> {
        self.compositions.get_or_allocate(mode, arguments, || {
            self.allocate_pointer_list(mode, arguments)
        })
    }

    /// Validates every registered descriptor in parallel.
    ///
    /// Returns the descriptors that failed, with their errors; an empty result means the
    /// registry is consistent.
    #[must_use]
    pub fn validate(&self) -> Vec<(Address, Error)> {
        let addresses: Vec<Address> = self.descriptors().collect();
        let failures: Vec<(Address, Error)> = addresses
            .par_iter()
            .filter_map(|address| {
                validate_descriptor(&self.space, *address)
                    .err()
                    .map(|error| (*address, error))
            })
            .collect();

        for (address, error) in &failures {
            warn!(%address, %error, "descriptor failed validation");
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ElementType, TypeShape};

    #[test]
    fn registry_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TypeRegistry>();
    }

    #[test]
    fn pointer_list_round_trip() {
        let registry = TypeRegistry::new(RegistryConfig::x64());
        let targets = [Address(0x4_0000), Address::NULL, Address(0x4_0100)];
        for mode in [PointerMode::Absolute, PointerMode::Relative] {
            let head = registry.allocate_pointer_list(mode, &targets).unwrap();
            let list = crate::memory::DescriptorList::new(mode, head, targets.len());
            assert_eq!(list.iter(registry.space()).collect::<Vec<_>>(), targets);
        }
    }

    #[test]
    fn map_image_rejects_bad_offsets() {
        let registry = TypeRegistry::new(RegistryConfig::unchecked(Target::X64));
        assert!(matches!(
            registry.map_image(Address(0x100_0000), vec![0u8; 16], &[16]),
            Err(Error::OutOfBounds)
        ));
        assert_eq!(registry.descriptor_count(), 0);
    }

    #[test]
    fn validation_reports_corrupt_image() {
        let registry = TypeRegistry::new(RegistryConfig::unchecked(Target::X64));
        // Element type 0x11 is unassigned
        let mut image = vec![0u8; 64];
        image[3] = 0x11 << 2;
        let addresses = registry
            .map_image(Address(0x100_0000), image, &[0])
            .unwrap();

        let failures = registry.validate();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, addresses[0]);

        let header = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class);
        registry.begin(&header).unwrap().publish().unwrap();
        assert_eq!(registry.descriptor_count(), 2);
        assert_eq!(registry.validate().len(), 1);
    }

    #[test]
    fn image_references_resolve_before_mapping() {
        use crate::descriptor::{
            field_offset, DescriptorField, DispatchKind, DynamicTypeFlags, TypeFlags,
        };

        let registry = TypeRegistry::new(RegistryConfig::x64());
        let target = registry.target();
        let base = Address(0x100_0000);
        let prefix = DescriptorHeader::new(TypeShape::Object { base_size: 24 }, ElementType::Class)
            .with_attributes(TypeFlags::HAS_DISPATCH_MAP)
            .prefix(&target)
            .unwrap();

        // The dispatch map lives in the same image, after the record
        let mut image = vec![0u8; 64];
        prefix.write(&mut image, &target).unwrap();
        let slot = field_offset(
            &prefix,
            &target,
            &DynamicTypeFlags::empty(),
            DescriptorField::DispatchMap,
        ) as usize;
        Pointer::encode(base.add(40), base.add(slot as u64), PointerMode::Relative)
            .unwrap()
            .write(&mut image, slot, &target)
            .unwrap();
        let mut map = DispatchMapBuilder::new();
        map.standard(0, 0, 3);
        map.encode_into(&mut image[40..40 + map.size()]).unwrap();

        let addresses = registry.map_image(base, image, &[0]).unwrap();
        let table = registry.method_table_at(addresses[0]).unwrap();
        assert_eq!(table.resolve_interface_method(0, 0, DispatchKind::Instance), Some(3));
    }

    #[test]
    fn rejected_image_is_not_mapped() {
        let registry = TypeRegistry::new(RegistryConfig::x64());
        let base = Address(0x100_0000);
        let mut image = vec![0u8; 64];
        image[3] = 0x11 << 2;

        assert!(matches!(
            registry.map_image(base, image, &[0]),
            Err(Error::Malformed { .. })
        ));
        assert!(registry.space().segment(base).is_none());
        assert!(matches!(registry.method_table_at(base), Err(Error::Unmapped(_))));
        assert_eq!(registry.descriptor_count(), 0);
    }
}
