//! Interface dispatch maps.
//!
//! A dispatch map tells interface dispatch which vtable slot of the implementing type
//! services a given `(interface index, interface method slot)` pair. The blob is a header of
//! four `u16` counts followed by the entries, partitioned in a fixed order:
//!
//! | Partition                | Entry size | Fields                                        |
//! |--------------------------|------------|-----------------------------------------------|
//! | standard instance        | 6 bytes    | interface index, method slot, impl slot       |
//! | default instance         | 6 bytes    | same                                          |
//! | standard static virtual  | 8 bytes    | same, plus context map source                 |
//! | default static virtual   | 8 bytes    | same, plus context map source                 |
//!
//! Resolution scans only the partition that was asked for. A missing entry is `None`, which
//! callers treat as "no override" and fall back to the interface's default implementation.
//!
//! # Examples
//!
//! ```rust
//! use methodtable::descriptor::{DispatchKind, DispatchMapBuilder};
//!
//! let mut builder = DispatchMapBuilder::new();
//! builder.standard(0, 0, 3).standard(0, 1, 5);
//! assert_eq!(builder.size(), 8 + 2 * 6);
//! ```

use std::sync::Arc;

use crate::{
    memory::{
        io::{read_le_at, write_le_at},
        Address, AddressSpace, Segment,
    },
    Error, Result,
};

/// Size of the four-count header
pub const DISPATCH_MAP_HEADER_SIZE: usize = 8;
/// Size of an instance entry
pub const DISPATCH_MAP_ENTRY_SIZE: usize = 6;
/// Size of a static virtual entry
pub const STATIC_DISPATCH_MAP_ENTRY_SIZE: usize = 8;

/// Which half of the map a resolution scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    /// Ordinary interface methods
    Instance,
    /// Static virtual interface methods
    Static,
}

/// One instance dispatch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchMapEntry {
    /// Index into the implementing type's interface map
    pub interface_index: u16,
    /// Slot in the interface's own vtable
    pub interface_method_slot: u16,
    /// Slot in the implementing type's vtable
    pub impl_method_slot: u16,
}

/// One static virtual dispatch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StaticDispatchMapEntry {
    /// Interface, method and implementation slots
    pub entry: DispatchMapEntry,
    /// Generic context the implementation is resolved against
    pub context_map_source: u16,
}

/// Entry counts of the four partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DispatchCounts {
    /// Standard instance entries
    pub standard: u16,
    /// Default-implementation instance entries
    pub default: u16,
    /// Standard static virtual entries
    pub standard_static: u16,
    /// Default-implementation static virtual entries
    pub default_static: u16,
}

impl DispatchCounts {
    /// Instance entries of both kinds
    #[must_use]
    pub fn instance(&self) -> usize {
        usize::from(self.standard) + usize::from(self.default)
    }

    /// Static virtual entries of both kinds
    #[must_use]
    pub fn statics(&self) -> usize {
        usize::from(self.standard_static) + usize::from(self.default_static)
    }

    /// Size of the whole blob, computed without touching any entry
    #[must_use]
    pub fn blob_size(&self) -> usize {
        DISPATCH_MAP_HEADER_SIZE
            + DISPATCH_MAP_ENTRY_SIZE * self.instance()
            + STATIC_DISPATCH_MAP_ENTRY_SIZE * self.statics()
    }

    pub(crate) fn read(data: &[u8]) -> Result<Self> {
        let mut offset = 0;
        Ok(DispatchCounts {
            standard: read_le_at(data, &mut offset)?,
            default: read_le_at(data, &mut offset)?,
            standard_static: read_le_at(data, &mut offset)?,
            default_static: read_le_at(data, &mut offset)?,
        })
    }
}

/// Read-only view over a published dispatch map.
#[derive(Clone)]
pub struct DispatchMap {
    segment: Arc<Segment>,
    start: usize,
    address: Address,
    counts: DispatchCounts,
}

impl DispatchMap {
    /// Opens the map stored at `address`.
    ///
    /// # Errors
    /// Returns [`Error::Unmapped`] if nothing is published there, or [`Error::OutOfBounds`]
    /// if the counts describe more entries than the segment holds.
    pub fn open(space: &AddressSpace, address: Address) -> Result<Self> {
        let segment = space.segment(address).ok_or(Error::Unmapped(address))?;
        let start = segment.offset_of(address).ok_or(Error::Unmapped(address))?;
        let data = &segment.bytes()[start..];

        let counts = DispatchCounts::read(data)?;
        if counts.blob_size() > data.len() {
            return Err(Error::OutOfBounds);
        }

        Ok(DispatchMap {
            segment,
            start,
            address,
            counts,
        })
    }

    /// Address of the blob
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// The four partition counts
    #[must_use]
    pub fn counts(&self) -> DispatchCounts {
        self.counts
    }

    /// Size of the blob in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.counts.blob_size()
    }

    fn data(&self) -> &[u8] {
        &self.segment.bytes()[self.start..self.start + self.size()]
    }

    fn instance_entry(&self, index: usize) -> Option<DispatchMapEntry> {
        let mut offset = DISPATCH_MAP_HEADER_SIZE + index * DISPATCH_MAP_ENTRY_SIZE;
        read_entry(self.data(), &mut offset).ok()
    }

    fn static_entry(&self, index: usize) -> Option<StaticDispatchMapEntry> {
        let mut offset = DISPATCH_MAP_HEADER_SIZE
            + self.counts.instance() * DISPATCH_MAP_ENTRY_SIZE
            + index * STATIC_DISPATCH_MAP_ENTRY_SIZE;
        let data = self.data();
        let entry = read_entry(data, &mut offset).ok()?;
        let context_map_source = read_le_at::<u16>(data, &mut offset).ok()?;
        Some(StaticDispatchMapEntry {
            entry,
            context_map_source,
        })
    }

    /// Standard instance entries
    pub fn standard_entries(&self) -> impl Iterator<Item = DispatchMapEntry> + '_ {
        (0..usize::from(self.counts.standard)).filter_map(|index| self.instance_entry(index))
    }

    /// Default-implementation instance entries
    pub fn default_entries(&self) -> impl Iterator<Item = DispatchMapEntry> + '_ {
        let first = usize::from(self.counts.standard);
        (first..self.counts.instance()).filter_map(|index| self.instance_entry(index))
    }

    /// All instance entries, standard before default
    pub fn instance_entries(&self) -> impl Iterator<Item = DispatchMapEntry> + '_ {
        (0..self.counts.instance()).filter_map(|index| self.instance_entry(index))
    }

    /// All static virtual entries, standard before default
    pub fn static_entries(&self) -> impl Iterator<Item = StaticDispatchMapEntry> + '_ {
        (0..self.counts.statics()).filter_map(|index| self.static_entry(index))
    }

    /// Implementation slot for `(interface_index, interface_method_slot)` in the `kind`
    /// partition, or `None` if the type does not override it.
    #[must_use]
    pub fn resolve(
        &self,
        interface_index: u16,
        interface_method_slot: u16,
        kind: DispatchKind,
    ) -> Option<u16> {
        let matches = |entry: &DispatchMapEntry| {
            entry.interface_index == interface_index
                && entry.interface_method_slot == interface_method_slot
        };

        match kind {
            DispatchKind::Instance => self
                .instance_entries()
                .find(matches)
                .map(|entry| entry.impl_method_slot),
            DispatchKind::Static => self
                .static_entries()
                .find(|entry| matches(&entry.entry))
                .map(|entry| entry.entry.impl_method_slot),
        }
    }

    /// The static virtual entry for `(interface_index, interface_method_slot)`, including
    /// its context map source.
    #[must_use]
    pub fn resolve_static_entry(
        &self,
        interface_index: u16,
        interface_method_slot: u16,
    ) -> Option<StaticDispatchMapEntry> {
        self.static_entries().find(|entry| {
            entry.entry.interface_index == interface_index
                && entry.entry.interface_method_slot == interface_method_slot
        })
    }
}

impl std::fmt::Debug for DispatchMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchMap")
            .field("address", &self.address)
            .field("counts", &self.counts)
            .finish()
    }
}

fn read_entry(data: &[u8], offset: &mut usize) -> Result<DispatchMapEntry> {
    Ok(DispatchMapEntry {
        interface_index: read_le_at(data, offset)?,
        interface_method_slot: read_le_at(data, offset)?,
        impl_method_slot: read_le_at(data, offset)?,
    })
}

fn write_entry(data: &mut [u8], offset: &mut usize, entry: &DispatchMapEntry) -> Result<()> {
    write_le_at(data, offset, entry.interface_index)?;
    write_le_at(data, offset, entry.interface_method_slot)?;
    write_le_at(data, offset, entry.impl_method_slot)
}

/// Collects entries and encodes them in partition order.
///
/// Entries may be added in any order; [`DispatchMapBuilder::encode`] lays them out standard
/// instance first and default static last.
#[derive(Debug, Clone, Default)]
pub struct DispatchMapBuilder {
    standard: Vec<DispatchMapEntry>,
    default: Vec<DispatchMapEntry>,
    standard_static: Vec<StaticDispatchMapEntry>,
    default_static: Vec<StaticDispatchMapEntry>,
}

impl DispatchMapBuilder {
    /// Creates an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a standard instance entry
    pub fn standard(&mut self, interface_index: u16, slot: u16, impl_slot: u16) -> &mut Self {
        self.standard.push(DispatchMapEntry {
            interface_index,
            interface_method_slot: slot,
            impl_method_slot: impl_slot,
        });
        self
    }

    /// Adds a default-implementation instance entry
    pub fn default_impl(&mut self, interface_index: u16, slot: u16, impl_slot: u16) -> &mut Self {
        self.default.push(DispatchMapEntry {
            interface_index,
            interface_method_slot: slot,
            impl_method_slot: impl_slot,
        });
        self
    }

    /// Adds a standard static virtual entry
    pub fn standard_static(
        &mut self,
        interface_index: u16,
        slot: u16,
        impl_slot: u16,
        context_map_source: u16,
    ) -> &mut Self {
        self.standard_static.push(StaticDispatchMapEntry {
            entry: DispatchMapEntry {
                interface_index,
                interface_method_slot: slot,
                impl_method_slot: impl_slot,
            },
            context_map_source,
        });
        self
    }

    /// Adds a default-implementation static virtual entry
    pub fn default_static(
        &mut self,
        interface_index: u16,
        slot: u16,
        impl_slot: u16,
        context_map_source: u16,
    ) -> &mut Self {
        self.default_static.push(StaticDispatchMapEntry {
            entry: DispatchMapEntry {
                interface_index,
                interface_method_slot: slot,
                impl_method_slot: impl_slot,
            },
            context_map_source,
        });
        self
    }

    /// Partition counts; saturates if a partition holds more than `u16::MAX` entries
    #[must_use]
    pub fn counts(&self) -> DispatchCounts {
        let count = |len: usize| u16::try_from(len).unwrap_or(u16::MAX);
        DispatchCounts {
            standard: count(self.standard.len()),
            default: count(self.default.len()),
            standard_static: count(self.standard_static.len()),
            default_static: count(self.default_static.len()),
        }
    }

    /// Encoded size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.counts().blob_size()
    }

    /// Encodes the blob into `data`, which must be at least [`Self::size`] bytes.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if a partition overflows its `u16` count, or
    /// [`Error::OutOfBounds`] if `data` is too small.
    pub fn encode_into(&self, data: &mut [u8]) -> Result<()> {
        let partitions = [
            self.standard.len(),
            self.default.len(),
            self.standard_static.len(),
            self.default_static.len(),
        ];
        if let Some(len) = partitions.iter().find(|len| **len > usize::from(u16::MAX)) {
            return Err(malformed_error!(
                "dispatch map partition holds {} entries",
                len
            ));
        }

        let counts = self.counts();
        let mut offset = 0;
        write_le_at(data, &mut offset, counts.standard)?;
        write_le_at(data, &mut offset, counts.default)?;
        write_le_at(data, &mut offset, counts.standard_static)?;
        write_le_at(data, &mut offset, counts.default_static)?;

        for entry in self.standard.iter().chain(&self.default) {
            write_entry(data, &mut offset, entry)?;
        }
        for entry in self.standard_static.iter().chain(&self.default_static) {
            write_entry(data, &mut offset, &entry.entry)?;
            write_le_at(data, &mut offset, entry.context_map_source)?;
        }
        Ok(())
    }

    /// Encodes the blob into a fresh buffer.
    ///
    /// # Errors
    /// Same as [`Self::encode_into`].
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.size()];
        self.encode_into(&mut data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Target, memory::SegmentKind};

    fn publish(space: &AddressSpace, builder: &DispatchMapBuilder) -> DispatchMap {
        let bytes = builder.encode().unwrap();
        let address = space
            .allocate(SegmentKind::Data, bytes.len(), |_, data| {
                data.copy_from_slice(&bytes);
                Ok(())
            })
            .unwrap();
        DispatchMap::open(space, address).unwrap()
    }

    #[test]
    fn standard_resolution() {
        let space = AddressSpace::new(Target::X64, 0x1000, 16);
        let mut builder = DispatchMapBuilder::new();
        builder.standard(0, 0, 3).standard(0, 1, 5);
        let map = publish(&space, &builder);

        assert_eq!(map.resolve(0, 1, DispatchKind::Instance), Some(5));
        assert_eq!(map.resolve(0, 0, DispatchKind::Instance), Some(3));
        assert_eq!(map.resolve(0, 2, DispatchKind::Instance), None);
        assert_eq!(map.resolve(0, 1, DispatchKind::Static), None);
    }

    #[test]
    fn partitions_are_ordered_and_separate() {
        let space = AddressSpace::new(Target::X64, 0x1000, 16);
        let mut builder = DispatchMapBuilder::new();
        builder
            .default_static(1, 0, 9, 4)
            .default_impl(1, 0, 7)
            .standard_static(0, 0, 8, 2)
            .standard(0, 0, 6);
        let map = publish(&space, &builder);

        assert_eq!(
            map.counts(),
            DispatchCounts {
                standard: 1,
                default: 1,
                standard_static: 1,
                default_static: 1
            }
        );
        assert_eq!(map.size(), 8 + 2 * 6 + 2 * 8);
        assert_eq!(map.standard_entries().count(), 1);
        assert_eq!(map.default_entries().next().unwrap().impl_method_slot, 7);

        let statics: Vec<_> = map.static_entries().collect();
        assert_eq!(statics[0].entry.impl_method_slot, 8);
        assert_eq!(statics[1].context_map_source, 4);

        // Same key, different partitions
        assert_eq!(map.resolve(0, 0, DispatchKind::Instance), Some(6));
        assert_eq!(map.resolve(0, 0, DispatchKind::Static), Some(8));
        assert_eq!(map.resolve(1, 0, DispatchKind::Instance), Some(7));
        assert_eq!(
            map.resolve_static_entry(1, 0).map(|entry| entry.context_map_source),
            Some(4)
        );
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let space = AddressSpace::new(Target::X64, 0x1000, 16);
        let address = space
            .allocate(SegmentKind::Data, 10, |_, data| {
                // Claims two standard entries but only has room for none
                data[0] = 2;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            DispatchMap::open(&space, address),
            Err(Error::OutOfBounds)
        ));
    }

    #[test]
    fn empty_map() {
        let builder = DispatchMapBuilder::new();
        assert_eq!(builder.encode().unwrap(), vec![0u8; 8]);
    }
}
