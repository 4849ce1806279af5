//! The address space that owns every published record.
//!
//! An [`AddressSpace`] is a sparse map from base addresses to immutable [`Segment`]s. Address
//! ranges are handed out by a lock-free bump allocator ([`AddressSpace::reserve`]) so that a
//! producer knows the final address of a record while it is still writing it (relative
//! pointers need their own slot address). The finished bytes are then inserted as a segment,
//! and that insertion is the single publication point: readers find segments through a
//! `SkipMap` lookup and never observe a partially written record.
//!
//! Segments are never removed. Every address handed out stays valid for the lifetime of the
//! space, which is what lets descriptors link to each other by plain [`Address`].
//!
//! # Thread Safety
//!
//! All methods take `&self`. Reservation uses an atomic cursor, publication and lookup go
//! through `crossbeam_skiplist::SkipMap`, and published bytes are immutable.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_skiplist::SkipMap;
use tracing::trace;

use crate::{
    config::Target,
    memory::{
        io::{read_le_at, read_ptr_at, RawIO},
        Address,
    },
    Error, Result,
};

/// What a segment holds, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// A single type descriptor built by a [`crate::descriptor::MethodTableBuilder`]
    Descriptor,
    /// Out-of-line data: dispatch maps, sealed vtables, argument vectors, variance arrays
    Data,
    /// A producer-built image mapped with [`AddressSpace::map_at`]
    Image,
}

/// An immutable, published range of bytes at a fixed base address.
#[derive(Debug)]
pub struct Segment {
    base: Address,
    kind: SegmentKind,
    data: Box<[u8]>,
}

impl Segment {
    /// Base address of the segment
    #[must_use]
    pub fn base(&self) -> Address {
        self.base
    }

    /// What the segment holds
    #[must_use]
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Size of the segment in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the segment holds no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First address past the end of the segment
    #[must_use]
    pub fn end(&self) -> Address {
        self.base.add(self.data.len() as u64)
    }

    /// Returns true if `address` lies inside the segment
    #[must_use]
    pub fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.end()
    }

    /// Byte offset of `address` inside the segment
    #[must_use]
    pub fn offset_of(&self, address: Address) -> Option<usize> {
        if self.contains(address) {
            usize::try_from(address.0 - self.base.0).ok()
        } else {
            None
        }
    }

    /// The published bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Sparse, append-only address space holding published segments.
pub struct AddressSpace {
    target: Target,
    alignment: u64,
    cursor: AtomicU64,
    segments: SkipMap<u64, Arc<Segment>>,
}

impl AddressSpace {
    /// Creates an empty space whose allocator starts at `base_address`.
    ///
    /// `alignment` is rounded up to a power of two and to at least 8, so that every reserved
    /// range can hold pointer-aligned data and a list head never has its low bit set.
    #[must_use]
    pub fn new(target: Target, base_address: u64, alignment: u64) -> Self {
        let alignment = alignment.max(8).next_power_of_two();
        let start = align_up(base_address.max(1), alignment);
        AddressSpace {
            target,
            alignment,
            cursor: AtomicU64::new(start),
            segments: SkipMap::new(),
        }
    }

    /// The target this space lays records out for
    #[must_use]
    pub fn target(&self) -> Target {
        self.target
    }

    /// Number of published segments
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Reserves `len` bytes of fresh address range without publishing anything.
    ///
    /// # Errors
    /// Returns [`Error::AddressSpaceExhausted`] if the range would wrap around.
    pub fn reserve(&self, len: usize) -> Result<Address> {
        let len = (len as u64).max(1);
        let alignment = self.alignment;
        let mut start = 0;
        self.cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                start = current;
                current
                    .checked_add(len)
                    .and_then(|end| end.checked_add(alignment - 1))
                    .map(|end| end & !(alignment - 1))
            })
            .map_err(|_| Error::AddressSpaceExhausted)?;

        trace!(address = %Address(start), len, "reserved address range");
        Ok(Address(start))
    }

    /// Publishes `bytes` at a previously reserved `base`.
    ///
    /// # Errors
    /// Returns [`Error::SegmentOverlap`] if the range collides with a published segment.
    pub fn publish(
        &self,
        base: Address,
        kind: SegmentKind,
        bytes: Vec<u8>,
    ) -> Result<Arc<Segment>> {
        let segment = Arc::new(Segment {
            base,
            kind,
            data: bytes.into_boxed_slice(),
        });

        if let Some(previous) = self.segments.range(..segment.end().0).next_back() {
            if previous.value().end() > base && !segment.is_empty() {
                return Err(Error::SegmentOverlap(base));
            }
        }

        self.segments.insert(base.0, segment.clone());
        trace!(address = %base, len = segment.len(), ?kind, "published segment");
        Ok(segment)
    }

    /// Reserves `len` bytes, lets `fill` write them knowing their final address, and
    /// publishes the result.
    ///
    /// # Errors
    /// Propagates any error returned by `fill`, plus the errors of [`Self::reserve`] and
    /// [`Self::publish`].
    pub fn allocate<F>(&self, kind: SegmentKind, len: usize, fill: F) -> Result<Address>
    where
        F: FnOnce(Address, &mut [u8]) -> Result<()>,
    {
        let base = self.reserve(len)?;
        let mut bytes = vec![0u8; len];
        fill(base, &mut bytes)?;
        self.publish(base, kind, bytes)?;
        Ok(base)
    }

    /// Maps a producer-built image at a fixed `base`.
    ///
    /// The image must land in address range the allocator has not handed out yet; the
    /// allocator continues after the image.
    ///
    /// # Errors
    /// Returns [`Error::SegmentOverlap`] if `base` is null, below the allocator cursor, or
    /// the image would wrap around the address space.
    pub fn map_at(&self, base: Address, bytes: Vec<u8>) -> Result<Arc<Segment>> {
        let Some(end) = base.0.checked_add(bytes.len() as u64) else {
            return Err(Error::SegmentOverlap(base));
        };
        let alignment = self.alignment;
        let Some(next) = end
            .checked_add(alignment - 1)
            .map(|end| end & !(alignment - 1))
        else {
            return Err(Error::SegmentOverlap(base));
        };

        self.cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (!base.is_null() && base.0 >= current).then_some(next)
            })
            .map_err(|_| Error::SegmentOverlap(base))?;

        self.publish(base, SegmentKind::Image, bytes)
    }

    /// Returns the published segment containing `address`.
    #[must_use]
    pub fn segment(&self, address: Address) -> Option<Arc<Segment>> {
        let entry = self.segments.range(..=address.0).next_back()?;
        let segment = entry.value();
        segment.contains(address).then(|| segment.clone())
    }

    /// Reads a value of type `T` at `address`.
    ///
    /// # Errors
    /// Returns [`Error::Unmapped`] if no segment contains `address`, or
    /// [`Error::OutOfBounds`] if the value runs past the end of the segment.
    pub fn read<T: RawIO>(&self, address: Address) -> Result<T> {
        let segment = self.segment(address).ok_or(Error::Unmapped(address))?;
        let mut offset = segment.offset_of(address).ok_or(Error::Unmapped(address))?;
        read_le_at(segment.bytes(), &mut offset)
    }

    /// Reads a pointer of `width` bytes at `address`.
    ///
    /// # Errors
    /// Same as [`Self::read`].
    pub fn read_ptr(&self, address: Address, width: u32) -> Result<u64> {
        let segment = self.segment(address).ok_or(Error::Unmapped(address))?;
        let mut offset = segment.offset_of(address).ok_or(Error::Unmapped(address))?;
        read_ptr_at(segment.bytes(), &mut offset, width)
    }

    /// Copies `len` bytes starting at `address`.
    ///
    /// # Errors
    /// Same as [`Self::read`].
    pub fn read_bytes(&self, address: Address, len: usize) -> Result<Vec<u8>> {
        let segment = self.segment(address).ok_or(Error::Unmapped(address))?;
        let offset = segment.offset_of(address).ok_or(Error::Unmapped(address))?;
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds)?;
        segment
            .bytes()
            .get(offset..end)
            .map(<[u8]>::to_vec)
            .ok_or(Error::OutOfBounds)
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(Target::X64, 0x1000, 16)
    }

    #[test]
    fn reserve_is_aligned_and_disjoint() {
        let space = space();
        let a = space.reserve(5).unwrap();
        let b = space.reserve(40).unwrap();
        let c = space.reserve(1).unwrap();
        assert_eq!(a, Address(0x1000));
        assert_eq!(b, Address(0x1010));
        assert_eq!(c, Address(0x1040));
    }

    #[test]
    fn publish_and_lookup() {
        let space = space();
        let base = space.reserve(8).unwrap();
        space
            .publish(base, SegmentKind::Data, vec![1, 0, 0, 0, 2, 0, 0, 0])
            .unwrap();

        assert_eq!(space.read::<u32>(base).unwrap(), 1);
        assert_eq!(space.read::<u32>(base.add(4)).unwrap(), 2);
        assert!(matches!(
            space.read::<u32>(base.add(6)),
            Err(Error::OutOfBounds)
        ));
        assert!(matches!(
            space.read::<u32>(base.add(8)),
            Err(Error::Unmapped(_))
        ));
        assert!(space.segment(Address(0x10)).is_none());
        assert_eq!(space.segment_count(), 1);
    }

    #[test]
    fn allocate_sees_final_address() {
        let space = space();
        let address = space
            .allocate(SegmentKind::Data, 8, |base, bytes| {
                bytes.copy_from_slice(&base.0.to_le_bytes());
                Ok(())
            })
            .unwrap();
        assert_eq!(space.read::<u64>(address).unwrap(), address.0);
        assert_eq!(space.read_ptr(address, 8).unwrap(), address.0);
    }

    #[test]
    fn allocate_propagates_fill_error() {
        let space = space();
        let result = space.allocate(SegmentKind::Data, 4, |_, _| Err(Error::OutOfBounds));
        assert!(result.is_err());
        assert_eq!(space.segment_count(), 0);
    }

    #[test]
    fn map_at_fresh_range_only() {
        let space = space();
        let segment = space.map_at(Address(0x8000), vec![0xAA; 32]).unwrap();
        assert_eq!(segment.kind(), SegmentKind::Image);
        assert_eq!(space.read::<u8>(Address(0x801F)).unwrap(), 0xAA);

        // The allocator continues behind the image
        assert!(space.reserve(4).unwrap() >= Address(0x8020));

        // Already handed out
        assert!(matches!(
            space.map_at(Address(0x1000), vec![0; 4]),
            Err(Error::SegmentOverlap(_))
        ));
        assert!(space.map_at(Address::NULL, vec![0; 4]).is_err());
    }

    #[test]
    fn publish_rejects_overlap() {
        let space = space();
        let base = space.reserve(16).unwrap();
        space.publish(base, SegmentKind::Data, vec![0; 16]).unwrap();
        assert!(matches!(
            space.publish(base.add(8), SegmentKind::Data, vec![0; 16]),
            Err(Error::SegmentOverlap(_))
        ));
    }

    #[test]
    fn read_bytes_bounds() {
        let space = space();
        let base = space.reserve(4).unwrap();
        space
            .publish(base, SegmentKind::Data, vec![1, 2, 3, 4])
            .unwrap();
        assert_eq!(space.read_bytes(base.add(1), 3).unwrap(), vec![2, 3, 4]);
        assert!(space.read_bytes(base.add(1), 4).is_err());
    }
}
