//! Absolute and relative pointers behind one read contract.
//!
//! A reference stored in a descriptor is either a full machine address ([`PointerMode::Absolute`])
//! or a signed 32-bit displacement from the address of the slot that stores it
//! ([`PointerMode::Relative`]). Relative slots make build-time images position independent and
//! relocation free; records built at runtime use absolute slots. The mode is chosen once per
//! descriptor, never per field.
//!
//! [`DescriptorList`] is the homogeneous list variant: a head address, a length and the one
//! mode shared by every element. Generic argument vectors, function-pointer parameter lists
//! and interface maps are all read through it.
//!
//! # Examples
//!
//! ```rust
//! use methodtable::memory::{Address, Pointer, PointerMode};
//!
//! let slot = Address::new(0x2000);
//! let target = Address::new(0x1f00);
//!
//! let relative = Pointer::encode(target, slot, PointerMode::Relative)?;
//! assert_eq!(relative, Pointer::Relative { displacement: -0x100, slot });
//! assert_eq!(relative.resolve(), target);
//!
//! let absolute = Pointer::encode(target, slot, PointerMode::Absolute)?;
//! assert_eq!(absolute.resolve(), target);
//! # Ok::<(), methodtable::Error>(())
//! ```

use crate::{
    config::Target,
    memory::{
        io::{read_le_at, read_ptr_at, write_le_at, write_ptr_at},
        Address, AddressSpace,
    },
    Error, Result,
};

/// How references are stored in one descriptor or list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerMode {
    /// Full machine address, `pointer_size` bytes wide
    Absolute,
    /// Signed 32-bit displacement from the slot's own address
    Relative,
}

impl PointerMode {
    /// The mode a descriptor uses: relative only for records built ahead of time on a
    /// target that supports it.
    #[must_use]
    pub fn for_descriptor(target: &Target, is_dynamic: bool) -> Self {
        if !is_dynamic && target.supports_relative_pointers {
            PointerMode::Relative
        } else {
            PointerMode::Absolute
        }
    }

    /// Width in bytes of one slot stored in this mode.
    #[must_use]
    pub fn width(&self, target: &Target) -> u32 {
        match self {
            PointerMode::Absolute => target.pointer_size,
            PointerMode::Relative => 4,
        }
    }
}

/// A decoded reference slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointer {
    /// Full address
    Absolute(Address),
    /// Displacement relative to `slot`, the address the displacement is stored at
    Relative {
        /// Signed byte distance from `slot` to the referenced address
        displacement: i32,
        /// Address of the storage slot itself
        slot: Address,
    },
}

impl Pointer {
    /// The referenced address.
    ///
    /// A relative slot can never point at itself, so a zero displacement reads as null.
    #[must_use]
    pub fn resolve(&self) -> Address {
        match *self {
            Pointer::Absolute(address) => address,
            Pointer::Relative { displacement: 0, .. } => Address::NULL,
            Pointer::Relative { displacement, slot } => slot.displace(i64::from(displacement)),
        }
    }

    /// Builds the pointer that stores `target` in `slot` under `mode`.
    ///
    /// # Errors
    /// Returns [`Error::DisplacementOverflow`] if a relative displacement does not fit 32 bits
    /// or would be zero for a non-null target.
    pub fn encode(target: Address, slot: Address, mode: PointerMode) -> Result<Pointer> {
        match mode {
            PointerMode::Absolute => Ok(Pointer::Absolute(target)),
            PointerMode::Relative if target.is_null() => Ok(Pointer::Relative {
                displacement: 0,
                slot,
            }),
            PointerMode::Relative => {
                let displacement = slot
                    .distance_to(target)
                    .and_then(|delta| i32::try_from(delta).ok())
                    .filter(|delta| *delta != 0)
                    .ok_or(Error::DisplacementOverflow { slot, target })?;
                Ok(Pointer::Relative { displacement, slot })
            }
        }
    }

    /// Decodes the slot at `offset` in `data`, whose first byte lives at `data_base`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the slot does not fit in `data`.
    pub fn decode(
        data: &[u8],
        offset: usize,
        data_base: Address,
        mode: PointerMode,
        target: &Target,
    ) -> Result<Pointer> {
        let slot = data_base.add(offset as u64);
        let mut cursor = offset;
        match mode {
            PointerMode::Absolute => Ok(Pointer::Absolute(Address(read_ptr_at(
                data,
                &mut cursor,
                target.pointer_size,
            )?))),
            PointerMode::Relative => Ok(Pointer::Relative {
                displacement: read_le_at::<i32>(data, &mut cursor)?,
                slot,
            }),
        }
    }

    /// Loads the slot at `slot` from a published segment of `space`.
    ///
    /// # Errors
    /// Returns [`Error::Unmapped`] or [`Error::OutOfBounds`] if the slot is not readable.
    pub fn load(space: &AddressSpace, slot: Address, mode: PointerMode) -> Result<Pointer> {
        match mode {
            PointerMode::Absolute => Ok(Pointer::Absolute(Address(
                space.read_ptr(slot, space.target().pointer_size)?,
            ))),
            PointerMode::Relative => Ok(Pointer::Relative {
                displacement: space.read::<i32>(slot)?,
                slot,
            }),
        }
    }

    /// Stores the pointer at `offset` in `data`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] if the slot does not fit in `data`.
    pub fn write(&self, data: &mut [u8], offset: usize, target: &Target) -> Result<()> {
        let mut cursor = offset;
        match *self {
            Pointer::Absolute(address) => {
                write_ptr_at(data, &mut cursor, target.pointer_size, address.0)
            }
            Pointer::Relative { displacement, .. } => write_le_at(data, &mut cursor, displacement),
        }
    }
}

/// A list of descriptor references that share one [`PointerMode`].
///
/// The list does not own its storage: `head` is the address of the first slot inside some
/// published segment, and element `i` lives at `head + i * width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorList {
    mode: PointerMode,
    head: Address,
    len: usize,
}

impl DescriptorList {
    /// Creates a list view over `len` slots starting at `head`.
    #[must_use]
    pub fn new(mode: PointerMode, head: Address, len: usize) -> Self {
        DescriptorList { mode, head, len }
    }

    /// The storage mode shared by all elements
    #[must_use]
    pub fn mode(&self) -> PointerMode {
        self.mode
    }

    /// Address of the first slot
    #[must_use]
    pub fn head(&self) -> Address {
        self.head
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list has no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the slot holding element `index`.
    #[must_use]
    pub fn slot_address(&self, index: usize, target: &Target) -> Address {
        self.head
            .add(index as u64 * u64::from(self.mode.width(target)))
    }

    /// Resolves element `index`.
    ///
    /// # Errors
    /// Returns [`Error::OutOfBounds`] for an index past the end, or a memory error if the
    /// slot is not readable.
    pub fn try_get(&self, space: &AddressSpace, index: usize) -> Result<Address> {
        if index >= self.len {
            return Err(Error::OutOfBounds);
        }
        let slot = self.slot_address(index, &space.target());
        Ok(Pointer::load(space, slot, self.mode)?.resolve())
    }

    /// Resolves element `index`; reading past the end is a caller bug.
    #[must_use]
    pub fn get(&self, space: &AddressSpace, index: usize) -> Address {
        debug_assert!(index < self.len, "list index {index} out of range {}", self.len);
        match self.try_get(space, index) {
            Ok(address) => address,
            Err(error) => {
                debug_assert!(false, "unreadable list slot {index}: {error}");
                Address::NULL
            }
        }
    }

    /// Iterates over all resolved elements.
    pub fn iter<'a>(&self, space: &'a AddressSpace) -> impl Iterator<Item = Address> + 'a {
        let list = *self;
        (0..list.len).map(move |index| list.get(space, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SegmentKind;

    #[test]
    fn mode_selection() {
        assert_eq!(
            PointerMode::for_descriptor(&Target::X64, false),
            PointerMode::Relative
        );
        assert_eq!(
            PointerMode::for_descriptor(&Target::X64, true),
            PointerMode::Absolute
        );
        assert_eq!(
            PointerMode::for_descriptor(&Target::X64.with_relative_pointers(false), false),
            PointerMode::Absolute
        );
        assert_eq!(PointerMode::Relative.width(&Target::X64), 4);
        assert_eq!(PointerMode::Absolute.width(&Target::X64), 8);
        assert_eq!(PointerMode::Absolute.width(&Target::X86), 4);
    }

    #[test]
    fn relative_zero_is_null() {
        let pointer = Pointer::Relative {
            displacement: 0,
            slot: Address(0x4000),
        };
        assert!(pointer.resolve().is_null());
        assert_eq!(
            Pointer::encode(Address::NULL, Address(0x4000), PointerMode::Relative).unwrap(),
            pointer
        );
    }

    #[test]
    fn relative_overflow() {
        let slot = Address(0x1000);
        let far = Address(0x1_0000_1000);
        assert!(matches!(
            Pointer::encode(far, slot, PointerMode::Relative),
            Err(Error::DisplacementOverflow { .. })
        ));
        assert!(Pointer::encode(far, slot, PointerMode::Absolute).is_ok());
        // A slot pointing at itself is not representable
        assert!(Pointer::encode(slot, slot, PointerMode::Relative).is_err());
    }

    #[test]
    fn write_then_decode() {
        let target = Target::X64;
        let base = Address(0x3000);
        let mut data = vec![0u8; 12];

        let relative = Pointer::encode(Address(0x2000), base, PointerMode::Relative).unwrap();
        relative.write(&mut data, 0, &target).unwrap();
        let absolute =
            Pointer::encode(Address(0x2000), base.add(4), PointerMode::Absolute).unwrap();
        absolute.write(&mut data, 4, &target).unwrap();

        let decoded = Pointer::decode(&data, 0, base, PointerMode::Relative, &target).unwrap();
        assert_eq!(decoded.resolve(), Address(0x2000));
        let decoded = Pointer::decode(&data, 4, base, PointerMode::Absolute, &target).unwrap();
        assert_eq!(decoded.resolve(), Address(0x2000));
        assert!(Pointer::decode(&data, 8, base, PointerMode::Absolute, &target).is_err());
    }

    #[test]
    fn list_modes_agree() {
        let space = AddressSpace::new(Target::X64, 0x1000, 16);
        let targets = [Address(0x9000), Address(0x9100), Address(0x9200)];

        let build = |mode: PointerMode| {
            let width = mode.width(&Target::X64) as usize;
            let head = space
                .allocate(SegmentKind::Data, width * targets.len(), |base, bytes| {
                    for (index, target) in targets.iter().enumerate() {
                        let slot = base.add((index * width) as u64);
                        Pointer::encode(*target, slot, mode)?.write(
                            bytes,
                            index * width,
                            &Target::X64,
                        )?;
                    }
                    Ok(())
                })
                .unwrap();
            DescriptorList::new(mode, head, targets.len())
        };

        let absolute = build(PointerMode::Absolute);
        let relative = build(PointerMode::Relative);
        for index in 0..targets.len() {
            assert_eq!(absolute.get(&space, index), targets[index]);
            assert_eq!(relative.get(&space, index), targets[index]);
        }
        assert_eq!(
            absolute.iter(&space).collect::<Vec<_>>(),
            relative.iter(&space).collect::<Vec<_>>()
        );
        assert!(matches!(
            relative.try_get(&space, 3),
            Err(Error::OutOfBounds)
        ));
    }
}
