//! Little-endian, bounds-checked reading and writing of descriptor fields.
//!
//! Every byte that makes up a descriptor, a dispatch map or an out-of-line list goes through
//! this module. The helpers mirror each other: a `read_*` function decodes a value from a
//! byte slice and advances an offset, the matching `write_*` function encodes a value and
//! advances the offset by the same amount.
//!
//! # Key Components
//!
//! - [`RawIO`] - Trait implemented by the primitive integer types stored in records
//! - [`read_le`] / [`read_le_at`] - Read a value from the start of, or inside, a buffer
//! - [`write_le_at`] - Write a value inside a buffer
//! - [`read_ptr_at`] / [`write_ptr_at`] - Pointer-sized values whose width depends on the target
//!
//! # Examples
//!
//! ```rust
//! use methodtable::memory::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x1234u16)?;
//! write_le_at(&mut data, &mut offset, 0xDEAD_BEEFu32)?;
//! assert_eq!(offset, 6);
//!
//! offset = 0;
//! assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 0x1234);
//! assert_eq!(read_le_at::<u32>(&data, &mut offset)?, 0xDEAD_BEEF);
//! # Ok::<(), methodtable::Error>(())
//! ```
//!
//! # Error Handling
//!
//! All functions return [`crate::Error::OutOfBounds`] when the buffer is too small. Nothing
//! in here panics, which is what lets validation walk untrusted images.

use crate::{Error::OutOfBounds, Result};

/// Trait for primitive types that can be stored inside a descriptor record.
///
/// Each implementation names the fixed-size byte array it converts from and to, so that the
/// generic helpers below can slice exactly `size_of::<T>()` bytes out of a buffer.
pub trait RawIO: Sized + Copy {
    /// Byte array representation of the value.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decode from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encode to little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_raw_io {
    ($($ty:ty),*) => {
        $(
            impl RawIO for $ty {
                type Bytes = [u8; std::mem::size_of::<$ty>()];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_raw_io!(u8, i8, u16, i16, u32, i32, u64, i64);

/// Reads a value of type `T` from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `T`.
pub fn read_le<T: RawIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a value of type `T` at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
pub fn read_le_at<T: RawIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Writes `value` at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit.
pub fn write_le_at<T: RawIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let type_len = std::mem::size_of::<T>();
    let Some(end) = offset.checked_add(type_len) else {
        return Err(OutOfBounds);
    };
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(value.to_le_bytes().as_ref());
    *offset = end;
    Ok(())
}

/// Reads a pointer-sized value of `width` bytes (4 or 8), zero-extended to `u64`.
///
/// This is the record equivalent of a dynamic-width field: the same logical slot is four
/// bytes on a 32-bit target and eight bytes on a 64-bit target.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the slot does not fit.
pub fn read_ptr_at(data: &[u8], offset: &mut usize, width: u32) -> Result<u64> {
    debug_assert!(width == 4 || width == 8, "pointer width must be 4 or 8");
    if width == 8 {
        read_le_at::<u64>(data, offset)
    } else {
        Ok(u64::from(read_le_at::<u32>(data, offset)?))
    }
}

/// Writes a pointer-sized value of `width` bytes (4 or 8).
///
/// On a 4-byte target the upper half of `value` must be zero; anything else cannot be
/// represented and is reported as [`crate::Error::OutOfBounds`].
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the slot does not fit or the value is too wide.
pub fn write_ptr_at(data: &mut [u8], offset: &mut usize, width: u32, value: u64) -> Result<()> {
    debug_assert!(width == 4 || width == 8, "pointer width must be 4 or 8");
    if width == 8 {
        write_le_at(data, offset, value)
    } else {
        let Ok(narrow) = u32::try_from(value) else {
            return Err(OutOfBounds);
        };
        write_le_at(data, offset, narrow)
    }
}
