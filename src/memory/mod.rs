//! Addresses, byte I/O and pointer indirection.
//!
//! This is the layer below the descriptor format. It knows nothing about type kinds or
//! field orderings; it only knows how to store and follow references:
//!
//! - [`Address`] - a location inside an [`AddressSpace`]
//! - [`AddressSpace`] / [`Segment`] - append-only published memory
//! - [`Pointer`] / [`PointerMode`] - absolute vs. relative reference slots
//! - [`DescriptorList`] - homogeneous lists of references sharing one mode
//! - [`io`] - bounds-checked little-endian reads and writes

mod address;
pub mod io;
mod pointer;
mod space;

pub use address::Address;
pub use pointer::{DescriptorList, Pointer, PointerMode};
pub use space::{AddressSpace, Segment, SegmentKind};
