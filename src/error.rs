use thiserror::Error;

use crate::{descriptor::DescriptorField, memory::Address};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors only exist at the producer and ingestion boundary: building a descriptor, mapping a
/// raw image, reading memory through the checked API and validating. Queries on a published
/// [`crate::MethodTable`] do not return errors; misuse there is a contract violation caught by
/// debug assertions.
///
/// # Error Categories
///
/// ## Memory Errors
/// - [`Error::OutOfBounds`] - Read or write past the end of a buffer or segment
/// - [`Error::Unmapped`] - Address not covered by any published segment
/// - [`Error::SegmentOverlap`] - Publication or mapping would overlap existing memory
/// - [`Error::AddressSpaceExhausted`] - The allocator ran out of address range
/// - [`Error::DisplacementOverflow`] - A relative pointer cannot reach its target
///
/// ## Construction Errors
/// - [`Error::InvalidHeader`] - Inconsistent fixed prefix requested from the builder
/// - [`Error::FieldNotPresent`] - Write to an optional field whose presence bit is clear
/// - [`Error::FieldOrder`] - Optional fields written out of order or twice
/// - [`Error::GenericArityMismatch`] - Argument count differs from the definition's arity
///
/// ## Validation Errors
/// - [`Error::Malformed`] - A record violates a layout invariant
#[derive(Error, Debug)]
pub enum Error {
    /// An out of bound access was attempted.
    ///
    /// Returned by every bounds-checked read or write helper when the buffer or segment is
    /// too small for the requested value.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// A record is damaged and does not follow the descriptor layout.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// No published segment contains the address.
    #[error("Address {0} is not mapped")]
    Unmapped(Address),

    /// A segment would overlap memory that is already published or handed out.
    #[error("Segment at {0} overlaps existing memory")]
    SegmentOverlap(Address),

    /// The bump allocator wrapped around.
    #[error("Address space exhausted")]
    AddressSpaceExhausted,

    /// A relative pointer stored at `slot` cannot encode `target`.
    ///
    /// Relative slots hold a non-zero signed 32-bit displacement, so targets further than
    /// 2 GiB away (or the slot itself) are not representable.
    #[error("Relative pointer at {slot} cannot reach {target}")]
    DisplacementOverflow {
        /// Address of the slot being written
        slot: Address,
        /// Address the slot should reference
        target: Address,
    },

    /// The fixed prefix handed to the builder is inconsistent.
    #[error("Invalid descriptor header - {0}")]
    InvalidHeader(String),

    /// The optional field is absent from this descriptor.
    #[error("Field {0} is not present in this descriptor")]
    FieldNotPresent(DescriptorField),

    /// Optional fields must be written once each, in layout order.
    #[error("Field {field} written after {last}")]
    FieldOrder {
        /// The field being written
        field: DescriptorField,
        /// The last field that was written
        last: DescriptorField,
    },

    /// The number of generic arguments does not match the definition.
    #[error("Generic definition expects {expected} arguments, got {actual}")]
    GenericArityMismatch {
        /// Arity declared by the generic definition
        expected: u32,
        /// Number of arguments supplied
        actual: usize,
    },
}
