use thiserror::Error;

pub type Result<T> = std::result::Result<T, IntervalError>;

/// Errors raised by [`crate::IntervalSet`] operations.
///
/// Every variant carries the label of the set that rejected the request so that a failure deep
/// inside a layout run still names the exhausted pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    #[error("{pool}: invalid region size {size:#x}")]
    InvalidSize { pool: String, size: u64 },

    #[error("{pool}: alignment of {alignment_bits} bits exceeds the maximum of 63")]
    InvalidAlignment { pool: String, alignment_bits: u8 },

    #[error("{pool}: range {base:#x}+{size:#x} overflows the 64-bit address space")]
    RangeOverflow { pool: String, base: u64, size: u64 },

    #[error("{pool}: region {start:#x}+{size:#x} lies outside [{base:#x}, {end:#x})")]
    OutOfRange {
        pool: String,
        start: u64,
        size: u64,
        base: u64,
        end: u64,
    },

    #[error(
        "{pool}: no free interval can hold {size:#x} bytes at {alignment_bits}-bit alignment \
         ({free:#x} bytes free across {intervals} intervals, largest {largest:#x})"
    )]
    Exhausted {
        pool: String,
        size: u64,
        alignment_bits: u8,
        free: u64,
        intervals: usize,
        largest: u64,
    },

    #[error("{pool}: region {start:#x}+{size:#x} is not free")]
    NotFree { pool: String, start: u64, size: u64 },

    #[error("{pool}: region {start:#x}+{size:#x} overlaps a free interval with a different tag")]
    TagConflict { pool: String, start: u64, size: u64 },
}
