use std::fmt;

use rtg_interval::{IntervalError, MAX_ALIGNMENT_BITS};
use thiserror::Error;

use crate::arch::{Arch, ExecutionContext, PageSize};
use crate::page::PageType;
use crate::segment::MemoryType;

pub type Result<T> = std::result::Result<T, LayoutError>;

/// Which side of a translation a failure concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Virtual,
    Physical,
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Space::Virtual => "virtual",
            Space::Physical => "physical",
        })
    }
}

/// Errors raised while laying out the address space.
///
/// None of these are retried or worked around: the caller is expected to abort the generation
/// run and let the user adjust the sizing knobs.
#[derive(Debug, Clone, Error)]
pub enum LayoutError {
    #[error(transparent)]
    Interval(#[from] IntervalError),

    // Capacity exhaustion.
    #[error(
        "{table}: cannot map {size:#x} bytes of {page_type} pages at {alignment_bits}-bit \
         alignment, {space} space exhausted ({cause})"
    )]
    PageSpaceExhausted {
        table: String,
        space: Space,
        page_type: PageType,
        size: u64,
        alignment_bits: u8,
        cause: IntervalError,
    },

    #[error(
        "{table}: no region of {size:#x} bytes at {alignment_bits}-bit alignment is free in both \
         virtual and {page_type} physical space for an identity (VA=PA) mapping"
    )]
    IdentityUnavailable {
        table: String,
        page_type: PageType,
        size: u64,
        alignment_bits: u8,
    },

    #[error(
        "{table}: no non-allocated {page_type} region (VA=PA required: {identity}) can hold \
         segment `{name}` ({memory_type}, {size:#x} bytes at {alignment_bits}-bit alignment; \
         {free:#x} bytes free in matching regions, largest {largest:#x})"
    )]
    SegmentSpaceExhausted {
        table: String,
        name: String,
        memory_type: MemoryType,
        page_type: PageType,
        size: u64,
        alignment_bits: u8,
        identity: bool,
        free: u64,
        largest: u64,
    },

    #[error(
        "no cross-core page has {size:#x} free bytes at {alignment_bits}-bit alignment for \
         segment `{name}` ({groups} cross-core pages)"
    )]
    CrossCoreExhausted {
        name: String,
        size: u64,
        alignment_bits: u8,
        groups: usize,
    },

    // Constraint violations.
    #[error("identity mapping violated: va={va:#x} pa={pa:#x}")]
    IdentityViolated { va: u64, pa: u64 },

    #[error(
        "{table}: range {va:#x}+{size:#x} crosses a physical discontinuity between its pages"
    )]
    PhysicalDiscontinuity { table: String, va: u64, size: u64 },

    #[error("{table}: range {va:#x}+{size:#x} is not fully mapped")]
    UnmappedAddress { table: String, va: u64, size: u64 },

    #[error("{table}: {space} region {start:#x}+{size:#x} is not available")]
    RegionUnavailable {
        table: String,
        space: Space,
        start: u64,
        size: u64,
    },

    #[error("{arch} does not support {size} pages")]
    UnsupportedPageSize { arch: Arch, size: PageSize },

    #[error("alignment of {alignment_bits} bits is below the {size} page size")]
    AlignmentBelowPageSize { size: PageSize, alignment_bits: u8 },

    #[error("alignment of {alignment_bits} bits exceeds the maximum of 63")]
    InvalidAlignment { alignment_bits: u8 },

    #[error(
        "segment `{name}` asks for {alignment_bits}-bit alignment, but cross-core pages only \
         keep {page_bits}-bit alignment across page tables"
    )]
    CrossCoreAlignment {
        name: String,
        alignment_bits: u8,
        page_bits: u8,
    },

    #[error("address {address:#x} is not aligned to {alignment_bits} bits")]
    MisalignedAddress { address: u64, alignment_bits: u8 },

    #[error("invalid page count {count}")]
    InvalidPageCount { count: usize },

    #[error("segment `{name}` has an invalid size of {size:#x} bytes")]
    InvalidSegmentSize { name: String, size: u64 },

    #[error("{arch} has no {context} execution context")]
    UnsupportedContext {
        arch: Arch,
        context: ExecutionContext,
    },

    // Duplicate/identity errors.
    #[error("page table `{name}` already exists")]
    DuplicatePageTable { name: String },

    #[error("core {core_id} already has a {context} page table")]
    DuplicateContext {
        core_id: u32,
        context: ExecutionContext,
    },

    #[error("{table}: segment `{name}` already exists")]
    DuplicateSegment { table: String, name: String },

    #[error("segment `{segment}` already holds a data item named `{name}`")]
    DuplicateDataItem { segment: String, name: String },

    #[error("no page table with id {id}")]
    UnknownPageTable { id: usize },

    #[error("{table}: no segment named `{name}`")]
    UnknownSegment { table: String, name: String },

    #[error("{table}: segment slot {index} is empty (released or never allocated)")]
    StaleSegment { table: String, index: usize },

    // Invariant/programmer errors.
    #[error("{table}: expected exactly one {memory_type} segment, found {found}")]
    SegmentMultiplicity {
        table: String,
        memory_type: MemoryType,
        found: usize,
    },

    #[error("segment `{segment}` ({memory_type}) does not support {operation}")]
    WrongSegmentKind {
        segment: String,
        memory_type: MemoryType,
        operation: &'static str,
    },

    #[error(
        "segment `{segment}` cannot hold {size:#x} more bytes of code ({remaining:#x} remaining)"
    )]
    CodeOverflow {
        segment: String,
        size: u64,
        remaining: u64,
    },

    #[error("cross-core segment `{segment}` cannot be released from a single core")]
    CrossCoreRelease { segment: String },

    #[error("no page tables are registered")]
    NoPageTables,

    #[error("{pool}: partition invariant violated")]
    PartitionViolated { pool: String },

    #[error("{space} ranges of pages at va={first:#x} and va={second:#x} overlap")]
    OverlappingPages { space: Space, first: u64, second: u64 },

    #[error("invalid layout configuration: {0}")]
    InvalidConfig(String),
}

/// Reject alignments no 64-bit address can satisfy.
pub(crate) fn check_alignment(alignment_bits: u8) -> Result<()> {
    if alignment_bits > MAX_ALIGNMENT_BITS {
        Err(LayoutError::InvalidAlignment { alignment_bits })
    } else {
        Ok(())
    }
}
