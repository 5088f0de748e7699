//! Address-space layout engine of the random test generator.
//!
//! Generated test programs need somewhere to live on every simulated core. This crate hands out
//! the addresses:
//!
//! - [`PhysicalAddressSpace`]: the physical range shared by all cores, split into a code and a
//!   data partition
//! - [`PageTable`]: one virtual address space per (core, execution context), backed by [`Page`]s
//! - [`PageTableManager`]: the run-scoped registry that maps pages (regular, VA=PA, cross-core)
//!   and owns the seeded random source
//! - [`SegmentManager`] / [`SegmentAllocator`]: named code, data and stack [`Segment`]s carved out
//!   of mapped pages
//! - [`plan::generate_layout`]: the initialization stage that lays out a whole run from a
//!   [`LayoutConfig`], and [`LayoutReport`] to inspect the result
//!
//! Everything is deterministic for a given seed. Errors are never worked around: a failed
//! allocation leaves the bookkeeping untouched and is reported to the caller.

#![forbid(unsafe_code)]

mod arch;
mod config;
mod error;
mod manager;
mod page;
mod page_table;
mod phys;
pub mod plan;
mod report;
mod segment;

pub use arch::{Arch, ExecutionContext, PageSize};
pub use config::{CountRange, LayoutConfig, SizeRange};
pub use error::{LayoutError, Result, Space};
pub use manager::{CrossCoreGroup, PageRequest, PageTableManager};
pub use page::{
    BatchId, Cacheability, CrossCoreGroupId, Mapping, Page, PageAttributes, PagePermissions,
    PageType, Security, Shareability,
};
pub use page_table::{PageTable, PageTableId};
pub use phys::{PaPartition, PhysicalAddressSpace};
pub use plan::{generate_layout, Layout};
pub use report::{
    CrossCoreMapping, CrossCoreReport, LayoutReport, PageReport, PhysicalReport, SegmentReport,
    Span, TableReport,
};
pub use segment::{
    CodeSegment, CodeUnit, DataItem, DataSegment, MemoryType, Segment, SegmentAllocator,
    SegmentBody, SegmentId, SegmentManager, SegmentRequest,
};

pub use rtg_interval::{Interval, IntervalError, IntervalSet};
