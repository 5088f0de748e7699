use std::fmt;
use std::ops::Range;

use serde::Serialize;

use crate::arch::{Arch, ExecutionContext, PageSize};
use crate::manager::PageTableManager;
use crate::page::{Mapping, Page, PageAttributes, PageType};
use crate::phys::PaPartition;
use crate::segment::{DataItem, MemoryType, Segment, SegmentBody};

/// Serializable snapshot of a finished layout.
#[derive(Debug, Clone, Serialize)]
pub struct LayoutReport {
    pub arch: Arch,
    pub seed: u64,
    pub physical: PhysicalReport,
    pub tables: Vec<TableReport>,
    pub cross_core: Vec<CrossCoreReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl From<Range<u64>> for Span {
    fn from(range: Range<u64>) -> Self {
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhysicalReport {
    pub code: Span,
    pub data: Span,
    pub mapped_bytes: u64,
    pub allocated_bytes: u64,
    pub largest_unmapped_code: u64,
    pub largest_unmapped_data: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub name: String,
    pub core_id: u32,
    pub context: ExecutionContext,
    pub mapped_bytes: u64,
    pub allocated_bytes: u64,
    pub non_allocated_bytes: u64,
    pub stack_top: Option<u64>,
    pub pages: Vec<PageReport>,
    pub segments: Vec<SegmentReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageReport {
    pub va: u64,
    pub pa: u64,
    pub size: PageSize,
    pub page_type: PageType,
    pub mapping: Mapping,
    pub batch: u32,
    pub attributes: PageAttributes,
}

impl From<&Page> for PageReport {
    fn from(page: &Page) -> Self {
        Self {
            va: page.va(),
            pa: page.pa(),
            size: page.size(),
            page_type: page.page_type(),
            mapping: page.mapping(),
            batch: page.batch().index(),
            attributes: page.attributes().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentReport {
    pub name: String,
    pub memory_type: MemoryType,
    pub va: u64,
    pub pa: u64,
    pub size: u64,
    pub alignment_bits: u8,
    pub exclusive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_core_group: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_label: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<DataItem>,
}

impl From<&Segment> for SegmentReport {
    fn from(segment: &Segment) -> Self {
        let (start_label, items) = match segment.body() {
            SegmentBody::Code(code) => (Some(code.start_label().to_string()), Vec::new()),
            SegmentBody::Data(data) => (None, data.items().to_vec()),
        };
        Self {
            name: segment.name().to_string(),
            memory_type: segment.memory_type(),
            va: segment.va_address(),
            pa: segment.pa_address(),
            size: segment.byte_size(),
            alignment_bits: segment.alignment_bits(),
            exclusive: segment.is_exclusive(),
            cross_core_group: segment.cross_core_group().map(|group| group.index()),
            start_label,
            items,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossCoreReport {
    pub group: usize,
    pub pa: u64,
    pub size: PageSize,
    pub page_type: PageType,
    pub mappings: Vec<CrossCoreMapping>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossCoreMapping {
    pub table: String,
    pub va: u64,
}

impl LayoutReport {
    pub fn new(manager: &PageTableManager, seed: u64) -> Self {
        let phys = manager.phys();
        let largest = |partition: PaPartition| {
            phys.unmapped()
                .tagged(partition)
                .map(|region| region.size)
                .max()
                .unwrap_or(0)
        };
        let physical = PhysicalReport {
            code: phys.partition_range(PaPartition::Code).into(),
            data: phys.partition_range(PaPartition::Data).into(),
            mapped_bytes: phys.mapped().free_bytes(),
            allocated_bytes: phys.allocated().free_bytes(),
            largest_unmapped_code: largest(PaPartition::Code),
            largest_unmapped_data: largest(PaPartition::Data),
        };

        let tables = manager
            .page_tables()
            .map(|table| {
                let segments = manager.segments(table.id()).ok();
                TableReport {
                    name: table.name().to_string(),
                    core_id: table.core_id(),
                    context: table.context(),
                    mapped_bytes: table.mapped().free_bytes(),
                    allocated_bytes: table.allocated().free_bytes(),
                    non_allocated_bytes: table.non_allocated_bytes(),
                    stack_top: segments.and_then(|s| s.get_stack_start_address().ok()),
                    pages: table.pages().map(|page| PageReport::from(&**page)).collect(),
                    segments: segments
                        .into_iter()
                        .flat_map(|s| s.segments())
                        .map(SegmentReport::from)
                        .collect(),
                }
            })
            .collect();

        let cross_core = manager
            .cross_core_groups()
            .iter()
            .map(|group| CrossCoreReport {
                group: group.id().index(),
                pa: group.pa(),
                size: group.size(),
                page_type: group.page_type(),
                mappings: group
                    .pages()
                    .iter()
                    .filter_map(|(id, page)| {
                        let table = manager.page_table(*id).ok()?;
                        Some(CrossCoreMapping {
                            table: table.name().to_string(),
                            va: page.va(),
                        })
                    })
                    .collect(),
            })
            .collect();

        Self {
            arch: manager.arch(),
            seed,
            physical,
            tables,
            cross_core,
        }
    }
}

impl fmt::Display for LayoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phys = &self.physical;
        writeln!(f, "arch {} seed {}", self.arch, self.seed)?;
        writeln!(
            f,
            "physical code {:#x}..{:#x} data {:#x}..{:#x} mapped {:#x} allocated {:#x}",
            phys.code.start,
            phys.code.end,
            phys.data.start,
            phys.data.end,
            phys.mapped_bytes,
            phys.allocated_bytes
        )?;

        for table in &self.tables {
            writeln!(f)?;
            writeln!(
                f,
                "{} (core {}, {}) mapped {:#x} allocated {:#x}",
                table.name,
                table.core_id,
                table.context,
                table.mapped_bytes,
                table.allocated_bytes
            )?;
            writeln!(
                f,
                "  {:<18} {:<18} {:<5} {:<7} {:<10} {:>5}",
                "va", "pa", "size", "type", "mapping", "batch"
            )?;
            for page in &table.pages {
                writeln!(
                    f,
                    "  {:<18} {:<18} {:<5} {:<7} {:<10} {:>5}",
                    format!("{:#x}", page.va),
                    format!("{:#x}", page.pa),
                    page.size.to_string(),
                    page.page_type.to_string(),
                    page.mapping.to_string(),
                    page.batch
                )?;
            }
            writeln!(
                f,
                "  {:<16} {:<13} {:<18} {:<18} {:>8}",
                "segment", "type", "va", "pa", "size"
            )?;
            for segment in &table.segments {
                writeln!(
                    f,
                    "  {:<16} {:<13} {:<18} {:<18} {:>8}",
                    segment.name,
                    segment.memory_type.to_string(),
                    format!("{:#x}", segment.va),
                    format!("{:#x}", segment.pa),
                    format!("{:#x}", segment.size)
                )?;
            }
            if let Some(top) = table.stack_top {
                writeln!(f, "  stack top {top:#x}")?;
            }
        }

        if !self.cross_core.is_empty() {
            writeln!(f)?;
            writeln!(f, "cross-core pages")?;
        }
        for group in &self.cross_core {
            write!(
                f,
                "  group {} pa {:#x} {} {}:",
                group.group, group.pa, group.size, group.page_type
            )?;
            for mapping in &group.mappings {
                write!(f, " {}@{:#x}", mapping.table, mapping.va)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
