//! Initialization stage: lay out every core's address space from a [`LayoutConfig`].

use rand::Rng;

use crate::arch::PageSize;
use crate::config::{CountRange, LayoutConfig};
use crate::error::Result;
use crate::manager::{PageRequest, PageTableManager};
use crate::page::PageType;
use crate::page_table::PageTableId;
use crate::phys::PhysicalAddressSpace;
use crate::report::LayoutReport;
use crate::segment::{MemoryType, SegmentId, SegmentRequest};

/// The outcome of one generation run.
#[derive(Debug, Clone)]
pub struct Layout {
    config: LayoutConfig,
    manager: PageTableManager,
}

impl Layout {
    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    pub fn manager(&self) -> &PageTableManager {
        &self.manager
    }

    /// Mutable access for scenario-local allocations after the initial layout.
    pub fn manager_mut(&mut self) -> &mut PageTableManager {
        &mut self.manager
    }

    pub fn into_manager(self) -> PageTableManager {
        self.manager
    }

    pub fn report(&self) -> LayoutReport {
        LayoutReport::new(&self.manager, self.config.seed)
    }
}

/// Build the page tables, pages and segments described by `config`.
///
/// Batches are sized so that every segment planned for a page type fits however the earlier
/// ones were scattered; any allocation failure still aborts the run.
pub fn generate_layout(config: &LayoutConfig) -> Result<Layout> {
    config.validate()?;

    let phys = PhysicalAddressSpace::new(
        config.phys_base,
        config.phys_code_size,
        config.phys_data_size,
    )?;
    let mut manager = PageTableManager::new(config.arch, phys, config.seed);

    let contexts = config.contexts();
    let mut tables = Vec::with_capacity(config.cores as usize * contexts.len());
    for core in 0..config.cores {
        for &context in &contexts {
            let name = format!("core{core}/{}", config.arch.context_name(context));
            tables.push(manager.create_page_table(name, core, context)?);
        }
    }

    for &table in &tables {
        plan_table(&mut manager, config, table)?;
    }

    for _ in 0..config.cross_core_pages {
        manager.allocate_cross_core_page(PageSize::Size4K, PageType::Data)?;
    }
    for i in 0..config.cross_core_pages {
        manager.allocate_cross_core_data_segment(format!("barrier{i}"), config.barrier_size, None)?;
    }

    manager.check_invariants()?;
    tracing::info!(
        arch = %config.arch,
        seed = config.seed,
        tables = tables.len(),
        cross_core_pages = config.cross_core_pages,
        "generated layout"
    );

    Ok(Layout {
        config: config.clone(),
        manager,
    })
}

fn plan_table(
    manager: &mut PageTableManager,
    config: &LayoutConfig,
    table: PageTableId,
) -> Result<()> {
    let arch = manager.arch();
    let code_alignment = arch.min_code_alignment_bits();
    let data_alignment = arch.pointer_alignment_bits();

    // Boot code runs before translation is enabled.
    let boot_pages = pages_for(slot_bytes(config.boot_code_size, code_alignment), PageSize::Size4K);
    manager.allocate_page(
        table,
        &PageRequest::new(PageSize::Size4K, PageType::Code)
            .sequential(boot_pages)
            .identity(),
    )?;
    manager.allocate_memory_segment(
        table,
        &SegmentRequest::new("boot", config.boot_code_size, MemoryType::BootCode).identity(),
    )?;

    let code: Vec<SegmentRequest> = (0..config.code_segments)
        .map(|i| {
            let size = config.code_segment_size.sample(manager.rng());
            SegmentRequest::new(format!("code{i}"), size, MemoryType::Code)
        })
        .collect();
    map_batches(
        manager,
        config,
        table,
        PageType::Code,
        config.code_page_batches,
        code.len(),
        slot_bytes(config.code_segment_size.max, code_alignment),
    )?;
    for request in &code {
        manager.allocate_memory_segment(table, request)?;
    }

    let data: Vec<SegmentRequest> = (0..config.data_segments)
        .map(|i| {
            let size = config.data_segment_size.sample(manager.rng());
            if i % 2 == 0 {
                SegmentRequest::new(format!("data{i}"), size, MemoryType::DataShared).shared()
            } else {
                SegmentRequest::new(format!("data{i}"), size, MemoryType::DataPreserve)
            }
        })
        .collect();
    map_batches(
        manager,
        config,
        table,
        PageType::Data,
        config.data_page_batches,
        data.len(),
        slot_bytes(config.data_segment_size.max, data_alignment),
    )?;
    let mut preserved: Vec<SegmentId> = Vec::new();
    for request in &data {
        let id = manager.allocate_memory_segment(table, request)?;
        if request.memory_type == MemoryType::DataPreserve {
            preserved.push(id);
        }
    }
    for id in preserved {
        let name = format!("{}_word", manager.segment(id)?.name());
        manager.allocate_data_item(id, name, 1 << data_alignment, None)?;
    }

    let stack_alignment = MemoryType::Stack.default_alignment_bits(arch);
    let stack_pages = pages_for(slot_bytes(config.stack_size, stack_alignment), PageSize::Size4K);
    manager.allocate_page(
        table,
        &PageRequest::new(PageSize::Size4K, PageType::Data).sequential(stack_pages),
    )?;
    manager.allocate_memory_segment(
        table,
        &SegmentRequest::new("stack", config.stack_size, MemoryType::Stack),
    )?;

    let page_table = manager.page_table(table)?;
    tracing::debug!(
        table = %page_table.name(),
        pages = page_table.page_count(),
        segments = manager.segments(table)?.len(),
        "planned page table"
    );
    Ok(())
}

/// Map `batches` page batches of `page_type`, each big enough that `segments` segments of up to
/// `slot` bytes (size plus alignment slack) still fit after random placement.
fn map_batches(
    manager: &mut PageTableManager,
    config: &LayoutConfig,
    table: PageTableId,
    page_type: PageType,
    batches: CountRange,
    segments: usize,
    slot: u64,
) -> Result<()> {
    let batches = batches.sample(manager.rng());
    let per_batch = segments.div_ceil(batches) as u64;
    // Placed segments leave at most one extra fragment each, so four slots per segment leave a
    // fragment of at least one slot free.
    let capacity = 4 * per_batch * slot;

    for _ in 0..batches {
        let size = if manager.rng().gen_bool(config.huge_page_probability) {
            PageSize::Size2M
        } else {
            PageSize::Size4K
        };
        let count = pages_for(capacity, size).max(config.sequential_pages.sample(manager.rng()));
        manager.allocate_page(table, &PageRequest::new(size, page_type).sequential(count))?;
    }
    Ok(())
}

fn slot_bytes(size: u64, alignment_bits: u8) -> u64 {
    size + (1 << alignment_bits)
}

fn pages_for(bytes: u64, size: PageSize) -> usize {
    bytes.div_ceil(size.bytes()).max(1) as usize
}
