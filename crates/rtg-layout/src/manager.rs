//! Registry of page tables and owner of the shared physical address space.
//!
//! [`PageTableManager`] is the run-scoped context every allocation goes through. It owns the
//! seeded random source, the [`PhysicalAddressSpace`] and one [`PageTable`] plus
//! [`SegmentManager`] per (core, execution context). The single-sided pool mutators are crate
//! private; the public operations here validate both sides of a request first and only then move
//! bytes between pools, so a failure never leaves VA and PA bookkeeping out of step.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rtg_interval::{is_aligned, pick_aligned, Interval};

use crate::arch::{Arch, ExecutionContext, PageSize};
use crate::error::{check_alignment, LayoutError, Result, Space};
use crate::page::{BatchId, CrossCoreGroupId, Mapping, Page, PageAttributes, PageType};
use crate::page_table::{PageTable, PageTableId};
use crate::phys::PhysicalAddressSpace;
use crate::segment::{
    DataItem, MemoryType, Placement, Segment, SegmentAllocator, SegmentId, SegmentManager,
    SegmentRequest,
};

const CROSS_CORE: &str = "cross-core";

/// Parameters of [`PageTableManager::allocate_page`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub size: PageSize,
    pub page_type: PageType,
    /// Defaults to the page size; never below it.
    pub alignment_bits: Option<u8>,
    /// Number of back-to-back pages in the batch.
    pub count: usize,
    /// Require VA == PA.
    pub identity: bool,
    pub forced_va: Option<u64>,
    /// Defaults to [`PageAttributes::for_page`] for the table's context.
    pub attributes: Option<PageAttributes>,
}

impl PageRequest {
    pub fn new(size: PageSize, page_type: PageType) -> Self {
        Self {
            size,
            page_type,
            alignment_bits: None,
            count: 1,
            identity: false,
            forced_va: None,
            attributes: None,
        }
    }

    pub fn sequential(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }

    pub fn aligned(mut self, alignment_bits: u8) -> Self {
        self.alignment_bits = Some(alignment_bits);
        self
    }

    pub fn at(mut self, va: u64) -> Self {
        self.forced_va = Some(va);
        self
    }

    pub fn with_attributes(mut self, attributes: PageAttributes) -> Self {
        self.attributes = Some(attributes);
        self
    }
}

/// One physical page mapped into every page table that existed when it was allocated.
#[derive(Debug, Clone)]
pub struct CrossCoreGroup {
    id: CrossCoreGroupId,
    pa: u64,
    size: PageSize,
    page_type: PageType,
    pages: Vec<(PageTableId, Arc<Page>)>,
}

impl CrossCoreGroup {
    pub fn id(&self) -> CrossCoreGroupId {
        self.id
    }

    pub fn pa(&self) -> u64 {
        self.pa
    }

    pub fn pa_end(&self) -> u64 {
        self.pa + self.size.bytes()
    }

    pub fn size(&self) -> PageSize {
        self.size
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Member pages, one per page table, all sharing [`CrossCoreGroup::pa`].
    pub fn pages(&self) -> &[(PageTableId, Arc<Page>)] {
        &self.pages
    }

    pub fn page_for(&self, table: PageTableId) -> Option<&Arc<Page>> {
        self.pages
            .iter()
            .find(|(id, _)| *id == table)
            .map(|(_, page)| page)
    }
}

#[derive(Debug, Clone)]
struct TableSlot {
    table: PageTable,
    segments: SegmentManager,
}

#[derive(Debug, Clone)]
pub struct PageTableManager {
    arch: Arch,
    va_range: Range<u64>,
    phys: PhysicalAddressSpace,
    tables: Vec<TableSlot>,
    names: HashMap<String, PageTableId>,
    cross_core: Vec<CrossCoreGroup>,
    next_batch: u32,
    rng: ChaCha8Rng,
}

impl PageTableManager {
    /// A manager whose page tables span the architecture's full virtual address range.
    pub fn new(arch: Arch, phys: PhysicalAddressSpace, seed: u64) -> Self {
        Self {
            arch,
            va_range: 0..1u64 << arch.va_bits(),
            phys,
            tables: Vec::new(),
            names: HashMap::new(),
            cross_core: Vec::new(),
            next_batch: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Like [`PageTableManager::new`] with a narrower per-table virtual address range.
    pub fn with_va_range(
        arch: Arch,
        phys: PhysicalAddressSpace,
        va_range: Range<u64>,
        seed: u64,
    ) -> Result<Self> {
        if va_range.is_empty() || va_range.end > 1u64 << arch.va_bits() {
            return Err(LayoutError::InvalidConfig(format!(
                "virtual range {:#x}..{:#x} is empty or exceeds {} VA bits",
                va_range.start,
                va_range.end,
                arch.va_bits()
            )));
        }
        let mut manager = Self::new(arch, phys, seed);
        manager.va_range = va_range;
        Ok(manager)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn va_range(&self) -> Range<u64> {
        self.va_range.clone()
    }

    pub fn phys(&self) -> &PhysicalAddressSpace {
        &self.phys
    }

    /// The run's random source, for callers that randomize their own requests.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn create_page_table(
        &mut self,
        name: impl Into<String>,
        core_id: u32,
        context: ExecutionContext,
    ) -> Result<PageTableId> {
        let name = name.into();
        if !self.arch.supports_context(context) {
            return Err(LayoutError::UnsupportedContext {
                arch: self.arch,
                context,
            });
        }
        if self.names.contains_key(&name) {
            return Err(LayoutError::DuplicatePageTable { name });
        }
        if self
            .tables
            .iter()
            .any(|slot| slot.table.core_id() == core_id && slot.table.context() == context)
        {
            return Err(LayoutError::DuplicateContext { core_id, context });
        }

        let id = PageTableId(self.tables.len());
        let table = PageTable::new(
            id,
            name.clone(),
            core_id,
            context,
            self.va_range.start,
            self.va_range.end - self.va_range.start,
        )?;
        self.tables.push(TableSlot {
            table,
            segments: SegmentManager::new(id, name.clone()),
        });
        self.names.insert(name.clone(), id);

        tracing::info!(table = %name, core_id, %context, "created page table");
        Ok(id)
    }

    pub fn page_table(&self, id: PageTableId) -> Result<&PageTable> {
        self.slot(id).map(|slot| &slot.table)
    }

    pub fn page_table_by_name(&self, name: &str) -> Option<&PageTable> {
        let id = self.names.get(name)?;
        self.tables.get(id.0).map(|slot| &slot.table)
    }

    /// Every page table in creation order.
    pub fn page_tables(&self) -> impl Iterator<Item = &PageTable> + '_ {
        self.tables.iter().map(|slot| &slot.table)
    }

    pub fn page_table_ids(&self) -> Vec<PageTableId> {
        (0..self.tables.len()).map(PageTableId).collect()
    }

    fn slot(&self, id: PageTableId) -> Result<&TableSlot> {
        self.tables
            .get(id.0)
            .ok_or(LayoutError::UnknownPageTable { id: id.0 })
    }

    fn take_batch(&mut self) -> BatchId {
        let batch = BatchId(self.next_batch);
        self.next_batch += 1;
        batch
    }

    /// Map a batch of `request.count` pages with contiguous VA and contiguous PA.
    pub fn allocate_page(
        &mut self,
        id: PageTableId,
        request: &PageRequest,
    ) -> Result<Vec<Arc<Page>>> {
        let PageRequest {
            size,
            page_type,
            count,
            identity,
            forced_va,
            ..
        } = *request;
        if !self.arch.supports_page_size(size) {
            return Err(LayoutError::UnsupportedPageSize {
                arch: self.arch,
                size,
            });
        }
        let alignment_bits = request.alignment_bits.unwrap_or(size.bits());
        check_alignment(alignment_bits)?;
        if alignment_bits < size.bits() {
            return Err(LayoutError::AlignmentBelowPageSize {
                size,
                alignment_bits,
            });
        }
        let total = u64::try_from(count)
            .ok()
            .filter(|&count| count > 0)
            .and_then(|count| size.bytes().checked_mul(count))
            .ok_or(LayoutError::InvalidPageCount { count })?;

        let table = &self
            .tables
            .get(id.0)
            .ok_or(LayoutError::UnknownPageTable { id: id.0 })?
            .table;
        let (va, pa) = match forced_va {
            Some(va) => {
                if !is_aligned(va, alignment_bits) {
                    return Err(LayoutError::MisalignedAddress {
                        address: va,
                        alignment_bits,
                    });
                }
                let pa = if identity {
                    va
                } else {
                    self.phys.find_unmapped(
                        table.name(),
                        page_type,
                        total,
                        alignment_bits,
                        &mut self.rng,
                    )?
                };
                (va, pa)
            }
            None if identity => {
                let partition = page_type.partition();
                let candidates = table
                    .unmapped()
                    .overlap_with(self.phys.unmapped())
                    .into_iter()
                    .filter(|region| region.tag.1 == partition);
                let region = pick_aligned(candidates, total, alignment_bits, &mut self.rng)
                    .ok_or_else(|| LayoutError::IdentityUnavailable {
                        table: table.name().to_string(),
                        page_type,
                        size: total,
                        alignment_bits,
                    })?;
                (region.start, region.start)
            }
            None => {
                let va = table.find_unmapped(page_type, total, alignment_bits, &mut self.rng)?;
                let pa = self.phys.find_unmapped(
                    table.name(),
                    page_type,
                    total,
                    alignment_bits,
                    &mut self.rng,
                )?;
                (va, pa)
            }
        };
        table.ensure_unmapped(va, total)?;
        self.phys
            .ensure_unmapped(table.name(), page_type, pa, total)?;
        if identity && va != pa {
            return Err(LayoutError::IdentityViolated { va, pa });
        }

        let attributes = request
            .attributes
            .clone()
            .unwrap_or_else(|| PageAttributes::for_page(page_type, table.context()));
        let mapping = if identity {
            Mapping::Identity
        } else {
            Mapping::Regular
        };
        let batch = self.take_batch();
        let pages: Vec<Arc<Page>> = (0..count as u64)
            .map(|i| {
                Arc::new(Page {
                    va: va + i * size.bytes(),
                    pa: pa + i * size.bytes(),
                    size,
                    page_type,
                    mapping,
                    attributes: attributes.clone(),
                    batch,
                    cross_core_group: None,
                })
            })
            .collect();

        self.phys.map(pa, total)?;
        let table = &mut self.tables[id.0].table;
        table.map(&pages)?;

        tracing::debug!(
            table = %table.name(),
            %page_type,
            %size,
            count,
            va,
            pa,
            identity,
            "mapped pages"
        );
        Ok(pages)
    }

    /// Map one physical page into every page table, at a per-table virtual address.
    ///
    /// The physical page is chosen first; each table then reuses VA == PA when that range is
    /// still unmapped there and picks a random VA otherwise.
    pub fn allocate_cross_core_page(
        &mut self,
        size: PageSize,
        page_type: PageType,
    ) -> Result<CrossCoreGroupId> {
        if self.tables.is_empty() {
            return Err(LayoutError::NoPageTables);
        }
        if !self.arch.supports_page_size(size) {
            return Err(LayoutError::UnsupportedPageSize {
                arch: self.arch,
                size,
            });
        }
        let (bytes, bits) = (size.bytes(), size.bits());

        let pa = self
            .phys
            .find_unmapped(CROSS_CORE, page_type, bytes, bits, &mut self.rng)?;
        let mut vas = Vec::with_capacity(self.tables.len());
        for slot in &self.tables {
            let table = &slot.table;
            let va = if table.unmapped().is_region_available(pa, bytes) {
                pa
            } else {
                table.find_unmapped(page_type, bytes, bits, &mut self.rng)?
            };
            vas.push(va);
        }

        let id = CrossCoreGroupId(self.cross_core.len());
        let batch = self.take_batch();
        self.phys.map(pa, bytes)?;
        let mut pages = Vec::with_capacity(vas.len());
        for (slot, va) in self.tables.iter_mut().zip(vas) {
            let page = Arc::new(Page {
                va,
                pa,
                size,
                page_type,
                mapping: Mapping::CrossCore,
                attributes: PageAttributes::for_page(page_type, slot.table.context()),
                batch,
                cross_core_group: Some(id),
            });
            slot.table.map(std::slice::from_ref(&page))?;
            tracing::debug!(table = %slot.table.name(), va, pa, "mapped cross-core page");
            pages.push((slot.table.id(), page));
        }

        self.cross_core.push(CrossCoreGroup {
            id,
            pa,
            size,
            page_type,
            pages,
        });
        Ok(id)
    }

    pub fn cross_core_groups(&self) -> &[CrossCoreGroup] {
        &self.cross_core
    }

    pub fn cross_core_group(&self, id: CrossCoreGroupId) -> Option<&CrossCoreGroup> {
        self.cross_core.get(id.0)
    }

    /// Borrow the segment allocator of one page table.
    pub fn segment_allocator(&mut self, id: PageTableId) -> Result<SegmentAllocator<'_>> {
        let slot = self
            .tables
            .get_mut(id.0)
            .ok_or(LayoutError::UnknownPageTable { id: id.0 })?;
        Ok(SegmentAllocator {
            arch: self.arch,
            table: &mut slot.table,
            segments: &mut slot.segments,
            phys: &mut self.phys,
            rng: &mut self.rng,
        })
    }

    pub fn allocate_memory_segment(
        &mut self,
        id: PageTableId,
        request: &SegmentRequest,
    ) -> Result<SegmentId> {
        self.segment_allocator(id)?.allocate_memory_segment(request)
    }

    pub fn allocate_data_item(
        &mut self,
        segment: SegmentId,
        name: impl Into<String>,
        byte_size: u64,
        alignment_bits: Option<u8>,
    ) -> Result<DataItem> {
        self.segment_allocator(segment.table)?
            .allocate_data_item(segment, name, byte_size, alignment_bits)
    }

    pub fn release_segment(&mut self, segment: SegmentId) -> Result<()> {
        self.segment_allocator(segment.table)?
            .release_segment(segment)
    }

    pub fn segments(&self, id: PageTableId) -> Result<&SegmentManager> {
        self.slot(id).map(|slot| &slot.segments)
    }

    pub fn segment(&self, id: SegmentId) -> Result<&Segment> {
        self.segments(id.table)?.get(id)
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> Result<&mut Segment> {
        self.tables
            .get_mut(id.table.0)
            .ok_or(LayoutError::UnknownPageTable { id: id.table.0 })?
            .segments
            .get_mut(id)
    }

    /// Carve one data segment out of a cross-core page and register it in every member table.
    ///
    /// The physical sub-range is picked and reserved once; each table's segment sits at the same
    /// offset inside its own mapping of the page.
    pub fn allocate_cross_core_data_segment(
        &mut self,
        name: impl Into<String>,
        byte_size: u64,
        alignment_bits: Option<u8>,
    ) -> Result<Vec<SegmentId>> {
        let name = name.into();
        if byte_size == 0 {
            return Err(LayoutError::InvalidSegmentSize {
                name,
                size: byte_size,
            });
        }
        for slot in &self.tables {
            slot.segments.ensure_unique(&name)?;
        }
        let alignment_bits = alignment_bits.unwrap_or(self.arch.pointer_alignment_bits());
        check_alignment(alignment_bits)?;
        // Member VAs only agree with the PA modulo the page size.
        if let Some(page_bits) = self.cross_core.iter().map(|group| group.size.bits()).max() {
            if alignment_bits > page_bits {
                return Err(LayoutError::CrossCoreAlignment {
                    name,
                    alignment_bits,
                    page_bits,
                });
            }
        }

        let free = self.phys.non_allocated().intervals();
        let candidates: Vec<Interval<usize>> = self
            .cross_core
            .iter()
            .enumerate()
            .filter(|(_, group)| alignment_bits <= group.size.bits())
            .flat_map(|(index, group)| {
                let (lo, hi) = (group.pa, group.pa_end());
                free.iter().filter_map(move |region| {
                    let start = region.start.max(lo);
                    let end = region.end().min(hi);
                    (start < end).then(|| Interval::new(start, end - start, index))
                })
            })
            .collect();
        let region = pick_aligned(candidates, byte_size, alignment_bits, &mut self.rng)
            .ok_or_else(|| LayoutError::CrossCoreExhausted {
                name: name.clone(),
                size: byte_size,
                alignment_bits,
                groups: self.cross_core.len(),
            })?;

        let group = &self.cross_core[region.tag];
        let group_id = group.id;
        let pa = region.start;
        let offset = pa - group.pa;
        self.phys.ensure_non_allocated(CROSS_CORE, pa, byte_size)?;

        let request = SegmentRequest::new(name.clone(), byte_size, MemoryType::DataShared)
            .aligned(alignment_bits)
            .shared();
        let mut built = Vec::with_capacity(group.pages.len());
        for (table_id, page) in &group.pages {
            let slot = &self.tables[table_id.0];
            let va = page.va + offset;
            if !is_aligned(va, alignment_bits) {
                return Err(LayoutError::MisalignedAddress {
                    address: va,
                    alignment_bits,
                });
            }
            slot.table.ensure_non_allocated(va, byte_size)?;
            let placement = Placement {
                va,
                pa,
                byte_size,
                pages: vec![page.clone()],
            };
            let segment = Segment::new(
                slot.segments.next_id(),
                &request,
                alignment_bits,
                placement,
                Some(group_id),
                slot.table.name(),
            )?;
            built.push((*table_id, va, segment));
        }

        self.phys.reserve(pa, byte_size)?;
        let mut ids = Vec::with_capacity(built.len());
        for (table_id, va, segment) in built {
            let slot = &mut self.tables[table_id.0];
            slot.table.reserve(va, byte_size)?;
            ids.push(slot.segments.insert(segment));
        }

        tracing::debug!(
            segment = %name,
            group = group_id.index(),
            pa,
            size = byte_size,
            tables = ids.len(),
            "allocated cross-core segment"
        );
        Ok(ids)
    }

    /// Verify the pool partitions of every table and of physical space, and that no two pages
    /// share physical bytes unless they belong to the same cross-core group.
    pub fn check_invariants(&self) -> Result<()> {
        self.phys.check_partition()?;
        for slot in &self.tables {
            slot.table.check_partition()?;
        }

        let mut seen = HashSet::new();
        let mut spans: Vec<&Arc<Page>> = self
            .page_tables()
            .flat_map(|table| table.pages())
            .filter(|page| match page.cross_core_group() {
                Some(group) => seen.insert(group),
                None => true,
            })
            .collect();
        spans.sort_by_key(|page| page.pa());
        if let Some(pair) = spans.windows(2).find(|w| w[0].pa_end() > w[1].pa()) {
            return Err(LayoutError::OverlappingPages {
                space: Space::Physical,
                first: pair[0].va(),
                second: pair[1].va(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
