use std::collections::BTreeMap;
use std::sync::Arc;

use rand::Rng;
use rtg_interval::{covers_exactly, is_partition_of, IntervalSet};
use serde::Serialize;

use crate::arch::ExecutionContext;
use crate::error::{LayoutError, Result, Space};
use crate::page::{Page, PageType, RegionTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PageTableId(pub(crate) usize);

impl PageTableId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Virtual address space of one (core, execution context) pair.
///
/// Four pools track every byte of the private VA range: `unmapped` and `mapped` partition the
/// range, `allocated` and `non_allocated` partition `mapped`. Non-allocated regions are tagged
/// with the page type, mapping kind and batch of the pages behind them.
#[derive(Debug, Clone)]
pub struct PageTable {
    id: PageTableId,
    name: String,
    core_id: u32,
    context: ExecutionContext,
    unmapped: IntervalSet,
    mapped: IntervalSet,
    non_allocated: IntervalSet<RegionTag>,
    allocated: IntervalSet,
    pages: BTreeMap<u64, Arc<Page>>,
}

impl PageTable {
    pub(crate) fn new(
        id: PageTableId,
        name: String,
        core_id: u32,
        context: ExecutionContext,
        va_base: u64,
        va_size: u64,
    ) -> Result<Self> {
        Ok(Self {
            unmapped: IntervalSet::full(format!("{name} va-unmapped"), va_base, va_size, ())?,
            mapped: IntervalSet::empty(format!("{name} va-mapped"), va_base, va_size)?,
            non_allocated: IntervalSet::empty(
                format!("{name} va-non-allocated"),
                va_base,
                va_size,
            )?,
            allocated: IntervalSet::empty(format!("{name} va-allocated"), va_base, va_size)?,
            pages: BTreeMap::new(),
            id,
            name,
            core_id,
            context,
        })
    }

    pub fn id(&self) -> PageTableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn va_base(&self) -> u64 {
        self.unmapped.base()
    }

    pub fn va_end(&self) -> u64 {
        self.unmapped.end()
    }

    pub fn unmapped(&self) -> &IntervalSet {
        &self.unmapped
    }

    pub fn mapped(&self) -> &IntervalSet {
        &self.mapped
    }

    pub fn allocated(&self) -> &IntervalSet {
        &self.allocated
    }

    /// Mapped bytes not yet handed to a segment, in all batches.
    pub fn non_allocated_bytes(&self) -> u64 {
        self.non_allocated.free_bytes()
    }

    /// Non-allocated bytes behind pages of `page_type`.
    pub fn non_allocated_bytes_of(&self, page_type: PageType) -> u64 {
        self.non_allocated
            .intervals()
            .iter()
            .filter(|region| region.tag.page_type == page_type)
            .map(|region| region.size)
            .sum()
    }

    pub(crate) fn non_allocated(&self) -> &IntervalSet<RegionTag> {
        &self.non_allocated
    }

    /// Pages in ascending VA order.
    pub fn pages(&self) -> impl Iterator<Item = &Arc<Page>> + '_ {
        self.pages.values()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// The page mapping `va`, if any.
    pub fn page_at(&self, va: u64) -> Option<&Arc<Page>> {
        self.pages
            .range(..=va)
            .next_back()
            .map(|(_, page)| page)
            .filter(|page| page.translate(va).is_some())
    }

    pub fn translate(&self, va: u64) -> Option<u64> {
        self.page_at(va).and_then(|page| page.translate(va))
    }

    /// Physical address of `[va, va + size)` and the pages covering it.
    ///
    /// The covering pages must form one gap-free chain in both VA and PA.
    pub(crate) fn translate_range(&self, va: u64, size: u64) -> Result<(u64, Vec<Arc<Page>>)> {
        let end = va.checked_add(size).ok_or_else(|| self.unmapped_error(va, size))?;
        let first = self.page_at(va).ok_or_else(|| self.unmapped_error(va, size))?;

        let mut pages = vec![first.clone()];
        let mut cursor = first.va_end();
        while cursor < end {
            let prev = pages.last().map(|page| page.pa_end());
            let next = self
                .pages
                .get(&cursor)
                .ok_or_else(|| self.unmapped_error(va, size))?;
            if prev != Some(next.pa()) {
                return Err(LayoutError::PhysicalDiscontinuity {
                    table: self.name.clone(),
                    va,
                    size,
                });
            }
            cursor = next.va_end();
            pages.push(next.clone());
        }

        Ok((first.pa() + (va - first.va()), pages))
    }

    fn unmapped_error(&self, va: u64, size: u64) -> LayoutError {
        LayoutError::UnmappedAddress {
            table: self.name.clone(),
            va,
            size,
        }
    }

    pub(crate) fn find_unmapped<R: Rng + ?Sized>(
        &self,
        page_type: PageType,
        size: u64,
        alignment_bits: u8,
        rng: &mut R,
    ) -> Result<u64> {
        self.unmapped
            .find_region(size, alignment_bits, rng)?
            .map(|region| region.start)
            .ok_or_else(|| LayoutError::PageSpaceExhausted {
                table: self.name.clone(),
                space: Space::Virtual,
                page_type,
                size,
                alignment_bits,
                cause: self.unmapped.exhausted(size, alignment_bits),
            })
    }

    pub(crate) fn ensure_unmapped(&self, va: u64, size: u64) -> Result<()> {
        self.ensure(self.unmapped.is_region_available(va, size), va, size)
    }

    pub(crate) fn ensure_non_allocated(&self, va: u64, size: u64) -> Result<()> {
        self.ensure(self.non_allocated.is_region_available(va, size), va, size)
    }

    fn ensure(&self, available: bool, va: u64, size: u64) -> Result<()> {
        if available {
            Ok(())
        } else {
            Err(LayoutError::RegionUnavailable {
                table: self.name.clone(),
                space: Space::Virtual,
                start: va,
                size,
            })
        }
    }

    /// `unmapped -> mapped + non-allocated` for a freshly created batch of pages.
    pub(crate) fn map(&mut self, pages: &[Arc<Page>]) -> Result<()> {
        let (Some(first), Some(last)) = (pages.first(), pages.last()) else {
            return Ok(());
        };
        let va = first.va();
        let size = last.va_end() - va;

        self.unmapped.remove_region(va, size)?;
        self.mapped.add_region(va, size, ())?;
        self.non_allocated.add_region(va, size, first.region_tag())?;
        for page in pages {
            self.pages.insert(page.va(), page.clone());
        }
        Ok(())
    }

    /// `non-allocated -> allocated`.
    pub(crate) fn reserve(&mut self, va: u64, size: u64) -> Result<()> {
        self.non_allocated.remove_region(va, size)?;
        self.allocated.add_region(va, size, ())?;
        Ok(())
    }

    /// `allocated -> non-allocated`, restoring the tag of the pages behind the range.
    pub(crate) fn release(&mut self, va: u64, size: u64) -> Result<()> {
        let tag = self
            .page_at(va)
            .map(|page| page.region_tag())
            .ok_or_else(|| self.unmapped_error(va, size))?;
        self.allocated.remove_region(va, size)?;
        self.non_allocated.add_region(va, size, tag)?;
        Ok(())
    }

    /// Verify the pool partition invariant and that pages never overlap in VA.
    pub fn check_partition(&self) -> Result<()> {
        let pages: Vec<&Arc<Page>> = self.pages.values().collect();
        if let Some(pair) = pages.windows(2).find(|w| w[0].va_end() > w[1].va()) {
            return Err(LayoutError::OverlappingPages {
                space: Space::Virtual,
                first: pair[0].va(),
                second: pair[1].va(),
            });
        }

        let tiled = covers_exactly(
            self.va_base(),
            self.va_end(),
            self.unmapped.spans().chain(self.mapped.spans()),
        );
        let split = is_partition_of(
            self.mapped.spans(),
            self.allocated.spans().chain(self.non_allocated.spans()),
        );
        let paged = is_partition_of(
            self.mapped.spans(),
            self.pages.values().map(|page| (page.va(), page.va_end())),
        );
        if tiled && split && paged {
            Ok(())
        } else {
            Err(LayoutError::PartitionViolated {
                pool: self.name.clone(),
            })
        }
    }
}
