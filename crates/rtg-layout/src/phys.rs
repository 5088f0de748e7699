use std::ops::Range;

use rand::Rng;
use rtg_interval::{covers_exactly, is_partition_of, IntervalSet};
use serde::Serialize;

use crate::error::{LayoutError, Result, Space};
use crate::page::PageType;

const POOL: &str = "phys";

/// Type partitions of the physical address space. Code and data PAs never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaPartition {
    Code,
    Data,
}

/// The physical address space shared by every page table of a run.
///
/// The range is `[base, base + code_size + data_size)`: the code partition comes first, the data
/// partition directly after it. Bytes move `unmapped -> mapped/non-allocated -> mapped/allocated`
/// and only through compound operations driven by the page-table manager, which pairs each
/// physical mutation with the matching virtual one.
#[derive(Debug, Clone)]
pub struct PhysicalAddressSpace {
    unmapped: IntervalSet<PaPartition>,
    mapped: IntervalSet,
    non_allocated: IntervalSet,
    allocated: IntervalSet,
    code_size: u64,
}

impl PhysicalAddressSpace {
    pub fn new(base: u64, code_size: u64, data_size: u64) -> Result<Self> {
        if code_size == 0 || data_size == 0 {
            return Err(LayoutError::InvalidConfig(format!(
                "physical partitions must be non-empty (code={code_size:#x}, data={data_size:#x})"
            )));
        }
        let size = code_size.checked_add(data_size).ok_or_else(|| {
            LayoutError::InvalidConfig("physical address space size overflows".to_string())
        })?;

        let mut unmapped = IntervalSet::empty(format!("{POOL} pa-unmapped"), base, size)?;
        unmapped.add_region(base, code_size, PaPartition::Code)?;
        unmapped.add_region(base + code_size, data_size, PaPartition::Data)?;

        Ok(Self {
            unmapped,
            mapped: IntervalSet::empty(format!("{POOL} pa-mapped"), base, size)?,
            non_allocated: IntervalSet::empty(format!("{POOL} pa-non-allocated"), base, size)?,
            allocated: IntervalSet::empty(format!("{POOL} pa-allocated"), base, size)?,
            code_size,
        })
    }

    pub fn base(&self) -> u64 {
        self.unmapped.base()
    }

    pub fn end(&self) -> u64 {
        self.unmapped.end()
    }

    pub fn size(&self) -> u64 {
        self.unmapped.size()
    }

    pub fn partition_range(&self, partition: PaPartition) -> Range<u64> {
        let split = self.base() + self.code_size;
        match partition {
            PaPartition::Code => self.base()..split,
            PaPartition::Data => split..self.end(),
        }
    }

    pub fn unmapped(&self) -> &IntervalSet<PaPartition> {
        &self.unmapped
    }

    pub fn mapped(&self) -> &IntervalSet {
        &self.mapped
    }

    pub fn non_allocated(&self) -> &IntervalSet {
        &self.non_allocated
    }

    pub fn allocated(&self) -> &IntervalSet {
        &self.allocated
    }

    /// Pick an unmapped physical region for pages of `page_type` without claiming it.
    pub(crate) fn find_unmapped<R: Rng + ?Sized>(
        &self,
        table: &str,
        page_type: PageType,
        size: u64,
        alignment_bits: u8,
        rng: &mut R,
    ) -> Result<u64> {
        let partition = page_type.partition();
        let found = self.unmapped.find_region_matching(
            size,
            alignment_bits,
            self.base()..self.end(),
            |p| *p == partition,
            rng,
        )?;
        found
            .map(|region| region.start)
            .ok_or_else(|| LayoutError::PageSpaceExhausted {
                table: table.to_string(),
                space: Space::Physical,
                page_type,
                size,
                alignment_bits,
                cause: self.unmapped.exhausted(size, alignment_bits),
            })
    }

    pub(crate) fn ensure_unmapped(
        &self,
        table: &str,
        page_type: PageType,
        pa: u64,
        size: u64,
    ) -> Result<()> {
        let partition = page_type.partition();
        match self.unmapped.containing(pa, size) {
            Some(region) if region.tag == partition => Ok(()),
            _ => Err(LayoutError::RegionUnavailable {
                table: table.to_string(),
                space: Space::Physical,
                start: pa,
                size,
            }),
        }
    }

    pub(crate) fn ensure_non_allocated(&self, table: &str, pa: u64, size: u64) -> Result<()> {
        if self.non_allocated.is_region_available(pa, size) {
            Ok(())
        } else {
            Err(LayoutError::RegionUnavailable {
                table: table.to_string(),
                space: Space::Physical,
                start: pa,
                size,
            })
        }
    }

    /// `unmapped -> mapped + non-allocated`.
    pub(crate) fn map(&mut self, pa: u64, size: u64) -> Result<()> {
        self.unmapped.remove_region(pa, size)?;
        self.mapped.add_region(pa, size, ())?;
        self.non_allocated.add_region(pa, size, ())?;
        Ok(())
    }

    /// `non-allocated -> allocated`.
    pub(crate) fn reserve(&mut self, pa: u64, size: u64) -> Result<()> {
        self.non_allocated.remove_region(pa, size)?;
        self.allocated.add_region(pa, size, ())?;
        Ok(())
    }

    /// `allocated -> non-allocated`.
    pub(crate) fn release(&mut self, pa: u64, size: u64) -> Result<()> {
        self.allocated.remove_region(pa, size)?;
        self.non_allocated.add_region(pa, size, ())?;
        Ok(())
    }

    /// Verify `unmapped ⊎ mapped` tiles the range and `allocated ⊎ non-allocated` tiles `mapped`.
    pub fn check_partition(&self) -> Result<()> {
        let tiled = covers_exactly(
            self.base(),
            self.end(),
            self.unmapped.spans().chain(self.mapped.spans()),
        );
        let split = is_partition_of(
            self.mapped.spans(),
            self.allocated.spans().chain(self.non_allocated.spans()),
        );
        let typed = self.unmapped.intervals().iter().all(|region| {
            let range = self.partition_range(region.tag);
            region.start >= range.start && region.end() <= range.end
        });
        if tiled && split && typed {
            Ok(())
        } else {
            Err(LayoutError::PartitionViolated {
                pool: POOL.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn partitions_are_disjoint_and_typed() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let phys = PhysicalAddressSpace::new(0x8000_0000, 0x10_0000, 0x10_0000).unwrap();
        assert_eq!(
            phys.partition_range(PaPartition::Data),
            0x8010_0000..0x8020_0000
        );

        for _ in 0..32 {
            let pa = phys
                .find_unmapped("t", PageType::Code, 0x1000, 12, &mut rng)
                .unwrap();
            assert!(phys.partition_range(PaPartition::Code).contains(&pa));
            let pa = phys
                .find_unmapped("t", PageType::Device, 0x1000, 12, &mut rng)
                .unwrap();
            assert!(phys.partition_range(PaPartition::Data).contains(&pa));
        }
        phys.check_partition().unwrap();
    }

    #[test]
    fn state_transitions_keep_partition() {
        let mut phys = PhysicalAddressSpace::new(0, 0x4000, 0x4000).unwrap();
        phys.map(0x1000, 0x2000).unwrap();
        phys.reserve(0x1800, 0x100).unwrap();
        phys.check_partition().unwrap();
        assert_eq!(phys.allocated().free_bytes(), 0x100);
        assert_eq!(phys.non_allocated().free_bytes(), 0x1f00);

        phys.release(0x1800, 0x100).unwrap();
        assert_eq!(phys.non_allocated().intervals().len(), 1);
        phys.check_partition().unwrap();
    }

    #[test]
    fn exhausted_partition_names_the_pool() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let phys = PhysicalAddressSpace::new(0, 0x1000, 0x1000).unwrap();
        let err = phys
            .find_unmapped("core0", PageType::Code, 0x2000, 12, &mut rng)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("core0"), "{msg}");
        assert!(msg.contains("pa-unmapped"), "{msg}");
        assert!(msg.contains("0x2000"), "{msg}");
    }
}
