use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::arch::{Arch, ExecutionContext, PageSize};
use crate::error::{LayoutError, Result};

/// Inclusive range of counts sampled uniformly by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRange {
    pub min: usize,
    pub max: usize,
}

impl CountRange {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        rng.gen_range(self.min..=self.max)
    }

    fn validate(&self, knob: &str) -> Result<()> {
        if self.min == 0 || self.min > self.max {
            return Err(invalid(format!(
                "{knob} must satisfy 1 <= min <= max (got {}..={})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Inclusive range of byte sizes sampled uniformly by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: u64,
    pub max: u64,
}

impl SizeRange {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        rng.gen_range(self.min..=self.max)
    }

    fn validate(&self, knob: &str) -> Result<()> {
        if self.min == 0 || self.min > self.max {
            return Err(invalid(format!(
                "{knob} must satisfy 1 <= min <= max (got {:#x}..={:#x})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Sizing knobs of one layout generation run.
///
/// Every field has a default, so a config file only needs to name the knobs it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    pub seed: u64,
    pub arch: Arch,
    pub cores: u32,
    /// Execution contexts that get a page table on every core. Empty means all contexts of the
    /// architecture.
    pub contexts: Vec<ExecutionContext>,
    pub phys_base: u64,
    pub phys_code_size: u64,
    pub phys_data_size: u64,
    /// Number of code page batches per page table.
    pub code_page_batches: CountRange,
    /// Number of data page batches per page table.
    pub data_page_batches: CountRange,
    /// Lower bound draw for the number of pages in one batch.
    pub sequential_pages: CountRange,
    /// Probability that a batch uses 2 MiB pages instead of 4 KiB ones.
    pub huge_page_probability: f64,
    pub code_segments: usize,
    pub data_segments: usize,
    pub code_segment_size: SizeRange,
    pub data_segment_size: SizeRange,
    pub stack_size: u64,
    pub boot_code_size: u64,
    pub cross_core_pages: usize,
    pub barrier_size: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            arch: Arch::RiscV64,
            cores: 2,
            contexts: Vec::new(),
            phys_base: 0x8000_0000,
            phys_code_size: 0x1000_0000,
            phys_data_size: 0x1000_0000,
            code_page_batches: CountRange::new(2, 4),
            data_page_batches: CountRange::new(2, 4),
            sequential_pages: CountRange::new(1, 3),
            huge_page_probability: 0.1,
            code_segments: 4,
            data_segments: 4,
            code_segment_size: SizeRange::new(0x100, 0x2000),
            data_segment_size: SizeRange::new(0x40, 0x1000),
            stack_size: 0x2000,
            boot_code_size: 0x400,
            cross_core_pages: 1,
            barrier_size: 0x40,
        }
    }
}

impl LayoutConfig {
    /// Execution contexts to create a page table for on every core.
    pub fn contexts(&self) -> Vec<ExecutionContext> {
        if self.contexts.is_empty() {
            self.arch.execution_contexts().to_vec()
        } else {
            self.contexts.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cores == 0 {
            return Err(invalid("cores must be at least 1"));
        }
        let contexts = self.contexts();
        for (i, context) in contexts.iter().enumerate() {
            if !self.arch.supports_context(*context) {
                return Err(LayoutError::UnsupportedContext {
                    arch: self.arch,
                    context: *context,
                });
            }
            if contexts[..i].contains(context) {
                return Err(invalid(format!("context {context} is listed twice")));
            }
        }

        let page = PageSize::Size4K.bytes();
        for (knob, value) in [
            ("phys_base", self.phys_base),
            ("phys_code_size", self.phys_code_size),
            ("phys_data_size", self.phys_data_size),
        ] {
            if value % page != 0 {
                return Err(invalid(format!("{knob} ({value:#x}) must be 4KiB aligned")));
            }
        }
        if self.phys_code_size == 0 || self.phys_data_size == 0 {
            return Err(invalid("physical code and data partitions must be non-empty"));
        }
        // Boot code is mapped VA=PA, so the code partition has to be reachable virtually.
        let code_end = self
            .phys_base
            .checked_add(self.phys_code_size)
            .ok_or_else(|| invalid("physical code partition overflows"))?;
        self.phys_base
            .checked_add(self.phys_code_size)
            .and_then(|end| end.checked_add(self.phys_data_size))
            .ok_or_else(|| invalid("physical address space overflows"))?;
        if code_end > 1u64 << self.arch.va_bits() {
            return Err(invalid(format!(
                "physical code partition ends at {code_end:#x}, beyond the {}-bit {} VA range",
                self.arch.va_bits(),
                self.arch
            )));
        }

        self.code_page_batches.validate("code_page_batches")?;
        self.data_page_batches.validate("data_page_batches")?;
        self.sequential_pages.validate("sequential_pages")?;
        self.code_segment_size.validate("code_segment_size")?;
        self.data_segment_size.validate("data_segment_size")?;
        // Preserved data segments each get one pointer-sized item.
        let word = 1u64 << self.arch.pointer_alignment_bits();
        if self.data_segments > 1 && self.data_segment_size.min < word {
            return Err(invalid(format!(
                "data_segment_size.min ({:#x}) cannot hold a {word}-byte data item",
                self.data_segment_size.min
            )));
        }
        if !(0.0..=1.0).contains(&self.huge_page_probability) {
            return Err(invalid(format!(
                "huge_page_probability must be within [0, 1] (got {})",
                self.huge_page_probability
            )));
        }
        if self.stack_size == 0 || self.boot_code_size == 0 {
            return Err(invalid("stack_size and boot_code_size must be non-zero"));
        }

        if self.cross_core_pages > 0 {
            // Every barrier must still fit after the others were placed at random offsets.
            let needed = self
                .barrier_size
                .checked_add(1 << self.arch.pointer_alignment_bits())
                .and_then(|slot| slot.checked_mul(2 * self.cross_core_pages as u64));
            if self.barrier_size == 0 || needed.map_or(true, |needed| needed > page) {
                return Err(invalid(format!(
                    "{} barriers of {:#x} bytes do not reliably fit in {} cross-core 4KiB pages",
                    self.cross_core_pages, self.barrier_size, self.cross_core_pages
                )));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> LayoutError {
    LayoutError::InvalidConfig(message.into())
}
