use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target instruction-set architecture of the generated test programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Arch {
    #[default]
    #[serde(rename = "riscv64")]
    RiscV64,
    #[serde(rename = "aarch64")]
    AArch64,
    #[serde(rename = "x86_64")]
    X86_64,
}

/// Page size classes a page table can map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PageSize {
    #[serde(rename = "4k")]
    Size4K,
    #[serde(rename = "2m")]
    Size2M,
    #[serde(rename = "1g")]
    Size1G,
}

impl PageSize {
    pub const fn bits(self) -> u8 {
        match self {
            PageSize::Size4K => 12,
            PageSize::Size2M => 21,
            PageSize::Size1G => 30,
        }
    }

    pub const fn bytes(self) -> u64 {
        1 << self.bits()
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PageSize::Size4K => "4KiB",
            PageSize::Size2M => "2MiB",
            PageSize::Size1G => "1GiB",
        })
    }
}

/// Privilege level a page table belongs to.
///
/// The names are architecture neutral; [`Arch::context_name`] gives the architectural spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    /// Highest privilege level (RISC-V M-mode, AArch64 EL3).
    Monitor,
    Supervisor,
    User,
}

impl ExecutionContext {
    pub fn is_user(self) -> bool {
        self == ExecutionContext::User
    }
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::RiscV64 => "riscv64",
            Arch::AArch64 => "aarch64",
            Arch::X86_64 => "x86_64",
        }
    }

    pub fn page_sizes(self) -> &'static [PageSize] {
        &[PageSize::Size4K, PageSize::Size2M, PageSize::Size1G]
    }

    pub fn supports_page_size(self, size: PageSize) -> bool {
        self.page_sizes().contains(&size)
    }

    /// Minimum alignment of code, in address bits.
    pub fn min_code_alignment_bits(self) -> u8 {
        match self {
            Arch::RiscV64 => 3,
            Arch::AArch64 => 2,
            Arch::X86_64 => 0,
        }
    }

    pub fn pointer_bits(self) -> u32 {
        64
    }

    /// Natural alignment of a pointer-sized datum, in address bits.
    pub fn pointer_alignment_bits(self) -> u8 {
        (self.pointer_bits() / 8).trailing_zeros() as u8
    }

    /// Width of the translated virtual address space (Sv39 on RISC-V, 48-bit elsewhere).
    pub fn va_bits(self) -> u8 {
        match self {
            Arch::RiscV64 => 39,
            Arch::AArch64 | Arch::X86_64 => 48,
        }
    }

    pub fn execution_contexts(self) -> &'static [ExecutionContext] {
        match self {
            Arch::RiscV64 | Arch::AArch64 => &[
                ExecutionContext::Monitor,
                ExecutionContext::Supervisor,
                ExecutionContext::User,
            ],
            Arch::X86_64 => &[ExecutionContext::Supervisor, ExecutionContext::User],
        }
    }

    pub fn supports_context(self, context: ExecutionContext) -> bool {
        self.execution_contexts().contains(&context)
    }

    pub fn context_name(self, context: ExecutionContext) -> &'static str {
        match (self, context) {
            (Arch::RiscV64, ExecutionContext::Monitor) => "machine",
            (Arch::RiscV64, ExecutionContext::Supervisor) => "supervisor",
            (Arch::RiscV64, ExecutionContext::User) => "user",
            (Arch::AArch64, ExecutionContext::Monitor) => "el3",
            (Arch::AArch64, ExecutionContext::Supervisor) => "el1",
            (Arch::AArch64, ExecutionContext::User) => "el0",
            (Arch::X86_64, ExecutionContext::Monitor) => "smm",
            (Arch::X86_64, ExecutionContext::Supervisor) => "ring0",
            (Arch::X86_64, ExecutionContext::User) => "ring3",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "riscv64" | "rv64" => Ok(Arch::RiscV64),
            "aarch64" | "arm64" => Ok(Arch::AArch64),
            "x86_64" | "x86-64" | "amd64" => Ok(Arch::X86_64),
            other => Err(format!("unknown architecture `{other}`")),
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionContext::Monitor => "monitor",
            ExecutionContext::Supervisor => "supervisor",
            ExecutionContext::User => "user",
        })
    }
}
