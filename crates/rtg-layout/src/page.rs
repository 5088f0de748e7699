use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::arch::{ExecutionContext, PageSize};
use crate::phys::PaPartition;

/// What a page holds. Code and data never share physical pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageType {
    Code,
    Data,
    Device,
    System,
}

impl PageType {
    /// Physical partition backing pages of this type.
    pub fn partition(self) -> PaPartition {
        match self {
            PageType::Code => PaPartition::Code,
            PageType::Data | PageType::Device | PageType::System => PaPartition::Data,
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PageType::Code => "code",
            PageType::Data => "data",
            PageType::Device => "device",
            PageType::System => "system",
        })
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PagePermissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cacheability {
    WriteBack,
    WriteThrough,
    Uncached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shareability {
    NonShareable,
    Inner,
    Outer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    Secure,
    NonSecure,
}

/// Translation attributes recorded on a [`Page`].
///
/// These are bookkeeping for the emission stage; nothing here models a hardware walker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageAttributes {
    pub permissions: PagePermissions,
    pub cacheability: Cacheability,
    pub shareability: Shareability,
    pub security: Security,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

impl PageAttributes {
    /// Default attributes for a page of `page_type` owned by a `context` page table.
    pub fn for_page(page_type: PageType, context: ExecutionContext) -> Self {
        let (mut permissions, cacheability, shareability) = match page_type {
            PageType::Code => (
                PagePermissions::READ | PagePermissions::EXECUTE,
                Cacheability::WriteBack,
                Shareability::Inner,
            ),
            PageType::Data => (
                PagePermissions::READ | PagePermissions::WRITE,
                Cacheability::WriteBack,
                Shareability::Inner,
            ),
            PageType::Device => (
                PagePermissions::READ | PagePermissions::WRITE,
                Cacheability::Uncached,
                Shareability::Outer,
            ),
            PageType::System => (
                PagePermissions::READ | PagePermissions::WRITE,
                Cacheability::WriteBack,
                Shareability::NonShareable,
            ),
        };
        if context.is_user() {
            permissions |= PagePermissions::USER;
        }
        let security = match context {
            ExecutionContext::Monitor => Security::Secure,
            ExecutionContext::Supervisor | ExecutionContext::User => Security::NonSecure,
        };

        Self {
            permissions,
            cacheability,
            shareability,
            security,
            custom: BTreeMap::new(),
        }
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }
}

/// How a page's VA relates to its PA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mapping {
    Regular,
    /// VA == PA, usable before translation is enabled.
    Identity,
    /// One physical region shared by every core's page table.
    CrossCore,
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mapping::Regular => "regular",
            Mapping::Identity => "identity",
            Mapping::CrossCore => "cross-core",
        })
    }
}

/// Pages mapped by the same `allocate_page` call share a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BatchId(pub(crate) u32);

impl BatchId {
    pub fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CrossCoreGroupId(pub(crate) usize);

impl CrossCoreGroupId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Tag of a mapped-but-unallocated VA region.
///
/// Regions only coalesce within one batch, so a segment never straddles two batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RegionTag {
    pub page_type: PageType,
    pub mapping: Mapping,
    pub batch: BatchId,
}

/// One mapped page. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub(crate) va: u64,
    pub(crate) pa: u64,
    pub(crate) size: PageSize,
    pub(crate) page_type: PageType,
    pub(crate) mapping: Mapping,
    pub(crate) attributes: PageAttributes,
    pub(crate) batch: BatchId,
    pub(crate) cross_core_group: Option<CrossCoreGroupId>,
}

impl Page {
    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn pa(&self) -> u64 {
        self.pa
    }

    pub fn size(&self) -> PageSize {
        self.size
    }

    pub fn bytes(&self) -> u64 {
        self.size.bytes()
    }

    pub fn va_end(&self) -> u64 {
        self.va + self.bytes()
    }

    pub fn pa_end(&self) -> u64 {
        self.pa + self.bytes()
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn mapping(&self) -> Mapping {
        self.mapping
    }

    pub fn is_cross_core(&self) -> bool {
        self.mapping == Mapping::CrossCore
    }

    pub fn cross_core_group(&self) -> Option<CrossCoreGroupId> {
        self.cross_core_group
    }

    pub fn attributes(&self) -> &PageAttributes {
        &self.attributes
    }

    pub fn permissions(&self) -> PagePermissions {
        self.attributes.permissions
    }

    pub fn batch(&self) -> BatchId {
        self.batch
    }

    /// Physical address backing `va`, if this page maps it.
    pub fn translate(&self, va: u64) -> Option<u64> {
        (va >= self.va && va < self.va_end()).then(|| self.pa + (va - self.va))
    }

    pub(crate) fn region_tag(&self) -> RegionTag {
        RegionTag {
            page_type: self.page_type,
            mapping: self.mapping,
            batch: self.batch,
        }
    }
}
