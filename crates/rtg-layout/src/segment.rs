use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rtg_interval::{is_aligned, IntervalSet};
use serde::{Deserialize, Serialize};

use crate::arch::Arch;
use crate::error::{check_alignment, LayoutError, Result, Space};
use crate::page::{CrossCoreGroupId, Mapping, Page, PageType, RegionTag};
use crate::page_table::{PageTable, PageTableId};
use crate::phys::PhysicalAddressSpace;

/// Logical kind of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Code that runs before translation is enabled.
    BootCode,
    Code,
    DataShared,
    /// Data whose individual items are carved out and addressed separately.
    DataPreserve,
    Stack,
}

impl MemoryType {
    pub fn page_type(self) -> PageType {
        match self {
            MemoryType::BootCode | MemoryType::Code => PageType::Code,
            MemoryType::DataShared | MemoryType::DataPreserve | MemoryType::Stack => PageType::Data,
        }
    }

    pub fn is_code(self) -> bool {
        self.page_type() == PageType::Code
    }

    pub fn default_alignment_bits(self, arch: Arch) -> u8 {
        match self {
            MemoryType::BootCode | MemoryType::Code => arch.min_code_alignment_bits(),
            MemoryType::Stack => 4,
            MemoryType::DataShared | MemoryType::DataPreserve => arch.pointer_alignment_bits(),
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryType::BootCode => "boot_code",
            MemoryType::Code => "code",
            MemoryType::DataShared => "data_shared",
            MemoryType::DataPreserve => "data_preserve",
            MemoryType::Stack => "stack",
        })
    }
}

/// Parameters of [`SegmentAllocator::allocate_memory_segment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequest {
    pub name: String,
    pub byte_size: u64,
    pub memory_type: MemoryType,
    /// Defaults to [`MemoryType::default_alignment_bits`]; code is never aligned below the
    /// architecture minimum.
    pub alignment_bits: Option<u8>,
    /// Require VA == PA.
    pub identity: bool,
    pub forced_va: Option<u64>,
    pub exclusive: bool,
}

impl SegmentRequest {
    pub fn new(name: impl Into<String>, byte_size: u64, memory_type: MemoryType) -> Self {
        Self {
            name: name.into(),
            byte_size,
            memory_type,
            alignment_bits: None,
            identity: false,
            forced_va: None,
            exclusive: true,
        }
    }

    pub fn aligned(mut self, alignment_bits: u8) -> Self {
        self.alignment_bits = Some(alignment_bits);
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }

    pub fn at(mut self, va: u64) -> Self {
        self.forced_va = Some(va);
        self
    }

    /// Mark the segment as usable by more than one consumer.
    pub fn shared(mut self) -> Self {
        self.exclusive = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SegmentId {
    pub(crate) table: PageTableId,
    pub(crate) index: usize,
}

impl SegmentId {
    pub fn table(self) -> PageTableId {
        self.table
    }
}

/// One emitted instruction unit inside a code segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeUnit {
    pub label: Option<String>,
    pub va: u64,
    pub byte_size: u64,
}

#[derive(Debug, Clone)]
pub struct CodeSegment {
    start_label: String,
    units: Vec<CodeUnit>,
    emitted: u64,
}

impl CodeSegment {
    pub fn start_label(&self) -> &str {
        &self.start_label
    }

    pub fn units(&self) -> &[CodeUnit] {
        &self.units
    }

    pub fn emitted_bytes(&self) -> u64 {
        self.emitted
    }
}

/// A named item carved out of a [`MemoryType::DataPreserve`] segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataItem {
    pub name: String,
    pub va: u64,
    pub pa: u64,
    pub byte_size: u64,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    /// Only present for `DataPreserve` segments.
    free: Option<IntervalSet>,
    items: Vec<DataItem>,
}

impl DataSegment {
    pub fn items(&self) -> &[DataItem] {
        &self.items
    }

    pub fn item(&self, name: &str) -> Option<&DataItem> {
        self.items.iter().find(|item| item.name == name)
    }

    /// Bytes still available for items, `None` if the segment does not carve items.
    pub fn free_bytes(&self) -> Option<u64> {
        self.free.as_ref().map(IntervalSet::free_bytes)
    }
}

#[derive(Debug, Clone)]
pub enum SegmentBody {
    Code(CodeSegment),
    Data(DataSegment),
}

/// Where a segment landed.
pub(crate) struct Placement {
    pub va: u64,
    pub pa: u64,
    pub byte_size: u64,
    pub pages: Vec<Arc<Page>>,
}

/// A named, typed, contiguous allocation carved out of mapped page space.
#[derive(Debug, Clone)]
pub struct Segment {
    id: SegmentId,
    name: String,
    va: u64,
    pa: u64,
    byte_size: u64,
    memory_type: MemoryType,
    alignment_bits: u8,
    exclusive: bool,
    cross_core_group: Option<CrossCoreGroupId>,
    pages: Vec<Arc<Page>>,
    body: SegmentBody,
}

impl Segment {
    pub(crate) fn new(
        id: SegmentId,
        request: &SegmentRequest,
        alignment_bits: u8,
        placement: Placement,
        cross_core_group: Option<CrossCoreGroupId>,
        table_name: &str,
    ) -> Result<Self> {
        let name = request.name.clone();
        let body = match request.memory_type {
            MemoryType::BootCode | MemoryType::Code => SegmentBody::Code(CodeSegment {
                start_label: format!("{name}_start"),
                units: Vec::new(),
                emitted: 0,
            }),
            MemoryType::DataPreserve => SegmentBody::Data(DataSegment {
                free: Some(IntervalSet::full(
                    format!("{table_name} {name} items"),
                    placement.va,
                    placement.byte_size,
                    (),
                )?),
                items: Vec::new(),
            }),
            MemoryType::DataShared | MemoryType::Stack => SegmentBody::Data(DataSegment {
                free: None,
                items: Vec::new(),
            }),
        };

        Ok(Self {
            id,
            name,
            va: placement.va,
            pa: placement.pa,
            byte_size: placement.byte_size,
            memory_type: request.memory_type,
            alignment_bits,
            exclusive: request.exclusive,
            cross_core_group,
            pages: placement.pages,
            body,
        })
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn table(&self) -> PageTableId {
        self.id.table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn va_address(&self) -> u64 {
        self.va
    }

    pub fn pa_address(&self) -> u64 {
        self.pa
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn va_end(&self) -> u64 {
        self.va + self.byte_size
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn alignment_bits(&self) -> u8 {
        self.alignment_bits
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_cross_core(&self) -> bool {
        self.cross_core_group.is_some()
    }

    pub fn cross_core_group(&self) -> Option<CrossCoreGroupId> {
        self.cross_core_group
    }

    /// Pages the segment spans, in VA order.
    pub fn pages(&self) -> &[Arc<Page>] {
        &self.pages
    }

    pub fn body(&self) -> &SegmentBody {
        &self.body
    }

    pub fn code(&self) -> Option<&CodeSegment> {
        match &self.body {
            SegmentBody::Code(code) => Some(code),
            SegmentBody::Data(_) => None,
        }
    }

    pub fn data(&self) -> Option<&DataSegment> {
        match &self.body {
            SegmentBody::Data(data) => Some(data),
            SegmentBody::Code(_) => None,
        }
    }

    pub fn translate(&self, va: u64) -> Option<u64> {
        (va >= self.va && va < self.va_end()).then(|| self.pa + (va - self.va))
    }

    /// Append an instruction unit after the last one and return its VA.
    pub fn append_code(&mut self, label: Option<String>, byte_size: u64) -> Result<u64> {
        let SegmentBody::Code(code) = &mut self.body else {
            return Err(LayoutError::WrongSegmentKind {
                segment: self.name.clone(),
                memory_type: self.memory_type,
                operation: "code emission",
            });
        };
        let remaining = self.byte_size - code.emitted;
        if byte_size > remaining {
            return Err(LayoutError::CodeOverflow {
                segment: self.name.clone(),
                size: byte_size,
                remaining,
            });
        }

        let va = self.va + code.emitted;
        code.emitted += byte_size;
        code.units.push(CodeUnit {
            label,
            va,
            byte_size,
        });
        Ok(va)
    }

    /// Carve a named item out of a `DataPreserve` segment at a random aligned offset.
    pub fn allocate_data_item<R: Rng + ?Sized>(
        &mut self,
        name: impl Into<String>,
        byte_size: u64,
        alignment_bits: u8,
        rng: &mut R,
    ) -> Result<DataItem> {
        let name = name.into();
        let SegmentBody::Data(DataSegment {
            free: Some(free),
            items,
        }) = &mut self.body
        else {
            return Err(LayoutError::WrongSegmentKind {
                segment: self.name.clone(),
                memory_type: self.memory_type,
                operation: "data items",
            });
        };
        if items.iter().any(|item| item.name == name) {
            return Err(LayoutError::DuplicateDataItem {
                segment: self.name.clone(),
                name,
            });
        }

        let region = free.allocate(byte_size, alignment_bits, rng)?;
        let item = DataItem {
            name,
            va: region.start,
            pa: self.pa + (region.start - self.va),
            byte_size,
        };
        items.push(item.clone());
        Ok(item)
    }
}

/// Registry of the segments carved out of one page table.
#[derive(Debug, Clone)]
pub struct SegmentManager {
    table: PageTableId,
    table_name: String,
    slots: Vec<Option<Segment>>,
    by_name: HashMap<String, usize>,
}

impl SegmentManager {
    pub(crate) fn new(table: PageTableId, table_name: String) -> Self {
        Self {
            table,
            table_name,
            slots: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Live segments in allocation order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn get(&self, id: SegmentId) -> Result<&Segment> {
        self.slots
            .get(id.index)
            .and_then(Option::as_ref)
            .filter(|_| id.table == self.table)
            .ok_or_else(|| self.stale(id))
    }

    pub fn get_mut(&mut self, id: SegmentId) -> Result<&mut Segment> {
        if id.table != self.table {
            return Err(self.stale(id));
        }
        let err = self.stale(id);
        self.slots
            .get_mut(id.index)
            .and_then(Option::as_mut)
            .ok_or(err)
    }

    pub fn get_segment(&self, name: &str) -> Result<&Segment> {
        let id = self.lookup(name)?;
        self.get(id)
    }

    pub fn get_segment_mut(&mut self, name: &str) -> Result<&mut Segment> {
        let id = self.lookup(name)?;
        self.get_mut(id)
    }

    /// Segments of any of `types`, optionally only the non-exclusive ones.
    pub fn get_segments(&self, types: &[MemoryType], non_exclusive_only: bool) -> Vec<&Segment> {
        self.segments()
            .filter(|segment| types.contains(&segment.memory_type))
            .filter(|segment| !non_exclusive_only || !segment.exclusive)
            .collect()
    }

    /// Initial stack pointer (top of the stack) of the table's single stack segment.
    pub fn get_stack_start_address(&self) -> Result<u64> {
        match self.get_segments(&[MemoryType::Stack], false).as_slice() {
            [stack] => Ok(stack.va_end()),
            stacks => Err(LayoutError::SegmentMultiplicity {
                table: self.table_name.clone(),
                memory_type: MemoryType::Stack,
                found: stacks.len(),
            }),
        }
    }

    fn lookup(&self, name: &str) -> Result<SegmentId> {
        self.by_name
            .get(name)
            .map(|&index| SegmentId {
                table: self.table,
                index,
            })
            .ok_or_else(|| LayoutError::UnknownSegment {
                table: self.table_name.clone(),
                name: name.to_string(),
            })
    }

    fn stale(&self, id: SegmentId) -> LayoutError {
        LayoutError::StaleSegment {
            table: self.table_name.clone(),
            index: id.index,
        }
    }

    pub(crate) fn ensure_unique(&self, name: &str) -> Result<()> {
        if self.by_name.contains_key(name) {
            Err(LayoutError::DuplicateSegment {
                table: self.table_name.clone(),
                name: name.to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub(crate) fn next_id(&self) -> SegmentId {
        SegmentId {
            table: self.table,
            index: self.slots.len(),
        }
    }

    pub(crate) fn insert(&mut self, segment: Segment) -> SegmentId {
        let id = segment.id;
        self.by_name.insert(segment.name.clone(), id.index);
        self.slots.push(Some(segment));
        id
    }

    pub(crate) fn remove(&mut self, id: SegmentId) -> Result<Segment> {
        let err = self.stale(id);
        let segment = self
            .slots
            .get_mut(id.index)
            .and_then(Option::take)
            .ok_or(err)?;
        self.by_name.remove(&segment.name);
        Ok(segment)
    }
}

/// Mutable view over one page table, its segments and the shared physical space.
///
/// Every segment operation goes through here so that the virtual and physical halves of a state
/// change are applied together.
pub struct SegmentAllocator<'a> {
    pub(crate) arch: Arch,
    pub(crate) table: &'a mut PageTable,
    pub(crate) segments: &'a mut SegmentManager,
    pub(crate) phys: &'a mut PhysicalAddressSpace,
    pub(crate) rng: &'a mut ChaCha8Rng,
}

impl SegmentAllocator<'_> {
    pub fn table(&self) -> &PageTable {
        &*self.table
    }

    pub fn segments(&self) -> &SegmentManager {
        &*self.segments
    }

    /// Carve a segment out of the table's mapped, non-allocated space.
    pub fn allocate_memory_segment(&mut self, request: &SegmentRequest) -> Result<SegmentId> {
        let size = request.byte_size;
        if size == 0 {
            return Err(LayoutError::InvalidSegmentSize {
                name: request.name.clone(),
                size,
            });
        }
        self.segments.ensure_unique(&request.name)?;

        let memory_type = request.memory_type;
        let page_type = memory_type.page_type();
        let mut alignment_bits = request
            .alignment_bits
            .unwrap_or_else(|| memory_type.default_alignment_bits(self.arch));
        if memory_type.is_code() {
            alignment_bits = alignment_bits.max(self.arch.min_code_alignment_bits());
        }
        check_alignment(alignment_bits)?;

        let identity = request.identity;
        let matches = move |tag: &RegionTag| {
            tag.page_type == page_type
                && match tag.mapping {
                    Mapping::Identity => true,
                    Mapping::Regular => !identity,
                    Mapping::CrossCore => false,
                }
        };

        let pool = self.table.non_allocated();
        let va = match request.forced_va {
            Some(va) => {
                if !is_aligned(va, alignment_bits) {
                    return Err(LayoutError::MisalignedAddress {
                        address: va,
                        alignment_bits,
                    });
                }
                match pool.containing(va, size) {
                    Some(region) if matches(&region.tag) => va,
                    _ => {
                        return Err(LayoutError::RegionUnavailable {
                            table: self.table.name().to_string(),
                            space: Space::Virtual,
                            start: va,
                            size,
                        })
                    }
                }
            }
            None => {
                let found = pool.find_region_matching(
                    size,
                    alignment_bits,
                    pool.base()..pool.end(),
                    matches,
                    &mut *self.rng,
                )?;
                match found {
                    Some(region) => region.start,
                    None => {
                        let sizes: Vec<u64> = pool
                            .intervals()
                            .iter()
                            .filter(|region| matches(&region.tag))
                            .map(|region| region.size)
                            .collect();
                        return Err(LayoutError::SegmentSpaceExhausted {
                            table: self.table.name().to_string(),
                            name: request.name.clone(),
                            memory_type,
                            page_type,
                            size,
                            alignment_bits,
                            identity,
                            free: sizes.iter().sum(),
                            largest: sizes.iter().copied().max().unwrap_or(0),
                        });
                    }
                }
            }
        };

        let (pa, pages) = self.table.translate_range(va, size)?;
        if identity && pa != va {
            return Err(LayoutError::IdentityViolated { va, pa });
        }
        self.phys.ensure_non_allocated(self.table.name(), pa, size)?;

        let id = self.segments.next_id();
        let placement = Placement {
            va,
            pa,
            byte_size: size,
            pages,
        };
        let segment = Segment::new(
            id,
            request,
            alignment_bits,
            placement,
            None,
            self.table.name(),
        )?;

        self.table.reserve(va, size)?;
        self.phys.reserve(pa, size)?;
        self.segments.insert(segment);

        tracing::debug!(
            table = %self.table.name(),
            segment = %request.name,
            %memory_type,
            va,
            pa,
            size,
            "allocated segment"
        );
        Ok(id)
    }

    /// Carve a named item out of a `DataPreserve` segment of this table.
    pub fn allocate_data_item(
        &mut self,
        id: SegmentId,
        name: impl Into<String>,
        byte_size: u64,
        alignment_bits: Option<u8>,
    ) -> Result<DataItem> {
        let alignment_bits = alignment_bits.unwrap_or(self.arch.pointer_alignment_bits());
        check_alignment(alignment_bits)?;
        self.segments
            .get_mut(id)?
            .allocate_data_item(name, byte_size, alignment_bits, &mut *self.rng)
    }

    /// Return a segment's bytes to the non-allocated pools and forget it.
    pub fn release_segment(&mut self, id: SegmentId) -> Result<()> {
        let segment = self.segments.get(id)?;
        if segment.is_cross_core() {
            return Err(LayoutError::CrossCoreRelease {
                segment: segment.name.clone(),
            });
        }
        let (va, pa, size) = (segment.va, segment.pa, segment.byte_size);

        self.table.release(va, size)?;
        self.phys.release(pa, size)?;
        let segment = self.segments.remove(id)?;

        tracing::debug!(table = %self.table.name(), segment = %segment.name, va, pa, size, "released segment");
        Ok(())
    }
}
