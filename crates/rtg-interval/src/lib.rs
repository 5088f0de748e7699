//! Free-interval bookkeeping with randomized, alignment-aware allocation.
//!
//! An [`IntervalSet`] tracks the *free* portion of one fixed range `[base, base + size)` as a
//! sorted list of disjoint [`Interval`]s. Allocation does not use first-fit: among all free
//! intervals able to host a request at the requested alignment, one is picked uniformly at random,
//! then a uniformly random aligned offset inside it. Generated test programs rely on that address
//! diversity, so the random choice is part of the contract.
//!
//! Intervals carry a tag (`()` when unused). Tags partition one set into sub-views: intervals with
//! different tags never coalesce and queries can be restricted to a subset of tags.

#![forbid(unsafe_code)]

mod error;

use std::ops::Range;

use rand::Rng;
use serde::Serialize;

pub use error::{IntervalError, Result};

/// Largest supported alignment, in address bits.
pub const MAX_ALIGNMENT_BITS: u8 = 63;

/// A contiguous `[start, start + size)` range with an attribute tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Interval<T = ()> {
    pub start: u64,
    pub size: u64,
    pub tag: T,
}

impl<T> Interval<T> {
    pub fn new(start: u64, size: u64, tag: T) -> Self {
        Self { start, size, tag }
    }

    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Whether `[start, start + size)` lies entirely inside this interval.
    pub fn covers(&self, start: u64, size: u64) -> bool {
        start >= self.start
            && start
                .checked_add(size)
                .is_some_and(|end| end <= self.end())
    }

    fn touches(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end()
    }
}

impl Interval {
    pub fn untagged(start: u64, size: u64) -> Self {
        Self::new(start, size, ())
    }
}

/// `2^alignment_bits - 1`, or `None` when the alignment exceeds the address width.
fn alignment_mask(alignment_bits: u8) -> Option<u64> {
    1u64.checked_shl(u32::from(alignment_bits)).map(|unit| unit - 1)
}

/// Round `value` up to a multiple of `2^alignment_bits`, or `None` on overflow.
pub fn align_up(value: u64, alignment_bits: u8) -> Option<u64> {
    match alignment_mask(alignment_bits) {
        Some(mask) => value.checked_add(mask).map(|v| v & !mask),
        None => (value == 0).then_some(0),
    }
}

pub fn align_down(value: u64, alignment_bits: u8) -> u64 {
    alignment_mask(alignment_bits).map_or(0, |mask| value & !mask)
}

pub fn is_aligned(value: u64, alignment_bits: u8) -> bool {
    alignment_mask(alignment_bits).map_or(value == 0, |mask| value & mask == 0)
}

/// First aligned start and number of aligned start slots for `size` bytes inside `[start, end)`.
fn placement(start: u64, end: u64, size: u64, alignment_bits: u8) -> Option<(u64, u64)> {
    let last = end.checked_sub(size)?;
    if last < start {
        return None;
    }
    let first = align_up(start, alignment_bits)?;
    let last = align_down(last, alignment_bits);
    if first > last {
        return None;
    }
    Some((first, ((last - first) >> alignment_bits).saturating_add(1)))
}

/// Choose a region of `size` bytes aligned to `2^alignment_bits` from `candidates`.
///
/// One admissible candidate is chosen uniformly, then one admissible aligned offset inside it.
/// Returns `None` if no candidate can host the request.
pub fn pick_aligned<T, R>(
    candidates: impl IntoIterator<Item = Interval<T>>,
    size: u64,
    alignment_bits: u8,
    rng: &mut R,
) -> Option<Interval<T>>
where
    T: Copy,
    R: Rng + ?Sized,
{
    if alignment_bits > MAX_ALIGNMENT_BITS {
        return None;
    }
    let admissible: Vec<(T, u64, u64)> = candidates
        .into_iter()
        .filter_map(|iv| {
            placement(iv.start, iv.end(), size, alignment_bits)
                .map(|(first, slots)| (iv.tag, first, slots))
        })
        .collect();
    if admissible.is_empty() {
        return None;
    }

    let (tag, first, slots) = admissible[rng.gen_range(0..admissible.len())];
    let slot = rng.gen_range(0..slots);
    Some(Interval::new(first + (slot << alignment_bits), size, tag))
}

/// Whether `spans` tile `[base, end)` exactly: no gaps, no overlaps, nothing outside.
pub fn covers_exactly(base: u64, end: u64, spans: impl IntoIterator<Item = (u64, u64)>) -> bool {
    is_partition_of([(base, end)], spans)
}

/// Whether the pairwise-disjoint `parts` cover exactly the same addresses as `whole`.
pub fn is_partition_of(
    whole: impl IntoIterator<Item = (u64, u64)>,
    parts: impl IntoIterator<Item = (u64, u64)>,
) -> bool {
    let mut parts: Vec<(u64, u64)> = parts.into_iter().filter(|(s, e)| s < e).collect();
    parts.sort_unstable();
    if parts.windows(2).any(|w| w[0].1 > w[1].0) {
        return false;
    }
    merge_spans(whole) == merge_spans(parts)
}

fn merge_spans(spans: impl IntoIterator<Item = (u64, u64)>) -> Vec<(u64, u64)> {
    let mut spans: Vec<(u64, u64)> = spans.into_iter().filter(|(s, e)| s < e).collect();
    spans.sort_unstable();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if last.1 >= start => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Free-space tracker over one fixed address range.
///
/// Invariants:
/// - Free intervals are stored in ascending order and never overlap.
/// - Two free intervals with the same tag never touch (adjacent same-tag intervals are merged).
/// - Every free interval lies inside `[base, base + size)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntervalSet<T = ()> {
    label: String,
    base: u64,
    size: u64,
    free: Vec<Interval<T>>,
    consumed: Vec<Interval<T>>,
}

impl<T: Copy + Eq> IntervalSet<T> {
    /// A set over `[base, base + size)` with nothing free.
    pub fn empty(label: impl Into<String>, base: u64, size: u64) -> Result<Self> {
        let label = label.into();
        if size == 0 {
            return Err(IntervalError::InvalidSize { pool: label, size });
        }
        if base.checked_add(size).is_none() {
            return Err(IntervalError::RangeOverflow {
                pool: label,
                base,
                size,
            });
        }
        Ok(Self {
            label,
            base,
            size,
            free: Vec::new(),
            consumed: Vec::new(),
        })
    }

    /// A set over `[base, base + size)` that starts out entirely free under `tag`.
    pub fn full(label: impl Into<String>, base: u64, size: u64, tag: T) -> Result<Self> {
        let mut set = Self::empty(label, base, size)?;
        set.free.push(Interval::new(base, size, tag));
        Ok(set)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Total size of the tracked range, free or not.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn intervals(&self) -> &[Interval<T>] {
        &self.free
    }

    /// Regions handed out by [`IntervalSet::allocate`], in allocation order.
    pub fn consumed(&self) -> &[Interval<T>] {
        &self.consumed
    }

    pub fn tagged(&self, tag: T) -> impl Iterator<Item = &Interval<T>> + '_ {
        self.free.iter().filter(move |iv| iv.tag == tag)
    }

    pub fn spans(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.free.iter().map(|iv| (iv.start, iv.end()))
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|iv| iv.size).sum()
    }

    pub fn largest_free(&self) -> u64 {
        self.free.iter().map(|iv| iv.size).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// The single free interval containing all of `[start, start + size)`, if any.
    pub fn containing(&self, start: u64, size: u64) -> Option<&Interval<T>> {
        if size == 0 {
            return None;
        }
        let idx = self.free.partition_point(|iv| iv.end() <= start);
        self.free.get(idx).filter(|iv| iv.covers(start, size))
    }

    /// True iff one free interval covers the whole requested range.
    pub fn is_region_available(&self, start: u64, size: u64) -> bool {
        self.containing(start, size).is_some()
    }

    /// Pick a random free region of `size` bytes aligned to `2^alignment_bits`.
    ///
    /// `Ok(None)` means no free interval qualifies; `Err` is reserved for malformed requests.
    pub fn find_region<R: Rng + ?Sized>(
        &self,
        size: u64,
        alignment_bits: u8,
        rng: &mut R,
    ) -> Result<Option<Interval<T>>> {
        self.find_region_matching(size, alignment_bits, self.base..self.end(), |_| true, rng)
    }

    /// Like [`IntervalSet::find_region`], restricted to intervals whose tag satisfies `matches`
    /// and clipped to `window`.
    pub fn find_region_matching<R, F>(
        &self,
        size: u64,
        alignment_bits: u8,
        window: Range<u64>,
        matches: F,
        rng: &mut R,
    ) -> Result<Option<Interval<T>>>
    where
        R: Rng + ?Sized,
        F: Fn(&T) -> bool,
    {
        self.check_request(size, alignment_bits)?;

        let candidates = self
            .free
            .iter()
            .filter(|iv| matches(&iv.tag))
            .filter_map(|iv| {
                let start = iv.start.max(window.start);
                let end = iv.end().min(window.end);
                (start < end).then(|| Interval::new(start, end - start, iv.tag))
            });
        let found = pick_aligned(candidates, size, alignment_bits, rng);
        if let Some(region) = &found {
            tracing::trace!(pool = %self.label, start = region.start, size, "picked free region");
        }
        Ok(found)
    }

    /// Find a region with [`IntervalSet::find_region`] and take it out of the free collection.
    ///
    /// On failure the set is left untouched.
    pub fn allocate<R: Rng + ?Sized>(
        &mut self,
        size: u64,
        alignment_bits: u8,
        rng: &mut R,
    ) -> Result<Interval<T>> {
        let Some(region) = self.find_region(size, alignment_bits, rng)? else {
            return Err(self.exhausted(size, alignment_bits));
        };
        self.remove_region(region.start, region.size)?;
        self.consumed.push(region);
        Ok(region)
    }

    /// Build the capacity error this set reports for an unsatisfiable request.
    pub fn exhausted(&self, size: u64, alignment_bits: u8) -> IntervalError {
        IntervalError::Exhausted {
            pool: self.label.clone(),
            size,
            alignment_bits,
            free: self.free_bytes(),
            intervals: self.free.len(),
            largest: self.largest_free(),
        }
    }

    /// Insert `[start, start + size)` into the free collection under `tag`, merging with any
    /// overlapping or adjacent free interval carrying the same tag.
    ///
    /// Overlap with a free interval of a different tag is rejected.
    pub fn add_region(&mut self, start: u64, size: u64, tag: T) -> Result<()> {
        let end = self.check_bounds(start, size)?;
        if self
            .free
            .iter()
            .any(|iv| iv.tag != tag && iv.start < end && start < iv.end())
        {
            return Err(IntervalError::TagConflict {
                pool: self.label.clone(),
                start,
                size,
            });
        }

        let mut merged = Interval::new(start, size, tag);
        let mut out = Vec::with_capacity(self.free.len() + 1);
        for iv in self.free.drain(..) {
            if iv.tag == tag && iv.touches(merged.start, merged.end()) {
                let lo = iv.start.min(merged.start);
                let hi = iv.end().max(merged.end());
                merged = Interval::new(lo, hi - lo, tag);
            } else {
                out.push(iv);
            }
        }
        out.push(merged);

        self.free = out;
        self.compact();
        Ok(())
    }

    /// Delete `[start, start + size)` from the free collection.
    ///
    /// The range must be entirely free (it may span several adjacent intervals with different
    /// tags). Partially covered intervals are split into the remaining fragments. Returns the
    /// removed pieces with their tags.
    pub fn remove_region(&mut self, start: u64, size: u64) -> Result<Vec<Interval<T>>> {
        let end = self.check_bounds(start, size)?;

        let mut cursor = start;
        for iv in self
            .free
            .iter()
            .filter(|iv| iv.start < end && start < iv.end())
        {
            if iv.start > cursor {
                break;
            }
            cursor = cursor.max(iv.end());
        }
        if cursor < end {
            return Err(IntervalError::NotFree {
                pool: self.label.clone(),
                start,
                size,
            });
        }

        let mut removed = Vec::new();
        let mut out = Vec::with_capacity(self.free.len() + 1);
        for iv in self.free.drain(..) {
            if iv.end() <= start || iv.start >= end {
                out.push(iv);
                continue;
            }

            // Left remainder
            if iv.start < start {
                out.push(Interval::new(iv.start, start - iv.start, iv.tag));
            }

            // Right remainder
            if iv.end() > end {
                out.push(Interval::new(end, iv.end() - end, iv.tag));
            }

            let lo = iv.start.max(start);
            let hi = iv.end().min(end);
            removed.push(Interval::new(lo, hi - lo, iv.tag));
        }
        out.sort_by_key(|iv| iv.start);
        self.free = out;
        Ok(removed)
    }

    /// Free ranges present in both `self` and `other`, tagged with both source tags.
    pub fn overlap_with<U: Copy + Eq>(&self, other: &IntervalSet<U>) -> Vec<Interval<(T, U)>> {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.free.len() && j < other.free.len() {
            let a = &self.free[i];
            let b = &other.free[j];
            let lo = a.start.max(b.start);
            let hi = a.end().min(b.end());
            if lo < hi {
                out.push(Interval::new(lo, hi - lo, (a.tag, b.tag)));
            }
            if a.end() <= b.end() {
                i += 1;
            } else {
                j += 1;
            }
        }
        out
    }

    fn check_request(&self, size: u64, alignment_bits: u8) -> Result<()> {
        if size == 0 {
            return Err(IntervalError::InvalidSize {
                pool: self.label.clone(),
                size,
            });
        }
        if alignment_bits > MAX_ALIGNMENT_BITS {
            return Err(IntervalError::InvalidAlignment {
                pool: self.label.clone(),
                alignment_bits,
            });
        }
        Ok(())
    }

    fn check_bounds(&self, start: u64, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(IntervalError::InvalidSize {
                pool: self.label.clone(),
                size,
            });
        }
        match start.checked_add(size) {
            Some(end) if start >= self.base && end <= self.end() => Ok(end),
            _ => Err(IntervalError::OutOfRange {
                pool: self.label.clone(),
                start,
                size,
                base: self.base,
                end: self.end(),
            }),
        }
    }

    fn compact(&mut self) {
        if self.free.len() <= 1 {
            return;
        }

        self.free.sort_by_key(|iv| iv.start);

        let mut compacted: Vec<Interval<T>> = Vec::with_capacity(self.free.len());
        for iv in self.free.drain(..) {
            match compacted.last_mut() {
                Some(cur) if cur.tag == iv.tag && cur.touches(iv.start, iv.end()) => {
                    let hi = cur.end().max(iv.end());
                    cur.size = hi - cur.start;
                }
                _ => compacted.push(iv),
            }
        }
        self.free = compacted;
    }
}

#[cfg(test)]
mod proptests;
