// Copyright (C) Dragonball Team. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The memory-region table: an unsorted, non-overlapping set of
//! guest-physical-to-host-user-virtual mappings, rebuilt in place as guest
//! memory topology changes.

use log::trace;

use crate::range::Range;

/// A single guest-physical to host-user-virtual mapping.
///
/// Within one [`MemoryTable`] no two regions overlap in guest-physical
/// space; order among regions carries no meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

impl MemoryRegion {
    pub fn new(guest_phys_addr: u64, memory_size: u64, userspace_addr: u64) -> Self {
        MemoryRegion {
            guest_phys_addr,
            memory_size,
            userspace_addr,
        }
    }

    fn gpa_range(&self) -> Range {
        Range::new(self.guest_phys_addr, self.memory_size)
    }

    fn uaddr_range(&self) -> Range {
        Range::new(self.userspace_addr, self.memory_size)
    }

    /// Whether `self` is adjacent to and consistently oriented with `other`
    /// such that the two could merge into one region, in either order.
    fn mergeable_with(&self, other: &MemoryRegion) -> Option<MemoryRegion> {
        let (lo, hi) = if self.gpa_range().precedes(&other.gpa_range()) {
            (self, other)
        } else if other.gpa_range().precedes(&self.gpa_range()) {
            (other, self)
        } else {
            return None;
        };
        if !lo.uaddr_range().precedes(&hi.uaddr_range()) {
            return None;
        }
        Some(MemoryRegion::new(
            lo.guest_phys_addr,
            lo.memory_size + hi.memory_size,
            lo.userspace_addr,
        ))
    }
}

/// The in-memory mirror of the table pushed to the accelerator via
/// `SET_MEM_TABLE`.
///
/// Capacity tracking is implicit: callers must grow the backing `Vec`'s
/// capacity to `nregions + 1` before calling [`MemoryTable::unassign`], so
/// that the at-most-one split it may produce always has room. Since this is
/// a `Vec<MemoryRegion>` rather than a raw C array, `reserve` is the
/// equivalent of the wire struct's capacity field; [`MemoryTable::reserve_for_mutation`]
/// does this explicitly so the invariant is visible at call sites.
#[derive(Debug, Default, Clone)]
pub struct MemoryTable {
    regions: Vec<MemoryRegion>,
}

impl MemoryTable {
    pub fn new() -> Self {
        MemoryTable {
            regions: Vec::new(),
        }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Reserve room for the one extra region a split or merge-miss may add.
    pub fn reserve_for_mutation(&mut self) {
        self.regions.reserve(1);
    }

    /// Linear scan for the first region overlapping `[start, start + size)`.
    pub fn find(&self, start: u64, size: u64) -> Option<&MemoryRegion> {
        let target = Range::new(start, size);
        self.regions
            .iter()
            .find(|r| r.gpa_range().overlaps(&target))
    }

    /// Whether an existing region already covers `[start, start+size)` at
    /// `uaddr` exactly (the no-op short-circuit for repeated adds).
    pub fn covers_unchanged(&self, start: u64, size: u64, uaddr: u64) -> bool {
        let target = Range::new(start, size);
        self.find(start, size).map_or(false, |r| {
            r.gpa_range().contains(&target) && r.userspace_addr + (start - r.guest_phys_addr) == uaddr
        })
    }

    /// Remove `[start, start + size)` from the table, splitting, shrinking,
    /// or dropping regions as needed. At most one region is split into two;
    /// callers must have reserved capacity for that via
    /// [`MemoryTable::reserve_for_mutation`].
    pub fn unassign(&mut self, start: u64, size: u64) {
        let removed = Range::new(start, size);
        if removed.is_empty() {
            return;
        }

        let mut split_count = 0u32;
        let mut out: Vec<MemoryRegion> = Vec::with_capacity(self.regions.len() + 1);

        for region in &self.regions {
            let r = region.gpa_range();
            if !r.overlaps(&removed) {
                out.push(*region);
                continue;
            }

            let left_covered = removed.start <= r.start;
            let right_covered = removed.end() >= r.end();

            match (left_covered, right_covered) {
                (true, true) => {
                    trace!(
                        "mem_table: drop region gpa={:#x} size={:#x}, fully covered",
                        region.guest_phys_addr,
                        region.memory_size
                    );
                }
                (true, false) => {
                    let covered_prefix = removed.end() - r.start;
                    out.push(MemoryRegion::new(
                        region.guest_phys_addr + covered_prefix,
                        region.memory_size - covered_prefix,
                        region.userspace_addr + covered_prefix,
                    ));
                }
                (false, true) => {
                    let new_size = removed.start - r.start;
                    out.push(MemoryRegion::new(
                        region.guest_phys_addr,
                        new_size,
                        region.userspace_addr,
                    ));
                }
                (false, false) => {
                    split_count += 1;
                    assert!(
                        split_count <= 1,
                        "unassign: at most one split is possible per call"
                    );
                    let head_size = removed.start - r.start;
                    out.push(MemoryRegion::new(
                        region.guest_phys_addr,
                        head_size,
                        region.userspace_addr,
                    ));
                    let tail_offset = removed.end() - r.start;
                    out.push(MemoryRegion::new(
                        region.guest_phys_addr + tail_offset,
                        region.memory_size - tail_offset,
                        region.userspace_addr + tail_offset,
                    ));
                }
            }
        }

        self.regions = out;
    }

    /// Add `[start, start + size)` mapped at `uaddr`, merging with adjacent
    /// regions wherever the guest-physical and host-user-virtual ranges are
    /// adjacent in both dimensions with consistent orientation.
    ///
    /// Callers must first `unassign` any overlap, so this never sees an
    /// overlapping existing region. The post-condition `nregions <=
    /// old_nregions + 1` holds because merges only ever reduce the count.
    pub fn assign(&mut self, start: u64, size: u64, uaddr: u64) {
        if size == 0 {
            return;
        }
        let mut candidate = MemoryRegion::new(start, size, uaddr);
        let mut kept: Vec<MemoryRegion> = Vec::with_capacity(self.regions.len() + 1);

        for region in &self.regions {
            debug_assert!(
                !region.gpa_range().overlaps(&candidate.gpa_range()),
                "assign: caller must unassign overlapping range first"
            );
            match candidate.mergeable_with(region) {
                Some(merged) => candidate = merged,
                None => kept.push(*region),
            }
        }

        kept.push(candidate);
        self.regions = kept;
        trace!(
            "mem_table: assign gpa={:#x} size={:#x} ua={:#x}, {} region(s) after merge",
            start,
            size,
            uaddr,
            self.regions.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_middle() {
        let mut table = MemoryTable::new();
        table.assign(0, 0x10000, 0x1000);
        table.reserve_for_mutation();
        table.unassign(0x4000, 0x2000);
        assert_eq!(
            table.regions(),
            &[
                MemoryRegion::new(0, 0x4000, 0x1000),
                MemoryRegion::new(0x6000, 0xA000, 0x7000),
            ]
        );
    }

    #[test]
    fn merge_adjacent() {
        let mut table = MemoryTable::new();
        table.assign(0, 0x4000, 0x1000);
        table.assign(0x4000, 0x4000, 0x5000);
        assert_eq!(table.regions(), &[MemoryRegion::new(0, 0x8000, 0x1000)]);
    }

    #[test]
    fn no_merge_mismatched_userspace() {
        let mut table = MemoryTable::new();
        table.assign(0, 0x4000, 0x1000);
        table.assign(0x4000, 0x4000, 0x9000);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn shrink_right() {
        let mut table = MemoryTable::new();
        table.assign(0, 0x10000, 0x1000);
        table.reserve_for_mutation();
        table.unassign(0xC000, 0x8000);
        assert_eq!(table.regions(), &[MemoryRegion::new(0, 0xC000, 0x1000)]);
    }

    #[test]
    fn shift_left_edge() {
        let mut table = MemoryTable::new();
        table.assign(0, 0x10000, 0x1000);
        table.reserve_for_mutation();
        table.unassign(0, 0x4000);
        assert_eq!(table.regions(), &[MemoryRegion::new(0x4000, 0xC000, 0x5000)]);
    }

    #[test]
    fn assign_then_unassign_round_trips() {
        let mut table = MemoryTable::new();
        table.assign(0, 0x1000, 0x8000);
        table.reserve_for_mutation();
        table.unassign(0, 0x1000);
        assert!(table.is_empty());
    }

    #[test]
    fn no_overlap_passes_through_unchanged() {
        let mut table = MemoryTable::new();
        table.assign(0, 0x1000, 0x1000);
        table.reserve_for_mutation();
        table.unassign(0x2000, 0x1000);
        assert_eq!(table.regions(), &[MemoryRegion::new(0, 0x1000, 0x1000)]);
    }

    #[test]
    fn covers_unchanged_short_circuit() {
        let mut table = MemoryTable::new();
        table.assign(0, 0x4000, 0x1000);
        assert!(table.covers_unchanged(0x1000, 0x1000, 0x2000));
        assert!(!table.covers_unchanged(0x1000, 0x1000, 0x3000));
    }
}
