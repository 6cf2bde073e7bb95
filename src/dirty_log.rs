// Copyright (C) Dragonball Team. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The dirty-page log: a bitmap shared with the accelerator, one bit per
//! guest page, that the core allocates, resizes, and drains.

use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;

use crate::range::Range;

/// Bytes tracked by a single bit.
pub const LOG_PAGE: u64 = 4096;

/// Bits in one log word ("chunk").
pub const CHUNK_BITS: u64 = u64::BITS as u64;

/// Hysteresis margin applied to resize decisions, expressed in words: one
/// page worth of log words (`4 KiB / word_size`).
pub const LOG_BUFFER_WORDS: u64 = 4096 / 8;

/// Bytes covered by a single word of the log.
const BYTES_PER_WORD: u64 = CHUNK_BITS * LOG_PAGE;

/// Smallest word count covering `last_byte`.
fn words_for_last_byte(last_byte: u64) -> u64 {
    last_byte / BYTES_PER_WORD + 1
}

/// A single memory-section descriptor, sufficient to drive a scan over the
/// shared log for that section's guest-physical window.
#[derive(Debug, Clone, Copy)]
pub struct ScanWindow {
    /// Host-user-virtual range backing this section, used only to bound the
    /// guest-physical-to-word translation; the log itself is word-indexed
    /// by guest-physical address, not host address.
    pub region_offset: u64,
    pub guest_phys: Range,
}

/// The shared dirty-page bitmap.
///
/// Owned by the core; its base address is handed to the accelerator via
/// `SET_LOG_BASE`. The core reads with atomic fetch-and-zero; the
/// accelerator writes with atomic OR. No lock mediates the two sides, the
/// word-level read-modify-write is the only synchronisation primitive
/// needed (see the concurrency notes in the crate root docs).
#[derive(Debug, Default)]
pub struct DirtyLog {
    words: Vec<AtomicU64>,
}

impl DirtyLog {
    /// An empty log: no buffer allocated, base address is null.
    pub fn empty() -> Self {
        DirtyLog { words: Vec::new() }
    }

    pub fn size_words(&self) -> u64 {
        self.words.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Allocate a zeroed log of `size_words` words. `size_words == 0`
    /// produces an empty log with a null base, matching the accelerator's
    /// `SET_LOG_BASE(0)` convention for "logging off".
    pub fn allocate(size_words: u64) -> Self {
        let mut words = Vec::with_capacity(size_words as usize);
        words.resize_with(size_words as usize, || AtomicU64::new(0));
        DirtyLog { words }
    }

    /// The base address handed to the accelerator, or `0` when empty.
    ///
    /// Exposed only at the collaborator boundary: internally the log is a
    /// `Vec<AtomicU64>`, never a raw pointer.
    pub fn base_ptr(&self) -> u64 {
        if self.words.is_empty() {
            0
        } else {
            self.words.as_ptr() as u64
        }
    }

    /// Minimal word count covering every byte in `extents` (the memory
    /// table's regions and every live virtqueue's `used` window), per the
    /// spec's `get_log_size` definition: `max(last_byte) / (W * LOG_PAGE) +
    /// 1`.
    pub fn compute_log_size_words<I>(extents: I) -> u64
    where
        I: IntoIterator<Item = Range>,
    {
        extents
            .into_iter()
            .filter(|r| !r.is_empty())
            .map(|r| words_for_last_byte(r.last()))
            .max()
            .unwrap_or(0)
    }

    /// Decide the new log size given the currently needed size, applying
    /// the hysteresis margin: grow immediately to `needed + margin`, but
    /// only shrink once `current` exceeds `needed + margin`. Returns `None`
    /// when no resize is warranted.
    pub fn next_log_size(current_words: u64, needed_words: u64, margin_words: u64) -> Option<u64> {
        let padded = needed_words.saturating_add(margin_words);
        if needed_words > current_words {
            Some(padded)
        } else if current_words > padded {
            Some(padded)
        } else {
            None
        }
    }

    /// Fetch-and-zero every word overlapping `[start, end]` inclusive
    /// (measured in bytes from the start of the log's guest-physical
    /// coverage), invoking `mark_dirty(region_offset, len)` for every bit
    /// found set in those words. `window.guest_phys` only picks which words
    /// to scan; once a word is chosen, every set bit in it is reported and
    /// cleared, even one whose page falls outside the window (a word covers
    /// 64 pages, so a word can straddle two sections). Filtering bits to the
    /// window would leave an out-of-window bit set after the word is zeroed,
    /// silently dropping it. `region_offset` translates a bit position back
    /// into an offset within the owning memory region.
    pub fn sync_region<F>(&self, window: &ScanWindow, mut mark_dirty: F)
    where
        F: FnMut(u64, u64),
    {
        let covered = Range::new(0, self.words.len() as u64 * BYTES_PER_WORD);
        let scan = match covered.intersection(&window.guest_phys) {
            Some(r) if !r.is_empty() => r,
            _ => return,
        };

        let first_word = scan.start / BYTES_PER_WORD;
        let last_word = (scan.last()) / BYTES_PER_WORD;

        for word_idx in first_word..=last_word {
            let atomic = &self.words[word_idx as usize];
            if atomic.load(Ordering::Relaxed) == 0 {
                continue;
            }
            let bits = atomic.swap(0, Ordering::AcqRel);
            if bits == 0 {
                continue;
            }
            for bit in 0..CHUNK_BITS {
                if bits & (1u64 << bit) == 0 {
                    continue;
                }
                let page_gpa = word_idx * BYTES_PER_WORD + bit * LOG_PAGE;
                let offset = window
                    .region_offset
                    .wrapping_add(page_gpa.wrapping_sub(window.guest_phys.start));
                mark_dirty(offset, LOG_PAGE);
            }
        }
        trace!(
            "dirty_log: synced words [{}, {}] for gpa range {:#x}..{:#x}",
            first_word,
            last_word,
            window.guest_phys.start,
            window.guest_phys.end()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_scan_single_word() {
        let log = DirtyLog::allocate(1);
        // bits 1 and 3 set
        log.words[0].store(0b1010, Ordering::Relaxed);

        let window = ScanWindow {
            region_offset: 0,
            guest_phys: Range::new(0, 0x10000),
        };
        let mut calls = Vec::new();
        log.sync_region(&window, |offset, len| calls.push((offset, len)));

        assert_eq!(calls, vec![(1 * LOG_PAGE, LOG_PAGE), (3 * LOG_PAGE, LOG_PAGE)]);
        assert_eq!(log.words[0].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn word_shared_by_two_sections_reports_both_halves() {
        // One word covers 64 pages (256 KiB); two sub-256 KiB sections can
        // occupy different bit ranges of the same word. The first section's
        // drain must still report a bit set by the second section's range,
        // since the word is zeroed wholesale on the first drain.
        let log = DirtyLog::allocate(1);
        log.words[0].store((1 << 2) | (1 << 40), Ordering::Relaxed);

        let window = ScanWindow {
            region_offset: 0,
            guest_phys: Range::new(0, 32 * LOG_PAGE),
        };
        let mut calls = Vec::new();
        log.sync_region(&window, |offset, len| calls.push((offset, len)));

        assert_eq!(calls.len(), 2, "both bits in the shared word must be reported, not just the in-window one");
        assert!(calls.contains(&(2 * LOG_PAGE, LOG_PAGE)));
        assert!(calls.contains(&(40 * LOG_PAGE, LOG_PAGE)));
        assert_eq!(log.words[0].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn zero_word_short_circuits() {
        let log = DirtyLog::allocate(2);
        let window = ScanWindow {
            region_offset: 0,
            guest_phys: Range::new(0, BYTES_PER_WORD * 2),
        };
        let mut calls = 0;
        log.sync_region(&window, |_, _| calls += 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn size_words_from_extents() {
        let extents = vec![Range::new(0, 1), Range::new(0, BYTES_PER_WORD * 3 + 11)];
        assert_eq!(DirtyLog::compute_log_size_words(extents), 4);
    }

    #[test]
    fn hysteresis_grow_and_shrink() {
        assert_eq!(DirtyLog::next_log_size(0, 10, 4), Some(14));
        assert_eq!(DirtyLog::next_log_size(14, 10, 4), None);
        assert_eq!(DirtyLog::next_log_size(20, 2, 4), Some(6));
        assert_eq!(DirtyLog::next_log_size(6, 2, 4), None);
    }

    #[test]
    fn resize_to_zero_frees_and_nulls() {
        let log = DirtyLog::allocate(0);
        assert!(log.is_empty());
        assert_eq!(log.base_ptr(), 0);
    }
}
