// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::fmt::Write as _;
use core::ops::Range;
#[cfg(debug_assertions)]
use core::sync::atomic::{AtomicU8, Ordering};

use crate::bitmap::BitMap;
use crate::counter::SizeCounter;
#[cfg(debug_assertions)]
use crate::os::MemoryProbe;
use crate::report::CommitStats;
use crate::settings::Settings;
use crate::{BYTES_PER_WORD, VirtualAddress};

/// Observable sink for the verification touch test. Folding every probed
/// byte into an atomic keeps the volatile reads from being discarded as
/// dead code while staying visible to a test harness.
#[cfg(debug_assertions)]
static TOUCH_TEST_SINK: AtomicU8 = AtomicU8::new(0);

/// Returns the current accumulated touch-test value.
#[cfg(debug_assertions)]
#[must_use]
pub fn touch_test_sink() -> u8 {
    TOUCH_TEST_SINK.load(Ordering::Relaxed)
}

/// Commit state of one reserved metaspace node, one bit per commit granule.
///
/// Bit `i` covers the address range
/// `[base + i*granule, base + (i+1)*granule)`. A set bit asserts the owning
/// process believes that granule is currently backed by real memory; a clear
/// bit gives no such guarantee, so touching the range may fault or return
/// unspecified content.
///
/// The mask performs no locking. Its owning region manager must serialize
/// all mutations and must mark ranges only *after* the matching [`OsMemory`]
/// operation succeeded; the mask follows physical state, it never drives it.
/// Queries may interleave with other queries, not with an in-flight
/// mutation.
///
/// [`OsMemory`]: crate::OsMemory
pub struct CommitMask {
    mask: BitMap,
    base: VirtualAddress,
    word_size: usize,
    granule_words: usize,
    committed_granules: SizeCounter,
}

// ===== impl CommitMask =====

impl CommitMask {
    /// Creates the mask for a freshly reserved node at `base` spanning
    /// `word_size` words: every granule starts out uncommitted, since a new
    /// reservation is never pre-committed.
    ///
    /// The commit granule is taken from `settings` and fixed for the mask's
    /// lifetime.
    ///
    /// # Panics
    ///
    /// When `settings.consistency_checks()` is enabled, panics if
    /// `word_size` is zero or not a multiple of the granule, or if `base` is
    /// not granule-aligned. With checks disabled the caller is trusted and
    /// violations leave the bit-to-address mapping ill-defined.
    pub fn new(base: VirtualAddress, word_size: usize, settings: &Settings) -> Self {
        let granule_words = settings.commit_granule_words();

        if settings.consistency_checks() {
            assert!(word_size > 0, "cannot track an empty reservation");
            assert!(
                word_size % granule_words == 0,
                "region size ({word_size} words) is not a multiple of the commit granule ({granule_words} words)"
            );
            assert!(
                base.is_aligned_to(granule_words * BYTES_PER_WORD),
                "region base {base} is not aligned to the commit granule ({granule_words} words)"
            );
        }

        Self {
            mask: BitMap::new(word_size / granule_words),
            base,
            word_size,
            granule_words,
            committed_granules: SizeCounter::new(),
        }
    }

    #[must_use]
    #[inline]
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Size of the tracked reservation, in words.
    #[must_use]
    #[inline]
    pub fn word_size(&self) -> usize {
        self.word_size
    }

    #[must_use]
    #[inline]
    pub fn granule_words(&self) -> usize {
        self.granule_words
    }

    /// Number of granules (bits) in this mask.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mask.len() == 0
    }

    /// Returns whether granule `index` is committed.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn is_committed(&self, index: usize) -> bool {
        self.mask.get(index)
    }

    /// Returns whether every granule in the half-open `range` is committed.
    /// An empty range trivially is.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    #[must_use]
    pub fn is_range_committed(&self, range: Range<usize>) -> bool {
        self.mask.all_set_in(range)
    }

    /// Returns whether the granule containing `addr` is committed.
    ///
    /// # Panics
    ///
    /// Panics if `addr` lies outside the tracked reservation.
    #[must_use]
    pub fn is_committed_address(&self, addr: VirtualAddress) -> bool {
        self.is_committed(self.granule_index_of(addr))
    }

    /// Total committed space, in words.
    #[must_use]
    pub fn committed_words(&self) -> usize {
        self.committed_granules.get() * self.granule_words
    }

    /// Committed space within the granule `range`, in words.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    #[must_use]
    pub fn committed_words_in_range(&self, range: Range<usize>) -> usize {
        self.mask.count_ones_in(range) * self.granule_words
    }

    /// Marks the half-open granule `range` committed, after the owning
    /// region manager's commit call for the covered address range succeeded.
    /// Returns how many words of the range were newly committed (granules
    /// already marked do not count).
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn mark_range_committed(&mut self, range: Range<usize>) -> usize {
        let newly = self.mask.set_range(range.clone());
        self.committed_granules.increment_by(newly);

        log::trace!(
            "node {}: granules {}..{} committed ({newly} new)",
            self.base,
            range.start,
            range.end
        );
        newly * self.granule_words
    }

    /// Marks the half-open granule `range` uncommitted, after the owning
    /// region manager's uncommit call succeeded. Returns how many words of
    /// the range were previously committed.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn mark_range_uncommitted(&mut self, range: Range<usize>) -> usize {
        let newly = self.mask.clear_range(range.clone());
        self.committed_granules.decrement_by(newly);

        log::trace!(
            "node {}: granules {}..{} uncommitted ({newly} released)",
            self.base,
            range.start,
            range.end
        );
        newly * self.granule_words
    }

    /// Returns the index of the granule containing `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` lies outside the tracked reservation (checked in
    /// debug builds).
    #[must_use]
    pub fn granule_index_of(&self, addr: VirtualAddress) -> usize {
        debug_assert!(
            self.base <= addr && addr < self.base.add_words(self.word_size),
            "address {addr} outside of node {}", self.base
        );
        addr.offset_from_unsigned(self.base) / (self.granule_words * BYTES_PER_WORD)
    }

    /// Returns the first address of granule `index`. Also valid for
    /// `index == len()`, yielding the end of the reservation.
    ///
    /// # Panics
    ///
    /// Panics if `index` is beyond the end of the mask (checked in debug
    /// builds).
    #[must_use]
    pub fn granule_base(&self, index: usize) -> VirtualAddress {
        debug_assert!(index <= self.len(), "granule index {index} out of bounds");
        self.base.add_words(index * self.granule_words)
    }

    /// Returns the smallest granule range covering the address `range`: the
    /// range a region manager must commit so that every byte of `range` is
    /// backed.
    ///
    /// # Panics
    ///
    /// Panics if the range is not word-aligned or lies outside the tracked
    /// reservation (checked in debug builds).
    #[must_use]
    pub fn granule_range_covering(&self, range: Range<VirtualAddress>) -> Range<usize> {
        debug_assert!(range.start <= range.end);
        debug_assert!(
            self.base <= range.start && range.end <= self.base.add_words(self.word_size),
            "range {}..{} outside of node {}",
            range.start,
            range.end,
            self.base
        );
        debug_assert!(
            range.start.is_aligned_to(BYTES_PER_WORD) && range.end.is_aligned_to(BYTES_PER_WORD)
        );

        let granule_bytes = self.granule_words * BYTES_PER_WORD;
        let first = range.start.offset_from_unsigned(self.base) / granule_bytes;
        let last = range
            .end
            .offset_from_unsigned(self.base)
            .div_ceil(granule_bytes);
        first..last
    }

    /// Snapshot of this node's reserved/committed word counts.
    #[must_use]
    pub fn statistics(&self) -> CommitStats {
        CommitStats {
            reserved_words: self.word_size,
            committed_words: self.committed_words(),
        }
    }

    /// Cross-checks the mask against OS-observed state. Never mutates; on
    /// success there is no observable effect, on mismatch it aborts loudly
    /// rather than silently self-correcting, since self-correction would
    /// mask a real defect in the commit/uncommit sequence.
    ///
    /// For every committed granule, if `do_touch_test` is set, the granule's
    /// first byte is read (through `probe` where a safe probe exists, else
    /// blindly, where a lying mask means a hard fault). For every
    /// uncommitted granule, if `slow` is set and the platform both has a
    /// safe probe and guarantees uncommitted memory is inaccessible, the
    /// granule is checked to be unreadable; elsewhere that direction is
    /// inconclusive and skipped.
    ///
    /// Callers must hold the owning lock (or be at a quiesced point): a
    /// legitimate commit in flight would otherwise show up as a false
    /// failure.
    ///
    /// # Panics
    ///
    /// Panics on any divergence between mask and observed state.
    #[cfg(debug_assertions)]
    pub fn verify<P: MemoryProbe>(&self, probe: &P, slow: bool, do_touch_test: bool) {
        assert!(
            self.base
                .is_aligned_to(self.granule_words * BYTES_PER_WORD),
            "commit mask base {} lost granule alignment", self.base
        );
        assert!(self.word_size % self.granule_words == 0, "region/granule mismatch");

        for index in 0..self.len() {
            let p = self.granule_base(index);

            if self.mask.get(index) {
                if do_touch_test {
                    if probe.has_safe_probe() {
                        assert!(
                            probe.is_readable(p),
                            "granule {index} at {p} is marked committed, but is not accessible"
                        );
                    }
                    // SAFETY: the set bit asserts this granule was committed
                    // by a successful OS call and not uncommitted since; if
                    // that contract was broken the fault here is the
                    // diagnostic.
                    let byte = unsafe { p.as_ptr().read_volatile() };
                    TOUCH_TEST_SINK.fetch_xor(byte, Ordering::Relaxed);
                }
            } else if slow && probe.has_safe_probe() && probe.uncommitted_is_inaccessible() {
                assert!(
                    !probe.is_readable(p),
                    "granule {index} at {p} is marked uncommitted, but is still accessible"
                );
            }
        }

        self.committed_granules.check(self.mask.count_ones_in(0..self.len()));
    }

    /// Writes the mask as one line: the base address label followed by one
    /// character per granule (`'X'` committed, `'-'` uncommitted) and a line
    /// terminator.
    ///
    /// # Errors
    ///
    /// Forwards errors of the underlying writer.
    pub fn render<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(out, "{self}")
    }
}

impl fmt::Display for CommitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "commit mask, base {:#x}:", self.base.get())?;
        for index in 0..self.len() {
            f.write_char(if self.mask.get(index) { 'X' } else { '-' })?;
        }
        Ok(())
    }
}

impl fmt::Debug for CommitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitMask")
            .field("base", &self.base)
            .field("word_size", &self.word_size)
            .field("granule_words", &self.granule_words)
            .field("committed_words", &self.committed_words())
            .finish_non_exhaustive()
    }
}
