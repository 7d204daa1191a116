// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

extern crate std;

pub mod proptest;

use core::ops::Range;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::vec;
use std::vec::Vec;

use crate::counter::SizeAtomicCounter;
use crate::os::{MemoryError, MemoryProbe, OsMemory};
use crate::settings::Settings;
use crate::{BYTES_PER_WORD, VirtualAddress};

/// A real, granule-aligned host allocation standing in for a reserved
/// metaspace node, plus a per-granule accessibility ledger emulating the
/// OS's mapping state.
///
/// All of the region's memory is genuinely allocated, so touch tests always
/// read valid bytes; "uncommitted" exists only in the ledger, which the
/// [`MemoryProbe`] implementation consults. That makes it safe to seed
/// mask/OS divergence with [`force_inaccessible`][Self::force_inaccessible]
/// and let verification trip over it.
pub struct TestRegion {
    ptr: *mut u8,
    layout: Layout,
    base: VirtualAddress,
    word_size: usize,
    granule_words: usize,
    accessible: Vec<bool>,
    committed_words: SizeAtomicCounter,
    fail_next_commit: bool,
}

// ===== impl TestRegion =====

impl TestRegion {
    /// Reserves a fake node of `word_size` words under the given policy.
    ///
    /// # Panics
    ///
    /// Panics if `word_size` is zero or not a multiple of the policy's
    /// commit granule.
    pub fn new(word_size: usize, settings: &Settings) -> Self {
        let granule_words = settings.commit_granule_words();
        assert!(word_size > 0 && word_size % granule_words == 0);

        let granule_bytes = granule_words * BYTES_PER_WORD;
        // Over-allocate by one granule so a granule-aligned base can be
        // carved out even when the granule is not a power of two (the
        // allocator can only align to powers of two).
        let layout =
            Layout::from_size_align(word_size * BYTES_PER_WORD + granule_bytes, BYTES_PER_WORD)
                .unwrap();

        // SAFETY: layout has nonzero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }

        Self {
            ptr,
            layout,
            base: VirtualAddress::from_ptr(ptr).align_up(granule_bytes),
            word_size,
            granule_words,
            accessible: vec![false; word_size / granule_words],
            committed_words: SizeAtomicCounter::new(),
            fail_next_commit: false,
        }
    }

    /// Makes the next commit call report out-of-memory instead of
    /// succeeding, leaving the ledger unchanged.
    pub fn fail_next_commit(&mut self) {
        self.fail_next_commit = true;
    }

    #[must_use]
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub fn word_size(&self) -> usize {
        self.word_size
    }

    #[must_use]
    pub fn granule_words(&self) -> usize {
        self.granule_words
    }

    /// Words currently committed according to the ledger.
    #[must_use]
    pub fn committed_words(&self) -> usize {
        self.committed_words.get()
    }

    /// The address range spanned by the given granule `range`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    #[must_use]
    pub fn granule_span(&self, range: Range<usize>) -> Range<VirtualAddress> {
        assert!(range.start <= range.end && range.end <= self.accessible.len());
        self.base.add_words(range.start * self.granule_words)
            ..self.base.add_words(range.end * self.granule_words)
    }

    /// Flips the ledger to "inaccessible" for the given granules without
    /// telling anyone, seeding exactly the divergence verification exists
    /// to catch.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn force_inaccessible(&mut self, range: Range<usize>) {
        for granule in &mut self.accessible[range] {
            if *granule {
                self.committed_words.decrement_by(self.granule_words);
            }
            *granule = false;
        }
    }

    /// Writes `value` into the first byte of granule `index`, so touch
    /// tests have something observable to fold into the sink.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds or the granule is not committed.
    pub fn fill_first_byte(&mut self, index: usize, value: u8) {
        assert!(self.accessible[index], "granule {index} is not committed");
        let p = self
            .base
            .add_words(index * self.granule_words)
            .as_mut_ptr();
        // SAFETY: the granule lies within the live allocation.
        unsafe { p.write_volatile(value) };
    }

    fn granule_range(&self, range: &Range<VirtualAddress>) -> Range<usize> {
        let granule_bytes = self.granule_words * BYTES_PER_WORD;
        assert!(
            self.base <= range.start
                && range.end <= self.base.add_words(self.word_size)
                && range.start.is_aligned_to(granule_bytes)
                && range.end.is_aligned_to(granule_bytes),
            "commit/uncommit range {}..{} is not a granule-aligned subrange of the node",
            range.start,
            range.end
        );
        range.start.offset_from_unsigned(self.base) / granule_bytes
            ..range.end.offset_from_unsigned(self.base) / granule_bytes
    }
}

impl OsMemory for TestRegion {
    fn commit(&mut self, range: Range<VirtualAddress>) -> Result<(), MemoryError> {
        let granules = self.granule_range(&range);
        if self.fail_next_commit {
            self.fail_next_commit = false;
            return Err(MemoryError::CommitFailed {
                words: granules.len() * self.granule_words,
            });
        }
        for index in granules {
            if !self.accessible[index] {
                self.accessible[index] = true;
                self.committed_words.increment_by(self.granule_words);
            }
        }
        Ok(())
    }

    fn uncommit(&mut self, range: Range<VirtualAddress>) -> Result<(), MemoryError> {
        let granules = self.granule_range(&range);
        for index in granules {
            if self.accessible[index] {
                self.accessible[index] = false;
                self.committed_words.decrement_by(self.granule_words);
            }
        }
        Ok(())
    }
}

impl MemoryProbe for TestRegion {
    fn has_safe_probe(&self) -> bool {
        true
    }

    // The ledger emulates protection-based decommit, so the advisory
    // direction of verification is decidable here.
    fn uncommitted_is_inaccessible(&self) -> bool {
        true
    }

    fn is_readable(&self, addr: VirtualAddress) -> bool {
        if addr < self.base || addr >= self.base.add_words(self.word_size) {
            return false;
        }
        let index = addr.offset_from_unsigned(self.base) / (self.granule_words * BYTES_PER_WORD);
        self.accessible[index]
    }
}

impl Drop for TestRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/layout come from the allocation in `new`.
        unsafe { dealloc(self.ptr, self.layout) }
    }
}
