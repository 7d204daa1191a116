// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Word- and count-keeping helpers that assert against overflow and
//! underflow in debug builds.

use core::sync::atomic::{AtomicUsize, Ordering};

/// A simple counter for callers that already serialize mutations (the commit
/// mask's owner holds a lock around every mutation, so the mask's internal
/// ledger needs no atomics).
#[derive(Debug, Default)]
pub struct SizeCounter(usize);

// ===== impl SizeCounter =====

impl SizeCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    #[must_use]
    #[inline]
    pub fn get(&self) -> usize {
        self.0
    }

    #[inline]
    pub fn increment_by(&mut self, v: usize) {
        debug_assert!(self.0.checked_add(v).is_some(), "counter overflow");
        self.0 += v;
    }

    #[inline]
    pub fn decrement_by(&mut self, v: usize) {
        debug_assert!(self.0 >= v, "counter underflow");
        self.0 -= v;
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    /// Fatally asserts the counter holds `expected`.
    ///
    /// # Panics
    ///
    /// Panics on mismatch; that is the point.
    #[cfg(debug_assertions)]
    pub fn check(&self, expected: usize) {
        assert!(
            self.0 == expected,
            "counter mismatch: {}, expected: {}",
            self.0,
            expected
        );
    }
}

/// The atomic flavor, for ledgers shared across threads (e.g. a region
/// manager summing committed words over all of its nodes).
#[derive(Debug, Default)]
pub struct SizeAtomicCounter(AtomicUsize);

// ===== impl SizeAtomicCounter =====

impl SizeAtomicCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[must_use]
    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn increment_by(&self, v: usize) {
        let old = self.0.fetch_add(v, Ordering::Relaxed);
        debug_assert!(old.checked_add(v).is_some(), "counter overflow");
    }

    #[inline]
    pub fn decrement_by(&self, v: usize) {
        let old = self.0.fetch_sub(v, Ordering::Relaxed);
        debug_assert!(old >= v, "counter underflow");
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    /// Fatally asserts the counter holds `expected`.
    ///
    /// # Panics
    ///
    /// Panics on mismatch; that is the point.
    #[cfg(debug_assertions)]
    pub fn check(&self, expected: usize) {
        let value = self.get();
        assert!(value == expected, "counter mismatch: {value}, expected: {expected}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_counter() {
        let mut counter = SizeCounter::new();
        counter.increment_by(3);
        counter.increment_by(4);
        assert_eq!(counter.get(), 7);
        counter.decrement_by(7);
        assert_eq!(counter.get(), 0);
        counter.increment_by(1);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "counter underflow")]
    fn size_counter_underflow() {
        let mut counter = SizeCounter::new();
        counter.decrement_by(1);
    }

    #[test]
    fn atomic_counter() {
        let counter = SizeAtomicCounter::new();
        counter.increment_by(128);
        counter.decrement_by(28);
        assert_eq!(counter.get(), 100);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "counter mismatch")]
    fn check_detects_mismatch() {
        let mut counter = SizeCounter::new();
        counter.increment_by(2);
        counter.check(3);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn check_accepts_the_expected_value() {
        let counter = SizeAtomicCounter::new();
        counter.increment_by(100);
        counter.check(100);
    }
}
