// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `proptest` strategies for commit tracking tests

use core::ops::Range;

use proptest::prelude::{Just, Strategy};

/// Produces commit granule sizes in words, including awkward
/// non-power-of-two shapes.
pub fn granule_words() -> impl Strategy<Value = usize> {
    1usize..=64
}

/// Produces region sizes (in words) that are multiples of `granule_words`.
pub fn region_words(granule_words: usize, max_granules: usize) -> impl Strategy<Value = usize> {
    (1..=max_granules).prop_map(move |granules| granules * granule_words)
}

/// Produces half-open subranges of `0..len` (possibly empty).
pub fn index_range(len: usize) -> impl Strategy<Value = Range<usize>> {
    (0..=len)
        .prop_flat_map(move |start| (Just(start), start..=len))
        .prop_map(|(start, end)| start..end)
}
