// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Commit statistics and human-readable reporting.

use core::fmt;

use crate::commit_mask::CommitMask;
use crate::{BYTES_PER_WORD, GIB, KIB, MIB};

bitflags::bitflags! {
    /// Optional parts of [`print_commit_report`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReportFlags: u8 {
        /// Append a summary line adding up all nodes.
        const SHOW_TOTALS = 1 << 0;
        /// Print each node's commit mask map.
        const SHOW_MAP = 1 << 1;
    }
}

/// Reserved/committed word counts for one or more nodes.
///
/// `reserved = committed + uncommitted`; a node's reservation never changes
/// over its lifetime, only the committed share does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub reserved_words: usize,
    pub committed_words: usize,
}

// ===== impl CommitStats =====

impl CommitStats {
    pub fn add(&mut self, other: &CommitStats) {
        self.reserved_words += other.reserved_words;
        self.committed_words += other.committed_words;
    }

    #[must_use]
    pub fn uncommitted_words(&self) -> usize {
        self.reserved_words - self.committed_words
    }

    /// Writes `reserved <size>, committed <size>` scaled per
    /// [`print_scaled_words`].
    ///
    /// # Errors
    ///
    /// Forwards errors of the underlying writer.
    pub fn print_on<W: fmt::Write>(&self, out: &mut W, scale: usize) -> fmt::Result {
        write!(out, "reserved ")?;
        print_scaled_words(out, self.reserved_words, scale)?;
        write!(out, ", committed ")?;
        print_scaled_words(out, self.committed_words, scale)
    }
}

/// Writes a usage report for the given nodes: one stats line per node,
/// optionally followed by its commit map, optionally summed up in a totals
/// line.
///
/// `scale` is `1` (bytes), [`KIB`], [`MIB`], [`GIB`] or `0` to pick a unit
/// per value.
///
/// # Errors
///
/// Forwards errors of the underlying writer.
pub fn print_commit_report<'a, W, I>(
    out: &mut W,
    scale: usize,
    flags: ReportFlags,
    nodes: I,
) -> fmt::Result
where
    W: fmt::Write,
    I: IntoIterator<Item = (&'a str, &'a CommitMask)>,
{
    let mut total = CommitStats::default();

    for (name, mask) in nodes {
        write!(out, "node {name}: ")?;
        let stats = mask.statistics();
        stats.print_on(out, scale)?;
        writeln!(out)?;

        if flags.contains(ReportFlags::SHOW_MAP) {
            mask.render(out)?;
        }
        total.add(&stats);
    }

    if flags.contains(ReportFlags::SHOW_TOTALS) {
        write!(out, "total: ")?;
        total.print_on(out, scale)?;
        writeln!(out)?;
    }
    Ok(())
}

/// Writes a word count as a byte size in the unit given by `scale`: `1`
/// prints plain bytes, [`KIB`]/[`MIB`]/[`GIB`] print a two-decimal fixed
/// point value, `0` picks the largest unit the value reaches. Fixed point is
/// computed in integers; no floating point is involved.
///
/// # Errors
///
/// Forwards errors of the underlying writer.
///
/// # Panics
///
/// Panics if `scale` is not one of the values above.
pub fn print_scaled_words<W: fmt::Write>(out: &mut W, words: usize, scale: usize) -> fmt::Result {
    let bytes = words * BYTES_PER_WORD;

    let scale = match scale {
        0 => {
            if bytes >= GIB {
                GIB
            } else if bytes >= MIB {
                MIB
            } else if bytes >= KIB {
                KIB
            } else {
                1
            }
        }
        1 | KIB | MIB | GIB => scale,
        _ => panic!("invalid report scale {scale}"),
    };

    if scale == 1 {
        return write!(out, "{bytes} bytes");
    }

    let unit = match scale {
        KIB => "KB",
        MIB => "MB",
        _ => "GB",
    };
    let whole = bytes / scale;
    let centi = (bytes % scale) * 100 / scale;
    write!(out, "{whole}.{centi:02} {unit}")
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::{Settings, VirtualAddress};

    fn scaled(words: usize, scale: usize) -> String {
        let mut out = String::new();
        print_scaled_words(&mut out, words, scale).unwrap();
        out
    }

    #[test]
    fn scaled_printing() {
        let k = KIB / BYTES_PER_WORD;

        assert_eq!(scaled(2, 1), "16 bytes");
        assert_eq!(scaled(128 * k, KIB), "128.00 KB");
        assert_eq!(scaled(128 * k, MIB), "0.12 MB");
        // Auto picks the largest unit reached.
        assert_eq!(scaled(100, 0), "800 bytes");
        assert_eq!(scaled(3 * k / 2, 0), "1.50 KB");
        assert_eq!(scaled(1024 * 1024 * k, 0), "1.00 GB");
    }

    #[test]
    #[should_panic(expected = "invalid report scale")]
    fn invalid_scale() {
        let _ = scaled(1, 3);
    }

    #[test]
    fn stats_addition() {
        let mut total = CommitStats::default();
        total.add(&CommitStats { reserved_words: 100, committed_words: 40 });
        total.add(&CommitStats { reserved_words: 50, committed_words: 0 });

        assert_eq!(total.reserved_words, 150);
        assert_eq!(total.committed_words, 40);
        assert_eq!(total.uncommitted_words(), 110);
    }

    #[test]
    fn report_embeds_maps_and_totals() {
        let settings = Settings::new(8).with_consistency_checks(true);
        let mut a = CommitMask::new(VirtualAddress::new(0x1000), 64, &settings);
        let mut b = CommitMask::new(VirtualAddress::new(0x2000), 32, &settings);
        a.mark_range_committed(2..5);
        b.mark_range_committed(0..4);

        let mut out = String::new();
        print_commit_report(
            &mut out,
            1,
            ReportFlags::SHOW_MAP | ReportFlags::SHOW_TOTALS,
            [("nonclass", &a), ("class", &b)],
        )
        .unwrap();

        let expected = "node nonclass: reserved 512 bytes, committed 192 bytes\n\
                        commit mask, base 0x1000:--XXX---\n\
                        node class: reserved 256 bytes, committed 256 bytes\n\
                        commit mask, base 0x2000:XXXX\n\
                        total: reserved 768 bytes, committed 448 bytes\n";
        assert_eq!(out, expected);
    }
}
