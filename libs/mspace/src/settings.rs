// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use spin::Once;

use crate::{BYTES_PER_WORD, KIB};

/// Default size in bytes of one commit granule.
///
/// The granule is the single knob trading mask memory overhead and OS call
/// frequency against commit precision: coarser granules mean fewer, cheaper
/// OS calls and a smaller mask, at the cost of committing possibly-unneeded
/// memory at the edges of a requested range.
pub const DEFAULT_COMMIT_GRANULE_BYTES: usize = 64 * KIB;

static GLOBAL: Once<Settings> = Once::new();

/// Process-wide metaspace commit policy.
///
/// The commit granule is fixed once per process, not tuned per region: every
/// [`CommitMask`][crate::CommitMask] in the process must agree on how much
/// address space one bit represents. The consistency-checking flag selects
/// whether precondition violations are detected (fatally) or the callers are
/// trusted for speed; it defaults to on in debug builds and can be forced
/// either way so tests exercise the checked path regardless of build profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    commit_granule_words: usize,
    consistency_checks: bool,
}

// ===== impl Settings =====

impl Settings {
    /// Creates a policy with the given commit granule, in words.
    ///
    /// # Panics
    ///
    /// Panics if `commit_granule_words` is zero.
    pub fn new(commit_granule_words: usize) -> Self {
        assert!(commit_granule_words > 0, "commit granule must be nonzero");
        Self {
            commit_granule_words,
            consistency_checks: cfg!(debug_assertions),
        }
    }

    #[must_use]
    pub fn with_consistency_checks(mut self, enabled: bool) -> Self {
        self.consistency_checks = enabled;
        self
    }

    /// Number of address-space words one commit mask bit represents.
    #[must_use]
    #[inline]
    pub fn commit_granule_words(&self) -> usize {
        self.commit_granule_words
    }

    /// Size in bytes of one commit granule.
    #[must_use]
    #[inline]
    pub fn commit_granule_bytes(&self) -> usize {
        self.commit_granule_words * BYTES_PER_WORD
    }

    #[must_use]
    #[inline]
    pub fn consistency_checks(&self) -> bool {
        self.consistency_checks
    }

    /// Installs this policy as the process-wide one.
    ///
    /// The first call wins; later calls are no-ops as long as they agree on
    /// the granule. Masks constructed under one granule cannot coexist with
    /// masks constructed under another, so disagreeing is a caller bug.
    ///
    /// # Panics
    ///
    /// Panics if the policy was already initialized with a different commit
    /// granule.
    pub fn initialize(self) -> &'static Settings {
        let installed = self.install();
        assert!(
            installed.commit_granule_words == self.commit_granule_words,
            "commit policy already initialized with granule {} words, refusing {}",
            installed.commit_granule_words,
            self.commit_granule_words
        );
        installed
    }

    /// Returns the process-wide policy, installing the default on first use.
    pub fn global() -> &'static Settings {
        Settings::default().install()
    }

    fn install(self) -> &'static Settings {
        GLOBAL.call_once(|| {
            log::debug!(
                "metaspace commit policy: granule {} words ({} bytes)",
                self.commit_granule_words,
                self.commit_granule_bytes()
            );
            self
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(DEFAULT_COMMIT_GRANULE_BYTES / BYTES_PER_WORD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_granule() {
        let settings = Settings::default();
        assert_eq!(settings.commit_granule_bytes(), DEFAULT_COMMIT_GRANULE_BYTES);
        assert_eq!(
            settings.commit_granule_words(),
            DEFAULT_COMMIT_GRANULE_BYTES / BYTES_PER_WORD
        );
    }

    #[test]
    #[should_panic(expected = "commit granule must be nonzero")]
    fn zero_granule() {
        let _ = Settings::new(0);
    }

    #[test]
    fn consistency_checks_can_be_forced() {
        let settings = Settings::new(8).with_consistency_checks(false);
        assert!(!settings.consistency_checks());
        let settings = settings.with_consistency_checks(true);
        assert!(settings.consistency_checks());
    }

    #[test]
    fn global_policy_installs_once() {
        // The only test touching the process-wide slot: everything else
        // passes explicit settings.
        let installed = Settings::default().initialize();
        assert_eq!(installed, Settings::global());
        // Same granule, different flags: still a no-op.
        let again = Settings::default().with_consistency_checks(true).initialize();
        assert_eq!(installed, again);
    }
}
