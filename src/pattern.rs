//! Reproducible baseline content.
//!
//! The baseline file is filled from the BLAKE3 extendable output keyed by a
//! fixed context string and a seed. The bytes look random to the filesystem
//! (no compression or dedup shortcuts) yet the same seed always regenerates
//! the same stream.

use std::io::{Read, Take};

/// Derive-key context for the content stream. Changing it changes every
/// baseline file, so it is versioned.
const PATTERN_CONTEXT: &str = "crashprobe 2026-01 baseline content v1";

/// Seed used when the caller does not pick one.
pub const DEFAULT_SEED: u64 = 0x6a6f_7572_6e61_6c21;

/// Seeded deterministic byte stream.
///
/// # Example
///
/// ```rust
/// use crashprobe::Pattern;
/// use std::io::Read;
///
/// let mut a = Vec::new();
/// let mut b = Vec::new();
/// Pattern::new(7).reader(1024).read_to_end(&mut a).unwrap();
/// Pattern::new(7).reader(1024).read_to_end(&mut b).unwrap();
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern {
    seed: u64,
}

impl Pattern {
    /// Pattern for `seed`.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Seed this pattern was built from.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Reader yielding exactly `len` bytes of the stream.
    #[must_use]
    pub fn reader(&self, len: u64) -> Take<blake3::OutputReader> {
        let mut hasher = blake3::Hasher::new_derive_key(PATTERN_CONTEXT);
        hasher.update(&self.seed.to_le_bytes());
        hasher.finalize_xof().take(len)
    }
}

impl Default for Pattern {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(pattern: Pattern, len: u64) -> Vec<u8> {
        let mut out = Vec::new();
        pattern.reader(len).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn yields_exact_length() {
        assert_eq!(collect(Pattern::default(), 12_345).len(), 12_345);
        assert!(collect(Pattern::default(), 0).is_empty());
    }

    #[test]
    fn same_seed_same_bytes() {
        assert_eq!(collect(Pattern::new(1), 4096), collect(Pattern::new(1), 4096));
    }

    #[test]
    fn different_seed_different_bytes() {
        assert_ne!(collect(Pattern::new(1), 64), collect(Pattern::new(2), 64));
    }

    #[test]
    fn shorter_stream_is_prefix() {
        let long = collect(Pattern::default(), 10_000);
        let short = collect(Pattern::default(), 3_000);
        assert_eq!(&long[..3_000], short.as_slice());
    }

    #[test]
    fn not_a_constant_fill() {
        let bytes = collect(Pattern::default(), 1024);
        assert!(bytes.iter().any(|&b| b != bytes[0]));
    }
}
