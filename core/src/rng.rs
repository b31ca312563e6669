//! Deterministic random number generation for behavioral baselines.
//!
//! RULE: Baseline features never touch a platform RNG.
//! Each user gets its own PCG stream, seeded from a stable hash of the
//! user id, so the same user always yields the same baseline on every
//! process, platform and restart.
//!
//! The one deliberately non-deterministic feature (location change speed)
//! does not use this module.

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Stable 64-bit FNV-1a hash. `std`'s `DefaultHasher` is not guaranteed
/// stable across releases, so seeds are derived here.
pub fn stable_seed(key: &str) -> u64 {
    key.bytes().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// A named, deterministic RNG keyed by an entity id.
pub struct KeyedRng {
    inner: Pcg64Mcg,
}

impl KeyedRng {
    /// Stream for a user id (or any other stable key).
    pub fn for_key(key: &str) -> Self {
        Self {
            inner: Pcg64Mcg::seed_from_u64(stable_seed(key)),
        }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        use rand::RngCore;
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a float in [lo, hi).
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// Roll an integer in [lo, hi] (inclusive).
    pub fn range_inclusive(&mut self, lo: i64, hi: i64) -> i64 {
        use rand::RngCore;
        assert!(hi >= lo, "empty range {lo}..={hi}");
        let span = (hi - lo) as u64 + 1;
        lo + (self.inner.next_u64() % span) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_stream() {
        let mut a = KeyedRng::for_key("user-42");
        let mut b = KeyedRng::for_key("user-42");
        for _ in 0..16 {
            assert_eq!(a.next_f64().to_bits(), b.next_f64().to_bits());
        }
    }

    #[test]
    fn different_keys_diverge() {
        let mut a = KeyedRng::for_key("user-1");
        let mut b = KeyedRng::for_key("user-2");
        let any_diff = (0..8).any(|_| a.next_f64() != b.next_f64());
        assert!(any_diff, "distinct keys produced identical streams");
    }

    #[test]
    fn seed_is_stable() {
        // Pinned value: changing the hash changes every stored baseline.
        assert_eq!(stable_seed(""), FNV_OFFSET);
        assert_eq!(stable_seed("a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn ranges_stay_in_bounds() {
        let mut rng = KeyedRng::for_key("bounds");
        for _ in 0..1_000 {
            let f = rng.uniform(0.9, 1.1);
            assert!((0.9..1.1).contains(&f));
            let i = rng.range_inclusive(-1, 2);
            assert!((-1..=2).contains(&i));
        }
    }
}
