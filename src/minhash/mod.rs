pub mod params;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use xxhash_rust::xxh3::xxh3_64_with_seed;

pub use params::{BandPlan, band_keys, optimal_band_plan};

/// Largest Mersenne prime below 2^62. Permuted hashes stay inside it, so the
/// arithmetic never wraps even through the u128 intermediate.
const MERSENNE_PRIME: u64 = (1 << 61) - 1;

pub type Signature = Vec<u64>;

/// Deterministic MinHash over word shingles.
///
/// All workers construct their hasher from the same `(num_perm, seed)` pair,
/// so the permutation constants (and therefore the signatures) are identical
/// across the whole run. That property is load-bearing: two workers hashing
/// the same text on different shards must land in the same buckets.
#[derive(Debug, Clone)]
pub struct MinHasher {
    seed: u64,
    perm_a: Vec<u64>,
    perm_b: Vec<u64>,
}

impl MinHasher {
    pub fn new(num_perm: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut perm_a = Vec::with_capacity(num_perm);
        let mut perm_b = Vec::with_capacity(num_perm);
        for _ in 0..num_perm {
            perm_a.push(rng.random_range(1..MERSENNE_PRIME));
            perm_b.push(rng.random_range(0..MERSENNE_PRIME));
        }
        Self {
            seed,
            perm_a,
            perm_b,
        }
    }

    pub fn num_permutations(&self) -> usize {
        self.perm_a.len()
    }

    /// Computes the signature of a shingle set: `sig[i]` is the minimum of
    /// `(a_i * h(t) + b_i) mod M` over all shingles `t`.
    pub fn minhash<S: AsRef<str>>(&self, shingles: &[S]) -> Signature {
        let mut sig = vec![u64::MAX; self.perm_a.len()];
        for shingle in shingles {
            let h = xxh3_64_with_seed(shingle.as_ref().as_bytes(), self.seed) as u128;
            for (i, slot) in sig.iter_mut().enumerate() {
                let permuted = ((self.perm_a[i] as u128 * h + self.perm_b[i] as u128)
                    % MERSENNE_PRIME as u128) as u64;
                if permuted < *slot {
                    *slot = permuted;
                }
            }
        }
        sig
    }
}

/// Number of positions where two signatures agree. The Jaccard estimate is
/// `match_count / P`, but callers compare the raw count against
/// [`required_matches`] to stay in integer arithmetic.
pub fn match_count(a: &[u64], b: &[u64]) -> usize {
    a.iter().zip(b.iter()).filter(|(x, y)| x == y).count()
}

/// Minimum agreeing positions for two signatures to be considered duplicates
/// at the given threshold.
pub fn required_matches(threshold: f64, num_perm: usize) -> usize {
    (threshold * num_perm as f64).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_are_deterministic_across_instances() {
        let shingles = ["the quick brown", "quick brown fox", "brown fox jumps"];
        let a = MinHasher::new(64, 42).minhash(&shingles);
        let b = MinHasher::new(64, 42).minhash(&shingles);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_different_seeds_produce_different_signatures() {
        let shingles = ["the quick brown", "quick brown fox"];
        let a = MinHasher::new(64, 42).minhash(&shingles);
        let b = MinHasher::new(64, 43).minhash(&shingles);
        assert_ne!(a, b);
    }

    #[test]
    fn test_identical_shingle_sets_match_on_every_position() {
        let hasher = MinHasher::new(64, 42);
        let a = hasher.minhash(&["alpha beta", "beta gamma"]);
        let b = hasher.minhash(&["beta gamma", "alpha beta"]);
        // Set semantics: shingle order must not matter.
        assert_eq!(match_count(&a, &b), 64);
    }

    #[test]
    fn test_disjoint_shingle_sets_rarely_match() {
        let hasher = MinHasher::new(128, 42);
        let a = hasher.minhash(&["aa bb cc", "bb cc dd", "cc dd ee"]);
        let b = hasher.minhash(&["xx yy zz", "yy zz ww", "zz ww vv"]);
        assert!(match_count(&a, &b) < 16);
    }

    #[test]
    fn test_empty_input_leaves_signature_at_max() {
        let hasher = MinHasher::new(8, 42);
        let sig = hasher.minhash::<&str>(&[]);
        assert!(sig.iter().all(|&v| v == u64::MAX));
    }

    #[test]
    fn test_required_matches_rounds_up() {
        assert_eq!(required_matches(0.8, 64), 52); // 51.2 -> 52
        assert_eq!(required_matches(0.75, 64), 48); // exact
        assert_eq!(required_matches(0.7, 64), 45); // 44.8 -> 45
    }
}
