use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::Signature;

/// Integration step for the false positive/negative probability curves.
const INTEGRATION_STEP: f64 = 0.01;

/// Banding layout for a signature: `bands` slices of `band_length` rows each,
/// with `bands * band_length <= num_perm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandPlan {
    pub bands: usize,
    pub band_length: usize,
}

impl BandPlan {
    pub fn rows_used(&self) -> usize {
        self.bands * self.band_length
    }
}

/// Probability that two documents with Jaccard similarity `s` share at least
/// one band bucket under `(bands, rows)`.
fn collision_probability(s: f64, bands: usize, rows: usize) -> f64 {
    1.0 - (1.0 - s.powi(rows as i32)).powi(bands as i32)
}

fn false_positive_area(threshold: f64, bands: usize, rows: usize) -> f64 {
    let mut area = 0.0;
    let mut s = 0.0;
    while s < threshold {
        area += collision_probability(s, bands, rows) * INTEGRATION_STEP;
        s += INTEGRATION_STEP;
    }
    area
}

fn false_negative_area(threshold: f64, bands: usize, rows: usize) -> f64 {
    let mut area = 0.0;
    let mut s = threshold;
    while s < 1.0 {
        area += (1.0 - collision_probability(s, bands, rows)) * INTEGRATION_STEP;
        s += INTEGRATION_STEP;
    }
    area
}

/// Grid search over every feasible `(bands, rows)` pair for the layout that
/// minimizes the weighted false positive/negative areas around `threshold`.
/// Ties go to the layout with more bands (more recall).
pub fn optimal_band_plan(
    threshold: f64,
    num_perm: usize,
    false_positive_weight: f64,
    false_negative_weight: f64,
) -> BandPlan {
    let mut best = BandPlan {
        bands: 1,
        band_length: 1,
    };
    let mut best_error = f64::MAX;
    for bands in 1..=num_perm {
        let max_rows = num_perm / bands;
        for rows in 1..=max_rows {
            let fp = false_positive_area(threshold, bands, rows);
            let fn_ = false_negative_area(threshold, bands, rows);
            let error = fp * false_positive_weight + fn_ * false_negative_weight;
            if error < best_error - f64::EPSILON
                || ((error - best_error).abs() <= f64::EPSILON && bands > best.bands)
            {
                best_error = error;
                best = BandPlan {
                    bands,
                    band_length: rows,
                };
            }
        }
    }
    best
}

/// Hashes each band slice of the signature to its 64-bit bucket key. The
/// band index is implied by the slice offset, so two different bands hashing
/// to the same key is an acceptable (rare) false candidate.
pub fn band_keys(signature: &Signature, plan: &BandPlan, seed: u64) -> Vec<u64> {
    let mut keys = Vec::with_capacity(plan.bands);
    let mut buf = Vec::with_capacity(plan.band_length * 8);
    for band in 0..plan.bands {
        buf.clear();
        let slice = &signature[band * plan.band_length..(band + 1) * plan.band_length];
        for value in slice {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        keys.push(xxh3_64_with_seed(&buf, seed));
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::minhash::MinHasher;

    #[test]
    fn test_plan_is_feasible() {
        for num_perm in [16, 64, 128, 256] {
            for threshold in [0.5, 0.7, 0.8, 0.9] {
                let plan = optimal_band_plan(threshold, num_perm, 0.5, 0.5);
                assert!(plan.rows_used() <= num_perm, "{plan:?} for P={num_perm}");
                assert!(plan.bands >= 1 && plan.band_length >= 1);
            }
        }
    }

    #[test]
    fn test_lower_thresholds_prefer_more_bands() {
        let loose = optimal_band_plan(0.3, 64, 0.5, 0.5);
        let strict = optimal_band_plan(0.9, 64, 0.5, 0.5);
        assert!(loose.bands >= strict.bands);
        assert!(loose.band_length <= strict.band_length);
    }

    #[test]
    fn test_band_keys_are_deterministic() {
        let hasher = MinHasher::new(64, 42);
        let sig = hasher.minhash(&["a b c", "b c d"]);
        let plan = optimal_band_plan(0.8, 64, 0.5, 0.5);
        let a = band_keys(&sig, &plan, 42);
        let b = band_keys(&sig, &plan, 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), plan.bands);
    }

    #[test]
    fn test_identical_signatures_share_every_band() {
        let hasher = MinHasher::new(64, 42);
        let plan = optimal_band_plan(0.8, 64, 0.5, 0.5);
        let a = hasher.minhash(&["same text here", "text here again"]);
        let b = hasher.minhash(&["text here again", "same text here"]);
        assert_eq!(band_keys(&a, &plan, 42), band_keys(&b, &plan, 42));
    }
}
