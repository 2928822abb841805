//! Sampler: turns next-token logits into a token id.
//!
//! Pipeline: repetition penalty -> temperature -> top-k -> top-p -> a
//! categorical draw. A pure function of `(logits, history, params, rng)` —
//! reordering any two stages changes observable output, which is exactly
//! the property under test.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Sampling knobs carried on a [`crate::scheduler::request::Request`].
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

/// Process-wide generator used by requests with `seed = None`. Its state
/// advances across requests but is never observable except through the
/// token streams it drives, matching §4.4's "no cross-request leakage via
/// any channel but the output itself" rule.
static SHARED_RNG: Lazy<Mutex<ChaCha8Rng>> = Lazy::new(|| Mutex::new(ChaCha8Rng::seed_from_u64(0)));

enum SamplerRng {
    Seeded(ChaCha8Rng),
    Shared,
}

/// One request's sampler instance: owns its own RNG (seeded or shared) so
/// concurrent requests never contend beyond the shared generator's mutex.
pub struct Sampler {
    params: SamplingParams,
    rng: SamplerRng,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let rng = match params.seed {
            Some(seed) => SamplerRng::Seeded(ChaCha8Rng::seed_from_u64(seed)),
            None => SamplerRng::Shared,
        };
        Self { params, rng }
    }

    /// `argmax` with the lowest-token-id tie-break.
    fn argmax(logits: &[f32]) -> u32 {
        let mut best_idx = 0usize;
        let mut best_val = f32::NEG_INFINITY;
        for (i, &v) in logits.iter().enumerate() {
            if v > best_val {
                best_val = v;
                best_idx = i;
            }
        }
        best_idx as u32
    }

    fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
        if penalty == 1.0 {
            return;
        }
        for &token_id in history {
            let idx = token_id as usize;
            if idx >= logits.len() {
                continue;
            }
            let v = logits[idx];
            logits[idx] = if v > 0.0 { v / penalty } else { v * penalty };
        }
    }

    fn apply_temperature(logits: &mut [f32], temperature: f32) {
        for v in logits.iter_mut() {
            *v /= temperature;
        }
    }

    /// Keep the top `k` logits by value, masking the rest to `-inf`. Uses
    /// strict `>` comparisons and keeps the first-seen index among equal
    /// logits, so ties resolve by ascending token id.
    fn apply_top_k(logits: &mut [f32], k: usize) {
        if k == 0 || k >= logits.len() {
            return;
        }
        let mut indices: Vec<usize> = (0..logits.len()).collect();
        indices.sort_by(|&a, &b| {
            logits[b]
                .partial_cmp(&logits[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let cutoff_value = logits[indices[k - 1]];
        for (rank, &idx) in indices.iter().enumerate() {
            let keep = if logits[idx] > cutoff_value {
                true
            } else {
                rank < k
            };
            if !keep {
                logits[idx] = f32::NEG_INFINITY;
            }
        }
    }

    /// Nucleus sampling: over softmax probabilities sorted descending,
    /// keep the smallest prefix whose cumulative probability is >= `p`,
    /// including the element that crosses the threshold.
    fn apply_top_p(probs: &mut [f32], p: f32) {
        let mut indices: Vec<usize> = (0..probs.len()).collect();
        indices.sort_by(|&a, &b| {
            probs[b]
                .partial_cmp(&probs[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let mut cumulative = 0.0f32;
        let mut cutoff = indices.len();
        for (rank, &idx) in indices.iter().enumerate() {
            cumulative += probs[idx];
            if cumulative >= p {
                cutoff = rank + 1;
                break;
            }
        }
        for &idx in &indices[cutoff..] {
            probs[idx] = 0.0;
        }
        let sum: f32 = probs.iter().sum();
        if sum > 0.0 {
            for v in probs.iter_mut() {
                *v /= sum;
            }
        }
    }

    fn draw_categorical(&mut self, probs: &[f32]) -> u32 {
        let dist = match WeightedIndex::new(probs) {
            Ok(d) => d,
            Err(_) => return Self::argmax(probs),
        };
        let idx = match &mut self.rng {
            SamplerRng::Seeded(rng) => dist.sample(rng),
            SamplerRng::Shared => dist.sample(&mut *SHARED_RNG.lock()),
        };
        idx as u32
    }

    /// Run the full pipeline and return the sampled token id.
    pub fn sample(&mut self, logits: &[f32], history: &[u32]) -> u32 {
        if self.params.temperature == 0.0 {
            return Self::argmax(logits);
        }

        let mut logits = logits.to_vec();
        Self::apply_repetition_penalty(&mut logits, history, self.params.repetition_penalty);
        Self::apply_temperature(&mut logits, self.params.temperature);

        if let Some(k) = self.params.top_k {
            Self::apply_top_k(&mut logits, k);
        }

        let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut probs: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
        let sum: f32 = probs.iter().sum();
        if sum > 0.0 {
            for v in probs.iter_mut() {
                *v /= sum;
            }
        }

        if let Some(p) = self.params.top_p {
            Self::apply_top_p(&mut probs, p);
        }

        self.draw_categorical(&probs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_zero_is_argmax() {
        let mut sampler = Sampler::new(SamplingParams {
            temperature: 0.0,
            ..Default::default()
        });
        let logits = vec![0.1, 0.9, 0.5, 0.9]; // tie at indices 1 and 3
        assert_eq!(sampler.sample(&logits, &[]), 1, "lowest index wins ties");
    }

    #[test]
    fn test_seeded_sampler_is_deterministic() {
        let logits = vec![1.0, 2.0, 0.5, 3.0];
        let mut a = Sampler::new(SamplingParams {
            temperature: 1.0,
            seed: Some(42),
            ..Default::default()
        });
        let mut b = Sampler::new(SamplingParams {
            temperature: 1.0,
            seed: Some(42),
            ..Default::default()
        });
        let ta = a.sample(&logits, &[]);
        let tb = b.sample(&logits, &[]);
        assert_eq!(ta, tb);
    }

    #[test]
    fn test_top_k_masks_all_but_k() {
        let mut logits = vec![1.0, 5.0, 3.0, 2.0, 4.0];
        Sampler::apply_top_k(&mut logits, 2);
        let finite = logits.iter().filter(|&&v| v.is_finite()).count();
        assert_eq!(finite, 2);
        assert!(logits[1].is_finite() && logits[4].is_finite());
    }

    #[test]
    fn test_repetition_penalty_reduces_repeated_token() {
        let mut logits = vec![2.0, 2.0];
        Sampler::apply_repetition_penalty(&mut logits, &[0], 2.0);
        assert!(logits[0] < logits[1]);
    }

    #[test]
    fn test_top_p_keeps_crossing_element() {
        let mut probs = vec![0.5, 0.3, 0.1, 0.1];
        Sampler::apply_top_p(&mut probs, 0.8);
        // 0.5 + 0.3 = 0.8 crosses threshold at rank 2 (inclusive)
        assert!(probs[0] > 0.0 && probs[1] > 0.0);
        assert_eq!(probs[2], 0.0);
        assert_eq!(probs[3], 0.0);
    }
}
