//! KL-divergence threshold search.
//!
//! Builds a histogram of absolute activation values, then for every
//! candidate clipping point compares the clipped reference distribution
//! with its `levels`-bucket quantized approximation. The candidate with
//! the smallest divergence wins; ties go to the lower candidate.

use rayon::prelude::*;

/// Floor for an empty quantized bin that the reference distribution hits.
const EPSILON: f64 = 1e-10;

/// Histogram geometry of the search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KlSearch {
    pub bins: usize,
    pub levels: usize,
}

impl Default for KlSearch {
    fn default() -> Self {
        Self {
            bins: 2048,
            levels: 128,
        }
    }
}

impl KlSearch {
    pub fn new(bins: usize, levels: usize) -> Self {
        Self { bins, levels }
    }

    /// Clipping threshold for `data`: a non-negative magnitude no larger
    /// than `max |x|`. All-zero (or empty) data yields 0.
    pub fn threshold(&self, data: &[f32]) -> f32 {
        let max = data.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        if max <= 0.0 || !max.is_finite() || self.bins == 0 {
            return max.max(0.0);
        }
        let width = max / self.bins as f32;
        if self.levels == 0 || self.levels >= self.bins {
            return max;
        }

        let hist = histogram(data, max, self.bins);
        let (_, best) = (self.levels..=self.bins)
            .into_par_iter()
            .map(|i| (divergence(&hist, i, self.levels), i))
            .reduce_with(|a, b| match a.0.total_cmp(&b.0) {
                std::cmp::Ordering::Less => a,
                std::cmp::Ordering::Greater => b,
                std::cmp::Ordering::Equal => {
                    if a.1 <= b.1 {
                        a
                    } else {
                        b
                    }
                }
            })
            .unwrap_or((0.0, self.bins));
        best as f32 * width
    }
}

fn histogram(data: &[f32], max: f32, bins: usize) -> Vec<f64> {
    let mut hist = vec![0.0f64; bins];
    let scale = bins as f64 / max as f64;
    for v in data {
        let idx = ((v.abs() as f64) * scale) as usize;
        hist[idx.min(bins - 1)] += 1.0;
    }
    hist
}

/// Divergence of clipping the histogram to its first `keep` bins.
fn divergence(hist: &[f64], keep: usize, levels: usize) -> f64 {
    let mut reference = hist[..keep].to_vec();
    let outliers: f64 = hist[keep..].iter().sum();
    reference[keep - 1] += outliers;

    let mut candidate = vec![0.0f64; keep];
    let stride = keep as f64 / levels as f64;
    for level in 0..levels {
        let start = (level as f64 * stride).floor() as usize;
        let end = if level + 1 == levels {
            keep
        } else {
            ((level + 1) as f64 * stride).floor() as usize
        };
        let window = &hist[start..end];
        let nonzero = window.iter().filter(|&&v| v > 0.0).count();
        if nonzero == 0 {
            continue;
        }
        let mean = window.iter().sum::<f64>() / nonzero as f64;
        for (slot, &v) in candidate[start..end].iter_mut().zip(window) {
            if v > 0.0 {
                *slot = mean;
            }
        }
    }

    let p_total: f64 = reference.iter().sum();
    let q_total: f64 = candidate.iter().sum();
    if p_total <= 0.0 || q_total <= 0.0 {
        return f64::INFINITY;
    }
    reference
        .iter()
        .zip(&candidate)
        .filter(|&(&p, _)| p > 0.0)
        .map(|(&p, &q)| {
            let p = p / p_total;
            let q = (q / q_total).max(EPSILON);
            p * (p / q).ln()
        })
        .sum()
}
