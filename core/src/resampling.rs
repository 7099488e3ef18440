//! Log-domain weight utilities and ancestor resampling schemes.
//!
//! Every scheme here returns *indices* into the weighted population rather than copies
//! of particles, so the caller can record them as ancestor pointers. Weights passed in
//! are expected to be normalized; the cumulative sums are renormalized anyway to absorb
//! round-off.
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Scheme used to draw the ancestors of the free particle slots.
///
/// In a conditioned population the free slots are drawn with
/// [`sample_conditional`](Self::sample_conditional): the reference slot counts as one
/// uniformly placed output of a full `N`-slot draw whose ancestor is already known, and
/// the other `N - 1` outputs follow the scheme's law given that. Drawing the free slots
/// with an unconditional low-variance scheme instead would not leave the posterior
/// invariant. The scheme is chosen once per run and held fixed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResamplingStrategy {
    Multinomial,
    #[default]
    Systematic,
    Stratified,
    Residual,
}

impl ResamplingStrategy {
    /// Draw `count` ancestor indices from `weights`.
    pub fn sample_indices<R: Rng + ?Sized>(
        &self,
        weights: &[f64],
        count: usize,
        rng: &mut R,
    ) -> Vec<usize> {
        match self {
            ResamplingStrategy::Multinomial => multinomial_resample(weights, count, rng),
            ResamplingStrategy::Systematic => systematic_resample(weights, count, rng),
            ResamplingStrategy::Stratified => stratified_resample(weights, count, rng),
            ResamplingStrategy::Residual => residual_resample(weights, count, rng),
        }
    }

    /// Draw `count` ancestor indices given that the remaining output of a
    /// `count + 1` draw from `weights` took ancestor `anchor`.
    pub fn sample_conditional<R: Rng + ?Sized>(
        &self,
        weights: &[f64],
        anchor: usize,
        count: usize,
        rng: &mut R,
    ) -> Vec<usize> {
        match self {
            ResamplingStrategy::Multinomial => multinomial_resample(weights, count, rng),
            ResamplingStrategy::Systematic => {
                conditional_systematic_resample(weights, anchor, count, rng)
            }
            ResamplingStrategy::Stratified => {
                conditional_stratified_resample(weights, anchor, count, rng)
            }
            ResamplingStrategy::Residual => {
                conditional_residual_resample(weights, anchor, count, rng)
            }
        }
    }
}

/// Numerically stable `ln Σ exp(x_i)`.
///
/// Returns -inf for an empty slice or when every entry is -inf, and NaN if any entry
/// is NaN.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    if values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Normalized weights `exp(x_i - lse(x))`, or `None` when the log-weights carry no
/// mass (all -inf), contain NaN, or overflow.
pub fn normalize_log_weights(log_weights: &[f64]) -> Option<Vec<f64>> {
    let lse = log_sum_exp(log_weights);
    if !lse.is_finite() {
        return None;
    }
    Some(log_weights.iter().map(|&lw| (lw - lse).exp()).collect())
}

/// N_eff = 1 / Σ w_i²
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_of_squares: f64 = weights.iter().map(|w| w * w).sum();
    if sum_of_squares > 0.0 {
        1.0 / sum_of_squares
    } else {
        0.0
    }
}

/// Draw a single index from the categorical distribution given by `weights`.
pub fn sample_categorical<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let cdf = cumulative(weights);
    let u: f64 = rng.random();
    locate(&cdf, u)
}

pub fn multinomial_resample<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let cdf = cumulative(weights);
    (0..count)
        .map(|_| {
            let u: f64 = rng.random();
            locate(&cdf, u)
        })
        .collect()
}

/// One uniform offset, `count` evenly spaced positions.
pub fn systematic_resample<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let step = 1.0 / count as f64;
    let offset: f64 = rng.random::<f64>() * step;
    let positions: Vec<f64> = (0..count).map(|k| offset + k as f64 * step).collect();
    walk_sorted(&cumulative(weights), &positions)
}

/// One uniform draw inside each of `count` equal strata.
pub fn stratified_resample<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let step = 1.0 / count as f64;
    let positions: Vec<f64> = (0..count)
        .map(|k| (k as f64 + rng.random::<f64>()) * step)
        .collect();
    walk_sorted(&cumulative(weights), &positions)
}

/// Deterministic `floor(count * w_i)` copies, remainder drawn systematically from the
/// residual weights.
pub fn residual_resample<R: Rng + ?Sized>(
    weights: &[f64],
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(count);
    let mut residual = vec![0.0; weights.len()];
    for (i, &w) in weights.iter().enumerate() {
        let scaled = w / total * count as f64;
        let copies = scaled.floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual[i] = scaled - copies as f64;
    }
    let remaining = count.saturating_sub(indices.len());
    if remaining > 0 {
        indices.extend(systematic_resample(&residual, remaining, rng));
    }
    indices.truncate(count);
    indices
}

/// Systematic draw over `count + 1` positions with the `anchor` output removed.
///
/// The anchored position is uniform on the anchor's cdf interval; it fixes both the
/// shared offset and the slot it occupies.
pub fn conditional_systematic_resample<R: Rng + ?Sized>(
    weights: &[f64],
    anchor: usize,
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    if count == 0 || weights.is_empty() {
        return Vec::new();
    }
    let slots = count + 1;
    let step = 1.0 / slots as f64;
    let cdf = cumulative(weights);
    let (pinned, offset) = anchored_stratum(&cdf, anchor, slots, rng);
    let positions: Vec<f64> = (0..slots)
        .filter(|&k| k != pinned)
        .map(|k| (k as f64 + offset) * step)
        .collect();
    walk_sorted(&cdf, &positions)
}

/// Stratified draw over `count + 1` strata; the anchor takes one stratum, the others
/// draw independently.
pub fn conditional_stratified_resample<R: Rng + ?Sized>(
    weights: &[f64],
    anchor: usize,
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    if count == 0 || weights.is_empty() {
        return Vec::new();
    }
    let slots = count + 1;
    let step = 1.0 / slots as f64;
    let cdf = cumulative(weights);
    let (pinned, _) = anchored_stratum(&cdf, anchor, slots, rng);
    let positions: Vec<f64> = (0..slots)
        .filter(|&k| k != pinned)
        .map(|k| (k as f64 + rng.random::<f64>()) * step)
        .collect();
    walk_sorted(&cdf, &positions)
}

/// Residual draw over `count + 1` outputs with one output fixed to `anchor`.
///
/// The anchor is one of its own deterministic copies with probability
/// `floor(m w_a) / (m w_a)`; otherwise it is one of the residual draws, which are then
/// drawn with [`conditional_systematic_resample`].
pub fn conditional_residual_resample<R: Rng + ?Sized>(
    weights: &[f64],
    anchor: usize,
    count: usize,
    rng: &mut R,
) -> Vec<usize> {
    if count == 0 || weights.is_empty() {
        return Vec::new();
    }
    let slots = count + 1;
    let total: f64 = weights.iter().sum();
    let mut indices = Vec::with_capacity(slots);
    let mut residual = vec![0.0; weights.len()];
    let (mut anchor_scaled, mut anchor_copies) = (0.0, 0);
    for (i, &w) in weights.iter().enumerate() {
        let scaled = w / total * slots as f64;
        let copies = scaled.floor() as usize;
        indices.extend(std::iter::repeat_n(i, copies));
        residual[i] = scaled - copies as f64;
        if i == anchor {
            (anchor_scaled, anchor_copies) = (scaled, copies);
        }
    }
    let remaining = slots.saturating_sub(indices.len());
    let anchor_is_copy =
        remaining == 0 || rng.random::<f64>() * anchor_scaled < anchor_copies as f64;
    if anchor_is_copy {
        match indices.iter().position(|&i| i == anchor) {
            Some(pos) => {
                indices.remove(pos);
            }
            None => {
                indices.pop();
            }
        }
        if remaining > 0 {
            indices.extend(systematic_resample(&residual, remaining, rng));
        }
    } else {
        indices.extend(conditional_systematic_resample(
            &residual,
            anchor,
            remaining - 1,
            rng,
        ));
    }
    indices.truncate(count);
    indices
}

/// Uniform position on the anchor's cdf interval, split into its stratum among
/// `slots` and the offset inside that stratum.
fn anchored_stratum<R: Rng + ?Sized>(
    cdf: &[f64],
    anchor: usize,
    slots: usize,
    rng: &mut R,
) -> (usize, f64) {
    let anchor = anchor.min(cdf.len() - 1);
    let lo = if anchor == 0 { 0.0 } else { cdf[anchor - 1] };
    let hi = cdf[anchor];
    let u = (lo + (hi - lo) * rng.random::<f64>()) * slots as f64;
    let stratum = (u.floor() as usize).min(slots - 1);
    (stratum, (u - stratum as f64).clamp(0.0, 1.0))
}

/// Normalized cumulative sum with the last entry pinned to exactly 1.
fn cumulative(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    let mut acc = 0.0;
    let mut cdf: Vec<f64> = weights
        .iter()
        .map(|w| {
            acc += w / total;
            acc
        })
        .collect();
    if let Some(last) = cdf.last_mut() {
        *last = 1.0;
    }
    cdf
}

/// First index whose cumulative weight exceeds `u`, skipping zero-weight entries.
fn locate(cdf: &[f64], u: f64) -> usize {
    cdf.partition_point(|&c| c <= u).min(cdf.len() - 1)
}

fn walk_sorted(cdf: &[f64], positions: &[f64]) -> Vec<usize> {
    let mut indices = Vec::with_capacity(positions.len());
    let mut i = 0;
    for &u in positions {
        while i + 1 < cdf.len() && cdf[i] <= u {
            i += 1;
        }
        indices.push(i);
    }
    indices
}
