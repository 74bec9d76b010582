/// Softmax and the long-reduction summation helpers.
///
/// Reductions longer than [`PAIRWISE_THRESHOLD`] switch from a running sum
/// to pairwise summation, which keeps relative error flat as attention rows
/// and vocab-sized logit vectors grow.

/// Above this length, sums are computed pairwise.
pub const PAIRWISE_THRESHOLD: usize = 256;

/// Sum with error growth O(log n) instead of O(n).
pub fn pairwise_sum(values: &[f32]) -> f32 {
    if values.len() <= 32 {
        return values.iter().sum();
    }
    let mid = values.len() / 2;
    pairwise_sum(&values[..mid]) + pairwise_sum(&values[mid..])
}

/// Sum dispatch used by the normalization and softmax kernels.
#[inline]
pub fn stable_sum(values: &[f32]) -> f32 {
    if values.len() > PAIRWISE_THRESHOLD {
        pairwise_sum(values)
    } else {
        values.iter().sum()
    }
}

/// In-place softmax with max subtraction.
///
/// `-inf` entries come out as exact zeros, which is how masked attention
/// positions and filtered logits are represented. If every entry is `-inf`
/// the row is left all-zero rather than NaN.
pub fn softmax_inplace(values: &mut [f32]) {
    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        values.fill(0.0);
        return;
    }

    for v in values.iter_mut() {
        *v = if v.is_finite() { (*v - max).exp() } else { 0.0 };
    }
    let sum = stable_sum(values);
    if sum > 0.0 {
        let inv = 1.0 / sum;
        for v in values.iter_mut() {
            *v *= inv;
        }
    }
}
