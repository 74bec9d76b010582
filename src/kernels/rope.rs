/// Rotary positional embeddings.
///
/// Rotates adjacent pairs within each head by an angle that depends on the
/// absolute position and the pair index: theta_j = base^(-2j/d), angle =
/// pos * theta_j. Applied to Q and K after projection, before the cache
/// write, so cached keys are already position-encoded.

/// Rotate all heads of one token's projection in place.
///
/// `x` is `n_heads * head_dim` values; `pos` is the absolute position of
/// the token (prefill offset included).
pub fn apply_rope(x: &mut [f32], pos: usize, n_heads: usize, head_dim: usize, theta_base: f32) {
    debug_assert_eq!(x.len(), n_heads * head_dim);
    debug_assert_eq!(head_dim % 2, 0);

    for head in x.chunks_mut(head_dim) {
        for j in 0..head_dim / 2 {
            let freq = theta_base.powf(-2.0 * j as f32 / head_dim as f32);
            let angle = pos as f32 * freq;
            let (sin, cos) = angle.sin_cos();
            let a = head[2 * j];
            let b = head[2 * j + 1];
            head[2 * j] = a * cos - b * sin;
            head[2 * j + 1] = a * sin + b * cos;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_is_identity() {
        let mut x = vec![0.3, -1.2, 2.0, 0.7];
        let original = x.clone();
        apply_rope(&mut x, 0, 2, 2, 10_000.0);
        assert_eq!(x, original);
    }

    #[test]
    fn test_rotation_preserves_pair_norm() {
        let mut x = vec![1.0, 2.0, -0.5, 0.25];
        apply_rope(&mut x, 17, 1, 4, 10_000.0);
        let norm0 = x[0] * x[0] + x[1] * x[1];
        let norm1 = x[2] * x[2] + x[3] * x[3];
        assert!((norm0 - 5.0).abs() < 1e-4);
        assert!((norm1 - 0.3125).abs() < 1e-5);
    }

    #[test]
    fn test_first_pair_rotates_by_position() {
        // For j = 0 the frequency is 1, so the first pair rotates by
        // exactly `pos` radians.
        let mut x = vec![1.0, 0.0];
        apply_rope(&mut x, 2, 1, 2, 10_000.0);
        assert!((x[0] - 2.0f32.cos()).abs() < 1e-6);
        assert!((x[1] - 2.0f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_relative_rotation_composes() {
        // Rotating a vector at pos a then comparing against pos b encodes
        // relative distance: angle(b) - angle(a) = (b - a) for j = 0.
        let mut at_3 = vec![1.0, 0.0];
        let mut at_5 = vec![1.0, 0.0];
        apply_rope(&mut at_3, 3, 1, 2, 10_000.0);
        apply_rope(&mut at_5, 5, 1, 2, 10_000.0);
        let dot = at_3[0] * at_5[0] + at_3[1] * at_5[1];
        assert!((dot - 2.0f32.cos()).abs() < 1e-5);
    }

    #[test]
    fn test_heads_rotate_independently_but_identically() {
        let mut x = vec![1.0, 0.0, 1.0, 0.0];
        apply_rope(&mut x, 4, 2, 2, 10_000.0);
        assert_eq!(x[0], x[2]);
        assert_eq!(x[1], x[3]);
    }
}
