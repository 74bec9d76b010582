/// Fused dequantize + matmul.
///
/// Computes `C = A · Bᵀ-panels`: A is row-major f32 `m × k`, the weight
/// tensor holds `n` output panels of `k` quantized values each (one panel
/// per logical column of B, stored contiguously), and C is row-major f32
/// `m × n`. Weights are dequantized one block at a time into a stack
/// buffer; nothing is materialized per call and nothing is allocated.
///
/// The decode path (`m == 1`) is a straight fused dot per output column,
/// with an AVX2/FMA microkernel for F32 panels and Q8_0 blocks when the CPU
/// has them. The prefill path tiles rows four at a time so each weight
/// block is dequantized once per row tile while the accumulators stay in
/// registers.
use crate::error::{QuernError, QuernResult};
use crate::kernels::parallel::ParallelPolicy;
use crate::tensor::{dequantize_block_unchecked, QuantScheme, QuantTensor};

/// Largest block size across schemes; stack dequant buffers use this.
const MAX_BLOCK: usize = 256;

/// Row-tile height for the multi-row path.
const ROW_TILE: usize = 4;

/// F32/F16 panels have no natural block; group values so the inner loop has
/// the same shape as the quantized schemes.
const FLOAT_GROUP: usize = 32;

pub fn matmul_fused(
    a: &[f32],
    w: &QuantTensor,
    out: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
    policy: &ParallelPolicy,
) -> QuernResult<()> {
    if w.rows() != n || w.cols() != k {
        return Err(QuernError::ShapeMismatch(format!(
            "weight tensor is {:?}, call expects {} panels of {}",
            w.shape(),
            n,
            k
        )));
    }
    if a.len() != m * k {
        return Err(QuernError::ShapeMismatch(format!(
            "input holds {} values, expected {}x{}",
            a.len(),
            m,
            k
        )));
    }
    if out.len() != m * n {
        return Err(QuernError::ShapeMismatch(format!(
            "output holds {} values, expected {}x{}",
            out.len(),
            m,
            n
        )));
    }

    let simd = simd_available();
    if m == 1 {
        matmul_vec(a, w, out, n, policy, simd);
    } else {
        matmul_rows(a, w, out, m, k, n, policy, simd);
    }
    Ok(())
}

/// Single-row (decode) path: one fused dot per output column, columns
/// partitioned across workers.
fn matmul_vec(
    a: &[f32],
    w: &QuantTensor,
    out: &mut [f32],
    n: usize,
    policy: &ParallelPolicy,
    simd: bool,
) {
    let degree = policy.degree(n);
    if degree <= 1 {
        // straight-line path; steady-state decode must not allocate
        let mut buf = [0.0f32; MAX_BLOCK];
        for (j, val) in out.iter_mut().enumerate() {
            *val = fused_dot(a, w, j, simd, &mut buf);
        }
        return;
    }

    let chunk = n.div_ceil(degree);
    rayon::scope(|scope| {
        for (c, out_chunk) in out.chunks_mut(chunk).enumerate() {
            scope.spawn(move |_| {
                let mut buf = [0.0f32; MAX_BLOCK];
                for (o, val) in out_chunk.iter_mut().enumerate() {
                    let j = c * chunk + o;
                    *val = fused_dot(a, w, j, simd, &mut buf);
                }
            });
        }
    });
}

/// Multi-row (prefill) path: rows partitioned across workers, each worker
/// tiles its rows so a dequantized block is reused across the tile.
#[allow(clippy::too_many_arguments)]
fn matmul_rows(
    a: &[f32],
    w: &QuantTensor,
    out: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
    policy: &ParallelPolicy,
    simd: bool,
) {
    let degree = policy.degree(m);
    if degree <= 1 {
        matmul_row_range(a, w, out, 0, m, k, n, simd);
        return;
    }

    let rows_per_chunk = m.div_ceil(degree);
    rayon::scope(|scope| {
        for (c, out_chunk) in out.chunks_mut(rows_per_chunk * n).enumerate() {
            scope.spawn(move |_| {
                let row0 = c * rows_per_chunk;
                let rows = out_chunk.len() / n;
                matmul_row_range(a, w, out_chunk, row0, rows, k, n, simd);
            });
        }
    });
}

fn matmul_row_range(
    a: &[f32],
    w: &QuantTensor,
    out: &mut [f32],
    row0: usize,
    rows: usize,
    k: usize,
    n: usize,
    simd: bool,
) {
    let scheme = w.scheme();
    let (group_vals, group_bytes) = group_shape(scheme);
    let mut buf = [0.0f32; MAX_BLOCK];

    for i0 in (0..rows).step_by(ROW_TILE) {
        let tile = ROW_TILE.min(rows - i0);
        for j in 0..n {
            let panel = w.row_bytes(j);
            let mut acc = [0.0f32; ROW_TILE];
            let mut kb = 0;
            for group in panel.chunks(group_bytes) {
                let vals = dequantize_group(scheme, group, group_vals, &mut buf);
                for (r, acc_r) in acc.iter_mut().enumerate().take(tile) {
                    let a_row = &a[(row0 + i0 + r) * k + kb..][..vals];
                    *acc_r += dot_f32(a_row, &buf[..vals], simd);
                }
                kb += vals;
            }
            for r in 0..tile {
                out[(i0 + r) * n + j] = acc[r];
            }
        }
    }
}

/// Fused dot of one f32 row against one quantized weight panel.
fn fused_dot(a: &[f32], w: &QuantTensor, j: usize, simd: bool, buf: &mut [f32; MAX_BLOCK]) -> f32 {
    let scheme = w.scheme();
    let panel = w.row_bytes(j);

    #[cfg(target_arch = "x86_64")]
    if simd && scheme == QuantScheme::Q8_0 {
        // Integer-load microkernel: the block's int8 quants go straight
        // into the FMA lanes without a staging buffer.
        return unsafe { dot_q8_0_panel_avx2(a, panel) };
    }

    let (group_vals, group_bytes) = group_shape(scheme);
    let mut sum = 0.0f32;
    let mut kb = 0;
    for group in panel.chunks(group_bytes) {
        let vals = dequantize_group(scheme, group, group_vals, buf);
        sum += dot_f32(&a[kb..kb + vals], &buf[..vals], simd);
        kb += vals;
    }
    sum
}

/// (values, bytes) per inner-loop group for a scheme.
fn group_shape(scheme: QuantScheme) -> (usize, usize) {
    match scheme {
        QuantScheme::F32 => (FLOAT_GROUP, FLOAT_GROUP * 4),
        QuantScheme::F16 => (FLOAT_GROUP, FLOAT_GROUP * 2),
        other => (other.block_size(), other.bytes_per_block()),
    }
}

/// Dequantize one group into `buf`, returning the value count (the final
/// F32/F16 group of a panel may be short).
#[inline]
fn dequantize_group(
    scheme: QuantScheme,
    group: &[u8],
    group_vals: usize,
    buf: &mut [f32; MAX_BLOCK],
) -> usize {
    match scheme {
        QuantScheme::F32 => {
            let vals = group.len() / 4;
            for (v, chunk) in buf.iter_mut().zip(group.chunks_exact(4)) {
                *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            vals
        }
        QuantScheme::F16 => {
            let vals = group.len() / 2;
            for (v, chunk) in buf.iter_mut().zip(group.chunks_exact(2)) {
                *v = crate::tensor::f16_to_f32(u16::from_le_bytes([chunk[0], chunk[1]]));
            }
            vals
        }
        other => {
            dequantize_block_unchecked(other, group, &mut buf[..group_vals]);
            group_vals
        }
    }
}

#[inline]
fn simd_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

#[inline]
fn dot_f32(a: &[f32], b: &[f32], simd: bool) -> f32 {
    #[cfg(target_arch = "x86_64")]
    if simd {
        return unsafe { dot_f32_avx2(a, b) };
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = simd;
    dot_f32_scalar(a, b)
}

/// Scalar fallback with four independent accumulators; correct for any
/// length, used whenever SIMD is unavailable or the slice is short.
fn dot_f32_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for c in 0..chunks {
        let i = c * 4;
        acc[0] += a[i] * b[i];
        acc[1] += a[i + 1] * b[i + 1];
        acc[2] += a[i + 2] * b[i + 2];
        acc[3] += a[i + 3] * b[i + 3];
    }
    let mut sum = (acc[0] + acc[1]) + (acc[2] + acc[3]);
    for i in chunks * 4..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_f32_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let chunks = a.len() / 8;
    for c in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(c * 8));
        let vb = _mm256_loadu_ps(b.as_ptr().add(c * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }
    let mut sum = hsum_avx2(acc);
    for i in chunks * 8..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dot_q8_0_panel_avx2(a: &[f32], panel: &[u8]) -> f32 {
    use std::arch::x86_64::*;

    let mut total = 0.0f32;
    for (b, block) in panel.chunks_exact(34).enumerate() {
        let d = crate::tensor::f16_to_f32(u16::from_le_bytes([block[0], block[1]]));
        let q = &block[2..34];
        let a_block = &a[b * 32..];

        let mut acc = _mm256_setzero_ps();
        for c in 0..4 {
            let qi8 = _mm_loadl_epi64(q.as_ptr().add(c * 8) as *const __m128i);
            let qi32 = _mm256_cvtepi8_epi32(qi8);
            let qf = _mm256_cvtepi32_ps(qi32);
            let va = _mm256_loadu_ps(a_block.as_ptr().add(c * 8));
            acc = _mm256_fmadd_ps(va, qf, acc);
        }
        total += d * hsum_avx2(acc);
    }
    total
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn hsum_avx2(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let hi = _mm256_extractf128_ps(v, 1);
    let lo = _mm256_castps256_ps128(v);
    let s = _mm_add_ps(hi, lo);
    let s = _mm_add_ps(s, _mm_movehl_ps(s, s));
    let s = _mm_add_ss(s, _mm_shuffle_ps(s, s, 1));
    _mm_cvtss_f32(s)
}
