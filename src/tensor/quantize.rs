/// Quantization for the two symmetric 32-value schemes.
///
/// Only Q8_0 and Q4_0 support the quantize direction; the K-quants are
/// import-only. Per block the scale is chosen so the absolute maximum maps
/// to the edge of the quantized range, which bounds the round-trip error at
/// one scale step.
use crate::error::{QuernError, QuernResult};
use crate::tensor::f16::{f16_to_f32, f32_to_f16};

/// Quantize `values` into Q8_0 blocks. The length must be a multiple of 32.
pub fn quantize_q8_0(values: &[f32]) -> QuernResult<Vec<u8>> {
    if values.len() % 32 != 0 {
        return Err(QuernError::InvalidShape(format!(
            "{} values is not a multiple of the Q8_0 block size 32",
            values.len()
        )));
    }

    let mut out = Vec::with_capacity(values.len() / 32 * 34);
    for chunk in values.chunks_exact(32) {
        let amax = chunk.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = amax / 127.0;
        // Round-trip through f16 so dequantization sees the stored scale.
        let d_bits = f32_to_f16(d);
        let d_stored = f16_to_f32(d_bits);
        let inv = if d_stored != 0.0 { 1.0 / d_stored } else { 0.0 };

        out.extend(d_bits.to_le_bytes());
        for &v in chunk {
            let q = (v * inv).round().clamp(-127.0, 127.0) as i8;
            out.push(q as u8);
        }
    }
    Ok(out)
}

/// Quantize `values` into Q4_0 blocks. The length must be a multiple of 32.
pub fn quantize_q4_0(values: &[f32]) -> QuernResult<Vec<u8>> {
    if values.len() % 32 != 0 {
        return Err(QuernError::InvalidShape(format!(
            "{} values is not a multiple of the Q4_0 block size 32",
            values.len()
        )));
    }

    let mut out = Vec::with_capacity(values.len() / 32 * 18);
    for chunk in values.chunks_exact(32) {
        let amax = chunk.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = amax / 8.0;
        let d_bits = f32_to_f16(d);
        let d_stored = f16_to_f32(d_bits);
        let inv = if d_stored != 0.0 { 1.0 / d_stored } else { 0.0 };

        out.extend(d_bits.to_le_bytes());
        for pair in chunk.chunks_exact(2) {
            let lo = ((pair[0] * inv).round().clamp(-8.0, 7.0) + 8.0) as u8;
            let hi = ((pair[1] * inv).round().clamp(-8.0, 7.0) + 8.0) as u8;
            out.push((hi << 4) | lo);
        }
    }
    Ok(out)
}
