/// Block dequantization for every supported scheme.
///
/// Layouts follow the GGML block formats byte for byte so imported weights
/// can be copied without re-packing. Nibble convention for the 32-value
/// schemes: the value at an even linear index lives in the low nibble of its
/// byte, the odd index in the high nibble.
use crate::error::{QuernError, QuernResult};
use crate::tensor::f16::read_f16_le;
use crate::tensor::scheme::QuantScheme;
use crate::tensor::tensor::QuantTensor;

/// Dequantize one block into `out`.
///
/// `out.len()` must equal the scheme's block size and `block` must be exactly
/// one block of bytes; anything shorter fails with `ShortRead`.
pub fn dequantize_block(scheme: QuantScheme, block: &[u8], out: &mut [f32]) -> QuernResult<()> {
    if block.len() != scheme.bytes_per_block() {
        return Err(QuernError::ShortRead(format!(
            "{} block is {} bytes, got {}",
            scheme.name(),
            scheme.bytes_per_block(),
            block.len()
        )));
    }
    if out.len() != scheme.block_size() {
        return Err(QuernError::ShapeMismatch(format!(
            "output slice holds {} values, {} block holds {}",
            out.len(),
            scheme.name(),
            scheme.block_size()
        )));
    }

    dequantize_block_unchecked(scheme, block, out);
    Ok(())
}

/// Hot-path variant for the kernels. Callers guarantee `block` is exactly
/// one block and `out` is exactly one block of values; the fused matmul
/// validates shapes once per call, not once per block.
#[inline]
pub(crate) fn dequantize_block_unchecked(scheme: QuantScheme, block: &[u8], out: &mut [f32]) {
    debug_assert_eq!(block.len(), scheme.bytes_per_block());
    debug_assert_eq!(out.len(), scheme.block_size());
    match scheme {
        QuantScheme::F32 => {
            out[0] = f32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        }
        QuantScheme::F16 => {
            out[0] = read_f16_le(block);
        }
        QuantScheme::Q8_0 => dequantize_q8_0(block, out),
        QuantScheme::Q4_0 => dequantize_q4_0(block, out),
        QuantScheme::Q4_1 => dequantize_q4_1(block, out),
        QuantScheme::Q5_0 => dequantize_q5_0(block, out),
        QuantScheme::Q4K => dequantize_q4_k(block, out),
        QuantScheme::Q6K => dequantize_q6_k(block, out),
    }
}

/// Dequantize a whole tensor into a fresh f32 vector.
///
/// Only used by tests, the reference matmul, and embedding lookups for
/// non-hot paths; the fused kernels never materialize full tensors.
pub fn dequantize_tensor(tensor: &QuantTensor) -> QuernResult<Vec<f32>> {
    let scheme = tensor.scheme();
    let bs = scheme.block_size();
    let bpb = scheme.bytes_per_block();
    let data = tensor.as_bytes();
    let n_blocks = data.len() / bpb;

    let mut out = vec![0.0f32; n_blocks * bs];
    for (i, block) in data.chunks_exact(bpb).enumerate() {
        dequantize_block(scheme, block, &mut out[i * bs..(i + 1) * bs])?;
    }
    Ok(out)
}

/// Dequantize one row of a 2-D tensor into `out`. Embedding lookups and
/// small norm-weight reads use this; the matmul kernels never do.
pub fn dequantize_row(tensor: &QuantTensor, row: usize, out: &mut [f32]) -> QuernResult<()> {
    let cols = tensor.cols();
    if out.len() != cols {
        return Err(QuernError::ShapeMismatch(format!(
            "row holds {} values, output slice holds {}",
            cols,
            out.len()
        )));
    }
    let scheme = tensor.scheme();
    let bytes = tensor.row_bytes(row);
    match scheme {
        QuantScheme::F32 => {
            for (v, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
                *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        QuantScheme::F16 => {
            for (v, chunk) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                *v = read_f16_le(chunk);
            }
        }
        other => {
            let bs = other.block_size();
            for (i, block) in bytes.chunks_exact(other.bytes_per_block()).enumerate() {
                dequantize_block_unchecked(other, block, &mut out[i * bs..(i + 1) * bs]);
            }
        }
    }
    Ok(())
}

#[inline]
fn nibble(bytes: &[u8], i: usize) -> u8 {
    let b = bytes[i / 2];
    if i % 2 == 0 { b & 0x0F } else { b >> 4 }
}

fn dequantize_q8_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16_le(block);
    for (o, &q) in out.iter_mut().zip(&block[2..34]) {
        *o = d * (q as i8) as f32;
    }
}

fn dequantize_q4_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16_le(block);
    let quants = &block[2..18];
    for (i, o) in out.iter_mut().enumerate() {
        *o = d * (nibble(quants, i) as f32 - 8.0);
    }
}

fn dequantize_q4_1(block: &[u8], out: &mut [f32]) {
    let d = read_f16_le(block);
    let m = read_f16_le(&block[2..]);
    let quants = &block[4..20];
    for (i, o) in out.iter_mut().enumerate() {
        *o = d * nibble(quants, i) as f32 + m;
    }
}

fn dequantize_q5_0(block: &[u8], out: &mut [f32]) {
    let d = read_f16_le(block);
    // Bit i of the little-endian 32-bit plane is the fifth (high) bit of
    // value i.
    let high = u32::from_le_bytes([block[2], block[3], block[4], block[5]]);
    let quants = &block[6..22];
    for (i, o) in out.iter_mut().enumerate() {
        let q = (((high >> i) & 1) as u8) << 4 | nibble(quants, i);
        *o = d * (q as f32 - 16.0);
    }
}

/// Unpack the 6-bit sub-scale and sub-min for sub-block `j` from the packed
/// 12-byte field of a Q4_K super-block.
///
/// The first four sub-blocks keep their 6 bits in the low bits of bytes
/// 0..8; the last four are split across the low nibbles of bytes 8..12 and
/// the top two bits of bytes 0..8.
#[inline]
fn q4k_scale_min(j: usize, sc: &[u8]) -> (u8, u8) {
    if j < 4 {
        (sc[j] & 63, sc[j + 4] & 63)
    } else {
        (
            (sc[j + 4] & 0x0F) | ((sc[j - 4] >> 6) << 4),
            (sc[j + 4] >> 4) | ((sc[j] >> 6) << 4),
        )
    }
}

fn dequantize_q4_k(block: &[u8], out: &mut [f32]) {
    let d = read_f16_le(block);
    let dmin = read_f16_le(&block[2..]);
    let scales = &block[4..16];
    let quants = &block[16..144];

    // 4 groups of 64 values; each group is 32 bytes whose low nibbles fill
    // sub-block 2g and whose high nibbles fill sub-block 2g + 1.
    for g in 0..4 {
        let bytes = &quants[g * 32..(g + 1) * 32];
        let (sc_lo, m_lo) = q4k_scale_min(2 * g, scales);
        let (sc_hi, m_hi) = q4k_scale_min(2 * g + 1, scales);
        let d_lo = d * sc_lo as f32;
        let d_hi = d * sc_hi as f32;
        let min_lo = dmin * m_lo as f32;
        let min_hi = dmin * m_hi as f32;
        for (l, &b) in bytes.iter().enumerate() {
            out[g * 64 + l] = d_lo * (b & 0x0F) as f32 - min_lo;
            out[g * 64 + 32 + l] = d_hi * (b >> 4) as f32 - min_hi;
        }
    }
}

fn dequantize_q6_k(block: &[u8], out: &mut [f32]) {
    let ql = &block[0..128];
    let qh = &block[128..192];
    let scales = &block[192..208];
    let d = read_f16_le(&block[208..]);

    // Two halves of 128 values. Within a half, byte l of the low-nibble
    // plane and byte l of the high-bit plane feed four values spaced 32
    // apart; sub-scales cover 16 values each.
    for half in 0..2 {
        let ql = &ql[half * 64..(half + 1) * 64];
        let qh = &qh[half * 32..(half + 1) * 32];
        let sc = &scales[half * 8..(half + 1) * 8];
        let out = &mut out[half * 128..(half + 1) * 128];
        for l in 0..32 {
            let is = l / 16;
            let q1 = ((ql[l] & 0x0F) | (((qh[l]) & 3) << 4)) as i32 - 32;
            let q2 = ((ql[l + 32] & 0x0F) | (((qh[l] >> 2) & 3) << 4)) as i32 - 32;
            let q3 = ((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) as i32 - 32;
            let q4 = ((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) as i32 - 32;
            out[l] = d * (sc[is] as i8) as f32 * q1 as f32;
            out[l + 32] = d * (sc[is + 2] as i8) as f32 * q2 as f32;
            out[l + 64] = d * (sc[is + 4] as i8) as f32 * q3 as f32;
            out[l + 96] = d * (sc[is + 6] as i8) as f32 * q4 as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::f16::f32_to_f16;

    fn block_of(scheme: QuantScheme, bytes: Vec<u8>) -> Vec<f32> {
        let mut out = vec![0.0f32; scheme.block_size()];
        dequantize_block(scheme, &bytes, &mut out).unwrap();
        out
    }

    #[test]
    fn test_short_block_rejected() {
        let mut out = vec![0.0f32; 32];
        let err = dequantize_block(QuantScheme::Q8_0, &[0u8; 10], &mut out).unwrap_err();
        assert!(matches!(err, QuernError::ShortRead(_)));
    }

    #[test]
    fn test_q8_0_reference_block() {
        let mut bytes = vec![0x00, 0x3C]; // d = 1.0
        bytes.extend((0..32).map(|i| (i as i8 - 16) as u8));
        let out = block_of(QuantScheme::Q8_0, bytes);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i as f32 - 16.0);
        }
    }

    #[test]
    fn test_q4_0_nibble_parity() {
        // d = 1.0, quants 0x10, 0x32, 0x54, ... so the linear values count
        // 0, 1, 2, ... (wrapping at the nibble limit) and dequantize to
        // -8, -7, -6, ...
        let mut bytes = vec![0x00, 0x3C];
        bytes.extend((0..16u32).map(|i| ((((2 * i + 1) & 0xF) << 4) | ((2 * i) & 0xF)) as u8));
        let out = block_of(QuantScheme::Q4_0, bytes);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, (i % 16) as f32 - 8.0, "value {}", i);
        }
        assert_eq!(out[0], -8.0);
        assert_eq!(out[1], -7.0);
        assert_eq!(out[2], -6.0);
    }

    #[test]
    fn test_q4_1_uses_min() {
        // d = 0.5, m = -2.0, all quants = 3 -> 0.5 * 3 - 2.0 = -0.5
        let mut bytes = Vec::new();
        bytes.extend(f32_to_f16(0.5).to_le_bytes());
        bytes.extend(f32_to_f16(-2.0).to_le_bytes());
        bytes.extend([0x33u8; 16]);
        let out = block_of(QuantScheme::Q4_1, bytes);
        for v in out {
            assert_eq!(v, -0.5);
        }
    }

    #[test]
    fn test_q5_0_high_bit_plane() {
        // d = 1.0; high bits set for even indices only; low nibbles all 2.
        // Even values: (16 | 2) - 16 = 2. Odd values: 2 - 16 = -14.
        let mut bytes = vec![0x00, 0x3C];
        bytes.extend(0x5555_5555u32.to_le_bytes());
        bytes.extend([0x22u8; 16]);
        let out = block_of(QuantScheme::Q5_0, bytes);
        for (i, v) in out.iter().enumerate() {
            let expected = if i % 2 == 0 { 2.0 } else { -14.0 };
            assert_eq!(*v, expected, "value {}", i);
        }
    }

    /// Canonical Q4_K block. Pins the 6-bit scale/min unpacking, including
    /// the top-two-bit routing for sub-blocks 4..8, and the
    /// low-nibble/high-nibble split of the 128 quant bytes.
    #[test]
    fn test_q4_k_canonical_block() {
        let mut bytes = Vec::new();
        bytes.extend(f32_to_f16(1.0).to_le_bytes()); // d
        bytes.extend(f32_to_f16(0.5).to_le_bytes()); // dmin
        bytes.extend([
            0x41, 0x02, 0x03, 0x04, // low 6 bits: scales 1,2,3,4 (0x41 has a high bit set)
            0x85, 0x06, 0x07, 0x08, // low 6 bits: mins 5,6,7,8 (0x85 has a high bit set)
            0x21, 0x43, 0x65, 0x87, // nibbles for sub-blocks 4..8
        ]);
        bytes.extend([0x51u8; 128]); // low nibble 1, high nibble 5

        // Unpacked (scale, min) per sub-block, derived by hand from the
        // packed field above.
        let expected_sc_min = [
            (1u8, 5u8),
            (2, 6),
            (3, 7),
            (4, 8),
            (17, 34), // 0x41 and 0x85 route their top bits here
            (3, 4),
            (5, 6),
            (7, 8),
        ];
        let scales = &bytes[4..16];
        for (j, &(sc, m)) in expected_sc_min.iter().enumerate() {
            assert_eq!(q4k_scale_min(j, scales), (sc, m), "sub-block {}", j);
        }

        // Even sub-blocks read quant 1 (low nibbles), odd read 5 (high).
        let out = block_of(QuantScheme::Q4K, bytes);
        assert_eq!(out.len(), 256);
        let expected_per_sub_block = [-1.5f32, 7.0, -0.5, 16.0, 0.0, 13.0, 2.0, 31.0];
        for (i, v) in out.iter().enumerate() {
            let sb = i / 32;
            assert_eq!(*v, expected_per_sub_block[sb], "value {} (sub-block {})", i, sb);
        }
    }

    #[test]
    fn test_q6_k_zero_point() {
        // All quant bits zero, all scales 1, d = 1.0: every value is -32.
        let mut bytes = vec![0u8; 210];
        for b in bytes.iter_mut().take(208).skip(192) {
            *b = 1;
        }
        bytes[208..210].copy_from_slice(&f32_to_f16(1.0).to_le_bytes());
        let out = block_of(QuantScheme::Q6K, bytes);
        for v in out {
            assert_eq!(v, -32.0);
        }
    }

    #[test]
    fn test_q6_k_high_bits_and_scales() {
        let mut bytes = vec![0u8; 210];
        // First low-nibble byte: value 0 gets ql = 3, value 64 gets ql = 9.
        bytes[0] = (9 << 4) | 3;
        // First high-bit byte: value 0 gets qh = 1, value 64 gets qh = 2.
        bytes[128] = 0b0010_0001;
        // Negative sub-scale for the first sub-block, 2 for the rest.
        for b in bytes.iter_mut().take(208).skip(192) {
            *b = 2;
        }
        bytes[192] = (-1i8) as u8;
        bytes[208..210].copy_from_slice(&f32_to_f16(1.0).to_le_bytes());

        let out = block_of(QuantScheme::Q6K, bytes);
        // value 0: sc = -1, q = (1 << 4 | 3) - 32 = -13 -> 13
        assert_eq!(out[0], 13.0);
        // value 64: sc = 2 (scales[4]), q = (2 << 4 | 9) - 32 = 9 -> 18
        assert_eq!(out[64], 18.0);
        // value 1: sc = -1, q = -32 -> 32
        assert_eq!(out[1], 32.0);
    }

    #[test]
    fn test_f32_f16_single_value_blocks() {
        let out = block_of(QuantScheme::F32, 2.5f32.to_le_bytes().to_vec());
        assert_eq!(out, vec![2.5]);
        let out = block_of(QuantScheme::F16, f32_to_f16(-0.75).to_le_bytes().to_vec());
        assert_eq!(out, vec![-0.75]);
    }
}
