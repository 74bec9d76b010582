use crate::error::{QuernError, QuernResult};

/// Quantization scheme of a weight tensor.
///
/// The discriminant values match the scheme tags in the model file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QuantScheme {
    F32 = 0,
    F16 = 1,
    Q8_0 = 2,
    Q4_0 = 3,
    Q4_1 = 4,
    Q5_0 = 5,
    Q4K = 6,
    Q6K = 7,
}

impl QuantScheme {
    /// Parse an on-disk scheme tag. Unknown tags are rejected so a newer
    /// file format cannot be silently misread.
    pub fn from_tag(tag: u8) -> QuernResult<Self> {
        match tag {
            0 => Ok(QuantScheme::F32),
            1 => Ok(QuantScheme::F16),
            2 => Ok(QuantScheme::Q8_0),
            3 => Ok(QuantScheme::Q4_0),
            4 => Ok(QuantScheme::Q4_1),
            5 => Ok(QuantScheme::Q5_0),
            6 => Ok(QuantScheme::Q4K),
            7 => Ok(QuantScheme::Q6K),
            other => Err(QuernError::UnsupportedScheme(format!("tag {}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QuantScheme::F32 => "F32",
            QuantScheme::F16 => "F16",
            QuantScheme::Q8_0 => "Q8_0",
            QuantScheme::Q4_0 => "Q4_0",
            QuantScheme::Q4_1 => "Q4_1",
            QuantScheme::Q5_0 => "Q5_0",
            QuantScheme::Q4K => "Q4_K",
            QuantScheme::Q6K => "Q6_K",
        }
    }

    /// Values per block. F32/F16 are treated as blocks of one value.
    pub fn block_size(&self) -> usize {
        match self {
            QuantScheme::F32 | QuantScheme::F16 => 1,
            QuantScheme::Q8_0 | QuantScheme::Q4_0 | QuantScheme::Q4_1 | QuantScheme::Q5_0 => 32,
            QuantScheme::Q4K | QuantScheme::Q6K => 256,
        }
    }

    /// Bytes per block in the on-disk layout.
    pub fn bytes_per_block(&self) -> usize {
        match self {
            QuantScheme::F32 => 4,
            QuantScheme::F16 => 2,
            // f16 scale + 32 int8 quants
            QuantScheme::Q8_0 => 2 + 32,
            // f16 scale + 16 packed nibble bytes
            QuantScheme::Q4_0 => 2 + 16,
            // f16 scale + f16 min + 16 packed nibble bytes
            QuantScheme::Q4_1 => 2 + 2 + 16,
            // f16 scale + 4-byte high-bit plane + 16 low-nibble bytes
            QuantScheme::Q5_0 => 2 + 4 + 16,
            // f16 d + f16 dmin + 12 packed 6-bit scales/mins + 128 nibble bytes
            QuantScheme::Q4K => 2 + 2 + 12 + 128,
            // 128 low-nibble bytes + 64 high-bit bytes + 16 int8 scales + f16 d
            QuantScheme::Q6K => 128 + 64 + 16 + 2,
        }
    }

    /// Number of blocks needed for `n_elements` values.
    ///
    /// Fails with `InvalidShape` when the element count does not divide into
    /// whole blocks.
    pub fn block_count(&self, n_elements: usize) -> QuernResult<usize> {
        let bs = self.block_size();
        if n_elements % bs != 0 {
            return Err(QuernError::InvalidShape(format!(
                "{} elements is not a multiple of the {} block size {}",
                n_elements,
                self.name(),
                bs
            )));
        }
        Ok(n_elements / bs)
    }

    /// Total byte size of a tensor with the given shape in this scheme.
    pub fn size_bytes(&self, shape: &[usize]) -> QuernResult<usize> {
        let n_elements: usize = shape.iter().product();
        Ok(self.block_count(n_elements)? * self.bytes_per_block())
    }
}

impl std::fmt::Display for QuantScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
