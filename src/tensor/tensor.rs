use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{QuernError, QuernResult};
use crate::tensor::scheme::QuantScheme;

/// Backing bytes of a tensor.
///
/// Loaded models keep tensors as ranges of one shared read-only memory map;
/// tensors built in memory (tests, quantized adapters) own their bytes.
#[derive(Clone)]
pub enum TensorData {
    Owned(Vec<u8>),
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

impl TensorData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            TensorData::Owned(bytes) => bytes,
            TensorData::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }
}

impl std::fmt::Debug for TensorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorData::Owned(bytes) => write!(f, "Owned({} bytes)", bytes.len()),
            TensorData::Mapped { offset, len, .. } => {
                write!(f, "Mapped({} bytes at {})", len, offset)
            }
        }
    }
}

/// A weight tensor in its on-disk quantized layout.
///
/// Row-major 2-D unless noted; `shape[0]` is rows. The byte buffer length is
/// validated against the scheme at construction, so kernels can iterate
/// blocks without bounds anxiety.
#[derive(Debug, Clone)]
pub struct QuantTensor {
    scheme: QuantScheme,
    shape: Vec<usize>,
    data: TensorData,
}

impl QuantTensor {
    pub fn new(scheme: QuantScheme, shape: Vec<usize>, data: TensorData) -> QuernResult<Self> {
        let expected = scheme.size_bytes(&shape)?;
        let got = data.as_bytes().len();
        if got != expected {
            return Err(QuernError::ShortRead(format!(
                "{} tensor {:?} needs {} bytes, got {}",
                scheme.name(),
                shape,
                expected,
                got
            )));
        }
        Ok(Self {
            scheme,
            shape,
            data,
        })
    }

    /// Build an F32 tensor from a float slice. Test and adapter convenience.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> QuernResult<Self> {
        let n: usize = shape.iter().product();
        if n != values.len() {
            return Err(QuernError::InvalidShape(format!(
                "shape {:?} holds {} values, got {}",
                shape,
                n,
                values.len()
            )));
        }
        let mut bytes = Vec::with_capacity(n * 4);
        for v in values {
            bytes.extend(v.to_le_bytes());
        }
        Self::new(QuantScheme::F32, shape, TensorData::Owned(bytes))
    }

    pub fn scheme(&self) -> QuantScheme {
        self.scheme
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn n_blocks(&self) -> usize {
        self.n_elements() / self.scheme.block_size()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }

    /// Rows for a 2-D tensor; 1 for vectors.
    pub fn rows(&self) -> usize {
        if self.shape.len() >= 2 {
            self.shape[0]
        } else {
            1
        }
    }

    /// Columns for a 2-D tensor; total length for vectors.
    pub fn cols(&self) -> usize {
        if self.shape.len() >= 2 {
            self.shape[1..].iter().product()
        } else {
            self.shape.first().copied().unwrap_or(0)
        }
    }

    /// The bytes of row `r`, for schemes where a row is whole blocks.
    pub fn row_bytes(&self, r: usize) -> &[u8] {
        let bpb = self.scheme.bytes_per_block();
        let blocks_per_row = self.cols() / self.scheme.block_size();
        let stride = blocks_per_row * bpb;
        &self.as_bytes()[r * stride..(r + 1) * stride]
    }
}
