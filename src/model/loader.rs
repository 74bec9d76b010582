/// Native model file (SMQ) reader.
///
/// Layout, all integers little-endian:
///
/// ```text
/// magic      "SMQ\0"
/// version    u32
/// meta_len   u32, then meta_len bytes of UTF-8 JSON metadata
/// n_tensors  u32
/// per tensor:
///   name_len u16, name bytes
///   scheme   u8
///   rank     u8
///   shape    u32 x rank
///   data_len u64
///   data     bytes in the scheme's block layout
/// ```
///
/// The file is memory-mapped read-only; tensors borrow ranges of the shared
/// map, so loading a model costs metadata parsing plus page faults on first
/// touch, not a copy of the weights.
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::cancel::CancelToken;
use crate::error::{BudgetKind, QuernError, QuernResult};
use crate::model::hparams::ModelMetadata;
use crate::model::weights::ModelWeights;
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::tensor::{QuantScheme, QuantTensor, TensorData};

pub const SMQ_MAGIC: [u8; 4] = *b"SMQ\0";
pub const SMQ_VERSION: u32 = 1;

/// How to react when a load crosses `max_tensor_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryBudgetMode {
    /// Fail the load.
    #[default]
    Strict,
    /// Emit a soft-limit event and continue.
    BestEffort,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBudget {
    pub max_tensor_bytes: Option<u64>,
    pub mode: MemoryBudgetMode,
}

impl MemoryBudget {
    fn charge(&self, total: u64, telemetry: &Telemetry) -> QuernResult<()> {
        let Some(limit) = self.max_tensor_bytes else {
            return Ok(());
        };
        if total <= limit {
            return Ok(());
        }
        match self.mode {
            MemoryBudgetMode::Strict => Err(QuernError::BudgetExceeded {
                kind: BudgetKind::Memory,
                message: format!("tensor data is {} bytes, limit {}", total, limit),
            }),
            MemoryBudgetMode::BestEffort => {
                telemetry.record(TelemetryEvent::MemoryBudgetSoftLimit {
                    requested_bytes: total,
                    limit_bytes: limit,
                });
                Ok(())
            }
        }
    }
}

/// Load a model file, returning the assembled weights.
///
/// Cancellation is polled between tensors; the map is dropped on cancel.
pub fn load_model(
    path: &Path,
    budget: MemoryBudget,
    telemetry: &Telemetry,
    cancel: &CancelToken,
) -> QuernResult<ModelWeights> {
    let file = File::open(path).map_err(|e| {
        QuernError::ModelNotFound(format!("{}: {}", path.display(), e))
    })?;
    // Read-only map of an immutable model file.
    let map = Arc::new(unsafe { Mmap::map(&file) }?);

    let mut cursor = Cursor::new(&map);
    let magic = cursor.take(4)?;
    if magic != SMQ_MAGIC {
        return Err(QuernError::Corrupt(format!(
            "bad magic {:02x?}, not an SMQ file",
            magic
        )));
    }
    let version = cursor.read_u32()?;
    if version != SMQ_VERSION {
        return Err(QuernError::Corrupt(format!(
            "unsupported SMQ version {}",
            version
        )));
    }

    let meta_len = cursor.read_u32()? as usize;
    let meta_bytes = cursor.take(meta_len)?;
    let metadata: ModelMetadata = serde_json::from_slice(meta_bytes)
        .map_err(|e| QuernError::Corrupt(format!("metadata: {}", e)))?;

    let n_tensors = cursor.read_u32()? as usize;
    let mut tensors = HashMap::with_capacity(n_tensors);
    let mut total_bytes = 0u64;

    for _ in 0..n_tensors {
        cancel.check()?;

        let name_len = cursor.read_u16()? as usize;
        let name = std::str::from_utf8(cursor.take(name_len)?)
            .map_err(|_| QuernError::Corrupt("tensor name is not UTF-8".to_string()))?
            .to_string();
        let scheme = QuantScheme::from_tag(cursor.read_u8()?)?;
        let rank = cursor.read_u8()? as usize;
        let mut shape = Vec::with_capacity(rank);
        for _ in 0..rank {
            shape.push(cursor.read_u32()? as usize);
        }
        let data_len = cursor.read_u64()? as usize;

        let expected = scheme.size_bytes(&shape)?;
        if data_len != expected {
            return Err(QuernError::Corrupt(format!(
                "tensor {}: {} data bytes, {} layout wants {}",
                name,
                data_len,
                scheme.name(),
                expected
            )));
        }

        let offset = cursor.offset;
        cursor.take(data_len)?; // advance, bounds-checked
        total_bytes += data_len as u64;

        let tensor = QuantTensor::new(
            scheme,
            shape,
            TensorData::Mapped {
                map: Arc::clone(&map),
                offset,
                len: data_len,
            },
        )?;
        tensors.insert(name, tensor);
    }

    budget.charge(total_bytes, telemetry)?;

    tracing::info!(
        model = %metadata.name,
        tensors = tensors.len(),
        bytes = total_bytes,
        "model file loaded"
    );
    ModelWeights::from_tensors(metadata, tensors)
}

/// One tensor for [`write_smq`].
pub struct SmqTensor {
    pub name: String,
    pub scheme: QuantScheme,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

/// Write a model file. Importers and test fixtures share this path.
pub fn write_smq(
    path: &Path,
    metadata: &ModelMetadata,
    tensors: &[SmqTensor],
) -> QuernResult<()> {
    let meta_json = serde_json::to_vec(metadata)?;

    let mut out = Vec::new();
    out.extend(SMQ_MAGIC);
    out.extend(SMQ_VERSION.to_le_bytes());
    out.extend((meta_json.len() as u32).to_le_bytes());
    out.extend(&meta_json);
    out.extend((tensors.len() as u32).to_le_bytes());
    for t in tensors {
        let expected = t.scheme.size_bytes(&t.shape)?;
        if t.data.len() != expected {
            return Err(QuernError::InvalidShape(format!(
                "tensor {}: {} data bytes, layout wants {}",
                t.name,
                t.data.len(),
                expected
            )));
        }
        out.extend((t.name.len() as u16).to_le_bytes());
        out.extend(t.name.as_bytes());
        out.push(t.scheme as u8);
        out.push(t.shape.len() as u8);
        for dim in &t.shape {
            out.extend((*dim as u32).to_le_bytes());
        }
        out.extend((t.data.len() as u64).to_le_bytes());
        out.extend(&t.data);
    }

    std::fs::write(path, out)?;
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> QuernResult<&'a [u8]> {
        if self.offset + len > self.bytes.len() {
            return Err(QuernError::ShortRead(format!(
                "need {} bytes at offset {}, file has {}",
                len,
                self.offset,
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> QuernResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> QuernResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> QuernResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> QuernResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
