/// Quantized tensor store.
///
/// Weight tensors stay in their on-disk block layout; kernels dequantize one
/// block at a time. This module owns the scheme tags, the per-scheme block
/// constants, block-level dequantization, and the quantize direction for the
/// two schemes that support it (Q8_0, Q4_0).
mod block;
mod f16;
mod quantize;
mod scheme;
#[allow(clippy::module_inception)]
mod tensor;

pub use block::{dequantize_block, dequantize_row, dequantize_tensor};
pub(crate) use block::dequantize_block_unchecked;
pub use f16::{f16_to_f32, f32_to_f16};
pub use quantize::{quantize_q4_0, quantize_q8_0};
pub use scheme::QuantScheme;
pub use tensor::{QuantTensor, TensorData};
