/// Kernel library.
///
/// Everything the forward pass computes with: the fused dequantize+matmul,
/// activations, softmax, norms, rotary embeddings, and the helper that
/// decides between sequential and work-partitioned execution. Accumulation
/// is always f32; scheme dispatch happens once per matmul call, never per
/// element.
pub mod activations;
pub mod matmul;
pub mod norm;
pub mod parallel;
pub mod rope;
pub mod softmax;

pub use matmul::matmul_fused;
pub use parallel::ParallelPolicy;
