/// Model weights and the transformer forward pass.
pub mod forward;
pub mod hparams;
pub mod loader;
pub mod weights;

pub use forward::{forward, Scratch};
pub use hparams::{Activation, HParams, ModelMetadata, NormKind, TokenizerMetadata};
pub use loader::{load_model, write_smq, MemoryBudget, MemoryBudgetMode, SmqTensor};
pub use weights::{LayerWeights, ModelWeights};
