use serde::{Deserialize, Serialize};

use crate::error::{QuernError, QuernResult};

/// Per-token normalization flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    #[serde(rename = "rmsnorm")]
    RmsNorm,
    #[serde(rename = "layernorm")]
    LayerNorm,
}

/// FFN activation. SwiGLU implies the gated three-projection FFN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Gelu,
    Swiglu,
    Relu,
}

impl Activation {
    /// Gated activations carry a third FFN projection.
    pub fn is_gated(&self) -> bool {
        matches!(self, Activation::Swiglu)
    }
}

/// Transformer hyperparameters, as stored in the model file metadata.
///
/// Field names match the on-disk JSON keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HParams {
    /// Vocabulary size
    #[serde(rename = "V")]
    pub vocab_size: usize,
    /// Maximum context length
    #[serde(rename = "C_max")]
    pub context_length: usize,
    /// Hidden size
    #[serde(rename = "H")]
    pub hidden_size: usize,
    /// Query heads
    #[serde(rename = "h_q")]
    pub n_heads: usize,
    /// Key/value heads (< n_heads means grouped-query attention)
    #[serde(rename = "h_kv")]
    pub n_kv_heads: usize,
    /// Transformer blocks
    #[serde(rename = "L")]
    pub n_layers: usize,
    /// FFN intermediate size
    #[serde(rename = "I")]
    pub intermediate_size: usize,
    pub norm: NormKind,
    pub activation: Activation,
    /// RoPE base; absent means learned positional embeddings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_theta: Option<f32>,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
}

fn default_norm_eps() -> f32 {
    1e-5
}

impl HParams {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads
    }

    /// Width of one position's K (or V) row in the cache.
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim()
    }

    pub fn uses_rope(&self) -> bool {
        self.rope_theta.is_some()
    }

    pub fn validate(&self) -> QuernResult<()> {
        if self.n_heads == 0 || self.hidden_size % self.n_heads != 0 {
            return Err(QuernError::InvalidShape(format!(
                "hidden size {} not divisible by {} heads",
                self.hidden_size, self.n_heads
            )));
        }
        if self.n_kv_heads == 0
            || self.n_kv_heads > self.n_heads
            || self.n_heads % self.n_kv_heads != 0
        {
            return Err(QuernError::InvalidShape(format!(
                "{} kv heads do not evenly group {} query heads",
                self.n_kv_heads, self.n_heads
            )));
        }
        if self.head_dim() % 2 != 0 && self.uses_rope() {
            return Err(QuernError::InvalidShape(format!(
                "rotary embedding needs an even head dim, got {}",
                self.head_dim()
            )));
        }
        if self.vocab_size == 0 || self.n_layers == 0 || self.context_length == 0 {
            return Err(QuernError::InvalidShape(
                "vocab size, layer count and context length must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tokenizer section of the model metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenizerMetadata {
    /// "bpe" or "table"
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub vocab: Option<Vec<String>>,
    /// Merge pairs, highest priority first
    #[serde(default)]
    pub merges: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub specials: SpecialTokenIds,
    /// "chatml" (default) or "plain"
    #[serde(default)]
    pub chat_template_style: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpecialTokenIds {
    #[serde(default)]
    pub bos: Option<i32>,
    #[serde(default)]
    pub eos: Option<i32>,
    #[serde(default)]
    pub pad: Option<i32>,
    #[serde(default)]
    pub unk: Option<i32>,
}

/// Full metadata block of a model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub arch: String,
    pub hparams: HParams,
    #[serde(default)]
    pub tokenizer: TokenizerMetadata,
}
