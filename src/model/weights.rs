/// Named weight tensors of a loaded model.
///
/// Tensors are assembled from the model file by name; the per-layer names
/// follow the `blk.{l}.*` convention of the importer. Norm weights are
/// dequantized to f32 once at load time (they are vectors, not matrices,
/// and the norms read them every token).
use std::collections::HashMap;

use crate::error::{QuernError, QuernResult};
use crate::model::hparams::{HParams, ModelMetadata};
use crate::tensor::{dequantize_tensor, QuantTensor};

/// Weights of one transformer block.
#[derive(Debug)]
pub struct LayerWeights {
    pub attn_norm: Vec<f32>,
    pub attn_norm_bias: Option<Vec<f32>>,
    pub attn_q: QuantTensor,
    pub attn_k: QuantTensor,
    pub attn_v: QuantTensor,
    pub attn_output: QuantTensor,
    pub ffn_norm: Vec<f32>,
    pub ffn_norm_bias: Option<Vec<f32>>,
    /// Present only for gated activations (SwiGLU).
    pub ffn_gate: Option<QuantTensor>,
    pub ffn_up: QuantTensor,
    pub ffn_down: QuantTensor,
}

#[derive(Debug)]
pub struct ModelWeights {
    pub metadata: ModelMetadata,
    pub token_embd: QuantTensor,
    /// Learned positional embeddings; absent when the model uses RoPE.
    pub pos_embd: Option<QuantTensor>,
    pub layers: Vec<LayerWeights>,
    pub output_norm: Vec<f32>,
    pub output_norm_bias: Option<Vec<f32>>,
    pub output: QuantTensor,
}

impl ModelWeights {
    pub fn hparams(&self) -> &HParams {
        &self.metadata.hparams
    }

    /// Assemble from a name -> tensor map, validating every shape against
    /// the hyperparameters.
    pub fn from_tensors(
        metadata: ModelMetadata,
        mut tensors: HashMap<String, QuantTensor>,
    ) -> QuernResult<Self> {
        metadata.hparams.validate()?;
        let hp = &metadata.hparams;
        let h = hp.hidden_size;
        let kv = hp.kv_dim();
        let inter = hp.intermediate_size;

        let token_embd = take(&mut tensors, "token_embd.weight")?;
        expect_shape(&token_embd, "token_embd.weight", &[hp.vocab_size, h])?;

        let pos_embd = if hp.uses_rope() {
            None
        } else {
            let t = take(&mut tensors, "pos_embd.weight")?;
            expect_shape(&t, "pos_embd.weight", &[hp.context_length, h])?;
            Some(t)
        };

        let mut layers = Vec::with_capacity(hp.n_layers);
        for l in 0..hp.n_layers {
            let name = |suffix: &str| format!("blk.{}.{}", l, suffix);

            let attn_q = take(&mut tensors, &name("attn_q.weight"))?;
            expect_shape(&attn_q, &name("attn_q.weight"), &[h, h])?;
            let attn_k = take(&mut tensors, &name("attn_k.weight"))?;
            expect_shape(&attn_k, &name("attn_k.weight"), &[kv, h])?;
            let attn_v = take(&mut tensors, &name("attn_v.weight"))?;
            expect_shape(&attn_v, &name("attn_v.weight"), &[kv, h])?;
            let attn_output = take(&mut tensors, &name("attn_output.weight"))?;
            expect_shape(&attn_output, &name("attn_output.weight"), &[h, h])?;

            let ffn_gate = if hp.activation.is_gated() {
                let t = take(&mut tensors, &name("ffn_gate.weight"))?;
                expect_shape(&t, &name("ffn_gate.weight"), &[inter, h])?;
                Some(t)
            } else {
                None
            };
            let ffn_up = take(&mut tensors, &name("ffn_up.weight"))?;
            expect_shape(&ffn_up, &name("ffn_up.weight"), &[inter, h])?;
            let ffn_down = take(&mut tensors, &name("ffn_down.weight"))?;
            expect_shape(&ffn_down, &name("ffn_down.weight"), &[h, inter])?;

            let attn_norm = norm_vector(take(&mut tensors, &name("attn_norm.weight"))?, h)?;
            let attn_norm_bias = optional_norm(&mut tensors, &name("attn_norm.bias"), h)?;
            let ffn_norm = norm_vector(take(&mut tensors, &name("ffn_norm.weight"))?, h)?;
            let ffn_norm_bias = optional_norm(&mut tensors, &name("ffn_norm.bias"), h)?;

            layers.push(LayerWeights {
                attn_norm,
                attn_norm_bias,
                attn_q,
                attn_k,
                attn_v,
                attn_output,
                ffn_norm,
                ffn_norm_bias,
                ffn_gate,
                ffn_up,
                ffn_down,
            });
        }

        let output_norm = norm_vector(take(&mut tensors, "output_norm.weight")?, h)?;
        let output_norm_bias = optional_norm(&mut tensors, "output_norm.bias", h)?;
        let output = take(&mut tensors, "output.weight")?;
        expect_shape(&output, "output.weight", &[hp.vocab_size, h])?;

        if !tensors.is_empty() {
            let mut names: Vec<_> = tensors.keys().cloned().collect();
            names.sort();
            tracing::warn!(unused = ?names, "model file carries unused tensors");
        }

        Ok(Self {
            metadata,
            token_embd,
            pos_embd,
            layers,
            output_norm,
            output_norm_bias,
            output,
        })
    }
}

fn expect_shape(tensor: &QuantTensor, name: &str, want: &[usize]) -> QuernResult<()> {
    if tensor.shape() != want {
        return Err(QuernError::InvalidShape(format!(
            "{} is {:?}, expected {:?}",
            name,
            tensor.shape(),
            want
        )));
    }
    Ok(())
}

fn norm_vector(tensor: QuantTensor, len: usize) -> QuernResult<Vec<f32>> {
    if tensor.n_elements() != len {
        return Err(QuernError::InvalidShape(format!(
            "norm vector has {} values, expected {}",
            tensor.n_elements(),
            len
        )));
    }
    dequantize_tensor(&tensor)
}

fn take(
    tensors: &mut HashMap<String, QuantTensor>,
    name: &str,
) -> QuernResult<QuantTensor> {
    tensors
        .remove(name)
        .ok_or_else(|| QuernError::Corrupt(format!("missing tensor {}", name)))
}

fn optional_norm(
    tensors: &mut HashMap<String, QuantTensor>,
    name: &str,
    len: usize,
) -> QuernResult<Option<Vec<f32>>> {
    match tensors.remove(name) {
        Some(t) => Ok(Some(norm_vector(t, len)?)),
        None => Ok(None),
    }
}
