/// Decoder-only transformer forward pass.
///
/// One function serves both phases: prefill runs it over a whole prompt
/// segment, decode over a single token. Every pass writes its new K/V
/// rows into the cache at the current append point, attends over the full
/// history including the staged rows, and commits the append once all
/// layers have written. Logits are produced for the last position of the
/// segment only.
use crate::cancel::CancelToken;
use crate::error::{QuernError, QuernResult};
use crate::kernels::activations::{add_inplace, gelu_inplace, relu_inplace, swiglu_inplace};
use crate::kernels::matmul::matmul_fused;
use crate::kernels::norm::{layer_norm, rms_norm};
use crate::kernels::parallel::{for_each_row, ParallelPolicy};
use crate::kernels::rope::apply_rope;
use crate::kernels::softmax::softmax_inplace;
use crate::kv::KvCache;
use crate::model::hparams::{Activation, HParams, NormKind};
use crate::model::weights::{LayerWeights, ModelWeights};
use crate::tensor::dequantize_row;

/// Workspaces for the forward pass.
///
/// Owned by the execution context and grown monotonically to the largest
/// segment seen; a steady-state decode never allocates here.
#[derive(Debug, Default)]
pub struct Scratch {
    x: Vec<f32>,
    xb: Vec<f32>,
    xb2: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    att_out: Vec<f32>,
    scores: Vec<f32>,
    gate: Vec<f32>,
    up: Vec<f32>,
    logits: Vec<f32>,
    tokens_capacity: usize,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow (never shrink) to hold a segment of `t` tokens.
    fn ensure(&mut self, hp: &HParams, t: usize) {
        if t <= self.tokens_capacity && !self.logits.is_empty() {
            return;
        }
        let t = t.max(self.tokens_capacity);
        let h = hp.hidden_size;
        let kv = hp.kv_dim();
        let inter = hp.intermediate_size;

        self.x.resize(t * h, 0.0);
        self.xb.resize(t * h, 0.0);
        self.xb2.resize(t * h, 0.0);
        self.q.resize(t * h, 0.0);
        self.k.resize(t * kv, 0.0);
        self.v.resize(t * kv, 0.0);
        self.att_out.resize(t * h, 0.0);
        self.scores.resize(hp.context_length, 0.0);
        self.gate.resize(t * inter, 0.0);
        self.up.resize(t * inter, 0.0);
        self.logits.resize(hp.vocab_size, 0.0);
        self.tokens_capacity = t;
    }

    /// Logits for the last position of the most recent pass.
    pub fn logits(&self) -> &[f32] {
        &self.logits
    }
}

/// Run one forward pass over `tokens`. K/V for the segment land in
/// `cache` at its append point; logits for the last token land in the
/// scratch (skipped when `want_logits` is false, which is how
/// intermediate prefill chunks run).
///
/// `position_offset` is the absolute rotary position of the segment's
/// first token. It equals the cache occupancy until the history has been
/// slid; after a slide it runs ahead by the dropped count, so new queries
/// keep the right relative offsets against the retained keys. Learned
/// position tables index within the window (the occupancy), never past
/// the table.
#[allow(clippy::too_many_arguments)]
pub fn forward(
    weights: &ModelWeights,
    tokens: &[i32],
    position_offset: usize,
    cache: &mut KvCache,
    scratch: &mut Scratch,
    policy: &ParallelPolicy,
    cancel: &CancelToken,
    want_logits: bool,
) -> QuernResult<()> {
    let result = forward_pass(
        weights,
        tokens,
        position_offset,
        cache,
        scratch,
        policy,
        cancel,
        want_logits,
    );
    if result.is_err() {
        // The committed history stays valid; only the half-written segment
        // is dropped.
        cache.rollback_pending();
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn forward_pass(
    weights: &ModelWeights,
    tokens: &[i32],
    position_offset: usize,
    cache: &mut KvCache,
    scratch: &mut Scratch,
    policy: &ParallelPolicy,
    cancel: &CancelToken,
    want_logits: bool,
) -> QuernResult<()> {
    let hp = weights.hparams();
    let t = tokens.len();
    let occupancy = cache.current_tokens();
    if t == 0 {
        return Err(QuernError::InvariantViolation(
            "forward pass over an empty segment".to_string(),
        ));
    }
    if occupancy + t > hp.context_length {
        return Err(QuernError::ContextLimitExceeded {
            max: hp.context_length,
            required: occupancy + t,
        });
    }
    if position_offset < occupancy {
        return Err(QuernError::InvariantViolation(format!(
            "position offset {} behind cache occupancy {}",
            position_offset, occupancy
        )));
    }
    for &tok in tokens {
        if tok < 0 || tok as usize >= hp.vocab_size {
            return Err(QuernError::InvalidToken {
                id: tok,
                vocab_size: hp.vocab_size,
            });
        }
    }

    scratch.ensure(hp, t);
    let h = hp.hidden_size;
    let kv_dim = hp.kv_dim();
    let head_dim = hp.head_dim();
    let group = hp.n_heads / hp.n_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();

    // Embedding lookup, plus learned positions when the model has them.
    for (i, &tok) in tokens.iter().enumerate() {
        let row = &mut scratch.x[i * h..(i + 1) * h];
        dequantize_row(&weights.token_embd, tok as usize, row)?;
    }
    if let Some(pos_embd) = &weights.pos_embd {
        for i in 0..t {
            let row = &mut scratch.xb[i * h..(i + 1) * h];
            dequantize_row(pos_embd, occupancy + i, row)?;
            add_inplace(&mut scratch.x[i * h..(i + 1) * h], row);
        }
    }

    for (l, layer) in weights.layers.iter().enumerate() {
        cancel.check()?;

        norm_rows(hp, &scratch.x, &layer.attn_norm, layer.attn_norm_bias.as_deref(), &mut scratch.xb, t);

        matmul_fused(&scratch.xb[..t * h], &layer.attn_q, &mut scratch.q[..t * h], t, h, h, policy)?;
        matmul_fused(&scratch.xb[..t * h], &layer.attn_k, &mut scratch.k[..t * kv_dim], t, h, kv_dim, policy)?;
        matmul_fused(&scratch.xb[..t * h], &layer.attn_v, &mut scratch.v[..t * kv_dim], t, h, kv_dim, policy)?;

        if let Some(theta) = hp.rope_theta {
            let n_heads = hp.n_heads;
            let n_kv_heads = hp.n_kv_heads;
            for_each_row(policy, &mut scratch.q[..t * h], t, |i, row| {
                apply_rope(row, position_offset + i, n_heads, head_dim, theta);
            });
            for_each_row(policy, &mut scratch.k[..t * kv_dim], t, |i, row| {
                apply_rope(row, position_offset + i, n_kv_heads, head_dim, theta);
            });
        }

        cache.append_kv(l, &scratch.k[..t * kv_dim], &scratch.v[..t * kv_dim], t)?;

        // Attention over the committed history plus the staged segment.
        // The causal mask is the read bound: the query at segment index i
        // sees cache positions [0, occupancy + i].
        for hq in 0..hp.n_heads {
            let g = hq / group;
            for i in 0..t {
                let span = occupancy + i + 1;
                let keys = cache.get_keys(l, 0, span);
                let values = cache.get_values(l, 0, span);
                let q_row = &scratch.q[i * h + hq * head_dim..i * h + (hq + 1) * head_dim];

                let scores = &mut scratch.scores[..span];
                for (p, score) in scores.iter_mut().enumerate() {
                    let key = &keys[p * kv_dim + g * head_dim..p * kv_dim + (g + 1) * head_dim];
                    let mut dot = 0.0f32;
                    for (a, b) in q_row.iter().zip(key) {
                        dot += a * b;
                    }
                    *score = dot * scale;
                }
                softmax_inplace(scores);

                let out = &mut scratch.att_out
                    [i * h + hq * head_dim..i * h + (hq + 1) * head_dim];
                out.fill(0.0);
                for (p, &w) in scores.iter().enumerate() {
                    if w == 0.0 {
                        continue;
                    }
                    let value =
                        &values[p * kv_dim + g * head_dim..p * kv_dim + (g + 1) * head_dim];
                    for (o, v) in out.iter_mut().zip(value) {
                        *o += w * v;
                    }
                }
            }
        }

        matmul_fused(&scratch.att_out[..t * h], &layer.attn_output, &mut scratch.xb2[..t * h], t, h, h, policy)?;
        add_inplace(&mut scratch.x[..t * h], &scratch.xb2[..t * h]);

        norm_rows(hp, &scratch.x, &layer.ffn_norm, layer.ffn_norm_bias.as_deref(), &mut scratch.xb, t);
        ffn(hp, layer, scratch, t, policy)?;
        add_inplace(&mut scratch.x[..t * h], &scratch.xb2[..t * h]);
    }

    cache.commit(t)?;

    if want_logits {
        let last = &scratch.x[(t - 1) * h..t * h];
        let normed = &mut scratch.xb[..h];
        match hp.norm {
            NormKind::RmsNorm => rms_norm(last, &weights.output_norm, hp.norm_eps, normed),
            NormKind::LayerNorm => layer_norm(
                last,
                &weights.output_norm,
                weights.output_norm_bias.as_deref(),
                hp.norm_eps,
                normed,
            ),
        }
        matmul_fused(
            &scratch.xb[..h],
            &weights.output,
            &mut scratch.logits,
            1,
            h,
            hp.vocab_size,
            policy,
        )?;
    }

    Ok(())
}

fn norm_rows(
    hp: &HParams,
    x: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    out: &mut [f32],
    t: usize,
) {
    let h = hp.hidden_size;
    for i in 0..t {
        let row = &x[i * h..(i + 1) * h];
        let out_row = &mut out[i * h..(i + 1) * h];
        match hp.norm {
            NormKind::RmsNorm => rms_norm(row, weight, hp.norm_eps, out_row),
            NormKind::LayerNorm => layer_norm(row, weight, bias, hp.norm_eps, out_row),
        }
    }
}

fn ffn(
    hp: &HParams,
    layer: &LayerWeights,
    scratch: &mut Scratch,
    t: usize,
    policy: &ParallelPolicy,
) -> QuernResult<()> {
    let h = hp.hidden_size;
    let inter = hp.intermediate_size;

    match hp.activation {
        Activation::Swiglu => {
            let gate_w = layer.ffn_gate.as_ref().ok_or_else(|| {
                QuernError::InvariantViolation("gated activation without gate weights".to_string())
            })?;
            matmul_fused(&scratch.xb[..t * h], gate_w, &mut scratch.gate[..t * inter], t, h, inter, policy)?;
            matmul_fused(&scratch.xb[..t * h], &layer.ffn_up, &mut scratch.up[..t * inter], t, h, inter, policy)?;
            swiglu_inplace(&mut scratch.gate[..t * inter], &scratch.up[..t * inter]);
            matmul_fused(&scratch.gate[..t * inter], &layer.ffn_down, &mut scratch.xb2[..t * h], t, inter, h, policy)?;
        }
        Activation::Gelu | Activation::Relu => {
            matmul_fused(&scratch.xb[..t * h], &layer.ffn_up, &mut scratch.up[..t * inter], t, h, inter, policy)?;
            match hp.activation {
                Activation::Gelu => gelu_inplace(&mut scratch.up[..t * inter]),
                _ => relu_inplace(&mut scratch.up[..t * inter]),
            }
            matmul_fused(&scratch.up[..t * inter], &layer.ffn_down, &mut scratch.xb2[..t * h], t, inter, h, policy)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::CacheShape;
    use crate::model::weights::test_support::{tiny_hparams, tiny_model, tiny_model_with};

    fn cache_for(hp: &HParams) -> KvCache {
        KvCache::new(
            CacheShape {
                n_layers: hp.n_layers,
                n_kv_heads: hp.n_kv_heads,
                head_dim: hp.head_dim(),
            },
            hp.context_length,
        )
    }

    fn run(
        model: &ModelWeights,
        tokens: &[i32],
        offset: usize,
        cache: &mut KvCache,
        scratch: &mut Scratch,
    ) -> QuernResult<Vec<f32>> {
        forward(
            model,
            tokens,
            offset,
            cache,
            scratch,
            &ParallelPolicy::sequential(),
            &CancelToken::new(),
            true,
        )?;
        Ok(scratch.logits().to_vec())
    }

    #[test]
    fn test_forward_produces_finite_logits() {
        let model = tiny_model();
        let mut cache = cache_for(model.hparams());
        let mut scratch = Scratch::new();
        let logits = run(&model, &[1, 2, 3], 0, &mut cache, &mut scratch).unwrap();
        assert_eq!(logits.len(), model.hparams().vocab_size);
        assert!(logits.iter().all(|v| v.is_finite()));
        assert_eq!(cache.current_tokens(), 3);
    }

    #[test]
    fn test_forward_is_deterministic() {
        let model = tiny_model();
        let mut scratch = Scratch::new();

        let mut cache_a = cache_for(model.hparams());
        let a = run(&model, &[5, 9, 2], 0, &mut cache_a, &mut scratch).unwrap();
        let mut cache_b = cache_for(model.hparams());
        let b = run(&model, &[5, 9, 2], 0, &mut cache_b, &mut scratch).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_prefill_decode_equivalence() {
        // prefill(prompt) then decode(t) must match a full fresh pass over
        // prompt ++ [t], within f32 noise.
        let model = tiny_model();
        let mut scratch = Scratch::new();

        let mut incremental = cache_for(model.hparams());
        run(&model, &[1, 2, 3], 0, &mut incremental, &mut scratch).unwrap();
        let step = run(&model, &[4], 3, &mut incremental, &mut scratch).unwrap();

        let mut full = cache_for(model.hparams());
        let whole = run(&model, &[1, 2, 3, 4], 0, &mut full, &mut scratch).unwrap();

        for (a, b) in step.iter().zip(&whole) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_gqa_and_mha_both_run() {
        // kv heads == query heads (plain MHA)
        let mut hp = tiny_hparams();
        hp.n_kv_heads = hp.n_heads;
        let model = tiny_model_with(hp);
        let mut cache = cache_for(model.hparams());
        let mut scratch = Scratch::new();
        assert!(run(&model, &[1, 2], 0, &mut cache, &mut scratch).is_ok());
    }

    #[test]
    fn test_learned_positions_and_layernorm_gelu() {
        let mut hp = tiny_hparams();
        hp.rope_theta = None;
        hp.norm = NormKind::LayerNorm;
        hp.activation = Activation::Gelu;
        let model = tiny_model_with(hp);
        assert!(model.pos_embd.is_some());
        assert!(model.layers[0].ffn_gate.is_none());

        let mut cache = cache_for(model.hparams());
        let mut scratch = Scratch::new();
        let logits = run(&model, &[3, 1], 0, &mut cache, &mut scratch).unwrap();
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_out_of_range_token_rejected() {
        let model = tiny_model();
        let mut cache = cache_for(model.hparams());
        let mut scratch = Scratch::new();
        let err = run(&model, &[999], 0, &mut cache, &mut scratch).unwrap_err();
        assert!(matches!(err, QuernError::InvalidToken { .. }));
        let err = run(&model, &[-1], 0, &mut cache, &mut scratch).unwrap_err();
        assert!(matches!(err, QuernError::InvalidToken { .. }));
    }

    #[test]
    fn test_context_limit_enforced() {
        let model = tiny_model();
        let mut cache = cache_for(model.hparams());
        let mut scratch = Scratch::new();
        let too_long = vec![1i32; model.hparams().context_length + 1];
        let err = run(&model, &too_long, 0, &mut cache, &mut scratch).unwrap_err();
        assert!(matches!(err, QuernError::ContextLimitExceeded { .. }));
    }

    #[test]
    fn test_offset_behind_occupancy_rejected() {
        let model = tiny_model();
        let mut cache = cache_for(model.hparams());
        let mut scratch = Scratch::new();
        run(&model, &[1, 2, 3], 0, &mut cache, &mut scratch).unwrap();
        // positions may never move backwards against the cached history
        let err = run(&model, &[4], 1, &mut cache, &mut scratch).unwrap_err();
        assert!(matches!(err, QuernError::InvariantViolation(_)));
    }

    #[test]
    fn test_offset_ahead_of_occupancy_allowed() {
        // a slid history leaves the absolute position ahead of the cache
        // occupancy; the pass must accept that and stay finite
        let model = tiny_model();
        let mut cache = cache_for(model.hparams());
        let mut scratch = Scratch::new();
        let logits = run(&model, &[1, 2], 6, &mut cache, &mut scratch).unwrap();
        assert!(logits.iter().all(|v| v.is_finite()));
        assert_eq!(cache.current_tokens(), 2);
    }

    #[test]
    fn test_cancellation_leaves_cache_consistent() {
        let model = tiny_model();
        let mut cache = cache_for(model.hparams());
        let mut scratch = Scratch::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = forward(
            &model,
            &[1, 2],
            0,
            &mut cache,
            &mut scratch,
            &ParallelPolicy::sequential(),
            &cancel,
            true,
        )
        .unwrap_err();
        assert!(matches!(err, QuernError::Cancelled));
        // nothing committed
        assert_eq!(cache.current_tokens(), 0);
    }
}
