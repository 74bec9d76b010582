/// Logits to next-token selection.
///
/// A fixed transformation order: repetition penalty, temperature, top-k,
/// top-p, then a categorical draw from a deterministic RNG. The RNG for
/// the n-th token of a session is derived from `(seed, n)`, so a given
/// seed replays the same sequence regardless of how the calls are batched.
use std::collections::VecDeque;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{QuernError, QuernResult};
use crate::kernels::softmax::softmax_inplace;

#[derive(Debug, Clone, Copy)]
pub struct SamplerOptions {
    /// 0 means greedy argmax; filters and RNG are skipped entirely.
    pub temperature: f32,
    /// 0 disables the filter.
    pub top_k: usize,
    /// 1.0 disables the filter.
    pub top_p: f32,
    /// 1.0 disables the penalty.
    pub repetition_penalty: f32,
    /// How many recent tokens the penalty looks at.
    pub repetition_window: usize,
    pub seed: u64,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            repetition_penalty: 1.0,
            repetition_window: 64,
            seed: 0,
        }
    }
}

/// Mutable sampling state for one session.
#[derive(Debug)]
pub struct SamplerState {
    options: SamplerOptions,
    /// Token ids exempt from the repetition penalty (specials).
    exempt: Vec<i32>,
    eos: Option<i32>,
    recent: VecDeque<i32>,
    decoded_count: u64,
    // reused across calls; sized to the vocab on first use
    probs: Vec<f32>,
    order: Vec<u32>,
}

impl SamplerState {
    pub fn new(options: SamplerOptions, exempt: Vec<i32>, eos: Option<i32>) -> Self {
        Self {
            options,
            exempt,
            eos,
            recent: VecDeque::with_capacity(options.repetition_window),
            decoded_count: 0,
            probs: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    pub fn decoded_count(&self) -> u64 {
        self.decoded_count
    }

    /// Feed a token into the repetition window without sampling (prompt
    /// tokens, or tokens injected by the caller).
    pub fn observe(&mut self, token: i32) {
        if self.options.repetition_window == 0 {
            return;
        }
        if self.recent.len() == self.options.repetition_window {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }

    /// Start over for a fresh generation with the same options.
    pub fn reset(&mut self) {
        self.recent.clear();
        self.decoded_count = 0;
    }
}

/// Pick the next token.
pub fn sample(logits: &[f32], state: &mut SamplerState) -> QuernResult<i32> {
    if logits.is_empty() {
        return Err(QuernError::InferenceFailure(
            "sampling from empty logits".to_string(),
        ));
    }
    if logits.iter().any(|v| v.is_nan()) {
        return Err(QuernError::InferenceFailure(
            "NaN in logits".to_string(),
        ));
    }
    if logits.iter().all(|v| *v == f32::NEG_INFINITY) {
        // Degenerate but recoverable: end the stream.
        let token = state.eos.unwrap_or(0);
        state.observe(token);
        state.decoded_count += 1;
        return Ok(token);
    }

    let opts = state.options;
    state.probs.clear();
    state.probs.extend_from_slice(logits);
    let probs = &mut state.probs;

    // 1. Repetition penalty over the recent window. Positive logits shrink
    //    by the factor, negative ones grow away from zero, so the penalty
    //    always reduces the token's probability.
    if opts.repetition_penalty != 1.0 && !state.recent.is_empty() {
        for &tok in &state.recent {
            if state.exempt.contains(&tok) {
                continue;
            }
            let idx = tok as usize;
            if idx < probs.len() {
                if probs[idx] > 0.0 {
                    probs[idx] /= opts.repetition_penalty;
                } else {
                    probs[idx] *= opts.repetition_penalty;
                }
            }
        }
    }

    // 2. Temperature; zero short-circuits to greedy.
    if opts.temperature <= 0.0 {
        let token = argmax(probs);
        state.observe(token);
        state.decoded_count += 1;
        return Ok(token);
    }
    let inv_t = 1.0 / opts.temperature;
    for v in probs.iter_mut() {
        *v *= inv_t;
    }

    // 3./4. Top-k, then top-p, both over a descending index ordering.
    let order = &mut state.order;
    order.clear();
    order.extend(0..probs.len() as u32);
    order.sort_unstable_by(|&a, &b| {
        probs[b as usize]
            .partial_cmp(&probs[a as usize])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = probs.len();
    if opts.top_k > 0 {
        keep = keep.min(opts.top_k);
    }
    for &idx in order.iter().skip(keep) {
        probs[idx as usize] = f32::NEG_INFINITY;
    }

    softmax_inplace(probs);

    if opts.top_p < 1.0 {
        let mut cumulative = 0.0f32;
        let mut nucleus = 0;
        for &idx in order.iter().take(keep) {
            cumulative += probs[idx as usize];
            nucleus += 1;
            if cumulative >= opts.top_p {
                break;
            }
        }
        for &idx in order.iter().take(keep).skip(nucleus) {
            probs[idx as usize] = 0.0;
        }
        // renormalize over the nucleus
        if cumulative > 0.0 {
            let inv = 1.0 / cumulative;
            for &idx in order.iter().take(nucleus) {
                probs[idx as usize] *= inv;
            }
        }
    }

    // 5. Categorical draw, reproducible per (seed, position).
    let mut rng = rng_for(opts.seed, state.decoded_count);
    let draw: f32 = rng.gen();
    let mut cumulative = 0.0f32;
    let mut token = argmax(probs);
    for &idx in order.iter() {
        let p = probs[idx as usize];
        if p <= 0.0 {
            continue;
        }
        cumulative += p;
        if draw < cumulative {
            token = idx as i32;
            break;
        }
    }

    state.observe(token);
    state.decoded_count += 1;
    Ok(token)
}

fn rng_for(seed: u64, position: u64) -> StdRng {
    // mix so consecutive positions land far apart in the stream space
    StdRng::seed_from_u64(seed ^ position.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn argmax(values: &[f32]) -> i32 {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best as i32
}
