/// The prefill/decode split.
///
/// `prefill` runs the whole prompt through the model and populates a fresh
/// (or reset) cache; `decode` advances one token at a time against the
/// populated cache. Both share an [`ExecutionContext`], which owns the
/// cache handle, the reusable single-token input, and the scratch
/// workspaces; after the first decode, repeated decodes allocate nothing.
use std::sync::Arc;
use std::time::Instant;

use crate::cancel::CancelToken;
use crate::error::{QuernError, QuernResult};
use crate::kernels::parallel::ParallelPolicy;
use crate::kv::{CacheShape, KvCache, KvCachePool};
use crate::model::{forward, ModelWeights, Scratch};
use crate::telemetry::{Phase, Telemetry, TelemetryEvent};

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// Let `prefill` reset an already-populated context instead of failing.
    pub allow_prefill_reset: bool,
    /// Fail `decode` when no cache is present (instead of renting a cold
    /// empty one).
    pub require_kv_cache: bool,
    /// Prompt tokens per forward pass; cancellation is polled between
    /// chunks.
    pub prefill_chunk: usize,
    /// Cache capacity in tokens; clamped to the model context length,
    /// which is also the default.
    pub cache_capacity: Option<usize>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            allow_prefill_reset: false,
            require_kv_cache: true,
            prefill_chunk: 512,
            cache_capacity: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PrefillMetrics {
    pub ms: f64,
    pub tok_count: usize,
    pub tok_per_sec: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeMetrics {
    pub ms: f64,
    /// Absolute position of the token just decoded.
    pub position: usize,
    /// Cache occupancy after the call.
    pub cache_used: usize,
}

#[derive(Debug)]
pub struct PrefillResult<'a> {
    /// Logits for the last prompt position.
    pub logits: &'a [f32],
    /// Tokens actually run (after context cropping).
    pub processed_tokens: usize,
    pub metrics: PrefillMetrics,
}

#[derive(Debug)]
pub struct DecodeResult<'a> {
    pub logits: &'a [f32],
    pub metrics: DecodeMetrics,
}

/// Per-session execution state. Not safe for concurrent use; the session
/// layer serializes access.
pub struct ExecutionContext {
    options: ExecutorOptions,
    policy: ParallelPolicy,
    telemetry: Telemetry,
    pool: Arc<KvCachePool>,
    scratch: Scratch,
    cache: Option<KvCache>,
    decode_input: [i32; 1],
    prefill_finished: Option<Instant>,
    /// Absolute positions dropped by cache slides. The position of the
    /// next token is `position_base + cache occupancy`; sliding the cache
    /// moves this base instead of renumbering the retained rotary-encoded
    /// keys.
    position_base: usize,
}

impl ExecutionContext {
    pub fn new(
        options: ExecutorOptions,
        policy: ParallelPolicy,
        telemetry: Telemetry,
        pool: Arc<KvCachePool>,
    ) -> Self {
        Self {
            options,
            policy,
            telemetry,
            pool,
            scratch: Scratch::new(),
            cache: None,
            decode_input: [0],
            prefill_finished: None,
            position_base: 0,
        }
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Committed cache occupancy; zero without a cache.
    pub fn cache_tokens(&self) -> usize {
        self.cache.as_ref().map_or(0, KvCache::current_tokens)
    }

    /// Install a cache checked out elsewhere (session reuse across turns).
    pub fn install_cache(&mut self, cache: KvCache) {
        self.cache = Some(cache);
    }

    /// Hand the cache back to the caller, e.g. for check-in to the store.
    pub fn take_cache(&mut self) -> Option<KvCache> {
        self.cache.take()
    }

    /// Keep only the last `window` cached positions.
    ///
    /// The slide is a block copy; the retained keys keep the rotary
    /// rotation of their original absolute positions. The dropped count
    /// moves `position_base` so later decodes continue the absolute
    /// numbering and relative offsets against the retained keys stay
    /// correct.
    pub fn slide_cache(&mut self, window: usize) {
        if let Some(cache) = &mut self.cache {
            let before = cache.current_tokens();
            cache.slide(window);
            self.position_base += before - cache.current_tokens();
        }
    }

    /// Absolute position of the next token to be appended.
    pub fn next_position(&self) -> usize {
        self.position_base + self.cache_tokens()
    }

    /// Forget the cached history (keeping the buffers) and restart the
    /// position numbering from zero.
    pub fn clear_cache(&mut self) {
        if let Some(cache) = &mut self.cache {
            cache.reset();
        }
        self.position_base = 0;
    }

    /// Return the cache to the pool and clear the prefill state.
    pub fn reset(&mut self) {
        if let Some(cache) = self.cache.take() {
            self.pool.put_back(cache);
        }
        self.prefill_finished = None;
        self.position_base = 0;
    }

    fn cache_capacity_for(&self, weights: &ModelWeights) -> usize {
        let c_max = weights.hparams().context_length;
        self.options
            .cache_capacity
            .map_or(c_max, |cap| cap.min(c_max))
    }
}

/// Run the prompt through the model, populating the context's cache.
///
/// Prompts longer than the model context (or the cache capacity) keep
/// their trailing tokens; the drop is reported as a `ContextCropped`
/// event, not an error.
pub fn prefill<'a>(
    weights: &ModelWeights,
    prompt_tokens: &[i32],
    ctx: &'a mut ExecutionContext,
    cancel: &CancelToken,
) -> QuernResult<PrefillResult<'a>> {
    if prompt_tokens.is_empty() {
        return Err(QuernError::InvariantViolation(
            "prefill with an empty prompt".to_string(),
        ));
    }

    match &mut ctx.cache {
        Some(cache) if ctx.options.allow_prefill_reset => cache.reset(),
        Some(_) => {
            return Err(QuernError::InvariantViolation(
                "prefill on a context that already holds a cache".to_string(),
            ));
        }
        None => {
            let hp = weights.hparams();
            let shape = CacheShape {
                n_layers: hp.n_layers,
                n_kv_heads: hp.n_kv_heads,
                head_dim: hp.head_dim(),
            };
            let capacity = ctx.cache_capacity_for(weights);
            ctx.cache = Some(ctx.pool.rent(shape, capacity));
        }
    }
    // a prefill starts a fresh history, so positions restart at zero
    ctx.position_base = 0;

    // crop against the cache actually installed, which may be smaller
    // than the configured capacity
    let limit = match &ctx.cache {
        Some(cache) => cache.capacity().min(weights.hparams().context_length),
        None => ctx.cache_capacity_for(weights),
    };
    let tokens = if prompt_tokens.len() > limit {
        let dropped = prompt_tokens.len() - limit;
        ctx.telemetry
            .record(TelemetryEvent::ContextCropped { dropped });
        &prompt_tokens[dropped..]
    } else {
        prompt_tokens
    };

    let start = Instant::now();
    let chunk_size = ctx.options.prefill_chunk.max(1);
    let n_chunks = tokens.len().div_ceil(chunk_size);
    // borrow the cache for the whole chunk loop
    let cache = ctx.cache.as_mut().ok_or_else(|| {
        QuernError::InvariantViolation("prefill lost its cache".to_string())
    })?;

    for (c, chunk) in tokens.chunks(chunk_size).enumerate() {
        cancel.check()?;
        let offset = cache.current_tokens();
        let is_last = c + 1 == n_chunks;
        forward(
            weights,
            chunk,
            offset,
            cache,
            &mut ctx.scratch,
            &ctx.policy,
            cancel,
            is_last,
        )?;
    }

    let elapsed = start.elapsed();
    let ms = elapsed.as_secs_f64() * 1000.0;
    let metrics = PrefillMetrics {
        ms,
        tok_count: tokens.len(),
        tok_per_sec: tokens.len() as f64 / elapsed.as_secs_f64().max(1e-9),
    };
    ctx.telemetry.record(TelemetryEvent::PhaseMetrics {
        phase: Phase::Prefill,
        elapsed_ms: ms,
        tokens: tokens.len(),
        cache_used: cache.current_tokens(),
    });
    ctx.prefill_finished = Some(Instant::now());

    Ok(PrefillResult {
        logits: ctx.scratch.logits(),
        processed_tokens: tokens.len(),
        metrics,
    })
}

/// Advance the model by one token against the populated cache.
pub fn decode<'a>(
    weights: &ModelWeights,
    next_token: i32,
    ctx: &'a mut ExecutionContext,
    cancel: &CancelToken,
) -> QuernResult<DecodeResult<'a>> {
    if ctx.cache.is_none() {
        if ctx.options.require_kv_cache {
            return Err(QuernError::InvariantViolation(
                "decode without a prefilled cache".to_string(),
            ));
        }
        let hp = weights.hparams();
        let shape = CacheShape {
            n_layers: hp.n_layers,
            n_kv_heads: hp.n_kv_heads,
            head_dim: hp.head_dim(),
        };
        let capacity = ctx.cache_capacity_for(weights);
        ctx.cache = Some(ctx.pool.rent(shape, capacity));
    }
    let cache = ctx.cache.as_mut().ok_or_else(|| {
        QuernError::InvariantViolation("decode lost its cache".to_string())
    })?;

    let start = Instant::now();
    let position = ctx.position_base + cache.current_tokens();
    ctx.decode_input[0] = next_token;
    forward(
        weights,
        &ctx.decode_input,
        position,
        cache,
        &mut ctx.scratch,
        &ctx.policy,
        cancel,
        true,
    )?;

    let ms = start.elapsed().as_secs_f64() * 1000.0;
    let cache_used = cache.current_tokens();
    if let Some(prefill_done) = ctx.prefill_finished.take() {
        ctx.telemetry.record(TelemetryEvent::TimeToFirstToken {
            ms: prefill_done.elapsed().as_secs_f64() * 1000.0,
        });
    }
    ctx.telemetry.record(TelemetryEvent::PhaseMetrics {
        phase: Phase::Decode,
        elapsed_ms: ms,
        tokens: 1,
        cache_used,
    });

    Ok(DecodeResult {
        logits: ctx.scratch.logits(),
        metrics: DecodeMetrics {
            ms,
            position,
            cache_used,
        },
    })
}
