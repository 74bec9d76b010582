/// The embedding API.
///
/// An [`Engine`] loads models and creates [`Session`]s. The engine and
/// model handles are shareable across threads; a session is a
/// single-caller object; concurrent invocations on one session are a
/// programmer error and fail fast with `SessionInUse`.
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::cancel::CancelToken;
use crate::chat::{
    load_session_file, save_session_file, validate_json_schema, ChatMessage, ChatRequest,
    ChatResponse, ContextPolicy, PersistedSession, Role, StopMatcher, TemplateStyle, Usage,
    SESSION_SCHEMA_VERSION,
};
use crate::error::{BudgetKind, FinishReason, QuernError, QuernResult};
use crate::kernels::parallel::ParallelPolicy;
use crate::kv::{CacheShape, KvCachePool, KvStore, KvStoreConfig};
use crate::model::{
    load_model, MemoryBudget, MemoryBudgetMode, ModelWeights,
};
use crate::runtime::{decode, prefill, ExecutionContext, ExecutorOptions};
use crate::sampler::{sample, SamplerOptions, SamplerState};
use crate::telemetry::{default_telemetry, Telemetry};
use crate::tokenizer::{SpecialInsert, Tokenizer};

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Global cap on loaded tensor bytes.
    pub max_tensor_bytes: Option<u64>,
    pub memory_budget_mode: MemoryBudgetMode,
    /// Budgets for the per-session KV cache store.
    pub kv_store: KvStoreConfig,
    /// Worker-thread cap for the kernels; defaults to the CPU count.
    pub max_parallelism: Option<usize>,
}

/// A loaded model: immutable weights plus the tokenizer and template built
/// from its metadata. Shared read-only between sessions.
pub struct LoadedModel {
    pub weights: ModelWeights,
    pub tokenizer: Tokenizer,
    pub template: TemplateStyle,
}

impl LoadedModel {
    fn cache_shape(&self) -> CacheShape {
        let hp = self.weights.hparams();
        CacheShape {
            n_layers: hp.n_layers,
            n_kv_heads: hp.n_kv_heads,
            head_dim: hp.head_dim(),
        }
    }
}

/// Opaque reference to a loaded model.
#[derive(Clone)]
pub struct ModelHandle {
    id: String,
    model: Arc<LoadedModel>,
}

impl ModelHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &LoadedModel {
        &self.model
    }
}

pub struct Engine {
    options: EngineOptions,
    telemetry: Telemetry,
    pool: Arc<KvCachePool>,
    kv_store: Arc<KvStore>,
    models: RwLock<HashMap<String, Arc<LoadedModel>>>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self::with_telemetry(options, default_telemetry())
    }

    pub fn with_telemetry(options: EngineOptions, telemetry: Telemetry) -> Self {
        let kv_store = Arc::new(KvStore::new(options.kv_store, Arc::clone(&telemetry)));
        Self {
            options,
            telemetry,
            pool: Arc::new(KvCachePool::default()),
            kv_store,
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn telemetry(&self) -> Telemetry {
        Arc::clone(&self.telemetry)
    }

    /// Load a model file and register it under a fresh handle.
    pub fn load_model(&self, path: &Path, cancel: &CancelToken) -> QuernResult<ModelHandle> {
        let budget = MemoryBudget {
            max_tensor_bytes: self.options.max_tensor_bytes,
            mode: self.options.memory_budget_mode,
        };
        let weights = load_model(path, budget, &self.telemetry, cancel)?;

        let tokenizer = Tokenizer::from_metadata(&weights.metadata.tokenizer, &self.telemetry);
        if tokenizer.vocab().len() != weights.hparams().vocab_size {
            tracing::warn!(
                tokenizer = tokenizer.vocab().len(),
                model = weights.hparams().vocab_size,
                "tokenizer vocabulary size differs from model vocab size"
            );
        }
        let template = TemplateStyle::from_name(
            weights.metadata.tokenizer.chat_template_style.as_deref(),
        );

        let id = uuid::Uuid::new_v4().to_string();
        let model = Arc::new(LoadedModel {
            weights,
            tokenizer,
            template,
        });
        self.models.write().insert(id.clone(), Arc::clone(&model));
        tracing::info!(handle = %id, "model registered");
        Ok(ModelHandle { id, model })
    }

    /// Re-resolve a handle id, e.g. after the caller kept only the string.
    pub fn get_model(&self, id: &str) -> Option<ModelHandle> {
        self.models.read().get(id).map(|model| ModelHandle {
            id: id.to_string(),
            model: Arc::clone(model),
        })
    }

    /// Drop a model from the registry. Sessions holding the handle keep
    /// working; the weights are freed when the last clone goes away.
    pub fn unload_model(&self, id: &str) -> bool {
        self.models.write().remove(id).is_some()
    }

    pub fn create_session(
        &self,
        handle: &ModelHandle,
        options: SessionOptions,
    ) -> QuernResult<Session> {
        let model = Arc::clone(&handle.model);
        let hp = model.weights.hparams();
        let capacity = options
            .max_kv_cache_tokens
            .unwrap_or(hp.context_length)
            .min(hp.context_length);

        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if options.enable_kv_cache {
            let shape = model.cache_shape();
            if let Some(limit) = options.per_session_kv_bytes {
                let bytes = shape.size_bytes(capacity);
                if bytes > limit {
                    return Err(QuernError::BudgetExceeded {
                        kind: BudgetKind::KvCachePerSession,
                        message: format!(
                            "session cache needs {} bytes, session option allows {}",
                            bytes, limit
                        ),
                    });
                }
            }
            // registers in the LRU store; store-level budgets apply here
            self.kv_store.create(&session_id, shape, capacity)?;
        }

        let policy = ParallelPolicy {
            deterministic: options.deterministic,
            max_degree: self.options.max_parallelism.unwrap_or_else(num_cpus::get),
            ..Default::default()
        };
        let executor_options = ExecutorOptions {
            allow_prefill_reset: true,
            // the session layer manages cache presence itself
            require_kv_cache: false,
            cache_capacity: Some(capacity),
            ..Default::default()
        };
        let ctx = ExecutionContext::new(
            executor_options,
            policy,
            Arc::clone(&self.telemetry),
            Arc::clone(&self.pool),
        );

        let sampler_options = SamplerOptions {
            temperature: options.temperature,
            top_k: options.top_k,
            top_p: options.top_p,
            repetition_penalty: options.repetition_penalty,
            repetition_window: options.repetition_window,
            seed: options.seed.unwrap_or(0),
        };
        let sampler = SamplerState::new(
            sampler_options,
            model.tokenizer.vocab().special_ids(),
            model.tokenizer.vocab().specials().eos,
        );

        tracing::debug!(session = %session_id, capacity, "session created");
        Ok(Session {
            id: session_id,
            model,
            kv_store: Arc::clone(&self.kv_store),
            options,
            cache_capacity: capacity,
            state: Mutex::new(SessionState {
                ctx,
                sampler,
                system_prompt: None,
                messages: Vec::new(),
                cached_tokens: Vec::new(),
                usage: Usage::default(),
            }),
        })
    }
}

/// Recognized session options; see the embedding API contract for
/// defaults.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub session_id: Option<String>,
    pub enable_kv_cache: bool,
    pub max_kv_cache_tokens: Option<usize>,
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub repetition_window: usize,
    pub seed: Option<u64>,
    pub stop_sequences: Vec<String>,
    pub context_policy: ContextPolicy,
    pub per_session_kv_bytes: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub deterministic: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            enable_kv_cache: true,
            max_kv_cache_tokens: None,
            max_new_tokens: 128,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            repetition_penalty: 1.0,
            repetition_window: 64,
            seed: None,
            stop_sequences: Vec::new(),
            context_policy: ContextPolicy::KeepAll,
            per_session_kv_bytes: None,
            timeout_ms: None,
            deterministic: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub message_count: usize,
    /// Prompt/generation tokens the session believes are in its cache.
    pub cached_tokens: usize,
    /// Positions actually held by the KV cache. Always equals
    /// `cached_tokens` between turns; a mismatch would mean the session
    /// lost track of its own history.
    pub cache_occupancy: usize,
    pub usage: Usage,
}

struct SessionState {
    ctx: ExecutionContext,
    sampler: SamplerState,
    system_prompt: Option<String>,
    messages: Vec<ChatMessage>,
    /// Prompt tokens currently represented in the KV cache, for
    /// suffix-only prefill across turns.
    cached_tokens: Vec<i32>,
    usage: Usage,
}

/// A stateful chat session. One logical caller at a time; the state lock
/// is tried, never waited on, so a second concurrent caller gets
/// `SessionInUse` instead of a silent queue.
pub struct Session {
    id: String,
    model: Arc<LoadedModel>,
    kv_store: Arc<KvStore>,
    options: SessionOptions,
    cache_capacity: usize,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("cache_capacity", &self.cache_capacity)
            .finish_non_exhaustive()
    }
}

/// One streamed piece of assistant text.
pub type StreamItem = QuernResult<String>;

/// Pull-style token stream; iterate the pieces, then call
/// [`TokenStream::finish`] for the full response.
pub struct TokenStream {
    rx: mpsc::Receiver<StreamItem>,
    handle: Option<std::thread::JoinHandle<QuernResult<ChatResponse>>>,
}

impl Iterator for TokenStream {
    type Item = StreamItem;

    fn next(&mut self) -> Option<StreamItem> {
        self.rx.recv().ok()
    }
}

impl TokenStream {
    /// Wait for the generation thread and return the final response.
    pub fn finish(mut self) -> QuernResult<ChatResponse> {
        // drain anything the consumer skipped so the producer can exit
        while self.rx.recv().is_ok() {}
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| QuernError::InferenceFailure("stream worker panicked".to_string()))?,
            None => Err(QuernError::InvariantViolation(
                "stream already finished".to_string(),
            )),
        }
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        let cache_occupancy = if state.ctx.has_cache() {
            state.ctx.cache_tokens()
        } else {
            self.kv_store.resident_tokens(&self.id).unwrap_or(0)
        };
        SessionInfo {
            session_id: self.id.clone(),
            message_count: state.messages.len(),
            cached_tokens: state.cached_tokens.len(),
            cache_occupancy,
            usage: state.usage,
        }
    }

    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        self.state.lock().system_prompt = Some(prompt.into());
    }

    /// Run one turn to completion.
    pub fn generate(&self, request: ChatRequest, cancel: &CancelToken) -> QuernResult<ChatResponse> {
        self.run_turn(request, cancel, &mut |_| {})
    }

    /// Run one turn, pushing each decoded piece into `on_token`.
    pub fn generate_streaming(
        &self,
        request: ChatRequest,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&str),
    ) -> QuernResult<ChatResponse> {
        self.run_turn(request, cancel, on_token)
    }

    /// Run one turn on a worker thread, yielding pieces through a bounded
    /// channel of depth 1. Dropping the stream cancels the turn.
    pub fn stream(self: &Arc<Self>, request: ChatRequest, cancel: &CancelToken) -> TokenStream {
        let (tx, rx) = mpsc::sync_channel::<StreamItem>(1);
        let session = Arc::clone(self);
        let cancel = cancel.clone();
        let handle = std::thread::spawn(move || {
            let result = session.run_turn(request, &cancel, &mut |piece| {
                // a closed receiver means the consumer is gone
                if tx.send(Ok(piece.to_string())).is_err() {
                    cancel.cancel();
                }
            });
            if let Err(err) = &result {
                let _ = tx.send(Err(QuernError::InferenceFailure(err.to_string())));
            }
            result
        });
        TokenStream {
            rx,
            handle: Some(handle),
        }
    }

    /// Clear history and cache; the system prompt survives a reset.
    pub fn reset(&self) -> QuernResult<()> {
        let mut state = self
            .state
            .try_lock()
            .ok_or(QuernError::SessionInUse)?;
        state.messages.clear();
        state.cached_tokens.clear();
        state.usage = Usage::default();
        state.sampler.reset();
        state.ctx.reset();
        self.kv_store.remove(&self.id);
        if self.options.enable_kv_cache {
            self.kv_store
                .create(&self.id, self.model.cache_shape(), self.cache_capacity)?;
        }
        Ok(())
    }

    /// Persist history to disk (atomic write).
    pub fn save(&self, path: &Path) -> QuernResult<()> {
        let state = self.state.lock();
        let persisted = PersistedSession {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: self.id.clone(),
            system_prompt: state.system_prompt.clone(),
            messages: state.messages.clone(),
            usage: state.usage,
        };
        save_session_file(path, &persisted)
    }

    /// Restore history from disk. The KV cache is rebuilt lazily on the
    /// next turn.
    pub fn load(&self, path: &Path) -> QuernResult<()> {
        let persisted = load_session_file(path)?;
        let mut state = self
            .state
            .try_lock()
            .ok_or(QuernError::SessionInUse)?;
        state.system_prompt = persisted.system_prompt;
        state.messages = persisted.messages;
        state.usage = persisted.usage;
        state.cached_tokens.clear();
        state.ctx.reset();
        Ok(())
    }

    fn run_turn(
        &self,
        request: ChatRequest,
        cancel: &CancelToken,
        on_token: &mut dyn FnMut(&str),
    ) -> QuernResult<ChatResponse> {
        // single-writer check: fail fast instead of queueing
        let mut state = self
            .state
            .try_lock()
            .ok_or(QuernError::SessionInUse)?;
        let state = &mut *state;

        let timeout_ms = request.options.timeout_ms.or(self.options.timeout_ms);
        let cancel = match timeout_ms {
            Some(ms) => cancel.with_timeout_from_now(Duration::from_millis(ms)),
            None => cancel.clone(),
        };

        let started = Instant::now();
        state.messages.extend(request.messages.iter().cloned());

        // context policy -> template -> tokens
        let tokenizer = &self.model.tokenizer;
        let policy = request.context_policy.unwrap_or(self.options.context_policy);
        let mut full_history = Vec::new();
        if let Some(system) = &state.system_prompt {
            full_history.push(ChatMessage::new(Role::System, system.clone()));
        }
        full_history.extend(state.messages.iter().cloned());
        let count = |msg: &ChatMessage| tokenizer.count_tokens(&msg.content) + 4;
        let selected = policy.select(&full_history, &count);
        let prompt_text = self.model.template.render(&selected);
        let prompt_tokens = tokenizer.encode_with_special(&prompt_text, &[SpecialInsert::Bos]);
        if prompt_tokens.is_empty() {
            return Err(QuernError::InvariantViolation(
                "rendered prompt produced no tokens".to_string(),
            ));
        }

        if let Err(err) = self.prepare_cache(state, &prompt_tokens, &cancel) {
            self.stash_cache(state);
            return Err(err);
        }

        // fresh sampling state per turn; the prompt tail seeds the
        // repetition window
        state.sampler.reset();
        let window_start = prompt_tokens
            .len()
            .saturating_sub(self.options.repetition_window);
        for &tok in &prompt_tokens[window_start..] {
            state.sampler.observe(tok);
        }

        let max_new = request
            .options
            .max_new_tokens
            .unwrap_or(self.options.max_new_tokens);
        let stop_sequences = request
            .options
            .stop_sequences
            .clone()
            .unwrap_or_else(|| self.options.stop_sequences.clone());
        let mut stop = StopMatcher::new(stop_sequences);
        let eos = tokenizer.vocab().specials().eos;

        let mut text = String::new();
        let mut utf8 = Utf8Stream::default();
        let mut generated: Vec<i32> = Vec::new();
        let mut finish = FinishReason::Length;
        let mut first_token_ms = 0.0f64;
        let decode_started = Instant::now();

        // the last prompt token drives the first decode; each sampled
        // token drives the next
        let mut next_input = *prompt_tokens.last().unwrap_or(&0);
        while generated.len() < max_new {
            if cancel.is_cancelled() {
                finish = FinishReason::Cancelled;
                break;
            }
            let logits =
                match decode(&self.model.weights, next_input, &mut state.ctx, &cancel) {
                    Ok(result) => result.logits,
                    Err(QuernError::Cancelled) => {
                        finish = FinishReason::Cancelled;
                        break;
                    }
                    Err(QuernError::CacheOverflow { .. }) => {
                        // keep the most recent half of the window and retry;
                        // the context carries the absolute position forward,
                        // and the token list drops the same prefix the cache
                        // dropped so the two stay in step
                        let before = state.ctx.cache_tokens();
                        state.ctx.slide_cache(self.cache_capacity / 2);
                        let dropped = before - state.ctx.cache_tokens();
                        if dropped <= state.cached_tokens.len() {
                            state.cached_tokens.drain(..dropped);
                        } else {
                            state.cached_tokens.clear();
                        }
                        match decode(&self.model.weights, next_input, &mut state.ctx, &cancel) {
                            Ok(result) => result.logits,
                            Err(err) => {
                                self.stash_cache(state);
                                return Err(err);
                            }
                        }
                    }
                    Err(other) => {
                        self.stash_cache(state);
                        return Err(other);
                    }
                };
            // the cache now holds this input's K/V row
            state.cached_tokens.push(next_input);

            let token = match sample(logits, &mut state.sampler) {
                Ok(token) => token,
                Err(err) => {
                    self.stash_cache(state);
                    return Err(err);
                }
            };
            if generated.is_empty() {
                first_token_ms = started.elapsed().as_secs_f64() * 1000.0;
            }
            if eos == Some(token) {
                finish = FinishReason::Eos;
                break;
            }
            generated.push(token);
            next_input = token;

            let piece = match tokenizer.vocab().get(token) {
                Some(bytes) => utf8.push(bytes),
                None => String::new(),
            };
            if !piece.is_empty() {
                text.push_str(&piece);
                on_token(&piece);
            }
            if let Some(matched) = stop.push(&piece) {
                let matched = matched.to_string();
                text = StopMatcher::trim_output(&text, &matched);
                finish = FinishReason::StopSequence;
                break;
            }
        }

        if finish == FinishReason::Cancelled && generated.is_empty() {
            self.stash_cache(state);
            return Err(QuernError::Cancelled);
        }

        let decode_secs = decode_started.elapsed().as_secs_f64();
        self.stash_cache(state);

        // response-format contract; the text is still surfaced on failure
        if let Some(format) = &request.response_format {
            if let Err(reason) = validate_json_schema(&text, &format.json_schema) {
                return Err(QuernError::InvalidOutput { reason, text });
            }
        }

        let usage = Usage {
            prompt_tokens: prompt_tokens.len(),
            completion_tokens: generated.len(),
            time_to_first_token_ms: first_token_ms,
            tokens_per_second: generated.len() as f64 / decode_secs.max(1e-9),
        };
        state.usage.prompt_tokens += usage.prompt_tokens;
        state.usage.completion_tokens += usage.completion_tokens;
        state.usage.time_to_first_token_ms = usage.time_to_first_token_ms;
        state.usage.tokens_per_second = usage.tokens_per_second;

        let message = ChatMessage::assistant(text);
        state.messages.push(message.clone());

        tracing::debug!(
            session = %self.id,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            ?finish,
            "turn complete"
        );
        Ok(ChatResponse {
            message,
            usage,
            finish_reason: finish,
        })
    }

    /// Bring the context's cache in line with `prompt_tokens[..len-1]`,
    /// reusing the cached prefix from earlier turns where possible. The
    /// final prompt token is left for the decode loop.
    fn prepare_cache(
        &self,
        state: &mut SessionState,
        prompt_tokens: &[i32],
        cancel: &CancelToken,
    ) -> QuernResult<()> {
        let head = &prompt_tokens[..prompt_tokens.len() - 1];

        if self.options.enable_kv_cache {
            if let Some(cache) = self.kv_store.checkout(&self.id) {
                state.ctx.install_cache(cache);
            } else if !state.ctx.has_cache() {
                // evicted or first use: a fresh entry under the store budgets
                self.kv_store
                    .create(&self.id, self.model.cache_shape(), self.cache_capacity)?;
                if let Some(cache) = self.kv_store.checkout(&self.id) {
                    state.ctx.install_cache(cache);
                }
                state.ctx.clear_cache();
                state.cached_tokens.clear();
            }
        }

        let reusable = state.ctx.has_cache()
            && !state.cached_tokens.is_empty()
            && state.ctx.cache_tokens() == state.cached_tokens.len()
            && state.cached_tokens.len() <= head.len()
            && head[..state.cached_tokens.len()] == state.cached_tokens[..];

        if reusable {
            // append only the unseen suffix, token by token
            for &tok in &head[state.cached_tokens.len()..] {
                decode(&self.model.weights, tok, &mut state.ctx, cancel)?;
                state.cached_tokens.push(tok);
            }
            return Ok(());
        }

        state.cached_tokens.clear();
        if head.is_empty() {
            // single-token prompt: restart the history and positions at zero
            if state.ctx.has_cache() {
                state.ctx.clear_cache();
            }
            return Ok(());
        }
        let kept = prefill(&self.model.weights, head, &mut state.ctx, cancel)?.processed_tokens;
        // the prefill may have cropped the head; record only what the
        // cache actually holds
        state.cached_tokens.extend_from_slice(&head[head.len() - kept..]);
        Ok(())
    }

    /// Return the cache to the store between turns so idle sessions stay
    /// evictable.
    fn stash_cache(&self, state: &mut SessionState) {
        if !self.options.enable_kv_cache {
            state.ctx.reset();
            state.cached_tokens.clear();
            return;
        }
        if let Some(cache) = state.ctx.take_cache() {
            self.kv_store.checkin(&self.id, cache);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.kv_store.remove(&self.id);
    }
}

/// Incremental UTF-8 assembly for byte-level token streams: emits the
/// longest valid prefix, holds incomplete trailing sequences back.
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_string();
                self.pending.clear();
                out
            }
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_some() {
                    // genuinely invalid bytes: replace and move on
                    let out = String::from_utf8_lossy(&self.pending).into_owned();
                    self.pending.clear();
                    out
                } else {
                    // incomplete tail: emit the valid part, keep the rest
                    let out = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                    self.pending.drain(..valid);
                    out
                }
            }
        }
    }
}
