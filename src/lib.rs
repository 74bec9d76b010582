//! CPU-only quantized LLM inference.
//!
//! `quern` loads a quantized transformer from its native model file,
//! tokenizes text, runs a prefill-then-decode generation loop against a
//! persistent KV cache, and streams output tokens. It is a library meant
//! to be embedded in a server or desktop application; it brings no HTTP
//! surface, no CLI, and no model downloader.
//!
//! The stack, bottom up: quantized tensor store ([`tensor`]), fused
//! kernels ([`kernels`]), transformer forward ([`model`]), KV cache
//! ([`kv`]), prefill/decode executor ([`runtime`]), sampler ([`sampler`]),
//! tokenizer ([`tokenizer`]), and the chat session layer ([`chat`],
//! [`engine`]).
//!
//! ```no_run
//! use quern::{CancelToken, ChatRequest, Engine, EngineOptions, SessionOptions};
//!
//! # fn main() -> quern::QuernResult<()> {
//! let engine = Engine::new(EngineOptions::default());
//! let model = engine.load_model("model.smq".as_ref(), &CancelToken::new())?;
//! let session = engine.create_session(&model, SessionOptions::default())?;
//! let response = session.generate(ChatRequest::from_user_text("Hello!"), &CancelToken::new())?;
//! println!("{}", response.message.content);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod chat;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod kv;
pub mod model;
pub mod runtime;
pub mod sampler;
pub mod telemetry;
pub mod tensor;
pub mod tokenizer;

pub use cancel::CancelToken;
pub use chat::{ChatMessage, ChatRequest, ChatResponse, ContextPolicy, Role, Usage};
pub use engine::{Engine, EngineOptions, ModelHandle, Session, SessionInfo, SessionOptions, TokenStream};
pub use error::{BudgetKind, FinishReason, QuernError, QuernResult};
pub use telemetry::{Telemetry, TelemetryEvent, TelemetrySink};
