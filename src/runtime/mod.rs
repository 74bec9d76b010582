/// Prefill/decode execution.
mod executor;

pub use executor::{
    DecodeMetrics, DecodeResult, ExecutionContext, ExecutorOptions, PrefillMetrics, PrefillResult,
};
pub use executor::{decode, prefill};
