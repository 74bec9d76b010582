/// Telemetry events emitted by the core.
///
/// The engine records what happened; transporting events to a metrics or
/// logging backend is the host's job. Hosts plug in a [`TelemetrySink`];
/// the default sink forwards everything to `tracing`.
use std::sync::Arc;

/// Execution phase for per-call metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prefill,
    Decode,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Prefill => write!(f, "prefill"),
            Phase::Decode => write!(f, "decode"),
        }
    }
}

/// Events the core emits while loading models and generating.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// Prompt was longer than the model context and got trimmed.
    ContextCropped { dropped: usize },
    /// A session asked for a KV cache above its per-session byte cap.
    KvCacheBudgetExceeded {
        session_id: String,
        requested_bytes: u64,
        limit_bytes: u64,
    },
    /// The least-recently-used session's cache was evicted from the store.
    KvCacheEviction {
        session_id: String,
        freed_bytes: u64,
    },
    /// A tensor allocation crossed the soft memory limit in best-effort mode.
    MemoryBudgetSoftLimit {
        requested_bytes: u64,
        limit_bytes: u64,
    },
    /// Model metadata carried no vocabulary.
    VocabMissing,
    /// Model metadata carried a vocabulary but no merge table.
    MergesMissing,
    /// Tokenizer fell back to byte-level BPE.
    FallbackByteBpe,
    /// Per-call phase metrics from the executor.
    PhaseMetrics {
        phase: Phase,
        elapsed_ms: f64,
        tokens: usize,
        cache_used: usize,
    },
    /// Wall time from the end of prefill to the first decoded token.
    TimeToFirstToken { ms: f64 },
}

/// Receives telemetry events. Implementations must be cheap and non-blocking;
/// the executor calls this from the hot path.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Shared handle to a sink, cloned into every component that emits.
pub type Telemetry = Arc<dyn TelemetrySink>;

/// Default sink: forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::ContextCropped { dropped } => {
                tracing::warn!(dropped, "prompt cropped to fit model context");
            }
            TelemetryEvent::KvCacheBudgetExceeded {
                session_id,
                requested_bytes,
                limit_bytes,
            } => {
                tracing::warn!(
                    session_id = %session_id,
                    requested_bytes,
                    limit_bytes,
                    "per-session KV cache budget exceeded"
                );
            }
            TelemetryEvent::KvCacheEviction {
                session_id,
                freed_bytes,
            } => {
                tracing::info!(session_id = %session_id, freed_bytes, "KV cache evicted");
            }
            TelemetryEvent::MemoryBudgetSoftLimit {
                requested_bytes,
                limit_bytes,
            } => {
                tracing::warn!(requested_bytes, limit_bytes, "memory soft limit crossed");
            }
            TelemetryEvent::VocabMissing => tracing::warn!("model metadata has no vocabulary"),
            TelemetryEvent::MergesMissing => {
                tracing::warn!("no merge table, tokenizer degraded to token-table mode")
            }
            TelemetryEvent::FallbackByteBpe => tracing::warn!("tokenizer using byte fallback"),
            TelemetryEvent::PhaseMetrics {
                phase,
                elapsed_ms,
                tokens,
                cache_used,
            } => {
                tracing::debug!(%phase, elapsed_ms, tokens, cache_used, "phase complete");
            }
            TelemetryEvent::TimeToFirstToken { ms } => {
                tracing::debug!(ms, "time to first token");
            }
        }
    }
}

/// Build the default telemetry handle.
pub fn default_telemetry() -> Telemetry {
    Arc::new(TracingSink)
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;

    #[test]
    fn test_tracing_sink_accepts_all_events() {
        let sink = TracingSink;
        sink.record(TelemetryEvent::ContextCropped { dropped: 2 });
        sink.record(TelemetryEvent::TimeToFirstToken { ms: 12.5 });
        sink.record(TelemetryEvent::VocabMissing);
    }

    #[test]
    fn test_recording_sink_captures_events() {
        let sink = RecordingSink::default();
        sink.record(TelemetryEvent::KvCacheEviction {
            session_id: "s1".to_string(),
            freed_bytes: 1024,
        });
        sink.record(TelemetryEvent::ContextCropped { dropped: 1 });
        assert_eq!(sink.events.lock().len(), 2);
        assert_eq!(sink.count_evictions(), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Prefill.to_string(), "prefill");
        assert_eq!(Phase::Decode.to_string(), "decode");
    }
}
