use thiserror::Error;

/// Which budget a [`QuernError::BudgetExceeded`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    /// Per-session KV cache byte limit
    KvCachePerSession,
    /// Total KV cache bytes across all sessions
    KvCacheTotal,
    /// Global tensor memory limit
    Memory,
    /// Token budget for a request
    Tokens,
    /// Wall-clock budget for a request
    Time,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BudgetKind::KvCachePerSession => "kv_cache_per_session",
            BudgetKind::KvCacheTotal => "kv_cache_total",
            BudgetKind::Memory => "memory",
            BudgetKind::Tokens => "tokens",
            BudgetKind::Time => "time",
        };
        write!(f, "{}", name)
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop (no other condition hit)
    Stop,
    /// `max_new_tokens` reached
    Length,
    /// End-of-sequence token sampled
    Eos,
    /// A caller-provided stop sequence matched
    StopSequence,
    /// Cancellation or timeout observed
    Cancelled,
    /// Generation aborted on an error after partial output
    Error,
}

#[derive(Error, Debug)]
pub enum QuernError {
    #[error("Unsupported quantization scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Short read: {0}")]
    ShortRead(String),

    #[error("Corrupt model file: {0}")]
    Corrupt(String),

    #[error("Invalid tensor shape: {0}")]
    InvalidShape(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Scheme mismatch: expected {expected}, got {got}")]
    SchemeMismatch { expected: String, got: String },

    #[error("Context limit exceeded: max {max}, required {required}")]
    ContextLimitExceeded { max: usize, required: usize },

    #[error("Budget exceeded ({kind}): {message}")]
    BudgetExceeded { kind: BudgetKind, message: String },

    #[error("Session is already in use by another caller")]
    SessionInUse,

    #[error("KV cache overflow: {used} + {appended} exceeds capacity {capacity}")]
    CacheOverflow {
        used: usize,
        appended: usize,
        capacity: usize,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Inference failure: {0}")]
    InferenceFailure(String),

    #[error("Invalid token id {id}, vocabulary size {vocab_size}")]
    InvalidToken { id: i32, vocab_size: usize },

    #[error("Response format validation failed: {reason}")]
    InvalidOutput { reason: String, text: String },

    #[error("Unsupported session schema version {0}")]
    SchemaUnsupported(u32),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type QuernResult<T> = Result<T, QuernError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_kind_display() {
        assert_eq!(BudgetKind::KvCachePerSession.to_string(), "kv_cache_per_session");
        assert_eq!(BudgetKind::Memory.to_string(), "memory");
        assert_eq!(BudgetKind::Time.to_string(), "time");
    }

    #[test]
    fn test_error_messages_are_descriptive() {
        let err = QuernError::ContextLimitExceeded {
            max: 2048,
            required: 4096,
        };
        assert!(err.to_string().contains("2048"));
        assert!(err.to_string().contains("4096"));

        let err = QuernError::CacheOverflow {
            used: 7,
            appended: 2,
            capacity: 8,
        };
        assert!(err.to_string().contains("capacity 8"));
    }

    #[test]
    fn test_budget_exceeded_carries_kind() {
        let err = QuernError::BudgetExceeded {
            kind: BudgetKind::KvCachePerSession,
            message: "session cache would need 1 GiB".to_string(),
        };
        assert!(err.to_string().contains("kv_cache_per_session"));
    }

    #[test]
    fn test_finish_reason_serde_round_trip() {
        let json = serde_json::to_string(&FinishReason::StopSequence).unwrap();
        assert_eq!(json, "\"stop_sequence\"");
        let back: FinishReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FinishReason::StopSequence);
    }
}
