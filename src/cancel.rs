/// Cooperative cancellation.
///
/// Every public operation takes a [`CancelToken`]. The token is polled once
/// per transformer layer inside the forward pass, once per sampled token in
/// the decode loop, and between prefill chunks. A per-request timeout is the
/// same mechanism with a deadline attached.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{QuernError, QuernResult};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Token that never fires unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that fires after `timeout` even if nobody calls `cancel`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A view of this token that additionally fires after `timeout`.
    /// Cancelling either view cancels both; the deadline only tightens.
    pub fn with_timeout_from_now(&self, timeout: Duration) -> Self {
        let new_deadline = Instant::now() + timeout;
        Self {
            flag: Arc::clone(&self.flag),
            deadline: Some(match self.deadline {
                Some(d) if d < new_deadline => d,
                _ => new_deadline,
            }),
        }
    }

    /// Request cancellation. Safe to call from any thread; the operation
    /// returns `Cancelled` at its next poll point.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Poll point. Work done before the poll is retained by the caller.
    pub fn check(&self) -> QuernResult<()> {
        if self.is_cancelled() {
            Err(QuernError::Cancelled)
        } else {
            Ok(())
        }
    }
}
