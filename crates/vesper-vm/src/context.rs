//! Execution context: cooperative cancellation and deadlines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation and deadline state for one `run`/`call` invocation.
///
/// The halt flag is shared: clone a [`CancelHandle`] to another thread to
/// cancel a running VM. The dispatch loop reads the flag every
/// instruction and polls the deadline on the periodic-check boundary.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    halt: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A derived context whose deadline is `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            halt: self.halt.clone(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A handle that can cancel this context from any thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.halt.clone())
    }

    pub fn cancel(&self) {
        self.halt.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.halt.load(Ordering::Relaxed)
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// Cross-thread cancellation handle.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}
