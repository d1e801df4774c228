//! Cooperative cancellation for resolution runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

/// Shared cancellation flag polled by the engine at safe points.
///
/// Clones share the same flag, so the controller keeps one clone and hands
/// another to the worker running the engine.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; callable from any thread.
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("cancellation requested");
        }
    }

    /// Check whether cancellation has been requested.
    pub fn is_signaled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
