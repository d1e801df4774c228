//! Progress reporting from the engine to its caller.
//!
//! The engine calls a [`ProgressSink`] from its worker thread, in order:
//! `on_round_start(n)`, any number of `on_event`, `on_round_resolved(n, ..)`
//! for each round, then exactly one `on_terminal`.

use tracing::{debug, error, info, warn};

use crate::engine::TerminalOutcome;
use crate::models::Severity;

/// Receiver of engine progress. Must be callable from the worker thread.
pub trait ProgressSink: Send + Sync {
    /// Human-readable progress message.
    fn on_event(&self, severity: Severity, message: &str);

    /// Round `round` (1-based) is starting.
    fn on_round_start(&self, round: u32);

    /// Every conflicted path of `round` was resolved and verified staged.
    fn on_round_resolved(&self, round: u32, paths: &[String]);

    /// The run finished. Called exactly once.
    fn on_terminal(&self, outcome: &TerminalOutcome);
}

/// Sink that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn on_event(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => debug!("{message}"),
            Severity::Info => info!("{message}"),
            Severity::Warning => warn!("{message}"),
            Severity::Error => error!("{message}"),
        }
    }

    fn on_round_start(&self, round: u32) {
        info!(round, "round started");
    }

    fn on_round_resolved(&self, round: u32, paths: &[String]) {
        info!(round, resolved = paths.len(), ?paths, "round resolved");
    }

    fn on_terminal(&self, outcome: &TerminalOutcome) {
        if outcome.is_success() {
            info!(outcome = outcome.kind(), "{}", outcome.message());
        } else {
            error!(outcome = outcome.kind(), "{}", outcome.message());
        }
    }
}
