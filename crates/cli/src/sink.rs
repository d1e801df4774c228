//! Terminal progress display for a resolution run.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use rebasefix_core::models::Severity;
use rebasefix_core::{ProgressSink, TerminalOutcome};

use crate::style;

/// Spinner plus one line per milestone. Every callback is also forwarded to
/// `tracing` so the log file sees the same events.
pub struct ConsoleSink {
    spinner: ProgressBar,
    max_rounds: u32,
    verbose: bool,
}

impl ConsoleSink {
    pub fn new(max_rounds: u32, verbose: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.blue} {msg} {elapsed:.dim}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.set_message("Cloning source branch...");
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self {
            spinner,
            max_rounds,
            verbose,
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn on_event(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => {
                tracing::debug!("{message}");
                if self.verbose {
                    self.spinner.println(format!("  {}", style::dim(message)));
                }
            }
            Severity::Info => {
                tracing::info!("{message}");
                self.spinner.set_message(message.to_string());
            }
            Severity::Warning => {
                tracing::warn!("{message}");
                self.spinner.println(format!("  {}", style::warn(message)));
            }
            Severity::Error => {
                tracing::error!("{message}");
                self.spinner.println(format!("  {}", style::error(message)));
            }
        }
    }

    fn on_round_start(&self, round: u32) {
        tracing::info!(round, "round started");
        self.spinner.set_message(format!(
            "{} resolving conflicts...",
            style::round(round, self.max_rounds)
        ));
    }

    fn on_round_resolved(&self, round: u32, paths: &[String]) {
        tracing::info!(round, resolved = paths.len(), "round resolved");
        self.spinner.println(format!(
            "{} {}",
            style::round(round, self.max_rounds),
            style::success(&format!("{} file(s) resolved", paths.len()))
        ));
        for path in paths {
            self.spinner.println(format!("    {}", style::dim(path)));
        }
    }

    fn on_terminal(&self, outcome: &TerminalOutcome) {
        tracing::info!(outcome = outcome.kind(), "run finished");
        self.spinner.finish_and_clear();
    }
}
