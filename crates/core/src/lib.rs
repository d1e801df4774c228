//! rebasefix core library.
//!
//! This crate provides the multi-round rebase conflict resolution engine and
//! its collaborators: configuration, the version-control seam and its git
//! implementation, conflict classification and resolution, progress
//! reporting, run reports, and the GitLab client used by the CLI.

pub mod cancel;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod hosting;
pub mod models;
pub mod progress;
pub mod report;
pub mod vcs;

// Re-exports for convenience.
pub use cancel::CancellationToken;
pub use config::AppConfig;
pub use engine::{ConflictResolutionEngine, EngineConfig, RunRequest, TerminalOutcome};
pub use progress::{ProgressSink, TracingSink};
pub use report::RunReport;
pub use vcs::{GitClient, VersionControlClient};
