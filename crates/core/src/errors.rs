//! Error types for the rebasefix core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Hosting(#[from] HostingError),
}

// ---------------------------------------------------------------------------
// Version control errors
// ---------------------------------------------------------------------------

/// Errors from working-copy operations (git2 and the `git` binary).
#[derive(Debug, Error)]
pub enum VcsError {
    /// The working copy path does not exist or is not a git repository.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// Cloning did not finish within the acquisition timeout.
    #[error("clone of '{url}' timed out after {secs}s")]
    CloneTimeout { url: String, secs: u64 },

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A `git` subprocess exited with a non-zero status.
    #[error("git {command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// A ref (branch, remote-tracking ref) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// Push was rejected by the remote.
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// A commit was requested while the index still holds conflict stages.
    #[error("index still has unresolved conflicts")]
    UnresolvedIndex,

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// File resolution errors
// ---------------------------------------------------------------------------

/// Errors raised while applying a strategy to one conflicted path.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The selected side's content could not be read from the merge state.
    #[error("cannot decode {side} side of '{path}': {detail}")]
    UndecodableSide {
        path: String,
        side: String,
        detail: String,
    },

    /// The path would land outside the working copy.
    #[error("refusing to resolve '{0}': path escapes the working copy")]
    InvalidPath(String),

    /// Writing or removing the file failed.
    #[error("failed to write resolution for '{path}': {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Run errors
// ---------------------------------------------------------------------------

/// Failures that terminate a resolution run with the `Error` outcome.
///
/// Every variant names the round it happened in (0 when the run never
/// reached the round loop) and, where there is one, the failing path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("clone timed out after {secs}s: {detail}")]
    CloneTimeout { secs: u64, detail: String },

    #[error("clone failed: {0}")]
    CloneFailure(String),

    #[error("rebase failed in round {round}: {detail}")]
    RebaseFailure { round: u32, detail: String },

    #[error("unresolvable conflict on '{path}' in round {round}: {detail}")]
    UnresolvableConflict {
        path: String,
        round: u32,
        detail: String,
    },

    #[error("'{path}' was still conflicted after staging twice in round {round}")]
    StageVerificationFailure { path: String, round: u32 },

    #[error("commit of the rebased branch failed in round {round}: {detail}")]
    CommitFailure { round: u32, detail: String },

    #[error("force-publish of '{branch}' failed after round {round}: {detail}")]
    PublishFailure {
        branch: String,
        round: u32,
        detail: String,
    },
}

impl RunError {
    /// Short machine-readable kind, used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CloneTimeout { .. } => "clone_timeout",
            Self::CloneFailure(_) => "clone_failure",
            Self::RebaseFailure { .. } => "rebase_failure",
            Self::UnresolvableConflict { .. } => "unresolvable_conflict",
            Self::StageVerificationFailure { .. } => "stage_verification_failure",
            Self::CommitFailure { .. } => "commit_failure",
            Self::PublishFailure { .. } => "publish_failure",
        }
    }

    /// The path the failure is about, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::UnresolvableConflict { path, .. }
            | Self::StageVerificationFailure { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The round the failure happened in; 0 before the round loop.
    pub fn round(&self) -> u32 {
        match self {
            Self::RebaseFailure { round, .. }
            | Self::UnresolvableConflict { round, .. }
            | Self::StageVerificationFailure { round, .. }
            | Self::CommitFailure { round, .. }
            | Self::PublishFailure { round, .. } => *round,
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Hosting (GitLab) errors
// ---------------------------------------------------------------------------

/// Errors from GitLab REST API interactions.
#[derive(Debug, Error)]
pub enum HostingError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("GitLab HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("GitLab API error (HTTP {status}): {body}")]
    ApiError { status: u16, body: String },

    /// No token could be found in the config or the environment.
    #[error("GitLab authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A merge request reference could not be understood.
    #[error("invalid merge request reference '{0}': expected an IID or a merge request URL")]
    InvalidReference(String),
}
