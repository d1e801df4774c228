//! Domain model types shared by the engine, the clients and the CLI.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Resolution strategy
// ---------------------------------------------------------------------------

/// Whole-file conflict resolution policy, selected once per run.
///
/// During a rebase git calls the replayed commit "theirs" and the branch
/// being rebased onto "ours", so `theirs`/`ours` are accepted as aliases.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the proposed change's version of every conflicted file.
    #[default]
    #[serde(alias = "theirs")]
    KeepIncoming,
    /// Keep the target branch's version of every conflicted file.
    #[serde(alias = "ours")]
    KeepBase,
}

impl ResolutionStrategy {
    /// Which side of the conflict this strategy selects.
    pub fn side(self) -> Side {
        match self {
            Self::KeepIncoming => Side::Incoming,
            Self::KeepBase => Side::Base,
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeepIncoming => write!(f, "keep_incoming"),
            Self::KeepBase => write!(f, "keep_base"),
        }
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keep_incoming" | "incoming" | "theirs" => Ok(Self::KeepIncoming),
            "keep_base" | "base" | "ours" => Ok(Self::KeepBase),
            other => Err(format!(
                "unknown strategy '{other}': use keep_incoming (theirs) or keep_base (ours)"
            )),
        }
    }
}

/// One side of a rebase conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The commit being replayed from the proposed change (index stage 3).
    Incoming,
    /// The target branch state being rebased onto (index stage 2).
    Base,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incoming => write!(f, "incoming"),
            Self::Base => write!(f, "base"),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Name and email used as commit author (and working-copy committer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorIdentity {
    pub name: String,
    pub email: String,
}

impl AuthorIdentity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl std::fmt::Display for AuthorIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

// ---------------------------------------------------------------------------
// Progress severity
// ---------------------------------------------------------------------------

/// Severity of a human-readable progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}
