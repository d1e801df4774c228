//! Review flags for resolved paths.
//!
//! Whole-file resolution is blind to content, so some paths (infrastructure
//! code, schemas) are worth a human look afterwards. [`ReviewPolicy`] matches
//! resolved paths against configured glob patterns; a hit never changes how
//! the path is resolved.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A resolved path that matched a review pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFlag {
    pub path: String,
    pub pattern: String,
    pub round: u32,
}

/// Glob-based review policy. Patterns match the repo-relative path.
#[derive(Debug, Clone, Default)]
pub struct ReviewPolicy {
    patterns: Vec<String>,
}

impl ReviewPolicy {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.replace('\\', "/"))
                .collect(),
        }
    }

    /// The first pattern `path` matches, as a flag for `round`.
    pub fn check(&self, path: &str, round: u32) -> Option<ReviewFlag> {
        let normalized = path.replace('\\', "/");
        let pattern = self
            .patterns
            .iter()
            .find(|p| glob_match::glob_match(p, &normalized))?;
        warn!(path, pattern = pattern.as_str(), round, "resolved file flagged for review");
        Some(ReviewFlag {
            path: path.to_string(),
            pattern: pattern.clone(),
            round,
        })
    }
}
