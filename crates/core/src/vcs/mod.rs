//! Version-control seam used by the resolution engine.
//!
//! [`VersionControlClient`] abstracts every working-copy operation the engine
//! performs, so the engine can be driven by the real [`GitClient`] or by a
//! scripted double in tests. Operations are synchronous: the engine runs on a
//! dedicated worker and polls cancellation between calls.
//!
//! Implementations must never block on an interactive prompt (credentials,
//! editors). The engine relies on that and does not defend against hangs.

pub mod git;

#[cfg(test)]
pub(crate) mod mock;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::VcsError;
use crate::models::AuthorIdentity;

pub use git::GitClient;

/// Opaque identifier of a blob recorded in the merge state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId(pub String);

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One side's entry in the conflicted index (stage 1, 2 or 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideMarker {
    pub blob: BlobId,
    pub size: u64,
    pub mode: u32,
    pub binary: bool,
}

/// Raw conflict markers for one path.
///
/// `None` for a side means that side deleted (or never had) the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictMarkers {
    /// Common ancestor (stage 1).
    pub ancestor: Option<SideMarker>,
    /// Target branch being rebased onto (stage 2, git "ours").
    pub base: Option<SideMarker>,
    /// Commit being replayed (stage 3, git "theirs").
    pub incoming: Option<SideMarker>,
}

impl ConflictMarkers {
    /// `true` when no stage entry exists for the path.
    pub fn is_empty(&self) -> bool {
        self.ancestor.is_none() && self.base.is_none() && self.incoming.is_none()
    }

    /// Two-letter unmerged status code as `git status --porcelain` prints it.
    pub fn porcelain_code(&self) -> &'static str {
        match (
            self.ancestor.is_some(),
            self.base.is_some(),
            self.incoming.is_some(),
        ) {
            (true, true, true) => "UU",
            (false, true, true) => "AA",
            (true, false, true) => "DU",
            (true, true, false) => "UD",
            (true, false, false) => "DD",
            (false, true, false) => "AU",
            (false, false, true) => "UA",
            (false, false, false) => "  ",
        }
    }
}

/// One path reported by [`VersionControlClient::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub path: String,
    /// Status code as reported by the tool (e.g. `UU`).
    pub code: String,
    pub markers: ConflictMarkers,
}

/// Point-in-time view of a working copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// A rebase is stopped and waiting for `--continue`/`--abort`.
    pub rebase_in_progress: bool,
    /// Paths the tool flags as unmerged.
    pub entries: Vec<StatusEntry>,
}

/// Result of starting or continuing a rebase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseResult {
    /// All commits were replayed; no rebase is in progress any more.
    Clean,
    /// The rebase stopped on a step that needs resolution.
    Conflicted,
    /// The rebase failed for a reason other than a conflict.
    Failed(String),
}

/// What to clone and how to configure the resulting working copy.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    /// Remote URL (https or a local path).
    pub url: String,
    /// Branch to check out.
    pub branch: String,
    /// Identity recorded as committer for commits the rebase creates.
    pub identity: AuthorIdentity,
}

/// Working-copy operations needed by the resolution engine.
pub trait VersionControlClient {
    /// Clone `request.branch` of `request.url` into `dest`.
    ///
    /// Must give up with [`VcsError::CloneTimeout`] once `timeout` elapses.
    fn clone_branch(
        &self,
        request: &CloneRequest,
        dest: &Path,
        timeout: Duration,
    ) -> Result<(), VcsError>;

    /// Report rebase state and every unmerged path with its markers.
    fn status(&self, wc: &Path) -> Result<StatusSnapshot, VcsError>;

    /// Start rebasing the checked-out branch onto `target_ref`.
    fn rebase_start(&self, wc: &Path, target_ref: &str) -> Result<RebaseResult, VcsError>;

    /// Continue a stopped rebase after resolution.
    fn rebase_continue(&self, wc: &Path) -> Result<RebaseResult, VcsError>;

    /// Abort the in-progress rebase, restoring the pre-rebase ref.
    fn rebase_abort(&self, wc: &Path) -> Result<(), VcsError>;

    /// Read the content of a blob referenced by a conflict marker.
    fn read_blob(&self, wc: &Path, blob: &BlobId) -> Result<Vec<u8>, VcsError>;

    /// Record the working-copy state of `path` in the index.
    ///
    /// A path missing from the working copy is staged as a deletion.
    fn stage(&self, wc: &Path, path: &str) -> Result<(), VcsError>;

    /// Commit staged changes, if any, with `author` as author and committer.
    ///
    /// Returns the new commit id, or `None` when nothing was staged.
    fn commit(
        &self,
        wc: &Path,
        author: &AuthorIdentity,
        message: &str,
    ) -> Result<Option<String>, VcsError>;

    /// Overwrite `branch` on the remote with the local branch.
    ///
    /// This is destructive: remote history for the branch is replaced.
    fn force_publish(&self, wc: &Path, branch: &str) -> Result<(), VcsError>;
}
