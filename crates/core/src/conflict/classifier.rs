//! Conflict classification.
//!
//! Turns a working-copy [`StatusSnapshot`] into the ordered list of paths the
//! current rebase step stopped on. Classification is marker based: a path the
//! tool flags as unmerged but that has no index stage entry is ignored.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::vcs::{SideMarker, StatusSnapshot};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Size/type class of a conflicted path. Only affects logging.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Text,
    BinaryOrLarge,
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::BinaryOrLarge => write!(f, "binary_or_large"),
        }
    }
}

/// How the two sides disagree about a path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictShape {
    /// Both sides changed the content.
    Content,
    /// Both sides added the path independently.
    BothAdded,
    /// The incoming commit deleted a path the base changed.
    DeletedByIncoming,
    /// The base deleted a path the incoming commit changed.
    DeletedByBase,
    /// Neither side has the path any more.
    BothDeleted,
}

impl std::fmt::Display for ConflictShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Content => write!(f, "content"),
            Self::BothAdded => write!(f, "both_added"),
            Self::DeletedByIncoming => write!(f, "deleted_by_incoming"),
            Self::DeletedByBase => write!(f, "deleted_by_base"),
            Self::BothDeleted => write!(f, "both_deleted"),
        }
    }
}

/// One conflicted path of the current round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictedFile {
    pub path: String,
    pub kind: FileKind,
    /// Replayed commit's entry; `None` when that side deleted the file.
    pub incoming: Option<SideMarker>,
    /// Target branch entry; `None` when that side deleted the file.
    pub base: Option<SideMarker>,
    pub ancestor: Option<SideMarker>,
}

impl ConflictedFile {
    pub fn shape(&self) -> ConflictShape {
        match (&self.base, &self.incoming) {
            (Some(_), Some(_)) if self.ancestor.is_none() => ConflictShape::BothAdded,
            (Some(_), Some(_)) => ConflictShape::Content,
            (Some(_), None) => ConflictShape::DeletedByIncoming,
            (None, Some(_)) => ConflictShape::DeletedByBase,
            (None, None) => ConflictShape::BothDeleted,
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Pure classifier for status snapshots.
#[derive(Debug, Clone)]
pub struct ConflictClassifier {
    large_file_threshold: u64,
}

impl ConflictClassifier {
    /// `large_file_threshold` in bytes; a side strictly above it is "large".
    pub fn new(large_file_threshold: u64) -> Self {
        Self {
            large_file_threshold,
        }
    }

    /// Conflicted paths of `snapshot`, sorted by path.
    pub fn classify(&self, snapshot: &StatusSnapshot) -> Vec<ConflictedFile> {
        let mut files: Vec<ConflictedFile> = snapshot
            .entries
            .iter()
            .filter_map(|entry| {
                if entry.markers.is_empty() {
                    debug!(
                        path = %entry.path,
                        code = %entry.code,
                        "unmerged without conflict markers, ignoring"
                    );
                    return None;
                }
                let markers = &entry.markers;
                Some(ConflictedFile {
                    path: entry.path.clone(),
                    kind: self.kind_of(&markers.incoming, &markers.base),
                    incoming: markers.incoming.clone(),
                    base: markers.base.clone(),
                    ancestor: markers.ancestor.clone(),
                })
            })
            .collect();

        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);

        info!(
            conflicted = files.len(),
            binary_or_large = files
                .iter()
                .filter(|f| f.kind == FileKind::BinaryOrLarge)
                .count(),
            "classified status snapshot"
        );
        files
    }

    fn kind_of(&self, incoming: &Option<SideMarker>, base: &Option<SideMarker>) -> FileKind {
        let heavy = [incoming, base]
            .into_iter()
            .flatten()
            .any(|m| m.binary || m.size > self.large_file_threshold);
        if heavy {
            FileKind::BinaryOrLarge
        } else {
            FileKind::Text
        }
    }
}
