//! Per-round conflict handling.
//!
//! 1. **Classification** -- which paths the current rebase step stopped on.
//! 2. **Resolution** -- writing the selected side of each path.
//! 3. **Review** -- flagging resolved paths that deserve a human look.

pub mod classifier;
pub mod resolver;
pub mod review;

pub use classifier::{ConflictClassifier, ConflictShape, ConflictedFile, FileKind};
pub use resolver::{FileResolver, Resolution};
pub use review::{ReviewFlag, ReviewPolicy};
