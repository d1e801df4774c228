//! Whole-file conflict resolution.
//!
//! [`FileResolver`] picks one side of a conflicted path according to the
//! run's [`ResolutionStrategy`] and writes it into the working copy. It never
//! stages; staging and its verification belong to the engine.

use std::io::ErrorKind;
use std::path::{Component, Path};

use tracing::{debug, info};

use super::classifier::ConflictedFile;
use crate::errors::ResolveError;
use crate::models::{ResolutionStrategy, Side};
use crate::vcs::{SideMarker, VersionControlClient};

const MODE_EXECUTABLE: u32 = 0o100755;
const MODE_SYMLINK: u32 = 0o120000;

/// What the resolver did to the working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The selected side's bytes were written.
    Written { bytes: u64 },
    /// The selected side deleted the file, so it was removed.
    Deleted,
}

/// Stateless side-selection operations.
pub struct FileResolver;

impl FileResolver {
    /// Apply `strategy` to `file` inside the working copy at `wc`.
    ///
    /// An absent marker on the selected side is a deletion on that side and
    /// removes the file. Content is copied byte for byte whatever its kind.
    pub fn resolve<V: VersionControlClient + ?Sized>(
        vcs: &V,
        wc: &Path,
        file: &ConflictedFile,
        strategy: ResolutionStrategy,
    ) -> Result<Resolution, ResolveError> {
        let rel = checked_relative(&file.path)?;
        let target = wc.join(rel);
        let side = strategy.side();
        let marker = match side {
            Side::Incoming => file.incoming.as_ref(),
            Side::Base => file.base.as_ref(),
        };

        let Some(marker) = marker else {
            remove_if_present(&target).map_err(|source| ResolveError::WriteFailed {
                path: file.path.clone(),
                source,
            })?;
            info!(path = %file.path, %side, "selected side deleted the file, removed");
            return Ok(Resolution::Deleted);
        };

        let content =
            vcs.read_blob(wc, &marker.blob)
                .map_err(|e| ResolveError::UndecodableSide {
                    path: file.path.clone(),
                    side: side.to_string(),
                    detail: e.to_string(),
                })?;

        write_side(&target, &content, marker).map_err(|source| ResolveError::WriteFailed {
            path: file.path.clone(),
            source,
        })?;

        debug!(path = %file.path, %side, bytes = content.len(), "wrote selected side");
        Ok(Resolution::Written {
            bytes: content.len() as u64,
        })
    }
}

/// Reject paths that would resolve outside the working copy.
fn checked_relative(path: &str) -> Result<&Path, ResolveError> {
    let rel = Path::new(path);
    let escapes = path.is_empty()
        || rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
    if escapes {
        return Err(ResolveError::InvalidPath(path.to_string()));
    }
    Ok(rel)
}

fn remove_if_present(target: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(target) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn write_side(target: &Path, content: &[u8], marker: &SideMarker) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        if marker.mode == MODE_SYMLINK {
            remove_if_present(target)?;
            let link = String::from_utf8_lossy(content).into_owned();
            return std::os::unix::fs::symlink(link, target);
        }
    }

    // A symlink left by the other side must not be written through.
    if target
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
    {
        std::fs::remove_file(target)?;
    }
    std::fs::write(target, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if marker.mode == MODE_EXECUTABLE {
            0o755
        } else {
            0o644
        };
        std::fs::set_permissions(target, std::fs::Permissions::from_mode(mode))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::classifier::{ConflictClassifier, FileKind};
    use crate::vcs::mock::{MockFile, MockVcs};
    use crate::vcs::VersionControlClient;

    /// Start the scripted rebase and return the classified first round.
    fn first_round(vcs: &MockVcs, wc: &Path) -> Vec<ConflictedFile> {
        vcs.rebase_start(wc, "origin/main").unwrap();
        ConflictClassifier::new(1024).classify(&vcs.status(wc).unwrap())
    }

    #[test]
    fn test_keep_incoming_writes_incoming_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = MockVcs::new().round(&[MockFile::text(
            "cfg/schema.yaml",
            "version: incoming\n",
            "version: base\n",
        )]);
        let files = first_round(&vcs, dir.path());

        let res = FileResolver::resolve(
            &vcs,
            dir.path(),
            &files[0],
            ResolutionStrategy::KeepIncoming,
        )
        .unwrap();
        assert_eq!(res, Resolution::Written { bytes: 18 });
        assert_eq!(
            std::fs::read(dir.path().join("cfg/schema.yaml")).unwrap(),
            b"version: incoming\n"
        );
    }

    #[test]
    fn test_keep_base_writes_base_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("values.yaml"), "<<<<<<< conflict").unwrap();
        let vcs = MockVcs::new().round(&[MockFile::text("values.yaml", "new", "old")]);
        let files = first_round(&vcs, dir.path());

        FileResolver::resolve(&vcs, dir.path(), &files[0], ResolutionStrategy::KeepBase)
            .unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("values.yaml")).unwrap(),
            b"old"
        );
    }

    #[test]
    fn test_binary_side_copied_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = [0x89, b'P', b'N', b'G', 0x00, 0xff, 0x10];
        let vcs = MockVcs::new().round(&[MockFile::binary("logo.png", &incoming, &[0x00])]);
        let files = first_round(&vcs, dir.path());
        assert_eq!(files[0].kind, FileKind::BinaryOrLarge);

        FileResolver::resolve(
            &vcs,
            dir.path(),
            &files[0],
            ResolutionStrategy::KeepIncoming,
        )
        .unwrap();
        assert_eq!(std::fs::read(dir.path().join("logo.png")).unwrap(), incoming);
    }

    #[test]
    fn test_deletion_on_selected_side_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.yaml"), "base edit").unwrap();
        let vcs = MockVcs::new().round(&[MockFile::deleted_incoming("old.yaml", "base edit")]);
        let files = first_round(&vcs, dir.path());

        let res = FileResolver::resolve(
            &vcs,
            dir.path(),
            &files[0],
            ResolutionStrategy::KeepIncoming,
        )
        .unwrap();
        assert_eq!(res, Resolution::Deleted);
        assert!(!dir.path().join("old.yaml").exists());

        // Base kept the file: it is written back.
        let res =
            FileResolver::resolve(&vcs, dir.path(), &files[0], ResolutionStrategy::KeepBase)
                .unwrap();
        assert_eq!(res, Resolution::Written { bytes: 9 });
    }

    #[test]
    fn test_unreadable_side_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = MockVcs::new().round(&[MockFile::unreadable("broken.yaml")]);
        let files = first_round(&vcs, dir.path());

        let err = FileResolver::resolve(
            &vcs,
            dir.path(),
            &files[0],
            ResolutionStrategy::KeepIncoming,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ResolveError::UndecodableSide { ref path, ref side, .. }
                if path == "broken.yaml" && side == "incoming"
        ));
    }

    #[test]
    fn test_escaping_paths_rejected() {
        assert!(checked_relative("../outside.yaml").is_err());
        assert!(checked_relative("/etc/passwd").is_err());
        assert!(checked_relative("a/../../b").is_err());
        assert!(checked_relative("").is_err());
        assert!(checked_relative("a/b/c.yaml").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_mode_restored() {
        use crate::vcs::{BlobId, SideMarker};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deploy.sh");
        let marker = SideMarker {
            blob: BlobId("x".into()),
            size: 9,
            mode: MODE_EXECUTABLE,
            binary: false,
        };
        write_side(&target, b"#!/bin/sh", &marker).unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
