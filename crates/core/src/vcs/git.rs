//! Working-copy operations for a real git checkout.
//!
//! Clone, index inspection, staging, commits and pushes go through `git2`.
//! The rebase sequencer (start / continue / skip / abort) is driven through
//! the `git` binary with every prompt and editor disabled.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use git2::{
    BranchType, CertificateCheckStatus, Cred, FetchOptions, IndexEntry, Oid, PushOptions,
    RemoteCallbacks, Repository, RepositoryState, Signature, StatusOptions,
};
use tracing::{debug, info, instrument, warn};

use super::{
    BlobId, CloneRequest, ConflictMarkers, RebaseResult, SideMarker, StatusEntry, StatusSnapshot,
    VersionControlClient,
};
use crate::errors::VcsError;
use crate::models::AuthorIdentity;

/// Environment applied to every `git` subprocess so nothing can prompt.
const NON_INTERACTIVE_ENV: &[(&str, &str)] = &[
    ("GIT_TERMINAL_PROMPT", "0"),
    ("GIT_EDITOR", "true"),
    ("GIT_SEQUENCE_EDITOR", "true"),
    ("GIT_MERGE_AUTOEDIT", "no"),
    ("GIT_ASKPASS", "true"),
];

/// Executable used for the rebase sequencer, resolved from `$PATH`.
const GIT_BINARY: &str = "git";

/// Output fragments git prints when a resolved step ends up empty.
const EMPTY_STEP_HINTS: &[&str] = &["nothing to commit", "No changes", "--allow-empty"];

/// Token credentials used for clone and push.
#[derive(Clone)]
struct Credentials {
    username: String,
    token: String,
}

/// [`VersionControlClient`] backed by git2 and the `git` binary.
#[derive(Clone)]
pub struct GitClient {
    credentials: Option<Credentials>,
    ssl_verify: bool,
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitClient")
            .field("authenticated", &self.credentials.is_some())
            .field("ssl_verify", &self.ssl_verify)
            .finish()
    }
}

impl GitClient {
    /// Anonymous client with TLS verification on, using `git` from `$PATH`.
    pub fn new() -> Self {
        Self {
            credentials: None,
            ssl_verify: true,
        }
    }

    /// Authenticate clone and push with a token (GitLab uses `oauth2`).
    pub fn with_token(mut self, username: impl Into<String>, token: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            token: token.into(),
        });
        self
    }

    /// Accept any server certificate when `verify` is false.
    pub fn with_ssl_verify(mut self, verify: bool) -> Self {
        self.ssl_verify = verify;
        self
    }

    fn open(wc: &Path) -> Result<Repository, VcsError> {
        Repository::open(wc).map_err(|_| VcsError::RepositoryNotFound(wc.display().to_string()))
    }

    fn remote_callbacks<'a>(&self) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(creds) = self.credentials.clone() {
            callbacks.credentials(move |_url, _username, _allowed| {
                Cred::userpass_plaintext(&creds.username, &creds.token)
            });
        }
        if !self.ssl_verify {
            callbacks.certificate_check(|_cert, host| {
                debug!(host, "skipping certificate verification");
                Ok(CertificateCheckStatus::CertificateOk)
            });
        }
        callbacks
    }

    fn is_rebasing(repo: &Repository) -> bool {
        matches!(
            repo.state(),
            RepositoryState::Rebase
                | RepositoryState::RebaseInteractive
                | RepositoryState::RebaseMerge
                | RepositoryState::ApplyMailboxOrRebase
        )
    }

    fn side_marker(repo: &Repository, entry: &IndexEntry) -> SideMarker {
        let (size, binary) = match repo.find_blob(entry.id) {
            Ok(blob) => (blob.size() as u64, blob.is_binary()),
            Err(e) => {
                warn!(oid = %entry.id, error = %e, "conflict stage blob is unreadable");
                (u64::from(entry.file_size), false)
            }
        };
        SideMarker {
            blob: BlobId(entry.id.to_string()),
            size,
            mode: entry.mode,
            binary,
        }
    }

    /// Blocking clone of `request.branch` into `dest`, then set the
    /// committer identity in the new repository's config.
    fn clone_blocking(
        &self,
        request: &CloneRequest,
        dest: &Path,
        timeout: Duration,
        abandoned: &AtomicBool,
    ) -> Result<(), VcsError> {
        let deadline = Instant::now() + timeout;
        let timed_out = Cell::new(false);

        let mut callbacks = self.remote_callbacks();
        callbacks.transfer_progress(|progress| {
            if abandoned.load(Ordering::SeqCst) || Instant::now() >= deadline {
                timed_out.set(true);
                return false;
            }
            debug!(
                received = progress.received_objects(),
                total = progress.total_objects(),
                "clone progress"
            );
            true
        });

        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(callbacks);
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_opts);
        builder.branch(&request.branch);

        let repo = match builder.clone(&request.url, dest) {
            Ok(repo) => repo,
            Err(e) if timed_out.get() || Instant::now() >= deadline => {
                warn!(error = %e, "clone exceeded its timeout");
                return Err(VcsError::CloneTimeout {
                    url: request.url.clone(),
                    secs: timeout.as_secs(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        // Commits created by `rebase --continue` take the committer from config.
        let mut config = repo.config()?;
        config.set_str("user.name", &request.identity.name)?;
        config.set_str("user.email", &request.identity.email)?;

        info!(identity = %request.identity, "clone completed");
        Ok(())
    }

    /// Run `git` in `wc` without failing on a non-zero exit status.
    fn run_git(&self, wc: &Path, args: &[&str]) -> Result<Output, VcsError> {
        debug!(?args, "running git");
        let mut cmd = Command::new(GIT_BINARY);
        cmd.current_dir(wc)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in NON_INTERACTIVE_ENV {
            cmd.env(key, value);
        }
        cmd.output().map_err(VcsError::IoError)
    }

    /// Map a finished sequencer command onto a [`RebaseResult`].
    fn rebase_result(&self, wc: &Path, output: &Output) -> Result<RebaseResult, VcsError> {
        let repo = Self::open(wc)?;
        let rebasing = Self::is_rebasing(&repo);

        if output.status.success() {
            return Ok(if rebasing {
                RebaseResult::Conflicted
            } else {
                RebaseResult::Clean
            });
        }

        if rebasing && repo.index()?.has_conflicts() {
            return Ok(RebaseResult::Conflicted);
        }

        let detail = combined_output(output);
        warn!(%detail, rebasing, "rebase step failed without conflicts");
        Ok(RebaseResult::Failed(detail))
    }
}

impl VersionControlClient for GitClient {
    /// Clone on a worker thread and give up once `timeout` elapses.
    ///
    /// libgit2 only reports progress once objects arrive, so a server that
    /// accepts the connection and never answers would block a direct clone
    /// forever. An abandoned worker stops at its next progress callback and
    /// removes whatever it cloned.
    #[instrument(skip(self, request), fields(url = %request.url, branch = %request.branch, dest = %dest.display()))]
    fn clone_branch(
        &self,
        request: &CloneRequest,
        dest: &Path,
        timeout: Duration,
    ) -> Result<(), VcsError> {
        info!("cloning repository");
        let abandoned = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let worker = {
            let client = self.clone();
            let request = request.clone();
            let dest = dest.to_path_buf();
            let abandoned = Arc::clone(&abandoned);
            std::thread::Builder::new()
                .name("git-clone".into())
                .spawn(move || {
                    let result = client.clone_blocking(&request, &dest, timeout, &abandoned);
                    if abandoned.load(Ordering::SeqCst) {
                        let _ = std::fs::remove_dir_all(&dest);
                    }
                    let _ = tx.send(result);
                })?
        };

        match rx.recv_timeout(timeout) {
            Ok(result) => {
                let _ = worker.join();
                result
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::SeqCst);
                warn!(secs = timeout.as_secs(), "clone exceeded its timeout");
                Err(VcsError::CloneTimeout {
                    url: request.url.clone(),
                    secs: timeout.as_secs(),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(VcsError::IoError(
                std::io::Error::other("clone worker exited without a result"),
            )),
        }
    }

    fn status(&self, wc: &Path) -> Result<StatusSnapshot, VcsError> {
        let repo = Self::open(wc)?;
        let rebase_in_progress = Self::is_rebasing(&repo);
        let index = repo.index()?;

        let mut by_path: BTreeMap<String, ConflictMarkers> = BTreeMap::new();
        if index.has_conflicts() {
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let path = [&conflict.our, &conflict.their, &conflict.ancestor]
                    .into_iter()
                    .flatten()
                    .next()
                    .map(|e| String::from_utf8_lossy(&e.path).into_owned());
                let Some(path) = path else { continue };
                by_path.insert(
                    path,
                    ConflictMarkers {
                        ancestor: conflict.ancestor.as_ref().map(|e| Self::side_marker(&repo, e)),
                        base: conflict.our.as_ref().map(|e| Self::side_marker(&repo, e)),
                        incoming: conflict.their.as_ref().map(|e| Self::side_marker(&repo, e)),
                    },
                );
            }
        }

        let mut opts = StatusOptions::new();
        opts.include_untracked(false).include_ignored(false);
        for entry in repo.statuses(Some(&mut opts))?.iter() {
            if entry.status().is_conflicted() {
                if let Some(path) = entry.path() {
                    by_path.entry(path.to_string()).or_default();
                }
            }
        }

        let entries = by_path
            .into_iter()
            .map(|(path, markers)| StatusEntry {
                code: if markers.is_empty() {
                    "UU".to_string()
                } else {
                    markers.porcelain_code().to_string()
                },
                path,
                markers,
            })
            .collect::<Vec<_>>();

        debug!(rebase_in_progress, unmerged = entries.len(), "status collected");
        Ok(StatusSnapshot {
            rebase_in_progress,
            entries,
        })
    }

    #[instrument(skip(self), fields(wc = %wc.display()))]
    fn rebase_start(&self, wc: &Path, target_ref: &str) -> Result<RebaseResult, VcsError> {
        let repo = Self::open(wc)?;
        repo.revparse_single(target_ref)
            .map_err(|_| VcsError::RefNotFound(target_ref.to_string()))?;
        drop(repo);

        info!("starting rebase");
        let output = self.run_git(wc, &["rebase", target_ref])?;
        self.rebase_result(wc, &output)
    }

    #[instrument(skip(self), fields(wc = %wc.display()))]
    fn rebase_continue(&self, wc: &Path) -> Result<RebaseResult, VcsError> {
        let output = self.run_git(wc, &["rebase", "--continue"])?;
        if !output.status.success() {
            let repo = Self::open(wc)?;
            let text = combined_output(&output);
            if Self::is_rebasing(&repo)
                && !repo.index()?.has_conflicts()
                && EMPTY_STEP_HINTS.iter().any(|hint| text.contains(hint))
            {
                info!("resolved step is empty, skipping it");
                let skipped = self.run_git(wc, &["rebase", "--skip"])?;
                return self.rebase_result(wc, &skipped);
            }
        }
        self.rebase_result(wc, &output)
    }

    #[instrument(skip(self), fields(wc = %wc.display()))]
    fn rebase_abort(&self, wc: &Path) -> Result<(), VcsError> {
        if !Self::is_rebasing(&Self::open(wc)?) {
            debug!("no rebase in progress, nothing to abort");
            return Ok(());
        }
        let output = self.run_git(wc, &["rebase", "--abort"])?;
        if !output.status.success() {
            return Err(VcsError::CommandFailed {
                command: "rebase --abort".into(),
                exit_code: output.status.code().unwrap_or(-1),
                stderr: combined_output(&output),
            });
        }
        info!("rebase aborted");
        Ok(())
    }

    fn read_blob(&self, wc: &Path, blob: &BlobId) -> Result<Vec<u8>, VcsError> {
        let repo = Self::open(wc)?;
        let oid = Oid::from_str(&blob.0)?;
        let blob = repo.find_blob(oid)?;
        Ok(blob.content().to_vec())
    }

    fn stage(&self, wc: &Path, path: &str) -> Result<(), VcsError> {
        let repo = Self::open(wc)?;
        let mut index = repo.index()?;
        let rel = Path::new(path);
        if wc.join(rel).symlink_metadata().is_ok() {
            index.add_path(rel)?;
            debug!(path, "staged file");
        } else {
            index.remove_path(rel)?;
            debug!(path, "staged deletion");
        }
        index.write()?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(wc = %wc.display(), author = %author))]
    fn commit(
        &self,
        wc: &Path,
        author: &AuthorIdentity,
        message: &str,
    ) -> Result<Option<String>, VcsError> {
        let repo = Self::open(wc)?;
        let mut index = repo.index()?;
        if index.has_conflicts() {
            return Err(VcsError::UnresolvedIndex);
        }

        let tree_oid = index.write_tree()?;
        let head = repo.head()?.peel_to_commit()?;
        if head.tree_id() == tree_oid {
            debug!("nothing staged, no commit needed");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_oid)?;
        let signature = Signature::now(&author.name, &author.email)?;
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &[&head])?;
        info!(sha = %oid, "created commit");
        Ok(Some(oid.to_string()))
    }

    #[instrument(skip(self), fields(wc = %wc.display()))]
    fn force_publish(&self, wc: &Path, branch: &str) -> Result<(), VcsError> {
        let repo = Self::open(wc)?;
        repo.find_branch(branch, BranchType::Local)
            .map_err(|_| VcsError::RefNotFound(branch.to_string()))?;
        let mut remote = repo.find_remote("origin")?;

        let rejection = RefCell::new(None::<String>);
        let mut callbacks = self.remote_callbacks();
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                *rejection.borrow_mut() = Some(msg.to_string());
            }
            Ok(())
        });

        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);
        let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
        warn!(branch, "force-pushing: remote history for this branch will be overwritten");
        remote.push(&[refspec.as_str()], Some(&mut push_opts))?;
        drop(push_opts);

        if let Some(detail) = rejection.into_inner() {
            return Err(VcsError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }
        info!("force-push completed");
        Ok(())
    }
}

fn combined_output(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    format!("{}\n{}", stderr.trim(), stdout.trim())
        .trim()
        .to_string()
}
