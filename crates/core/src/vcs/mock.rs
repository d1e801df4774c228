//! Scripted in-memory [`VersionControlClient`] for engine tests.
//!
//! Each scripted round is the set of conflicts the rebase stops on. The
//! first round is produced by `rebase_start`, every later one by
//! `rebase_continue`; once the script runs out the rebase reports clean.
//! All calls are recorded in order for assertions.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use super::{
    BlobId, CloneRequest, ConflictMarkers, RebaseResult, SideMarker, StatusEntry, StatusSnapshot,
    VersionControlClient,
};
use crate::cancel::CancellationToken;
use crate::errors::VcsError;
use crate::models::AuthorIdentity;

/// How `clone_branch` behaves.
#[derive(Debug, Clone)]
pub(crate) enum CloneBehavior {
    Ok,
    Timeout,
    Fail(String),
}

/// One conflicted file in a scripted round.
#[derive(Debug, Clone)]
pub(crate) struct MockFile {
    pub path: String,
    pub incoming: Option<Vec<u8>>,
    pub base: Option<Vec<u8>>,
    pub binary: bool,
    /// Blob ids are recorded but their content is missing.
    pub unreadable: bool,
}

impl MockFile {
    pub fn text(path: &str, incoming: &str, base: &str) -> Self {
        Self {
            path: path.into(),
            incoming: Some(incoming.as_bytes().to_vec()),
            base: Some(base.as_bytes().to_vec()),
            binary: false,
            unreadable: false,
        }
    }

    pub fn binary(path: &str, incoming: &[u8], base: &[u8]) -> Self {
        Self {
            path: path.into(),
            incoming: Some(incoming.to_vec()),
            base: Some(base.to_vec()),
            binary: true,
            unreadable: false,
        }
    }

    pub fn deleted_incoming(path: &str, base: &str) -> Self {
        Self {
            path: path.into(),
            incoming: None,
            base: Some(base.as_bytes().to_vec()),
            binary: false,
            unreadable: false,
        }
    }

    pub fn unreadable(path: &str) -> Self {
        Self {
            unreadable: true,
            ..Self::text(path, "lost", "lost")
        }
    }
}

#[derive(Default)]
struct MockState {
    clone: Option<CloneBehavior>,
    start_failure: Option<String>,
    rounds: VecDeque<BTreeMap<String, ConflictMarkers>>,
    conflicts: BTreeMap<String, ConflictMarkers>,
    rebasing: bool,
    continue_failures: HashMap<usize, String>,
    continues: usize,
    sticky: HashSet<String>,
    sticky_once: HashSet<String>,
    blobs: HashMap<String, Vec<u8>>,
    staged_any: bool,
    commit_failure: Option<String>,
    publish_failure: Option<String>,
    cancel_on: Option<(String, CancellationToken)>,
    calls: Vec<String>,
}

/// Scripted version-control double.
#[derive(Default)]
pub(crate) struct MockVcs {
    state: Mutex<MockState>,
}

impl MockVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a round that stops on `files`. An empty slice scripts a step
    /// that stops without any conflict.
    pub fn round(self, files: &[MockFile]) -> Self {
        {
            let mut st = self.state.lock().unwrap();
            let index = st.rounds.len();
            let mut conflicts = BTreeMap::new();
            for file in files {
                let mut marker = |side: &str, content: &Option<Vec<u8>>| {
                    content.as_ref().map(|bytes| {
                        let id = format!("{index}:{}:{side}", file.path);
                        if !file.unreadable {
                            st.blobs.insert(id.clone(), bytes.clone());
                        }
                        SideMarker {
                            blob: BlobId(id),
                            size: bytes.len() as u64,
                            mode: 0o100644,
                            binary: file.binary,
                        }
                    })
                };
                let incoming = marker("incoming", &file.incoming);
                let base = marker("base", &file.base);
                conflicts.insert(
                    file.path.clone(),
                    ConflictMarkers {
                        ancestor: None,
                        base,
                        incoming,
                    },
                );
            }
            st.rounds.push_back(conflicts);
        }
        self
    }

    pub fn clone_behavior(self, behavior: CloneBehavior) -> Self {
        self.state.lock().unwrap().clone = Some(behavior);
        self
    }

    pub fn fail_start(self, detail: &str) -> Self {
        self.state.lock().unwrap().start_failure = Some(detail.into());
        self
    }

    /// Make the `n`-th `rebase_continue` call (1-based) fail.
    pub fn fail_continue(self, n: usize, detail: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .continue_failures
            .insert(n, detail.into());
        self
    }

    /// Staging `path` never clears its conflict.
    pub fn sticky(self, path: &str) -> Self {
        self.state.lock().unwrap().sticky.insert(path.into());
        self
    }

    /// The first staging of `path` leaves its conflict in place; later
    /// attempts clear it.
    pub fn sticky_once(self, path: &str) -> Self {
        self.state.lock().unwrap().sticky_once.insert(path.into());
        self
    }

    pub fn fail_commit(self, detail: &str) -> Self {
        self.state.lock().unwrap().commit_failure = Some(detail.into());
        self
    }

    pub fn fail_publish(self, detail: &str) -> Self {
        self.state.lock().unwrap().publish_failure = Some(detail.into());
        self
    }

    /// Signal `token` as soon as a call starting with `call` is recorded.
    pub fn cancel_on(self, call: &str, token: CancellationToken) -> Self {
        self.state.lock().unwrap().cancel_on = Some((call.into(), token));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(prefix))
    }

    pub fn is_rebasing(&self) -> bool {
        self.state.lock().unwrap().rebasing
    }

    fn record(st: &mut MockState, call: String) {
        if let Some((ref trigger, ref token)) = st.cancel_on {
            if call.starts_with(trigger.as_str()) {
                token.cancel();
            }
        }
        st.calls.push(call);
    }

    fn advance(st: &mut MockState) -> RebaseResult {
        match st.rounds.pop_front() {
            Some(conflicts) => {
                st.rebasing = true;
                st.conflicts = conflicts;
                RebaseResult::Conflicted
            }
            None => {
                st.rebasing = false;
                st.conflicts.clear();
                RebaseResult::Clean
            }
        }
    }
}

impl VersionControlClient for MockVcs {
    fn clone_branch(
        &self,
        request: &CloneRequest,
        dest: &Path,
        timeout: Duration,
    ) -> Result<(), VcsError> {
        let mut st = self.state.lock().unwrap();
        Self::record(&mut st, format!("clone:{}", request.branch));
        std::fs::create_dir_all(dest)?;
        match st.clone.clone().unwrap_or(CloneBehavior::Ok) {
            CloneBehavior::Ok => Ok(()),
            CloneBehavior::Timeout => Err(VcsError::CloneTimeout {
                url: request.url.clone(),
                secs: timeout.as_secs(),
            }),
            CloneBehavior::Fail(detail) => Err(VcsError::CommandFailed {
                command: "clone".into(),
                exit_code: 128,
                stderr: detail,
            }),
        }
    }

    fn status(&self, _wc: &Path) -> Result<StatusSnapshot, VcsError> {
        let mut st = self.state.lock().unwrap();
        Self::record(&mut st, "status".into());
        Ok(StatusSnapshot {
            rebase_in_progress: st.rebasing,
            entries: st
                .conflicts
                .iter()
                .map(|(path, markers)| StatusEntry {
                    path: path.clone(),
                    code: markers.porcelain_code().into(),
                    markers: markers.clone(),
                })
                .collect(),
        })
    }

    fn rebase_start(&self, _wc: &Path, target_ref: &str) -> Result<RebaseResult, VcsError> {
        let mut st = self.state.lock().unwrap();
        Self::record(&mut st, format!("rebase_start:{target_ref}"));
        if let Some(detail) = st.start_failure.clone() {
            return Ok(RebaseResult::Failed(detail));
        }
        Ok(Self::advance(&mut st))
    }

    fn rebase_continue(&self, _wc: &Path) -> Result<RebaseResult, VcsError> {
        let mut st = self.state.lock().unwrap();
        Self::record(&mut st, "rebase_continue".into());
        st.continues += 1;
        let n = st.continues;
        if let Some(detail) = st.continue_failures.remove(&n) {
            return Ok(RebaseResult::Failed(detail));
        }
        if !st.conflicts.is_empty() {
            return Ok(RebaseResult::Failed("unresolved conflicts remain".into()));
        }
        Ok(Self::advance(&mut st))
    }

    fn rebase_abort(&self, _wc: &Path) -> Result<(), VcsError> {
        let mut st = self.state.lock().unwrap();
        Self::record(&mut st, "rebase_abort".into());
        st.rebasing = false;
        st.conflicts.clear();
        st.rounds.clear();
        Ok(())
    }

    fn read_blob(&self, _wc: &Path, blob: &BlobId) -> Result<Vec<u8>, VcsError> {
        let mut st = self.state.lock().unwrap();
        Self::record(&mut st, format!("read_blob:{blob}"));
        st.blobs
            .get(&blob.0)
            .cloned()
            .ok_or_else(|| VcsError::RefNotFound(blob.0.clone()))
    }

    fn stage(&self, _wc: &Path, path: &str) -> Result<(), VcsError> {
        let mut st = self.state.lock().unwrap();
        Self::record(&mut st, format!("stage:{path}"));
        let stuck = st.sticky.contains(path) || st.sticky_once.remove(path);
        if !stuck {
            st.conflicts.remove(path);
        }
        st.staged_any = true;
        Ok(())
    }

    fn commit(
        &self,
        _wc: &Path,
        author: &AuthorIdentity,
        _message: &str,
    ) -> Result<Option<String>, VcsError> {
        let mut st = self.state.lock().unwrap();
        Self::record(&mut st, format!("commit:{author}"));
        if let Some(detail) = st.commit_failure.clone() {
            return Err(VcsError::CommandFailed {
                command: "commit".into(),
                exit_code: 1,
                stderr: detail,
            });
        }
        Ok(st.staged_any.then(|| "0123abcd".to_string()))
    }

    fn force_publish(&self, _wc: &Path, branch: &str) -> Result<(), VcsError> {
        let mut st = self.state.lock().unwrap();
        Self::record(&mut st, format!("force_publish:{branch}"));
        match st.publish_failure.clone() {
            Some(detail) => Err(VcsError::PushRejected {
                branch: branch.into(),
                detail,
            }),
            None => Ok(()),
        }
    }
}
