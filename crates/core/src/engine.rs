//! Multi-round rebase conflict resolution engine.
//!
//! One run is strictly sequential:
//!
//! `clone → rebase start → round 1 … round N → commit → force-publish`
//!
//! Each round inspects the stopped rebase step, resolves every conflicted
//! path with the run's strategy, stages and verifies each path, then continues
//! the rebase. The round budget (`max_rounds`) is the only bound on rebases
//! that never converge. Cancellation is polled at the top of each round and
//! before each blocking call; a cancelled run always aborts the rebase first.
//! The working copy is removed on every terminal outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::conflict::{
    ConflictClassifier, ConflictShape, FileKind, FileResolver, Resolution, ReviewFlag,
    ReviewPolicy,
};
use crate::errors::{RunError, VcsError};
use crate::models::{AuthorIdentity, ResolutionStrategy, Severity};
use crate::progress::ProgressSink;
use crate::report::RunReport;
use crate::vcs::{CloneRequest, RebaseResult, VersionControlClient};

// ---------------------------------------------------------------------------
// Configuration & request
// ---------------------------------------------------------------------------

/// Immutable per-run engine settings, built once from the app config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub strategy: ResolutionStrategy,
    pub max_rounds: u32,
    pub clone_timeout: Duration,
    /// Sides above this many bytes are classified as large.
    pub large_file_threshold: u64,
    pub review_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::KeepIncoming,
            max_rounds: 10,
            clone_timeout: Duration::from_secs(60),
            large_file_threshold: 1024 * 1024,
            review_patterns: Vec::new(),
        }
    }
}

/// Everything one run needs besides the engine configuration.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Source of the proposed change branch.
    pub clone: CloneRequest,
    /// Directory exclusively owned by this run; removed when it ends.
    pub working_copy: PathBuf,
    /// Ref to rebase onto, e.g. `origin/main`.
    pub target_ref: String,
    /// Remote branch overwritten by the force-publish.
    pub publish_ref: String,
    /// Author of the finalizing commit.
    pub author: AuthorIdentity,
    pub commit_message: String,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Verdict of a single round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Resolved; the rebase stopped again on a later step.
    Continuing,
    /// The rebase completed.
    Clean,
    Failed,
}

/// How one path was settled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedFile {
    pub path: String,
    pub kind: FileKind,
    pub shape: ConflictShape,
    /// `true` when the selected side deleted the path.
    pub deleted: bool,
    pub bytes: u64,
}

/// One rebase step as seen by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundState {
    pub round_number: u32,
    pub conflicted_paths: Vec<String>,
    pub resolved_paths: Vec<String>,
    pub files: Vec<ResolvedFile>,
    pub outcome: RoundOutcome,
}

impl RoundState {
    fn new(round_number: u32) -> Self {
        Self {
            round_number,
            conflicted_paths: Vec::new(),
            resolved_paths: Vec::new(),
            files: Vec::new(),
            outcome: RoundOutcome::Failed,
        }
    }
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// Rebased, committed and published.
    Success,
    /// The budget ran out with the rebase still stopping on conflicts.
    ConflictLimitExceeded { rounds: u32 },
    /// Cancellation was observed after `round` rounds had started.
    Cancelled { round: u32 },
    Error(RunError),
}

impl TerminalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Short machine-readable kind, used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ConflictLimitExceeded { .. } => "conflict_limit_exceeded",
            Self::Cancelled { .. } => "cancelled",
            Self::Error(e) => e.kind(),
        }
    }

    /// The one user-facing message for this outcome.
    pub fn message(&self) -> String {
        match self {
            Self::Success => "rebase completed, conflicts resolved and branch published".into(),
            Self::ConflictLimitExceeded { rounds } => format!(
                "conflicts persisted through {rounds} round(s), the configured maximum; \
                 the rebase was aborted and manual intervention is required"
            ),
            Self::Cancelled { round: 0 } => {
                "run cancelled before the first round; nothing was published".into()
            }
            Self::Cancelled { round } => format!(
                "run cancelled during round {round}; the rebase was aborted and nothing was published"
            ),
            Self::Error(e) => e.to_string(),
        }
    }

    /// The failing path, if the outcome names one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Error(e) => e.path(),
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Mutable state of one run. Lives only for the duration of [`ConflictResolutionEngine::run`].
#[derive(Debug, Clone)]
pub struct RunState {
    pub working_copy: PathBuf,
    pub current_round: u32,
    pub total_rounds_executed: u32,
    pub max_rounds: u32,
    pub cancelled: bool,
    /// A rebase was started and may need aborting.
    pub rebase_started: bool,
    pub rounds: Vec<RoundState>,
    pub warnings: Vec<String>,
    pub review_flags: Vec<ReviewFlag>,
    pub commit: Option<String>,
    pub published: bool,
    pub outcome: Option<TerminalOutcome>,
}

impl RunState {
    fn new(working_copy: PathBuf, max_rounds: u32) -> Self {
        Self {
            working_copy,
            current_round: 0,
            total_rounds_executed: 0,
            max_rounds,
            cancelled: false,
            rebase_started: false,
            rounds: Vec::new(),
            warnings: Vec::new(),
            review_flags: Vec::new(),
            commit: None,
            published: false,
            outcome: None,
        }
    }

    fn begin_round(&mut self, round: u32) {
        debug_assert_eq!(round, self.current_round + 1);
        self.current_round = round;
        self.total_rounds_executed += 1;
    }

    fn fold(&mut self, round: RoundState) {
        self.rounds.push(round);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives a rebase to completion through a [`VersionControlClient`].
pub struct ConflictResolutionEngine<V> {
    config: Arc<EngineConfig>,
    vcs: V,
    classifier: ConflictClassifier,
    review: ReviewPolicy,
}

impl<V: VersionControlClient> ConflictResolutionEngine<V> {
    pub fn new(config: Arc<EngineConfig>, vcs: V) -> Self {
        let classifier = ConflictClassifier::new(config.large_file_threshold);
        let review = ReviewPolicy::new(config.review_patterns.clone());
        Self {
            config,
            vcs,
            classifier,
            review,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Execute one run to a terminal outcome.
    ///
    /// Never panics on collaborator failures: every failure becomes the
    /// run's outcome. `sink.on_terminal` is called exactly once, after the
    /// working copy has been removed.
    #[instrument(skip_all, fields(
        branch = %request.clone.branch,
        target = %request.target_ref,
        strategy = %self.config.strategy,
    ))]
    pub fn run(
        &self,
        request: &RunRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started_at = Utc::now();
        let mut state = RunState::new(request.working_copy.clone(), self.config.max_rounds);

        info!(max_rounds = self.config.max_rounds, "resolution run starting");
        let outcome = self.drive(request, sink, cancel, &mut state);
        state.cancelled = matches!(outcome, TerminalOutcome::Cancelled { .. });
        state.outcome = Some(outcome.clone());

        self.remove_working_copy(&request.working_copy, sink);

        if outcome.is_success() {
            info!(rounds = state.total_rounds_executed, "run succeeded");
        } else {
            warn!(
                outcome = outcome.kind(),
                round = state.current_round,
                "run ended without success"
            );
        }
        sink.on_terminal(&outcome);

        RunReport::from_run(&self.config, request, state, started_at)
    }

    fn drive(
        &self,
        request: &RunRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> TerminalOutcome {
        let wc = request.working_copy.as_path();

        if cancel.is_signaled() {
            return self.cancel_run(wc, state, sink);
        }
        if let Err(e) = self.acquire(request, sink) {
            return self.fail(wc, state, e, sink);
        }

        if cancel.is_signaled() {
            return self.cancel_run(wc, state, sink);
        }
        sink.on_event(
            Severity::Info,
            &format!(
                "Rebasing {} onto {}",
                request.clone.branch, request.target_ref
            ),
        );
        state.rebase_started = true;
        match self.vcs.rebase_start(wc, &request.target_ref) {
            Ok(RebaseResult::Clean) => {
                sink.on_event(Severity::Info, "Rebase completed without conflicts");
                return self.finalize(request, state, sink, cancel);
            }
            Ok(RebaseResult::Conflicted) => {}
            Ok(RebaseResult::Failed(detail)) => {
                return self.fail(wc, state, RunError::RebaseFailure { round: 1, detail }, sink);
            }
            Err(e) => {
                let detail = e.to_string();
                return self.fail(wc, state, RunError::RebaseFailure { round: 1, detail }, sink);
            }
        }

        for round in 1..=self.config.max_rounds {
            if cancel.is_signaled() {
                return self.cancel_run(wc, state, sink);
            }

            state.begin_round(round);
            sink.on_round_start(round);
            let mut round_state = RoundState::new(round);

            if let Err(e) = self.resolve_round(wc, &mut round_state, state, sink, cancel) {
                state.fold(round_state);
                return match e {
                    RoundInterrupt::Cancelled => self.cancel_run(wc, state, sink),
                    RoundInterrupt::Failed(e) => self.fail(wc, state, e, sink),
                    RoundInterrupt::Finished => self.finalize(request, state, sink, cancel),
                };
            }

            if cancel.is_signaled() {
                state.fold(round_state);
                return self.cancel_run(wc, state, sink);
            }

            match self.vcs.rebase_continue(wc) {
                Ok(RebaseResult::Clean) => {
                    round_state.outcome = RoundOutcome::Clean;
                    state.fold(round_state);
                    sink.on_event(Severity::Info, "Rebase completed");
                    return self.finalize(request, state, sink, cancel);
                }
                Ok(RebaseResult::Conflicted) => {
                    round_state.outcome = RoundOutcome::Continuing;
                    state.fold(round_state);
                    debug!(round, "rebase stopped again");
                }
                Ok(RebaseResult::Failed(detail)) => {
                    state.fold(round_state);
                    return self.fail(wc, state, RunError::RebaseFailure { round, detail }, sink);
                }
                Err(e) => {
                    state.fold(round_state);
                    let detail = e.to_string();
                    return self.fail(wc, state, RunError::RebaseFailure { round, detail }, sink);
                }
            }
        }

        let rounds = self.config.max_rounds;
        self.abort_rebase(wc, state, sink);
        sink.on_event(
            Severity::Error,
            &format!("Conflicts still present after {rounds} round(s); manual intervention is required"),
        );
        TerminalOutcome::ConflictLimitExceeded { rounds }
    }

    /// Clone the source branch into the working copy.
    fn acquire(&self, request: &RunRequest, sink: &dyn ProgressSink) -> Result<(), RunError> {
        sink.on_event(
            Severity::Info,
            &format!(
                "Cloning {} (timeout {}s)",
                request.clone.branch,
                self.config.clone_timeout.as_secs()
            ),
        );
        self.vcs
            .clone_branch(
                &request.clone,
                &request.working_copy,
                self.config.clone_timeout,
            )
            .map_err(|e| match e {
                VcsError::CloneTimeout { secs, .. } => RunError::CloneTimeout {
                    secs,
                    detail: e.to_string(),
                },
                other => RunError::CloneFailure(other.to_string()),
            })
    }

    /// Resolve, stage and verify every conflicted path of the current step.
    ///
    /// `Ok` means the round is ready for rebase-continue.
    fn resolve_round(
        &self,
        wc: &Path,
        round_state: &mut RoundState,
        state: &mut RunState,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), RoundInterrupt> {
        let round = round_state.round_number;
        let snapshot = self.vcs.status(wc).map_err(|e| {
            RoundInterrupt::Failed(RunError::RebaseFailure {
                round,
                detail: e.to_string(),
            })
        })?;
        let files = self.classifier.classify(&snapshot);

        if files.is_empty() {
            if !snapshot.rebase_in_progress {
                round_state.outcome = RoundOutcome::Clean;
                return Err(RoundInterrupt::Finished);
            }
            sink.on_event(
                Severity::Warning,
                &format!("Round {round}: rebase stopped without conflicts, continuing"),
            );
            return Ok(());
        }

        round_state.conflicted_paths = files.iter().map(|f| f.path.clone()).collect();
        sink.on_event(
            Severity::Info,
            &format!("Round {round}: {} conflicted file(s)", files.len()),
        );

        for file in &files {
            if cancel.is_signaled() {
                return Err(RoundInterrupt::Cancelled);
            }

            if file.kind == FileKind::BinaryOrLarge {
                let msg = format!(
                    "{} is binary or large; resolving with {} at byte level",
                    file.path, self.config.strategy
                );
                warn!(path = %file.path, round, "binary or large conflicted file");
                sink.on_event(Severity::Warning, &msg);
                state.warnings.push(msg);
            }
            if let Some(flag) = self.review.check(&file.path, round) {
                sink.on_event(
                    Severity::Warning,
                    &format!("{} matches review pattern '{}'", flag.path, flag.pattern),
                );
                state.review_flags.push(flag);
            }

            let resolution = FileResolver::resolve(&self.vcs, wc, file, self.config.strategy)
                .map_err(|e| {
                    RoundInterrupt::Failed(RunError::UnresolvableConflict {
                        path: file.path.clone(),
                        round,
                        detail: e.to_string(),
                    })
                })?;

            self.stage_and_verify(wc, &file.path, round, cancel)?;

            let (deleted, bytes) = match resolution {
                Resolution::Written { bytes } => (false, bytes),
                Resolution::Deleted => (true, 0),
            };
            sink.on_event(
                Severity::Info,
                &format!(
                    "Resolved {} ({}, kept {})",
                    file.path,
                    if deleted { "deleted" } else { "written" },
                    self.config.strategy.side()
                ),
            );
            round_state.resolved_paths.push(file.path.clone());
            round_state.files.push(ResolvedFile {
                path: file.path.clone(),
                kind: file.kind,
                shape: file.shape(),
                deleted,
                bytes,
            });
        }

        info!(round, resolved = round_state.resolved_paths.len(), "round resolved");
        sink.on_round_resolved(round, &round_state.resolved_paths);
        Ok(())
    }

    /// Stage `path` and confirm it left the conflicted set; one retry.
    fn stage_and_verify(
        &self,
        wc: &Path,
        path: &str,
        round: u32,
        cancel: &CancellationToken,
    ) -> Result<(), RoundInterrupt> {
        for attempt in 1..=2u32 {
            if cancel.is_signaled() {
                return Err(RoundInterrupt::Cancelled);
            }
            if let Err(e) = self.vcs.stage(wc, path) {
                warn!(path, attempt, error = %e, "stage failed");
                continue;
            }
            if cancel.is_signaled() {
                return Err(RoundInterrupt::Cancelled);
            }
            match self.vcs.status(wc) {
                Ok(snapshot) => {
                    let still_conflicted = snapshot
                        .entries
                        .iter()
                        .any(|e| e.path == path && !e.markers.is_empty());
                    if !still_conflicted {
                        debug!(path, attempt, "staging verified");
                        return Ok(());
                    }
                    warn!(path, attempt, "path still conflicted after staging");
                }
                Err(e) => warn!(path, attempt, error = %e, "status failed during verification"),
            }
        }
        Err(RoundInterrupt::Failed(RunError::StageVerificationFailure {
            path: path.to_string(),
            round,
        }))
    }

    /// Commit leftovers with the preserved author, then force-publish.
    fn finalize(
        &self,
        request: &RunRequest,
        state: &mut RunState,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> TerminalOutcome {
        let wc = request.working_copy.as_path();
        let round = state.current_round;

        if cancel.is_signaled() {
            return self.cancel_run(wc, state, sink);
        }
        match self.vcs.status(wc) {
            Ok(snapshot)
                if snapshot.rebase_in_progress
                    || snapshot.entries.iter().any(|e| !e.markers.is_empty()) =>
            {
                let detail = "working copy still has a rebase or conflicts in progress".to_string();
                return self.fail(wc, state, RunError::CommitFailure { round, detail }, sink);
            }
            Ok(_) => {}
            Err(e) => {
                let detail = e.to_string();
                return self.fail(wc, state, RunError::CommitFailure { round, detail }, sink);
            }
        }

        if cancel.is_signaled() {
            return self.cancel_run(wc, state, sink);
        }
        match self
            .vcs
            .commit(wc, &request.author, &request.commit_message)
        {
            Ok(Some(sha)) => {
                sink.on_event(
                    Severity::Info,
                    &format!("Committed {sha} as {}", request.author),
                );
                state.commit = Some(sha);
            }
            Ok(None) => debug!("no leftover changes to commit"),
            Err(e) => {
                let detail = e.to_string();
                return self.fail(wc, state, RunError::CommitFailure { round, detail }, sink);
            }
        }

        if cancel.is_signaled() {
            return self.cancel_run(wc, state, sink);
        }

        sink.on_event(
            Severity::Warning,
            &format!(
                "Force-publishing {}: remote history of this branch will be overwritten",
                request.publish_ref
            ),
        );
        if let Err(e) = self.vcs.force_publish(wc, &request.publish_ref) {
            let err = RunError::PublishFailure {
                branch: request.publish_ref.clone(),
                round,
                detail: e.to_string(),
            };
            return self.fail(wc, state, err, sink);
        }
        state.published = true;
        sink.on_event(
            Severity::Info,
            &format!("Published {}", request.publish_ref),
        );
        TerminalOutcome::Success
    }

    fn cancel_run(
        &self,
        wc: &Path,
        state: &mut RunState,
        sink: &dyn ProgressSink,
    ) -> TerminalOutcome {
        info!(round = state.current_round, "cancellation observed");
        self.abort_rebase(wc, state, sink);
        sink.on_event(Severity::Warning, "Run cancelled");
        TerminalOutcome::Cancelled {
            round: state.current_round,
        }
    }

    fn fail(
        &self,
        wc: &Path,
        state: &mut RunState,
        err: RunError,
        sink: &dyn ProgressSink,
    ) -> TerminalOutcome {
        error!(kind = err.kind(), path = ?err.path(), round = err.round(), error = %err, "run failed");
        self.abort_rebase(wc, state, sink);
        sink.on_event(Severity::Error, &err.to_string());
        TerminalOutcome::Error(err)
    }

    fn abort_rebase(&self, wc: &Path, state: &mut RunState, sink: &dyn ProgressSink) {
        if !state.rebase_started {
            return;
        }
        state.rebase_started = false;
        match self.vcs.rebase_abort(wc) {
            Ok(()) => sink.on_event(Severity::Info, "Rebase aborted, branch restored"),
            Err(e) => {
                warn!(error = %e, "rebase abort failed");
                sink.on_event(Severity::Warning, &format!("Rebase abort failed: {e}"));
            }
        }
    }

    fn remove_working_copy(&self, wc: &Path, sink: &dyn ProgressSink) {
        if !wc.exists() {
            return;
        }
        match std::fs::remove_dir_all(wc) {
            Ok(()) => debug!(path = %wc.display(), "working copy removed"),
            Err(e) => {
                warn!(path = %wc.display(), error = %e, "failed to remove working copy");
                sink.on_event(
                    Severity::Warning,
                    &format!("Could not remove working copy {}: {e}", wc.display()),
                );
            }
        }
    }
}

/// Why a round stopped before rebase-continue.
enum RoundInterrupt {
    /// No conflicts and no rebase in progress.
    Finished,
    Cancelled,
    Failed(RunError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::recording::{Recorded, RecordingSink};
    use crate::vcs::mock::{CloneBehavior, MockFile, MockVcs};

    struct Harness {
        _dir: tempfile::TempDir,
        request: RunRequest,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let author = AuthorIdentity::new("Jane Dev", "jdev@gitlab.local");
        let request = RunRequest {
            clone: CloneRequest {
                url: "https://gitlab.example.com/netops/ndo-config.git".into(),
                branch: "feature/tenant".into(),
                identity: author.clone(),
            },
            working_copy: dir.path().join("wc"),
            target_ref: "origin/main".into(),
            publish_ref: "feature/tenant".into(),
            author,
            commit_message: "Resolve rebase conflicts".into(),
        };
        Harness { _dir: dir, request }
    }

    fn engine(vcs: MockVcs, max_rounds: u32) -> ConflictResolutionEngine<MockVcs> {
        let config = EngineConfig {
            max_rounds,
            large_file_threshold: 1024,
            review_patterns: vec!["**/*.tf".into()],
            ..EngineConfig::default()
        };
        ConflictResolutionEngine::new(Arc::new(config), vcs)
    }

    fn outcome(sink: &RecordingSink) -> TerminalOutcome {
        match sink.calls().last() {
            Some(Recorded::Terminal(o)) => o.clone(),
            other => panic!("last callback was not terminal: {other:?}"),
        }
    }

    #[test]
    fn test_single_conflict_then_clean() {
        let h = harness();
        let vcs = MockVcs::new().round(&[MockFile::text(
            "schema.yaml",
            "version: 2\n",
            "version: 1\n",
        )]);
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(
            sink.milestones(),
            vec![
                Recorded::RoundStart(1),
                Recorded::RoundResolved(1, vec!["schema.yaml".into()]),
                Recorded::Terminal(TerminalOutcome::Success),
            ]
        );
        assert!(report.is_success());
        assert_eq!(report.rounds_executed, 1);
        assert!(engine.vcs().called("force_publish:feature/tenant"));
        assert!(!h.request.working_copy.exists());
    }

    #[test]
    fn test_round_numbers_have_no_gaps() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("a.yaml", "a2", "a1")])
            .round(&[MockFile::text("b.yaml", "b2", "b1")])
            .round(&[MockFile::text("a.yaml", "a3", "a2")]);
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(sink.round_starts(), vec![1, 2, 3]);
        assert!(report.is_success());
        assert_eq!(report.rounds.len(), 3);
        assert_eq!(report.rounds[1].resolved_paths, vec!["b.yaml".to_string()]);
    }

    #[test]
    fn test_stage_retry_recovers() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("a.yaml", "a-in", "a-base")])
            .sticky_once("a.yaml");
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(outcome(&sink), TerminalOutcome::Success);
        let calls = engine.vcs().calls();
        assert_eq!(calls.iter().filter(|c| *c == "stage:a.yaml").count(), 2);
        assert!(engine.vcs().called("force_publish"));
        assert_eq!(report.resolved_count(), 1);
    }

    #[test]
    fn test_stage_verification_failure_names_path() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[
                MockFile::text("a.yaml", "a-in", "a-base"),
                MockFile::text("b.yaml", "b-in", "b-base"),
            ])
            .sticky("b.yaml");
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(
            outcome(&sink),
            TerminalOutcome::Error(RunError::StageVerificationFailure {
                path: "b.yaml".into(),
                round: 1,
            })
        );
        let calls = engine.vcs().calls();
        assert_eq!(calls.iter().filter(|c| *c == "stage:b.yaml").count(), 2);
        assert_eq!(calls.iter().filter(|c| *c == "stage:a.yaml").count(), 1);
        assert!(!engine.vcs().called("force_publish"));
        assert!(!engine.vcs().called("rebase_continue"));
        assert!(engine.vcs().called("rebase_abort"));
        assert!(!sink
            .milestones()
            .iter()
            .any(|c| matches!(c, Recorded::RoundResolved(..))));
    }

    #[test]
    fn test_conflict_limit_exceeded() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("values.yaml", "x", "y")])
            .round(&[MockFile::text("values.yaml", "x", "y")])
            .round(&[MockFile::text("values.yaml", "x", "y")]);
        let engine = engine(vcs, 2);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(
            outcome(&sink),
            TerminalOutcome::ConflictLimitExceeded { rounds: 2 }
        );
        assert!(outcome(&sink).message().contains("manual intervention"));
        assert_eq!(sink.round_starts(), vec![1, 2]);
        assert!(!engine.vcs().called("force_publish"));
        assert!(!engine.vcs().called("commit"));
        assert!(engine.vcs().called("rebase_abort"));
        assert!(!report.is_success());
    }

    #[test]
    fn test_clean_on_last_allowed_round() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("a.yaml", "1", "2")])
            .round(&[MockFile::text("a.yaml", "3", "4")]);
        let engine = engine(vcs, 2);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(outcome(&sink), TerminalOutcome::Success);
        assert_eq!(sink.round_starts(), vec![1, 2]);
    }

    #[test]
    fn test_cancel_before_start() {
        let h = harness();
        let engine = engine(MockVcs::new().round(&[MockFile::text("a", "1", "2")]), 10);
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        engine.run(&h.request, &sink, &cancel);

        assert_eq!(outcome(&sink), TerminalOutcome::Cancelled { round: 0 });
        assert!(engine.vcs().calls().is_empty());
    }

    #[test]
    fn test_cancel_before_round_one_aborts_rebase() {
        let h = harness();
        let cancel = CancellationToken::new();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("schema.yaml", "1", "2")])
            .cancel_on("rebase_start", cancel.clone());
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &cancel);

        assert_eq!(outcome(&sink), TerminalOutcome::Cancelled { round: 0 });
        assert!(sink.round_starts().is_empty());
        assert!(engine.vcs().called("rebase_abort"));
        assert!(!engine.vcs().is_rebasing());
        assert!(!engine.vcs().called("stage"));
    }

    #[test]
    fn test_cancel_mid_round() {
        let h = harness();
        let cancel = CancellationToken::new();
        let vcs = MockVcs::new()
            .round(&[
                MockFile::text("a.yaml", "1", "2"),
                MockFile::text("b.yaml", "1", "2"),
            ])
            .cancel_on("stage:a.yaml", cancel.clone());
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &cancel);

        assert_eq!(outcome(&sink), TerminalOutcome::Cancelled { round: 1 });
        assert!(!engine.vcs().called("stage:b.yaml"));
        assert!(!engine.vcs().called("rebase_continue"));
        assert!(engine.vcs().called("rebase_abort"));
        assert!(!engine.vcs().called("force_publish"));
    }

    #[test]
    fn test_cancel_after_read_skips_staging() {
        let h = harness();
        let cancel = CancellationToken::new();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("a.yaml", "1", "2")])
            .cancel_on("read_blob:0:a.yaml", cancel.clone());
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &cancel);

        assert_eq!(outcome(&sink), TerminalOutcome::Cancelled { round: 1 });
        assert!(engine.vcs().called("read_blob:0:a.yaml"));
        assert!(!engine.vcs().called("stage"));
        assert!(engine.vcs().called("rebase_abort"));
    }

    #[test]
    fn test_cancel_before_commit() {
        let h = harness();
        let cancel = CancellationToken::new();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("a.yaml", "1", "2")])
            .cancel_on("rebase_continue", cancel.clone());
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &cancel);

        assert_eq!(outcome(&sink), TerminalOutcome::Cancelled { round: 1 });
        let calls = engine.vcs().calls();
        let continue_at = calls.iter().position(|c| c == "rebase_continue").unwrap();
        assert!(!calls[continue_at..].iter().any(|c| c == "status"));
        assert!(!engine.vcs().called("commit"));
        assert!(!engine.vcs().called("force_publish"));
        assert!(!report.published);
    }

    #[test]
    fn test_clone_timeout_removes_working_copy() {
        let h = harness();
        let vcs = MockVcs::new().clone_behavior(CloneBehavior::Timeout);
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert!(matches!(
            outcome(&sink),
            TerminalOutcome::Error(RunError::CloneTimeout { secs: 60, .. })
        ));
        assert_eq!(report.outcome.kind, "clone_timeout");
        assert!(!h.request.working_copy.exists());
        assert!(!engine.vcs().called("rebase_start"));
        assert!(!engine.vcs().called("rebase_abort"));
    }

    #[test]
    fn test_clone_failure() {
        let h = harness();
        let vcs = MockVcs::new().clone_behavior(CloneBehavior::Fail("auth required".into()));
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &CancellationToken::new());

        match outcome(&sink) {
            TerminalOutcome::Error(RunError::CloneFailure(detail)) => {
                assert!(detail.contains("auth required"))
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_rebase_start_failure() {
        let h = harness();
        let vcs = MockVcs::new().fail_start("invalid upstream 'origin/main'");
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &CancellationToken::new());

        assert!(matches!(
            outcome(&sink),
            TerminalOutcome::Error(RunError::RebaseFailure { round: 1, .. })
        ));
    }

    #[test]
    fn test_continue_failure_reports_round() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("a.yaml", "1", "2")])
            .round(&[MockFile::text("b.yaml", "1", "2")])
            .fail_continue(2, "could not apply 3f2a1b");
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &CancellationToken::new());

        match outcome(&sink) {
            TerminalOutcome::Error(RunError::RebaseFailure { round, detail }) => {
                assert_eq!(round, 2);
                assert!(detail.contains("3f2a1b"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(engine.vcs().called("rebase_abort"));
    }

    #[test]
    fn test_unreadable_side_fails_run() {
        let h = harness();
        let vcs = MockVcs::new().round(&[
            MockFile::text("a.yaml", "1", "2"),
            MockFile::unreadable("broken.yaml"),
        ]);
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        let out = outcome(&sink);
        assert!(matches!(
            out,
            TerminalOutcome::Error(RunError::UnresolvableConflict { ref path, round: 1, .. })
                if path == "broken.yaml"
        ));
        assert_eq!(out.path(), Some("broken.yaml"));
        assert_eq!(report.outcome.path.as_deref(), Some("broken.yaml"));
        assert!(!engine.vcs().called("stage:broken.yaml"));
    }

    #[test]
    fn test_binary_file_warns_and_resolves() {
        let h = harness();
        let vcs = MockVcs::new().round(&[MockFile::binary("logo.png", &[0, 1, 2], &[3, 4])]);
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(outcome(&sink), TerminalOutcome::Success);
        assert!(sink.warnings().iter().any(|w| w.contains("logo.png")));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.rounds[0].files[0].kind, FileKind::BinaryOrLarge);
    }

    #[test]
    fn test_keep_base_reads_base_side() {
        let h = harness();
        let vcs = MockVcs::new().round(&[MockFile::text("values.yaml", "in", "base")]);
        let config = EngineConfig {
            strategy: ResolutionStrategy::KeepBase,
            ..EngineConfig::default()
        };
        let engine = ConflictResolutionEngine::new(Arc::new(config), vcs);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &CancellationToken::new());

        assert!(engine.vcs().called("read_blob:0:values.yaml:base"));
        assert!(!engine.vcs().called("read_blob:0:values.yaml:incoming"));
    }

    #[test]
    fn test_empty_step_consumes_round() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[])
            .round(&[MockFile::text("a.yaml", "1", "2")]);
        let engine = engine(vcs, 1);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(
            outcome(&sink),
            TerminalOutcome::ConflictLimitExceeded { rounds: 1 }
        );
        assert_eq!(sink.round_starts(), vec![1]);
    }

    #[test]
    fn test_clean_rebase_skips_rounds() {
        let h = harness();
        let engine = engine(MockVcs::new(), 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(
            sink.milestones(),
            vec![Recorded::Terminal(TerminalOutcome::Success)]
        );
        assert_eq!(report.rounds_executed, 0);
        assert!(report.commit.is_none());
        assert!(engine.vcs().called("force_publish"));
    }

    #[test]
    fn test_commit_uses_preserved_author() {
        let h = harness();
        let vcs = MockVcs::new().round(&[MockFile::text("a.yaml", "1", "2")]);
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert!(engine
            .vcs()
            .called("commit:Jane Dev <jdev@gitlab.local>"));
        assert_eq!(report.commit.as_deref(), Some("0123abcd"));
    }

    #[test]
    fn test_commit_failure() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("a.yaml", "1", "2")])
            .fail_commit("unable to write tree");
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &CancellationToken::new());

        assert!(matches!(
            outcome(&sink),
            TerminalOutcome::Error(RunError::CommitFailure { round: 1, .. })
        ));
        assert!(!engine.vcs().called("force_publish"));
    }

    #[test]
    fn test_publish_failure() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("a.yaml", "1", "2")])
            .fail_publish("pre-receive hook declined");
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert!(matches!(
            outcome(&sink),
            TerminalOutcome::Error(RunError::PublishFailure { ref branch, round: 1, .. })
                if branch == "feature/tenant"
        ));
        assert!(report.outcome.message.contains("round 1"));
        assert!(!report.published);
    }

    #[test]
    fn test_review_flags_recorded() {
        let h = harness();
        let vcs = MockVcs::new().round(&[
            MockFile::text("infra/main.tf", "1", "2"),
            MockFile::text("values.yaml", "1", "2"),
        ]);
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        let report = engine.run(&h.request, &sink, &CancellationToken::new());

        assert_eq!(report.review_flags.len(), 1);
        assert_eq!(report.review_flags[0].path, "infra/main.tf");
        assert_eq!(report.review_flags[0].round, 1);
    }

    #[test]
    fn test_terminal_reported_once() {
        let h = harness();
        let vcs = MockVcs::new()
            .round(&[MockFile::text("a.yaml", "1", "2")])
            .fail_publish("rejected");
        let engine = engine(vcs, 10);
        let sink = RecordingSink::default();

        engine.run(&h.request, &sink, &CancellationToken::new());

        let terminals = sink
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Recorded::Terminal(_)))
            .count();
        assert_eq!(terminals, 1);
    }
}
