//! Run reports.
//!
//! A [`RunReport`] is the durable record of one resolution run. The CLI
//! saves it as JSON next to the logs and renders it as a merge request note.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::conflict::ReviewFlag;
use crate::engine::{EngineConfig, RoundState, RunRequest, RunState, TerminalOutcome};
use crate::hosting::MergeRequest;
use crate::models::{AuthorIdentity, ResolutionStrategy};

/// The parts of a merge request worth keeping in a report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeRequestSummary {
    pub iid: u64,
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
    pub author: String,
    pub web_url: String,
}

impl From<&MergeRequest> for MergeRequestSummary {
    fn from(mr: &MergeRequest) -> Self {
        Self {
            iid: mr.iid,
            title: mr.title.clone(),
            source_branch: mr.source_branch.clone(),
            target_branch: mr.target_branch.clone(),
            author: mr.author.username.clone(),
            web_url: mr.web_url.clone(),
        }
    }
}

/// Serializable form of the terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeRecord {
    /// `success`, `conflict_limit_exceeded`, `cancelled` or an error kind.
    pub kind: String,
    pub message: String,
    pub round: u32,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub merge_request: Option<MergeRequestSummary>,
    pub source_branch: String,
    pub target_ref: String,
    pub publish_ref: String,
    pub author: AuthorIdentity,
    pub strategy: ResolutionStrategy,
    pub max_rounds: u32,
    pub rounds_executed: u32,
    pub rounds: Vec<RoundState>,
    pub warnings: Vec<String>,
    pub review_flags: Vec<ReviewFlag>,
    pub commit: Option<String>,
    pub published: bool,
    pub outcome: OutcomeRecord,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Fold a finished run into a report.
    pub fn from_run(
        config: &EngineConfig,
        request: &RunRequest,
        state: RunState,
        started_at: DateTime<Utc>,
    ) -> Self {
        let terminal = state
            .outcome
            .clone()
            .unwrap_or(TerminalOutcome::Cancelled {
                round: state.current_round,
            });
        let round = match terminal {
            TerminalOutcome::Error(ref e) if e.round() > 0 => e.round(),
            _ => state.current_round,
        };
        let outcome = OutcomeRecord {
            kind: terminal.kind().to_string(),
            message: terminal.message(),
            round,
            path: terminal.path().map(str::to_string),
        };

        Self {
            run_id: Uuid::new_v4(),
            merge_request: None,
            source_branch: request.clone.branch.clone(),
            target_ref: request.target_ref.clone(),
            publish_ref: request.publish_ref.clone(),
            author: request.author.clone(),
            strategy: config.strategy,
            max_rounds: config.max_rounds,
            rounds_executed: state.total_rounds_executed,
            rounds: state.rounds,
            warnings: state.warnings,
            review_flags: state.review_flags,
            commit: state.commit,
            published: state.published,
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn with_merge_request(mut self, mr: &MergeRequest) -> Self {
        self.merge_request = Some(MergeRequestSummary::from(mr));
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome.kind == "success"
    }

    /// Number of paths resolved across all rounds.
    pub fn resolved_count(&self) -> usize {
        self.rounds.iter().map(|r| r.resolved_paths.len()).sum()
    }

    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }

    /// `mr_<iid>_report.json`, or `run_<id>_report.json` without an MR.
    pub fn file_name(&self) -> String {
        match self.merge_request {
            Some(ref mr) => format!("mr_{}_report.json", mr.iid),
            None => format!("run_{}_report.json", self.run_id),
        }
    }

    /// Write the report as pretty JSON into `dir`.
    pub fn save(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let file = std::fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, self)?;
        info!(path = %path.display(), "run report saved");
        Ok(path)
    }

    fn target_branch(&self) -> &str {
        match self.merge_request {
            Some(ref mr) => &mr.target_branch,
            None => self
                .target_ref
                .strip_prefix("origin/")
                .unwrap_or(&self.target_ref),
        }
    }

    /// Markdown note for the merge request.
    pub fn render_note(&self) -> String {
        let mut note = String::new();
        let stamp = self.finished_at.format("%Y-%m-%d %H:%M:%S UTC");

        if self.is_success() && self.resolved_count() == 0 {
            let _ = writeln!(note, "## No conflicts - rebased onto `{}`\n", self.target_branch());
            let _ = writeln!(
                note,
                "The branch `{}` replayed cleanly onto `{}` and was force-pushed. \
                 It can be merged once the pipeline passes.\n",
                self.source_branch,
                self.target_branch()
            );
            let _ = write!(note, "*Checked by rebasefix - {stamp}*");
            return note;
        }

        if self.is_success() {
            let _ = writeln!(note, "## Merge conflicts resolved automatically\n");
            let _ = writeln!(
                note,
                "Rebased `{}` onto `{}` in {} round(s) using strategy `{}`.\n",
                self.source_branch,
                self.target_branch(),
                self.rounds_executed,
                self.strategy
            );
            let _ = writeln!(note, "**Changes made:**");
            for round in &self.rounds {
                for file in &round.files {
                    let action = if file.deleted {
                        "removed (deleted on the kept side)"
                    } else {
                        "kept the selected side"
                    };
                    let _ = writeln!(
                        note,
                        "- round {}: `{}` {action}",
                        round.round_number, file.path
                    );
                }
            }
            self.write_flags(&mut note);
            let _ = writeln!(
                note,
                "\n**Next steps:**\n1. Review the changes in this merge request\n\
                 2. Let the pipeline run\n3. Merge when ready\n"
            );
            let _ = write!(note, "*Resolved by rebasefix - {stamp}*");
            return note;
        }

        let _ = writeln!(note, "## Automatic resolution incomplete\n");
        let _ = writeln!(note, "**Status:** `{}`\n", self.outcome.kind);
        let _ = writeln!(note, "**Reason:** {}\n", self.outcome.message);
        if let Some(ref path) = self.outcome.path {
            let _ = writeln!(
                note,
                "**Failing file:** `{path}` (round {})\n",
                self.outcome.round
            );
        }
        self.write_flags(&mut note);
        let _ = writeln!(
            note,
            "\nNothing was pushed. Please resolve manually:\n\n```bash\n\
             git fetch origin\n\
             git rebase origin/{target}\n\
             # fix conflicts in your editor\n\
             git add <files>\n\
             git rebase --continue\n\
             git push origin {source} --force-with-lease\n```\n",
            target = self.target_branch(),
            source = self.source_branch
        );
        let _ = write!(note, "*Reported by rebasefix - {stamp}*");
        note
    }

    fn write_flags(&self, note: &mut String) {
        if !self.review_flags.is_empty() {
            let _ = writeln!(note, "\n**Manual review recommended:**");
            for flag in &self.review_flags {
                let _ = writeln!(note, "- `{}` (matches `{}`)", flag.path, flag.pattern);
            }
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(note, "\n**Warnings:**");
            for warning in &self.warnings {
                let _ = writeln!(note, "- {warning}");
            }
        }
    }
}
