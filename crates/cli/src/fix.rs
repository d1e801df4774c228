//! `rebasefix fix`: rebase a merge request onto its target and resolve every
//! conflict round with one strategy.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::Confirm;
use tracing::{info, warn};

use rebasefix_core::config::GitLabConfig;
use rebasefix_core::hosting::{parse_merge_request_ref, GitLabClient, MergeRequest};
use rebasefix_core::models::ResolutionStrategy;
use rebasefix_core::vcs::CloneRequest;
use rebasefix_core::{
    AppConfig, CancellationToken, ConflictResolutionEngine, GitClient, RunReport, RunRequest,
};

use crate::sink::ConsoleSink;
use crate::style;

/// Username GitLab accepts alongside an access token over HTTPS.
const TOKEN_USERNAME: &str = "oauth2";

#[derive(Debug)]
pub struct FixOptions {
    pub merge_request: String,
    pub strategy: Option<ResolutionStrategy>,
    pub max_rounds: Option<u32>,
    pub yes: bool,
    pub no_note: bool,
    pub verbose: bool,
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Run a full resolution for one merge request.
///
/// Returns `ExitCode::SUCCESS` only when the branch was rebased, committed
/// and published.
pub async fn run_fix(config: &AppConfig, opts: FixOptions) -> Result<ExitCode> {
    let (client, gitlab, iid) = gitlab_client(config, &opts.merge_request)?;

    let mr = client
        .get_merge_request(iid)
        .await
        .with_context(|| format!("failed to fetch merge request !{iid}"))?;
    if !mr.is_open() {
        anyhow::bail!("merge request !{} is {}, not open", mr.iid, mr.state);
    }

    let mut engine_config = config.engine_config();
    if let Some(strategy) = opts.strategy {
        engine_config.strategy = strategy;
    }
    if let Some(max_rounds) = opts.max_rounds {
        if max_rounds == 0 {
            anyhow::bail!("--max-rounds must be at least 1");
        }
        engine_config.max_rounds = max_rounds;
    }

    print_plan(&mr, engine_config.strategy, engine_config.max_rounds);
    if !mr.has_conflicts() {
        println!(
            "  {}",
            style::warn("GitLab reports no conflicts; the rebase may apply cleanly.")
        );
        println!();
    }

    if !opts.yes && !confirm_force_push(&mr.source_branch)? {
        println!("{}", style::warn("Aborted. Nothing was changed."));
        return Ok(ExitCode::FAILURE);
    }

    let author = config
        .author
        .apply_override(mr.author_identity(&config.author.email_domain));

    let mut builder = tempfile::Builder::new();
    builder.prefix("rebasefix-");
    let workspace = match config.output.work_root {
        Some(ref root) => {
            std::fs::create_dir_all(root)
                .with_context(|| format!("failed to create work root {}", root.display()))?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
    .context("failed to create temporary working directory")?;

    let request = RunRequest {
        clone: CloneRequest {
            url: gitlab.clone_url(),
            branch: mr.source_branch.clone(),
            identity: author.clone(),
        },
        working_copy: workspace.path().join("repo"),
        target_ref: format!("origin/{}", mr.target_branch),
        publish_ref: mr.source_branch.clone(),
        author,
        commit_message: format!("Resolve rebase conflicts for !{}", mr.iid),
    };

    let git = GitClient::new()
        .with_token(TOKEN_USERNAME, client.token())
        .with_ssl_verify(gitlab.ssl_verify);
    let max_rounds = engine_config.max_rounds;
    let engine = ConflictResolutionEngine::new(Arc::new(engine_config), git);
    let sink = Arc::new(ConsoleSink::new(max_rounds, opts.verbose));
    let cancel = CancellationToken::new();

    let run_timeout = Duration::from_secs(config.resolution.run_timeout_secs);
    let report = run_engine(engine, request, sink, cancel, run_timeout).await?;
    let report = report.with_merge_request(&mr);

    print_summary(&report);

    if let Some(ref dir) = config.output.report_dir {
        match report.save(dir) {
            Ok(path) => println!("  Report saved to {}", path.display()),
            Err(e) => println!(
                "  {}",
                style::warn(&format!("could not save report in {}: {}", dir.display(), e))
            ),
        }
    }

    if gitlab.post_notes && !opts.no_note {
        match client.post_note(mr.iid, &report.render_note()).await {
            Ok(()) => println!("  Posted summary note to !{}", mr.iid),
            Err(e) => {
                warn!(error = %e, "failed to post merge request note");
                println!("  {}", style::warn(&format!("could not post note: {e}")));
            }
        }
    }
    println!();

    drop(workspace);
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Build the GitLab client, honouring a project path embedded in an MR URL.
/// Returns the client, the effective GitLab settings and the MR iid.
pub fn gitlab_client(
    config: &AppConfig,
    reference: &str,
) -> Result<(GitLabClient, GitLabConfig, u64)> {
    let mr_ref = parse_merge_request_ref(reference)?;
    let mut gitlab = config.gitlab.clone();
    if let Some(project) = mr_ref.project {
        gitlab.project = project;
    }
    let client = GitLabClient::from_config(&gitlab).context("failed to create GitLab client")?;
    Ok((client, gitlab, mr_ref.iid))
}

// ---------------------------------------------------------------------------
// Engine worker
// ---------------------------------------------------------------------------

/// Run the engine on a blocking worker. Ctrl-C or the run timeout signals the
/// token; the engine stops at its next safe point and the report is still
/// collected.
async fn run_engine(
    engine: ConflictResolutionEngine<GitClient>,
    request: RunRequest,
    sink: Arc<ConsoleSink>,
    cancel: CancellationToken,
    run_timeout: Duration,
) -> Result<RunReport> {
    let worker_cancel = cancel.clone();
    let mut handle = tokio::task::spawn_blocking(move || {
        engine.run(&request, sink.as_ref(), &worker_cancel)
    });

    let report = tokio::select! {
        joined = &mut handle => joined.context("resolution worker panicked")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
            handle.await.context("resolution worker panicked")?
        }
        _ = tokio::time::sleep(run_timeout) => {
            warn!(secs = run_timeout.as_secs(), "run timeout elapsed, cancelling run");
            cancel.cancel();
            handle.await.context("resolution worker panicked")?
        }
    };
    info!(outcome = %report.outcome.kind, "resolution worker finished");
    Ok(report)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_plan(mr: &MergeRequest, strategy: ResolutionStrategy, max_rounds: u32) {
    println!();
    println!("{}", style::header(&format!("!{} {}", mr.iid, mr.title)));
    println!();
    println!("  Branch     {} → {}", mr.source_branch, mr.target_branch);
    println!("  Author     {} (@{})", mr.author.name, mr.author.username);
    println!("  Strategy   {}", strategy);
    println!("  Max rounds {}", max_rounds);
    println!();
}

fn confirm_force_push(branch: &str) -> Result<bool> {
    println!(
        "{}",
        style::warn(&format!(
            "This rebases '{branch}' and force-pushes it, rewriting its remote history."
        ))
    );
    Confirm::new()
        .with_prompt("Continue?")
        .default(false)
        .interact()
        .context("failed to read confirmation")
}

fn print_summary(report: &RunReport) {
    println!();
    if report.is_success() {
        println!("{}", style::success("Conflicts resolved and branch published"));
    } else {
        println!("{}", style::error(&report.outcome.message));
    }
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Field", "Value"]);

    let outcome_cell = if report.is_success() {
        Cell::new(&report.outcome.kind).fg(comfy_table::Color::Green)
    } else {
        Cell::new(&report.outcome.kind).fg(comfy_table::Color::Red)
    };
    table.add_row(vec![Cell::new("Outcome"), outcome_cell]);
    table.add_row(vec![
        Cell::new("Rounds"),
        Cell::new(format!("{} / {}", report.rounds_executed, report.max_rounds)),
    ]);
    table.add_row(vec![Cell::new("Files resolved"), Cell::new(report.resolved_count())]);
    table.add_row(vec![Cell::new("Strategy"), Cell::new(report.strategy)]);
    table.add_row(vec![Cell::new("Author"), Cell::new(&report.author)]);
    table.add_row(vec![
        Cell::new("Commit"),
        Cell::new(report.commit.as_deref().unwrap_or("—")),
    ]);
    table.add_row(vec![
        Cell::new("Published"),
        Cell::new(if report.published { "yes" } else { "no" }),
    ]);
    if let Some(ref path) = report.outcome.path {
        table.add_row(vec![Cell::new("Failed path"), Cell::new(path)]);
    }
    table.add_row(vec![
        Cell::new("Duration"),
        Cell::new(format!("{}s", report.duration_secs())),
    ]);
    println!("{table}");

    if !report.warnings.is_empty() {
        println!();
        println!("  {}", style::header("Warnings"));
        for warning in &report.warnings {
            println!("  {}", style::warn(warning));
        }
    }

    if !report.review_flags.is_empty() {
        println!();
        println!("  {}", style::header("Review recommended"));
        for flag in &report.review_flags {
            println!(
                "  {} {}",
                flag.path,
                style::dim(&format!("(matches {}, round {})", flag.pattern, flag.round))
            );
        }
    }
    println!();
}
