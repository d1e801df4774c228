//! rebasefix command-line tool.
//!
//! Rebases a GitLab merge request onto its target branch, resolving every
//! conflict round with a single whole-file strategy, then force-pushes the
//! result and reports back on the merge request.

mod fix;
mod sink;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use rebasefix_core::models::ResolutionStrategy;
use rebasefix_core::AppConfig;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Automatic rebase conflict resolution for GitLab merge requests.
#[derive(Parser, Debug)]
#[command(
    name = "rebasefix",
    version,
    about = "Rebase a merge request and resolve its conflicts automatically"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// [default: ~/.config/rebasefix/config.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print debug progress and mirror logs to the terminal.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./rebasefix.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Show a merge request and what `fix` would do with it.
    Analyze {
        /// Merge request iid (`42`, `!42`) or URL.
        merge_request: String,
    },

    /// Rebase a merge request, resolve every conflict and force-push.
    Fix {
        /// Merge request iid (`42`, `!42`) or URL.
        merge_request: String,

        /// Resolution strategy: keep_incoming (theirs) or keep_base (ours).
        #[arg(short, long)]
        strategy: Option<ResolutionStrategy>,

        /// Maximum number of conflict rounds.
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Skip the force-push confirmation.
        #[arg(short, long)]
        yes: bool,

        /// Do not comment the outcome on the merge request.
        #[arg(long)]
        no_note: bool,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Init { ref output } => {
            init_tracing("warn", cli.verbose, None)?;
            cmd_init(output)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            init_tracing("warn", cli.verbose, None)?;
            cmd_validate(&config_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Analyze { ref merge_request } => {
            let config = load_config(&config_path)?;
            let _guard = init_tracing(
                cli.log_level.as_deref().unwrap_or(&config.output.log_level),
                cli.verbose,
                None,
            )?;
            cmd_analyze(&config, merge_request).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Fix {
            merge_request,
            strategy,
            max_rounds,
            yes,
            no_note,
        } => {
            let config = load_config(&config_path)?;
            let _guard = init_tracing(
                cli.log_level.as_deref().unwrap_or(&config.output.log_level),
                cli.verbose,
                config.output.log_dir.as_deref(),
            )?;
            let opts = fix::FixOptions {
                merge_request,
                strategy,
                max_rounds,
                yes,
                no_note,
                verbose: cli.verbose,
            };
            fix::run_fix(&config, opts).await
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`. The terminal only shows warnings unless
/// `verbose`; when `log_dir` is set every event at `level` is also written to
/// `rebasefix_<timestamp>.log` there. Keep the returned guard alive until
/// exit so the file writer flushes.
fn init_tracing(level: &str, verbose: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let terminal_level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::WARN
    };
    let terminal = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(terminal_level);

    let (file, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let name = format!(
                "rebasefix_{}.log",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            );
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(terminal)
        .with(file)
        .init();
    Ok(guard)
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rebasefix")
        .join("config.toml")
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config =
        AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("configuration validation failed")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"# rebasefix configuration

[gitlab]
url = "https://gitlab.example.com"
# api_url = "https://gitlab.example.com/api/v4"
project = "group/project"
# Environment variable holding the access token. CI_JOB_TOKEN,
# GITLAB_PRIVATE_TOKEN and GITLAB_TOKEN are tried when it is unset.
token_env = "GITLAB_TOKEN"
ssl_verify = true
post_notes = true

[resolution]
# keep_incoming (theirs): keep the merge request's version of each file
# keep_base (ours): keep the target branch's version of each file
strategy = "keep_incoming"
max_rounds = 10
clone_timeout_secs = 60
run_timeout_secs = 600
large_file_threshold_bytes = 1048576
review_patterns = ["**/*.tf", "**/.terraform/**", "**/*schema*"]

[author]
# name = "Override Name"
# email = "override@example.com"
email_domain = "gitlab.local"

[output]
log_level = "info"
# log_dir = "./logs"
report_dir = "."
# work_root = "/tmp"
"#;

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
    }

    std::fs::write(output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!(
        "{}",
        style::success(&format!(
            "Default configuration written to {}",
            output.display()
        ))
    );
    println!();
    println!("Next steps:");
    println!("  1. Edit the [gitlab] section with your server and project");
    println!("  2. Export the token variable (GITLAB_TOKEN by default)");
    println!(
        "  3. Validate with: rebasefix validate --config {}",
        output.display()
    );
    println!(
        "  4. Fix a merge request: rebasefix fix 42 --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    // Token is optional for validation; missing only warns.
    let _ = config.resolve_env_vars();
    println!("  {}", style::success("Environment variable references processed"));

    match config.validate() {
        Ok(()) => println!("  {}", style::success("All required fields are valid")),
        Err(e) => {
            println!("  {}", style::error(&format!("Validation error: {}", e)));
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  GitLab URL     : {}", config.gitlab.url);
    println!("  API URL        : {}", config.gitlab.api_url());
    println!("  Project        : {}", config.gitlab.project);
    println!(
        "  Token          : {}",
        if config.gitlab.token.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!("  SSL verify     : {}", config.gitlab.ssl_verify);
    println!("  Strategy       : {}", config.resolution.strategy);
    println!("  Max rounds     : {}", config.resolution.max_rounds);
    println!("  Clone timeout  : {}s", config.resolution.clone_timeout_secs);
    println!("  Run timeout    : {}s", config.resolution.run_timeout_secs);
    println!(
        "  Review globs   : {}",
        if config.resolution.review_patterns.is_empty() {
            "none".to_string()
        } else {
            config.resolution.review_patterns.join(", ")
        }
    );
    println!(
        "  Report dir     : {}",
        config
            .output
            .report_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "disabled".to_string())
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}

async fn cmd_analyze(config: &AppConfig, reference: &str) -> Result<()> {
    let (client, gitlab, iid) = fix::gitlab_client(config, reference)?;
    let mr = client
        .get_merge_request(iid)
        .await
        .with_context(|| format!("failed to fetch merge request !{iid}"))?;

    let author = config
        .author
        .apply_override(mr.author_identity(&config.author.email_domain));

    println!();
    println!("{}", style::header(&format!("!{} {}", mr.iid, mr.title)));
    println!("{}", "═".repeat(40));
    println!();
    println!("  Project      {}", gitlab.project);
    println!("  State        {}", mr.state);
    println!("  Branches     {} → {}", mr.source_branch, mr.target_branch);
    println!("  Author       {} (@{})", mr.author.name, mr.author.username);
    println!(
        "  Merge status {}",
        mr.detailed_merge_status
            .as_deref()
            .or(mr.merge_status.as_deref())
            .unwrap_or("unknown")
    );
    println!("  Conflicts    {}", style::conflicts(mr.has_conflicts()));
    println!("  Web          {}", style::dim(&mr.web_url));
    println!();
    println!("  {}", style::header("Planned resolution"));
    println!("  Strategy     {}", config.resolution.strategy);
    println!("  Max rounds   {}", config.resolution.max_rounds);
    println!("  Commit as    {}", author);
    println!("  Clone        {}", style::dim(&gitlab.clone_url()));
    println!();

    if !mr.is_open() {
        println!("  {}", style::warn("Merge request is not open; fix will refuse it."));
    } else if mr.has_conflicts() {
        println!("  Run: rebasefix fix {}", mr.iid);
    } else {
        println!("  {}", style::success("No conflicts reported; nothing to fix."));
    }
    println!();

    Ok(())
}
