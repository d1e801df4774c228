//! TOML-based configuration system for rebasefix.
//!
//! The GitLab token is stored as a `token_env` field that references an
//! environment variable name. The actual secret is resolved at runtime via
//! [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::EngineConfig;
use crate::errors::ConfigError;
use crate::models::{AuthorIdentity, ResolutionStrategy};

/// Environment variables consulted, in order, when `gitlab.token_env` is unset.
const FALLBACK_TOKEN_VARS: &[&str] = &["CI_JOB_TOKEN", "GITLAB_PRIVATE_TOKEN", "GITLAB_TOKEN"];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// GitLab server and project settings.
    pub gitlab: GitLabConfig,

    /// Conflict resolution behaviour.
    #[serde(default)]
    pub resolution: ResolutionConfig,

    /// Commit author settings.
    #[serde(default)]
    pub author: AuthorConfig,

    /// Logging, report and working-copy locations.
    #[serde(default)]
    pub output: OutputConfig,
}

// ---------------------------------------------------------------------------
// GitLab
// ---------------------------------------------------------------------------

/// GitLab server and project configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLabConfig {
    /// Base URL of the GitLab instance (e.g. `https://gitlab.example.com`).
    pub url: String,

    /// REST API base URL. Defaults to `<url>/api/v4`.
    #[serde(default)]
    pub api_url: Option<String>,

    /// Project path in `group/project` format.
    pub project: String,

    /// Environment variable holding the access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Verify TLS certificates for API calls and clones.
    #[serde(default = "default_true")]
    pub ssl_verify: bool,

    /// Post a summary note on the merge request after each run.
    #[serde(default = "default_true")]
    pub post_notes: bool,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_token_env() -> String {
    "GITLAB_TOKEN".into()
}

fn default_true() -> bool {
    true
}

impl GitLabConfig {
    /// The REST API base URL, without a trailing slash.
    pub fn api_url(&self) -> String {
        match self.api_url {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => format!("{}/api/v4", self.url.trim_end_matches('/')),
        }
    }

    /// HTTPS clone URL of the project.
    pub fn clone_url(&self) -> String {
        format!(
            "{}/{}.git",
            self.url.trim_end_matches('/'),
            self.project.trim_matches('/')
        )
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Conflict resolution behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Which side wins every conflicted file.
    #[serde(default)]
    pub strategy: ResolutionStrategy,

    /// Upper bound on rebase rounds (default 10).
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Seconds allowed for the initial clone (default 60).
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout_secs: u64,

    /// Seconds allowed for a whole run before it is cancelled (default 600).
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// Files above this size are classified as large (default 1 MiB).
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold_bytes: u64,

    /// Glob patterns for files that deserve a human look after resolution.
    #[serde(default)]
    pub review_patterns: Vec<String>,
}

fn default_max_rounds() -> u32 {
    10
}
fn default_clone_timeout() -> u64 {
    60
}
fn default_run_timeout() -> u64 {
    600
}
fn default_large_file_threshold() -> u64 {
    1024 * 1024
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::default(),
            max_rounds: default_max_rounds(),
            clone_timeout_secs: default_clone_timeout(),
            run_timeout_secs: default_run_timeout(),
            large_file_threshold_bytes: default_large_file_threshold(),
            review_patterns: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Author
// ---------------------------------------------------------------------------

/// Author identity settings.
///
/// By default the merge request author is used. `name`/`email` override it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    /// Domain used to build `username@domain` when GitLab exposes no email.
    #[serde(default = "default_email_domain")]
    pub email_domain: String,
}

fn default_email_domain() -> String {
    "gitlab.local".into()
}

impl Default for AuthorConfig {
    fn default() -> Self {
        Self {
            name: None,
            email: None,
            email_domain: default_email_domain(),
        }
    }
}

impl AuthorConfig {
    /// Apply the configured override fields on top of `original`.
    pub fn apply_override(&self, original: AuthorIdentity) -> AuthorIdentity {
        AuthorIdentity {
            name: self.name.clone().unwrap_or(original.name),
            email: self.email.clone().unwrap_or(original.email),
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Logging, report and working-copy locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for per-run log files. No file logging when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Directory for JSON run reports. No report when unset.
    #[serde(default)]
    pub report_dir: Option<PathBuf>,

    /// Parent directory for temporary working copies (system temp if unset).
    #[serde(default)]
    pub work_root: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
            report_dir: None,
            work_root: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve the GitLab token from `gitlab.token_env`, falling back to the
    /// CI / GitLab variables the tool has always honoured.
    ///
    /// A missing token only logs a warning; commands that need it check
    /// `gitlab.token` themselves.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.gitlab.token = resolve_optional_env(&self.gitlab.token_env, "gitlab.token_env")
            .or_else(|| {
                FALLBACK_TOKEN_VARS
                    .iter()
                    .filter(|name| **name != self.gitlab.token_env)
                    .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
            });

        if self.gitlab.token.is_none() {
            warn!("no GitLab token found in any source");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gitlab.url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "gitlab.url".into(),
                detail: "GitLab URL must not be empty".into(),
            });
        }
        if !self.gitlab.url.starts_with("http://") && !self.gitlab.url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "gitlab.url".into(),
                detail: "GitLab URL must start with http:// or https://".into(),
            });
        }
        if self.gitlab.project.trim_matches('/').is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "gitlab.project".into(),
                detail: "project path must not be empty".into(),
            });
        }
        if self.resolution.max_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolution.max_rounds".into(),
                detail: "max rounds must be >= 1".into(),
            });
        }
        if self.resolution.clone_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolution.clone_timeout_secs".into(),
                detail: "clone timeout must be > 0".into(),
            });
        }
        if self.resolution.run_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolution.run_timeout_secs".into(),
                detail: "run timeout must be > 0".into(),
            });
        }
        for pattern in &self.resolution.review_patterns {
            let problem = if pattern.trim().is_empty() {
                Some("empty pattern")
            } else {
                glob_syntax_error(pattern)
            };
            if let Some(problem) = problem {
                return Err(ConfigError::InvalidValue {
                    field: "resolution.review_patterns".into(),
                    detail: format!("{problem}: '{pattern}'"),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Build the immutable engine configuration for one run.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            strategy: self.resolution.strategy,
            max_rounds: self.resolution.max_rounds,
            clone_timeout: Duration::from_secs(self.resolution.clone_timeout_secs),
            large_file_threshold: self.resolution.large_file_threshold_bytes,
            review_patterns: self.resolution.review_patterns.clone(),
        }
    }
}

/// Reject glob patterns with an unclosed `[` class or unbalanced braces.
fn glob_syntax_error(pattern: &str) -> Option<&'static str> {
    let mut in_class = false;
    let mut braces = 0usize;
    for c in pattern.chars() {
        match c {
            ']' if in_class => in_class = false,
            _ if in_class => {}
            '[' => in_class = true,
            '{' => braces += 1,
            '}' => match braces.checked_sub(1) {
                Some(depth) => braces = depth,
                None => return Some("unmatched '}'"),
            },
            _ => {}
        }
    }
    if in_class {
        Some("unclosed '['")
    } else if braces > 0 {
        Some("unclosed '{'")
    } else {
        None
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs and returns `None` if the variable is unset or empty.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            debug!(field, env_name, "env var not set");
            None
        }
    }
}
