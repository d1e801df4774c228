//! Hosting service integration (GitLab).
//!
//! The engine never talks to the hosting service; the CLI uses this module to
//! describe the merge request before a run and to comment on it afterwards.

pub mod gitlab;

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::errors::HostingError;

pub use gitlab::{GitLabClient, MergeRequest, MergeRequestAuthor};

/// A merge request named on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequestRef {
    /// Project path when the reference was a URL.
    pub project: Option<String>,
    pub iid: u64,
}

fn mr_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://[^/]+/(?P<project>.+?)/(?:-/)?merge_requests/(?P<iid>[0-9]+)/?(?:[?#].*)?$")
            .expect("merge request URL regex is valid")
    })
}

/// Parse `42`, `!42` or a `…/-/merge_requests/42` URL.
pub fn parse_merge_request_ref(input: &str) -> Result<MergeRequestRef, HostingError> {
    let trimmed = input.trim();
    let bare = trimmed.strip_prefix('!').unwrap_or(trimmed);
    if let Ok(iid) = bare.parse::<u64>() {
        return Ok(MergeRequestRef { project: None, iid });
    }

    let caps = mr_url_regex()
        .captures(trimmed)
        .ok_or_else(|| HostingError::InvalidReference(input.to_string()))?;
    let iid = caps["iid"]
        .parse::<u64>()
        .map_err(|_| HostingError::InvalidReference(input.to_string()))?;
    Ok(MergeRequestRef {
        project: Some(caps["project"].to_string()),
        iid,
    })
}
