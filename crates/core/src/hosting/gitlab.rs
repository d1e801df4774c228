//! GitLab REST API client.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::GitLabConfig;
use crate::errors::HostingError;
use crate::models::AuthorIdentity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequestAuthor {
    pub id: Option<u64>,
    pub username: String,
    pub name: String,
}

/// Merge request as returned by `GET /projects/:id/merge_requests/:iid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub iid: u64,
    pub title: String,
    pub state: String,
    pub source_branch: String,
    pub target_branch: String,
    #[serde(default)]
    pub merge_status: Option<String>,
    #[serde(default)]
    pub detailed_merge_status: Option<String>,
    #[serde(default)]
    pub has_conflicts: Option<bool>,
    pub author: MergeRequestAuthor,
    pub web_url: String,
    #[serde(default)]
    pub sha: Option<String>,
}

impl MergeRequest {
    /// Whether GitLab considers the MR conflicted with its target branch.
    pub fn has_conflicts(&self) -> bool {
        self.has_conflicts == Some(true)
            || self.merge_status.as_deref() == Some("cannot_be_merged")
            || self.detailed_merge_status.as_deref() == Some("conflict")
    }

    pub fn is_open(&self) -> bool {
        self.state == "opened"
    }

    /// The MR author as a commit identity, `username@email_domain`.
    pub fn author_identity(&self, email_domain: &str) -> AuthorIdentity {
        AuthorIdentity::new(
            self.author.name.clone(),
            format!("{}@{}", self.author.username, email_domain),
        )
    }
}

/// Asynchronous GitLab REST API client bound to one project.
#[derive(Clone)]
pub struct GitLabClient {
    http: reqwest::Client,
    api_url: String,
    project: String,
    token: String,
}

impl GitLabClient {
    pub fn new(
        api_url: impl Into<String>,
        project: impl Into<String>,
        token: impl Into<String>,
        ssl_verify: bool,
    ) -> Result<Self, HostingError> {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let project = project.into().trim_matches('/').to_string();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("rebasefix/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!ssl_verify)
            .build()?;
        info!(api_url = %api_url, project = %project, ssl_verify, "created GitLabClient");
        Ok(Self {
            http,
            api_url,
            project,
            token: token.into(),
        })
    }

    /// Build a client from resolved configuration.
    pub fn from_config(config: &GitLabConfig) -> Result<Self, HostingError> {
        let token = config.token.clone().ok_or_else(|| {
            HostingError::AuthenticationFailed(format!(
                "no token found in ${} or the CI/GitLab token variables",
                config.token_env
            ))
        })?;
        Self::new(
            config.api_url(),
            config.project.clone(),
            token,
            config.ssl_verify,
        )
    }

    /// The access token, for authenticating git transport.
    pub fn token(&self) -> &str {
        &self.token
    }

    #[instrument(skip(self))]
    pub async fn get_merge_request(&self, iid: u64) -> Result<MergeRequest, HostingError> {
        let url = format!(
            "{}/projects/{}/merge_requests/{}",
            self.api_url,
            encode_project(&self.project),
            iid
        );
        let resp = self
            .http
            .get(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;
        let resp = check_response(resp).await?;
        let mr: MergeRequest = resp.json().await?;
        debug!(
            iid = mr.iid,
            source = %mr.source_branch,
            target = %mr.target_branch,
            merge_status = ?mr.merge_status,
            "fetched merge request"
        );
        Ok(mr)
    }

    #[instrument(skip(self, body))]
    pub async fn post_note(&self, iid: u64, body: &str) -> Result<(), HostingError> {
        let url = format!(
            "{}/projects/{}/merge_requests/{}/notes",
            self.api_url,
            encode_project(&self.project),
            iid
        );
        let payload = serde_json::json!({ "body": body });
        let resp = self
            .http
            .post(&url)
            .header("PRIVATE-TOKEN", &self.token)
            .json(&payload)
            .send()
            .await?;
        check_response(resp).await?;
        info!(iid, "posted note to merge request");
        Ok(())
    }
}

async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, HostingError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(HostingError::AuthenticationFailed(format!("HTTP {status}")));
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| format!("HTTP {status}"));
    Err(HostingError::ApiError {
        status: status.as_u16(),
        body,
    })
}

/// URL-encode a `group/sub/project` path for use as `:id`.
fn encode_project(project: &str) -> String {
    project.replace('%', "%25").replace('/', "%2F")
}
