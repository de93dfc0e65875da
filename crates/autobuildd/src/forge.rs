//! External API translations.
//!
//! Source-forge REST and issue-tracker GraphQL responses are translated into
//! the core's internal shapes: camel-cased keys, parsed dates. Credentials
//! come from the per-project env file; calls carry bearer auth. Idempotent
//! GETs get one retry with a short fixed backoff; anything smarter is out of
//! scope here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = concat!("autobuildd/", env!("CARGO_PKG_VERSION"));
const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(500);
const FORGE_API: &str = "https://api.github.com";
const TRACKER_API: &str = "https://api.linear.app/graphql";

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected response shape: {0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, ForgeError>;

// --- Internal shapes ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgeIssue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgeRepo {
    pub name: String,
    pub full_name: String,
    pub private: bool,
    pub default_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerTeam {
    pub id: String,
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerProject {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerIssue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
}

// --- Raw wire shapes ---

#[derive(Debug, Deserialize)]
struct RawIssue {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<RawLabel>,
    html_url: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawRepo {
    name: String,
    full_name: String,
    private: bool,
    default_branch: String,
}

impl From<RawIssue> for ForgeIssue {
    fn from(raw: RawIssue) -> Self {
        Self {
            number: raw.number,
            title: raw.title,
            body: raw.body,
            state: raw.state,
            labels: raw.labels.into_iter().map(|l| l.name).collect(),
            url: raw.html_url,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        }
    }
}

impl From<RawRepo> for ForgeRepo {
    fn from(raw: RawRepo) -> Self {
        Self {
            name: raw.name,
            full_name: raw.full_name,
            private: raw.private,
            default_branch: raw.default_branch,
        }
    }
}

// --- Translation (pure; exercised directly by tests) ---

pub fn parse_issues(json: &str) -> Result<Vec<ForgeIssue>> {
    let raw: Vec<RawIssue> =
        serde_json::from_str(json).map_err(|e| ForgeError::Shape(e.to_string()))?;
    Ok(raw.into_iter().map(ForgeIssue::from).collect())
}

pub fn parse_issue(json: &str) -> Result<ForgeIssue> {
    let raw: RawIssue = serde_json::from_str(json).map_err(|e| ForgeError::Shape(e.to_string()))?;
    Ok(raw.into())
}

pub fn parse_repos(json: &str) -> Result<Vec<ForgeRepo>> {
    let raw: Vec<RawRepo> =
        serde_json::from_str(json).map_err(|e| ForgeError::Shape(e.to_string()))?;
    Ok(raw.into_iter().map(ForgeRepo::from).collect())
}

pub fn parse_teams(json: &str) -> Result<Vec<TrackerTeam>> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ForgeError::Shape(e.to_string()))?;
    let nodes = value
        .pointer("/data/teams/nodes")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ForgeError::Shape("missing data.teams.nodes".to_string()))?;
    nodes
        .iter()
        .map(|node| {
            serde_json::from_value(node.clone()).map_err(|e| ForgeError::Shape(e.to_string()))
        })
        .collect()
}

pub fn parse_tracker_projects(json: &str) -> Result<Vec<TrackerProject>> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ForgeError::Shape(e.to_string()))?;
    let nodes = value
        .pointer("/data/projects/nodes")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ForgeError::Shape("missing data.projects.nodes".to_string()))?;
    nodes
        .iter()
        .map(|node| {
            serde_json::from_value(node.clone()).map_err(|e| ForgeError::Shape(e.to_string()))
        })
        .collect()
}

pub fn parse_tracker_issues(json: &str) -> Result<Vec<TrackerIssue>> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ForgeError::Shape(e.to_string()))?;
    let nodes = value
        .pointer("/data/issues/nodes")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ForgeError::Shape("missing data.issues.nodes".to_string()))?;
    nodes
        .iter()
        .map(|node| {
            let state = node
                .pointer("/state/name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let mut flat = node.clone();
            if let Some(obj) = flat.as_object_mut() {
                obj.insert("state".to_string(), serde_json::Value::String(state));
            }
            serde_json::from_value(flat).map_err(|e| ForgeError::Shape(e.to_string()))
        })
        .collect()
}

// --- HTTP layer ---

/// Client over both external APIs. Cheap to construct; holds only the
/// reqwest connection pool.
#[derive(Debug, Clone)]
pub struct ForgeClient {
    http: reqwest::Client,
}

impl Default for ForgeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ForgeClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(std::time::Duration::from_secs(10))
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
        }
    }

    /// GET with bearer auth and a single retry.
    async fn get_text(&self, url: &str, token: &str) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
                debug!(url, "retrying forge request");
            }
            let result = self
                .http
                .get(url)
                .bearer_auth(token)
                .header("Accept", "application/vnd.github+json")
                .send()
                .await
                .and_then(reqwest::Response::error_for_status);
            match result {
                Ok(response) => {
                    return response
                        .text()
                        .await
                        .map_err(|e| ForgeError::Http(e.to_string()))
                }
                Err(e) => last_err = Some(ForgeError::Http(e.to_string())),
            }
        }
        Err(last_err.expect("at least one attempt"))
    }

    async fn graphql(&self, api_key: &str, query: &str) -> Result<String> {
        let body = serde_json::json!({ "query": query });
        let response = self
            .http
            .post(TRACKER_API)
            .header("Authorization", api_key)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ForgeError::Http(e.to_string()))?;
        response
            .text()
            .await
            .map_err(|e| ForgeError::Http(e.to_string()))
    }

    pub async fn list_issues(&self, token: &str, repo: &str) -> Result<Vec<ForgeIssue>> {
        let text = self
            .get_text(&format!("{FORGE_API}/repos/{repo}/issues?state=open"), token)
            .await?;
        parse_issues(&text)
    }

    pub async fn get_issue(&self, token: &str, repo: &str, number: u64) -> Result<ForgeIssue> {
        let text = self
            .get_text(&format!("{FORGE_API}/repos/{repo}/issues/{number}"), token)
            .await?;
        parse_issue(&text)
    }

    pub async fn list_repos(&self, token: &str) -> Result<Vec<ForgeRepo>> {
        let text = self
            .get_text(&format!("{FORGE_API}/user/repos?per_page=100"), token)
            .await?;
        parse_repos(&text)
    }

    pub async fn tracker_teams(&self, api_key: &str) -> Result<Vec<TrackerTeam>> {
        let text = self
            .graphql(api_key, "query { teams { nodes { id name key } } }")
            .await?;
        parse_teams(&text)
    }

    pub async fn tracker_projects(&self, api_key: &str) -> Result<Vec<TrackerProject>> {
        let text = self
            .graphql(api_key, "query { projects { nodes { id name } } }")
            .await?;
        parse_tracker_projects(&text)
    }

    pub async fn tracker_issues(&self, api_key: &str) -> Result<Vec<TrackerIssue>> {
        let text = self
            .graphql(
                api_key,
                "query { issues { nodes { id identifier title description createdAt state { name } } } }",
            )
            .await?;
        parse_tracker_issues(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forge_issues_translate_to_internal_shape() {
        let json = r#"[{
            "number": 42,
            "title": "Fix the flux capacitor",
            "body": "It fluxes wrong.",
            "state": "open",
            "labels": [{"name": "bug"}, {"name": "p1"}],
            "html_url": "https://github.com/acme/widgets/issues/42",
            "created_at": "2026-01-05T10:00:00Z",
            "updated_at": "2026-01-06T11:30:00Z",
            "extra_field_we_ignore": true
        }]"#;
        let issues = parse_issues(json).unwrap();
        assert_eq!(issues.len(), 1);
        let issue = &issues[0];
        assert_eq!(issue.number, 42);
        assert_eq!(issue.labels, vec!["bug", "p1"]);
        assert_eq!(issue.created_at.to_rfc3339(), "2026-01-05T10:00:00+00:00");

        // Internal shape serializes camelCased.
        let out = serde_json::to_value(issue).unwrap();
        assert!(out.get("createdAt").is_some());
        assert!(out.get("created_at").is_none());
    }

    #[test]
    fn forge_repos_translate() {
        let json = r#"[{
            "name": "widgets",
            "full_name": "acme/widgets",
            "private": true,
            "default_branch": "main",
            "forks": 3
        }]"#;
        let repos = parse_repos(json).unwrap();
        assert_eq!(repos[0].full_name, "acme/widgets");
        assert!(repos[0].private);
        assert_eq!(repos[0].default_branch, "main");
    }

    #[test]
    fn tracker_teams_come_from_graphql_envelope() {
        let json = r#"{"data": {"teams": {"nodes": [
            {"id": "team-1", "name": "Platform", "key": "PLT"}
        ]}}}"#;
        let teams = parse_teams(json).unwrap();
        assert_eq!(teams[0].key, "PLT");
    }

    #[test]
    fn tracker_issues_flatten_state() {
        let json = r#"{"data": {"issues": {"nodes": [{
            "id": "issue-1",
            "identifier": "PLT-12",
            "title": "Ship it",
            "description": null,
            "createdAt": "2026-02-01T09:00:00.000Z",
            "state": {"name": "In Progress"}
        }]}}}"#;
        let issues = parse_tracker_issues(json).unwrap();
        assert_eq!(issues[0].identifier, "PLT-12");
        assert_eq!(issues[0].state, "In Progress");
    }

    #[test]
    fn malformed_payloads_are_shape_errors() {
        assert!(matches!(parse_issues("{}"), Err(ForgeError::Shape(_))));
        assert!(matches!(parse_teams("{\"data\": {}}"), Err(ForgeError::Shape(_))));
    }
}
