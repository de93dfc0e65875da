//! Framework `.env` parsing and generation.
//!
//! One assignment per line; blank and `#`-prefixed lines are ignored; values
//! may be wrapped in matching single or double quotes. Generation is
//! table-driven from [`EnvConfig`] so that parse(generate(cfg)) == cfg for
//! every recognized key; absent optional keys are emitted as commented
//! placeholders, which the parser never turns into live assignments.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("failed to read env file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid env line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Typed projection of the recognized framework environment keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Claude credential; required for agent execution.
    pub anthropic_api_key: Option<String>,
    /// Overrides the default model choice.
    pub model: Option<String>,

    // Issue tracker sync
    pub linear_api_key: Option<String>,
    pub linear_team_id: Option<String>,
    pub linear_project_id: Option<String>,
    pub linear_realtime_sync: Option<bool>,

    // Source forge integration
    pub github_token: Option<String>,
    pub github_repo: Option<String>,
    pub github_auto_sync: Option<bool>,

    // Graph memory backend
    pub memory_enabled: Option<bool>,
    pub memory_llm_provider: Option<String>,
    pub memory_embedder_provider: Option<String>,
    pub openai_api_key: Option<String>,
    pub voyage_api_key: Option<String>,
    pub neo4j_host: Option<String>,
    pub neo4j_port: Option<u16>,
    pub neo4j_password: Option<String>,
    pub neo4j_database: Option<String>,

    /// Forwarded to agents; controls their progress rendering.
    pub fancy_ui: Option<bool>,
}

/// One row of the key table: the env key, a human hint for the placeholder
/// comment, and accessors into [`EnvConfig`].
struct KeyRow {
    key: &'static str,
    hint: &'static str,
    get: fn(&EnvConfig) -> Option<String>,
    set: fn(&mut EnvConfig, &str) -> Result<(), EnvError>,
}

macro_rules! string_row {
    ($key:literal, $hint:literal, $field:ident) => {
        KeyRow {
            key: $key,
            hint: $hint,
            get: |c| c.$field.clone(),
            set: |c, v| {
                c.$field = Some(v.to_string());
                Ok(())
            },
        }
    };
}

macro_rules! bool_row {
    ($key:literal, $hint:literal, $field:ident) => {
        KeyRow {
            key: $key,
            hint: $hint,
            get: |c| c.$field.map(|b| b.to_string()),
            set: |c, v| {
                c.$field = Some(parse_bool($key, v)?);
                Ok(())
            },
        }
    };
}

const KEY_TABLE: &[KeyRow] = &[
    string_row!("ANTHROPIC_API_KEY", "Claude credential used by all agents", anthropic_api_key),
    string_row!("AUTO_BUILD_MODEL", "override the default model tag", model),
    string_row!("LINEAR_API_KEY", "issue tracker API key", linear_api_key),
    string_row!("LINEAR_TEAM_ID", "issue tracker team", linear_team_id),
    string_row!("LINEAR_PROJECT_ID", "issue tracker project", linear_project_id),
    bool_row!("LINEAR_REALTIME_SYNC", "push task updates to the tracker as they happen", linear_realtime_sync),
    string_row!("GITHUB_TOKEN", "source forge token", github_token),
    string_row!("GITHUB_REPO", "owner/name slug", github_repo),
    bool_row!("GITHUB_AUTO_SYNC", "sync issues automatically", github_auto_sync),
    bool_row!("MEMORY_ENABLED", "enable the graph memory backend", memory_enabled),
    string_row!("MEMORY_LLM_PROVIDER", "LLM provider for memory extraction", memory_llm_provider),
    string_row!("MEMORY_EMBEDDER_PROVIDER", "embedding provider for memory search", memory_embedder_provider),
    string_row!("OPENAI_API_KEY", "provider key for openai-backed memory", openai_api_key),
    string_row!("VOYAGE_API_KEY", "provider key for voyage embeddings", voyage_api_key),
    string_row!("NEO4J_HOST", "graph database host", neo4j_host),
    KeyRow {
        key: "NEO4J_PORT",
        hint: "graph database port",
        get: |c| c.neo4j_port.map(|p| p.to_string()),
        set: |c, v| {
            c.neo4j_port = Some(v.parse().map_err(|_| EnvError::InvalidInt {
                key: "NEO4J_PORT".to_string(),
                value: v.to_string(),
            })?);
            Ok(())
        },
    },
    string_row!("NEO4J_PASSWORD", "graph database password", neo4j_password),
    string_row!("NEO4J_DATABASE", "graph database name", neo4j_database),
    bool_row!("AUTO_BUILD_FANCY_UI", "richer agent progress output", fancy_ui),
];

/// Parse env content into a raw key/value map. Commented lines never
/// contribute keys.
pub fn parse_env_content(content: &str) -> Result<BTreeMap<String, String>, EnvError> {
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(EnvError::InvalidLine(line.to_string()));
        };
        map.insert(key.trim().to_string(), unquote(value.trim()));
    }
    Ok(map)
}

/// Read and parse an env file from disk.
pub fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>, EnvError> {
    let content = std::fs::read_to_string(path)?;
    parse_env_content(&content)
}

impl EnvConfig {
    /// Typed projection of a raw key map. Unrecognized keys are ignored.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, EnvError> {
        let mut config = Self::default();
        for row in KEY_TABLE {
            if let Some(value) = map.get(row.key) {
                (row.set)(&mut config, value)?;
            }
        }
        Ok(config)
    }

    /// Parse env content straight into the typed form.
    pub fn parse(content: &str) -> Result<Self, EnvError> {
        Self::from_map(&parse_env_content(content)?)
    }

    /// Load the typed form from disk; a missing file yields the default.
    pub fn load(path: &Path) -> Result<Self, EnvError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_map(&parse_env_file(path)?)
    }

    /// Generate env file content. Present keys become live assignments;
    /// absent keys become commented placeholders so the file documents the
    /// full surface without defining anything extra.
    pub fn generate(&self) -> String {
        let mut out = String::from("# Auto-Build environment\n");
        for row in KEY_TABLE {
            out.push('\n');
            out.push_str(&format!("# {}\n", row.hint));
            match (row.get)(self) {
                Some(value) => {
                    if needs_quoting(&value) {
                        out.push_str(&format!("{}=\"{}\"\n", row.key, value));
                    } else {
                        out.push_str(&format!("{}={}\n", row.key, value));
                    }
                }
                None => out.push_str(&format!("# {}=\n", row.key)),
            }
        }
        out
    }

    /// Flatten the present keys into environment pairs for subprocess spawns.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        KEY_TABLE
            .iter()
            .filter_map(|row| (row.get)(self).map(|v| (row.key.to_string(), v)))
            .collect()
    }
}

fn unquote(value: &str) -> String {
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        return value[1..value.len() - 1].to_string();
    }
    value.to_string()
}

fn needs_quoting(value: &str) -> bool {
    value.contains(' ') || value.contains('#')
}

fn parse_bool(key: &str, value: &str) -> Result<bool, EnvError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(EnvError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
