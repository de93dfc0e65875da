//! Core types shared between the orchestrator daemon and the terminal daemon.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for projects, tasks, and terminals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Short identifier: the first 12 hex characters of a fresh UUID.
    /// Used for terminals, where the full form is unwieldy in shell titles.
    pub fn short() -> Self {
        let full = Uuid::new_v4().simple().to_string();
        Self(full[..12].to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Task lifecycle status, derived from artifacts on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    AiReview,
    HumanReview,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::AiReview => "ai_review",
            Self::HumanReview => "human_review",
            Self::Done => "done",
        }
    }
}

/// The kinds of agent executables the orchestrator supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    SpecCreation,
    Implementation,
    Qa,
    Roadmap,
    Ideation,
    MergeResolver,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecCreation => "spec_creation",
            Self::Implementation => "implementation",
            Self::Qa => "qa",
            Self::Roadmap => "roadmap",
            Self::Ideation => "ideation",
            Self::MergeResolver => "merge_resolver",
        }
    }
}

/// Memory backend selection for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackend {
    #[default]
    File,
    Graph,
}

impl MemoryBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Graph => "graph",
        }
    }
}

/// Severity of a single merge conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// File-level change classification in a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl FileChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
        }
    }
}

// --- Projects ---

/// Per-project notification toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NotificationFlags {
    pub on_task_complete: bool,
    pub on_task_failed: bool,
    pub on_review_needed: bool,
}

impl Default for NotificationFlags {
    fn default() -> Self {
        Self {
            on_task_complete: true,
            on_task_failed: true,
            on_review_needed: true,
        }
    }
}

/// Per-project settings stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectSettings {
    pub parallelism_enabled: bool,
    /// Worker count for parallel implementation runs. Always >= 1.
    pub max_workers: u32,
    pub preferred_model: String,
    pub memory_backend: MemoryBackend,
    pub tracker_sync_enabled: bool,
    pub notifications: NotificationFlags,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            parallelism_enabled: false,
            max_workers: 1,
            preferred_model: "opus".to_string(),
            memory_backend: MemoryBackend::File,
            tracker_sync_enabled: false,
            notifications: NotificationFlags::default(),
        }
    }
}

/// A registered project: one workstation-local repository the orchestrator
/// manages tasks for. Unique by absolute directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Id,
    pub name: String,
    /// Absolute path to the project directory.
    pub path: String,
    /// Relative path of the framework install inside the project, once found.
    pub framework_dir: Option<String>,
    pub settings: ProjectSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// --- Tasks ---

/// Execution progress snapshot for a task or a project-level agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProgress {
    pub phase: String,
    /// 0-100.
    pub percent: u8,
    pub message: String,
}

/// One unit of autonomous coding work.
///
/// `id` is the internal identifier; `spec_id` is the on-disk spec directory
/// name once the spec exists. They coincide after spec creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Id,
    pub project_id: Id,
    pub spec_id: Option<String>,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Planning chunks in plan order, flattened across phases.
    pub chunks: Vec<ChunkSummary>,
    /// Recent log lines from the supervised subprocess.
    pub logs: Vec<String>,
    pub progress: Option<ExecutionProgress>,
    /// Stored status said in-progress but no live subprocess was found at
    /// startup; the reviewer must restart or discard.
    pub stuck: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Chunk identity and status, flattened for task listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummary {
    pub id: String,
    pub description: String,
    pub status: crate::plan::ChunkStatus,
}

// --- Worktrees and merges ---

/// Cheap status snapshot for a task worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeStatus {
    pub exists: bool,
    pub path: Option<String>,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
    pub commit_count: usize,
}

impl WorktreeStatus {
    pub fn absent() -> Self {
        Self {
            exists: false,
            path: None,
            branch: None,
            base_branch: None,
            files_changed: 0,
            additions: 0,
            deletions: 0,
            commit_count: 0,
        }
    }
}

/// File-level entry in a worktree diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub path: String,
    pub status: FileChangeKind,
    pub additions: usize,
    pub deletions: usize,
}

/// Full diff of a task branch against its base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeDiff {
    pub summary: String,
    pub files: Vec<FileDiff>,
}

/// One classified conflict in a merge preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflict {
    pub path: String,
    /// Human-readable location, e.g. "lines 10-24".
    pub location: String,
    pub severity: ConflictSeverity,
    pub reason: String,
    pub strategy: String,
    pub auto_mergeable: bool,
}

/// How far the base branch moved since the task branch was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Divergence {
    pub commits_behind: usize,
    pub conflicting_files: Vec<String>,
}

/// Aggregate counters over a merge preview.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    pub total_files: usize,
    pub auto_mergeable: usize,
    pub ai_resolved: usize,
    pub human_required: usize,
}

/// Non-mutating classification of what a merge will encounter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePreview {
    pub files: Vec<String>,
    pub conflicts: Vec<MergeConflict>,
    pub stats: MergeStats,
    pub divergence: Option<Divergence>,
}

/// Outcome of a merge execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged,
    Staged,
}

/// Durable record of a task worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeRecord {
    pub task_id: Id,
    pub path: String,
    pub branch: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
}

// --- Terminals ---

/// Shell configuration for a terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConfig {
    pub shell: String,
    #[serde(default)]
    pub shell_args: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

/// Index entry for a terminal, as reported by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: Id,
    pub config: TerminalConfig,
    pub created_at: DateTime<Utc>,
    pub last_data_at: Option<DateTime<Utc>>,
    pub is_dead: bool,
    pub buffer_size: usize,
}

// --- Artifacts ---

/// The artifact files whose content changes drive task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Plan,
    QaReport,
    QaFixRequest,
    TaskLogs,
    MemoryEpisode,
    ProjectIndex,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::QaReport => "qa_report",
            Self::QaFixRequest => "qa_fix_request",
            Self::TaskLogs => "task_logs",
            Self::MemoryEpisode => "memory_episode",
            Self::ProjectIndex => "project_index",
        }
    }
}

/// An observed artifact change, forwarded by the watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEvent {
    pub project_id: Id,
    pub spec_id: String,
    pub kind: ArtifactKind,
    /// Raw file content at observation time; absent when the file vanished.
    pub content: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// An agent-written memory episode under `specs/<id>/memory/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEpisode {
    #[serde(rename = "type")]
    pub episode_type: String,
    pub timestamp: DateTime<Utc>,
    pub session_number: u32,
    #[serde(default)]
    pub insights: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let a = Id::new();
        let b = Id::new();
        assert_ne!(a, b);
    }

    #[test]
    fn short_id_is_twelve_hex_chars() {
        let id = Id::short();
        assert_eq!(id.0.len(), 12);
        assert!(id.0.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn task_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::AiReview).unwrap(),
            "\"ai_review\""
        );
    }

    #[test]
    fn conflict_severity_orders_by_escalation() {
        assert!(ConflictSeverity::None < ConflictSeverity::Low);
        assert!(ConflictSeverity::High < ConflictSeverity::Critical);
    }

    #[test]
    fn project_settings_default_has_one_worker() {
        let settings = ProjectSettings::default();
        assert_eq!(settings.max_workers, 1);
        assert!(!settings.parallelism_enabled);
        assert_eq!(settings.memory_backend, MemoryBackend::File);
    }

    #[test]
    fn terminal_config_round_trips_with_camel_case_fields() {
        let config = TerminalConfig {
            shell: "/bin/bash".to_string(),
            shell_args: vec!["-l".to_string()],
            cwd: "/tmp".to_string(),
            env: HashMap::new(),
            rows: 24,
            cols: 80,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("shellArgs"));
        let back: TerminalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn worktree_status_absent_reports_not_exists() {
        let status = WorktreeStatus::absent();
        assert!(!status.exists);
        assert_eq!(status.files_changed, 0);
    }
}
