//! Shared types and artifact codecs for the Auto-Build control plane.
//!
//! This crate carries no async machinery and no process management: it is the
//! data model (projects, tasks, worktrees, terminals), the artifact parsers
//! (plans, QA reports, env files), the status derivation, and the event
//! vocabulary shared by the orchestrator daemon and the terminal daemon.

pub mod envfile;
pub mod error;
pub mod events;
pub mod plan;
pub mod progress;
pub mod qa;
pub mod settings;
pub mod status;
pub mod types;

pub use envfile::EnvConfig;
pub use error::{CoreError, CoreResult};
pub use events::{CoreEvent, UpdateStage};
pub use plan::{Chunk, ChunkStatus, ImplementationPlan, Phase};
pub use qa::QaVerdict;
pub use settings::Settings;
pub use status::derive_status;
pub use types::{
    AgentKind, ArtifactEvent, ArtifactKind, ChunkSummary, ConflictSeverity, Divergence,
    ExecutionProgress, FileChangeKind, FileDiff, Id, MemoryBackend, MergeConflict, MergeOutcome,
    MergePreview, MergeStats, Project, ProjectSettings, Task, TaskStatus, TerminalConfig,
    TerminalInfo, WorktreeDiff, WorktreeRecord, WorktreeStatus,
};
