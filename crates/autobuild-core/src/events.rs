//! Event stream types.
//!
//! Everything asynchronous the backend wants a frontend to see flows through
//! one append-only stream of [`CoreEvent`]. Events are ordered per
//! (task, terminal, project) key; across keys order is unspecified.

use serde::{Deserialize, Serialize};

use crate::types::{ExecutionProgress, Id, TaskStatus};

/// Stage of a framework update download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStage {
    Checking,
    Downloading,
    Extracting,
    Complete,
    Error,
}

impl UpdateStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// All event kinds emitted on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum CoreEvent {
    #[serde(rename = "task.log")]
    TaskLog { task_id: Id, line: String },
    #[serde(rename = "task.error")]
    TaskError { task_id: Id, message: String },
    #[serde(rename = "task.status")]
    TaskStatus { task_id: Id, status: TaskStatus },
    #[serde(rename = "task.progress")]
    TaskProgress {
        task_id: Id,
        progress: ExecutionProgress,
    },

    #[serde(rename = "terminal.output")]
    TerminalOutput { terminal_id: Id, bytes: String },
    #[serde(rename = "terminal.exit")]
    TerminalExit {
        terminal_id: Id,
        exit_code: Option<i32>,
        signal: Option<String>,
    },
    #[serde(rename = "terminal.titleChange")]
    TerminalTitleChange { terminal_id: Id, title: String },

    #[serde(rename = "roadmap.progress")]
    RoadmapProgress {
        project_id: Id,
        progress: ExecutionProgress,
    },
    #[serde(rename = "roadmap.complete")]
    RoadmapComplete { project_id: Id },
    #[serde(rename = "roadmap.error")]
    RoadmapError { project_id: Id, message: String },

    #[serde(rename = "ideation.progress")]
    IdeationProgress {
        project_id: Id,
        progress: ExecutionProgress,
    },
    #[serde(rename = "ideation.complete")]
    IdeationComplete { project_id: Id },
    #[serde(rename = "ideation.error")]
    IdeationError { project_id: Id, message: String },

    #[serde(rename = "framework-update.progress")]
    FrameworkUpdateProgress {
        stage: UpdateStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
        message: String,
    },

    #[serde(rename = "github.investigation.progress")]
    GithubInvestigationProgress {
        project_id: Id,
        progress: ExecutionProgress,
    },
    #[serde(rename = "github.investigation.complete")]
    GithubInvestigationComplete { project_id: Id },
    #[serde(rename = "github.investigation.error")]
    GithubInvestigationError { project_id: Id, message: String },
}

impl CoreEvent {
    /// The stream kind name, as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskLog { .. } => "task.log",
            Self::TaskError { .. } => "task.error",
            Self::TaskStatus { .. } => "task.status",
            Self::TaskProgress { .. } => "task.progress",
            Self::TerminalOutput { .. } => "terminal.output",
            Self::TerminalExit { .. } => "terminal.exit",
            Self::TerminalTitleChange { .. } => "terminal.titleChange",
            Self::RoadmapProgress { .. } => "roadmap.progress",
            Self::RoadmapComplete { .. } => "roadmap.complete",
            Self::RoadmapError { .. } => "roadmap.error",
            Self::IdeationProgress { .. } => "ideation.progress",
            Self::IdeationComplete { .. } => "ideation.complete",
            Self::IdeationError { .. } => "ideation.error",
            Self::FrameworkUpdateProgress { .. } => "framework-update.progress",
            Self::GithubInvestigationProgress { .. } => "github.investigation.progress",
            Self::GithubInvestigationComplete { .. } => "github.investigation.complete",
            Self::GithubInvestigationError { .. } => "github.investigation.error",
        }
    }

    /// The ordering key this event belongs to.
    pub fn key(&self) -> &Id {
        match self {
            Self::TaskLog { task_id, .. }
            | Self::TaskError { task_id, .. }
            | Self::TaskStatus { task_id, .. }
            | Self::TaskProgress { task_id, .. } => task_id,
            Self::TerminalOutput { terminal_id, .. }
            | Self::TerminalExit { terminal_id, .. }
            | Self::TerminalTitleChange { terminal_id, .. } => terminal_id,
            Self::RoadmapProgress { project_id, .. }
            | Self::RoadmapComplete { project_id }
            | Self::RoadmapError { project_id, .. }
            | Self::IdeationProgress { project_id, .. }
            | Self::IdeationComplete { project_id }
            | Self::IdeationError { project_id, .. }
            | Self::GithubInvestigationProgress { project_id, .. }
            | Self::GithubInvestigationComplete { project_id }
            | Self::GithubInvestigationError { project_id, .. } => project_id,
            Self::FrameworkUpdateProgress { .. } => {
                static GLOBAL: std::sync::OnceLock<Id> = std::sync::OnceLock::new();
                GLOBAL.get_or_init(|| Id::from_string("framework"))
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_dotted_kind_tags() {
        let event = CoreEvent::TaskLog {
            task_id: Id::from_string("t1"),
            line: "hello".to_string(),
        };
        let json = event.to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["kind"], "task.log");
        assert_eq!(parsed["taskId"], "t1");
        assert_eq!(parsed["line"], "hello");
    }

    #[test]
    fn update_progress_omits_absent_percent() {
        let event = CoreEvent::FrameworkUpdateProgress {
            stage: UpdateStage::Checking,
            percent: None,
            message: "checking for updates".to_string(),
        };
        let json = event.to_json().unwrap();
        assert!(!json.contains("percent"));
        assert!(json.contains("\"stage\":\"checking\""));
    }

    #[test]
    fn kind_matches_wire_tag_for_every_variant() {
        let samples = vec![
            CoreEvent::TaskStatus {
                task_id: Id::from_string("t"),
                status: TaskStatus::Done,
            },
            CoreEvent::TerminalExit {
                terminal_id: Id::from_string("x"),
                exit_code: Some(0),
                signal: None,
            },
            CoreEvent::RoadmapComplete {
                project_id: Id::from_string("p"),
            },
            CoreEvent::IdeationError {
                project_id: Id::from_string("p"),
                message: "boom".to_string(),
            },
            CoreEvent::GithubInvestigationComplete {
                project_id: Id::from_string("p"),
            },
        ];
        for event in samples {
            let json = event.to_json().unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed["kind"], event.kind());
        }
    }

    #[test]
    fn events_round_trip() {
        let event = CoreEvent::TerminalOutput {
            terminal_id: Id::from_string("abc"),
            bytes: "ls -la\r\n".to_string(),
        };
        let json = event.to_json().unwrap();
        let back: CoreEvent = serde_json::from_str(&json).unwrap();
        match back {
            CoreEvent::TerminalOutput { terminal_id, bytes } => {
                assert_eq!(terminal_id.as_ref(), "abc");
                assert_eq!(bytes, "ls -la\r\n");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn ordering_key_follows_the_subject() {
        let event = CoreEvent::TaskProgress {
            task_id: Id::from_string("t9"),
            progress: ExecutionProgress {
                phase: "coding".to_string(),
                percent: 50,
                message: String::new(),
            },
        };
        assert_eq!(event.key().as_ref(), "t9");
    }
}
