//! Implementation plan parsing.
//!
//! Agents write `implementation_plan.json` into the spec directory; the
//! orchestrator reads it to derive task titles, chunk lists, and status.
//! Parsing is tolerant: unknown fields are ignored, and malformed documents
//! produce an error the caller downgrades to a log entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::types::ChunkSummary;

/// Status of one planning chunk, written by the implementation agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Optional verification descriptor attached to a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub command: Option<String>,
}

/// One unit of work inside a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

/// A numbered phase with its dependency set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub depends_on: BTreeSet<u32>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

/// The full plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationPlan {
    pub feature: String,
    #[serde(default)]
    pub phases: Vec<Phase>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed plan document: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ImplementationPlan {
    /// Load a plan from disk.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content)?)
    }

    /// Parse a plan from JSON content.
    pub fn parse(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// All chunks flattened in phase order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.phases.iter().flat_map(|p| p.chunks.iter())
    }

    /// Chunk summaries for task listings.
    pub fn chunk_summaries(&self) -> Vec<ChunkSummary> {
        self.chunks()
            .map(|c| ChunkSummary {
                id: c.id.clone(),
                description: c.description.clone(),
                status: c.status,
            })
            .collect()
    }

    /// True when the plan has chunks and every one is completed.
    pub fn all_completed(&self) -> bool {
        let mut any = false;
        for chunk in self.chunks() {
            any = true;
            if chunk.status != ChunkStatus::Completed {
                return false;
            }
        }
        any
    }

    /// True when any chunk has left the pending state.
    pub fn any_started(&self) -> bool {
        self.chunks().any(|c| c.status != ChunkStatus::Pending)
    }

    /// (completed, total) chunk counts.
    pub fn completion(&self) -> (usize, usize) {
        let mut completed = 0;
        let mut total = 0;
        for chunk in self.chunks() {
            total += 1;
            if chunk.status == ChunkStatus::Completed {
                completed += 1;
            }
        }
        (completed, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "feature": "Add export",
        "phases": [
            {
                "number": 1,
                "name": "Core",
                "depends_on": [],
                "chunks": [
                    {"id": "c1", "description": "Write exporter", "status": "completed"},
                    {"id": "c2", "description": "Wire CLI", "status": "pending"}
                ]
            },
            {
                "number": 2,
                "name": "Polish",
                "depends_on": [1],
                "chunks": [
                    {"id": "c3", "description": "Docs", "status": "pending",
                     "verification": {"type": "command", "command": "cargo test"}}
                ]
            }
        ]
    }"#;

    #[test]
    fn parses_phases_and_chunks() {
        let plan = ImplementationPlan::parse(SAMPLE).unwrap();
        assert_eq!(plan.feature, "Add export");
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.chunks().count(), 3);
        assert!(plan.phases[1].depends_on.contains(&1));
        assert_eq!(
            plan.phases[1].chunks[0].verification.as_ref().unwrap().kind,
            "command"
        );
    }

    #[test]
    fn tolerates_unknown_fields() {
        let content = r#"{"feature": "X", "phases": [], "workflow_type": "feature"}"#;
        let plan = ImplementationPlan::parse(content).unwrap();
        assert_eq!(plan.feature, "X");
    }

    #[test]
    fn missing_status_defaults_to_pending() {
        let content = r#"{
            "feature": "X",
            "phases": [{"number": 1, "name": "P", "chunks": [
                {"id": "c1", "description": "d"}
            ]}]
        }"#;
        let plan = ImplementationPlan::parse(content).unwrap();
        assert_eq!(plan.chunks().next().unwrap().status, ChunkStatus::Pending);
    }

    #[test]
    fn all_completed_requires_every_chunk() {
        let plan = ImplementationPlan::parse(SAMPLE).unwrap();
        assert!(!plan.all_completed());

        let done = SAMPLE.replace("pending", "completed");
        let plan = ImplementationPlan::parse(&done).unwrap();
        assert!(plan.all_completed());
    }

    #[test]
    fn all_completed_is_false_for_empty_plan() {
        let plan = ImplementationPlan::parse(r#"{"feature": "X", "phases": []}"#).unwrap();
        assert!(!plan.all_completed());
    }

    #[test]
    fn any_started_detects_progress() {
        let plan = ImplementationPlan::parse(SAMPLE).unwrap();
        assert!(plan.any_started());

        let fresh = SAMPLE.replace("completed", "pending");
        let plan = ImplementationPlan::parse(&fresh).unwrap();
        assert!(!plan.any_started());
    }

    #[test]
    fn completion_counts_chunks() {
        let plan = ImplementationPlan::parse(SAMPLE).unwrap();
        assert_eq!(plan.completion(), (1, 3));
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(ImplementationPlan::parse("{not json").is_err());
        assert!(ImplementationPlan::parse(r#"{"phases": []}"#).is_err());
    }
}
