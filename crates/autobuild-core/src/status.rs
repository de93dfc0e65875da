//! Task status derivation.
//!
//! Status is never stored. It is recomputed from three inputs on every read,
//! in strict precedence order:
//!
//! 1. a live supervised subprocess means `in_progress`;
//! 2. a QA verdict decides `done` / `human_review`;
//! 3. the plan's chunk statuses decide `ai_review` / `in_progress`;
//! 4. otherwise `backlog`.
//!
//! Deriving from artifacts means a crash mid-transition can never leave a
//! stored status contradicting the files on disk.

use crate::plan::ImplementationPlan;
use crate::qa::QaVerdict;
use crate::types::TaskStatus;

/// Derive a task's status from its observable inputs.
pub fn derive_status(
    process_alive: bool,
    qa_verdict: Option<QaVerdict>,
    plan: Option<&ImplementationPlan>,
) -> TaskStatus {
    if process_alive {
        return TaskStatus::InProgress;
    }

    match qa_verdict {
        Some(QaVerdict::Approved) => return TaskStatus::Done,
        Some(QaVerdict::Rejected) => return TaskStatus::HumanReview,
        None => {}
    }

    if let Some(plan) = plan {
        if plan.all_completed() {
            return TaskStatus::AiReview;
        }
        if plan.any_started() {
            return TaskStatus::InProgress;
        }
    }

    TaskStatus::Backlog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ImplementationPlan;

    fn plan(statuses: &[&str]) -> ImplementationPlan {
        let chunks: Vec<String> = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| {
                format!(r#"{{"id": "c{i}", "description": "d", "status": "{s}"}}"#)
            })
            .collect();
        let doc = format!(
            r#"{{"feature": "X", "phases": [{{"number": 1, "name": "P", "chunks": [{}]}}]}}"#,
            chunks.join(",")
        );
        ImplementationPlan::parse(&doc).unwrap()
    }

    #[test]
    fn live_process_dominates_everything() {
        let p = plan(&["completed"]);
        assert_eq!(
            derive_status(true, Some(QaVerdict::Approved), Some(&p)),
            TaskStatus::InProgress
        );
    }

    #[test]
    fn qa_verdict_beats_plan_state() {
        let p = plan(&["completed"]);
        assert_eq!(
            derive_status(false, Some(QaVerdict::Approved), Some(&p)),
            TaskStatus::Done
        );
        assert_eq!(
            derive_status(false, Some(QaVerdict::Rejected), Some(&p)),
            TaskStatus::HumanReview
        );
    }

    #[test]
    fn completed_plan_means_ai_review() {
        let p = plan(&["completed", "completed"]);
        assert_eq!(derive_status(false, None, Some(&p)), TaskStatus::AiReview);
    }

    #[test]
    fn partially_started_plan_means_in_progress() {
        for state in ["in_progress", "completed", "failed"] {
            let p = plan(&[state, "pending"]);
            assert_eq!(
                derive_status(false, None, Some(&p)),
                TaskStatus::InProgress,
                "state {state}"
            );
        }
    }

    #[test]
    fn untouched_plan_means_backlog() {
        let p = plan(&["pending", "pending"]);
        assert_eq!(derive_status(false, None, Some(&p)), TaskStatus::Backlog);
    }

    #[test]
    fn no_plan_means_backlog() {
        assert_eq!(derive_status(false, None, None), TaskStatus::Backlog);
    }

    #[test]
    fn derivation_is_deterministic() {
        let p = plan(&["completed", "failed"]);
        let first = derive_status(false, None, Some(&p));
        let second = derive_status(false, None, Some(&p));
        assert_eq!(first, second);
    }
}
