//! QA report verdict detection.
//!
//! The QA agent writes `qa_report.md` into the spec directory. The verdict is
//! carried by well-known tokens rather than structure, so detection is a
//! case-sensitive token scan. Rejection tokens win over approval tokens: a
//! report that says FAILED further down must not be masked by an earlier
//! PASSED from a previous round.

/// Verdict recorded in a QA report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaVerdict {
    Approved,
    Rejected,
}

const APPROVAL_TOKENS: &[&str] = &["PASSED", "APPROVED"];
const REJECTION_TOKENS: &[&str] = &["REJECTED", "FAILED"];

/// Scan QA report content for a verdict. Returns `None` when no token is
/// present (report still being written, or free-form notes only).
pub fn detect_verdict(content: &str) -> Option<QaVerdict> {
    let rejected = REJECTION_TOKENS.iter().any(|t| contains_token(content, t));
    if rejected {
        return Some(QaVerdict::Rejected);
    }
    let approved = APPROVAL_TOKENS.iter().any(|t| contains_token(content, t));
    approved.then_some(QaVerdict::Approved)
}

/// Token match bounded by non-alphanumeric characters, so that e.g.
/// "BYPASSED" does not read as an approval.
fn contains_token(content: &str, token: &str) -> bool {
    let bytes = content.as_bytes();
    let mut start = 0;
    while let Some(pos) = content[start..].find(token) {
        let at = start + pos;
        let before_ok = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
        let end = at + token.len();
        let after_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = at + token.len();
    }
    false
}

/// Render an approval report for reviewer-initiated approval.
pub fn approval_report(task_title: &str) -> String {
    format!("# QA Report\n\nTask: {task_title}\n\nStatus: APPROVED\n\nApproved by reviewer.\n")
}

/// Render a fix request carrying reviewer feedback.
pub fn fix_request(feedback: &str) -> String {
    format!("# QA Fix Request\n\nStatus: REJECTED\n\n## Feedback\n\n{feedback}\n")
}
