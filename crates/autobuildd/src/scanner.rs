//! Spec directory scanning.
//!
//! Task listings are built by enumerating spec directories and deriving
//! status from their artifacts. Nothing here is cached: a scan reflects the
//! filesystem at call time. Unreadable or malformed artifacts degrade the
//! task (no chunks, empty description) and are logged; they never fail the
//! scan.

use std::collections::HashSet;
use std::path::Path;

use autobuild_core::plan::ImplementationPlan;
use autobuild_core::qa;
use autobuild_core::status::derive_status;
use autobuild_core::types::{Id, Task};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::layout;

/// Scan every spec directory under a project's framework install.
///
/// `live` holds the spec ids with a supervised subprocess currently running;
/// `stuck` holds spec ids flagged by startup reconciliation.
pub fn scan_tasks(
    project_id: &Id,
    framework_dir: &Path,
    live: &HashSet<String>,
    stuck: &HashSet<String>,
) -> Vec<Task> {
    let specs_root = layout::specs_root(framework_dir);
    let Ok(entries) = std::fs::read_dir(&specs_root) else {
        return Vec::new();
    };

    let mut tasks = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        tasks.push(scan_one(project_id, &path, &name, live, stuck));
    }
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    tasks
}

/// Build one task record from a spec directory.
pub fn scan_one(
    project_id: &Id,
    spec_dir: &Path,
    spec_id: &str,
    live: &HashSet<String>,
    stuck: &HashSet<String>,
) -> Task {
    let plan = read_plan(spec_dir, spec_id);
    let qa_verdict = std::fs::read_to_string(layout::qa_report_path(spec_dir))
        .ok()
        .and_then(|content| qa::detect_verdict(&content));
    let process_alive = live.contains(spec_id);

    let status = derive_status(process_alive, qa_verdict, plan.as_ref());

    let title = plan
        .as_ref()
        .map(|p| p.feature.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| prettify(spec_id));
    let description = std::fs::read_to_string(layout::spec_doc_path(spec_dir))
        .ok()
        .and_then(|content| extract_overview(&content))
        .unwrap_or_default();
    let chunks = plan.as_ref().map(ImplementationPlan::chunk_summaries).unwrap_or_default();

    let (created_at, updated_at) = dir_timestamps(spec_dir);

    Task {
        id: Id::from_string(spec_id),
        project_id: project_id.clone(),
        spec_id: Some(spec_id.to_string()),
        title,
        description,
        status,
        chunks,
        logs: Vec::new(),
        progress: None,
        stuck: stuck.contains(spec_id),
        created_at,
        updated_at,
    }
}

fn read_plan(spec_dir: &Path, spec_id: &str) -> Option<ImplementationPlan> {
    let path = layout::plan_path(spec_dir);
    if !path.exists() {
        return None;
    }
    match ImplementationPlan::load(&path) {
        Ok(plan) => Some(plan),
        Err(e) => {
            warn!(spec_id, error = %e, "skipping malformed implementation plan");
            None
        }
    }
}

/// Extract the paragraph under the `## Overview` heading.
pub fn extract_overview(content: &str) -> Option<String> {
    let mut in_overview = false;
    let mut lines = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            if in_overview {
                break;
            }
            in_overview = heading.trim().eq_ignore_ascii_case("overview");
            continue;
        }
        if trimmed.starts_with('#') && in_overview {
            break;
        }
        if in_overview && !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    if lines.is_empty() {
        return None;
    }
    Some(lines.join(" "))
}

/// Turn a spec id back into a displayable title.
fn prettify(spec_id: &str) -> String {
    spec_id
        .split('-')
        .filter(|s| !s.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn dir_timestamps(dir: &Path) -> (DateTime<Utc>, DateTime<Utc>) {
    let metadata = std::fs::metadata(dir).ok();
    let modified = metadata
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map_or_else(Utc::now, DateTime::from);
    let created = metadata
        .as_ref()
        .and_then(|m| m.created().ok())
        .map_or(modified, DateTime::from);
    (created, modified)
}
