//! Per-project filesystem layout.
//!
//! Everything the orchestrator reads or writes inside a project lives under
//! the framework directory: `.auto-build` preferred, plain `auto-build`
//! accepted for repositories that cannot use hidden directories.

use std::path::{Path, PathBuf};

/// Candidate framework directory names, in preference order.
pub const FRAMEWORK_DIR_NAMES: &[&str] = &[".auto-build", "auto-build"];

/// File names the watcher and scanner care about.
pub const PLAN_FILE: &str = "implementation_plan.json";
pub const QA_REPORT_FILE: &str = "qa_report.md";
pub const QA_FIX_REQUEST_FILE: &str = "qa_fix_request.md";
pub const SPEC_DOC_FILE: &str = "spec.md";
pub const VERSION_FILE: &str = "VERSION";
pub const VERSION_METADATA_FILE: &str = ".version.json";
pub const ENV_FILE: &str = ".env";
pub const ENV_EXAMPLE_FILE: &str = ".env.example";

/// Find an existing framework directory inside a project.
pub fn find_framework_dir(project_dir: &Path) -> Option<PathBuf> {
    FRAMEWORK_DIR_NAMES
        .iter()
        .map(|name| project_dir.join(name))
        .find(|candidate| candidate.is_dir())
}

/// The framework directory a fresh install should use.
pub fn preferred_framework_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(FRAMEWORK_DIR_NAMES[0])
}

/// The spec root: `<framework>/specs`.
pub fn specs_root(framework_dir: &Path) -> PathBuf {
    framework_dir.join("specs")
}

/// One task's spec directory: `<framework>/specs/<spec-id>`.
pub fn spec_dir(framework_dir: &Path, spec_id: &str) -> PathBuf {
    specs_root(framework_dir).join(spec_id)
}

pub fn plan_path(spec_dir: &Path) -> PathBuf {
    spec_dir.join(PLAN_FILE)
}

pub fn qa_report_path(spec_dir: &Path) -> PathBuf {
    spec_dir.join(QA_REPORT_FILE)
}

pub fn qa_fix_request_path(spec_dir: &Path) -> PathBuf {
    spec_dir.join(QA_FIX_REQUEST_FILE)
}

pub fn spec_doc_path(spec_dir: &Path) -> PathBuf {
    spec_dir.join(SPEC_DOC_FILE)
}

pub fn memory_dir(spec_dir: &Path) -> PathBuf {
    spec_dir.join("memory")
}

pub fn env_path(framework_dir: &Path) -> PathBuf {
    framework_dir.join(ENV_FILE)
}

pub fn roadmap_path(framework_dir: &Path) -> PathBuf {
    framework_dir.join("roadmap").join("roadmap.json")
}

pub fn ideation_path(framework_dir: &Path) -> PathBuf {
    framework_dir.join("ideation").join("ideation.json")
}

pub fn project_index_path(framework_dir: &Path) -> PathBuf {
    framework_dir.join("project_index.json")
}

/// Spec directory containment: true when `candidate` is lexically under the
/// spec root. Task spec directories must never escape it.
pub fn is_under_specs_root(framework_dir: &Path, candidate: &Path) -> bool {
    let root = specs_root(framework_dir);
    candidate.starts_with(&root) && candidate != root
}

/// Sanitize a title into a spec directory name: lowercase alphanumerics and
/// hyphens, collapsed.
pub fn slugify(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
