//! Worktree manager.
//!
//! Every task gets an isolated working copy on its own branch, created
//! just-in-time for the first implementation run. The manager owns the
//! durable worktree records, the read-only introspection (status, diff,
//! merge preview) and the merge protocol that integrates finished work back
//! into the project. Any mid-merge failure rolls the project tree back and
//! keeps the task worktree intact, so merges can be retried.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::{Path, PathBuf};

use autobuild_core::types::{
    ConflictSeverity, Divergence, FileDiff, Id, MergeConflict, MergeOutcome, MergePreview,
    MergeStats, Project, WorktreeDiff, WorktreeRecord, WorktreeStatus,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::gitops;

/// Branch namespace for task worktrees; the task id keeps branches disjoint.
const BRANCH_PREFIX: &str = "auto-build/";

/// Orphaned worktrees younger than this survive a startup sweep.
const ORPHAN_GRACE_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("git error: {0}")]
    Git(#[from] gitops::GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed worktree records: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no worktree for task {0}")]
    NoWorktree(String),
    #[error("project working tree is dirty; commit or stash before merging")]
    DirtyProject,
    #[error("project is on branch '{current}', expected base branch '{base}'")]
    WrongBranch { current: String, base: String },
    #[error("conflict resolution failed for {path}: {reason}")]
    ResolutionFailed { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// Produces resolved file content for conflicts the line merge cannot
/// handle. The production implementation shells out to the merge agent.
pub trait ConflictResolver: Send + Sync {
    fn resolve(
        &self,
        path: &str,
        base: Option<&str>,
        ours: &str,
        theirs: &str,
    ) -> std::result::Result<String, String>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordsDoc {
    records: Vec<WorktreeRecord>,
}

/// Durable worktree records plus the operations over them.
#[derive(Debug)]
pub struct WorktreeManager {
    /// Root for worktree checkouts: `<data_dir>/worktrees/<project>/<task>`.
    worktrees_dir: PathBuf,
    records_path: PathBuf,
    records: Mutex<HashMap<Id, WorktreeRecord>>,
}

impl WorktreeManager {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let records_path = data_dir.join("worktrees.json");
        let mut records = HashMap::new();
        if records_path.exists() {
            let content = std::fs::read_to_string(&records_path)?;
            let doc: RecordsDoc = serde_json::from_str(&content)?;
            for record in doc.records {
                records.insert(record.task_id.clone(), record);
            }
        }
        Ok(Self {
            worktrees_dir: data_dir.join("worktrees"),
            records_path,
            records: Mutex::new(records),
        })
    }

    fn persist(&self, records: &HashMap<Id, WorktreeRecord>) -> Result<()> {
        if let Some(parent) = self.records_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut doc = RecordsDoc {
            records: records.values().cloned().collect(),
        };
        doc.records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let tmp = self.records_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        std::fs::rename(&tmp, &self.records_path)?;
        Ok(())
    }

    pub fn branch_for(task_id: &Id) -> String {
        format!("{BRANCH_PREFIX}{task_id}")
    }

    pub async fn record(&self, task_id: &Id) -> Option<WorktreeRecord> {
        self.records.lock().await.get(task_id).cloned()
    }

    /// Create the task worktree if it does not exist yet.
    pub async fn ensure(&self, project: &Project, task_id: &Id) -> Result<WorktreeRecord> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(task_id) {
            if Path::new(&existing.path).exists() {
                return Ok(existing.clone());
            }
        }

        let project_dir = Path::new(&project.path);
        let base_branch = gitops::detect_default_branch(project_dir)?;
        let branch = Self::branch_for(task_id);
        let path = self
            .worktrees_dir
            .join(project.id.as_ref())
            .join(task_id.as_ref());

        gitops::add_worktree(project_dir, &path, &branch, &base_branch)?;

        let record = WorktreeRecord {
            task_id: task_id.clone(),
            path: path.display().to_string(),
            branch,
            base_branch,
            created_at: Utc::now(),
        };
        records.insert(task_id.clone(), record.clone());
        self.persist(&records)?;
        info!(task_id = %task_id, path = %record.path, "worktree created");
        Ok(record)
    }

    /// Cheap, read-only status snapshot.
    pub async fn status(&self, project: &Project, task_id: &Id) -> Result<WorktreeStatus> {
        let Some(record) = self.record(task_id).await else {
            return Ok(WorktreeStatus::absent());
        };
        if !Path::new(&record.path).exists() {
            return Ok(WorktreeStatus::absent());
        }

        let project_dir = Path::new(&project.path);
        let stats = gitops::numstat(project_dir, &record.base_branch, &record.branch)?;
        let additions = stats.iter().map(|(a, _, _)| a).sum();
        let deletions = stats.iter().map(|(_, d, _)| d).sum();
        let commit_count = gitops::commit_count(project_dir, &record.base_branch, &record.branch)?;

        Ok(WorktreeStatus {
            exists: true,
            path: Some(record.path.clone()),
            branch: Some(record.branch.clone()),
            base_branch: Some(record.base_branch.clone()),
            files_changed: stats.len(),
            additions,
            deletions,
            commit_count,
        })
    }

    /// File-level diff of the task branch against its base.
    pub async fn diff(&self, project: &Project, task_id: &Id) -> Result<WorktreeDiff> {
        let record = self
            .record(task_id)
            .await
            .ok_or_else(|| WorktreeError::NoWorktree(task_id.to_string()))?;
        let project_dir = Path::new(&project.path);

        let changed = gitops::changed_files(project_dir, &record.base_branch, &record.branch)?;
        let stats: HashMap<String, (usize, usize)> =
            gitops::numstat(project_dir, &record.base_branch, &record.branch)?
                .into_iter()
                .map(|(a, d, p)| (p, (a, d)))
                .collect();

        let files: Vec<FileDiff> = changed
            .into_iter()
            .map(|(status, path)| {
                let (additions, deletions) = stats.get(&path).copied().unwrap_or((0, 0));
                FileDiff {
                    path,
                    status,
                    additions,
                    deletions,
                }
            })
            .collect();

        let additions: usize = files.iter().map(|f| f.additions).sum();
        let deletions: usize = files.iter().map(|f| f.deletions).sum();
        let summary = format!(
            "{} files changed, {additions} insertions(+), {deletions} deletions(-)",
            files.len()
        );
        Ok(WorktreeDiff { summary, files })
    }

    /// Classify what a merge would encounter. Does not mutate anything.
    pub async fn merge_preview(&self, project: &Project, task_id: &Id) -> Result<MergePreview> {
        let record = self
            .record(task_id)
            .await
            .ok_or_else(|| WorktreeError::NoWorktree(task_id.to_string()))?;
        let project_dir = Path::new(&project.path);

        let task_files: Vec<String> =
            gitops::changed_files(project_dir, &record.base_branch, &record.branch)?
                .into_iter()
                .map(|(_, path)| path)
                .collect();

        let merge_base = gitops::merge_base(project_dir, &record.base_branch, &record.branch)?;
        let commits_behind =
            gitops::commit_count(project_dir, &record.branch, &record.base_branch)?;

        let divergent: HashSet<String> = if commits_behind > 0 {
            let base_files = gitops::changed_files(project_dir, &merge_base, &record.base_branch)?;
            let base_set: HashSet<String> = base_files.into_iter().map(|(_, p)| p).collect();
            task_files
                .iter()
                .filter(|p| base_set.contains(*p))
                .cloned()
                .collect()
        } else {
            HashSet::new()
        };

        let mut conflicts = Vec::new();
        for path in &task_files {
            let conflict = if divergent.contains(path) {
                classify_conflict(project_dir, &merge_base, &record, path)?
            } else {
                MergeConflict {
                    path: path.clone(),
                    location: "whole file".to_string(),
                    severity: ConflictSeverity::None,
                    reason: "changed on the task branch only".to_string(),
                    strategy: "take the task branch version".to_string(),
                    auto_mergeable: true,
                }
            };
            conflicts.push(conflict);
        }

        let stats = MergeStats {
            total_files: task_files.len(),
            auto_mergeable: conflicts
                .iter()
                .filter(|c| c.severity <= ConflictSeverity::Low)
                .count(),
            ai_resolved: conflicts
                .iter()
                .filter(|c| {
                    c.severity == ConflictSeverity::Medium || c.severity == ConflictSeverity::High
                })
                .count(),
            human_required: conflicts
                .iter()
                .filter(|c| c.severity == ConflictSeverity::Critical)
                .count(),
        };

        let divergence = (commits_behind > 0).then(|| {
            let mut conflicting_files: Vec<String> = divergent.into_iter().collect();
            conflicting_files.sort();
            Divergence {
                commits_behind,
                conflicting_files,
            }
        });

        Ok(MergePreview {
            files: task_files,
            conflicts,
            stats,
            divergence,
        })
    }

    /// Execute the merge. With `stage_only`, the resolved tree is staged in
    /// the project without committing. Success destroys the worktree.
    pub async fn merge(
        &self,
        project: &Project,
        task_id: &Id,
        stage_only: bool,
        resolver: &dyn ConflictResolver,
    ) -> Result<MergeOutcome> {
        let record = self
            .record(task_id)
            .await
            .ok_or_else(|| WorktreeError::NoWorktree(task_id.to_string()))?;
        let project_dir = Path::new(&project.path);

        if gitops::is_dirty(project_dir)? {
            return Err(WorktreeError::DirtyProject);
        }
        let current = gitops::current_branch(project_dir)?;
        if current != record.base_branch {
            return Err(WorktreeError::WrongBranch {
                current,
                base: record.base_branch.clone(),
            });
        }

        let task_files = gitops::changed_files(project_dir, &record.base_branch, &record.branch)?;
        if task_files.is_empty() {
            // Nothing to integrate; retire the worktree.
            self.discard(project, task_id).await?;
            return Ok(if stage_only {
                MergeOutcome::Staged
            } else {
                MergeOutcome::Merged
            });
        }

        let commits_behind =
            gitops::commit_count(project_dir, &record.branch, &record.base_branch)?;

        let outcome = if !stage_only && commits_behind == 0 {
            // Base has not moved: plain fast-forward.
            gitops::fast_forward(project_dir, &record.branch)?;
            MergeOutcome::Merged
        } else {
            match self.three_way_merge(project_dir, &record, stage_only, resolver) {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Roll the project tree back; the worktree is untouched
                    // and the merge can be retried.
                    if let Err(abort_err) = gitops::merge_abort(project_dir) {
                        warn!(error = %abort_err, "merge abort failed");
                    }
                    return Err(e);
                }
            }
        };

        self.discard(project, task_id).await?;
        Ok(outcome)
    }

    fn three_way_merge(
        &self,
        project_dir: &Path,
        record: &WorktreeRecord,
        stage_only: bool,
        resolver: &dyn ConflictResolver,
    ) -> Result<MergeOutcome> {
        let merge_base = gitops::merge_base(project_dir, &record.base_branch, &record.branch)?;
        let conflicted = gitops::merge_no_commit(project_dir, &record.branch, stage_only)?;

        let mut resolved = Vec::new();
        for path in &conflicted {
            let base = gitops::file_at_rev(project_dir, &merge_base, path)?;
            let ours = gitops::file_at_rev(project_dir, &record.base_branch, path)?
                .unwrap_or_default();
            let theirs =
                gitops::file_at_rev(project_dir, &record.branch, path)?.unwrap_or_default();

            let content = resolver
                .resolve(path, base.as_deref(), &ours, &theirs)
                .map_err(|reason| WorktreeError::ResolutionFailed {
                    path: path.clone(),
                    reason,
                })?;
            std::fs::write(project_dir.join(path), content)?;
            gitops::stage_path(project_dir, path)?;
            resolved.push(path.clone());
        }

        if stage_only {
            return Ok(MergeOutcome::Staged);
        }

        let message = if resolved.is_empty() {
            format!("Merge {} into {}", record.branch, record.base_branch)
        } else {
            format!(
                "Merge {} into {}\n\nResolved: {}",
                record.branch,
                record.base_branch,
                resolved.join(", ")
            )
        };
        gitops::commit(project_dir, &message)?;
        Ok(MergeOutcome::Merged)
    }

    /// Remove the worktree and its branch. Safe when already gone.
    pub async fn discard(&self, project: &Project, task_id: &Id) -> Result<()> {
        let mut records = self.records.lock().await;
        let Some(record) = records.remove(task_id) else {
            return Ok(());
        };
        let project_dir = Path::new(&project.path);
        if let Err(e) = gitops::remove_worktree(project_dir, Path::new(&record.path)) {
            warn!(task_id = %task_id, error = %e, "worktree removal failed");
        }
        if gitops::branch_exists(project_dir, &record.branch).unwrap_or(false) {
            if let Err(e) = gitops::delete_branch(project_dir, &record.branch) {
                warn!(task_id = %task_id, error = %e, "branch deletion failed");
            }
        }
        self.persist(&records)?;
        info!(task_id = %task_id, "worktree discarded");
        Ok(())
    }

    /// Startup sweep: discard worktrees whose task no longer exists, once
    /// they are older than the grace period.
    pub async fn sweep_orphans(&self, projects: &[(Project, HashSet<String>)]) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(ORPHAN_GRACE_HOURS);
        let candidates: Vec<(Project, Id)> = {
            let records = self.records.lock().await;
            records
                .values()
                .filter(|record| record.created_at < cutoff)
                .filter_map(|record| {
                    projects
                        .iter()
                        .find(|(project, live)| {
                            record.path.contains(project.id.as_ref())
                                && !live.contains(record.task_id.as_ref())
                        })
                        .map(|(project, _)| (project.clone(), record.task_id.clone()))
                })
                .collect()
        };

        let mut swept = 0;
        for (project, task_id) in candidates {
            if self.discard(&project, &task_id).await.is_ok() {
                swept += 1;
            }
        }
        if swept > 0 {
            info!(swept, "orphan worktrees swept");
        }
        swept
    }
}

/// Classify one file both sides touched since the merge base.
fn classify_conflict(
    project_dir: &Path,
    merge_base: &str,
    record: &WorktreeRecord,
    path: &str,
) -> Result<MergeConflict> {
    let base = gitops::file_at_rev(project_dir, merge_base, path)?;
    let ours = gitops::file_at_rev(project_dir, &record.base_branch, path)?;
    let theirs = gitops::file_at_rev(project_dir, &record.branch, path)?;

    // Structural conflicts: deletion or rename collisions.
    let (Some(ours), Some(theirs)) = (ours, theirs) else {
        return Ok(MergeConflict {
            path: path.to_string(),
            location: "whole file".to_string(),
            severity: ConflictSeverity::Critical,
            reason: "one side deleted the file while the other modified it".to_string(),
            strategy: "needs a human decision".to_string(),
            auto_mergeable: false,
        });
    };
    let Some(base) = base else {
        // Added on both sides with different ancestry.
        return Ok(MergeConflict {
            path: path.to_string(),
            location: "whole file".to_string(),
            severity: ConflictSeverity::Critical,
            reason: "both sides added the file independently".to_string(),
            strategy: "needs a human decision".to_string(),
            auto_mergeable: false,
        });
    };

    let our_ranges = changed_base_ranges(&base, &ours);
    let their_ranges = changed_base_ranges(&base, &theirs);
    let overlaps = overlapping_ranges(&our_ranges, &their_ranges);

    if overlaps.is_empty() {
        return Ok(MergeConflict {
            path: path.to_string(),
            location: describe_ranges(&their_ranges),
            severity: ConflictSeverity::Low,
            reason: "both sides changed the file in disjoint line ranges".to_string(),
            strategy: "three-way line merge".to_string(),
            auto_mergeable: true,
        });
    }

    let base_lines: Vec<&str> = base.lines().collect();
    let cosmetic = overlaps.iter().all(|range| {
        base_lines
            .get(range.start.min(base_lines.len())..range.end.min(base_lines.len()))
            .map(|lines| lines.iter().all(|l| is_cosmetic_line(l)))
            .unwrap_or(false)
    });

    if cosmetic {
        Ok(MergeConflict {
            path: path.to_string(),
            location: describe_ranges(&overlaps),
            severity: ConflictSeverity::Medium,
            reason: "overlapping changes touch comments or formatting only".to_string(),
            strategy: "resolve with the merge agent".to_string(),
            auto_mergeable: false,
        })
    } else {
        Ok(MergeConflict {
            path: path.to_string(),
            location: describe_ranges(&overlaps),
            severity: ConflictSeverity::High,
            reason: "overlapping changes touch logic on both sides".to_string(),
            strategy: "resolve with the merge agent".to_string(),
            auto_mergeable: false,
        })
    }
}

/// Line ranges of `base` that `modified` changed, in base coordinates.
fn changed_base_ranges(base: &str, modified: &str) -> Vec<Range<usize>> {
    let diff = TextDiff::from_lines(base, modified);
    let mut ranges = Vec::new();
    for op in diff.ops() {
        if op.tag() != similar::DiffTag::Equal {
            let range = op.old_range();
            // Pure insertions have an empty old range; widen to one line so
            // adjacency counts as overlap.
            let range = if range.is_empty() {
                range.start..range.start + 1
            } else {
                range
            };
            ranges.push(range);
        }
    }
    ranges
}

fn overlapping_ranges(a: &[Range<usize>], b: &[Range<usize>]) -> Vec<Range<usize>> {
    let mut overlaps = Vec::new();
    for ra in a {
        for rb in b {
            let start = ra.start.max(rb.start);
            let end = ra.end.min(rb.end);
            if start < end {
                overlaps.push(start..end);
            }
        }
    }
    overlaps
}

fn describe_ranges(ranges: &[Range<usize>]) -> String {
    if ranges.is_empty() {
        return "whole file".to_string();
    }
    ranges
        .iter()
        .map(|r| format!("lines {}-{}", r.start + 1, r.end))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Comment or formatting-only content, per common comment leaders.
fn is_cosmetic_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with("//")
        || trimmed.starts_with('#')
        || trimmed.starts_with("/*")
        || trimmed.starts_with('*')
        || trimmed.starts_with("--")
}
