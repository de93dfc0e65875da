//! Git plumbing.
//!
//! Thin wrappers over the `git` CLI. Every function takes the directory to
//! operate in; nothing here holds state. Worktree lifecycle, diff and merge
//! orchestration live in `worktree`.

use std::path::Path;
use std::process::Command;

use thiserror::Error;

use autobuild_core::types::FileChangeKind;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("merge conflict: {0}")]
    MergeConflict(String),
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run git with args in `dir`, returning trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_string())
        .map_err(|_| GitError::InvalidUtf8)
}

/// Like [`git`] but success is the status code, not an error.
fn git_status_ok(dir: &Path, args: &[&str]) -> Result<bool> {
    let output = Command::new("git").args(args).current_dir(dir).output()?;
    Ok(output.status.success())
}

/// Detect the default branch: remote HEAD first, then `main`, then `master`.
pub fn detect_default_branch(dir: &Path) -> Result<String> {
    if let Ok(full_ref) = git(dir, &["symbolic-ref", "refs/remotes/origin/HEAD"]) {
        if let Some(branch) = full_ref.strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }
    for candidate in ["main", "master"] {
        if git_status_ok(
            dir,
            &["rev-parse", "--verify", &format!("refs/heads/{candidate}")],
        )? {
            return Ok(candidate.to_string());
        }
    }
    Ok("main".to_string())
}

pub fn current_branch(dir: &Path) -> Result<String> {
    git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
}

pub fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    git_status_ok(dir, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])
}

pub fn create_branch(dir: &Path, branch: &str, base: &str) -> Result<()> {
    git(dir, &["branch", branch, base]).map(|_| ())
}

pub fn delete_branch(dir: &Path, branch: &str) -> Result<()> {
    git(dir, &["branch", "-D", branch]).map(|_| ())
}

/// Create a worktree at `path` on `branch`, creating the branch from `base`
/// when it does not exist yet.
pub fn add_worktree(dir: &Path, path: &Path, branch: &str, base: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !branch_exists(dir, branch)? {
        create_branch(dir, branch, base)?;
    }
    git(
        dir,
        &["worktree", "add", path.to_string_lossy().as_ref(), branch],
    )
    .map(|_| ())
}

/// Remove a worktree; tolerates it already being gone.
pub fn remove_worktree(dir: &Path, path: &Path) -> Result<()> {
    if !path.exists() {
        // Clear any stale bookkeeping and call it done.
        let _ = git(dir, &["worktree", "prune"]);
        return Ok(());
    }
    git(
        dir,
        &[
            "worktree",
            "remove",
            "--force",
            path.to_string_lossy().as_ref(),
        ],
    )
    .map(|_| ())
}

pub fn merge_base(dir: &Path, a: &str, b: &str) -> Result<String> {
    git(dir, &["merge-base", a, b])
}

/// Commits reachable from `to` but not from `from`.
pub fn commit_count(dir: &Path, from: &str, to: &str) -> Result<usize> {
    let out = git(dir, &["rev-list", "--count", &format!("{from}..{to}")])?;
    out.parse()
        .map_err(|_| GitError::CommandFailed(format!("unparsable rev-list count: {out}")))
}

/// Name-status entries between two revisions (three-dot: changes on `head`
/// since the merge base).
pub fn changed_files(dir: &Path, base: &str, head: &str) -> Result<Vec<(FileChangeKind, String)>> {
    let out = git(
        dir,
        &["diff", "--name-status", &format!("{base}...{head}")],
    )?;
    let mut entries = Vec::new();
    for line in out.lines() {
        let mut parts = line.split('\t');
        let Some(status) = parts.next() else { continue };
        let kind = match status.chars().next() {
            Some('A') => FileChangeKind::Added,
            Some('D') => FileChangeKind::Deleted,
            Some('R') => FileChangeKind::Renamed,
            Some(_) => FileChangeKind::Modified,
            None => continue,
        };
        // Renames carry old and new path; keep the new one.
        let path = parts.last().unwrap_or_default().to_string();
        if !path.is_empty() {
            entries.push((kind, path));
        }
    }
    Ok(entries)
}

/// Per-file (additions, deletions, path) between two revisions.
pub fn numstat(dir: &Path, base: &str, head: &str) -> Result<Vec<(usize, usize, String)>> {
    let out = git(dir, &["diff", "--numstat", &format!("{base}...{head}")])?;
    let mut entries = Vec::new();
    for line in out.lines() {
        let mut parts = line.split('\t');
        let adds = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let dels = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let Some(path) = parts.next() else { continue };
        entries.push((adds, dels, path.to_string()));
    }
    Ok(entries)
}

/// Content of `path` at `rev`; `None` when the file does not exist there.
pub fn file_at_rev(dir: &Path, rev: &str, path: &str) -> Result<Option<String>> {
    let output = Command::new("git")
        .args(["show", &format!("{rev}:{path}")])
        .current_dir(dir)
        .output()?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
}

/// True when `ancestor` is an ancestor of `descendant`.
pub fn is_ancestor(dir: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
    git_status_ok(dir, &["merge-base", "--is-ancestor", ancestor, descendant])
}

pub fn is_dirty(dir: &Path) -> Result<bool> {
    Ok(!git(dir, &["status", "--porcelain"])?.is_empty())
}

/// Fast-forward the current branch to `branch`. Fails when history diverged.
pub fn fast_forward(dir: &Path, branch: &str) -> Result<()> {
    git(dir, &["merge", "--ff-only", branch]).map(|_| ())
}

/// Start a merge without committing. Returns the set of conflicted paths;
/// empty means the merge is clean and staged. With `squash`, changes are
/// staged without a merge commit parent.
pub fn merge_no_commit(dir: &Path, branch: &str, squash: bool) -> Result<Vec<String>> {
    let args: Vec<&str> = if squash {
        vec!["merge", "--squash", branch]
    } else {
        vec!["merge", "--no-ff", "--no-commit", branch]
    };
    let output = Command::new("git").args(&args).current_dir(dir).output()?;
    if output.status.success() {
        return Ok(Vec::new());
    }
    // Non-zero exit: conflicts or a real failure. Conflicted paths are
    // listed by diff-filter=U; anything else is a hard error.
    let conflicted = git(dir, &["diff", "--name-only", "--diff-filter=U"])?;
    if conflicted.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git merge {branch}: {}",
            stderr.trim()
        )));
    }
    Ok(conflicted.lines().map(String::from).collect())
}

/// Abort an in-progress merge, restoring the pre-merge tree.
pub fn merge_abort(dir: &Path) -> Result<()> {
    // --squash conflicts leave no MERGE_HEAD; reset covers both shapes.
    if git(dir, &["merge", "--abort"]).is_err() {
        git(dir, &["reset", "--hard", "HEAD"])?;
    }
    Ok(())
}

pub fn stage_path(dir: &Path, path: &str) -> Result<()> {
    git(dir, &["add", "--", path]).map(|_| ())
}

pub fn commit(dir: &Path, message: &str) -> Result<()> {
    git(dir, &["commit", "--no-verify", "-m", message]).map(|_| ())
}
