//! Per-project framework install and update.
//!
//! Registration copies the bundled framework directory into the project,
//! seeds the spec root and the env file, and records version metadata with a
//! content hash of the source. Updates re-copy everything while preserving
//! the project's spec directory and env file.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::layout;

/// Directory names never copied and never hashed: caches and VCS metadata.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "node_modules",
    ".venv",
];

/// Entries owned by the project after install; updates must not clobber them.
const PRESERVED_ENTRIES: &[&str] = &["specs", layout::ENV_FILE];

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed version metadata: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("framework source not found: {0}")]
    SourceNotFound(String),
    #[error("framework already installed at {0}")]
    AlreadyInstalled(String),
    #[error("framework not installed in {0}")]
    NotInstalled(String),
}

pub type Result<T> = std::result::Result<T, InstallError>;

/// `.version.json` inside an installed framework directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    pub version: String,
    pub source_hash: String,
    pub source_path: String,
    pub initialized_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VersionMetadata {
    pub fn load(framework_dir: &Path) -> Result<Self> {
        let path = framework_dir.join(layout::VERSION_METADATA_FILE);
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, framework_dir: &Path) -> Result<()> {
        let path = framework_dir.join(layout::VERSION_METADATA_FILE);
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// Content hash of a framework directory: sorted lexical traversal, each
/// file framed as `relative path, NUL, length (LE), bytes`. Stable across
/// platforms; not meant to be cryptographically meaningful.
pub fn hash_directory(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();
    for rel in files {
        let content = std::fs::read(dir.join(&rel))?;
        hasher.update(rel.replace(std::path::MAIN_SEPARATOR, "/").as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() {
            if EXCLUDED_DIRS.contains(&name.as_str()) {
                continue;
            }
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("entry under root")
                .to_string_lossy()
                .into_owned();
            out.push(rel);
        }
    }
    Ok(())
}

/// Read the single-line semantic version of a framework directory.
pub fn read_version(framework_dir: &Path) -> Result<String> {
    let content = std::fs::read_to_string(framework_dir.join(layout::VERSION_FILE))?;
    Ok(content.trim().to_string())
}

/// First-time install of the bundled framework into a project.
pub fn install(project_dir: &Path, source_dir: &Path) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(InstallError::SourceNotFound(
            source_dir.display().to_string(),
        ));
    }
    if let Some(existing) = layout::find_framework_dir(project_dir) {
        return Err(InstallError::AlreadyInstalled(
            existing.display().to_string(),
        ));
    }

    let dest = layout::preferred_framework_dir(project_dir);
    copy_tree(source_dir, &dest)?;

    // Seed the spec root and the env file.
    std::fs::create_dir_all(layout::specs_root(&dest))?;
    let env = layout::env_path(&dest);
    let example = dest.join(layout::ENV_EXAMPLE_FILE);
    if !env.exists() && example.exists() {
        std::fs::copy(&example, &env)?;
    }

    let now = Utc::now();
    let metadata = VersionMetadata {
        version: read_version(source_dir).unwrap_or_else(|_| "0.0.0".to_string()),
        source_hash: hash_directory(source_dir)?,
        source_path: source_dir.display().to_string(),
        initialized_at: now,
        updated_at: now,
    };
    metadata.save(&dest)?;

    info!(
        project = %project_dir.display(),
        version = %metadata.version,
        "framework installed"
    );
    Ok(dest)
}

/// Update an installed framework from the bundled source. The project's
/// spec directory and env file are left untouched; everything else is
/// re-copied and the recorded hash refreshed.
pub fn update(project_dir: &Path, source_dir: &Path) -> Result<PathBuf> {
    if !source_dir.is_dir() {
        return Err(InstallError::SourceNotFound(
            source_dir.display().to_string(),
        ));
    }
    let dest = layout::find_framework_dir(project_dir)
        .ok_or_else(|| InstallError::NotInstalled(project_dir.display().to_string()))?;

    copy_tree(source_dir, &dest)?;

    let initialized_at = VersionMetadata::load(&dest)
        .map(|m| m.initialized_at)
        .unwrap_or_else(|_| Utc::now());
    let metadata = VersionMetadata {
        version: read_version(source_dir).unwrap_or_else(|_| "0.0.0".to_string()),
        source_hash: hash_directory(source_dir)?,
        source_path: source_dir.display().to_string(),
        initialized_at,
        updated_at: Utc::now(),
    };
    metadata.save(&dest)?;

    info!(
        project = %project_dir.display(),
        version = %metadata.version,
        "framework updated"
    );
    Ok(dest)
}

/// A bundled update is available when the source content hash no longer
/// matches the one recorded at install time.
pub fn bundled_update_available(framework_dir: &Path, source_dir: &Path) -> Result<bool> {
    let metadata = VersionMetadata::load(framework_dir)?;
    Ok(hash_directory(source_dir)? != metadata.source_hash)
}

/// Recursive copy honoring the exclusion rules. Entries named in
/// [`PRESERVED_ENTRIES`] are never written: on install they are seeded
/// separately, on update the project's own copies stay in place.
fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let from = entry.path();
        let to = dest.join(&name);

        if PRESERVED_ENTRIES.contains(&name.as_str()) {
            continue;
        }
        if from.is_dir() {
            if EXCLUDED_DIRS.contains(&name.as_str()) {
                continue;
            }
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_source(version: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("VERSION"), format!("{version}\n")).unwrap();
        std::fs::write(dir.path().join("agent.py"), "print('agent')\n").unwrap();
        std::fs::write(dir.path().join(".env.example"), "# ANTHROPIC_API_KEY=\n").unwrap();
        std::fs::create_dir(dir.path().join("prompts")).unwrap();
        std::fs::write(dir.path().join("prompts/spec.md"), "prompt\n").unwrap();
        std::fs::create_dir(dir.path().join("__pycache__")).unwrap();
        std::fs::write(dir.path().join("__pycache__/junk.pyc"), "junk").unwrap();
        dir
    }

    #[test]
    fn install_copies_and_seeds() {
        let source = make_source("1.2.0");
        let project = TempDir::new().unwrap();

        let dest = install(project.path(), source.path()).unwrap();
        assert_eq!(dest, project.path().join(".auto-build"));
        assert!(dest.join("agent.py").exists());
        assert!(dest.join("specs").is_dir());
        assert!(dest.join(".env").exists());
        assert!(!dest.join("__pycache__").exists());

        let metadata = VersionMetadata::load(&dest).unwrap();
        assert_eq!(metadata.version, "1.2.0");
        assert_eq!(metadata.source_path, source.path().display().to_string());
    }

    #[test]
    fn double_install_is_rejected() {
        let source = make_source("1.2.0");
        let project = TempDir::new().unwrap();
        install(project.path(), source.path()).unwrap();
        let err = install(project.path(), source.path()).unwrap_err();
        assert!(matches!(err, InstallError::AlreadyInstalled(_)));
    }

    #[test]
    fn update_preserves_specs_and_env() {
        let source = make_source("1.2.0");
        let project = TempDir::new().unwrap();
        let dest = install(project.path(), source.path()).unwrap();

        // Project-side state accumulates.
        std::fs::write(dest.join(".env"), "ANTHROPIC_API_KEY=sk-local\n").unwrap();
        let spec = dest.join("specs/my-task");
        std::fs::create_dir_all(&spec).unwrap();
        std::fs::write(spec.join("spec.md"), "## Overview\nmy task\n").unwrap();

        // New source version.
        std::fs::write(source.path().join("VERSION"), "1.3.0\n").unwrap();
        std::fs::write(source.path().join("agent.py"), "print('agent v2')\n").unwrap();

        update(project.path(), source.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("agent.py")).unwrap(),
            "print('agent v2')\n"
        );
        assert_eq!(
            std::fs::read_to_string(dest.join(".env")).unwrap(),
            "ANTHROPIC_API_KEY=sk-local\n"
        );
        assert!(spec.join("spec.md").exists());
        assert_eq!(VersionMetadata::load(&dest).unwrap().version, "1.3.0");
    }

    #[test]
    fn hash_is_stable_and_ignores_caches() {
        let source = make_source("1.2.0");
        let first = hash_directory(source.path()).unwrap();
        let second = hash_directory(source.path()).unwrap();
        assert_eq!(first, second);

        // Cache churn does not move the hash.
        std::fs::write(source.path().join("__pycache__/more.pyc"), "junk2").unwrap();
        assert_eq!(hash_directory(source.path()).unwrap(), first);

        // Real content does.
        std::fs::write(source.path().join("agent.py"), "print('changed')\n").unwrap();
        assert_ne!(hash_directory(source.path()).unwrap(), first);
    }

    #[test]
    fn bundled_update_detection_follows_source_hash() {
        let source = make_source("1.2.0");
        let project = TempDir::new().unwrap();
        let dest = install(project.path(), source.path()).unwrap();

        assert!(!bundled_update_available(&dest, source.path()).unwrap());
        std::fs::write(source.path().join("agent.py"), "print('v2')\n").unwrap();
        assert!(bundled_update_available(&dest, source.path()).unwrap());
    }
}
