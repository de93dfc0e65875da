//! Framework updater.
//!
//! Checks a well-known remote location for a newer framework version,
//! downloads the release archive over HTTPS, extracts it with the platform
//! archive tool into a staging directory, and atomically swaps it into the
//! user-side framework source, preserving the env file and spec directories.
//! Progress is reported as `framework-update.progress` events.

use std::path::{Path, PathBuf};

use autobuild_core::{CoreEvent, UpdateStage};
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::installer;
use crate::layout;

/// Connect/read budget for the version probe.
const CHECK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
/// Total budget for the archive download.
const DOWNLOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid version string: {0}")]
    InvalidVersion(String),
    #[error("archive extraction failed: {0}")]
    Extraction(String),
    #[error("downloaded archive does not contain a framework directory")]
    MissingFramework,
}

pub type Result<T> = std::result::Result<T, UpdateError>;

/// Remote endpoints; defaults point at the published framework repository.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub version_url: String,
    pub archive_url: String,
    pub branch: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            version_url:
                "https://raw.githubusercontent.com/auto-build/framework/main/VERSION".to_string(),
            archive_url:
                "https://github.com/auto-build/framework/archive/refs/heads/main.tar.gz"
                    .to_string(),
            branch: "main".to_string(),
        }
    }
}

/// Result of a remote version check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheck {
    pub update_available: bool,
    pub current: String,
    pub latest: String,
}

/// `.update.json` written beside the swapped-in framework source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMetadata {
    version: String,
    updated_at: chrono::DateTime<Utc>,
    source: String,
    branch: String,
}

/// Downloads framework updates into the per-user data directory.
#[derive(Debug)]
pub struct FrameworkUpdater {
    config: UpdaterConfig,
    /// `<data_dir>/framework-updates`: staging for downloads.
    staging_dir: PathBuf,
    /// `<data_dir>/framework-source`: the user-side framework override.
    source_dir: PathBuf,
    bus: EventBus,
}

impl FrameworkUpdater {
    pub fn new(data_dir: &Path, config: UpdaterConfig, bus: EventBus) -> Self {
        Self {
            config,
            staging_dir: data_dir.join("framework-updates"),
            source_dir: data_dir.join("framework-source"),
            bus,
        }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    fn progress(&self, stage: UpdateStage, percent: Option<u8>, message: impl Into<String>) {
        self.bus.publish(CoreEvent::FrameworkUpdateProgress {
            stage,
            percent,
            message: message.into(),
        });
    }

    /// Compare the remote version against the bundled framework.
    pub async fn check(&self, bundled_dir: &Path) -> Result<UpdateCheck> {
        self.progress(UpdateStage::Checking, None, "checking for updates");

        let current = installer::read_version(bundled_dir).unwrap_or_else(|_| "0.0.0".to_string());
        let client = reqwest::Client::builder()
            .connect_timeout(CHECK_TIMEOUT)
            .timeout(CHECK_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()
            .map_err(|e| UpdateError::Http(e.to_string()))?;

        let latest = client
            .get(&self.config.version_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| UpdateError::Http(e.to_string()))?
            .text()
            .await
            .map_err(|e| UpdateError::Http(e.to_string()))?
            .trim()
            .to_string();

        let update_available = semver_gt(&latest, &current)?;
        Ok(UpdateCheck {
            update_available,
            current,
            latest,
        })
    }

    /// Download, extract and install the latest framework into the
    /// user-side source directory. Emits the full progress sequence; on any
    /// failure an `error` stage event is published and the error returned.
    pub async fn download(&self) -> Result<String> {
        match self.download_inner().await {
            Ok(version) => {
                self.progress(
                    UpdateStage::Complete,
                    Some(100),
                    format!("framework {version} installed"),
                );
                Ok(version)
            }
            Err(e) => {
                self.progress(UpdateStage::Error, None, e.to_string());
                Err(e)
            }
        }
    }

    async fn download_inner(&self) -> Result<String> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let archive_path = self.staging_dir.join("framework.tar.gz");

        // Download with streamed progress.
        self.progress(UpdateStage::Downloading, Some(0), "downloading archive");
        let client = reqwest::Client::builder()
            .connect_timeout(CHECK_TIMEOUT)
            .timeout(DOWNLOAD_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()
            .map_err(|e| UpdateError::Http(e.to_string()))?;
        let response = client
            .get(&self.config.archive_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| UpdateError::Http(e.to_string()))?;

        let total = response.content_length();
        let mut stream = response.bytes_stream();
        let mut file = std::fs::File::create(&archive_path)?;
        let mut downloaded: u64 = 0;
        let mut last_percent = 0u8;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpdateError::Http(e.to_string()))?;
            std::io::Write::write_all(&mut file, &chunk)?;
            downloaded += chunk.len() as u64;
            if let Some(total) = total {
                let percent = ((downloaded * 100) / total.max(1)) as u8;
                if percent >= last_percent.saturating_add(5) {
                    last_percent = percent;
                    self.progress(
                        UpdateStage::Downloading,
                        Some(percent),
                        format!("{downloaded}/{total} bytes"),
                    );
                }
            }
        }
        drop(file);

        // Extract with the platform tar.
        self.progress(UpdateStage::Extracting, None, "extracting archive");
        let extract_dir = self.staging_dir.join("extracted");
        if extract_dir.exists() {
            std::fs::remove_dir_all(&extract_dir)?;
        }
        std::fs::create_dir_all(&extract_dir)?;
        extract_archive(&archive_path, &extract_dir)?;

        let framework_root = find_framework_root(&extract_dir)?;
        let version = installer::read_version(&framework_root)
            .map_err(|_| UpdateError::MissingFramework)?;

        swap_into_place(&framework_root, &self.source_dir)?;

        let metadata = UpdateMetadata {
            version: version.clone(),
            updated_at: Utc::now(),
            source: self.config.archive_url.clone(),
            branch: self.config.branch.clone(),
        };
        std::fs::write(
            self.source_dir.join(".update.json"),
            serde_json::to_vec_pretty(&metadata).map_err(|e| UpdateError::Extraction(e.to_string()))?,
        )?;

        info!(version = %version, "framework update installed");
        Ok(version)
    }
}

/// `a > b` for dotted semantic versions.
pub fn semver_gt(a: &str, b: &str) -> Result<bool> {
    Ok(parse_semver(a)? > parse_semver(b)?)
}

fn parse_semver(version: &str) -> Result<(u64, u64, u64)> {
    let core = version.trim().trim_start_matches('v');
    // Ignore pre-release/build suffixes.
    let core = core
        .split_once(['-', '+'])
        .map_or(core, |(head, _)| head);
    let mut parts = core.split('.');
    let mut next = |_name: &str| -> Result<u64> {
        parts
            .next()
            .unwrap_or("0")
            .parse()
            .map_err(|_| UpdateError::InvalidVersion(version.to_string()))
    };
    Ok((next("major")?, next("minor")?, next("patch")?))
}

/// Extract a tarball using the platform `tar` binary.
fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let output = std::process::Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()?;
    if !output.status.success() {
        return Err(UpdateError::Extraction(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// Locate the framework directory inside an extracted archive: the first
/// directory (or the root itself) carrying a VERSION file.
fn find_framework_root(extract_dir: &Path) -> Result<PathBuf> {
    if extract_dir.join(layout::VERSION_FILE).exists() {
        return Ok(extract_dir.to_path_buf());
    }
    for entry in std::fs::read_dir(extract_dir)? {
        let path = entry?.path();
        if path.is_dir() && path.join(layout::VERSION_FILE).exists() {
            return Ok(path);
        }
    }
    Err(UpdateError::MissingFramework)
}

/// Replace `dest` with `new_root` atomically (rename-swap), carrying over
/// the preserved entries (`.env`, `specs/`) from the old tree.
fn swap_into_place(new_root: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        for preserved in ["specs", layout::ENV_FILE] {
            let old = dest.join(preserved);
            let new = new_root.join(preserved);
            if old.exists() && !new.exists() {
                copy_recursive(&old, &new)?;
            }
        }
    }

    let backup = dest.with_extension("old");
    if backup.exists() {
        std::fs::remove_dir_all(&backup)?;
    }
    if dest.exists() {
        std::fs::rename(dest, &backup)?;
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(new_root, dest) {
        Ok(()) => {}
        Err(e) => {
            // Roll the old tree back before failing.
            if backup.exists() {
                if let Err(restore) = std::fs::rename(&backup, dest) {
                    warn!(error = %restore, "failed to restore previous framework source");
                }
            }
            return Err(e.into());
        }
    }
    if backup.exists() {
        std::fs::remove_dir_all(&backup)?;
    }
    Ok(())
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn semver_comparison() {
        assert!(semver_gt("1.3.0", "1.2.0").unwrap());
        assert!(semver_gt("2.0.0", "1.99.99").unwrap());
        assert!(!semver_gt("1.2.0", "1.2.0").unwrap());
        assert!(!semver_gt("1.2.0", "1.3.0").unwrap());
        assert!(semver_gt("v1.3.0", "1.2.9").unwrap());
        assert!(semver_gt("1.3.0-rc.1", "1.2.0").unwrap());
        assert!(semver_gt("1.2", "1.1.9").unwrap());
        assert!(semver_gt("1.2.3", "not-a-version").is_err());
    }

    #[test]
    fn find_framework_root_at_top_or_nested() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("VERSION"), "1.0.0\n").unwrap();
        assert_eq!(find_framework_root(dir.path()).unwrap(), dir.path());

        let nested = TempDir::new().unwrap();
        let inner = nested.path().join("framework-main");
        std::fs::create_dir(&inner).unwrap();
        std::fs::write(inner.join("VERSION"), "1.0.0\n").unwrap();
        assert_eq!(find_framework_root(nested.path()).unwrap(), inner);

        let empty = TempDir::new().unwrap();
        assert!(matches!(
            find_framework_root(empty.path()),
            Err(UpdateError::MissingFramework)
        ));
    }

    #[test]
    fn swap_preserves_env_and_specs() {
        let root = TempDir::new().unwrap();
        let dest = root.path().join("framework-source");

        // Existing install with user state.
        std::fs::create_dir_all(dest.join("specs/my-task")).unwrap();
        std::fs::write(dest.join("specs/my-task/spec.md"), "kept\n").unwrap();
        std::fs::write(dest.join(".env"), "ANTHROPIC_API_KEY=sk\n").unwrap();
        std::fs::write(dest.join("VERSION"), "1.2.0\n").unwrap();
        std::fs::write(dest.join("agent.py"), "old\n").unwrap();

        // Fresh extraction.
        let staging = root.path().join("new-root");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("VERSION"), "1.3.0\n").unwrap();
        std::fs::write(staging.join("agent.py"), "new\n").unwrap();

        swap_into_place(&staging, &dest).unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("VERSION")).unwrap(), "1.3.0\n");
        assert_eq!(std::fs::read_to_string(dest.join("agent.py")).unwrap(), "new\n");
        assert_eq!(
            std::fs::read_to_string(dest.join(".env")).unwrap(),
            "ANTHROPIC_API_KEY=sk\n"
        );
        assert!(dest.join("specs/my-task/spec.md").exists());
        assert!(!dest.with_extension("old").exists());
    }

    #[test]
    fn swap_into_empty_destination_works() {
        let root = TempDir::new().unwrap();
        let dest = root.path().join("framework-source");
        let staging = root.path().join("new-root");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("VERSION"), "1.0.0\n").unwrap();

        swap_into_place(&staging, &dest).unwrap();
        assert!(dest.join("VERSION").exists());
    }

    #[test]
    fn extract_archive_round_trip() {
        let root = TempDir::new().unwrap();
        let payload = root.path().join("payload");
        std::fs::create_dir_all(payload.join("framework")).unwrap();
        std::fs::write(payload.join("framework/VERSION"), "1.3.0\n").unwrap();

        let archive = root.path().join("framework.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(&payload)
            .arg("framework")
            .status()
            .unwrap();
        assert!(status.success());

        let out = root.path().join("extracted");
        std::fs::create_dir_all(&out).unwrap();
        extract_archive(&archive, &out).unwrap();
        let found = find_framework_root(&out).unwrap();
        assert_eq!(installer::read_version(&found).unwrap(), "1.3.0");
    }
}
