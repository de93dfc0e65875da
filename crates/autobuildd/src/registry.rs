//! Project registry.
//!
//! One JSON document under the per-user data directory holds every known
//! project. Mutations are serialized by a per-process lock and written
//! atomically (temp + rename), so the on-disk file is always a valid
//! document reflecting exactly one state.

use std::path::{Path, PathBuf};

use autobuild_core::types::{Id, Project, ProjectSettings};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::layout;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed registry file: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("project already registered at {0}")]
    DuplicatePath(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDoc {
    projects: Vec<Project>,
}

/// Durable catalog of projects.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    state: Mutex<RegistryDoc>,
}

impl Registry {
    /// Open (or create) the registry at `<data_dir>/projects.json`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("projects.json");
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            RegistryDoc::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(doc),
        })
    }

    /// Register a project. Scans for an existing framework install and
    /// records its relative path. Fails on a duplicate directory.
    pub async fn add(&self, name: &str, project_dir: &Path) -> Result<Project> {
        if !project_dir.is_dir() {
            return Err(RegistryError::NotADirectory(
                project_dir.display().to_string(),
            ));
        }
        let canonical = project_dir
            .canonicalize()
            .unwrap_or_else(|_| project_dir.to_path_buf());
        let path_str = canonical.display().to_string();

        let mut state = self.state.lock().await;
        if state.projects.iter().any(|p| p.path == path_str) {
            return Err(RegistryError::DuplicatePath(path_str));
        }

        let framework_dir = layout::find_framework_dir(&canonical).and_then(|abs| {
            abs.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        });

        let now = Utc::now();
        let project = Project {
            id: Id::new(),
            name: name.to_string(),
            path: path_str,
            framework_dir,
            settings: ProjectSettings::default(),
            created_at: now,
            updated_at: now,
        };
        state.projects.push(project.clone());
        self.persist(&state)?;
        info!(project_id = %project.id, path = %project.path, "project registered");
        Ok(project)
    }

    pub async fn get(&self, id: &Id) -> Result<Project> {
        let state = self.state.lock().await;
        state
            .projects
            .iter()
            .find(|p| &p.id == id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Project> {
        self.state.lock().await.projects.clone()
    }

    /// Remove a project. The project's files on disk are untouched.
    pub async fn remove(&self, id: &Id) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.projects.len();
        state.projects.retain(|p| &p.id != id);
        if state.projects.len() == before {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.persist(&state)?;
        info!(project_id = %id, "project removed");
        Ok(())
    }

    pub async fn update_settings(&self, id: &Id, settings: ProjectSettings) -> Result<Project> {
        let mut state = self.state.lock().await;
        let project = state
            .projects
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        project.settings = settings;
        project.updated_at = Utc::now();
        let updated = project.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    /// Record the framework directory discovered (or installed) for a
    /// project.
    pub async fn set_framework_dir(&self, id: &Id, framework_dir: &str) -> Result<Project> {
        let mut state = self.state.lock().await;
        let project = state
            .projects
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        project.framework_dir = Some(framework_dir.to_string());
        project.updated_at = Utc::now();
        let updated = project.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn persist(&self, doc: &RegistryDoc) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
