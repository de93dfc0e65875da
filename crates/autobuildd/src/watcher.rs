//! Artifact watcher.
//!
//! One filesystem watcher per active task observes the spec directory and
//! translates file changes into [`ArtifactEvent`]s. Changes are coalesced
//! with a per-file debounce so agents that rewrite a file in bursts produce
//! one event per burst. Parse failures become one-shot `task.error` events;
//! the watcher itself never stops on bad content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use autobuild_core::plan::ImplementationPlan;
use autobuild_core::types::{ArtifactEvent, ArtifactKind, Id, MemoryEpisode};
use autobuild_core::CoreEvent;
use chrono::Utc;
use notify::{RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::layout;

/// Per-file debounce window.
pub const DEBOUNCE: Duration = Duration::from_millis(250);

/// Tick for the debounce flush loop.
const FLUSH_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch setup failed: {0}")]
    Setup(String),
    #[error("already watching {0}")]
    AlreadyWatching(String),
}

pub type Result<T> = std::result::Result<T, WatchError>;

struct WatchHandle {
    // Held so the OS watch stays registered.
    _watcher: notify::RecommendedWatcher,
    cancel: CancellationToken,
}

/// The set of active per-task watchers.
pub struct WatcherSet {
    bus: EventBus,
    artifact_tx: mpsc::UnboundedSender<ArtifactEvent>,
    watchers: StdMutex<HashMap<Id, WatchHandle>>,
}

impl std::fmt::Debug for WatcherSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherSet").finish_non_exhaustive()
    }
}

impl WatcherSet {
    /// Create the set. The receiver carries debounced artifact events for
    /// the orchestrator.
    pub fn new(bus: EventBus) -> (Self, mpsc::UnboundedReceiver<ArtifactEvent>) {
        let (artifact_tx, artifact_rx) = mpsc::unbounded_channel();
        (
            Self {
                bus,
                artifact_tx,
                watchers: StdMutex::new(HashMap::new()),
            },
            artifact_rx,
        )
    }

    /// Start watching one task's spec directory.
    pub fn watch(
        &self,
        task_id: &Id,
        project_id: &Id,
        spec_id: &str,
        spec_dir: &Path,
    ) -> Result<()> {
        let mut watchers = self.watchers.lock().expect("watchers lock");
        if watchers.contains_key(task_id) {
            return Err(WatchError::AlreadyWatching(task_id.to_string()));
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let _ = raw_tx.send(path);
                }
            }
        })
        .map_err(|e| WatchError::Setup(e.to_string()))?;
        watcher
            .watch(spec_dir, RecursiveMode::Recursive)
            .map_err(|e| WatchError::Setup(e.to_string()))?;

        let cancel = CancellationToken::new();
        tokio::spawn(debounce_loop(
            raw_rx,
            cancel.clone(),
            DebounceCtx {
                bus: self.bus.clone(),
                artifact_tx: self.artifact_tx.clone(),
                task_id: task_id.clone(),
                project_id: project_id.clone(),
                spec_id: spec_id.to_string(),
            },
        ));

        watchers.insert(
            task_id.clone(),
            WatchHandle {
                _watcher: watcher,
                cancel,
            },
        );
        debug!(task_id = %task_id, dir = %spec_dir.display(), "watching spec directory");
        Ok(())
    }

    pub fn unwatch(&self, task_id: &Id) {
        if let Some(handle) = self.watchers.lock().expect("watchers lock").remove(task_id) {
            handle.cancel.cancel();
        }
    }

    pub fn is_watching(&self, task_id: &Id) -> bool {
        self.watchers.lock().expect("watchers lock").contains_key(task_id)
    }
}

impl Drop for WatcherSet {
    fn drop(&mut self) {
        for handle in self.watchers.lock().expect("watchers lock").values() {
            handle.cancel.cancel();
        }
    }
}

struct DebounceCtx {
    bus: EventBus,
    artifact_tx: mpsc::UnboundedSender<ArtifactEvent>,
    task_id: Id,
    project_id: Id,
    spec_id: String,
}

/// Coalesce raw change notifications into one artifact event per file per
/// quiet period.
async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    cancel: CancellationToken,
    ctx: DebounceCtx,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    loop {
        tokio::select! {
            maybe = raw_rx.recv() => match maybe {
                Some(path) => {
                    pending.insert(path, Instant::now());
                }
                None => break,
            },
            () = tokio::time::sleep(FLUSH_TICK) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, at)| now.duration_since(**at) >= DEBOUNCE)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    pending.remove(&path);
                    emit(&ctx, &path);
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}

fn emit(ctx: &DebounceCtx, path: &Path) {
    let Some(kind) = classify_artifact(path) else {
        return;
    };
    let content = std::fs::read_to_string(path).ok();

    // Validate parseable kinds up front so consumers can trust the payload.
    if let Some(raw) = content.as_deref() {
        let parse_error = match kind {
            ArtifactKind::Plan => ImplementationPlan::parse(raw).err().map(|e| e.to_string()),
            ArtifactKind::MemoryEpisode => serde_json::from_str::<MemoryEpisode>(raw)
                .err()
                .map(|e| e.to_string()),
            ArtifactKind::ProjectIndex => serde_json::from_str::<serde_json::Value>(raw)
                .err()
                .map(|e| e.to_string()),
            _ => None,
        };
        if let Some(error) = parse_error {
            warn!(
                task_id = %ctx.task_id,
                path = %path.display(),
                error = %error,
                "artifact parse failure"
            );
            ctx.bus.publish(CoreEvent::TaskError {
                task_id: ctx.task_id.clone(),
                message: format!("failed to parse {}: {error}", path.display()),
            });
            return;
        }
    }

    let _ = ctx.artifact_tx.send(ArtifactEvent {
        project_id: ctx.project_id.clone(),
        spec_id: ctx.spec_id.clone(),
        kind,
        content,
        observed_at: Utc::now(),
    });
}

/// Map a file path to its artifact kind, if it is one we track.
pub fn classify_artifact(path: &Path) -> Option<ArtifactKind> {
    let name = path.file_name()?.to_string_lossy();
    let parent = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned());

    if name == layout::PLAN_FILE {
        return Some(ArtifactKind::Plan);
    }
    if name == layout::QA_REPORT_FILE {
        return Some(ArtifactKind::QaReport);
    }
    if name == layout::QA_FIX_REQUEST_FILE {
        return Some(ArtifactKind::QaFixRequest);
    }
    if name == "project_index.json" {
        return Some(ArtifactKind::ProjectIndex);
    }
    if parent.as_deref() == Some("memory") && name.ends_with(".json") {
        return Some(ArtifactKind::MemoryEpisode);
    }
    if name.ends_with(".log") {
        return Some(ArtifactKind::TaskLogs);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn classification_covers_known_artifacts() {
        assert_eq!(
            classify_artifact(Path::new("/s/implementation_plan.json")),
            Some(ArtifactKind::Plan)
        );
        assert_eq!(
            classify_artifact(Path::new("/s/qa_report.md")),
            Some(ArtifactKind::QaReport)
        );
        assert_eq!(
            classify_artifact(Path::new("/s/qa_fix_request.md")),
            Some(ArtifactKind::QaFixRequest)
        );
        assert_eq!(
            classify_artifact(Path::new("/s/memory/episode_001.json")),
            Some(ArtifactKind::MemoryEpisode)
        );
        assert_eq!(
            classify_artifact(Path::new("/s/phase_1.log")),
            Some(ArtifactKind::TaskLogs)
        );
        assert_eq!(
            classify_artifact(Path::new("/p/project_index.json")),
            Some(ArtifactKind::ProjectIndex)
        );
        assert_eq!(classify_artifact(Path::new("/s/spec.md")), None);
        assert_eq!(classify_artifact(Path::new("/s/notes.txt")), None);
    }

    #[tokio::test]
    async fn plan_writes_produce_debounced_events() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let (set, mut artifacts) = WatcherSet::new(bus);
        let task = Id::from_string("t1");

        set.watch(&task, &Id::from_string("p1"), "t1", dir.path())
            .unwrap();

        let plan = r#"{"feature": "X", "phases": []}"#;
        std::fs::write(dir.path().join("implementation_plan.json"), plan).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), artifacts.recv())
            .await
            .expect("timed out waiting for artifact event")
            .unwrap();
        assert_eq!(event.kind, ArtifactKind::Plan);
        assert_eq!(event.spec_id, "t1");
        assert_eq!(event.content.as_deref(), Some(plan));

        set.unwatch(&task);
        assert!(!set.is_watching(&task));
    }

    #[tokio::test]
    async fn malformed_plan_becomes_task_error_not_artifact() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let (set, mut artifacts) = WatcherSet::new(bus);
        let task = Id::from_string("t2");

        set.watch(&task, &Id::from_string("p1"), "t2", dir.path())
            .unwrap();
        std::fs::write(dir.path().join("implementation_plan.json"), "{broken").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut saw_error = false;
        while tokio::time::Instant::now() < deadline && !saw_error {
            if let Ok(Ok(event)) =
                tokio::time::timeout(Duration::from_millis(200), events.recv()).await
            {
                if matches!(event, CoreEvent::TaskError { .. }) {
                    saw_error = true;
                }
            }
        }
        assert!(saw_error, "expected a task.error for the malformed plan");
        assert!(
            artifacts.try_recv().is_err(),
            "malformed plan must not produce an artifact event"
        );
    }

    #[tokio::test]
    async fn untracked_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let (set, mut artifacts) = WatcherSet::new(bus);
        let task = Id::from_string("t3");

        set.watch(&task, &Id::from_string("p1"), "t3", dir.path())
            .unwrap();
        std::fs::write(dir.path().join("scratch.txt"), "noise").unwrap();

        let result = tokio::time::timeout(Duration::from_millis(800), artifacts.recv()).await;
        assert!(result.is_err(), "untracked file produced an event");
    }

    #[tokio::test]
    async fn double_watch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let (set, _artifacts) = WatcherSet::new(bus);
        let task = Id::from_string("t4");

        set.watch(&task, &Id::from_string("p1"), "t4", dir.path())
            .unwrap();
        let err = set
            .watch(&task, &Id::from_string("p1"), "t4", dir.path())
            .unwrap_err();
        assert!(matches!(err, WatchError::AlreadyWatching(_)));
    }
}
