//! End-to-end orchestrator scenarios.
//!
//! These tests wire the real components together (registry, supervisor,
//! watcher, worktree manager) against a temp git repository with a fake
//! framework install. Agents are shell scripts standing in for the real
//! executables; the interpreter is pointed at /bin/sh.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use autobuild_core::types::{Id, TaskStatus};
use autobuild_core::{CoreEvent, Settings};
use autobuildd::bus::EventBus;
use autobuildd::orchestrator::{Orchestrator, StartOptions};
use autobuildd::registry::Registry;
use autobuildd::supervisor::Supervisor;
use autobuildd::watcher::WatcherSet;
use autobuildd::worktree::{ConflictResolver, WorktreeManager};
use tempfile::TempDir;
use tokio::sync::broadcast;

struct TestEnv {
    _data: TempDir,
    _repo: TempDir,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<Registry>,
    bus: EventBus,
    project_id: Id,
    framework: PathBuf,
}

struct TakeTheirs;
impl ConflictResolver for TakeTheirs {
    fn resolve(
        &self,
        _path: &str,
        _base: Option<&str>,
        _ours: &str,
        theirs: &str,
    ) -> Result<String, String> {
        Ok(theirs.to_string())
    }
}

fn sh(dir: &Path, cmd: &str, args: &[&str]) {
    let out = std::process::Command::new(cmd)
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(out.status.success(), "{cmd} {args:?}: {out:?}");
}

/// A spec agent that writes a one-chunk pending plan.
const SPEC_AGENT: &str = r#"
# args: --spec-id <id> <description>
spec_id="$2"
mkdir -p "specs/$spec_id"
cat > "specs/$spec_id/implementation_plan.json" <<EOF
{
  "feature": "Add X",
  "phases": [
    {"number": 1, "name": "Core", "depends_on": [],
     "chunks": [{"id": "c1", "description": "implement", "status": "pending"}]}
  ]
}
EOF
"#;

/// A coding agent that completes the chunk, lingers long enough for the
/// watcher to observe the change, then exits 0.
const CODING_AGENT: &str = r#"
# args: --spec <id> [--model <m>]
spec_id="$2"
cat > "specs/$spec_id/implementation_plan.json" <<EOF
{
  "feature": "Add X",
  "phases": [
    {"number": 1, "name": "Core", "depends_on": [],
     "chunks": [{"id": "c1", "description": "implement", "status": "completed"}]}
  ]
}
EOF
sleep 1
"#;

/// A QA agent that simply succeeds without writing a verdict.
const QA_AGENT: &str = "sleep 0.2\n";

async fn setup() -> TestEnv {
    let data = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();

    // Project repository with a framework install.
    sh(repo.path(), "git", &["init", "-b", "main"]);
    sh(repo.path(), "git", &["config", "user.email", "t@t.test"]);
    sh(repo.path(), "git", &["config", "user.name", "Test"]);
    std::fs::write(repo.path().join("app.py"), "def main():\n    return 1\n").unwrap();
    // The framework install lives inside the project but outside version
    // control, like a real install.
    std::fs::write(repo.path().join(".gitignore"), ".auto-build/\nauto-build/\n").unwrap();
    sh(repo.path(), "git", &["add", "."]);
    sh(repo.path(), "git", &["commit", "-m", "init"]);

    let framework = repo.path().join(".auto-build");
    std::fs::create_dir_all(framework.join("specs")).unwrap();
    std::fs::write(framework.join("VERSION"), "1.2.0\n").unwrap();
    std::fs::write(framework.join("spec_agent.py"), SPEC_AGENT).unwrap();
    std::fs::write(framework.join("coding_agent.py"), CODING_AGENT).unwrap();
    std::fs::write(framework.join("qa_agent.py"), QA_AGENT).unwrap();

    let settings = Arc::new(StdMutex::new(Settings {
        interpreter_path: Some("/bin/sh".to_string()),
        ..Settings::default()
    }));

    let bus = EventBus::new();
    let registry = Arc::new(Registry::open(data.path()).unwrap());
    let worktrees = Arc::new(WorktreeManager::open(data.path()).unwrap());
    let (supervisor, mut exit_rx) = Supervisor::new(bus.clone());
    let (watchers, mut artifact_rx) = WatcherSet::new(bus.clone());
    let orchestrator = Orchestrator::new(
        Arc::clone(&registry),
        supervisor,
        Arc::new(watchers),
        worktrees,
        bus.clone(),
        settings,
    );

    // The daemon's background handler loops.
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            while let Some(notice) = exit_rx.recv().await {
                orchestrator.handle_exit(notice).await;
            }
        });
    }
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            while let Some(event) = artifact_rx.recv().await {
                orchestrator.handle_artifact(event).await;
            }
        });
    }

    let project = registry.add("demo", repo.path()).await.unwrap();
    let project_id = project.id.clone();

    TestEnv {
        _data: data,
        _repo: repo,
        orchestrator,
        registry,
        bus,
        project_id,
        framework,
    }
}

/// Wait until the task reports `expected` via task.list.
async fn wait_for_status(env: &TestEnv, task_id: &Id, expected: TaskStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let tasks = env.orchestrator.task_list(&env.project_id).await.unwrap();
        if let Some(task) = tasks.iter().find(|t| &t.id == task_id) {
            if task.status == expected {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {expected:?}; tasks: {:?}",
            tasks
                .iter()
                .map(|t| (t.id.clone(), t.status))
                .collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Drain events until predicate or timeout; returns everything seen.
async fn collect_until(
    rx: &mut broadcast::Receiver<CoreEvent>,
    mut done: impl FnMut(&[CoreEvent]) -> bool,
) -> Vec<CoreEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline && !done(&seen) {
        match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Ok(event)) => seen.push(event),
            Ok(Err(_)) | Err(_) => {}
        }
    }
    seen
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_implementation() {
    let env = setup().await;
    let mut events = env.bus.subscribe();

    // Create: placeholder task, spec agent seeds the plan.
    let task = env
        .orchestrator
        .task_create(&env.project_id, "Add X", "Implement X in module Y")
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Backlog);
    let task_id = task.id.clone();
    assert_eq!(task_id.as_ref(), "add-x");

    wait_for_status(&env, &task_id, TaskStatus::Backlog).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let plan_path = env.framework.join("specs/add-x/implementation_plan.json");
    while !plan_path.exists() {
        assert!(tokio::time::Instant::now() < deadline, "spec agent never ran");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Start: implementation agent completes the chunk and exits 0.
    env.orchestrator
        .task_start(&task_id, StartOptions::default())
        .await
        .unwrap();
    wait_for_status(&env, &task_id, TaskStatus::AiReview).await;

    // Event order: in_progress strictly before ai_review, with the coding
    // progress in between.
    let seen = collect_until(&mut events, |seen| {
        seen.iter().any(|e| {
            matches!(e, CoreEvent::TaskStatus { task_id: t, status: TaskStatus::AiReview } if t == &task_id)
        })
    })
    .await;
    let status_order: Vec<TaskStatus> = seen
        .iter()
        .filter_map(|e| match e {
            CoreEvent::TaskStatus { task_id: t, status } if t == &task_id => Some(*status),
            _ => None,
        })
        .collect();
    let in_progress_at = status_order
        .iter()
        .position(|s| *s == TaskStatus::InProgress)
        .expect("in_progress status event");
    let ai_review_at = status_order
        .iter()
        .position(|s| *s == TaskStatus::AiReview)
        .expect("ai_review status event");
    assert!(in_progress_at < ai_review_at);
    assert!(seen.iter().any(|e| matches!(
        e,
        CoreEvent::TaskProgress { task_id: t, progress }
            if t == &task_id && progress.phase == "coding" && progress.percent == 50
    )));

    // Approve: QA artifact written, task derives done.
    env.orchestrator
        .task_review(&task_id, true, None)
        .await
        .unwrap();
    wait_for_status(&env, &task_id, TaskStatus::Done).await;
    assert!(env.framework.join("specs/add-x/qa_report.md").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn qa_rejection_loop() {
    let env = setup().await;

    let task = env
        .orchestrator
        .task_create(&env.project_id, "Add Y", "Implement Y")
        .await
        .unwrap();
    let task_id = task.id.clone();
    let spec_dir = env.framework.join("specs").join(task_id.as_ref());

    // Drive the task to ai_review.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !spec_dir.join("implementation_plan.json").exists() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    wait_for_status(&env, &task_id, TaskStatus::Backlog).await;
    env.orchestrator
        .task_start(&task_id, StartOptions::default())
        .await
        .unwrap();
    wait_for_status(&env, &task_id, TaskStatus::AiReview).await;

    // Reject with feedback: fix request written, QA re-spawned.
    env.orchestrator
        .task_review(&task_id, false, Some("Handle null input"))
        .await
        .unwrap();
    let fix = std::fs::read_to_string(spec_dir.join("qa_fix_request.md")).unwrap();
    assert!(fix.contains("Handle null input"));

    // The QA agent exits 0 without a verdict; the plan is still fully
    // completed, so the task settles back in ai_review.
    wait_for_status(&env, &task_id, TaskStatus::AiReview).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_with_divergence_transitions_to_done() {
    let env = setup().await;

    let task = env
        .orchestrator
        .task_create(&env.project_id, "Change App", "Change app behavior")
        .await
        .unwrap();
    let task_id = task.id.clone();
    let repo = PathBuf::from(&env.registry.get(&env.project_id).await.unwrap().path);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let spec_dir = env.framework.join("specs").join(task_id.as_ref());
    while !spec_dir.join("implementation_plan.json").exists() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    env.orchestrator
        .task_start(&task_id, StartOptions::default())
        .await
        .unwrap();
    wait_for_status(&env, &task_id, TaskStatus::AiReview).await;

    // Task branch edits app.py.
    let status = env.orchestrator.worktree_status(&task_id).await.unwrap();
    assert!(status.exists);
    let wt = PathBuf::from(status.path.unwrap());
    std::fs::write(wt.join("app.py"), "def main():\n    return 2\n").unwrap();
    sh(&wt, "git", &["add", "."]);
    sh(&wt, "git", &["commit", "-m", "task work"]);

    // Base advances touching the same file.
    std::fs::write(repo.join("app.py"), "def main():\n    return 3\n").unwrap();
    sh(&repo, "git", &["add", "."]);
    sh(&repo, "git", &["commit", "-m", "base advances"]);

    let preview = env.orchestrator.merge_preview(&task_id).await.unwrap();
    let divergence = preview.divergence.expect("divergence");
    assert_eq!(divergence.commits_behind, 1);
    assert!(!divergence.conflicting_files.is_empty());

    env.orchestrator
        .merge(&task_id, false, &TakeTheirs)
        .await
        .unwrap();
    wait_for_status(&env, &task_id, TaskStatus::Done).await;

    let status = env.orchestrator.worktree_status(&task_id).await.unwrap();
    assert!(!status.exists);
    let merged = std::fs::read_to_string(repo.join("app.py")).unwrap();
    assert_eq!(merged, "def main():\n    return 2\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn discard_returns_task_to_backlog() {
    let env = setup().await;

    let task = env
        .orchestrator
        .task_create(&env.project_id, "Discard Me", "Work to throw away")
        .await
        .unwrap();
    let task_id = task.id.clone();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let spec_dir = env.framework.join("specs").join(task_id.as_ref());
    while !spec_dir.join("implementation_plan.json").exists() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    wait_for_status(&env, &task_id, TaskStatus::Backlog).await;
    env.orchestrator
        .task_start(&task_id, StartOptions::default())
        .await
        .unwrap();
    wait_for_status(&env, &task_id, TaskStatus::AiReview).await;
    assert!(env.orchestrator.worktree_status(&task_id).await.unwrap().exists);

    env.orchestrator.worktree_discard(&task_id).await.unwrap();
    let status = env.orchestrator.worktree_status(&task_id).await.unwrap();
    assert!(!status.exists);
    wait_for_status(&env, &task_id, TaskStatus::Backlog).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_description_creates_nothing() {
    let env = setup().await;
    let err = env
        .orchestrator
        .task_create(&env.project_id, "No Body", "   ")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");

    let specs: Vec<_> = std::fs::read_dir(env.framework.join("specs"))
        .unwrap()
        .collect();
    assert!(specs.is_empty(), "no spec directory may be created");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_framework_is_invalid_request() {
    let env = setup().await;
    let bare = TempDir::new().unwrap();
    sh(bare.path(), "git", &["init", "-b", "main"]);
    let project = env.registry.add("bare", bare.path()).await.unwrap();

    let err = env
        .orchestrator
        .task_create(&project.id, "Nope", "There is no framework here")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");
    assert!(err.to_string().contains("auto-build"));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_without_plan_runs_spec_creation_first() {
    let env = setup().await;

    // A spec directory created out-of-band, with no plan.
    let spec_dir = env.framework.join("specs/manual-task");
    std::fs::create_dir_all(&spec_dir).unwrap();
    std::fs::write(
        spec_dir.join("spec.md"),
        "# Manual Task\n\n## Overview\n\nDo the thing.\n",
    )
    .unwrap();
    let task_id = Id::from_string("manual-task");

    env.orchestrator
        .task_start(&task_id, StartOptions::default())
        .await
        .unwrap();

    // Spec creation runs implicitly, then implementation, landing in
    // ai_review with the completed plan.
    wait_for_status(&env, &task_id, TaskStatus::AiReview).await;
    assert!(spec_dir.join("implementation_plan.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn status_derivation_is_stable_across_reads() {
    let env = setup().await;
    let task = env
        .orchestrator
        .task_create(&env.project_id, "Stable", "Stable status")
        .await
        .unwrap();
    let task_id = task.id.clone();
    wait_for_status(&env, &task_id, TaskStatus::Backlog).await;

    let mut statuses = HashSet::new();
    for _ in 0..5 {
        let tasks = env.orchestrator.task_list(&env.project_id).await.unwrap();
        statuses.insert(tasks.iter().find(|t| t.id == task_id).unwrap().status);
    }
    assert_eq!(statuses.len(), 1, "status flapped without mutation");
}

#[tokio::test(flavor = "multi_thread")]
async fn task_update_round_trips_through_list() {
    let env = setup().await;
    let task = env
        .orchestrator
        .task_create(&env.project_id, "Old Name", "Original description")
        .await
        .unwrap();
    let task_id = task.id.clone();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let spec_dir = env.framework.join("specs").join(task_id.as_ref());
    while !spec_dir.join("implementation_plan.json").exists() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    wait_for_status(&env, &task_id, TaskStatus::Backlog).await;

    let patch = autobuildd::orchestrator::TaskPatch {
        title: Some("New Name".to_string()),
        description: Some("Sharper description".to_string()),
    };
    env.orchestrator.task_update(&task_id, patch.clone()).await.unwrap();
    // Idempotent: applying the same patch again changes nothing further.
    env.orchestrator.task_update(&task_id, patch).await.unwrap();

    let tasks = env.orchestrator.task_list(&env.project_id).await.unwrap();
    let listed = tasks.iter().find(|t| t.id == task_id).unwrap();
    assert_eq!(listed.title, "New Name");
    assert_eq!(listed.description, "Sharper description");
}
