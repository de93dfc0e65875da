//! Task orchestrator.
//!
//! Owns the task operations, the lifecycle state machine, and the glue
//! between subprocess exits, artifact events, and the event bus. Task status
//! itself is derived from artifacts on every read; the orchestrator only
//! layers the few facts the filesystem cannot carry: which tasks were
//! stopped or crashed since their artifacts last moved, and which looked
//! in-flight at startup with no live process behind them.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use autobuild_core::envfile::EnvConfig;
use autobuild_core::error::{CoreError, CoreResult};
use autobuild_core::progress;
use autobuild_core::qa;
use autobuild_core::types::{
    AgentKind, ExecutionProgress, Id, MergeOutcome, MergePreview, Project, Task, TaskStatus,
    WorktreeDiff, WorktreeStatus,
};
use autobuild_core::CoreEvent;
use autobuild_core::Settings;
use tracing::{info, warn};

use crate::agents::AgentInvocation;
use crate::bus::EventBus;
use crate::layout;
use crate::scanner;
use crate::supervisor::{EventScope, ExitNotice, ScopeKind, Supervisor};
use crate::watcher::WatcherSet;
use crate::worktree::{ConflictResolver, WorktreeManager};

/// Options accepted by `task.start`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StartOptions {
    pub parallel: Option<bool>,
    pub workers: Option<u32>,
    pub model: Option<String>,
}

/// Fields accepted by `task.update`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
}

pub struct Orchestrator {
    registry: Arc<crate::registry::Registry>,
    supervisor: Arc<Supervisor>,
    watchers: Arc<WatcherSet>,
    worktrees: Arc<WorktreeManager>,
    bus: EventBus,
    settings: Arc<StdMutex<Settings>>,
    /// Tasks the reviewer stopped; forces `backlog` over plan-derived state.
    stopped: StdMutex<HashSet<String>>,
    /// Tasks whose agent died with a non-zero exit; forces `human_review`.
    crashed: StdMutex<HashSet<String>>,
    /// Tasks that looked in-flight at startup with no live process.
    stuck: StdMutex<HashSet<String>>,
    /// Tasks whose `start` is waiting on spec creation to finish.
    pending_start: StdMutex<HashMap<String, StartOptions>>,
    /// Latest plan-derived progress per task.
    progress: StdMutex<HashMap<String, ExecutionProgress>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        registry: Arc<crate::registry::Registry>,
        supervisor: Arc<Supervisor>,
        watchers: Arc<WatcherSet>,
        worktrees: Arc<WorktreeManager>,
        bus: EventBus,
        settings: Arc<StdMutex<Settings>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            supervisor,
            watchers,
            worktrees,
            bus,
            settings,
            stopped: StdMutex::new(HashSet::new()),
            crashed: StdMutex::new(HashSet::new()),
            stuck: StdMutex::new(HashSet::new()),
            pending_start: StdMutex::new(HashMap::new()),
            progress: StdMutex::new(HashMap::new()),
        })
    }

    fn interpreter(&self) -> String {
        self.settings
            .lock()
            .expect("settings lock")
            .interpreter_path
            .clone()
            .unwrap_or_else(|| "python3".to_string())
    }

    /// Resolve a project's framework directory, absolute.
    fn framework_dir(&self, project: &Project) -> CoreResult<PathBuf> {
        let project_dir = Path::new(&project.path);
        match &project.framework_dir {
            Some(rel) => Ok(project_dir.join(rel)),
            None => layout::find_framework_dir(project_dir).ok_or_else(|| {
                CoreError::InvalidRequest(format!(
                    "framework not installed in {}; expected {} or {}",
                    project.path,
                    layout::FRAMEWORK_DIR_NAMES[0],
                    layout::FRAMEWORK_DIR_NAMES[1],
                ))
            }),
        }
    }

    /// Find the project owning a task by probing for its spec directory.
    async fn resolve_task(&self, task_id: &Id) -> CoreResult<(Project, PathBuf, PathBuf)> {
        for project in self.registry.list().await {
            let Ok(framework) = self.framework_dir(&project) else {
                continue;
            };
            let spec = layout::spec_dir(&framework, task_id.as_ref());
            if spec.is_dir() {
                return Ok((project, framework, spec));
            }
        }
        Err(CoreError::NotFound(format!("task {task_id}")))
    }

    fn env_pairs(&self, framework_dir: &Path) -> Vec<(String, String)> {
        EnvConfig::load(&layout::env_path(framework_dir))
            .map(|cfg| cfg.to_pairs())
            .unwrap_or_default()
    }

    // --- Operations ---

    /// Allocate a task, create its spec directory, and launch spec creation.
    pub async fn task_create(
        self: &Arc<Self>,
        project_id: &Id,
        title: &str,
        description: &str,
    ) -> CoreResult<Task> {
        if description.trim().is_empty() {
            return Err(CoreError::InvalidRequest(
                "task description must not be empty".to_string(),
            ));
        }
        if title.trim().is_empty() {
            return Err(CoreError::InvalidRequest(
                "task title must not be empty".to_string(),
            ));
        }
        let project = self
            .registry
            .get(project_id)
            .await
            .map_err(|_| CoreError::NotFound(format!("project {project_id}")))?;
        let framework = self.framework_dir(&project)?;

        // Allocate a unique spec id under the spec root.
        let base_slug = layout::slugify(title);
        let mut spec_id = base_slug.clone();
        let mut counter = 2;
        while layout::spec_dir(&framework, &spec_id).exists() {
            spec_id = format!("{base_slug}-{counter}");
            counter += 1;
        }
        let spec_dir = layout::spec_dir(&framework, &spec_id);
        debug_assert!(layout::is_under_specs_root(&framework, &spec_dir));
        std::fs::create_dir_all(&spec_dir)?;
        std::fs::write(
            layout::spec_doc_path(&spec_dir),
            format!("# {title}\n\n## Overview\n\n{description}\n"),
        )?;

        let task_id = Id::from_string(spec_id.clone());
        if let Err(e) = self
            .watchers
            .watch(&task_id, &project.id, &spec_id, &spec_dir)
        {
            warn!(task_id = %task_id, error = %e, "watcher setup failed");
        }

        // Spec creation runs in the background; a spawn failure is a single
        // error event and the task stays in backlog.
        let invocation = AgentInvocation::SpecCreation {
            spec_id: spec_id.clone(),
            description: description.to_string(),
        };
        let command = invocation.command(&framework, &self.interpreter());
        let env = self.env_pairs(&framework);
        if let Err(e) = self
            .supervisor
            .spawn(
                EventScope::Task(task_id.clone()),
                AgentKind::SpecCreation,
                &command,
                &env,
            )
            .await
        {
            self.bus.publish(CoreEvent::TaskError {
                task_id: task_id.clone(),
                message: e.to_string(),
            });
        }

        // The placeholder reports backlog; the spec run announces itself
        // through events, not through the create response.
        Ok(scanner::scan_one(
            &project.id,
            &spec_dir,
            &spec_id,
            &HashSet::new(),
            &HashSet::new(),
        ))
    }

    /// List tasks by scanning the project's spec directories.
    pub async fn task_list(&self, project_id: &Id) -> CoreResult<Vec<Task>> {
        let project = self
            .registry
            .get(project_id)
            .await
            .map_err(|_| CoreError::NotFound(format!("project {project_id}")))?;
        let framework = self.framework_dir(&project)?;

        let live = self.live_set();
        let stuck = self.stuck.lock().expect("stuck lock").clone();
        let mut tasks = scanner::scan_tasks(&project.id, &framework, &live, &stuck);

        let stopped = self.stopped.lock().expect("stopped lock").clone();
        let crashed = self.crashed.lock().expect("crashed lock").clone();
        let progress = self.progress.lock().expect("progress lock").clone();
        for task in &mut tasks {
            let sid = task.id.as_ref().to_string();
            // Reviewer actions the artifacts cannot express yet. A stop or
            // discard overrides plan-derived states until the task moves
            // again; a crash pins the task in human review.
            if !live.contains(&sid)
                && matches!(task.status, TaskStatus::InProgress | TaskStatus::AiReview)
            {
                if stopped.contains(&sid) {
                    task.status = TaskStatus::Backlog;
                } else if crashed.contains(&sid) && task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::HumanReview;
                }
            }
            task.logs = self.supervisor.logs(&task.id);
            task.progress = progress.get(&sid).cloned();
        }
        Ok(tasks)
    }

    /// Start (or resume) implementation for a task.
    pub async fn task_start(self: &Arc<Self>, task_id: &Id, options: StartOptions) -> CoreResult<()> {
        if self.supervisor.is_alive(task_id) {
            // Already in flight: no-op, reported on the event stream.
            self.bus.publish(CoreEvent::TaskError {
                task_id: task_id.clone(),
                message: "task is already in flight".to_string(),
            });
            return Ok(());
        }
        let (project, framework, spec_dir) = self.resolve_task(task_id).await?;
        self.clear_flags(task_id);

        if !layout::plan_path(&spec_dir).exists() {
            // No plan yet: run spec creation first and remember the start.
            info!(task_id = %task_id, "no plan; running spec creation first");
            self.pending_start
                .lock()
                .expect("pending lock")
                .insert(task_id.as_ref().to_string(), options);
            let description = std::fs::read_to_string(layout::spec_doc_path(&spec_dir))
                .ok()
                .and_then(|content| scanner::extract_overview(&content))
                .unwrap_or_else(|| task_id.to_string());
            let invocation = AgentInvocation::SpecCreation {
                spec_id: task_id.as_ref().to_string(),
                description,
            };
            return self
                .spawn_for_task(&project, &framework, &spec_dir, task_id, invocation)
                .await;
        }

        self.start_implementation(&project, &framework, &spec_dir, task_id, options)
            .await
    }

    async fn start_implementation(
        self: &Arc<Self>,
        project: &Project,
        framework: &Path,
        spec_dir: &Path,
        task_id: &Id,
        options: StartOptions,
    ) -> CoreResult<()> {
        // Worktree is created just-in-time for the first implementation run.
        let record = self
            .worktrees
            .ensure(project, task_id)
            .await
            .map_err(|e| CoreError::External(e.to_string()))?;

        let parallel = options
            .parallel
            .unwrap_or(project.settings.parallelism_enabled);
        let workers = options
            .workers
            .unwrap_or(project.settings.max_workers)
            .max(1);
        let model = options
            .model
            .clone()
            .or_else(|| Some(project.settings.preferred_model.clone()));

        let invocation = AgentInvocation::Implementation {
            spec_id: task_id.as_ref().to_string(),
            parallel_workers: parallel.then_some(workers),
            model,
        };
        let command = invocation.command(framework, &self.interpreter());
        let mut env = self.env_pairs(framework);
        env.push((
            "AUTO_BUILD_WORKTREE_PATH".to_string(),
            record.path.clone(),
        ));

        self.supervisor
            .spawn(
                EventScope::Task(task_id.clone()),
                AgentKind::Implementation,
                &command,
                &env,
            )
            .await
            .map_err(|e| {
                self.bus.publish(CoreEvent::TaskError {
                    task_id: task_id.clone(),
                    message: e.to_string(),
                });
                CoreError::External(e.to_string())
            })?;

        if !self.watchers.is_watching(task_id) {
            if let Err(e) =
                self.watchers
                    .watch(task_id, &project.id, task_id.as_ref(), spec_dir)
            {
                warn!(task_id = %task_id, error = %e, "watcher setup failed");
            }
        }

        self.bus.publish(CoreEvent::TaskStatus {
            task_id: task_id.clone(),
            status: TaskStatus::InProgress,
        });
        Ok(())
    }

    async fn spawn_for_task(
        self: &Arc<Self>,
        project: &Project,
        framework: &Path,
        spec_dir: &Path,
        task_id: &Id,
        invocation: AgentInvocation,
    ) -> CoreResult<()> {
        let kind = invocation.kind();
        let command = invocation.command(framework, &self.interpreter());
        let env = self.env_pairs(framework);
        self.supervisor
            .spawn(EventScope::Task(task_id.clone()), kind, &command, &env)
            .await
            .map_err(|e| {
                self.bus.publish(CoreEvent::TaskError {
                    task_id: task_id.clone(),
                    message: e.to_string(),
                });
                CoreError::External(e.to_string())
            })?;
        if !self.watchers.is_watching(task_id) {
            if let Err(e) =
                self.watchers
                    .watch(task_id, &project.id, task_id.as_ref(), spec_dir)
            {
                warn!(task_id = %task_id, error = %e, "watcher setup failed");
            }
        }
        Ok(())
    }

    /// Terminate the supervised process and return the task to backlog.
    pub async fn task_stop(&self, task_id: &Id) -> CoreResult<()> {
        self.resolve_task(task_id).await?;
        self.pending_start
            .lock()
            .expect("pending lock")
            .remove(task_id.as_ref());
        if self.supervisor.stop(task_id).is_err() {
            // Nothing running; still an explicit return to backlog.
            self.stopped
                .lock()
                .expect("stopped lock")
                .insert(task_id.as_ref().to_string());
            self.bus.publish(CoreEvent::TaskStatus {
                task_id: task_id.clone(),
                status: TaskStatus::Backlog,
            });
        }
        Ok(())
    }

    /// Reviewer verdict on a task in review.
    pub async fn task_review(
        self: &Arc<Self>,
        task_id: &Id,
        approved: bool,
        feedback: Option<&str>,
    ) -> CoreResult<()> {
        let (project, framework, spec_dir) = self.resolve_task(task_id).await?;
        self.clear_flags(task_id);

        if approved {
            let title = scanner::scan_one(
                &project.id,
                &spec_dir,
                task_id.as_ref(),
                &HashSet::new(),
                &HashSet::new(),
            )
            .title;
            std::fs::write(
                layout::qa_report_path(&spec_dir),
                qa::approval_report(&title),
            )?;
            self.bus.publish(CoreEvent::TaskStatus {
                task_id: task_id.clone(),
                status: TaskStatus::Done,
            });
            return Ok(());
        }

        let feedback = feedback.unwrap_or("rejected by reviewer");
        // Append so successive rejections accumulate context for the agent.
        let fix_path = layout::qa_fix_request_path(&spec_dir);
        let mut content = std::fs::read_to_string(&fix_path).unwrap_or_default();
        content.push_str(&qa::fix_request(feedback));
        std::fs::write(&fix_path, content)?;
        // The stale verdict would otherwise mask the re-run.
        let report = layout::qa_report_path(&spec_dir);
        if report.exists() {
            std::fs::remove_file(&report)?;
        }

        let invocation = AgentInvocation::Qa {
            spec_id: task_id.as_ref().to_string(),
            qa_only: true,
        };
        self.spawn_for_task(&project, &framework, &spec_dir, task_id, invocation)
            .await?;
        self.bus.publish(CoreEvent::TaskStatus {
            task_id: task_id.clone(),
            status: TaskStatus::InProgress,
        });
        Ok(())
    }

    /// Patch title/description, updating the on-disk artifacts. Idempotent.
    pub async fn task_update(&self, task_id: &Id, patch: TaskPatch) -> CoreResult<Task> {
        let (project, _framework, spec_dir) = self.resolve_task(task_id).await?;

        if let Some(title) = &patch.title {
            let plan_path = layout::plan_path(&spec_dir);
            if plan_path.exists() {
                // Edit as a raw document so agent-written fields survive.
                let content = std::fs::read_to_string(&plan_path)?;
                match serde_json::from_str::<serde_json::Value>(&content) {
                    Ok(mut doc) => {
                        if let Some(obj) = doc.as_object_mut() {
                            obj.insert(
                                "feature".to_string(),
                                serde_json::Value::String(title.clone()),
                            );
                        }
                        let rendered = serde_json::to_vec_pretty(&doc)
                            .map_err(|e| CoreError::ArtifactParse(e.to_string()))?;
                        std::fs::write(&plan_path, rendered)?;
                    }
                    Err(e) => {
                        return Err(CoreError::ArtifactParse(format!(
                            "implementation plan is unreadable: {e}"
                        )))
                    }
                }
            }
            update_spec_doc_title(&spec_dir, title)?;
        }

        if let Some(description) = &patch.description {
            update_spec_doc_overview(&spec_dir, description)?;
        }

        Ok(scanner::scan_one(
            &project.id,
            &spec_dir,
            task_id.as_ref(),
            &self.live_set(),
            &self.stuck.lock().expect("stuck lock").clone(),
        ))
    }

    /// Remove the spec directory, the worktree, and all orchestrator state
    /// for a task.
    pub async fn task_delete(&self, task_id: &Id) -> CoreResult<()> {
        let (project, _framework, spec_dir) = self.resolve_task(task_id).await?;
        let _ = self.supervisor.stop(task_id);
        self.supervisor.stop_and_wait(task_id).await;
        self.watchers.unwatch(task_id);
        self.worktrees
            .discard(&project, task_id)
            .await
            .map_err(|e| CoreError::External(e.to_string()))?;
        std::fs::remove_dir_all(&spec_dir)?;
        self.clear_flags(task_id);
        info!(task_id = %task_id, "task deleted");
        Ok(())
    }

    // --- Worktree operations (task-aware wrappers) ---

    pub async fn worktree_status(&self, task_id: &Id) -> CoreResult<WorktreeStatus> {
        let (project, _, _) = self.resolve_task(task_id).await?;
        self.worktrees
            .status(&project, task_id)
            .await
            .map_err(|e| CoreError::External(e.to_string()))
    }

    pub async fn worktree_diff(&self, task_id: &Id) -> CoreResult<WorktreeDiff> {
        let (project, _, _) = self.resolve_task(task_id).await?;
        self.worktrees
            .diff(&project, task_id)
            .await
            .map_err(|e| CoreError::External(e.to_string()))
    }

    pub async fn merge_preview(&self, task_id: &Id) -> CoreResult<MergePreview> {
        let (project, _, _) = self.resolve_task(task_id).await?;
        self.worktrees
            .merge_preview(&project, task_id)
            .await
            .map_err(|e| CoreError::External(e.to_string()))
    }

    /// Execute the merge; success writes the approval artifact so the task
    /// derives as done, and the worktree is gone.
    pub async fn merge(
        &self,
        task_id: &Id,
        stage_only: bool,
        resolver: &dyn ConflictResolver,
    ) -> CoreResult<MergeOutcome> {
        let (project, _framework, spec_dir) = self.resolve_task(task_id).await?;
        let outcome = self
            .worktrees
            .merge(&project, task_id, stage_only, resolver)
            .await
            .map_err(|e| CoreError::External(e.to_string()))?;

        let report = layout::qa_report_path(&spec_dir);
        if !report.exists()
            || std::fs::read_to_string(&report)
                .map(|c| qa::detect_verdict(&c) != Some(qa::QaVerdict::Approved))
                .unwrap_or(true)
        {
            let title = scanner::scan_one(
                &project.id,
                &spec_dir,
                task_id.as_ref(),
                &HashSet::new(),
                &HashSet::new(),
            )
            .title;
            std::fs::write(report, qa::approval_report(&title))?;
        }
        self.clear_flags(task_id);
        self.bus.publish(CoreEvent::TaskStatus {
            task_id: task_id.clone(),
            status: TaskStatus::Done,
        });
        Ok(outcome)
    }

    /// Merge using the framework's merge agent as the conflict resolver.
    pub async fn merge_with_agent(
        &self,
        task_id: &Id,
        stage_only: bool,
    ) -> CoreResult<MergeOutcome> {
        let (_, framework, _) = self.resolve_task(task_id).await?;
        let resolver = crate::agents::AgentResolver {
            framework_dir: framework,
            interpreter: self.interpreter(),
        };
        self.merge(task_id, stage_only, &resolver).await
    }

    /// Discard the worktree; the task returns to backlog.
    pub async fn worktree_discard(&self, task_id: &Id) -> CoreResult<()> {
        let (project, _, _) = self.resolve_task(task_id).await?;
        self.worktrees
            .discard(&project, task_id)
            .await
            .map_err(|e| CoreError::External(e.to_string()))?;
        self.stopped
            .lock()
            .expect("stopped lock")
            .insert(task_id.as_ref().to_string());
        self.bus.publish(CoreEvent::TaskStatus {
            task_id: task_id.clone(),
            status: TaskStatus::Backlog,
        });
        Ok(())
    }

    // --- Project-level agent runs ---

    pub async fn roadmap_run(self: &Arc<Self>, project_id: &Id, refresh: bool) -> CoreResult<()> {
        let project = self
            .registry
            .get(project_id)
            .await
            .map_err(|_| CoreError::NotFound(format!("project {project_id}")))?;
        let framework = self.framework_dir(&project)?;
        let invocation = AgentInvocation::Roadmap {
            project_path: project.path.clone(),
            refresh,
        };
        let command = invocation.command(&framework, &self.interpreter());
        let env = self.env_pairs(&framework);
        self.supervisor
            .spawn(
                EventScope::Roadmap(project.id.clone()),
                AgentKind::Roadmap,
                &command,
                &env,
            )
            .await
            .map_err(|e| {
                self.bus.publish(CoreEvent::RoadmapError {
                    project_id: project.id.clone(),
                    message: e.to_string(),
                });
                CoreError::External(e.to_string())
            })
    }

    pub async fn ideation_run(
        self: &Arc<Self>,
        project_id: &Id,
        categories: Vec<String>,
        include_context: bool,
        max_ideas_per_category: Option<u32>,
        refresh: bool,
    ) -> CoreResult<()> {
        let project = self
            .registry
            .get(project_id)
            .await
            .map_err(|_| CoreError::NotFound(format!("project {project_id}")))?;
        let framework = self.framework_dir(&project)?;
        let invocation = AgentInvocation::Ideation {
            project_path: project.path.clone(),
            categories,
            include_context,
            max_ideas_per_category,
            refresh,
        };
        let command = invocation.command(&framework, &self.interpreter());
        let env = self.env_pairs(&framework);
        self.supervisor
            .spawn(
                EventScope::Ideation(project.id.clone()),
                AgentKind::Ideation,
                &command,
                &env,
            )
            .await
            .map_err(|e| {
                self.bus.publish(CoreEvent::IdeationError {
                    project_id: project.id.clone(),
                    message: e.to_string(),
                });
                CoreError::External(e.to_string())
            })
    }

    // --- Background handlers ---

    /// Turn a supervised-process exit into status transitions and events.
    pub async fn handle_exit(self: &Arc<Self>, notice: ExitNotice) {
        match notice.scope_kind {
            ScopeKind::Task => self.handle_task_exit(notice).await,
            ScopeKind::Roadmap => {
                let event = match (notice.canceled, notice.exit_code) {
                    (false, Some(0)) => CoreEvent::RoadmapComplete {
                        project_id: notice.subject,
                    },
                    _ => {
                        let message = exit_reason(&notice);
                        CoreEvent::RoadmapError {
                            project_id: notice.subject,
                            message,
                        }
                    }
                };
                self.bus.publish(event);
            }
            ScopeKind::Ideation => {
                let event = match (notice.canceled, notice.exit_code) {
                    (false, Some(0)) => CoreEvent::IdeationComplete {
                        project_id: notice.subject,
                    },
                    _ => {
                        let message = exit_reason(&notice);
                        CoreEvent::IdeationError {
                            project_id: notice.subject,
                            message,
                        }
                    }
                };
                self.bus.publish(event);
            }
        }
    }

    async fn handle_task_exit(self: &Arc<Self>, notice: ExitNotice) {
        let task_id = notice.subject.clone();
        let sid = task_id.as_ref().to_string();

        if notice.canceled {
            self.stopped.lock().expect("stopped lock").insert(sid);
            self.bus.publish(CoreEvent::TaskStatus {
                task_id,
                status: TaskStatus::Backlog,
            });
            return;
        }

        if notice.exit_code != Some(0) {
            warn!(task_id = %task_id, exit_code = ?notice.exit_code, "agent crashed");
            self.crashed.lock().expect("crashed lock").insert(sid);
            self.bus.publish(CoreEvent::TaskError {
                task_id: task_id.clone(),
                message: exit_reason(&notice),
            });
            self.bus.publish(CoreEvent::TaskStatus {
                task_id,
                status: TaskStatus::HumanReview,
            });
            return;
        }

        // Exit 0: a deferred start resumes once the spec exists.
        if notice.agent == AgentKind::SpecCreation {
            let pending = self
                .pending_start
                .lock()
                .expect("pending lock")
                .remove(&sid);
            if let Some(options) = pending {
                if let Ok((project, framework, spec_dir)) = self.resolve_task(&task_id).await {
                    if layout::plan_path(&spec_dir).exists() {
                        if let Err(e) = self
                            .start_implementation(&project, &framework, &spec_dir, &task_id, options)
                            .await
                        {
                            self.bus.publish(CoreEvent::TaskError {
                                task_id: task_id.clone(),
                                message: e.to_string(),
                            });
                        }
                        return;
                    }
                }
            }
        }

        // Re-derive from artifacts and publish the transition.
        if let Ok((project, framework, _)) = self.resolve_task(&task_id).await {
            let tasks = scanner::scan_tasks(
                &project.id,
                &framework,
                &self.live_set(),
                &HashSet::new(),
            );
            if let Some(task) = tasks.iter().find(|t| t.id == task_id) {
                self.bus.publish(CoreEvent::TaskStatus {
                    task_id: task_id.clone(),
                    status: task.status,
                });
            }
        }
    }

    /// Turn a debounced artifact change into progress and status events.
    pub async fn handle_artifact(self: &Arc<Self>, event: autobuild_core::types::ArtifactEvent) {
        use autobuild_core::types::ArtifactKind;
        let task_id = Id::from_string(event.spec_id.clone());

        match event.kind {
            ArtifactKind::Plan => {
                if let Some(content) = event.content.as_deref() {
                    if let Ok(plan) = autobuild_core::ImplementationPlan::parse(content) {
                        let (completed, total) = plan.completion();
                        let update = progress::plan_progress(completed, total);
                        self.progress
                            .lock()
                            .expect("progress lock")
                            .insert(event.spec_id.clone(), update.clone());
                        self.bus.publish(CoreEvent::TaskProgress {
                            task_id: task_id.clone(),
                            progress: update,
                        });
                    }
                }
                self.publish_derived_status(&task_id).await;
            }
            ArtifactKind::QaReport => {
                self.clear_flags(&task_id);
                self.publish_derived_status(&task_id).await;
            }
            ArtifactKind::QaFixRequest | ArtifactKind::TaskLogs => {}
            ArtifactKind::MemoryEpisode | ArtifactKind::ProjectIndex => {
                tracing::debug!(spec_id = %event.spec_id, kind = ?event.kind, "artifact updated");
            }
        }
    }

    async fn publish_derived_status(self: &Arc<Self>, task_id: &Id) {
        if let Ok((project, framework, _)) = self.resolve_task(task_id).await {
            let tasks = scanner::scan_tasks(
                &project.id,
                &framework,
                &self.live_set(),
                &self.stuck.lock().expect("stuck lock").clone(),
            );
            if let Some(task) = tasks.iter().find(|t| &t.id == task_id) {
                self.bus.publish(CoreEvent::TaskStatus {
                    task_id: task_id.clone(),
                    status: task.status,
                });
            }
        }
    }

    /// Startup reconciliation: tasks whose artifacts say in-flight but have
    /// no live subprocess are flagged stuck, and watchers are re-attached to
    /// everything still moving.
    pub async fn reconcile(self: &Arc<Self>) {
        for project in self.registry.list().await {
            let Ok(framework) = self.framework_dir(&project) else {
                continue;
            };
            let tasks =
                scanner::scan_tasks(&project.id, &framework, &HashSet::new(), &HashSet::new());
            for task in tasks {
                if task.status == TaskStatus::InProgress {
                    info!(task_id = %task.id, "task looked in-flight at startup; marking stuck");
                    self.stuck
                        .lock()
                        .expect("stuck lock")
                        .insert(task.id.as_ref().to_string());
                }
                if matches!(task.status, TaskStatus::InProgress | TaskStatus::AiReview) {
                    let spec_dir = layout::spec_dir(&framework, task.id.as_ref());
                    if let Err(e) =
                        self.watchers
                            .watch(&task.id, &project.id, task.id.as_ref(), &spec_dir)
                    {
                        warn!(task_id = %task.id, error = %e, "watcher re-attach failed");
                    }
                }
            }
        }
    }

    fn live_set(&self) -> HashSet<String> {
        self.supervisor
            .live_subjects()
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect()
    }

    fn clear_flags(&self, task_id: &Id) {
        let sid = task_id.as_ref();
        self.stopped.lock().expect("stopped lock").remove(sid);
        self.crashed.lock().expect("crashed lock").remove(sid);
        self.stuck.lock().expect("stuck lock").remove(sid);
    }
}

fn exit_reason(notice: &ExitNotice) -> String {
    if notice.canceled {
        return "canceled by reviewer".to_string();
    }
    match notice.exit_code {
        Some(code) => format!("{} exited with code {code}", notice.agent.as_str()),
        None => format!("{} was killed by a signal", notice.agent.as_str()),
    }
}

/// Rewrite the `# Title` heading of a spec document.
fn update_spec_doc_title(spec_dir: &Path, title: &str) -> std::io::Result<()> {
    let path = layout::spec_doc_path(spec_dir);
    let content = std::fs::read_to_string(&path).unwrap_or_default();
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    match lines.iter().position(|l| l.starts_with("# ")) {
        Some(idx) => lines[idx] = format!("# {title}"),
        None => lines.insert(0, format!("# {title}")),
    }
    std::fs::write(&path, lines.join("\n") + "\n")
}

/// Replace the paragraph under `## Overview`, creating the section when
/// missing.
fn update_spec_doc_overview(spec_dir: &Path, description: &str) -> std::io::Result<()> {
    let path = layout::spec_doc_path(spec_dir);
    let content = std::fs::read_to_string(&path).unwrap_or_default();

    let mut out: Vec<String> = Vec::new();
    let mut replaced = false;
    let mut skipping = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            if heading.trim().eq_ignore_ascii_case("overview") {
                out.push("## Overview".to_string());
                out.push(String::new());
                out.push(description.to_string());
                out.push(String::new());
                replaced = true;
                skipping = true;
                continue;
            }
            skipping = false;
        } else if trimmed.starts_with('#') {
            skipping = false;
        }
        if !skipping {
            out.push(line.to_string());
        }
    }
    if !replaced {
        out.push("## Overview".to_string());
        out.push(String::new());
        out.push(description.to_string());
    }
    std::fs::write(&path, out.join("\n") + "\n")
}
