//! Subprocess supervision.
//!
//! At most one supervised process per subject (task, or a project-level
//! roadmap/ideation run). Spawning kills any predecessor first; stopping
//! sends a graceful termination and escalates to a hard kill after a grace
//! period. Stdout and stderr are pumped line by line into the log store, the
//! progress parser, and the event bus. A process that dies is never
//! restarted automatically.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use autobuild_core::progress;
use autobuild_core::types::{AgentKind, ExecutionProgress, Id};
use autobuild_core::CoreEvent;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::AgentCommand;
use crate::bus::EventBus;

/// Grace between the termination signal and the hard kill.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Retained log lines per subject.
const MAX_LOG_LINES: usize = 2000;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    #[error("no supervised process for {0}")]
    NotRunning(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// What the progress and completion events of a run attach to.
#[derive(Debug, Clone)]
pub enum EventScope {
    Task(Id),
    Roadmap(Id),
    Ideation(Id),
}

impl EventScope {
    fn subject(&self) -> &Id {
        match self {
            Self::Task(id) | Self::Roadmap(id) | Self::Ideation(id) => id,
        }
    }
}

/// Completion notice delivered to the orchestrator when a supervised
/// process leaves the table.
#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub subject: Id,
    pub scope_kind: ScopeKind,
    pub agent: AgentKind,
    pub exit_code: Option<i32>,
    /// True when the exit was forced by `stop`.
    pub canceled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Task,
    Roadmap,
    Ideation,
}

struct ProcHandle {
    agent: AgentKind,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// The supervision table plus per-subject log streams.
pub struct Supervisor {
    bus: EventBus,
    procs: StdMutex<HashMap<Id, ProcHandle>>,
    logs: StdMutex<HashMap<Id, Vec<String>>>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create the supervisor. The receiver carries exit notices for the
    /// orchestrator to turn into status transitions.
    pub fn new(bus: EventBus) -> (Arc<Self>, mpsc::UnboundedReceiver<ExitNotice>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                bus,
                procs: StdMutex::new(HashMap::new()),
                logs: StdMutex::new(HashMap::new()),
                exit_tx,
            }),
            exit_rx,
        )
    }

    /// Is a supervised process alive for this subject?
    pub fn is_alive(&self, subject: &Id) -> bool {
        self.procs.lock().expect("procs lock").contains_key(subject)
    }

    /// Subjects with live processes.
    pub fn live_subjects(&self) -> Vec<Id> {
        self.procs.lock().expect("procs lock").keys().cloned().collect()
    }

    pub fn started_at(&self, subject: &Id) -> Option<DateTime<Utc>> {
        self.procs
            .lock()
            .expect("procs lock")
            .get(subject)
            .map(|h| h.started_at)
    }

    /// Copy-on-read log snapshot for a subject.
    pub fn logs(&self, subject: &Id) -> Vec<String> {
        self.logs
            .lock()
            .expect("logs lock")
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    /// Spawn an agent under a subject, killing any predecessor first.
    ///
    /// Returns once the process is running; stdio pumping and exit handling
    /// continue in the background.
    pub async fn spawn(
        self: &Arc<Self>,
        scope: EventScope,
        agent: AgentKind,
        command: &AgentCommand,
        extra_env: &[(String, String)],
    ) -> Result<()> {
        let subject = scope.subject().clone();
        self.stop_and_wait(&subject).await;

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {e}", command.program.display())))?;

        let pid = child.id();
        info!(
            subject = %subject,
            agent = agent.as_str(),
            pid = ?pid,
            "agent spawned"
        );

        let cancel = CancellationToken::new();
        self.procs.lock().expect("procs lock").insert(
            subject.clone(),
            ProcHandle {
                agent,
                started_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );
        // A fresh run starts a fresh log stream.
        self.logs
            .lock()
            .expect("logs lock")
            .insert(subject.clone(), Vec::new());

        // Stdio pumps.
        if let Some(stdout) = child.stdout.take() {
            let this = Arc::clone(self);
            let scope = scope.clone();
            tokio::spawn(async move { this.pump_lines(scope, agent, stdout).await });
        }
        if let Some(stderr) = child.stderr.take() {
            let this = Arc::clone(self);
            let scope = scope.clone();
            tokio::spawn(async move { this.pump_lines(scope, agent, stderr).await });
        }

        // Waiter: reaps the child, honors cancellation, emits the notice.
        {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let (exit_code, canceled) = tokio::select! {
                    status = child.wait() => (status.ok().and_then(|s| s.code()), false),
                    () = cancel.cancelled() => {
                        terminate_gracefully(pid);
                        let code = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                            Ok(Ok(status)) => status.code(),
                            _ => {
                                warn!(subject = %scope.subject(), "hard killing agent after grace period");
                                let _ = child.kill().await;
                                child.wait().await.ok().and_then(|s| s.code())
                            }
                        };
                        (code, true)
                    }
                };
                this.finish(&scope, agent, exit_code, canceled);
            });
        }

        Ok(())
    }

    /// Request termination of a subject's process. Returns immediately; the
    /// transition lands when the waiter reaps the child.
    pub fn stop(&self, subject: &Id) -> Result<()> {
        let procs = self.procs.lock().expect("procs lock");
        match procs.get(subject) {
            Some(handle) => {
                info!(subject = %subject, "stopping agent");
                handle.cancel.cancel();
                Ok(())
            }
            None => Err(SupervisorError::NotRunning(subject.to_string())),
        }
    }

    /// Kill any existing process for the subject and wait until it is gone.
    /// Used before every spawn so that at most one process per subject runs.
    pub async fn stop_and_wait(&self, subject: &Id) {
        if self.stop(subject).is_err() {
            return;
        }
        let deadline = tokio::time::Instant::now() + KILL_GRACE + Duration::from_secs(2);
        while self.is_alive(subject) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn pump_lines(
        &self,
        scope: EventScope,
        agent: AgentKind,
        stream: impl tokio::io::AsyncRead + Unpin,
    ) {
        let subject = scope.subject().clone();
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            self.append_log(&subject, &line);
            if let EventScope::Task(task_id) = &scope {
                self.bus.publish(CoreEvent::TaskLog {
                    task_id: task_id.clone(),
                    line: line.clone(),
                });
            }
            if let Some(update) = progress::parse_line(agent, &line) {
                self.publish_progress(&scope, update);
            }
        }
    }

    fn append_log(&self, subject: &Id, line: &str) {
        let mut logs = self.logs.lock().expect("logs lock");
        let entries = logs.entry(subject.clone()).or_default();
        entries.push(line.to_string());
        if entries.len() > MAX_LOG_LINES {
            let excess = entries.len() - MAX_LOG_LINES;
            entries.drain(..excess);
        }
    }

    fn publish_progress(&self, scope: &EventScope, update: ExecutionProgress) {
        let event = match scope {
            EventScope::Task(task_id) => CoreEvent::TaskProgress {
                task_id: task_id.clone(),
                progress: update,
            },
            EventScope::Roadmap(project_id) => CoreEvent::RoadmapProgress {
                project_id: project_id.clone(),
                progress: update,
            },
            EventScope::Ideation(project_id) => CoreEvent::IdeationProgress {
                project_id: project_id.clone(),
                progress: update,
            },
        };
        self.bus.publish(event);
    }

    fn finish(&self, scope: &EventScope, agent: AgentKind, exit_code: Option<i32>, canceled: bool) {
        let subject = scope.subject().clone();
        self.procs.lock().expect("procs lock").remove(&subject);
        debug!(
            subject = %subject,
            agent = agent.as_str(),
            ?exit_code,
            canceled,
            "agent exited"
        );
        let scope_kind = match scope {
            EventScope::Task(_) => ScopeKind::Task,
            EventScope::Roadmap(_) => ScopeKind::Roadmap,
            EventScope::Ideation(_) => ScopeKind::Ideation,
        };
        let _ = self.exit_tx.send(ExitNotice {
            subject,
            scope_kind,
            agent,
            exit_code,
            canceled,
        });
    }
}

/// Ask the process to exit. On Unix this is SIGTERM so the agent can flush
/// artifacts; the hard kill follows only after the grace period.
#[cfg(unix)]
fn terminate_gracefully(pid: Option<u32>) {
    if let Some(pid) = pid {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(_pid: Option<u32>) {}
