//! autobuildd - the Auto-Build orchestrator daemon.
//!
//! Hosts the project registry, the task orchestrator with its subprocess
//! supervision, the worktree manager, the artifact watcher, the framework
//! installer/updater, the embedded terminal daemon client, and the HTTP
//! request surface with its SSE event stream.

pub mod agents;
pub mod bus;
pub mod forge;
pub mod gitops;
pub mod installer;
pub mod layout;
pub mod orchestrator;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod supervisor;
pub mod termbridge;
pub mod updater;
pub mod watcher;
pub mod worktree;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use autobuild_core::settings::{default_data_dir, Settings};
use autobuild_term::TermClient;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::orchestrator::Orchestrator;
use crate::registry::Registry;
use crate::supervisor::{ExitNotice, Supervisor};
use crate::termbridge::TerminalBridge;
use crate::updater::{FrameworkUpdater, UpdaterConfig};
use crate::watcher::WatcherSet;
use crate::worktree::WorktreeManager;

/// Application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Per-user data directory (registry, settings, worktrees, staging).
    pub data_dir: PathBuf,
    /// HTTP port for the request surface.
    pub port: u16,
    /// Terminal daemon socket path.
    pub term_socket: PathBuf,
    /// Terminal daemon binary, spawned when no daemon answers.
    pub term_daemon_bin: PathBuf,
    /// Remote endpoints for framework updates.
    pub updater: UpdaterConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            port: 7710,
            term_socket: autobuild_term::default_socket_path(),
            term_daemon_bin: TermClient::default_daemon_bin(),
            updater: UpdaterConfig::default(),
        }
    }
}

/// The assembled daemon.
pub struct Daemon {
    config: DaemonConfig,
    state: Arc<server::AppState>,
    orchestrator: Arc<Orchestrator>,
    worktrees: Arc<WorktreeManager>,
    registry: Arc<Registry>,
    exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
    artifact_rx: mpsc::UnboundedReceiver<autobuild_core::types::ArtifactEvent>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> AppResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let settings_path = config.data_dir.join("settings.json");
        let settings = Arc::new(StdMutex::new(Settings::load(&settings_path)?));

        let bus = EventBus::new();
        let registry = Arc::new(Registry::open(&config.data_dir)?);
        let worktrees = Arc::new(WorktreeManager::open(&config.data_dir)?);
        let (supervisor, exit_rx) = Supervisor::new(bus.clone());
        let (watchers, artifact_rx) = WatcherSet::new(bus.clone());
        let watchers = Arc::new(watchers);

        let orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            supervisor,
            watchers,
            Arc::clone(&worktrees),
            bus.clone(),
            Arc::clone(&settings),
        );

        let (term_client, term_events) = TermClient::new(
            config.term_socket.clone(),
            config.term_daemon_bin.clone(),
        );
        let terminals = TerminalBridge::new(term_client, term_events, bus.clone(), settings);

        let updater = Arc::new(FrameworkUpdater::new(
            &config.data_dir,
            config.updater.clone(),
            bus.clone(),
        ));

        let state = Arc::new(server::AppState {
            registry: Arc::clone(&registry),
            orchestrator: Arc::clone(&orchestrator),
            terminals,
            updater,
            forge: forge::ForgeClient::new(),
            bus,
        });

        Ok(Self {
            config,
            state,
            orchestrator,
            worktrees,
            registry,
            exit_rx,
            artifact_rx,
        })
    }

    pub fn state(&self) -> &Arc<server::AppState> {
        &self.state
    }

    /// Reconcile, start the background handlers, and serve requests until
    /// the process exits.
    pub async fn run(self) -> AppResult<()> {
        let Self {
            config,
            state,
            orchestrator,
            worktrees,
            registry,
            mut exit_rx,
            mut artifact_rx,
        } = self;

        info!("autobuildd starting on port {}", config.port);
        info!("data directory: {}", config.data_dir.display());

        // Startup reconciliation: stuck tasks, orphan worktrees, watchers.
        orchestrator.reconcile().await;
        let mut sweep_input = Vec::new();
        for project in registry.list().await {
            let Some(framework) =
                layout::find_framework_dir(std::path::Path::new(&project.path))
            else {
                continue;
            };
            let live: HashSet<String> = scanner::scan_tasks(
                &project.id,
                &framework,
                &HashSet::new(),
                &HashSet::new(),
            )
            .into_iter()
            .filter_map(|t| t.spec_id)
            .collect();
            sweep_input.push((project, live));
        }
        worktrees.sweep_orphans(&sweep_input).await;

        // Exit notices -> status transitions.
        {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                while let Some(notice) = exit_rx.recv().await {
                    orchestrator.handle_exit(notice).await;
                }
            });
        }

        // Artifact events -> progress and status events.
        {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                while let Some(event) = artifact_rx.recv().await {
                    orchestrator.handle_artifact(event).await;
                }
            });
        }

        if let Err(e) = server::start_server(state, config.port).await {
            warn!(error = %e, "request surface stopped");
        }
        Ok(())
    }
}
