//! Terminal daemon bridge.
//!
//! Embeds the terminal client, surfaces daemon events on the event bus, and
//! enforces the orchestrator-side rules the daemon does not know about: the
//! live-terminal cap from settings, rejection of writes to known-dead
//! terminals, and Claude-mode bookkeeping (which affects status reporting
//! only).

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use autobuild_core::error::{CoreError, CoreResult};
use autobuild_core::types::{Id, TerminalConfig, TerminalInfo};
use autobuild_core::{CoreEvent, Settings};
use autobuild_term::{Message, TermClient};
use tokio::sync::mpsc;
use tracing::debug;

/// Shell line written into a terminal when Claude-mode is enabled.
const CLAUDE_COMMAND: &str = "claude\n";

pub struct TerminalBridge {
    client: Arc<TermClient>,
    settings: Arc<StdMutex<Settings>>,
    claude_mode: StdMutex<HashSet<Id>>,
    dead: StdMutex<HashSet<Id>>,
}

impl std::fmt::Debug for TerminalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalBridge").finish_non_exhaustive()
    }
}

impl TerminalBridge {
    /// Wrap a client and start pumping its events onto the bus.
    pub fn new(
        client: Arc<TermClient>,
        events: mpsc::UnboundedReceiver<Message>,
        bus: crate::bus::EventBus,
        settings: Arc<StdMutex<Settings>>,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            client,
            settings,
            claude_mode: StdMutex::new(HashSet::new()),
            dead: StdMutex::new(HashSet::new()),
        });
        tokio::spawn(pump_events(Arc::clone(&bridge), events, bus));
        bridge
    }

    /// Create a terminal, enforcing the configured live-terminal cap, and
    /// subscribe so its output reaches the bus.
    pub async fn create(&self, config: TerminalConfig) -> CoreResult<Id> {
        let cap = self.settings.lock().expect("settings lock").max_terminals;
        let live = self
            .list()
            .await?
            .iter()
            .filter(|t| !t.is_dead)
            .count();
        if live >= cap {
            return Err(CoreError::InvalidRequest(format!(
                "terminal cap reached ({cap} live terminals)"
            )));
        }

        let id = self
            .client
            .create(&config)
            .await
            .map_err(|e| CoreError::DaemonUnavailable(e.to_string()))?;
        self.client
            .subscribe(&id)
            .await
            .map_err(|e| CoreError::DaemonUnavailable(e.to_string()))?;
        Ok(id)
    }

    pub async fn write(&self, id: &Id, data: &str) -> CoreResult<()> {
        if self.dead.lock().expect("dead lock").contains(id) {
            return Err(CoreError::InvalidRequest(format!(
                "terminal {id} is dead"
            )));
        }
        self.client
            .write(id, data)
            .await
            .map_err(|e| CoreError::DaemonUnavailable(e.to_string()))
    }

    pub async fn resize(&self, id: &Id, cols: u16, rows: u16) -> CoreResult<()> {
        self.client
            .resize(id, cols, rows)
            .await
            .map_err(|e| CoreError::DaemonUnavailable(e.to_string()))
    }

    pub async fn kill(&self, id: &Id) -> CoreResult<()> {
        self.client
            .kill(id)
            .await
            .map_err(|e| CoreError::DaemonUnavailable(e.to_string()))?;
        self.dead.lock().expect("dead lock").remove(id);
        self.claude_mode.lock().expect("claude lock").remove(id);
        Ok(())
    }

    pub async fn list(&self) -> CoreResult<Vec<TerminalInfo>> {
        let terminals = self
            .client
            .list()
            .await
            .map_err(|e| CoreError::DaemonUnavailable(e.to_string()))?;
        // The daemon is the authority on death; fold it into our cache.
        let mut dead = self.dead.lock().expect("dead lock");
        for terminal in &terminals {
            if terminal.is_dead {
                dead.insert(terminal.id.clone());
            }
        }
        Ok(terminals)
    }

    pub async fn get_buffer(&self, id: &Id) -> CoreResult<(String, bool)> {
        self.client
            .get_buffer(id)
            .await
            .map_err(|e| CoreError::DaemonUnavailable(e.to_string()))
    }

    pub async fn subscribe(&self, id: &Id) -> CoreResult<()> {
        self.client
            .subscribe(id)
            .await
            .map_err(|e| CoreError::DaemonUnavailable(e.to_string()))
    }

    pub async fn unsubscribe(&self, id: &Id) -> CoreResult<()> {
        self.client
            .unsubscribe(id)
            .await
            .map_err(|e| CoreError::DaemonUnavailable(e.to_string()))
    }

    /// Write the Claude launch command into the terminal and flag it. The
    /// flag affects status reporting only; the protocol is untouched.
    pub async fn enable_claude_mode(&self, id: &Id) -> CoreResult<()> {
        self.write(id, CLAUDE_COMMAND).await?;
        self.claude_mode
            .lock()
            .expect("claude lock")
            .insert(id.clone());
        Ok(())
    }

    pub fn is_claude_mode(&self, id: &Id) -> bool {
        self.claude_mode.lock().expect("claude lock").contains(id)
    }
}

async fn pump_events(
    bridge: Arc<TerminalBridge>,
    mut events: mpsc::UnboundedReceiver<Message>,
    bus: crate::bus::EventBus,
) {
    while let Some(message) = events.recv().await {
        match message {
            Message::Data { id, bytes } => {
                bus.publish(CoreEvent::TerminalOutput {
                    terminal_id: id,
                    bytes,
                });
            }
            Message::Exit {
                id,
                exit_code,
                signal,
            } => {
                bridge.dead.lock().expect("dead lock").insert(id.clone());
                bus.publish(CoreEvent::TerminalExit {
                    terminal_id: id,
                    exit_code,
                    signal,
                });
            }
            Message::Error { message } => {
                debug!(message, "unsolicited terminal daemon error");
            }
            other => {
                debug!(?other, "unexpected terminal daemon event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use autobuild_term::TermDaemon;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sh_config() -> TerminalConfig {
        TerminalConfig {
            shell: "/bin/sh".to_string(),
            shell_args: Vec::new(),
            cwd: "/tmp".to_string(),
            env: HashMap::new(),
            rows: 24,
            cols: 80,
        }
    }

    async fn bridge_with_daemon(
        dir: &tempfile::TempDir,
        max_terminals: usize,
    ) -> (Arc<TerminalBridge>, EventBus) {
        let socket = dir.path().join("term.sock");
        let daemon = Arc::new(TermDaemon::new(socket.clone()));
        tokio::spawn(Arc::clone(&daemon).run());
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let settings = Arc::new(StdMutex::new(Settings {
            max_terminals,
            ..Settings::default()
        }));
        let bus = EventBus::new();
        let (client, events) = TermClient::new(socket, PathBuf::from("/nonexistent"));
        (
            TerminalBridge::new(client, events, bus.clone(), settings),
            bus,
        )
    }

    #[tokio::test]
    async fn output_reaches_the_bus() {
        let dir = tempfile::TempDir::new().unwrap();
        let (bridge, bus) = bridge_with_daemon(&dir, 12).await;
        let mut events = bus.subscribe();

        let id = bridge.create(sh_config()).await.unwrap();
        bridge.write(&id, "echo bridged_marker\n").await.unwrap();

        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline && !seen.contains("bridged_marker") {
            if let Ok(Ok(event)) =
                tokio::time::timeout(Duration::from_millis(200), events.recv()).await
            {
                if let CoreEvent::TerminalOutput { bytes, .. } = event {
                    seen.push_str(&bytes);
                }
            }
        }
        assert!(seen.contains("bridged_marker"));
        bridge.kill(&id).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_cap_is_enforced() {
        let dir = tempfile::TempDir::new().unwrap();
        let (bridge, _bus) = bridge_with_daemon(&dir, 1).await;

        let first = bridge.create(sh_config()).await.unwrap();
        let err = bridge.create(sh_config()).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));

        bridge.kill(&first).await.unwrap();
        let second = bridge.create(sh_config()).await.unwrap();
        bridge.kill(&second).await.unwrap();
    }

    #[tokio::test]
    async fn claude_mode_is_status_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let (bridge, _bus) = bridge_with_daemon(&dir, 12).await;

        let id = bridge.create(sh_config()).await.unwrap();
        assert!(!bridge.is_claude_mode(&id));
        bridge.enable_claude_mode(&id).await.unwrap();
        assert!(bridge.is_claude_mode(&id));

        // Still a perfectly ordinary terminal.
        bridge.write(&id, "echo still_works\n").await.unwrap();
        bridge.kill(&id).await.unwrap();
        assert!(!bridge.is_claude_mode(&id));
    }

    #[tokio::test]
    async fn write_to_dead_terminal_is_invalid_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let (bridge, _bus) = bridge_with_daemon(&dir, 12).await;

        let id = bridge.create(sh_config()).await.unwrap();
        bridge.write(&id, "exit 0\n").await.unwrap();

        // Wait for the exit event to mark it dead.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if bridge.dead.lock().unwrap().contains(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let err = bridge.write(&id, "echo nope\n").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
        bridge.kill(&id).await.unwrap();
    }
}
