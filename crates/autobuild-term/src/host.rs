//! The PTY host.
//!
//! Owns every terminal session in a process separate from the orchestrator,
//! so sessions survive frontend and orchestrator restarts. Each terminal has
//! a bounded output ring for late-subscriber replay and a subscriber set that
//! receives live output in arrival order.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use autobuild_core::types::{Id, TerminalConfig, TerminalInfo};
use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{Message, Request};
use crate::ring::OutputRing;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("terminal not found: {0}")]
    NotFound(String),
    #[error("terminal is dead: {0}")]
    Dead(String),
    #[error("pty error: {0}")]
    Pty(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

/// One hosted terminal session.
struct Terminal {
    id: Id,
    config: Mutex<TerminalConfig>,
    created_at: DateTime<Utc>,
    last_data_at: Mutex<Option<DateTime<Utc>>>,
    ring: Mutex<OutputRing>,
    /// Connection id -> outbound sender for subscribed connections.
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    writer: Mutex<Box<dyn std::io::Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    dead: AtomicBool,
}

impl Terminal {
    fn info(&self) -> TerminalInfo {
        let config = self.config.lock().expect("config lock").clone();
        TerminalInfo {
            id: self.id.clone(),
            config,
            created_at: self.created_at,
            last_data_at: *self.last_data_at.lock().expect("last_data lock"),
            is_dead: self.dead.load(Ordering::SeqCst),
            buffer_size: self.ring.lock().expect("ring lock").len(),
        }
    }

    /// Broadcast to every current subscriber; prunes closed connections.
    fn broadcast(&self, message: &Message) {
        let mut subscribers = self.subscribers.lock().expect("subscribers lock");
        subscribers.retain(|_, tx| tx.send(message.clone()).is_ok());
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("id", &self.id)
            .field("dead", &self.dead.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Index of all terminals, live and dead.
///
/// Dead terminals keep their ring for post-hoc replay until an explicit
/// `kill` removes them.
#[derive(Debug, Default)]
pub struct TerminalHost {
    terminals: Mutex<HashMap<Id, Arc<Terminal>>>,
}

impl TerminalHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: &Id) -> Result<Arc<Terminal>> {
        self.terminals
            .lock()
            .expect("terminals lock")
            .get(id)
            .cloned()
            .ok_or_else(|| HostError::NotFound(id.to_string()))
    }

    /// Spawn a shell in a fresh PTY and start its reader and waiter threads.
    pub fn create(self: &Arc<Self>, config: TerminalConfig) -> Result<Id> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| HostError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.shell);
        cmd.args(&config.shell_args);
        cmd.cwd(&config.cwd);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| HostError::Pty(e.to_string()))?;
        // The slave side belongs to the child now.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| HostError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| HostError::Pty(e.to_string()))?;
        let killer = child.clone_killer();

        let id = Id::short();
        let terminal = Arc::new(Terminal {
            id: id.clone(),
            config: Mutex::new(config),
            created_at: Utc::now(),
            last_data_at: Mutex::new(None),
            ring: Mutex::new(OutputRing::new()),
            subscribers: Mutex::new(HashMap::new()),
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            dead: AtomicBool::new(false),
        });

        self.terminals
            .lock()
            .expect("terminals lock")
            .insert(id.clone(), Arc::clone(&terminal));

        // Reader thread: PTY output -> ring + subscribers.
        {
            let terminal = Arc::clone(&terminal);
            std::thread::spawn(move || read_pump(&terminal, reader));
        }

        // Waiter thread: child exit -> dead flag + exit event.
        {
            let terminal = Arc::clone(&terminal);
            std::thread::spawn(move || {
                let status = child.wait();
                terminal.dead.store(true, Ordering::SeqCst);
                let exit_code = match &status {
                    Ok(s) => Some(s.exit_code() as i32),
                    Err(_) => None,
                };
                debug!(terminal_id = %terminal.id, ?exit_code, "terminal child exited");
                terminal.broadcast(&Message::Exit {
                    id: terminal.id.clone(),
                    exit_code,
                    signal: None,
                });
            });
        }

        info!(terminal_id = %id, "terminal created");
        Ok(id)
    }

    /// Write input to a live terminal. Dead terminals reject the write and
    /// their ring stays untouched.
    pub fn write(&self, id: &Id, data: &str) -> Result<()> {
        let terminal = self.get(id)?;
        if terminal.dead.load(Ordering::SeqCst) {
            return Err(HostError::Dead(id.to_string()));
        }
        let mut writer = terminal.writer.lock().expect("writer lock");
        writer.write_all(data.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, id: &Id, cols: u16, rows: u16) -> Result<()> {
        let terminal = self.get(id)?;
        terminal
            .master
            .lock()
            .expect("master lock")
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| HostError::Pty(e.to_string()))?;
        let mut config = terminal.config.lock().expect("config lock");
        config.rows = rows;
        config.cols = cols;
        Ok(())
    }

    /// Kill the child (if alive) and drop the terminal from the index,
    /// buffer included.
    pub fn kill(&self, id: &Id) -> Result<()> {
        let terminal = self.get(id)?;
        if !terminal.dead.load(Ordering::SeqCst) {
            if let Err(e) = terminal.killer.lock().expect("killer lock").kill() {
                warn!(terminal_id = %id, error = %e, "kill failed");
            }
        }
        self.terminals.lock().expect("terminals lock").remove(id);
        info!(terminal_id = %id, "terminal removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        let mut infos: Vec<TerminalInfo> = self
            .terminals
            .lock()
            .expect("terminals lock")
            .values()
            .map(|t| t.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Full ring snapshot for replay.
    pub fn buffer(&self, id: &Id) -> Result<(String, bool)> {
        let terminal = self.get(id)?;
        let snapshot = terminal.ring.lock().expect("ring lock").snapshot();
        Ok((
            String::from_utf8_lossy(&snapshot).into_owned(),
            terminal.dead.load(Ordering::SeqCst),
        ))
    }

    /// Register a connection for live output from a terminal. The subscriber
    /// sees only output arriving after this call; history comes from
    /// [`TerminalHost::buffer`].
    pub fn subscribe(
        &self,
        id: &Id,
        conn_id: u64,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<()> {
        let terminal = self.get(id)?;
        terminal
            .subscribers
            .lock()
            .expect("subscribers lock")
            .insert(conn_id, tx);
        Ok(())
    }

    pub fn unsubscribe(&self, id: &Id, conn_id: u64) -> Result<()> {
        let terminal = self.get(id)?;
        terminal
            .subscribers
            .lock()
            .expect("subscribers lock")
            .remove(&conn_id);
        Ok(())
    }

    /// Drop a closed connection from every subscriber set.
    pub fn drop_connection(&self, conn_id: u64) {
        for terminal in self.terminals.lock().expect("terminals lock").values() {
            terminal
                .subscribers
                .lock()
                .expect("subscribers lock")
                .remove(&conn_id);
        }
    }

    /// Kill every live child. Called on daemon shutdown.
    pub fn kill_all(&self) {
        for terminal in self.terminals.lock().expect("terminals lock").values() {
            if !terminal.dead.load(Ordering::SeqCst) {
                if let Err(e) = terminal.killer.lock().expect("killer lock").kill() {
                    warn!(terminal_id = %terminal.id, error = %e, "kill on shutdown failed");
                }
            }
        }
    }
}

/// Blocking PTY read loop. Runs on a dedicated thread per terminal.
fn read_pump(terminal: &Terminal, mut reader: Box<dyn Read + Send>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                terminal.ring.lock().expect("ring lock").push(chunk);
                *terminal.last_data_at.lock().expect("last_data lock") = Some(Utc::now());
                terminal.broadcast(&Message::Data {
                    id: terminal.id.clone(),
                    bytes: String::from_utf8_lossy(chunk).into_owned(),
                });
            }
        }
    }
}

/// The daemon: accepts NDJSON connections on the per-user socket and
/// dispatches requests against the host.
#[derive(Debug)]
pub struct TermDaemon {
    socket_path: PathBuf,
    host: Arc<TerminalHost>,
    shutdown: CancellationToken,
    next_conn_id: AtomicU64,
}

impl TermDaemon {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            host: Arc::new(TerminalHost::new()),
            shutdown: CancellationToken::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn host(&self) -> &Arc<TerminalHost> {
        &self.host
    }

    /// Bind the socket and serve until the shutdown token fires. On exit,
    /// every live child is killed and the socket is unlinked.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A previous daemon may have died without unlinking.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        restrict_socket_permissions(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "terminal daemon listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let daemon = Arc::clone(&self);
                            let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                if let Err(e) = daemon.handle_connection(stream, conn_id).await {
                                    debug!(conn_id, error = %e, "connection ended with error");
                                }
                                daemon.host.drop_connection(conn_id);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
                () = self.shutdown.cancelled() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.host.kill_all();
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream, conn_id: u64) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        // Writer task: serialize outbound messages as NDJSON.
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&message) else {
                    continue;
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(read_half).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let request: Request = match serde_json::from_str(&line) {
                Ok(req) => req,
                Err(e) => {
                    let _ = tx.send(Message::Error {
                        message: format!("malformed request: {e}"),
                    });
                    continue;
                }
            };
            self.dispatch(request, conn_id, &tx);
        }

        writer.abort();
        Ok(())
    }

    fn dispatch(&self, request: Request, conn_id: u64, tx: &mpsc::UnboundedSender<Message>) {
        let reply = |msg: Message| {
            let _ = tx.send(msg);
        };
        match request {
            Request::Ping => reply(Message::Pong),
            Request::Create {
                shell,
                shell_args,
                cwd,
                env,
                rows,
                cols,
            } => {
                let config = TerminalConfig {
                    shell,
                    shell_args,
                    cwd,
                    env,
                    rows,
                    cols,
                };
                match self.host.create(config) {
                    Ok(id) => reply(Message::Created { id }),
                    Err(e) => reply(Message::Error {
                        message: e.to_string(),
                    }),
                }
            }
            Request::Write { id, data } => {
                if let Err(e) = self.host.write(&id, &data) {
                    reply(Message::Error {
                        message: e.to_string(),
                    });
                }
            }
            Request::Resize { id, cols, rows } => {
                if let Err(e) = self.host.resize(&id, cols, rows) {
                    reply(Message::Error {
                        message: e.to_string(),
                    });
                }
            }
            Request::Kill { id } => {
                if let Err(e) = self.host.kill(&id) {
                    reply(Message::Error {
                        message: e.to_string(),
                    });
                }
            }
            Request::List => reply(Message::List {
                terminals: self.host.list(),
            }),
            Request::Subscribe { id } => {
                if let Err(e) = self.host.subscribe(&id, conn_id, tx.clone()) {
                    reply(Message::Error {
                        message: e.to_string(),
                    });
                }
            }
            Request::Unsubscribe { id } => {
                if let Err(e) = self.host.unsubscribe(&id, conn_id) {
                    reply(Message::Error {
                        message: e.to_string(),
                    });
                }
            }
            Request::GetBuffer { id } => match self.host.buffer(&id) {
                Ok((buffer, is_dead)) => reply(Message::Buffer {
                    id,
                    buffer,
                    is_dead,
                }),
                Err(e) => reply(Message::Error {
                    message: e.to_string(),
                }),
            },
        }
    }
}

#[cfg(unix)]
fn restrict_socket_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_socket_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn create_write_and_replay() {
        let host = Arc::new(TerminalHost::new());
        let id = host.create(sh_config()).unwrap();

        host.write(&id, "echo terminal_test_marker\n").unwrap();
        // Give the shell a moment to produce output.
        let mut buffer = String::new();
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            let (b, _) = host.buffer(&id).unwrap();
            if b.contains("terminal_test_marker") {
                buffer = b;
                break;
            }
        }
        assert!(
            buffer.contains("terminal_test_marker"),
            "expected echoed marker in replay buffer"
        );

        host.kill(&id).unwrap();
        assert!(matches!(host.buffer(&id), Err(HostError::NotFound(_))));
    }

    #[test]
    fn dead_terminal_rejects_writes_and_keeps_buffer() {
        let host = Arc::new(TerminalHost::new());
        let id = host.create(sh_config()).unwrap();

        host.write(&id, "echo before_exit; exit 0\n").unwrap();
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            if host.list()[0].is_dead {
                break;
            }
        }
        assert!(host.list()[0].is_dead, "shell should have exited");

        let (buffer_before, is_dead) = host.buffer(&id).unwrap();
        assert!(is_dead);
        assert!(buffer_before.contains("before_exit"));

        let err = host.write(&id, "echo after\n").unwrap_err();
        assert!(matches!(err, HostError::Dead(_)));

        // Ring unchanged by the rejected write.
        let (buffer_after, _) = host.buffer(&id).unwrap();
        assert_eq!(buffer_before, buffer_after);
    }

    #[test]
    fn subscribers_receive_only_new_output() {
        let host = Arc::new(TerminalHost::new());
        let id = host.create(sh_config()).unwrap();

        host.write(&id, "echo early_line\n").unwrap();
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            if host.buffer(&id).unwrap().0.contains("early_line") {
                break;
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        host.subscribe(&id, 7, tx).unwrap();
        host.write(&id, "echo late_line\n").unwrap();

        let mut seen = String::new();
        for _ in 0..50 {
            std::thread::sleep(std::time::Duration::from_millis(100));
            while let Ok(msg) = rx.try_recv() {
                if let Message::Data { bytes, .. } = msg {
                    seen.push_str(&bytes);
                }
            }
            if seen.contains("late_line") {
                break;
            }
        }
        assert!(seen.contains("late_line"));

        host.kill(&id).unwrap();
    }

    #[test]
    fn unknown_terminal_is_not_found() {
        let host = TerminalHost::new();
        let missing = Id::from_string("nope");
        assert!(matches!(
            host.write(&missing, "x"),
            Err(HostError::NotFound(_))
        ));
        assert!(matches!(host.buffer(&missing), Err(HostError::NotFound(_))));
    }
}
