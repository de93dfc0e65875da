//! Client side of the terminal daemon protocol.
//!
//! The orchestrator embeds one of these. It maintains at most one connection,
//! starts the daemon when the socket is missing or pings time out, and
//! transparently retries the first operation after a reconnect. `data` and
//! `exit` events are delivered through a channel handed out at construction.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use autobuild_core::types::{Id, TerminalConfig, TerminalInfo};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{Message, Request};

/// Ping timeout; a stuck daemon is declared after this and triggers the
/// single reconnect.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for ordinary request/response round trips.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Total budget for a freshly started daemon to come up.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial backoff between readiness probes.
const READY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum TermClientError {
    #[error("terminal daemon unavailable at {path}: {reason}")]
    Unavailable { path: String, reason: String },
    #[error("terminal daemon not ready after {timeout_ms}ms")]
    NotReady { timeout_ms: u64 },
    #[error("terminal daemon error: {0}")]
    Daemon(String),
    #[error("request timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TermClientError>;

struct Connection {
    writer: OwnedWriteHalf,
    pending: Arc<StdMutex<VecDeque<oneshot::Sender<Message>>>>,
    reader_task: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Embedded terminal daemon client.
pub struct TermClient {
    socket_path: PathBuf,
    /// Path of the daemon binary to spawn when none is running.
    daemon_bin: PathBuf,
    connection: Mutex<Option<Connection>>,
    events_tx: mpsc::UnboundedSender<Message>,
}

impl std::fmt::Debug for TermClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TermClient")
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

impl TermClient {
    /// Create a client. The returned receiver carries `data`/`exit` events
    /// for subscribed terminals.
    pub fn new(
        socket_path: PathBuf,
        daemon_bin: PathBuf,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                socket_path,
                daemon_bin,
                connection: Mutex::new(None),
                events_tx,
            }),
            events_rx,
        )
    }

    /// Default daemon binary: a sibling of the current executable, falling
    /// back to PATH lookup.
    pub fn default_daemon_bin() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|d| d.join("autobuild-term")))
            .filter(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from("autobuild-term"))
    }

    // --- Operations ---

    pub async fn ping(&self) -> Result<()> {
        match self.request(Request::Ping, PING_TIMEOUT).await? {
            Some(Message::Pong) => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create(&self, config: &TerminalConfig) -> Result<Id> {
        let request = Request::create_from_config(config);
        match self.request(request, REQUEST_TIMEOUT).await? {
            Some(Message::Created { id }) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write(&self, id: &Id, data: &str) -> Result<()> {
        self.request(
            Request::Write {
                id: id.clone(),
                data: data.to_string(),
            },
            REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    pub async fn resize(&self, id: &Id, cols: u16, rows: u16) -> Result<()> {
        self.request(
            Request::Resize {
                id: id.clone(),
                cols,
                rows,
            },
            REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    pub async fn kill(&self, id: &Id) -> Result<()> {
        self.request(Request::Kill { id: id.clone() }, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn list(&self) -> Result<Vec<TerminalInfo>> {
        match self.request(Request::List, REQUEST_TIMEOUT).await? {
            Some(Message::List { terminals }) => Ok(terminals),
            other => Err(unexpected(other)),
        }
    }

    pub async fn subscribe(&self, id: &Id) -> Result<()> {
        self.request(Request::Subscribe { id: id.clone() }, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn unsubscribe(&self, id: &Id) -> Result<()> {
        self.request(Request::Unsubscribe { id: id.clone() }, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Full ring replay: (buffer, is_dead).
    pub async fn get_buffer(&self, id: &Id) -> Result<(String, bool)> {
        match self
            .request(Request::GetBuffer { id: id.clone() }, REQUEST_TIMEOUT)
            .await?
        {
            Some(Message::Buffer {
                buffer, is_dead, ..
            }) => Ok((buffer, is_dead)),
            other => Err(unexpected(other)),
        }
    }

    // --- Connection management ---

    /// Send a request, reconnecting (and possibly starting the daemon) once
    /// if the first attempt fails.
    async fn request(&self, request: Request, timeout: Duration) -> Result<Option<Message>> {
        let mut guard = self.connection.lock().await;
        self.ensure_connected(&mut guard).await?;

        match self.send_on(guard.as_mut().expect("connection"), &request, timeout).await {
            Ok(reply) => Ok(reply),
            Err(TermClientError::Daemon(message)) => Err(TermClientError::Daemon(message)),
            Err(first_err) => {
                warn!(error = %first_err, "terminal daemon request failed; reconnecting once");
                *guard = None;
                self.ensure_connected(&mut guard).await?;
                self.send_on(guard.as_mut().expect("connection"), &request, timeout)
                    .await
            }
        }
    }

    async fn send_on(
        &self,
        conn: &mut Connection,
        request: &Request,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        let receiver = if request.expects_reply() {
            let (tx, rx) = oneshot::channel();
            conn.pending.lock().expect("pending lock").push_back(tx);
            Some(rx)
        } else {
            None
        };

        let mut line = serde_json::to_string(request)
            .map_err(|e| TermClientError::Protocol(e.to_string()))?;
        line.push('\n');
        conn.writer.write_all(line.as_bytes()).await?;

        let Some(rx) = receiver else {
            return Ok(None);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Message::Error { message })) => Err(TermClientError::Daemon(message)),
            Ok(Ok(message)) => Ok(Some(message)),
            Ok(Err(_)) => Err(TermClientError::Protocol("connection closed".to_string())),
            Err(_) => Err(TermClientError::Timeout),
        }
    }

    async fn ensure_connected(&self, slot: &mut Option<Connection>) -> Result<()> {
        if slot.is_some() {
            return Ok(());
        }
        match self.open_connection().await {
            Ok(conn) => {
                *slot = Some(conn);
                Ok(())
            }
            Err(_) => {
                // No daemon (or a stuck one): start a fresh daemon and wait
                // for it to come up.
                self.spawn_daemon()?;
                self.wait_for_ready().await?;
                *slot = Some(self.open_connection().await?);
                Ok(())
            }
        }
    }

    async fn open_connection(&self) -> Result<Connection> {
        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| TermClientError::Unavailable {
                    path: self.socket_path.display().to_string(),
                    reason: e.to_string(),
                })?;
        let (read_half, writer) = stream.into_split();
        let pending: Arc<StdMutex<VecDeque<oneshot::Sender<Message>>>> =
            Arc::new(StdMutex::new(VecDeque::new()));

        let reader_task = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            self.events_tx.clone(),
        ));

        Ok(Connection {
            writer,
            pending,
            reader_task,
        })
    }

    fn spawn_daemon(&self) -> Result<()> {
        info!(bin = %self.daemon_bin.display(), "starting terminal daemon");
        std::process::Command::new(&self.daemon_bin)
            .arg("--socket")
            .arg(&self.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TermClientError::Unavailable {
                path: self.socket_path.display().to_string(),
                reason: format!("failed to start daemon: {e}"),
            })?;
        Ok(())
    }

    /// Probe the socket with exponential backoff until the daemon answers.
    async fn wait_for_ready(&self) -> Result<()> {
        let start = std::time::Instant::now();
        let mut backoff = READY_BACKOFF;
        loop {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Ok(());
            }
            if start.elapsed() >= READY_TIMEOUT {
                return Err(TermClientError::NotReady {
                    timeout_ms: READY_TIMEOUT.as_millis() as u64,
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }
}

/// Background read loop: correlates replies with pending requests and fans
/// `data`/`exit` out to the event channel.
async fn read_loop(
    read_half: OwnedReadHalf,
    pending: Arc<StdMutex<VecDeque<oneshot::Sender<Message>>>>,
    events: mpsc::UnboundedSender<Message>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let message: Message = match serde_json::from_str(&line) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "skipping malformed daemon message");
                continue;
            }
        };
        match message {
            Message::Data { .. } | Message::Exit { .. } => {
                if events.send(message).is_err() {
                    break;
                }
            }
            Message::Error { .. } => {
                // An error answers the oldest pending request when one
                // exists; otherwise it is unsolicited (e.g. a rejected
                // write) and flows to the event channel.
                let waiter = pending.lock().expect("pending lock").pop_front();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => {
                        let _ = events.send(message);
                    }
                }
            }
            reply => {
                if let Some(tx) = pending.lock().expect("pending lock").pop_front() {
                    let _ = tx.send(reply);
                }
            }
        }
    }
}

fn unexpected(message: Option<Message>) -> TermClientError {
    TermClientError::Protocol(format!("unexpected reply: {message:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TermDaemon;
    use std::collections::HashMap;

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

    async fn start_daemon(dir: &tempfile::TempDir) -> (Arc<TermDaemon>, PathBuf) {
        let socket = dir.path().join("term.sock");
        let daemon = Arc::new(TermDaemon::new(socket.clone()));
        let runner = Arc::clone(&daemon);
        tokio::spawn(runner.run());
        // Wait for the socket to appear.
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        (daemon, socket)
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_daemon, socket) = start_daemon(&dir).await;
        let (client, _events) = TermClient::new(socket, PathBuf::from("/nonexistent"));
        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn create_write_replay_via_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_daemon, socket) = start_daemon(&dir).await;
        let (client, _events) = TermClient::new(socket, PathBuf::from("/nonexistent"));

        let id = client.create(&sh_config()).await.unwrap();
        client.write(&id, "echo socket_marker\n").await.unwrap();

        let mut buffer = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let (b, _) = client.get_buffer(&id).await.unwrap();
            if b.contains("socket_marker") {
                buffer = b;
                break;
            }
        }
        assert!(buffer.contains("socket_marker"));

        client.kill(&id).await.unwrap();
        let listed = client.list().await.unwrap();
        assert!(listed.iter().all(|t| t.id != id));
    }

    #[tokio::test]
    async fn buffer_survives_client_reconnect() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_daemon, socket) = start_daemon(&dir).await;

        let id = {
            let (client, _events) = TermClient::new(socket.clone(), PathBuf::from("/nonexistent"));
            let id = client.create(&sh_config()).await.unwrap();
            client.write(&id, "echo persisted_output\n").await.unwrap();
            for _ in 0..50 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if client.get_buffer(&id).await.unwrap().0.contains("persisted_output") {
                    break;
                }
            }
            id
            // Client dropped here; daemon keeps the terminal.
        };

        let (client, _events) = TermClient::new(socket, PathBuf::from("/nonexistent"));
        let (buffer, is_dead) = client.get_buffer(&id).await.unwrap();
        assert!(buffer.contains("persisted_output"));
        assert!(!is_dead);
        client.kill(&id).await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_streams_new_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let (_daemon, socket) = start_daemon(&dir).await;
        let (client, mut events) = TermClient::new(socket, PathBuf::from("/nonexistent"));

        let id = client.create(&sh_config()).await.unwrap();
        client.subscribe(&id).await.unwrap();
        client.write(&id, "echo streamed_marker\n").await.unwrap();

        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Some(Message::Data { bytes, .. })) => {
                    seen.push_str(&bytes);
                    if seen.contains("streamed_marker") {
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {}
            }
        }
        assert!(seen.contains("streamed_marker"));
        client.kill(&id).await.unwrap();
    }

    #[tokio::test]
    async fn missing_daemon_without_binary_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("never.sock");
        let (client, _events) = TermClient::new(socket, PathBuf::from("/nonexistent-daemon-bin"));
        assert!(client.ping().await.is_err());
    }
}
