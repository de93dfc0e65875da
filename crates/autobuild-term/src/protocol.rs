//! Wire protocol between the terminal daemon and its clients.
//!
//! Newline-delimited JSON over a per-user Unix domain socket. Field names are
//! stable; additions must be backward compatible because the daemon outlives
//! orchestrator upgrades.

use std::path::PathBuf;

use autobuild_core::types::{Id, TerminalConfig, TerminalInfo};
use serde::{Deserialize, Serialize};

/// Client-to-daemon requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    Ping,
    #[serde(rename_all = "camelCase")]
    Create {
        shell: String,
        #[serde(default)]
        shell_args: Vec<String>,
        cwd: String,
        #[serde(default)]
        env: std::collections::HashMap<String, String>,
        rows: u16,
        cols: u16,
    },
    Write {
        id: Id,
        data: String,
    },
    Resize {
        id: Id,
        cols: u16,
        rows: u16,
    },
    Kill {
        id: Id,
    },
    List,
    Subscribe {
        id: Id,
    },
    Unsubscribe {
        id: Id,
    },
    GetBuffer {
        id: Id,
    },
}

/// Daemon-to-client messages: direct responses plus subscription events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Pong,
    Created {
        id: Id,
    },
    List {
        terminals: Vec<TerminalInfo>,
    },
    #[serde(rename_all = "camelCase")]
    Buffer {
        id: Id,
        buffer: String,
        is_dead: bool,
    },
    Data {
        id: Id,
        bytes: String,
    },
    #[serde(rename_all = "camelCase")]
    Exit {
        id: Id,
        exit_code: Option<i32>,
        signal: Option<String>,
    },
    Error {
        message: String,
    },
}

impl Request {
    /// Whether the daemon answers this request with a direct message.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Self::Ping | Self::Create { .. } | Self::List | Self::GetBuffer { .. }
        )
    }

    pub fn create_from_config(config: &TerminalConfig) -> Self {
        Self::Create {
            shell: config.shell.clone(),
            shell_args: config.shell_args.clone(),
            cwd: config.cwd.clone(),
            env: config.env.clone(),
            rows: config.rows,
            cols: config.cols,
        }
    }
}

/// The per-user socket path. Prefers the runtime dir (already per-user with
/// 0700 permissions), falling back to the data dir.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("autobuild")
        })
        .join("autobuild-term.sock")
}
