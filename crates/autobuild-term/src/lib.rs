//! Terminal daemon for the Auto-Build control plane.
//!
//! PTY sessions live in this separate process so they outlive frontend and
//! orchestrator restarts. The daemon speaks newline-delimited JSON over a
//! per-user Unix socket; the orchestrator embeds [`client::TermClient`].

pub mod client;
pub mod host;
pub mod protocol;
pub mod ring;

pub use client::{TermClient, TermClientError};
pub use host::{TermDaemon, TerminalHost};
pub use protocol::{default_socket_path, Message, Request};
pub use ring::OutputRing;
