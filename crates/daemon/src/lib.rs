//! # termhost Daemon Library
//!
//! The terminal host daemon owns pseudo-terminal sessions on behalf of
//! short-lived UI processes, so shells survive the window that started them.
//!
//! ## Overview
//!
//! - **Sessions**: one PTY per `(workspace, slot)` key, created idempotently
//! - **Fan-out**: output goes to every attached client in production order
//! - **Detach without kill**: output produced while nobody listens is kept
//!   in a bounded trailing window and handed to the next client that attaches
//! - **Idle shutdown**: the process exits once it has had neither sessions
//!   nor clients for the configured period
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      IpcServer                           │
//! │   one task per Unix socket connection (NDJSON lines)     │
//! └───────────────┬──────────────────────────▲───────────────┘
//!                 │ HostHandle::send_line    │ bounded outbound queue
//! ┌───────────────▼──────────────────────────┴───────────────┐
//! │                    TerminalHost                          │
//! │   SessionRegistry · client table · idle deadline         │
//! └───────────────┬──────────────────────────▲───────────────┘
//!                 │ PtyProcess               │ PtyOutput
//! ┌───────────────▼──────────────────────────┴───────────────┐
//! │       NativePtySpawner (portable-pty) / FakePtySpawner    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use termhost_daemon::{Config, HostOptions, IpcServer, NativePtySpawner, TerminalHost};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let server = IpcServer::bind(&config.socket_path()).await?;
//!
//!     let (host, handle) = TerminalHost::new(HostOptions::from(&config), Arc::new(NativePtySpawner));
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(server.serve(handle, shutdown.clone()));
//!
//!     let exit = host.run().await;
//!     shutdown.cancel();
//!     println!("host stopped: {:?}", exit);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`host`]: The single-owner event loop serving every command
//! - [`ipc`]: Unix socket server, CLI client, PID file
//! - [`pty`]: Native and fake PTY capabilities
//! - [`session`]: Session registry and shell argument policy

pub mod config;
pub mod host;
pub mod ipc;
pub mod pty;
pub mod session;

// Re-export protocol for convenience
pub use termhost_protocol as protocol;

pub use config::{Config, ConfigError};
pub use host::{ClientLink, HostError, HostExit, HostHandle, HostOptions, TerminalHost};
pub use ipc::{default_socket_path, IpcClient, IpcError, IpcServer};
pub use pty::{FakePtySpawner, NativePtySpawner, PtyOutput, PtyProcess, PtySpawner, SessionError};
pub use session::{Session, SessionId, SessionRegistry, SessionState, ShellArgsPolicy};
