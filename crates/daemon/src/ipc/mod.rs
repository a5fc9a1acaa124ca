//! Unix Domain Socket transport for the terminal host.
//!
//! ## Overview
//!
//! Every message is one JSON object followed by a newline (see
//! `termhost_protocol::framing`). The server turns each accepted connection
//! into a host client; the client is a small sequential request helper used
//! by the CLI.
//!
//! ## Socket Path
//!
//! The path must be unique per installation so that unrelated copies of the
//! application never share a daemon:
//! - Primary: `$XDG_RUNTIME_DIR/termhost/<install-id>.sock`
//! - Fallback: `/tmp/termhost-$UID/<install-id>.sock`
//!
//! where `<install-id>` is derived from the path of the running executable.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use termhost_daemon::host::{HostOptions, TerminalHost};
//! use termhost_daemon::ipc::{default_socket_path, IpcServer};
//! use termhost_daemon::pty::NativePtySpawner;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = IpcServer::bind(&default_socket_path()).await?;
//!     let (host, handle) = TerminalHost::new(HostOptions::default(), Arc::new(NativePtySpawner));
//!     tokio::spawn(server.serve(handle, CancellationToken::new()));
//!     host.run().await;
//!     Ok(())
//! }
//! ```

mod client;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use pidfile::{pid_file_path, read_daemon_pid, remove_pid_file, write_pid_file};
pub use server::{IpcError, IpcServer};

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Hex characters of the executable-path digest used in socket names.
const INSTALL_ID_LEN: usize = 12;

/// Short stable identifier of an installation, derived from `exe`.
pub fn install_id_for(exe: &Path) -> String {
    let digest = Sha256::digest(exe.to_string_lossy().as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(INSTALL_ID_LEN);
    id
}

/// Identifier of the running executable's installation.
pub fn install_id() -> String {
    let exe = std::env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .unwrap_or_else(|_| PathBuf::from("termhost-daemon"));
    install_id_for(&exe)
}

/// Directory holding the daemon socket.
#[cfg(unix)]
pub fn socket_dir() -> PathBuf {
    use std::os::unix::fs::MetadataExt;

    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => PathBuf::from(runtime_dir).join("termhost"),
        _ => {
            let uid = std::fs::metadata("/proc/self")
                .map(|m| m.uid())
                .unwrap_or(0);
            PathBuf::from(format!("/tmp/termhost-{}", uid))
        }
    }
}

/// Non-Unix platforms are not supported for Unix Domain Sockets.
#[cfg(not(unix))]
pub fn socket_dir() -> PathBuf {
    std::env::temp_dir().join("termhost")
}

/// The socket path for this installation.
pub fn default_socket_path() -> PathBuf {
    socket_dir().join(format!("{}.sock", install_id()))
}
