//! PTY capability.
//!
//! The host never talks to `portable-pty` directly. It holds a
//! [`PtySpawner`] chosen at construction time and gets back a
//! [`PtyProcess`] plus a receiver of [`PtyOutput`] for every session it
//! creates. Two spawners exist:
//!
//! - [`NativePtySpawner`]: a real pseudo-terminal running a child process
//! - [`FakePtySpawner`]: no child process, input is looped back as output
//!
//! The output receiver yields zero or more `Data` chunks in the order the
//! process produced them, followed by exactly one `Exit`.

mod fake;
mod native;

pub use fake::{FakePty, FakePtySpawner};
pub use native::NativePtySpawner;

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::mpsc;

/// Terminal width used when the caller does not supply one.
pub const DEFAULT_COLS: u16 = 80;

/// Terminal height used when the caller does not supply one.
pub const DEFAULT_ROWS: u16 = 24;

/// Errors that can occur while driving a PTY.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// The process has already exited.
    #[error("process has already exited")]
    Exited,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something a PTY produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyOutput {
    /// A chunk of output text.
    Data(String),
    /// The process terminated. Always the last item.
    Exit {
        exit_code: Option<i32>,
        signal: Option<String>,
    },
}

/// What to run and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Working directory; ignored when it does not exist.
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    /// Merged over the daemon's own environment.
    pub env: BTreeMap<String, String>,
}

impl SpawnRequest {
    /// A request for `command` with no arguments at the default size.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            env: BTreeMap::new(),
        }
    }
}

/// A freshly spawned process and its output stream.
pub struct SpawnedPty {
    pub process: Box<dyn PtyProcess>,
    pub output: mpsc::UnboundedReceiver<PtyOutput>,
}

impl std::fmt::Debug for SpawnedPty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedPty")
            .field("pid", &self.process.pid())
            .finish_non_exhaustive()
    }
}

/// Handle to a running process attached to a pseudo-terminal.
///
/// Owned by exactly one session; nothing else writes to or kills it.
pub trait PtyProcess: Send {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Sends input to the process.
    fn write(&mut self, data: &str) -> Result<(), SessionError>;

    /// Changes the terminal size.
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Terminates the process. Calling it again after exit is a no-op.
    fn kill(&mut self) -> Result<(), SessionError>;
}

/// Starts processes on pseudo-terminals.
///
/// `spawn` may block; the host calls it from a blocking task.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedPty, SessionError>;
}
