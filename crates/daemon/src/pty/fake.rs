//! Deterministic PTY double.
//!
//! Nothing is executed. Every write comes straight back as output, which is
//! enough to drive the full session lifecycle in tests and in
//! `TERMHOST_FAKE_PTY` mode:
//!
//! - a written line that is exactly `exit` or `exit <n>` ends the process
//!   with code 0 or `n`
//! - `kill` ends it with signal `SIGKILL`
//! - a spawner built with [`FakePtySpawner::with_banner`] prints the banner
//!   as soon as the process starts, the way a shell prints its prompt

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;
use tokio::sync::mpsc;

use super::{PtyOutput, PtyProcess, PtySpawner, SessionError, SpawnRequest, SpawnedPty};

/// First pid handed out; keeps fake pids clear of real low pids.
const FIRST_FAKE_PID: u32 = 90_000;

/// Spawner producing [`FakePty`] processes.
#[derive(Debug)]
pub struct FakePtySpawner {
    next_pid: AtomicU32,
    spawned: Arc<Mutex<Vec<SpawnRequest>>>,
    banner: Option<String>,
}

impl Default for FakePtySpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePtySpawner {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(FIRST_FAKE_PID),
            spawned: Arc::new(Mutex::new(Vec::new())),
            banner: None,
        }
    }

    /// Every spawned process outputs `banner` first.
    pub fn with_banner(banner: impl Into<String>) -> Self {
        Self {
            banner: Some(banner.into()),
            ..Self::new()
        }
    }

    /// Every request this spawner has served, oldest first.
    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.spawned
            .lock()
            .map(|spawned| spawned.clone())
            .unwrap_or_default()
    }
}

impl PtySpawner for FakePtySpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedPty, SessionError> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        tracing::debug!(pid, command = %request.command, "Fake PTY spawned");
        if let Some(banner) = &self.banner {
            let _ = output_tx.send(PtyOutput::Data(banner.clone()));
        }

        let process = FakePty {
            pid,
            output_tx: Some(output_tx),
            size: (request.cols, request.rows),
            line: String::new(),
        };
        if let Ok(mut spawned) = self.spawned.lock() {
            spawned.push(request);
        }

        Ok(SpawnedPty {
            process: Box::new(process),
            output: output_rx,
        })
    }
}

/// A looped-back "process".
#[derive(Debug)]
pub struct FakePty {
    pid: u32,
    /// `None` once the process has exited.
    output_tx: Option<mpsc::UnboundedSender<PtyOutput>>,
    size: (u16, u16),
    /// Input since the last line break.
    line: String,
}

impl FakePty {
    /// Current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        self.size
    }

    fn exit(&mut self, exit_code: Option<i32>, signal: Option<String>) {
        if let Some(tx) = self.output_tx.take() {
            let _ = tx.send(PtyOutput::Exit { exit_code, signal });
        }
    }
}

/// Parses `exit` / `exit <n>`.
fn exit_command(line: &str) -> Option<i32> {
    let line = line.trim();
    if line == "exit" {
        return Some(0);
    }
    line.strip_prefix("exit ")
        .and_then(|code| code.trim().parse().ok())
}

impl PtyProcess for FakePty {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn write(&mut self, data: &str) -> Result<(), SessionError> {
        let Some(tx) = self.output_tx.as_ref() else {
            return Err(SessionError::Exited);
        };
        tx.send(PtyOutput::Data(data.to_string()))
            .map_err(|_| SessionError::WriteFailed("output closed".to_string()))?;

        for c in data.chars() {
            if c == '\n' || c == '\r' {
                let line = std::mem::take(&mut self.line);
                if let Some(code) = exit_command(&line) {
                    self.exit(Some(code), None);
                    break;
                }
            } else {
                self.line.push(c);
            }
        }
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.output_tx.is_none() {
            return Err(SessionError::Exited);
        }
        self.size = (cols, rows);
        Ok(())
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        self.exit(None, Some(Signal::SIGKILL.as_str().to_string()));
        Ok(())
    }
}
