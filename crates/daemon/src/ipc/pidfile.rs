//! PID file next to the daemon socket.
//!
//! The daemon writes `<socket>.pid` after binding and removes it on exit.
//! Readers treat a file whose process is gone as stale and delete it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// `<socket>.pid`.
pub fn pid_file_path(socket_path: &Path) -> PathBuf {
    let mut name = socket_path.as_os_str().to_os_string();
    name.push(".pid");
    PathBuf::from(name)
}

/// Records the current process id for `socket_path`.
pub fn write_pid_file(socket_path: &Path) -> io::Result<PathBuf> {
    let path = pid_file_path(socket_path);
    fs::write(&path, format!("{}\n", std::process::id()))?;
    Ok(path)
}

/// Removes the PID file for `socket_path`, ignoring a missing file.
pub fn remove_pid_file(socket_path: &Path) {
    let _ = fs::remove_file(pid_file_path(socket_path));
}

/// Pid of the live daemon serving `socket_path`, if any.
///
/// Unparseable or stale files are removed.
pub fn read_daemon_pid(socket_path: &Path) -> Option<u32> {
    let path = pid_file_path(socket_path);
    let contents = fs::read_to_string(&path).ok()?;

    match contents.trim().parse::<u32>() {
        Ok(pid) if is_process_running(pid) => Some(pid),
        _ => {
            tracing::debug!(path = %path.display(), "Removing stale PID file");
            let _ = fs::remove_file(&path);
            None
        }
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence; EPERM means it exists but is not ours.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    false
}
