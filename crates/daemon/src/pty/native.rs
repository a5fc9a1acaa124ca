//! PTY backed by the operating system via `portable-pty`.

use std::io::{Read, Write};

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::{PtyOutput, PtyProcess, PtySpawner, SessionError, SpawnRequest, SpawnedPty};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Spawns real child processes on OS pseudo-terminals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl NativePtySpawner {
    pub fn new() -> Self {
        Self
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedPty, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&request.command);
        cmd.args(&request.args);
        if let Some(dir) = request.cwd.as_ref().filter(|dir| dir.is_dir()) {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", request.command, e)))?;
        // The child holds its own copy; keeping ours would hide EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || {
                read_until_eof(reader, &output_tx);

                let (exit_code, signal) = match child.wait() {
                    Ok(status) => match status.signal() {
                        Some(signal) => (None, Some(signal.to_string())),
                        None => (Some(status.exit_code() as i32), None),
                    },
                    Err(e) => {
                        tracing::warn!(pid = ?pid, error = %e, "Failed to collect exit status");
                        (None, None)
                    }
                };
                let _ = output_tx.send(PtyOutput::Exit { exit_code, signal });
            })?;

        tracing::debug!(pid = ?pid, command = %request.command, "PTY process spawned");

        Ok(SpawnedPty {
            process: Box::new(NativePtyProcess {
                master: pair.master,
                writer,
                killer,
                pid,
                exited: false,
            }),
            output: output_rx,
        })
    }
}

/// Reads the master side until EOF, forwarding decoded text.
fn read_until_eof(mut reader: Box<dyn Read + Send>, output_tx: &mpsc::UnboundedSender<PtyOutput>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8Carry::default();

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() && output_tx.send(PtyOutput::Data(text)).is_err() {
                    // Nobody is listening any more.
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the last slave fd closes.
            Err(_) => break,
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = output_tx.send(PtyOutput::Data(tail));
    }
}

struct NativePtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    exited: bool,
}

impl PtyProcess for NativePtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&mut self, data: &str) -> Result<(), SessionError> {
        if self.exited {
            return Err(SessionError::Exited);
        }
        self.writer
            .write_all(data.as_bytes())
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.exited {
            return Err(SessionError::Exited);
        }
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn kill(&mut self) -> Result<(), SessionError> {
        if self.exited {
            return Ok(());
        }
        self.exited = true;
        self.killer
            .kill()
            .map_err(|e| SessionError::KillFailed(e.to_string()))
    }
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte sequence split across two reads is held back until the rest
/// arrives. Bytes that can never form valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub(crate) fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            rest = &rest[valid..];
                            break;
                        }
                    }
                }
            }
        }

        let carried = rest.to_vec();
        self.pending = carried;
        out
    }

    /// Flushes an incomplete trailing sequence at end of stream.
    pub(crate) fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_utf8_carry_passes_ascii_through() {
        let mut decoder = Utf8Carry::default();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_utf8_carry_joins_split_sequence() {
        let bytes = "→x".as_bytes();
        let mut decoder = Utf8Carry::default();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..2]), "");
        assert_eq!(decoder.decode(&bytes[2..]), "→x");
    }

    #[test]
    fn test_utf8_carry_replaces_invalid_bytes() {
        let mut decoder = Utf8Carry::default();
        assert_eq!(decoder.decode(&[b'a', 0xff, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn test_utf8_carry_finish_flushes_truncated_tail() {
        let mut decoder = Utf8Carry::default();
        assert_eq!(decoder.decode(&[b'o', b'k', 0xe2, 0x86]), "ok");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    async fn collect_until_exit(
        output: &mut mpsc::UnboundedReceiver<PtyOutput>,
    ) -> (String, Option<i32>, Option<String>) {
        let mut text = String::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), output.recv())
                .await
                .expect("timed out waiting for PTY output")
            {
                Some(PtyOutput::Data(chunk)) => text.push_str(&chunk),
                Some(PtyOutput::Exit { exit_code, signal }) => return (text, exit_code, signal),
                None => panic!("output stream ended without an exit"),
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_spawn_reports_output_and_exit_code() {
        let mut request = SpawnRequest::new("/bin/sh");
        request.args = vec!["-c".to_string(), "printf ready; exit 3".to_string()];

        let spawned = NativePtySpawner::new().spawn(request).unwrap();
        assert!(spawned.process.pid().is_some());

        let mut output = spawned.output;
        let (text, exit_code, signal) = collect_until_exit(&mut output).await;
        assert!(text.contains("ready"));
        assert_eq!(exit_code, Some(3));
        assert_eq!(signal, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = SpawnRequest::new("/bin/sh");
        request.args = vec!["-c".to_string(), "printf \"$GREETING:$(pwd)\"".to_string()];
        request.cwd = Some(dir.path().to_path_buf());
        request
            .env
            .insert("GREETING".to_string(), "hello".to_string());

        let mut spawned = NativePtySpawner::new().spawn(request).unwrap();
        let (text, exit_code, _) = collect_until_exit(&mut spawned.output).await;
        let expected_dir = dir.path().canonicalize().unwrap();
        assert!(text.contains("hello:"));
        assert!(text.contains(expected_dir.file_name().unwrap().to_str().unwrap()));
        assert_eq!(exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_kill_terminates_process() {
        let mut request = SpawnRequest::new("/bin/sh");
        request.args = vec!["-c".to_string(), "sleep 30".to_string()];

        let mut spawned = NativePtySpawner::new().spawn(request).unwrap();
        spawned.process.kill().unwrap();
        // Second kill is a no-op.
        spawned.process.kill().unwrap();

        let (_, exit_code, signal) = collect_until_exit(&mut spawned.output).await;
        assert!(signal.is_some(), "expected a signal, got exit code {:?}", exit_code);
        assert_eq!(exit_code, None);
        assert!(matches!(
            spawned.process.write("late"),
            Err(SessionError::Exited)
        ));
    }

    #[test]
    fn test_native_spawn_missing_command_fails() {
        let request = SpawnRequest::new("/nonexistent/termhost-shell");
        let result = NativePtySpawner::new().spawn(request);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }
}
