//! Sequential IPC client used by the CLI.
//!
//! Sends one request at a time and waits for the response with the same id,
//! skipping any events pushed in between. Long-lived consumers that care
//! about events use the broker's client instead.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use termhost_protocol::{decode_message, encode_line, Command, LineDecoder, Request, WireMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    stream: UnixStream,
    decoder: LineDecoder,
    timeout: Duration,
    next_id: u64,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout.
    ///
    /// The timeout applies to connecting and to every later request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })??;

        Ok(Self {
            stream,
            decoder: LineDecoder::new(),
            timeout,
            next_id: 1,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends `command` and returns the `result` of a successful response.
    pub async fn request(&mut self, command: Command, payload: Value) -> Result<Value, IpcError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.request_internal(command, payload))
            .await
            .map_err(|_| {
                IpcError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "operation timed out",
                ))
            })?
    }

    async fn request_internal(&mut self, command: Command, payload: Value) -> Result<Value, IpcError> {
        let id = self.next_id;
        self.next_id += 1;

        let line = encode_line(&WireMessage::Request(Request::new(id, command, payload)))?;
        self.stream.write_all(&line).await?;
        self.stream.flush().await?;

        let mut buffer = [0u8; 8 * 1024];
        loop {
            while let Some(line) = self.decoder.next_line() {
                match decode_message(&line?)? {
                    WireMessage::Response(response) if response.id == id => {
                        return response.into_result().map_err(IpcError::Daemon);
                    }
                    _ => continue,
                }
            }

            let n = self.stream.read(&mut buffer).await?;
            if n == 0 {
                return Err(IpcError::Closed);
            }
            self.decoder.push(&buffer[..n]);
        }
    }

    /// Health check.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let result = self.request(Command::Ping, Value::Null).await?;
        Ok(result.get("ok").and_then(Value::as_bool).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_connect_fails_without_daemon() {
        let temp_dir = tempdir().unwrap();
        let result = IpcClient::connect(&temp_dir.path().join("missing.sock")).await;
        assert!(matches!(result, Err(IpcError::Io(_))));
    }

    #[tokio::test]
    async fn test_request_skips_events_and_maps_errors() {
        use tokio::net::UnixListener;

        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(
                    concat!(
                        r#"{"type":"event","event":"session-data","payload":{"sessionId":"S1","data":"x"}}"#,
                        "\n",
                        r#"{"type":"response","id":1,"ok":false,"error":{"message":"nope"}}"#,
                        "\n"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let err = client
            .request(Command::DisposeSession, serde_json::json!({"sessionId": "S1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Daemon(message) if message == "nope"));
    }
}
