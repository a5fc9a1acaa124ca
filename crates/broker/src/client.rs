//! Multiplexed connection to the terminal host daemon.
//!
//! Any number of requests may be in flight at once. A background reader
//! task matches responses to callers by request id and forwards pushed
//! events on the channel returned from [`DaemonClient::connect`].

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use termhost_protocol::{
    decode_message, encode_line, Command, DisposeParams, EnsureSessionParams,
    EnsureSessionResult, LineDecoder, ProtocolError, Request, RequestId, ResizeParams,
    SessionEvent, SessionRef, SessionSummary, WireMessage, WorkspaceQuery, WorkspaceState,
    WriteParams,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors talking to the daemon.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The daemon answered `ok:false`.
    #[error("daemon error: {0}")]
    Daemon(String),

    /// The socket closed before the response arrived.
    #[error("disconnected from daemon")]
    Disconnected,

    #[error("timed out connecting to daemon")]
    Timeout,
}

type Pending = DashMap<RequestId, oneshot::Sender<Result<Value, ClientError>>>;

/// Events pushed by the daemon, in arrival order.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// A connection to the daemon shared by any number of callers.
pub struct DaemonClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<Pending>,
    connected: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl DaemonClient {
    /// Connects with [`DEFAULT_CONNECT_TIMEOUT`].
    pub async fn connect(path: &Path) -> Result<(Self, EventReceiver), ClientError> {
        Self::connect_with_timeout(path, DEFAULT_CONNECT_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        path: &Path,
        timeout: Duration,
    ) -> Result<(Self, EventReceiver), ClientError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| ClientError::Timeout)??;
        let (read_half, write_half) = stream.into_split();

        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            read_half,
            pending.clone(),
            connected.clone(),
            event_tx,
        ));

        tracing::debug!(path = %path.display(), "Connected to daemon");
        let client = Self {
            writer: Mutex::new(write_half),
            pending,
            connected,
            next_id: AtomicU64::new(1),
            reader,
        };
        Ok((client, event_rx))
    }

    /// Whether the socket is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sends `command` and waits for its response.
    ///
    /// There is no timeout: the call ends with the response or with
    /// [`ClientError::Disconnected`] when the socket closes.
    pub async fn request(&self, command: Command, payload: Value) -> Result<Value, ClientError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let line = encode_line(&WireMessage::Request(Request::new(id.clone(), command, payload)))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        // The reader clears `connected` before failing what is pending, so
        // an entry added after that point is never answered.
        if !self.is_connected() {
            self.pending.remove(&id);
            return Err(ClientError::Disconnected);
        }

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&line).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.remove(&id);
            tracing::debug!(command = %command, error = %e, "Write to daemon failed");
            return Err(ClientError::Disconnected);
        }

        rx.await.unwrap_or(Err(ClientError::Disconnected))
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        command: Command,
        payload: Value,
    ) -> Result<T, ClientError> {
        let value = self.request(command, payload).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(ProtocolError::Deserialization(e.to_string())))
    }

    fn to_payload<T: serde::Serialize>(params: &T) -> Result<Value, ClientError> {
        serde_json::to_value(params)
            .map_err(|e| ClientError::Protocol(ProtocolError::Serialization(e.to_string())))
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.request(Command::Ping, Value::Null).await.map(|_| ())
    }

    /// Tells the daemon where session metadata lives.
    pub async fn configure(&self, store_path: Option<&str>) -> Result<(), ClientError> {
        self.request(Command::Configure, json!({ "storePath": store_path }))
            .await
            .map(|_| ())
    }

    pub async fn ensure_session(
        &self,
        params: &EnsureSessionParams,
    ) -> Result<EnsureSessionResult, ClientError> {
        self.request_as(Command::EnsureSession, Self::to_payload(params)?)
            .await
    }

    pub async fn release_session(&self, session_id: &str) -> Result<(), ClientError> {
        let params = SessionRef {
            session_id: session_id.to_string(),
        };
        self.request(Command::ReleaseSession, Self::to_payload(&params)?)
            .await
            .map(|_| ())
    }

    pub async fn write_session(&self, session_id: &str, data: &str) -> Result<(), ClientError> {
        let params = WriteParams {
            session_id: session_id.to_string(),
            data: data.to_string(),
        };
        self.request(Command::WriteSession, Self::to_payload(&params)?)
            .await
            .map(|_| ())
    }

    pub async fn resize_session(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), ClientError> {
        let params = ResizeParams {
            session_id: session_id.to_string(),
            cols,
            rows,
        };
        self.request(Command::ResizeSession, Self::to_payload(&params)?)
            .await
            .map(|_| ())
    }

    pub async fn dispose_session(
        &self,
        session_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let params = DisposeParams {
            session_id: session_id.to_string(),
            reason: reason.map(str::to_string),
        };
        self.request(Command::DisposeSession, Self::to_payload(&params)?)
            .await
            .map(|_| ())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ClientError> {
        #[derive(serde::Deserialize)]
        struct Listing {
            sessions: Vec<SessionSummary>,
        }
        let listing: Listing = self.request_as(Command::ListSessions, Value::Null).await?;
        Ok(listing.sessions)
    }

    pub async fn workspace_state(&self, workspace_path: &str) -> Result<WorkspaceState, ClientError> {
        let params = WorkspaceQuery {
            workspace_path: workspace_path.to_string(),
        };
        self.request_as(Command::GetWorkspaceState, Self::to_payload(&params)?)
            .await
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for DaemonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonClient")
            .field("connected", &self.is_connected())
            .field("pending", &self.pending.len())
            .finish()
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    pending: Arc<Pending>,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let mut decoder = LineDecoder::new();
    let mut buffer = vec![0u8; 8 * 1024];

    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Read from daemon failed");
                break;
            }
        };
        decoder.push(&buffer[..n]);

        while let Some(line) = decoder.next_line() {
            let message = match line.and_then(|line| decode_message(&line)) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed line from daemon");
                    continue;
                }
            };
            match message {
                WireMessage::Response(response) => match pending.remove(&response.id) {
                    Some((_, tx)) => {
                        let _ = tx.send(response.into_result().map_err(ClientError::Daemon));
                    }
                    None => {
                        tracing::debug!(id = %response.id, "Response for unknown request");
                    }
                },
                WireMessage::Event(event) => match SessionEvent::try_from(event) {
                    Ok(event) => {
                        let _ = events.send(event);
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping malformed event"),
                },
                WireMessage::Request(request) => {
                    tracing::warn!(id = %request.id, "Ignoring request sent by daemon");
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    let ids: Vec<RequestId> = pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
    }
    tracing::info!("Disconnected from daemon");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use termhost_daemon::host::{HostOptions, TerminalHost};
    use termhost_daemon::ipc::IpcServer;
    use termhost_daemon::pty::FakePtySpawner;
    use tempfile::TempDir;
    use tokio::net::UnixListener;
    use tokio_util::sync::CancellationToken;

    async fn start_daemon(dir: &TempDir) -> (std::path::PathBuf, CancellationToken) {
        let socket = dir.path().join("d.sock");
        let server = IpcServer::bind(&socket).await.unwrap();
        let options = HostOptions {
            default_shell: "/bin/sh".to_string(),
            ..HostOptions::default()
        };
        let (host, handle) = TerminalHost::new(options, Arc::new(FakePtySpawner::new()));
        let shutdown = CancellationToken::new();
        tokio::spawn(host.run());
        tokio::spawn(server.serve(handle, shutdown.clone()));
        (socket, shutdown)
    }

    #[tokio::test]
    async fn test_connect_fails_without_daemon() {
        let dir = TempDir::new().unwrap();
        let result = DaemonClient::connect(&dir.path().join("none.sock")).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }

    #[tokio::test]
    async fn test_typed_requests_and_events() {
        let dir = TempDir::new().unwrap();
        let (socket, _shutdown) = start_daemon(&dir).await;
        let (client, mut events) = DaemonClient::connect(&socket).await.unwrap();

        client.ping().await.unwrap();
        client.configure(Some("/tmp/store.json")).await.unwrap();

        let ensured = client
            .ensure_session(&EnsureSessionParams::new("/w", "main"))
            .await
            .unwrap();
        assert!(!ensured.existing);

        client.write_session(&ensured.session_id, "hello\n").await.unwrap();
        match events.recv().await.unwrap() {
            SessionEvent::Data(data) => {
                assert_eq!(data.session_id, ensured.session_id);
                assert_eq!(data.data, "hello\n");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let listed = client.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].attached);

        let state = client.workspace_state("/w/").await.unwrap();
        assert_eq!(state.sessions.len(), 1);

        client.resize_session(&ensured.session_id, 100, 30).await.unwrap();
        client.release_session(&ensured.session_id).await.unwrap();
        client
            .dispose_session(&ensured.session_id, Some("done"))
            .await
            .unwrap();
        assert!(client.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let dir = TempDir::new().unwrap();
        let (socket, _shutdown) = start_daemon(&dir).await;
        let (client, _events) = DaemonClient::connect(&socket).await.unwrap();
        let client = Arc::new(client);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                let slot = format!("slot-{}", i);
                let ensured = client
                    .ensure_session(&EnsureSessionParams::new("/w", slot.clone()))
                    .await
                    .unwrap();
                let state = client.workspace_state("/w").await.unwrap();
                assert!(state
                    .sessions
                    .iter()
                    .any(|s| s.session_id == ensured.session_id && s.slot == slot));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(client.list_sessions().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_daemon_error_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let (socket, _shutdown) = start_daemon(&dir).await;
        let (client, _events) = DaemonClient::connect(&socket).await.unwrap();

        let err = client
            .ensure_session(&EnsureSessionParams::new("", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Daemon(ref msg) if msg.contains("workspacePath")));
    }

    #[tokio::test]
    async fn test_socket_close_fails_in_flight_requests() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("mute.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        // Accepts, swallows one request, then hangs up without answering.
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            drop(stream);
        });

        let (client, mut events) = DaemonClient::connect(&socket).await.unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Disconnected));
        assert!(events.recv().await.is_none());
        assert!(!client.is_connected());

        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Disconnected));
    }
}
