//! Terminal host: the single owner of every session and client.
//!
//! One task runs [`TerminalHost::run`] and handles [`HostInput`] messages
//! one at a time. Socket connections, PTY forwarders and the CLI only ever
//! talk to it through a [`HostHandle`], so session and client state is
//! mutated by exactly one loop and needs no locks.
//!
//! ```text
//!  socket conn ──line──▶ ┌──────────────┐ ──response/event──▶ client queue
//!  socket conn ──line──▶ │ TerminalHost │ ──response/event──▶ client queue
//!  PTY forwarder ──out─▶ └──────────────┘
//! ```
//!
//! Each client gets a bounded outbound queue. A client whose queue is full
//! is treated as stalled and disconnected; the sessions it was watching keep
//! running and buffer into their pending output until someone reattaches.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use termhost_protocol::{
    decode_message, encode_line, normalize_workspace_path, request_id_hint, Command, ConfigureParams,
    DisposeParams, EnsureSessionParams, EnsureSessionResult, ProtocolError, Request, ResizeParams,
    Response, SessionData, SessionDisposed, SessionEvent, SessionExit, SessionRef, WireMessage,
    WorkspaceQuery, WorkspaceState, WriteParams, DEFAULT_OUTPUT_LIMIT,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::pty::{PtyOutput, PtySpawner, SessionError, SpawnRequest, DEFAULT_COLS, DEFAULT_ROWS};
use crate::session::{ClientId, Session, SessionId, SessionRegistry, ShellArgsPolicy};

/// Lines a client may have queued before it is considered stalled.
pub const CLIENT_QUEUE_CAPACITY: usize = 1024;

/// Idle period after which an unused host stops (60 s).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Errors surfaced in `ok:false` responses or by [`HostHandle`].
#[derive(Debug, Error)]
pub enum HostError {
    /// Unknown command or malformed payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The PTY could not be started.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A result could not be encoded.
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    /// The host loop has stopped.
    #[error("terminal host is not running")]
    Closed,
}

/// Tunables for a [`TerminalHost`].
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub idle_timeout: Duration,
    /// Command used when `ensureSession` names none.
    pub default_shell: String,
    pub shell_args: ShellArgsPolicy,
    /// Pending output kept per detached session, in characters.
    pub output_limit: usize,
    pub client_queue_capacity: usize,
    /// Initial store hint, replaced by `configure`.
    pub store_path: Option<String>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            default_shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            shell_args: ShellArgsPolicy::default(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            client_queue_capacity: CLIENT_QUEUE_CAPACITY,
            store_path: None,
        }
    }
}

/// Why [`TerminalHost::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostExit {
    /// No sessions and no clients for the whole idle period.
    Idle,
    /// Shutdown was requested or every handle was dropped.
    Shutdown,
}

/// Messages processed by the host loop.
#[derive(Debug)]
enum HostInput {
    ClientConnected {
        client: ClientId,
        outbound: mpsc::Sender<Vec<u8>>,
    },
    ClientLine {
        client: ClientId,
        line: String,
    },
    ClientClosed {
        client: ClientId,
    },
    Pty {
        session_id: SessionId,
        output: PtyOutput,
    },
    Shutdown,
}

/// A registered client: its id and the queue of encoded lines for it.
#[derive(Debug)]
pub struct ClientLink {
    pub id: ClientId,
    pub outbound: mpsc::Receiver<Vec<u8>>,
}

/// Cloneable entry point into a running host.
#[derive(Debug, Clone)]
pub struct HostHandle {
    tx: mpsc::UnboundedSender<HostInput>,
    next_client: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl HostHandle {
    /// Registers a new client.
    pub fn connect(&self) -> Result<ClientLink, HostError> {
        let client = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::channel(self.queue_capacity);
        self.tx
            .send(HostInput::ClientConnected { client, outbound })
            .map_err(|_| HostError::Closed)?;
        Ok(ClientLink {
            id: client,
            outbound: rx,
        })
    }

    /// Hands one inbound line from `client` to the host.
    pub fn send_line(&self, client: ClientId, line: String) -> Result<(), HostError> {
        self.tx
            .send(HostInput::ClientLine { client, line })
            .map_err(|_| HostError::Closed)
    }

    /// Reports that `client`'s connection is gone.
    pub fn disconnect(&self, client: ClientId) {
        let _ = self.tx.send(HostInput::ClientClosed { client });
    }

    /// Asks the host to kill every session and stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(HostInput::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct ClientState {
    outbound: mpsc::Sender<Vec<u8>>,
    subscriptions: HashSet<SessionId>,
}

/// The daemon core.
pub struct TerminalHost {
    options: HostOptions,
    spawner: Arc<dyn PtySpawner>,
    registry: SessionRegistry,
    clients: HashMap<ClientId, ClientState>,
    inbox: mpsc::UnboundedReceiver<HostInput>,
    /// Handed to PTY forwarders; weak so dropped handles end the loop.
    inbox_tx: mpsc::WeakUnboundedSender<HostInput>,
    store_path: Option<String>,
    idle_deadline: Option<Instant>,
}

impl TerminalHost {
    /// Creates a host and the handle used to reach it.
    pub fn new(options: HostOptions, spawner: Arc<dyn PtySpawner>) -> (Self, HostHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let handle = HostHandle {
            tx: tx.clone(),
            next_client: Arc::new(AtomicU64::new(1)),
            queue_capacity: options.client_queue_capacity.max(1),
        };
        let store_path = options.store_path.clone();
        let host = Self {
            options,
            spawner,
            registry: SessionRegistry::new(),
            clients: HashMap::new(),
            inbox,
            inbox_tx: tx.downgrade(),
            store_path,
            idle_deadline: None,
        };
        (host, handle)
    }

    /// Processes input until idle shutdown or an explicit stop.
    pub async fn run(mut self) -> HostExit {
        tracing::info!(
            idle_timeout_ms = self.options.idle_timeout.as_millis() as u64,
            "Terminal host running"
        );
        self.refresh_idle_deadline();

        loop {
            let deadline = self.idle_deadline;
            tokio::select! {
                input = self.inbox.recv() => match input {
                    Some(HostInput::Shutdown) | None => {
                        self.shutdown();
                        return HostExit::Shutdown;
                    }
                    Some(input) => self.handle(input).await,
                },
                _ = sleep_until(deadline) => {
                    if self.activity() == 0 {
                        tracing::info!("Idle timeout elapsed with no sessions or clients");
                        self.shutdown();
                        return HostExit::Idle;
                    }
                }
            }
            self.refresh_idle_deadline();
        }
    }

    fn activity(&self) -> usize {
        self.registry.len() + self.clients.len()
    }

    fn refresh_idle_deadline(&mut self) {
        if self.activity() > 0 {
            if self.idle_deadline.take().is_some() {
                tracing::debug!("Idle timer cancelled");
            }
        } else if self.idle_deadline.is_none() {
            tracing::debug!("Idle timer armed");
            self.idle_deadline = Some(Instant::now() + self.options.idle_timeout);
        }
    }

    fn shutdown(&mut self) {
        for mut session in self.registry.drain() {
            if let Err(e) = session.dispose() {
                tracing::warn!(session_id = %session.id(), error = %e, "Failed to kill session");
            }
        }
        self.clients.clear();
        tracing::info!("Terminal host stopped");
    }

    async fn handle(&mut self, input: HostInput) {
        match input {
            HostInput::ClientConnected { client, outbound } => {
                tracing::info!(client_id = client, "Client connected");
                self.clients.insert(
                    client,
                    ClientState {
                        outbound,
                        subscriptions: HashSet::new(),
                    },
                );
            }
            HostInput::ClientLine { client, line } => self.on_line(client, &line).await,
            HostInput::ClientClosed { client } => {
                if self.clients.contains_key(&client) {
                    tracing::info!(client_id = client, "Client disconnected");
                    self.drop_client(client);
                }
            }
            HostInput::Pty { session_id, output } => self.on_pty_output(session_id, output),
            HostInput::Shutdown => {}
        }
    }

    async fn on_line(&mut self, client: ClientId, line: &str) {
        if !self.clients.contains_key(&client) {
            tracing::debug!(client_id = client, "Ignoring line from dropped client");
            return;
        }

        let request = match decode_message(line) {
            Ok(WireMessage::Request(request)) => request,
            Ok(_) => {
                tracing::warn!(client_id = client, "Dropping non-request message");
                return;
            }
            Err(e) => {
                match request_id_hint(line) {
                    // A request we cannot parse still gets an answer when its id is readable.
                    Some(id) => {
                        tracing::warn!(client_id = client, request_id = %id, error = %e, "Rejecting malformed request");
                        self.send_to(client, &WireMessage::Response(Response::failure(id, e.to_string())));
                    }
                    None => tracing::warn!(client_id = client, error = %e, "Dropping malformed line"),
                }
                return;
            }
        };

        let response = self.dispatch(client, request).await;
        self.send_to(client, &WireMessage::Response(response));
    }

    async fn dispatch(&mut self, client: ClientId, request: Request) -> Response {
        let id = request.id.clone();
        match self.execute(client, &request).await {
            Ok(result) => Response::success(id, result),
            Err(e) => {
                tracing::warn!(
                    client_id = client,
                    request_id = %id,
                    command = %request.command,
                    error = %e,
                    "Request failed"
                );
                Response::failure(id, e.to_string())
            }
        }
    }

    async fn execute(&mut self, client: ClientId, request: &Request) -> Result<Value, HostError> {
        match request.command()? {
            Command::Ping => Ok(json!({ "ok": true })),
            Command::Configure => self.configure(request.params()?),
            Command::EnsureSession => self.ensure_session(client, request.params()?).await,
            Command::ReleaseSession => Ok(self.release_session(client, request.params()?)),
            Command::WriteSession => Ok(self.write_session(request.params()?)),
            Command::ResizeSession => Ok(self.resize_session(request.params()?)),
            Command::DisposeSession => Ok(self.dispose_session(request.params()?)),
            Command::ListSessions => Ok(json!({ "sessions": self.registry.snapshot(None) })),
            Command::GetWorkspaceState => self.workspace_state(request.params()?),
        }
    }

    fn configure(&mut self, params: ConfigureParams) -> Result<Value, HostError> {
        tracing::info!(store_path = ?params.store_path, "Store path hint received");
        self.store_path = params.store_path;
        Ok(json!({ "ok": true, "storePath": self.store_path }))
    }

    async fn ensure_session(
        &mut self,
        client: ClientId,
        params: EnsureSessionParams,
    ) -> Result<Value, HostError> {
        params.validate()?;
        let key = params.key();

        if let Some(session) = self.registry.find_by_key_mut(&key) {
            session.subscribe(client);
            if let (Some(cols), Some(rows)) = (params.cols, params.rows) {
                if session.size() != (cols, rows) {
                    if let Err(e) = session.resize(cols, rows) {
                        tracing::debug!(session_id = %session.id(), error = %e, "Resize on attach failed");
                    }
                }
            }
            let result = EnsureSessionResult {
                session_id: session.id().clone(),
                existing: true,
                pending_output: session.take_pending(),
            };
            tracing::info!(
                session_id = %result.session_id,
                client_id = client,
                pending_chars = result.pending_output.chars().count(),
                "Client attached to existing session"
            );
            self.track_subscription(client, &result.session_id);
            return Ok(serde_json::to_value(result)?);
        }

        let command = params
            .command
            .filter(|command| !command.trim().is_empty())
            .unwrap_or_else(|| self.options.default_shell.clone());
        let args = if params.args.is_empty() {
            self.options.shell_args.args_for(&command)
        } else {
            params.args
        };
        let workspace_path = normalize_workspace_path(&params.workspace_path);
        let size = (
            params.cols.unwrap_or(DEFAULT_COLS),
            params.rows.unwrap_or(DEFAULT_ROWS),
        );

        let spawn = SpawnRequest {
            command: command.clone(),
            args: args.clone(),
            cwd: Some(PathBuf::from(&workspace_path)),
            cols: size.0,
            rows: size.1,
            env: params.env,
        };
        let spawner = Arc::clone(&self.spawner);
        let spawned = tokio::task::spawn_blocking(move || spawner.spawn(spawn))
            .await
            .map_err(|e| SessionError::SpawnFailed(format!("spawn task failed: {}", e)))??;

        let session_id: SessionId = Uuid::new_v4().to_string();
        let mut session = Session::new(
            session_id.clone(),
            &workspace_path,
            &params.slot,
            command,
            args,
            size,
            self.options.output_limit,
            spawned.process,
        );
        session.subscribe(client);

        tracing::info!(
            session_id = %session_id,
            workspace = %workspace_path,
            slot = %params.slot,
            pid = ?session.pid(),
            "Session spawned"
        );

        self.registry.insert(session);
        self.track_subscription(client, &session_id);
        self.forward_pty_output(session_id.clone(), spawned.output);

        Ok(serde_json::to_value(EnsureSessionResult {
            session_id,
            existing: false,
            pending_output: String::new(),
        })?)
    }

    /// Moves one session's PTY output into the host inbox.
    fn forward_pty_output(
        &self,
        session_id: SessionId,
        mut output: mpsc::UnboundedReceiver<PtyOutput>,
    ) {
        let Some(inbox) = self.inbox_tx.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(item) = output.recv().await {
                let input = HostInput::Pty {
                    session_id: session_id.clone(),
                    output: item,
                };
                if inbox.send(input).is_err() {
                    break;
                }
            }
        });
    }

    fn release_session(&mut self, client: ClientId, params: SessionRef) -> Value {
        if let Some(session) = self.registry.get_mut(&params.session_id) {
            if session.unsubscribe(client) {
                tracing::info!(
                    session_id = %params.session_id,
                    client_id = client,
                    attached = session.is_attached(),
                    "Client released session"
                );
            }
        }
        if let Some(state) = self.clients.get_mut(&client) {
            state.subscriptions.remove(&params.session_id);
        }
        json!({ "ok": true })
    }

    fn write_session(&mut self, params: WriteParams) -> Value {
        match self.registry.get_mut(&params.session_id) {
            Some(session) => {
                if let Err(e) = session.write(&params.data) {
                    tracing::warn!(session_id = %params.session_id, error = %e, "Write failed");
                }
            }
            None => {
                tracing::debug!(session_id = %params.session_id, "Write to unknown session ignored");
            }
        }
        json!({ "ok": true })
    }

    fn resize_session(&mut self, params: ResizeParams) -> Value {
        if let Some(session) = self.registry.get_mut(&params.session_id) {
            if let Err(e) = session.resize(params.cols, params.rows) {
                tracing::warn!(
                    session_id = %params.session_id,
                    cols = params.cols,
                    rows = params.rows,
                    error = %e,
                    "Resize failed"
                );
            }
        }
        json!({ "ok": true })
    }

    fn dispose_session(&mut self, params: DisposeParams) -> Value {
        let Some(mut session) = self.registry.remove(&params.session_id) else {
            tracing::debug!(session_id = %params.session_id, "Dispose of unknown session ignored");
            return json!({ "ok": true });
        };

        if let Err(e) = session.dispose() {
            tracing::warn!(session_id = %params.session_id, error = %e, "Failed to kill session");
        }
        tracing::info!(
            session_id = %params.session_id,
            reason = ?params.reason,
            "Session disposed"
        );

        let subscribers = session.subscribers();
        let event = SessionEvent::Disposed(SessionDisposed {
            session_id: params.session_id.clone(),
            reason: params.reason,
        });
        self.broadcast(&subscribers, &event);
        self.untrack_session(&subscribers, &params.session_id);
        json!({ "ok": true })
    }

    fn workspace_state(&self, params: WorkspaceQuery) -> Result<Value, HostError> {
        let workspace_path = normalize_workspace_path(&params.workspace_path);
        let sessions = self.registry.snapshot(Some(&workspace_path));
        Ok(serde_json::to_value(WorkspaceState {
            workspace_path,
            sessions,
        })?)
    }

    fn on_pty_output(&mut self, session_id: SessionId, output: PtyOutput) {
        match output {
            PtyOutput::Data(data) => {
                let Some(session) = self.registry.get_mut(&session_id) else {
                    tracing::trace!(session_id = %session_id, "Output for removed session dropped");
                    return;
                };
                if !session.is_attached() {
                    session.buffer_output(&data);
                    return;
                }

                let subscribers = session.subscribers();
                let event = SessionEvent::Data(SessionData {
                    session_id: session_id.clone(),
                    data,
                });
                let delivered = self.broadcast(&subscribers, &event);
                if delivered == 0 {
                    // Every subscriber was dropped on this chunk.
                    if let (Some(session), SessionEvent::Data(chunk)) =
                        (self.registry.get_mut(&session_id), &event)
                    {
                        session.buffer_output(&chunk.data);
                    }
                }
            }
            PtyOutput::Exit { exit_code, signal } => {
                // Disposed sessions are already gone; their kill shows up here.
                let Some(mut session) = self.registry.remove(&session_id) else {
                    tracing::debug!(session_id = %session_id, "Exit for removed session ignored");
                    return;
                };
                session.mark_exited();
                tracing::info!(
                    session_id = %session_id,
                    exit_code = ?exit_code,
                    signal = ?signal,
                    "Session exited"
                );

                let subscribers = session.subscribers();
                let event = SessionEvent::Exit(SessionExit {
                    session_id: session_id.clone(),
                    exit_code,
                    signal,
                });
                self.broadcast(&subscribers, &event);
                self.untrack_session(&subscribers, &session_id);
            }
        }
    }

    /// Queues `event` for each of `subscribers`; returns how many got it.
    fn broadcast(&mut self, subscribers: &[ClientId], event: &SessionEvent) -> usize {
        let line = match event
            .to_wire()
            .and_then(|wire| encode_line(&WireMessage::Event(wire)))
        {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(session_id = %event.session_id(), error = %e, "Failed to encode event");
                return 0;
            }
        };

        let mut delivered = 0;
        for client in subscribers {
            if self.queue_line(*client, line.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn send_to(&mut self, client: ClientId, message: &WireMessage) {
        match encode_line(message) {
            Ok(line) => {
                self.queue_line(client, line);
            }
            Err(e) => tracing::error!(client_id = client, error = %e, "Failed to encode message"),
        }
    }

    /// Queues one line; drops the client if its queue is full or closed.
    fn queue_line(&mut self, client: ClientId, line: Vec<u8>) -> bool {
        let Some(state) = self.clients.get(&client) else {
            return false;
        };
        match state.outbound.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    client_id = client,
                    capacity = self.options.client_queue_capacity,
                    "Client is not reading, disconnecting"
                );
                self.drop_client(client);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(client_id = client, "Client channel closed");
                self.drop_client(client);
                false
            }
        }
    }

    /// Forgets a client and unsubscribes it everywhere. Sessions keep running.
    fn drop_client(&mut self, client: ClientId) {
        let Some(state) = self.clients.remove(&client) else {
            return;
        };
        let detached = self.registry.detach_client(client, &state.subscriptions);
        tracing::debug!(
            client_id = client,
            detached = detached.len(),
            "Client subscriptions cleared"
        );
    }

    fn track_subscription(&mut self, client: ClientId, session_id: &SessionId) {
        if let Some(state) = self.clients.get_mut(&client) {
            state.subscriptions.insert(session_id.clone());
        }
    }

    fn untrack_session(&mut self, subscribers: &[ClientId], session_id: &SessionId) {
        for client in subscribers {
            if let Some(state) = self.clients.get_mut(client) {
                state.subscriptions.remove(session_id);
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::FakePtySpawner;
    use termhost_protocol::{EventKind, LineDecoder, RequestId, SessionSummary};

    struct TestClient {
        id: ClientId,
        handle: HostHandle,
        outbound: mpsc::Receiver<Vec<u8>>,
        decoder: LineDecoder,
        events: Vec<SessionEvent>,
        next_id: u64,
    }

    impl TestClient {
        fn connect(handle: &HostHandle) -> Self {
            let link = handle.connect().unwrap();
            Self {
                id: link.id,
                handle: handle.clone(),
                outbound: link.outbound,
                decoder: LineDecoder::new(),
                events: Vec::new(),
                next_id: 1,
            }
        }

        async fn next_message(&mut self) -> Option<WireMessage> {
            loop {
                if let Some(line) = self.decoder.next_line() {
                    return Some(decode_message(&line.unwrap()).unwrap());
                }
                let bytes = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
                    .await
                    .expect("timed out waiting for host")?;
                self.decoder.push(&bytes);
            }
        }

        async fn call(&mut self, command: Command, payload: Value) -> Response {
            let id = self.next_id;
            self.next_id += 1;
            let line = serde_json::to_string(&WireMessage::Request(Request::new(
                id, command, payload,
            )))
            .unwrap();
            self.handle.send_line(self.id, line).unwrap();
            loop {
                match self.next_message().await.expect("client dropped") {
                    WireMessage::Response(response) if response.id == id => return response,
                    WireMessage::Event(event) => {
                        self.events.push(SessionEvent::try_from(event).unwrap())
                    }
                    other => panic!("unexpected message: {:?}", other),
                }
            }
        }

        async fn ok(&mut self, command: Command, payload: Value) -> Value {
            self.call(command, payload).await.into_result().unwrap()
        }

        async fn ensure(&mut self, workspace: &str, slot: &str) -> EnsureSessionResult {
            let value = self
                .ok(
                    Command::EnsureSession,
                    json!({"workspacePath": workspace, "slot": slot, "command": "/bin/sh"}),
                )
                .await;
            serde_json::from_value(value).unwrap()
        }

        async fn next_event(&mut self) -> SessionEvent {
            if !self.events.is_empty() {
                return self.events.remove(0);
            }
            match self.next_message().await.expect("client dropped") {
                WireMessage::Event(event) => SessionEvent::try_from(event).unwrap(),
                other => panic!("expected event, got {:?}", other),
            }
        }

        async fn list(&mut self) -> Vec<SessionSummary> {
            let value = self.ok(Command::ListSessions, Value::Null).await;
            serde_json::from_value(value["sessions"].clone()).unwrap()
        }
    }

    fn start_host(options: HostOptions) -> (HostHandle, tokio::task::JoinHandle<HostExit>) {
        let (host, handle) = TerminalHost::new(options, Arc::new(FakePtySpawner::new()));
        (handle, tokio::spawn(host.run()))
    }

    fn test_options() -> HostOptions {
        HostOptions {
            default_shell: "/bin/sh".to_string(),
            ..HostOptions::default()
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);
        assert_eq!(client.ok(Command::Ping, Value::Null).await, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_configure_acknowledges_store_path() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);
        let result = client
            .ok(Command::Configure, json!({"storePath": "/tmp/sessions.json"}))
            .await;
        assert_eq!(result["ok"], true);
        assert_eq!(result["storePath"], "/tmp/sessions.json");
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent_per_key() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);

        let first = client.ensure("/w", "main").await;
        assert!(!first.existing);
        assert!(first.pending_output.is_empty());

        let second = client.ensure("/w/", "main").await;
        assert!(second.existing);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.pending_output, "");

        let other = client.ensure("/w", "tests").await;
        assert_ne!(other.session_id, first.session_id);
        assert_eq!(client.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_requires_workspace_and_slot() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);

        let response = client
            .call(Command::EnsureSession, json!({"workspacePath": "/w"}))
            .await;
        assert!(!response.ok);
        assert!(response.into_result().unwrap_err().contains("slot is required"));

        let response = client
            .call(Command::EnsureSession, json!({"slot": "main"}))
            .await;
        assert!(response
            .into_result()
            .unwrap_err()
            .contains("workspacePath is required"));
        assert!(client.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_command_is_an_error_response() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);

        let line = r#"{"type":"request","id":42,"command":"frobnicate","payload":{}}"#;
        handle.send_line(client.id, line.to_string()).unwrap();
        match client.next_message().await.unwrap() {
            WireMessage::Response(response) => {
                assert_eq!(response.id, 42u64);
                assert_eq!(
                    response.into_result().unwrap_err(),
                    "unsupported command: frobnicate"
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_string_request_id_is_echoed() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);

        let line = r#"{"type":"request","id":"a1","command":"ping"}"#;
        handle.send_line(client.id, line.to_string()).unwrap();
        match client.next_message().await.unwrap() {
            WireMessage::Response(response) => {
                assert_eq!(response.id, RequestId::from("a1"));
                assert!(response.ok);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unparseable_request_with_id_gets_error_response() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);

        // `command` is missing, so the envelope does not parse.
        let line = r#"{"type":"request","id":"b2","payload":{}}"#;
        handle.send_line(client.id, line.to_string()).unwrap();
        match client.next_message().await.unwrap() {
            WireMessage::Response(response) => {
                assert_eq!(response.id, RequestId::from("b2"));
                assert!(!response.ok);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_lines_are_dropped() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);

        handle.send_line(client.id, "not json".to_string()).unwrap();
        handle
            .send_line(client.id, r#"{"type":"event","event":"session-data","payload":{}}"#.to_string())
            .unwrap();
        assert_eq!(client.ok(Command::Ping, Value::Null).await["ok"], true);
    }

    #[tokio::test]
    async fn test_data_is_pushed_to_subscribers_in_order() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);
        let session = client.ensure("/w", "main").await;

        for chunk in ["one\n", "two\n", "three\n"] {
            client
                .ok(
                    Command::WriteSession,
                    json!({"sessionId": session.session_id, "data": chunk}),
                )
                .await;
        }

        let mut received = String::new();
        while received.len() < "one\ntwo\nthree\n".len() {
            match client.next_event().await {
                SessionEvent::Data(data) => {
                    assert_eq!(data.session_id, session.session_id);
                    received.push_str(&data.data);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(received, "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn test_release_buffers_output_without_killing() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);
        let session = client.ensure("/w", "main").await;

        client
            .ok(Command::ReleaseSession, json!({"sessionId": session.session_id}))
            .await;
        client
            .ok(
                Command::WriteSession,
                json!({"sessionId": session.session_id, "data": "buffered\n"}),
            )
            .await;

        let listed = client.list().await;
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].attached);

        let again = client.ensure("/w", "main").await;
        assert!(again.existing);
        assert_eq!(again.session_id, session.session_id);
        assert_eq!(again.pending_output, "buffered\n");
        assert!(client.events.is_empty());

        // Pending output is handed out once.
        let third = client.ensure("/w", "main").await;
        assert_eq!(third.pending_output, "");
    }

    #[tokio::test]
    async fn test_pending_output_keeps_trailing_window() {
        let options = HostOptions {
            output_limit: 10,
            ..test_options()
        };
        let (handle, _task) = start_host(options);
        let mut client = TestClient::connect(&handle);
        let session = client.ensure("/w", "main").await;
        client
            .ok(Command::ReleaseSession, json!({"sessionId": session.session_id}))
            .await;

        for chunk in ["abcdef", "ghijkl", "mnop"] {
            client
                .ok(
                    Command::WriteSession,
                    json!({"sessionId": session.session_id, "data": chunk}),
                )
                .await;
        }
        // Let the forwarder deliver before reattaching.
        client.ok(Command::Ping, Value::Null).await;

        let again = client.ensure("/w", "main").await;
        assert_eq!(again.pending_output, "ghijklmnop");
    }

    #[tokio::test]
    async fn test_exit_removes_session_and_next_ensure_spawns_fresh() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);
        let session = client.ensure("/w", "main").await;

        client
            .ok(
                Command::WriteSession,
                json!({"sessionId": session.session_id, "data": "exit 4\n"}),
            )
            .await;

        let exit = loop {
            match client.next_event().await {
                SessionEvent::Exit(exit) => break exit,
                SessionEvent::Data(_) => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        };
        assert_eq!(exit.session_id, session.session_id);
        assert_eq!(exit.exit_code, Some(4));
        assert_eq!(exit.signal, None);
        assert!(client.list().await.is_empty());

        let fresh = client.ensure("/w", "main").await;
        assert!(!fresh.existing);
        assert_ne!(fresh.session_id, session.session_id);
    }

    #[tokio::test]
    async fn test_dispose_notifies_every_subscriber_once() {
        let (handle, _task) = start_host(test_options());
        let mut first = TestClient::connect(&handle);
        let mut second = TestClient::connect(&handle);

        let session = first.ensure("/w", "main").await;
        second.ensure("/w", "main").await;

        first
            .ok(
                Command::DisposeSession,
                json!({"sessionId": session.session_id, "reason": "workspace-removed"}),
            )
            .await;

        for client in [&mut first, &mut second] {
            assert_eq!(
                client.next_event().await,
                SessionEvent::Disposed(SessionDisposed {
                    session_id: session.session_id.clone(),
                    reason: Some("workspace-removed".to_string()),
                })
            );
        }

        // The kill's exit is swallowed.
        assert!(first.list().await.is_empty());
        assert!(first.events.is_empty());
        assert!(second.list().await.is_empty());
        assert!(second.events.is_empty());
    }

    #[tokio::test]
    async fn test_stale_session_ids_are_no_ops() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);

        for (command, payload) in [
            (Command::WriteSession, json!({"sessionId": "gone", "data": "x"})),
            (Command::ResizeSession, json!({"sessionId": "gone", "cols": 100, "rows": 30})),
            (Command::ReleaseSession, json!({"sessionId": "gone"})),
            (Command::DisposeSession, json!({"sessionId": "gone"})),
        ] {
            let response = client.call(command, payload).await;
            assert!(response.ok, "{} should be a no-op", command);
        }
    }

    #[tokio::test]
    async fn test_disconnect_keeps_sessions() {
        let (handle, _task) = start_host(test_options());
        let mut first = TestClient::connect(&handle);
        let session = first.ensure("/w", "main").await;
        handle.disconnect(first.id);

        let mut second = TestClient::connect(&handle);
        second
            .ok(
                Command::WriteSession,
                json!({"sessionId": session.session_id, "data": "while away\n"}),
            )
            .await;
        second.ok(Command::Ping, Value::Null).await;

        let again = second.ensure("/w", "main").await;
        assert!(again.existing);
        assert_eq!(again.pending_output, "while away\n");
    }

    #[tokio::test]
    async fn test_disconnect_only_detaches_that_clients_sessions() {
        let (handle, _task) = start_host(test_options());
        let mut stays = TestClient::connect(&handle);
        let mut leaves = TestClient::connect(&handle);

        let shared = stays.ensure("/w", "shared").await;
        leaves.ensure("/w", "shared").await;
        let own = leaves.ensure("/w", "own").await;
        handle.disconnect(leaves.id);

        stays
            .ok(
                Command::WriteSession,
                json!({"sessionId": own.session_id, "data": "nobody\n"}),
            )
            .await;
        stays
            .ok(
                Command::WriteSession,
                json!({"sessionId": shared.session_id, "data": "still here\n"}),
            )
            .await;

        match stays.next_event().await {
            SessionEvent::Data(data) => {
                assert_eq!(data.session_id, shared.session_id);
                assert_eq!(data.data, "still here\n");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let reattached = stays.ensure("/w", "own").await;
        assert!(reattached.existing);
        assert_eq!(reattached.pending_output, "nobody\n");
    }

    #[tokio::test]
    async fn test_workspace_state_filters_on_normalized_path() {
        let (handle, _task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);
        client.ensure("/w/repo", "main").await;
        client.ensure("/w/repo", "tests").await;
        client.ensure("/w/other", "main").await;

        let value = client
            .ok(Command::GetWorkspaceState, json!({"workspacePath": "/w/./repo/"}))
            .await;
        let state: WorkspaceState = serde_json::from_value(value).unwrap();
        assert_eq!(state.workspace_path, "/w/repo");
        let slots: Vec<&str> = state.sessions.iter().map(|s| s.slot.as_str()).collect();
        assert_eq!(slots, vec!["main", "tests"]);
    }

    #[tokio::test]
    async fn test_default_args_follow_shell_basename() {
        let spawner = Arc::new(FakePtySpawner::new());
        let (host, handle) = TerminalHost::new(test_options(), spawner.clone());
        let _task = tokio::spawn(host.run());
        let mut client = TestClient::connect(&handle);

        for (slot, command) in [("a", "/usr/bin/fish"), ("b", "pwsh.exe"), ("c", "/bin/bash")] {
            client
                .ok(
                    Command::EnsureSession,
                    json!({"workspacePath": "/w", "slot": slot, "command": command}),
                )
                .await;
        }
        client
            .ok(
                Command::EnsureSession,
                json!({"workspacePath": "/w", "slot": "d", "command": "/bin/sh", "args": ["-c", "true"]}),
            )
            .await;

        let args: Vec<Vec<String>> = spawner.spawned().into_iter().map(|r| r.args).collect();
        assert_eq!(args[0], vec!["-i"]);
        assert_eq!(args[1], vec!["-NoLogo"]);
        assert_eq!(args[2], vec!["-i"]);
        assert_eq!(args[3], vec!["-c", "true"]);
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        struct FailingSpawner;
        impl PtySpawner for FailingSpawner {
            fn spawn(&self, request: SpawnRequest) -> Result<crate::pty::SpawnedPty, SessionError> {
                Err(SessionError::SpawnFailed(format!("{}: not found", request.command)))
            }
        }

        let (host, handle) = TerminalHost::new(test_options(), Arc::new(FailingSpawner));
        let _task = tokio::spawn(host.run());
        let mut client = TestClient::connect(&handle);

        let response = client
            .call(
                Command::EnsureSession,
                json!({"workspacePath": "/w", "slot": "main", "command": "nope"}),
            )
            .await;
        let message = response.into_result().unwrap_err();
        assert!(message.contains("failed to spawn PTY"));
        assert!(client.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_client_is_dropped_and_output_buffers() {
        let options = HostOptions {
            client_queue_capacity: 2,
            ..test_options()
        };
        let (handle, _task) = start_host(options);
        let mut slow = TestClient::connect(&handle);
        let session = slow.ensure("/w", "main").await;

        // Another client writes while `slow` never reads its queue.
        let mut writer = TestClient::connect(&handle);
        for i in 0..5 {
            writer
                .ok(
                    Command::WriteSession,
                    json!({"sessionId": session.session_id, "data": format!("{}\n", i)}),
                )
                .await;
        }
        writer.ok(Command::Ping, Value::Null).await;

        // `slow` receives what fit, then its queue closes.
        let mut seen = 0;
        while let Some(message) = slow.next_message().await {
            assert!(matches!(message, WireMessage::Event(_)));
            seen += 1;
        }
        assert_eq!(seen, 2);

        let again = writer.ensure("/w", "main").await;
        assert!(again.existing);
        assert_eq!(again.pending_output, "2\n3\n4\n");
    }

    #[tokio::test]
    async fn test_idle_shutdown_after_last_client_leaves() {
        let options = HostOptions {
            idle_timeout: Duration::from_millis(50),
            ..test_options()
        };
        let (handle, task) = start_host(options);
        let client = TestClient::connect(&handle);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!task.is_finished());

        handle.disconnect(client.id);
        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("host did not stop")
            .unwrap();
        assert_eq!(exit, HostExit::Idle);
    }

    #[tokio::test]
    async fn test_live_session_prevents_idle_shutdown() {
        let options = HostOptions {
            idle_timeout: Duration::from_millis(30),
            ..test_options()
        };
        let (handle, task) = start_host(options);
        let mut client = TestClient::connect(&handle);
        let session = client.ensure("/w", "main").await;
        handle.disconnect(client.id);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        let mut other = TestClient::connect(&handle);
        other
            .ok(Command::DisposeSession, json!({"sessionId": session.session_id}))
            .await;
        handle.disconnect(other.id);

        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("host did not stop")
            .unwrap();
        assert_eq!(exit, HostExit::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_kills_sessions() {
        let (handle, task) = start_host(test_options());
        let mut client = TestClient::connect(&handle);
        client.ensure("/w", "main").await;

        handle.shutdown();
        assert_eq!(task.await.unwrap(), HostExit::Shutdown);
        assert!(handle.connect().is_err() || handle.is_closed());
    }

    #[test]
    fn test_event_kind_for_data() {
        let event = SessionEvent::Data(SessionData {
            session_id: "S1".to_string(),
            data: "hi\n".to_string(),
        })
        .to_wire()
        .unwrap();
        assert_eq!(event.event, EventKind::SessionData);
    }
}
