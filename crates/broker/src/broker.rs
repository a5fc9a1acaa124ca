//! UI-facing session façade.
//!
//! [`TerminalSessionBroker`] sits between a UI process and the daemon. It
//! merges persisted history with whatever the daemon buffered while nobody
//! was attached, persists output and exit status as events arrive, and
//! reference counts subscriptions per UI connection so that one daemon
//! socket can serve many terminal tabs.
//!
//! When the daemon connection drops, sessions that UI connections still
//! hold are reattached over a new connection if the daemon kept them, and
//! reported as disposed otherwise.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use termhost_protocol::{
    normalize_workspace_path, EnsureSessionParams, ProtocolError, SessionData, SessionDisposed,
    SessionEvent, SessionExit, SessionSummary, DEFAULT_OUTPUT_LIMIT,
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

use crate::client::{ClientError, DaemonClient, EventReceiver, DEFAULT_CONNECT_TIMEOUT};
use crate::store::{MetadataStore, SlotRecord, StoreError};

/// Capacity of the UI event channel before slow subscribers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How often buffered history is handed to the store.
const STORE_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Delay between connect attempts while a freshly started daemon comes up.
const DAEMON_START_POLL: Duration = Duration::from_millis(50);

/// `reason` of the [`BrokerEvent::Disposed`] sent for a held session the
/// daemon no longer has after a reconnect.
pub const CONNECTION_LOST_REASON: &str = "connection-lost";

/// Identifies one UI connection (a window, a web view, ...).
pub type ConnectionId = u64;

/// Broker errors surfaced to the UI.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The daemon socket could not be reached. Only `ensure_session`
    /// reports this; other operations degrade to no-ops.
    #[error("terminal daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// The daemon rejected the request.
    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("invalid request: {0}")]
    InvalidRequest(#[source] ProtocolError),

    #[error("metadata store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ClientError> for BrokerError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Daemon(message) => BrokerError::Daemon(message),
            ClientError::Protocol(e) => BrokerError::Daemon(e.to_string()),
            other => BrokerError::DaemonUnavailable(other.to_string()),
        }
    }
}

/// How to start the daemon when its socket does not answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl DaemonCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Starts the daemon in a session of its own with no stdio and does not
    /// wait for it. Returns its pid.
    fn spawn_detached(&self) -> std::io::Result<Option<u32>> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(drop)
                    .map_err(std::io::Error::from)
            });
        }
        let child = command.spawn()?;
        Ok(child.id())
    }
}

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub socket_path: PathBuf,
    /// Sent to the daemon with `configure` after every connect.
    pub store_path: Option<String>,
    /// Characters of history kept per slot.
    pub history_limit: usize,
    /// Per connect attempt, and how long a started daemon gets to listen.
    pub connect_timeout: Duration,
    /// Started when the socket does not answer. Without it an absent daemon
    /// makes `ensure_session` fail with [`BrokerError::DaemonUnavailable`].
    pub daemon_command: Option<DaemonCommand>,
}

impl BrokerOptions {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            store_path: None,
            history_limit: DEFAULT_OUTPUT_LIMIT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            daemon_command: None,
        }
    }
}

/// Where a session lives, as far as the broker knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLocation {
    pub workspace_path: String,
    pub slot: String,
}

/// Result of [`TerminalSessionBroker::ensure_session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsuredSession {
    pub session_id: String,
    pub existing: bool,
    /// Persisted history followed by output buffered by the daemon.
    pub history: String,
    pub quick_command_executed: bool,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<String>,
    pub label: Option<String>,
}

/// Options for [`TerminalSessionBroker::dispose`].
#[derive(Debug, Clone, Default)]
pub struct DisposeOptions {
    /// Keep the persisted record instead of clearing it.
    pub preserve: bool,
    pub reason: Option<String>,
}

/// Daemon events as forwarded to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Data {
        session_id: String,
        location: Option<SessionLocation>,
        data: String,
    },
    Exit {
        session_id: String,
        location: Option<SessionLocation>,
        exit_code: Option<i32>,
        signal: Option<String>,
    },
    Disposed {
        session_id: String,
        location: Option<SessionLocation>,
        reason: Option<String>,
    },
    /// The daemon connection dropped. Writes are dropped until
    /// [`BrokerEvent::Reconnected`].
    Disconnected,
    /// Held sessions were reattached. Output the daemon buffered in
    /// between has already been sent as [`BrokerEvent::Data`].
    Reconnected,
}

impl BrokerEvent {
    /// The session the event is about; `None` for connection events.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            BrokerEvent::Data { session_id, .. }
            | BrokerEvent::Exit { session_id, .. }
            | BrokerEvent::Disposed { session_id, .. } => Some(session_id),
            BrokerEvent::Disconnected | BrokerEvent::Reconnected => None,
        }
    }
}

/// A session some UI connection held when the daemon connection dropped.
struct HeldSession {
    session_id: String,
    location: Option<SessionLocation>,
    connections: HashSet<ConnectionId>,
}

struct Inner {
    options: BrokerOptions,
    store: Arc<dyn MetadataStore>,
    daemon: Mutex<Option<Arc<DaemonClient>>>,
    /// Read-held from an `ensureSession` request until its session is
    /// registered. The event pump write-holds it per event, so output the
    /// daemon pushes right after the response is routed once the location
    /// is known.
    routing: RwLock<()>,
    /// Session id to location. Entries are dropped on exit and dispose.
    sessions: DashMap<String, SessionLocation>,
    /// Locations of sessions disposed through this broker whose
    /// `session-disposed` event has not been seen yet.
    retired: DashMap<String, SessionLocation>,
    /// UI connections holding each session.
    holders: DashMap<String, HashSet<ConnectionId>>,
    events: broadcast::Sender<BrokerEvent>,
    next_connection: AtomicU64,
}

/// Terminal session broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TerminalSessionBroker {
    inner: Arc<Inner>,
}

impl TerminalSessionBroker {
    pub fn new(options: BrokerOptions, store: Arc<dyn MetadataStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                options,
                store,
                daemon: Mutex::new(None),
                routing: RwLock::new(()),
                sessions: DashMap::new(),
                retired: DashMap::new(),
                holders: DashMap::new(),
                events,
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.inner.options
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.inner.store
    }

    /// Allocates an id for a new UI connection.
    pub fn open_connection(&self) -> ConnectionId {
        self.inner.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Receives every daemon event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Whether a daemon connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.inner.current().await.is_some()
    }

    /// Known location of a session.
    pub fn location(&self, session_id: &str) -> Option<SessionLocation> {
        self.inner.sessions.get(session_id).map(|l| l.clone())
    }

    /// Gets or creates the session for `(workspace_path, slot)` and
    /// subscribes `connection` to it.
    ///
    /// Fails with [`BrokerError::DaemonUnavailable`] when the daemon cannot
    /// be reached, so the UI can show the terminal as unavailable.
    pub async fn ensure_session(
        &self,
        params: EnsureSessionParams,
        connection: ConnectionId,
    ) -> Result<EnsuredSession, BrokerError> {
        params.validate().map_err(BrokerError::InvalidRequest)?;
        let inner = &self.inner;
        let workspace = normalize_workspace_path(&params.workspace_path);
        let slot = params.slot.clone();

        let saved = match inner.store.load(&workspace, &slot) {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(workspace = %workspace, slot = %slot, error = %e, "Failed to load session metadata");
                SlotRecord::default()
            }
        };

        let routing = inner.routing.read().await;
        let client = inner.client().await?;
        let result = client.ensure_session(&params).await?;

        if !result.pending_output.is_empty() {
            if let Err(e) = inner.store.append_history(
                &workspace,
                &slot,
                &result.pending_output,
                inner.options.history_limit,
            ) {
                tracing::warn!(session_id = %result.session_id, error = %e, "Failed to persist buffered output");
            }
        }

        let (last_exit_code, last_signal) = if result.existing {
            (None, None)
        } else {
            // A fresh process is running; the stored exit status belongs to
            // the previous one and is reported this once.
            if saved.last_exit_code.is_some() || saved.last_signal.is_some() {
                if let Err(e) = inner.store.record_exit(&workspace, &slot, None, None) {
                    tracing::warn!(session_id = %result.session_id, error = %e, "Failed to reset exit status");
                }
            }
            (saved.last_exit_code, saved.last_signal.clone())
        };

        let mut history = saved.history;
        history.push_str(&result.pending_output);

        inner.sessions.insert(
            result.session_id.clone(),
            SessionLocation {
                workspace_path: workspace.clone(),
                slot: slot.clone(),
            },
        );
        inner
            .holders
            .entry(result.session_id.clone())
            .or_default()
            .insert(connection);
        drop(routing);

        tracing::info!(
            session_id = %result.session_id,
            workspace = %workspace,
            slot = %slot,
            existing = result.existing,
            connection_id = connection,
            "Session ensured"
        );

        Ok(EnsuredSession {
            session_id: result.session_id,
            existing: result.existing,
            history,
            quick_command_executed: saved.quick_command_executed,
            last_exit_code,
            last_signal,
            label: saved.label,
        })
    }

    pub async fn write(&self, session_id: &str, data: &str) -> Result<(), BrokerError> {
        let Some(client) = self.inner.current().await else {
            tracing::warn!(session_id = %session_id, "Write dropped, daemon not connected");
            return Ok(());
        };
        if let Err(e) = client.write_session(session_id, data).await {
            tracing::warn!(session_id = %session_id, error = %e, "Write failed");
        }
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), BrokerError> {
        let Some(client) = self.inner.current().await else {
            tracing::warn!(session_id = %session_id, "Resize dropped, daemon not connected");
            return Ok(());
        };
        if let Err(e) = client.resize_session(session_id, cols, rows).await {
            tracing::warn!(session_id = %session_id, error = %e, "Resize failed");
        }
        Ok(())
    }

    /// Types `command` into the session followed by Enter and records that
    /// the slot's quick command has run.
    ///
    /// Returns `false` when the command could not be delivered; the flag is
    /// left untouched then.
    pub async fn run_quick_command(&self, session_id: &str, command: &str) -> Result<bool, BrokerError> {
        let Some(location) = self.location(session_id) else {
            tracing::warn!(session_id = %session_id, "Quick command for unknown session");
            return Ok(false);
        };
        let Some(client) = self.inner.current().await else {
            tracing::warn!(session_id = %session_id, "Quick command dropped, daemon not connected");
            return Ok(false);
        };
        if let Err(e) = client.write_session(session_id, &format!("{command}\r\n")).await {
            tracing::warn!(session_id = %session_id, error = %e, "Quick command failed");
            return Ok(false);
        }

        self.inner
            .store
            .mark_quick_command_executed(&location.workspace_path, &location.slot)?;
        tracing::info!(session_id = %session_id, slot = %location.slot, "Quick command sent");
        Ok(true)
    }

    /// Drops `connection`'s hold on a session. The daemon subscription is
    /// released once no UI connection holds the session.
    pub async fn release(&self, session_id: &str, connection: ConnectionId) -> Result<(), BrokerError> {
        if !self.inner.drop_holder(session_id, connection) {
            tracing::debug!(session_id = %session_id, connection_id = connection, "Session still held");
            return Ok(());
        }

        let Some(client) = self.inner.current().await else {
            tracing::warn!(session_id = %session_id, "Release dropped, daemon not connected");
            return Ok(());
        };
        if let Err(e) = client.release_session(session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Release failed");
        }
        Ok(())
    }

    /// Releases everything `connection` holds.
    pub async fn disconnect(&self, connection: ConnectionId) -> Result<(), BrokerError> {
        let held: Vec<String> = self
            .inner
            .holders
            .iter()
            .filter(|entry| entry.value().contains(&connection))
            .map(|entry| entry.key().clone())
            .collect();

        tracing::debug!(connection_id = connection, sessions = held.len(), "UI connection closed");
        for session_id in held {
            self.release(&session_id, connection).await?;
        }
        Ok(())
    }

    /// Terminates a session. Unless `options.preserve` is set, its persisted
    /// record is cleared as well.
    pub async fn dispose(&self, session_id: &str, options: DisposeOptions) -> Result<(), BrokerError> {
        let inner = &self.inner;
        let location = inner.sessions.remove(session_id).map(|(_, l)| l);
        let subscribed = inner.holders.remove(session_id).is_some();

        let reached = match inner.current().await {
            Some(client) => {
                // The daemon pushes `session-disposed` to subscribers; keep
                // the location around until the event pump sees it.
                if let (true, Some(location)) = (subscribed, &location) {
                    inner.retired.insert(session_id.to_string(), location.clone());
                }
                match client.dispose_session(session_id, options.reason.as_deref()).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Dispose failed");
                        inner.retired.remove(session_id);
                        false
                    }
                }
            }
            None => {
                tracing::warn!(session_id = %session_id, "Dispose sent nowhere, daemon not connected");
                false
            }
        };

        if !options.preserve {
            if let Some(location) = &location {
                if let Err(e) = inner.store.clear(&location.workspace_path, &location.slot) {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to clear session metadata");
                }
            }
        }

        tracing::info!(
            session_id = %session_id,
            reason = ?options.reason,
            preserve = options.preserve,
            reached_daemon = reached,
            "Session disposed"
        );
        Ok(())
    }

    /// Live sessions, or nothing when the daemon cannot be reached.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let client = match self.inner.client().await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot list sessions");
                return Vec::new();
            }
        };
        match client.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list sessions");
                Vec::new()
            }
        }
    }

    pub fn mark_quick_command_executed(&self, workspace_path: &str, slot: &str) -> Result<(), BrokerError> {
        self.inner
            .store
            .mark_quick_command_executed(&normalize_workspace_path(workspace_path), slot)?;
        Ok(())
    }

    /// Sets or clears the label shown for a slot, such as the name of the
    /// program running in its foreground.
    pub fn set_label(&self, workspace_path: &str, slot: &str, label: Option<&str>) -> Result<(), BrokerError> {
        self.inner
            .store
            .set_label(&normalize_workspace_path(workspace_path), slot, label)?;
        Ok(())
    }

    /// Writes buffered history out now instead of on the next flush tick.
    pub fn flush(&self) -> Result<(), BrokerError> {
        self.inner.store.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for TerminalSessionBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSessionBroker")
            .field("socket_path", &self.inner.options.socket_path)
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

impl Inner {
    /// The open connection, if any. Never connects.
    async fn current(&self) -> Option<Arc<DaemonClient>> {
        self.daemon
            .lock()
            .await
            .as_ref()
            .filter(|client| client.is_connected())
            .cloned()
    }

    /// The open connection, connecting first when there is none.
    async fn client(self: &Arc<Self>) -> Result<Arc<DaemonClient>, BrokerError> {
        let mut slot = self.daemon.lock().await;
        if let Some(client) = slot.as_ref().filter(|client| client.is_connected()) {
            return Ok(client.clone());
        }

        let (client, events) = self.connect().await?;
        client
            .configure(self.options.store_path.as_deref())
            .await
            .map_err(|e| BrokerError::DaemonUnavailable(e.to_string()))?;

        tokio::spawn(pump_events(Arc::downgrade(self), events));

        tracing::info!(socket = %self.options.socket_path.display(), "Connected to terminal daemon");
        let client = Arc::new(client);
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Opens a socket, starting the daemon first when it does not answer and
    /// a [`DaemonCommand`] is configured.
    async fn connect(&self) -> Result<(DaemonClient, EventReceiver), BrokerError> {
        let socket = &self.options.socket_path;
        let timeout = self.options.connect_timeout;
        let refused = match DaemonClient::connect_with_timeout(socket, timeout).await {
            Ok(connected) => return Ok(connected),
            Err(e) => e,
        };
        let Some(command) = &self.options.daemon_command else {
            return Err(BrokerError::DaemonUnavailable(refused.to_string()));
        };

        tracing::info!(
            socket = %socket.display(),
            program = %command.program.display(),
            error = %refused,
            "Starting terminal daemon"
        );
        let pid = command.spawn_detached().map_err(|e| {
            BrokerError::DaemonUnavailable(format!(
                "failed to start {}: {}",
                command.program.display(),
                e
            ))
        })?;
        tracing::debug!(pid = ?pid, "Terminal daemon process started");

        let deadline = Instant::now() + timeout;
        loop {
            match DaemonClient::connect_with_timeout(socket, timeout).await {
                Ok(connected) => return Ok(connected),
                Err(e) if Instant::now() >= deadline => {
                    return Err(BrokerError::DaemonUnavailable(e.to_string()))
                }
                Err(_) => tokio::time::sleep(DAEMON_START_POLL).await,
            }
        }
    }

    /// Removes one holder. Returns true when it was the last one.
    fn drop_holder(&self, session_id: &str, connection: ConnectionId) -> bool {
        let emptied = match self.holders.get_mut(session_id) {
            Some(mut holders) => holders.remove(&connection) && holders.is_empty(),
            None => false,
        };
        if emptied {
            self.holders.remove_if(session_id, |_, holders| holders.is_empty());
        }
        emptied
    }

    fn handle_event(&self, event: SessionEvent) {
        let forwarded = match event {
            SessionEvent::Data(SessionData { session_id, data }) => {
                let location = self.sessions.get(&session_id).map(|l| l.clone());
                if let Some(location) = &location {
                    self.persist_output(&session_id, location, &data);
                }
                BrokerEvent::Data {
                    session_id,
                    location,
                    data,
                }
            }
            SessionEvent::Exit(SessionExit {
                session_id,
                exit_code,
                signal,
            }) => {
                let location = self.sessions.remove(&session_id).map(|(_, l)| l);
                self.holders.remove(&session_id);
                if let Some(location) = &location {
                    if let Err(e) = self.store.record_exit(
                        &location.workspace_path,
                        &location.slot,
                        exit_code,
                        signal.as_deref(),
                    ) {
                        tracing::warn!(session_id = %session_id, error = %e, "Failed to persist exit status");
                    }
                }
                tracing::info!(session_id = %session_id, exit_code = ?exit_code, signal = ?signal, "Session exited");
                BrokerEvent::Exit {
                    session_id,
                    location,
                    exit_code,
                    signal,
                }
            }
            SessionEvent::Disposed(SessionDisposed { session_id, reason }) => {
                // Disposal by another client keeps the persisted record.
                let location = self
                    .sessions
                    .remove(&session_id)
                    .or_else(|| self.retired.remove(&session_id))
                    .map(|(_, l)| l);
                self.holders.remove(&session_id);
                BrokerEvent::Disposed {
                    session_id,
                    location,
                    reason,
                }
            }
        };

        // No receivers is fine.
        let _ = self.events.send(forwarded);
    }

    fn persist_output(&self, session_id: &str, location: &SessionLocation, data: &str) {
        if let Err(e) = self.store.append_history(
            &location.workspace_path,
            &location.slot,
            data,
            self.options.history_limit,
        ) {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to persist output");
        }
    }

    /// Hands buffered history to the store off the async workers.
    async fn flush_store(&self) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to flush session metadata"),
            Err(e) => tracing::warn!(error = %e, "Metadata flush task failed"),
        }
    }

    /// Runs once the daemon connection is gone. Boxed because reconnecting
    /// spawns a new event pump, which in turn may end up here.
    fn recover(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let held = {
                let _routing = self.routing.write().await;
                self.retired.clear();
                let held: Vec<HeldSession> = self
                    .holders
                    .iter()
                    .map(|entry| HeldSession {
                        session_id: entry.key().clone(),
                        location: self.sessions.get(entry.key()).map(|l| l.clone()),
                        connections: entry.value().clone(),
                    })
                    .collect();
                self.holders.clear();
                held
            };

            let _ = self.events.send(BrokerEvent::Disconnected);
            if held.is_empty() {
                return;
            }

            let client = match self.client().await {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(error = %e, sessions = held.len(), "Could not reconnect to terminal daemon");
                    for session in held {
                        self.lose(session);
                    }
                    return;
                }
            };
            let live: HashSet<String> = match client.list_sessions().await {
                Ok(sessions) => sessions.into_iter().map(|s| s.session_id).collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to list sessions after reconnect");
                    HashSet::new()
                }
            };

            let mut restored = 0;
            for session in held {
                if let Some(location) = &session.location {
                    if live.contains(&session.session_id)
                        && self.reattach(&client, &session, location).await
                    {
                        restored += 1;
                        continue;
                    }
                }
                self.lose(session);
            }

            tracing::info!(restored, "Reattached held sessions");
            let _ = self.events.send(BrokerEvent::Reconnected);
        })
    }

    /// Subscribes the new connection to a held session again and forwards
    /// what the daemon buffered meanwhile.
    async fn reattach(&self, client: &DaemonClient, session: &HeldSession, location: &SessionLocation) -> bool {
        let _routing = self.routing.read().await;
        let params = EnsureSessionParams::new(location.workspace_path.clone(), location.slot.clone());
        let result = match client.ensure_session(&params).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(session_id = %session.session_id, error = %e, "Failed to reattach session");
                return false;
            }
        };
        if result.session_id != session.session_id {
            // The old process ended in between and a new one was spawned.
            // Nobody asked for it, so leave it unsubscribed.
            if let Err(e) = client.release_session(&result.session_id).await {
                tracing::debug!(session_id = %result.session_id, error = %e, "Release failed");
            }
            return false;
        }

        if !result.pending_output.is_empty() {
            self.persist_output(&session.session_id, location, &result.pending_output);
            let _ = self.events.send(BrokerEvent::Data {
                session_id: session.session_id.clone(),
                location: Some(location.clone()),
                data: result.pending_output,
            });
        }
        self.sessions
            .insert(session.session_id.clone(), location.clone());
        self.holders
            .entry(session.session_id.clone())
            .or_default()
            .extend(session.connections.iter().copied());
        tracing::debug!(session_id = %session.session_id, "Session reattached");
        true
    }

    fn lose(&self, session: HeldSession) {
        self.sessions.remove(&session.session_id);
        tracing::warn!(session_id = %session.session_id, "Session lost with the daemon connection");
        let _ = self.events.send(BrokerEvent::Disposed {
            session_id: session.session_id,
            location: session.location,
            reason: Some(CONNECTION_LOST_REASON.to_string()),
        });
    }
}

async fn pump_events(inner: Weak<Inner>, mut events: EventReceiver) {
    let mut flush = tokio::time::interval(STORE_FLUSH_INTERVAL);
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let _routing = inner.routing.write().await;
                inner.handle_event(event);
            }
            _ = flush.tick() => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.flush_store().await;
            }
        }
    }

    tracing::warn!("Terminal daemon connection closed");
    if let Some(inner) = inner.upgrade() {
        inner.flush_store().await;
        inner.recover().await;
    }
}
