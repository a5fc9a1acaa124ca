//! Protocol message definitions for termhost.
//!
//! Every line on the socket is one [`WireMessage`]: a request from a client,
//! a response from the daemon echoing the request id, or an unsolicited event
//! pushed to the subscribers of a session. Payloads are camelCase JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Caller-chosen request identifier, echoed unchanged in the matching
/// response. Callers may use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::Text(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::Text(id)
    }
}

impl PartialEq<u64> for RequestId {
    fn eq(&self, other: &u64) -> bool {
        matches!(self, RequestId::Number(id) if id == other)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(id) => write!(f, "{}", id),
            RequestId::Text(id) => write!(f, "{:?}", id),
        }
    }
}

/// Recovers the id of a line that looks like a request but failed to parse,
/// so the failure can still be answered.
pub fn request_id_hint(line: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("request") {
        return None;
    }
    serde_json::from_value(value.get("id")?.clone()).ok()
}

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// Client → daemon.
    Request(Request),
    /// Daemon → client, answering a request.
    Response(Response),
    /// Daemon → client, unsolicited.
    Event(Event),
}

/// A command invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    /// Builds a request for a known command.
    pub fn new(id: impl Into<RequestId>, command: Command, payload: Value) -> Self {
        Self {
            id: id.into(),
            command: command.as_str().to_string(),
            payload,
        }
    }

    /// Resolves the command name.
    pub fn command(&self) -> Result<Command> {
        self.command.parse()
    }

    /// Deserializes the payload into the typed parameters of `command`.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let payload = if self.payload.is_null() {
            Value::Object(Default::default())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(payload)
            .map_err(|e| ProtocolError::invalid_payload(&self.command, e.to_string()))
    }
}

/// Error body carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

/// The outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// A successful response.
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response carrying a human-readable message.
    pub fn failure(id: impl Into<RequestId>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(ErrorBody {
                message: message.into(),
            }),
        }
    }

    /// Converts into `Ok(result)` or `Err(message)`.
    pub fn into_result(self) -> std::result::Result<Value, String> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown daemon error".to_string()))
        }
    }
}

/// Names of pushed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "session-data")]
    SessionData,
    #[serde(rename = "session-exit")]
    SessionExit,
    #[serde(rename = "session-disposed")]
    SessionDisposed,
}

/// An event envelope as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: EventKind,
    #[serde(default)]
    pub payload: Value,
}

/// Output chunk produced by a session's process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub session_id: String,
    pub data: String,
}

/// The session's process terminated on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExit {
    pub session_id: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// The session was explicitly disposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDisposed {
    pub session_id: String,
    pub reason: Option<String>,
}

/// Typed view over [`Event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Data(SessionData),
    Exit(SessionExit),
    Disposed(SessionDisposed),
}

impl SessionEvent {
    /// The session the event refers to.
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Data(e) => &e.session_id,
            SessionEvent::Exit(e) => &e.session_id,
            SessionEvent::Disposed(e) => &e.session_id,
        }
    }

    /// Encodes the event into its wire envelope.
    pub fn to_wire(&self) -> Result<Event> {
        let (event, payload) = match self {
            SessionEvent::Data(e) => (EventKind::SessionData, serde_json::to_value(e)?),
            SessionEvent::Exit(e) => (EventKind::SessionExit, serde_json::to_value(e)?),
            SessionEvent::Disposed(e) => (EventKind::SessionDisposed, serde_json::to_value(e)?),
        };
        Ok(Event { event, payload })
    }
}

impl TryFrom<Event> for SessionEvent {
    type Error = ProtocolError;

    fn try_from(event: Event) -> Result<Self> {
        Ok(match event.event {
            EventKind::SessionData => SessionEvent::Data(serde_json::from_value(event.payload)?),
            EventKind::SessionExit => SessionEvent::Exit(serde_json::from_value(event.payload)?),
            EventKind::SessionDisposed => {
                SessionEvent::Disposed(serde_json::from_value(event.payload)?)
            }
        })
    }
}

/// Commands understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    Configure,
    EnsureSession,
    ReleaseSession,
    WriteSession,
    ResizeSession,
    DisposeSession,
    ListSessions,
    GetWorkspaceState,
}

impl Command {
    /// The wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Configure => "configure",
            Command::EnsureSession => "ensureSession",
            Command::ReleaseSession => "releaseSession",
            Command::WriteSession => "writeSession",
            Command::ResizeSession => "resizeSession",
            Command::DisposeSession => "disposeSession",
            Command::ListSessions => "listSessions",
            Command::GetWorkspaceState => "getWorkspaceState",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "ping" => Command::Ping,
            "configure" => Command::Configure,
            "ensureSession" => Command::EnsureSession,
            "releaseSession" => Command::ReleaseSession,
            "writeSession" => Command::WriteSession,
            "resizeSession" => Command::ResizeSession,
            "disposeSession" => Command::DisposeSession,
            "listSessions" => Command::ListSessions,
            "getWorkspaceState" => Command::GetWorkspaceState,
            other => return Err(ProtocolError::UnsupportedCommand(other.to_string())),
        })
    }
}

// ============================================================================
// Request payloads
// ============================================================================

/// Hint about where the broker persists session metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureParams {
    #[serde(default)]
    pub store_path: Option<String>,
}

/// Parameters of `ensureSession`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureSessionParams {
    #[serde(default)]
    pub workspace_path: String,
    #[serde(default)]
    pub slot: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl EnsureSessionParams {
    /// Parameters for a plain shell in `slot` of `workspace_path`.
    pub fn new(workspace_path: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            workspace_path: workspace_path.into(),
            slot: slot.into(),
            ..Default::default()
        }
    }

    /// Rejects requests without a workspace or slot.
    pub fn validate(&self) -> Result<()> {
        if self.workspace_path.trim().is_empty() {
            return Err(ProtocolError::invalid_payload(
                Command::EnsureSession.as_str(),
                "workspacePath is required",
            ));
        }
        if self.slot.trim().is_empty() {
            return Err(ProtocolError::invalid_payload(
                Command::EnsureSession.as_str(),
                "slot is required",
            ));
        }
        Ok(())
    }

    /// The composite identity of the requested session.
    pub fn key(&self) -> String {
        session_key(&self.workspace_path, &self.slot)
    }
}

/// A bare session reference (`releaseSession`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

/// Parameters of `writeSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteParams {
    pub session_id: String,
    pub data: String,
}

/// Parameters of `resizeSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeParams {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// Parameters of `disposeSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisposeParams {
    pub session_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Parameters of `getWorkspaceState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceQuery {
    #[serde(default)]
    pub workspace_path: String,
}

// ============================================================================
// Results
// ============================================================================

/// Result of `ensureSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureSessionResult {
    pub session_id: String,
    pub existing: bool,
    #[serde(default)]
    pub pending_output: String,
}

/// One entry of `listSessions` / `getWorkspaceState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub workspace_path: String,
    pub slot: String,
    pub command: String,
    pub args: Vec<String>,
    pub attached: bool,
}

/// Result of `getWorkspaceState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceState {
    pub workspace_path: String,
    pub sessions: Vec<SessionSummary>,
}

// ============================================================================
// Session keys
// ============================================================================

fn is_separator(c: char) -> bool {
    c == '/' || (cfg!(windows) && c == '\\')
}

/// Lexically normalizes a workspace path.
///
/// Collapses `.`, `..` and repeated separators and strips trailing
/// separators without touching the filesystem.
pub fn normalize_workspace_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let absolute = trimmed.starts_with(is_separator);
    let mut parts: Vec<&str> = Vec::new();
    for part in trimmed.split(is_separator) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// The composite identity of a session: `normalize(workspace) + "::" + slot`.
pub fn session_key(workspace_path: &str, slot: &str) -> String {
    format!("{}::{}", normalize_workspace_path(workspace_path), slot)
}
