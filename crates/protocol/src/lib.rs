//! # termhost Protocol Library
//!
//! Wire definitions shared by the terminal host daemon and its clients.
//!
//! ## Overview
//!
//! - **Messages**: request / response / event envelopes and typed payloads
//! - **Framing**: newline-delimited JSON with an incremental line decoder
//! - **Output windows**: the bounded trailing buffer used for pending output
//!   and persisted history
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Request / Response / Event payloads   │  camelCase JSON
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  one message per line
//! ├─────────────────────────────────────────┤
//! │     Local socket (Unix domain socket)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use termhost_protocol::{encode_line, Command, LineDecoder, Request, WireMessage};
//! use serde_json::json;
//!
//! let request = WireMessage::Request(Request::new(
//!     1u64,
//!     Command::EnsureSession,
//!     json!({"workspacePath": "/w", "slot": "main"}),
//! ));
//! let bytes = encode_line(&request).unwrap();
//!
//! let mut decoder = LineDecoder::new();
//! decoder.push(&bytes);
//! let line = decoder.next_line().unwrap().unwrap();
//! assert!(line.contains("ensureSession"));
//! ```

pub mod error;
pub mod framing;
pub mod messages;
pub mod window;

pub use error::{ProtocolError, Result};
pub use framing::{decode_message, encode_line, LineDecoder, MAX_LINE_BYTES};
pub use messages::{
    normalize_workspace_path, request_id_hint, session_key, Command, ConfigureParams, DisposeParams,
    EnsureSessionParams, EnsureSessionResult, ErrorBody, Event, EventKind, Request, RequestId,
    ResizeParams, Response, SessionData, SessionDisposed, SessionEvent, SessionExit, SessionRef,
    SessionSummary, WireMessage, WorkspaceQuery, WorkspaceState, WriteParams,
};
pub use window::{trim_to_trailing, OutputWindow, DEFAULT_OUTPUT_LIMIT};
