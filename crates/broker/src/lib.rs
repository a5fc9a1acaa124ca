//! # termhost Broker
//!
//! UI-side façade over the terminal host daemon.
//!
//! ## Overview
//!
//! - **Client**: one multiplexed socket connection to the daemon
//! - **Store**: persisted per-slot history, exit status and flags
//! - **Broker**: merges the two, reference counts UI connections and
//!   forwards daemon events to the UI. Starts the daemon on demand and
//!   reattaches held sessions after the connection drops
//!
//! ## Architecture
//!
//! ```text
//!  UI tabs ──┐
//!  UI tabs ──┼──► TerminalSessionBroker ──► DaemonClient ──► termhost-daemon
//!  UI tabs ──┘          │        ▲                 │
//!                       ▼        └── BrokerEvent ◄─┘ session-data / exit / disposed
//!                 MetadataStore
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use termhost_broker::{BrokerOptions, MemoryStore, TerminalSessionBroker};
//! use termhost_protocol::EnsureSessionParams;
//!
//! # async fn run() -> Result<(), termhost_broker::BrokerError> {
//! let broker = TerminalSessionBroker::new(
//!     BrokerOptions::new("/run/user/1000/termhost/termhost.sock"),
//!     Arc::new(MemoryStore::new()),
//! );
//! let tab = broker.open_connection();
//! let session = broker
//!     .ensure_session(EnsureSessionParams::new("/home/me/project", "main"), tab)
//!     .await?;
//! print!("{}", session.history);
//! broker.write(&session.session_id, "ls\n").await?;
//! broker.release(&session.session_id, tab).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod store;

pub use broker::{
    BrokerError, BrokerEvent, BrokerOptions, ConnectionId, DaemonCommand, DisposeOptions,
    EnsuredSession, SessionLocation, TerminalSessionBroker, CONNECTION_LOST_REASON,
};
pub use client::{ClientError, DaemonClient, EventReceiver, DEFAULT_CONNECT_TIMEOUT};
pub use store::{
    JsonFileStore, MemoryStore, MetadataStore, SlotRecord, StoreError, StoreResult,
    WorkspaceRecord,
};
