//! Session registry.
//!
//! A session is one live PTY bound to a `(workspace, slot)` key. The
//! registry is owned by the host's event loop and is never shared, so none
//! of these types synchronize.

pub mod registry;
pub mod shell;

pub use registry::{ClientId, Session, SessionId, SessionRegistry, SessionState};
pub use shell::{shell_basename, ShellArgsPolicy};
