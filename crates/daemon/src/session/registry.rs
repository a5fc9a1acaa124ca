//! Live sessions indexed by id and by composite key.

use std::collections::{HashMap, HashSet};

use termhost_protocol::{normalize_workspace_path, session_key, OutputWindow, SessionSummary};

use crate::pty::{PtyProcess, SessionError};

/// Unique identifier for a session.
pub type SessionId = String;

/// Identifier of one connected client.
pub type ClientId = u64;

/// Lifecycle of a session: `Running` then exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    /// The process ended on its own.
    Exited,
    /// Removed by an explicit dispose.
    Disposed,
}

/// A live PTY bound to a `(workspace, slot)` key.
pub struct Session {
    id: SessionId,
    key: String,
    workspace_path: String,
    slot: String,
    command: String,
    args: Vec<String>,
    subscribers: HashSet<ClientId>,
    /// Output produced while nobody was subscribed.
    pending: OutputWindow,
    cols: u16,
    rows: u16,
    state: SessionState,
    process: Box<dyn PtyProcess>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("command", &self.command)
            .field("subscribers", &self.subscribers)
            .field("pending_chars", &self.pending.len_chars())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        workspace_path: &str,
        slot: &str,
        command: String,
        args: Vec<String>,
        (cols, rows): (u16, u16),
        output_limit: usize,
        process: Box<dyn PtyProcess>,
    ) -> Self {
        Self {
            id,
            key: session_key(workspace_path, slot),
            workspace_path: normalize_workspace_path(workspace_path),
            slot: slot.to_string(),
            command,
            args,
            subscribers: HashSet::new(),
            pending: OutputWindow::new(output_limit),
            cols,
            rows,
            state: SessionState::Running,
            process,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn workspace_path(&self) -> &str {
        &self.workspace_path
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Adds a subscriber. Returns `false` if it was already subscribed.
    pub fn subscribe(&mut self, client: ClientId) -> bool {
        self.subscribers.insert(client)
    }

    /// Removes a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, client: ClientId) -> bool {
        self.subscribers.remove(&client)
    }

    pub fn is_attached(&self) -> bool {
        !self.subscribers.is_empty()
    }

    /// Current subscribers in a stable order.
    pub fn subscribers(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.subscribers.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Appends to the pending window, dropping the oldest characters.
    pub fn buffer_output(&mut self, data: &str) {
        self.pending.append(data);
    }

    /// Returns and clears the pending window.
    pub fn take_pending(&mut self) -> String {
        self.pending.take()
    }

    pub fn pending_chars(&self) -> usize {
        self.pending.len_chars()
    }

    pub fn write(&mut self, data: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::Exited);
        }
        self.process.write(data)
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.state != SessionState::Running {
            return Err(SessionError::Exited);
        }
        self.process.resize(cols, rows)?;
        self.cols = cols;
        self.rows = rows;
        Ok(())
    }

    /// Kills the process and moves to `Disposed`.
    pub fn dispose(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Running {
            return Ok(());
        }
        self.state = SessionState::Disposed;
        self.process.kill()
    }

    /// Moves to `Exited` after the process ended on its own.
    pub fn mark_exited(&mut self) {
        if self.state == SessionState::Running {
            self.state = SessionState::Exited;
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            workspace_path: self.workspace_path.clone(),
            slot: self.slot.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            attached: self.is_attached(),
        }
    }
}

/// All live sessions.
///
/// Holds at most one session per key. Removing a session drops both
/// indexes at once.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_key: HashMap<String, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The live session for `key`, if any.
    pub fn find_by_key(&self, key: &str) -> Option<&Session> {
        self.by_key.get(key).and_then(|id| self.sessions.get(id))
    }

    pub fn find_by_key_mut(&mut self, key: &str) -> Option<&mut Session> {
        let id = self.by_key.get(key)?;
        self.sessions.get_mut(id)
    }

    /// Registers a session.
    ///
    /// A session already registered under the same key is displaced and
    /// returned; callers look the key up first.
    pub fn insert(&mut self, session: Session) -> Option<Session> {
        let displaced = self
            .by_key
            .insert(session.key.clone(), session.id.clone())
            .and_then(|old| self.sessions.remove(&old));
        self.sessions.insert(session.id.clone(), session);
        displaced
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Unregisters a session from both indexes.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if self.by_key.get(&session.key).is_some_and(|owner| owner == id) {
            self.by_key.remove(&session.key);
        }
        Some(session)
    }

    /// Unsubscribes `client` from the given sessions, returning the ids it
    /// actually left. Unknown ids are skipped.
    pub fn detach_client<'a>(
        &mut self,
        client: ClientId,
        sessions: impl IntoIterator<Item = &'a SessionId>,
    ) -> Vec<SessionId> {
        sessions
            .into_iter()
            .filter(|id| {
                self.sessions
                    .get_mut(id.as_str())
                    .is_some_and(|session| session.unsubscribe(client))
            })
            .cloned()
            .collect()
    }

    /// Summaries of live sessions, optionally limited to one workspace.
    ///
    /// Workspaces are compared after normalization. Sorted by workspace
    /// then slot.
    pub fn snapshot(&self, workspace: Option<&str>) -> Vec<SessionSummary> {
        let workspace = workspace.map(normalize_workspace_path);
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .values()
            .filter(|session| {
                workspace
                    .as_deref()
                    .is_none_or(|w| session.workspace_path == w)
            })
            .map(Session::summary)
            .collect();
        summaries.sort_by(|a, b| {
            (a.workspace_path.as_str(), a.slot.as_str())
                .cmp(&(b.workspace_path.as_str(), b.slot.as_str()))
        });
        summaries
    }

    /// Removes every session, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<Session> {
        self.by_key.clear();
        self.sessions.drain().map(|(_, session)| session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{FakePtySpawner, PtySpawner, SpawnRequest};

    fn session(id: &str, workspace: &str, slot: &str) -> Session {
        let spawned = FakePtySpawner::new()
            .spawn(SpawnRequest::new("/bin/sh"))
            .unwrap();
        Session::new(
            id.to_string(),
            workspace,
            slot,
            "/bin/sh".to_string(),
            vec!["-i".to_string()],
            (80, 24),
            16,
            spawned.process,
        )
    }

    #[test]
    fn test_find_by_normalized_key() {
        let mut registry = SessionRegistry::new();
        registry.insert(session("S1", "/w/repo/", "main"));

        let found = registry.find_by_key(&session_key("/w/./repo", "main")).unwrap();
        assert_eq!(found.id(), "S1");
        assert_eq!(found.workspace_path(), "/w/repo");
        assert!(registry.find_by_key(&session_key("/w/repo", "tests")).is_none());
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let mut registry = SessionRegistry::new();
        registry.insert(session("S1", "/w", "main"));

        let removed = registry.remove("S1").unwrap();
        assert_eq!(removed.id(), "S1");
        assert!(registry.is_empty());
        assert!(registry.find_by_key("/w::main").is_none());
        assert!(registry.remove("S1").is_none());
    }

    #[test]
    fn test_insert_same_key_displaces() {
        let mut registry = SessionRegistry::new();
        registry.insert(session("S1", "/w", "main"));
        let displaced = registry.insert(session("S2", "/w", "main")).unwrap();

        assert_eq!(displaced.id(), "S1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_key("/w::main").unwrap().id(), "S2");
    }

    #[test]
    fn test_detach_client() {
        let mut registry = SessionRegistry::new();
        registry.insert(session("S1", "/w", "a"));
        registry.insert(session("S2", "/w", "b"));
        registry.get_mut("S1").unwrap().subscribe(1);
        registry.get_mut("S2").unwrap().subscribe(1);
        registry.get_mut("S2").unwrap().subscribe(2);

        let tracked: Vec<SessionId> = vec!["S1".into(), "S2".into(), "gone".into()];
        let mut left = registry.detach_client(1, &tracked);
        left.sort();
        assert_eq!(left, vec!["S1".to_string(), "S2".to_string()]);
        assert!(!registry.get("S1").unwrap().is_attached());
        assert_eq!(registry.get("S2").unwrap().subscribers(), vec![2]);
        // Sessions survive their subscribers.
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_snapshot_filters_by_workspace() {
        let mut registry = SessionRegistry::new();
        registry.insert(session("S2", "/w", "tests"));
        registry.insert(session("S1", "/w", "main"));
        registry.insert(session("S3", "/other", "main"));
        registry.get_mut("S1").unwrap().subscribe(9);

        let all = registry.snapshot(None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].workspace_path, "/other");

        let scoped = registry.snapshot(Some("/w/"));
        let ids: Vec<&str> = scoped.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S2"]);
        assert!(scoped[0].attached);
        assert!(!scoped[1].attached);
    }

    #[test]
    fn test_pending_output_is_bounded() {
        let mut s = session("S1", "/w", "main");
        s.buffer_output("0123456789");
        s.buffer_output("abcdefghij");
        assert_eq!(s.pending_chars(), 16);
        assert_eq!(s.take_pending(), "456789abcdefghij");
        assert_eq!(s.take_pending(), "");
    }

    #[test]
    fn test_dispose_moves_to_terminal_state() {
        let mut s = session("S1", "/w", "main");
        s.dispose().unwrap();
        assert_eq!(s.state(), SessionState::Disposed);
        assert!(matches!(s.write("x"), Err(SessionError::Exited)));
        s.mark_exited();
        assert_eq!(s.state(), SessionState::Disposed);
    }
}
