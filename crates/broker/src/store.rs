//! Session metadata store.
//!
//! Keeps what the UI needs to redraw a terminal after a restart: the
//! trailing output history, the last exit status and a few flags. Records
//! are keyed by normalized workspace path and slot name.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use termhost_protocol::{normalize_workspace_path, trim_to_trailing};
use thiserror::Error;

/// Errors reading or writing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid store document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode store document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persisted state of one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlotRecord {
    pub history: String,
    pub quick_command_executed: bool,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<String>,
    pub label: Option<String>,
}

/// Persisted state of one workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceRecord {
    pub active_slot: Option<String>,
    pub slots: BTreeMap<String, SlotRecord>,
}

/// Storage contract used by the broker.
///
/// Writes for one `(workspace, slot)` come from a single writer; distinct
/// keys are independent.
pub trait MetadataStore: Send + Sync {
    fn load(&self, workspace: &str, slot: &str) -> StoreResult<Option<SlotRecord>>;

    /// Appends `chunk` to the history, keeping the last `limit` characters.
    fn append_history(&self, workspace: &str, slot: &str, chunk: &str, limit: usize)
        -> StoreResult<()>;

    fn record_exit(
        &self,
        workspace: &str,
        slot: &str,
        exit_code: Option<i32>,
        signal: Option<&str>,
    ) -> StoreResult<()>;

    /// Forgets the slot entirely.
    fn clear(&self, workspace: &str, slot: &str) -> StoreResult<()>;

    fn mark_quick_command_executed(&self, workspace: &str, slot: &str) -> StoreResult<()>;

    fn set_label(&self, workspace: &str, slot: &str, label: Option<&str>) -> StoreResult<()>;

    fn set_active_slot(&self, workspace: &str, slot: Option<&str>) -> StoreResult<()>;

    fn active_slot(&self, workspace: &str) -> StoreResult<Option<String>>;

    /// Writes out history appends that are still buffered. Every other
    /// mutation is durable when it returns.
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// The whole store as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct StoreDocument {
    workspaces: BTreeMap<String, WorkspaceRecord>,
}

impl StoreDocument {
    fn slot(&self, workspace: &str, slot: &str) -> Option<&SlotRecord> {
        self.workspaces
            .get(&normalize_workspace_path(workspace))
            .and_then(|record| record.slots.get(slot))
    }

    fn slot_mut(&mut self, workspace: &str, slot: &str) -> &mut SlotRecord {
        self.workspaces
            .entry(normalize_workspace_path(workspace))
            .or_default()
            .slots
            .entry(slot.to_string())
            .or_default()
    }

    fn append_history(&mut self, workspace: &str, slot: &str, chunk: &str, limit: usize) {
        let record = self.slot_mut(workspace, slot);
        record.history.push_str(chunk);
        let trimmed = trim_to_trailing(&record.history, limit);
        if trimmed.len() < record.history.len() {
            record.history = trimmed.to_string();
        }
    }

    fn record_exit(&mut self, workspace: &str, slot: &str, exit_code: Option<i32>, signal: Option<&str>) {
        let record = self.slot_mut(workspace, slot);
        record.last_exit_code = exit_code;
        record.last_signal = signal.map(str::to_string);
    }

    fn clear(&mut self, workspace: &str, slot: &str) {
        let key = normalize_workspace_path(workspace);
        if let Some(record) = self.workspaces.get_mut(&key) {
            record.slots.remove(slot);
            if record.active_slot.as_deref() == Some(slot) {
                record.active_slot = None;
            }
            if record.slots.is_empty() && record.active_slot.is_none() {
                self.workspaces.remove(&key);
            }
        }
    }

    fn set_active_slot(&mut self, workspace: &str, slot: Option<&str>) {
        self.workspaces
            .entry(normalize_workspace_path(workspace))
            .or_default()
            .active_slot = slot.map(str::to_string);
    }

    fn active_slot(&self, workspace: &str) -> Option<String> {
        self.workspaces
            .get(&normalize_workspace_path(workspace))
            .and_then(|record| record.active_slot.clone())
    }
}

/// In-process store, used in tests and when nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: RwLock<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F: FnOnce(&mut StoreDocument)>(&self, f: F) -> StoreResult<()> {
        let mut doc = self.doc.write().map_err(|_| StoreError::Poisoned)?;
        f(&mut doc);
        Ok(())
    }

    fn read<T, F: FnOnce(&StoreDocument) -> T>(&self, f: F) -> StoreResult<T> {
        let doc = self.doc.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&doc))
    }
}

impl MetadataStore for MemoryStore {
    fn load(&self, workspace: &str, slot: &str) -> StoreResult<Option<SlotRecord>> {
        self.read(|doc| doc.slot(workspace, slot).cloned())
    }

    fn append_history(&self, workspace: &str, slot: &str, chunk: &str, limit: usize) -> StoreResult<()> {
        self.mutate(|doc| doc.append_history(workspace, slot, chunk, limit))
    }

    fn record_exit(&self, workspace: &str, slot: &str, exit_code: Option<i32>, signal: Option<&str>) -> StoreResult<()> {
        self.mutate(|doc| doc.record_exit(workspace, slot, exit_code, signal))
    }

    fn clear(&self, workspace: &str, slot: &str) -> StoreResult<()> {
        self.mutate(|doc| doc.clear(workspace, slot))
    }

    fn mark_quick_command_executed(&self, workspace: &str, slot: &str) -> StoreResult<()> {
        self.mutate(|doc| doc.slot_mut(workspace, slot).quick_command_executed = true)
    }

    fn set_label(&self, workspace: &str, slot: &str, label: Option<&str>) -> StoreResult<()> {
        self.mutate(|doc| doc.slot_mut(workspace, slot).label = label.map(str::to_string))
    }

    fn set_active_slot(&self, workspace: &str, slot: Option<&str>) -> StoreResult<()> {
        self.mutate(|doc| doc.set_active_slot(workspace, slot))
    }

    fn active_slot(&self, workspace: &str) -> StoreResult<Option<String>> {
        self.read(|doc| doc.active_slot(workspace))
    }
}

/// Store persisted as a single JSON file.
///
/// The document is `{"workspaces": {<path>: WorkspaceRecord}}`. Writes go
/// through a temporary file and a rename, so a crash leaves either the old
/// or the new document on disk.
///
/// History appends only mark the document dirty; they reach the disk on
/// [`MetadataStore::flush`], with the next other mutation, or on drop.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    doc: RwLock<StoreDocument>,
    dirty: AtomicBool,
    writes: AtomicU64,
}

impl JsonFileStore {
    /// Opens the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let doc = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => StoreDocument::default(),
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => StoreDocument::default(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };
        tracing::debug!(path = %path.display(), workspaces = doc.workspaces.len(), "Opened metadata store");
        Ok(Self {
            path,
            doc: RwLock::new(doc),
            dirty: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate<F: FnOnce(&mut StoreDocument)>(&self, f: F) -> StoreResult<()> {
        // Holding the write lock across the file write keeps writes ordered.
        let mut doc = self.doc.write().map_err(|_| StoreError::Poisoned)?;
        f(&mut doc);
        self.dirty.store(false, Ordering::SeqCst);
        self.persist(&doc).inspect_err(|_| self.dirty.store(true, Ordering::SeqCst))
    }

    fn read<T, F: FnOnce(&StoreDocument) -> T>(&self, f: F) -> StoreResult<T> {
        let doc = self.doc.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&doc))
    }

    fn persist(&self, doc: &StoreDocument) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let contents = serde_json::to_vec_pretty(doc)?;
        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);
        fs::write(&tmp, contents).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl MetadataStore for JsonFileStore {
    fn load(&self, workspace: &str, slot: &str) -> StoreResult<Option<SlotRecord>> {
        self.read(|doc| doc.slot(workspace, slot).cloned())
    }

    fn append_history(&self, workspace: &str, slot: &str, chunk: &str, limit: usize) -> StoreResult<()> {
        let mut doc = self.doc.write().map_err(|_| StoreError::Poisoned)?;
        doc.append_history(workspace, slot, chunk, limit);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn record_exit(&self, workspace: &str, slot: &str, exit_code: Option<i32>, signal: Option<&str>) -> StoreResult<()> {
        self.mutate(|doc| doc.record_exit(workspace, slot, exit_code, signal))
    }

    fn clear(&self, workspace: &str, slot: &str) -> StoreResult<()> {
        self.mutate(|doc| doc.clear(workspace, slot))
    }

    fn mark_quick_command_executed(&self, workspace: &str, slot: &str) -> StoreResult<()> {
        self.mutate(|doc| doc.slot_mut(workspace, slot).quick_command_executed = true)
    }

    fn set_label(&self, workspace: &str, slot: &str, label: Option<&str>) -> StoreResult<()> {
        self.mutate(|doc| doc.slot_mut(workspace, slot).label = label.map(str::to_string))
    }

    fn set_active_slot(&self, workspace: &str, slot: Option<&str>) -> StoreResult<()> {
        self.mutate(|doc| doc.set_active_slot(workspace, slot))
    }

    fn active_slot(&self, workspace: &str) -> StoreResult<Option<String>> {
        self.read(|doc| doc.active_slot(workspace))
    }

    fn flush(&self) -> StoreResult<()> {
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.mutate(|_| {})
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush metadata store");
        }
    }
}
