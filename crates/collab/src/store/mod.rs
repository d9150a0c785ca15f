// Remote store seam.
//
// Presence rows and sync state live in a managed backend shared by every
// client. The core talks to it only through these traits; `memory` provides
// the in-process implementation used by tests and the playground binary.

pub mod memory;

use std::future::Future;

use chrono::{DateTime, Utc};
use docket_common::types::{
    CursorPosition, DocumentSyncState, PresenceStatus, SelectionRange, UserPresence,
};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryStore;

/// Errors surfaced by a remote store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Network or service failure; the operation may succeed later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the write.
    #[error("store rejected write: {message}")]
    Rejected { message: String },
    #[error("record `{id}` not found")]
    NotFound { id: String },
    /// The change feed ended or failed.
    #[error("change subscription failed: {0}")]
    Subscription(String),
}

/// Fields for a new presence row. The store assigns `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceDraft {
    pub document_id: String,
    pub document_owner_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
    pub user_color: String,
    pub status: PresenceStatus,
    pub session_id: String,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Cursor report; `None` fields clear the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorUpdate {
    pub position: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
}

/// Partial update for a presence row. Every mutation refreshes the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresencePatch {
    pub last_heartbeat: DateTime<Utc>,
    pub status: Option<PresenceStatus>,
    pub cursor: Option<CursorUpdate>,
}

impl PresencePatch {
    pub fn heartbeat(at: DateTime<Utc>) -> Self {
        Self { last_heartbeat: at, status: None, cursor: None }
    }

    pub fn status(at: DateTime<Utc>, status: PresenceStatus) -> Self {
        Self { last_heartbeat: at, status: Some(status), cursor: None }
    }

    pub fn cursor(at: DateTime<Utc>, cursor: CursorUpdate) -> Self {
        Self { last_heartbeat: at, status: None, cursor: Some(cursor) }
    }

    pub fn apply_to(&self, row: &mut UserPresence) {
        row.last_heartbeat = self.last_heartbeat;
        if let Some(status) = self.status {
            row.status = status;
        }
        if let Some(cursor) = self.cursor {
            row.cursor_position = cursor.position;
            row.selection_range = cursor.selection;
        }
    }
}

/// Change-feed event classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Stream of changed rows for one document and change class.
///
/// An `Err` item or the end of the stream means the subscription is dead.
pub type ChangeStream = mpsc::UnboundedReceiver<Result<UserPresence, StoreError>>;

/// Presence row collection, scoped by document.
///
/// All methods return `Send` futures so callers can run on a multi-threaded
/// tokio runtime.
pub trait PresenceStore: Send + Sync + 'static {
    fn list(
        &self,
        document_id: &str,
    ) -> impl Future<Output = Result<Vec<UserPresence>, StoreError>> + Send;

    fn create(
        &self,
        draft: PresenceDraft,
    ) -> impl Future<Output = Result<UserPresence, StoreError>> + Send;

    fn update(
        &self,
        id: &str,
        patch: PresencePatch,
    ) -> impl Future<Output = Result<UserPresence, StoreError>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn subscribe(
        &self,
        document_id: &str,
        kind: ChangeKind,
    ) -> impl Future<Output = Result<ChangeStream, StoreError>> + Send;
}

/// Outcome of a conditional sync-state write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; carries the stored state.
    Applied(DocumentSyncState),
    /// Another writer got there first; carries what is stored now.
    Stale(Option<DocumentSyncState>),
}

/// Per-document sync state with conditional writes.
pub trait SyncStateStore: Send + Sync + 'static {
    fn get(
        &self,
        document_id: &str,
    ) -> impl Future<Output = Result<Option<DocumentSyncState>, StoreError>> + Send;

    /// Create `state` only if the document has no sync state yet.
    fn insert_if_absent(
        &self,
        state: DocumentSyncState,
    ) -> impl Future<Output = Result<CasOutcome, StoreError>> + Send;

    /// Replace the stored state only if it still equals `expected`.
    fn compare_and_swap(
        &self,
        expected: &DocumentSyncState,
        next: DocumentSyncState,
    ) -> impl Future<Output = Result<CasOutcome, StoreError>> + Send;
}
