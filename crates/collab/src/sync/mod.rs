// Document sync state: version counter, optimistic conflict checks and the
// advisory edit lock.

pub mod coordinator;
pub mod hash;

use chrono::{DateTime, Utc};
use docket_common::types::DocumentSyncState;
use thiserror::Error;

use crate::store::StoreError;

pub use coordinator::SyncCoordinator;
pub use hash::content_hash;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("sync state for `{document_id}` already exists")]
    AlreadyInitialized { document_id: String },
    /// Every conditional write lost to a concurrent writer.
    #[error("sync state for `{document_id}` is contended; gave up after {attempts} attempts")]
    Contended { document_id: String, attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of an optimistic-concurrency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub server_state: Option<DocumentSyncState>,
}

/// Edit lock as seen at read time. Expired locks read as `Unlocked`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    HeldBy { user_id: String, expires_at: DateTime<Utc> },
}

impl LockStatus {
    pub fn of(state: Option<&DocumentSyncState>, now: DateTime<Utc>) -> Self {
        let Some(state) = state else {
            return LockStatus::Unlocked;
        };
        match (state.lock_holder_at(now), state.lock_expires_at) {
            (Some(holder), Some(expires_at)) => {
                LockStatus::HeldBy { user_id: holder.to_string(), expires_at }
            }
            _ => LockStatus::Unlocked,
        }
    }

    pub fn holder(&self) -> Option<&str> {
        match self {
            LockStatus::Unlocked => None,
            LockStatus::HeldBy { user_id, .. } => Some(user_id),
        }
    }
}

/// The user's answer to a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Drop local edits and load the server content.
    DiscardLocal,
    /// Commit local content over the server's, bumping past its version.
    OverwriteServer,
    /// Commit the result of a manual merge.
    Merge,
}
