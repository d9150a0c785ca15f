// Per-document version counter and advisory edit lock.
//
// Every write is a read followed by a conditional write. A lost swap means a
// concurrent writer landed first, so the coordinator re-reads and decides
// again, bounded by `lock_write_attempts`.

use std::sync::Arc;

use docket_common::types::DocumentSyncState;
use tracing::{debug, info, warn};

use super::{ConflictCheck, ConflictResolution, LockStatus, SyncError};
use crate::clock::{Clock, SystemClock};
use crate::config::CollabConfig;
use crate::observers::{ObserverSet, Subscription};
use crate::store::{CasOutcome, SyncStateStore};

pub struct SyncCoordinator<S: SyncStateStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    lock_expiration: chrono::Duration,
    write_attempts: u32,
    observers: ObserverSet<DocumentSyncState>,
}

/// What a single read-decide step wants to write.
enum Step {
    Decline,
    Insert(DocumentSyncState),
    Swap { expected: DocumentSyncState, next: DocumentSyncState },
}

impl<S: SyncStateStore> SyncCoordinator<S> {
    pub fn new(store: Arc<S>, config: &CollabConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, config: &CollabConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock_expiration: config.lock_expiration(),
            write_attempts: config.lock_write_attempts.max(1),
            observers: ObserverSet::new(),
        }
    }

    pub async fn get_sync_state(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentSyncState>, SyncError> {
        Ok(self.store.get(document_id).await?)
    }

    /// Create version 1 with no lock. Never overwrites an existing state.
    pub async fn initialize_sync_state(
        &self,
        document_id: &str,
        user_id: &str,
        content_hash: Option<&str>,
    ) -> Result<DocumentSyncState, SyncError> {
        let initial = self.initial_state(document_id, user_id, content_hash);
        match self.store.insert_if_absent(initial).await? {
            CasOutcome::Applied(state) => {
                info!(document_id, user_id, "initialized sync state");
                self.observers.notify(&state);
                Ok(state)
            }
            CasOutcome::Stale(_) => {
                Err(SyncError::AlreadyInitialized { document_id: document_id.to_string() })
            }
        }
    }

    /// Commit a content change: version 1 if the document has no state yet,
    /// otherwise `version + 1`. Lock fields are carried over untouched.
    pub async fn update_sync_state(
        &self,
        document_id: &str,
        user_id: &str,
        content_hash: Option<&str>,
    ) -> Result<DocumentSyncState, SyncError> {
        let committed = self
            .commit(document_id, |current| match current {
                None => Step::Insert(self.initial_state(document_id, user_id, content_hash)),
                Some(current) => {
                    let mut next = current.clone();
                    next.version = current.version + 1;
                    next.last_modified_by = user_id.to_string();
                    next.last_modified_at = self.clock.now();
                    next.content_hash = content_hash.map(str::to_string);
                    Step::Swap { expected: current, next }
                }
            })
            .await?;
        // Never declines, so `None` cannot come back from `commit`.
        let state = committed.ok_or_else(|| SyncError::Contended {
            document_id: document_id.to_string(),
            attempts: self.write_attempts,
        })?;
        debug!(document_id, version = state.version, "committed sync state");
        self.observers.notify(&state);
        Ok(state)
    }

    /// Conflict iff a server state exists with a version above `local_version`.
    pub async fn check_for_conflicts(
        &self,
        document_id: &str,
        local_version: u64,
    ) -> Result<ConflictCheck, SyncError> {
        let server_state = self.store.get(document_id).await?;
        let has_conflict = server_state.as_ref().is_some_and(|s| s.version > local_version);
        Ok(ConflictCheck { has_conflict, server_state })
    }

    /// Take or renew the edit lock. `Ok(false)` means another user holds an
    /// unexpired lock.
    pub async fn acquire_edit_lock(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<bool, SyncError> {
        let acquired = self
            .commit(document_id, |current| {
                let now = self.clock.now();
                let expires_at = now + self.lock_expiration;
                match current {
                    None => {
                        let mut initial = self.initial_state(document_id, user_id, None);
                        initial.locked_by = Some(user_id.to_string());
                        initial.lock_expires_at = Some(expires_at);
                        Step::Insert(initial)
                    }
                    Some(current) => match current.lock_holder_at(now) {
                        Some(holder) if holder != user_id => Step::Decline,
                        _ => {
                            let mut next = current.clone();
                            next.locked_by = Some(user_id.to_string());
                            next.lock_expires_at = Some(expires_at);
                            Step::Swap { expected: current, next }
                        }
                    },
                }
            })
            .await?;

        match acquired {
            Some(state) => {
                let expires_at = state.lock_expires_at;
                debug!(document_id, user_id, ?expires_at, "edit lock held");
                Ok(true)
            }
            None => {
                info!(document_id, user_id, "edit lock denied; held by another user");
                Ok(false)
            }
        }
    }

    /// Clear the lock, only if `user_id` holds it. Returns whether it did.
    pub async fn release_edit_lock(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<bool, SyncError> {
        let released = self
            .commit(document_id, |current| match current {
                Some(current) if current.locked_by.as_deref() == Some(user_id) => {
                    let mut next = current.clone();
                    next.locked_by = None;
                    next.lock_expires_at = None;
                    Step::Swap { expected: current, next }
                }
                _ => Step::Decline,
            })
            .await?;

        if released.is_some() {
            debug!(document_id, user_id, "edit lock released");
        }
        Ok(released.is_some())
    }

    pub async fn lock_status(&self, document_id: &str) -> Result<LockStatus, SyncError> {
        let state = self.store.get(document_id).await?;
        Ok(LockStatus::of(state.as_ref(), self.clock.now()))
    }

    /// Observe every committed content write.
    pub fn subscribe_sync_state<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DocumentSyncState) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// Apply the user's conflict choice. `DiscardLocal` writes nothing and
    /// returns the server state; the others commit past the server version.
    pub async fn resolve_conflict(
        &self,
        document_id: &str,
        user_id: &str,
        resolution: ConflictResolution,
        content_hash: Option<&str>,
    ) -> Result<Option<DocumentSyncState>, SyncError> {
        match resolution {
            ConflictResolution::DiscardLocal => self.get_sync_state(document_id).await,
            ConflictResolution::OverwriteServer | ConflictResolution::Merge => {
                info!(document_id, user_id, ?resolution, "resolving sync conflict");
                self.update_sync_state(document_id, user_id, content_hash).await.map(Some)
            }
        }
    }

    fn initial_state(
        &self,
        document_id: &str,
        user_id: &str,
        content_hash: Option<&str>,
    ) -> DocumentSyncState {
        DocumentSyncState {
            document_id: document_id.to_string(),
            version: 1,
            last_modified_by: user_id.to_string(),
            last_modified_at: self.clock.now(),
            content_hash: content_hash.map(str::to_string),
            locked_by: None,
            lock_expires_at: None,
        }
    }

    /// Read, let `decide` pick a write, apply it conditionally; repeat on a
    /// lost race. `Ok(None)` means `decide` declined.
    async fn commit<F>(
        &self,
        document_id: &str,
        decide: F,
    ) -> Result<Option<DocumentSyncState>, SyncError>
    where
        F: Fn(Option<DocumentSyncState>) -> Step,
    {
        for attempt in 1..=self.write_attempts {
            let current = self.store.get(document_id).await?;
            let outcome = match decide(current) {
                Step::Decline => return Ok(None),
                Step::Insert(initial) => self.store.insert_if_absent(initial).await?,
                Step::Swap { expected, next } => {
                    self.store.compare_and_swap(&expected, next).await?
                }
            };
            match outcome {
                CasOutcome::Applied(state) => return Ok(Some(state)),
                CasOutcome::Stale(_) => {
                    debug!(document_id, attempt, "lost sync state race; retrying");
                }
            }
        }
        warn!(document_id, attempts = self.write_attempts, "sync state write contended");
        Err(SyncError::Contended {
            document_id: document_id.to_string(),
            attempts: self.write_attempts,
        })
    }
}
