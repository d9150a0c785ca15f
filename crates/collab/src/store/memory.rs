// In-process store for tests and the playground binary.
//
// Behaves like the managed backend from a client's point of view: ids are
// issued on create, every mutation is pushed to matching change feeds, and
// sync-state writes are conditional. Fault injection hooks simulate outages.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use docket_common::types::{DocumentSyncState, UserPresence};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    CasOutcome, ChangeKind, ChangeStream, PresenceDraft, PresencePatch, PresenceStore,
    StoreError, SyncStateStore,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    presences: BTreeMap<String, UserPresence>,
    sync_states: HashMap<String, DocumentSyncState>,
    subscribers: Vec<Subscriber>,
    updates: Vec<(String, PresencePatch)>,
    creates: usize,
    deletes: usize,
    unavailable: bool,
}

#[derive(Debug)]
struct Subscriber {
    document_id: String,
    kind: ChangeKind,
    tx: mpsc::UnboundedSender<Result<UserPresence, StoreError>>,
}

impl MemoryState {
    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn notify(&mut self, kind: ChangeKind, row: &UserPresence) {
        self.subscribers.retain(|sub| {
            if sub.kind != kind || sub.document_id != row.document_id {
                return !sub.tx.is_closed();
            }
            sub.tx.send(Ok(row.clone())).is_ok()
        });
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every operation fail with `StoreError::Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Fail and drop every change feed open for `document_id`.
    pub fn break_subscriptions(&self, document_id: &str) {
        let mut state = self.state();
        state.subscribers.retain(|sub| {
            if sub.document_id != document_id {
                return true;
            }
            let _ = sub.tx.send(Err(StoreError::Subscription("connection reset".into())));
            false
        });
        debug!(document_id, "memory store broke change subscriptions");
    }

    /// Open change feeds for `document_id` whose receivers are still alive.
    pub fn subscriber_count(&self, document_id: &str) -> usize {
        self.state()
            .subscribers
            .iter()
            .filter(|sub| sub.document_id == document_id && !sub.tx.is_closed())
            .count()
    }

    /// Insert a row verbatim, bypassing id assignment and notifications.
    pub fn seed_presence(&self, row: UserPresence) {
        self.state().presences.insert(row.id.clone(), row);
    }

    pub fn presence(&self, id: &str) -> Option<UserPresence> {
        self.state().presences.get(id).cloned()
    }

    /// Every `update` applied so far, in order.
    pub fn update_log(&self) -> Vec<(String, PresencePatch)> {
        self.state().updates.clone()
    }

    pub fn create_count(&self) -> usize {
        self.state().creates
    }

    pub fn delete_count(&self) -> usize {
        self.state().deletes
    }
}

impl PresenceStore for MemoryStore {
    async fn list(&self, document_id: &str) -> Result<Vec<UserPresence>, StoreError> {
        let state = self.state();
        state.ensure_available()?;
        let mut rows: Vec<UserPresence> = state
            .presences
            .values()
            .filter(|row| row.document_id == document_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn create(&self, draft: PresenceDraft) -> Result<UserPresence, StoreError> {
        let mut state = self.state();
        state.ensure_available()?;
        state.next_id += 1;
        let row = UserPresence {
            id: format!("presence-{:06}", state.next_id),
            document_id: draft.document_id,
            document_owner_id: draft.document_owner_id,
            user_id: draft.user_id,
            user_email: draft.user_email,
            user_name: draft.user_name,
            user_color: draft.user_color,
            status: draft.status,
            last_heartbeat: draft.last_heartbeat,
            cursor_position: None,
            selection_range: None,
            session_id: draft.session_id,
            joined_at: draft.joined_at,
        };
        state.presences.insert(row.id.clone(), row.clone());
        state.creates += 1;
        state.notify(ChangeKind::Created, &row);
        Ok(row)
    }

    async fn update(&self, id: &str, patch: PresencePatch) -> Result<UserPresence, StoreError> {
        let mut state = self.state();
        state.ensure_available()?;
        let row = {
            let Some(row) = state.presences.get_mut(id) else {
                return Err(StoreError::NotFound { id: id.to_string() });
            };
            patch.apply_to(row);
            row.clone()
        };
        state.updates.push((id.to_string(), patch));
        state.notify(ChangeKind::Updated, &row);
        Ok(row)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        state.ensure_available()?;
        let Some(row) = state.presences.remove(id) else {
            return Err(StoreError::NotFound { id: id.to_string() });
        };
        state.deletes += 1;
        state.notify(ChangeKind::Deleted, &row);
        Ok(())
    }

    async fn subscribe(
        &self,
        document_id: &str,
        kind: ChangeKind,
    ) -> Result<ChangeStream, StoreError> {
        let mut state = self.state();
        state.ensure_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber { document_id: document_id.to_string(), kind, tx });
        Ok(rx)
    }
}

impl SyncStateStore for MemoryStore {
    async fn get(&self, document_id: &str) -> Result<Option<DocumentSyncState>, StoreError> {
        let state = self.state();
        state.ensure_available()?;
        Ok(state.sync_states.get(document_id).cloned())
    }

    async fn insert_if_absent(&self, next: DocumentSyncState) -> Result<CasOutcome, StoreError> {
        let mut state = self.state();
        state.ensure_available()?;
        if let Some(existing) = state.sync_states.get(&next.document_id) {
            return Ok(CasOutcome::Stale(Some(existing.clone())));
        }
        state.sync_states.insert(next.document_id.clone(), next.clone());
        Ok(CasOutcome::Applied(next))
    }

    async fn compare_and_swap(
        &self,
        expected: &DocumentSyncState,
        next: DocumentSyncState,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.state();
        state.ensure_available()?;
        match state.sync_states.get(&expected.document_id) {
            Some(current) if current == expected => {
                state.sync_states.insert(next.document_id.clone(), next.clone());
                Ok(CasOutcome::Applied(next))
            }
            current => Ok(CasOutcome::Stale(current.cloned())),
        }
    }
}
