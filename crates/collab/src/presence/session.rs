// Presence session manager.
//
// Owns at most one local join at a time: the presence row, the heartbeat and
// stale-row cleanup loops, the live update feed, and the throttled status and
// cursor write paths. One instance per browser tab.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use docket_common::identity::color_for_user;
use docket_common::types::{CursorPosition, PresenceStatus, SelectionRange, UserPresence};
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::distributor::LiveUpdateDistributor;
use super::throttle::{CoalescingThrottle, Submit};
use crate::clock::{Clock, SystemClock};
use crate::config::CollabConfig;
use crate::observers::Subscription;
use crate::store::{CursorUpdate, PresenceDraft, PresencePatch, PresenceStore, StoreError};

/// Who is joining which document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub document_id: String,
    pub document_owner_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub user_name: Option<String>,
}

impl JoinRequest {
    pub fn new(
        document_id: impl Into<String>,
        document_owner_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            document_owner_id: document_owner_id.into(),
            user_id: user_id.into(),
            user_email: None,
            user_name: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.user_email = Some(email.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }
}

pub struct PresenceSession<S: PresenceStore> {
    inner: Arc<SessionInner<S>>,
}

struct SessionInner<S: PresenceStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: CollabConfig,
    distributor: LiveUpdateDistributor<S>,
    /// Serializes join/leave transitions.
    transition: tokio::sync::Mutex<()>,
    current: Mutex<Option<ActivePresence>>,
    status_throttle: CoalescingThrottle<PresenceStatus>,
    cursor_throttle: CoalescingThrottle<CursorUpdate>,
}

struct ActivePresence {
    row: UserPresence,
    loops: Vec<JoinHandle<()>>,
}

impl Drop for ActivePresence {
    fn drop(&mut self) {
        for task in self.loops.drain(..) {
            task.abort();
        }
    }
}

impl<S: PresenceStore> PresenceSession<S> {
    pub fn new(store: Arc<S>, config: CollabConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, config: CollabConfig, clock: Arc<dyn Clock>) -> Self {
        let distributor = LiveUpdateDistributor::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.presence_timeout(),
            config.subscription_retry(),
        );

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner<S>>| {
            let status_sink = weak.clone();
            let cursor_sink = weak.clone();
            SessionInner {
                status_throttle: CoalescingThrottle::new(config.status_throttle(), move |status| {
                    let inner = status_sink.clone();
                    async move {
                        match inner.upgrade() {
                            Some(inner) => {
                                inner.write(PresencePatch::status(inner.clock.now(), status)).await
                            }
                            None => false,
                        }
                    }
                    .boxed()
                }),
                cursor_throttle: CoalescingThrottle::new(config.cursor_throttle(), move |cursor| {
                    let inner = cursor_sink.clone();
                    async move {
                        match inner.upgrade() {
                            Some(inner) => {
                                inner.write(PresencePatch::cursor(inner.clock.now(), cursor)).await
                            }
                            None => false,
                        }
                    }
                    .boxed()
                }),
                store,
                clock,
                config,
                distributor,
                transition: tokio::sync::Mutex::new(()),
                current: Mutex::new(None),
            }
        });

        Self { inner }
    }

    /// Session id of the current join. Each join draws a fresh one.
    pub fn session_id(&self) -> Option<String> {
        self.inner.current().as_ref().map(|active| active.row.session_id.clone())
    }

    /// Snapshot of the local presence row, if joined.
    pub fn current_presence(&self) -> Option<UserPresence> {
        self.inner.current().as_ref().map(|active| active.row.clone())
    }

    pub fn is_joined(&self) -> bool {
        self.inner.current().is_some()
    }

    /// Join a document, leaving any previous one first.
    ///
    /// On failure nothing is started and local state is unchanged apart from
    /// the implicit leave of an earlier join.
    pub async fn join_document(&self, request: JoinRequest) -> Result<UserPresence, StoreError> {
        let _transition = self.inner.transition.lock().await;
        if self.is_joined() {
            self.inner.leave().await;
        }

        let now = self.inner.clock.now();
        let draft = PresenceDraft {
            user_color: color_for_user(&request.user_id).to_string(),
            document_id: request.document_id,
            document_owner_id: request.document_owner_id,
            user_id: request.user_id,
            user_email: request.user_email,
            user_name: request.user_name,
            status: PresenceStatus::Viewing,
            session_id: Uuid::new_v4().to_string(),
            joined_at: now,
            last_heartbeat: now,
        };

        let row = match self.inner.store.create(draft).await {
            Ok(row) => row,
            Err(error) => {
                warn!(error = %error, "failed to join document; collaboration unavailable");
                return Err(error);
            }
        };

        self.inner.status_throttle.reset();
        self.inner.cursor_throttle.reset();
        let loops = vec![
            tokio::spawn(heartbeat_loop(Arc::downgrade(&self.inner))),
            tokio::spawn(cleanup_loop(Arc::downgrade(&self.inner))),
        ];
        *self.inner.current() = Some(ActivePresence { row: row.clone(), loops });
        self.inner.distributor.start(&row.document_id, &row.session_id).await;

        info!(
            document_id = %row.document_id,
            presence_id = %row.id,
            session_id = %row.session_id,
            "joined document"
        );
        Ok(row)
    }

    /// Leave the current document. No-op when not joined; safe to repeat.
    pub async fn leave_current_document(&self) {
        let _transition = self.inner.transition.lock().await;
        self.inner.leave().await;
    }

    /// Throttled status change; one write per window carrying the latest status.
    pub async fn update_status(&self, status: PresenceStatus) -> Option<Submit> {
        if !self.is_joined() {
            return None;
        }
        Some(self.inner.status_throttle.submit(status).await)
    }

    /// Unthrottled cursor write.
    pub async fn update_cursor(
        &self,
        position: Option<CursorPosition>,
        selection: Option<SelectionRange>,
    ) {
        let cursor = CursorUpdate { position, selection };
        self.inner.write(PresencePatch::cursor(self.inner.clock.now(), cursor)).await;
    }

    /// Cursor write capped to one per cursor window, final position always sent.
    pub async fn update_cursor_throttled(
        &self,
        position: Option<CursorPosition>,
        selection: Option<SelectionRange>,
    ) -> Option<Submit> {
        if !self.is_joined() {
            return None;
        }
        Some(self.inner.cursor_throttle.submit(CursorUpdate { position, selection }).await)
    }

    /// Register an observer for live presence lists of the joined document.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[UserPresence]) + Send + Sync + 'static,
    {
        self.inner.distributor.subscribe(callback)
    }

    /// Live presences for any document, straight from the store.
    pub async fn document_presences(
        &self,
        document_id: &str,
    ) -> Result<Vec<UserPresence>, StoreError> {
        self.inner.distributor.presences(document_id).await
    }

    /// Run one heartbeat now.
    pub async fn heartbeat(&self) {
        self.inner.heartbeat().await;
    }

    /// Run one stale-row sweep now. Returns how many rows were deleted.
    pub async fn sweep_stale(&self) -> usize {
        self.inner.sweep().await
    }

    /// Leave and drop every observer.
    pub async fn dispose(&self) {
        self.leave_current_document().await;
        self.inner.distributor.clear_observers();
    }
}

impl<S: PresenceStore> Drop for PresenceSession<S> {
    fn drop(&mut self) {
        self.inner.distributor.stop();
        self.inner.status_throttle.cancel();
        self.inner.cursor_throttle.cancel();
        self.inner.current().take();
    }
}

impl<S: PresenceStore> SessionInner<S> {
    fn current(&self) -> MutexGuard<'_, Option<ActivePresence>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_row(&self) -> Option<UserPresence> {
        self.current().as_ref().map(|active| active.row.clone())
    }

    async fn leave(&self) {
        let Some(active) = self.current().take() else {
            return;
        };
        self.status_throttle.cancel();
        self.cursor_throttle.cancel();
        self.distributor.stop();
        let presence_id = active.row.id.clone();
        let document_id = active.row.document_id.clone();
        drop(active);

        match self.store.delete(&presence_id).await {
            Ok(()) => info!(%document_id, %presence_id, "left document"),
            Err(error) => {
                warn!(
                    %document_id,
                    %presence_id,
                    error = %error,
                    "failed to delete presence on leave"
                );
            }
        }
    }

    /// Apply `patch` to the current row; silently ignored when not joined.
    /// Returns whether the store accepted the write.
    async fn write(&self, patch: PresencePatch) -> bool {
        let Some(id) = self.current().as_ref().map(|active| active.row.id.clone()) else {
            return false;
        };
        match self.store.update(&id, patch).await {
            Ok(row) => {
                self.replace_row(&id, row);
                true
            }
            Err(error) => {
                warn!(presence_id = %id, error = %error, "presence update failed");
                false
            }
        }
    }

    fn replace_row(&self, expected_id: &str, row: UserPresence) {
        if let Some(active) = self.current().as_mut() {
            if active.row.id == expected_id {
                active.row = row;
            }
        }
    }

    async fn heartbeat(&self) {
        let Some(row) = self.current_row() else {
            return;
        };
        match self.store.update(&row.id, PresencePatch::heartbeat(self.clock.now())).await {
            Ok(updated) => {
                debug!(presence_id = %row.id, "presence heartbeat");
                self.replace_row(&row.id, updated);
            }
            Err(StoreError::NotFound { .. }) => self.reclaim(row).await,
            Err(error) => warn!(presence_id = %row.id, error = %error, "presence heartbeat failed"),
        }
    }

    /// Our row was swept by another client while we were unresponsive.
    async fn reclaim(&self, lost: UserPresence) {
        let draft = PresenceDraft {
            document_id: lost.document_id.clone(),
            document_owner_id: lost.document_owner_id.clone(),
            user_id: lost.user_id.clone(),
            user_email: lost.user_email.clone(),
            user_name: lost.user_name.clone(),
            user_color: lost.user_color.clone(),
            status: lost.status,
            session_id: lost.session_id.clone(),
            joined_at: lost.joined_at,
            last_heartbeat: self.clock.now(),
        };
        match self.store.create(draft).await {
            Ok(row) => {
                info!(
                    old_id = %lost.id,
                    new_id = %row.id,
                    "re-created presence swept by another client"
                );
                let orphan = match self.current().as_mut() {
                    Some(active) if active.row.id == lost.id => {
                        active.row = row;
                        None
                    }
                    // Left or rejoined meanwhile.
                    _ => Some(row.id),
                };
                if let Some(id) = orphan {
                    if let Err(error) = self.store.delete(&id).await {
                        warn!(presence_id = %id, error = %error, "orphan presence delete failed");
                    }
                }
            }
            Err(error) => {
                warn!(presence_id = %lost.id, error = %error, "failed to re-create presence");
            }
        }
    }

    async fn sweep(&self) -> usize {
        let Some(own) = self.current_row() else {
            return 0;
        };
        let rows = match self.store.list(&own.document_id).await {
            Ok(rows) => rows,
            Err(error) => {
                warn!(
                    document_id = %own.document_id,
                    error = %error,
                    "stale presence sweep failed"
                );
                return 0;
            }
        };

        let now = self.clock.now();
        let timeout = self.config.presence_timeout();
        let mut removed = 0;
        for row in rows.iter().filter(|row| row.id != own.id && row.is_stale_at(now, timeout)) {
            match self.store.delete(&row.id).await {
                Ok(()) => {
                    removed += 1;
                    debug!(presence_id = %row.id, user_id = %row.user_id, "removed stale presence");
                }
                Err(StoreError::NotFound { .. }) => {}
                Err(error) => {
                    warn!(presence_id = %row.id, error = %error, "failed to remove stale presence");
                }
            }
        }

        self.distributor.refresh(&own.document_id).await;
        removed
    }
}

async fn heartbeat_loop<S: PresenceStore>(inner: Weak<SessionInner<S>>) {
    let Some(period) = inner.upgrade().map(|inner| inner.config.heartbeat_interval()) else {
        return;
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.heartbeat().await;
    }
}

async fn cleanup_loop<S: PresenceStore>(inner: Weak<SessionInner<S>>) {
    let Some(period) = inner.upgrade().map(|inner| inner.config.cleanup_interval()) else {
        return;
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.sweep().await;
    }
}
