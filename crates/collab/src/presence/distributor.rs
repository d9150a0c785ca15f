// Live update distributor.
//
// Subscribes to the store's created/updated/deleted feeds for the joined
// document, drops events caused by our own session, and on every other event
// re-reads the full live presence list and fans it out to observers. A dead
// feed is re-opened after a fixed backoff, but only while the same document
// context is still current.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use docket_common::types::UserPresence;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::observers::{ObserverSet, Subscription};
use crate::store::{ChangeKind, ChangeStream, PresenceStore, StoreError};

/// Fan-out of live presence lists for the currently watched document.
pub struct LiveUpdateDistributor<S: PresenceStore> {
    inner: Arc<DistributorInner<S>>,
}

impl<S: PresenceStore> Clone for LiveUpdateDistributor<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct DistributorInner<S: PresenceStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    presence_timeout: chrono::Duration,
    retry_delay: Duration,
    observers: ObserverSet<[UserPresence]>,
    generation: AtomicU64,
    feed: Mutex<FeedSlot>,
}

#[derive(Default)]
struct FeedSlot {
    watching: Option<(String, u64)>,
    task: Option<JoinHandle<()>>,
}

struct Feeds {
    created: ChangeStream,
    updated: ChangeStream,
    deleted: ChangeStream,
}

impl<S: PresenceStore> LiveUpdateDistributor<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        presence_timeout: chrono::Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DistributorInner {
                store,
                clock,
                presence_timeout,
                retry_delay,
                observers: ObserverSet::new(),
                generation: AtomicU64::new(0),
                feed: Mutex::new(FeedSlot::default()),
            }),
        }
    }

    /// Register an observer for presence-list fan-outs.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[UserPresence]) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(callback)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    pub fn clear_observers(&self) {
        self.inner.observers.clear();
    }

    /// Live (non-stale, non-disconnected) presences for a document.
    pub async fn presences(&self, document_id: &str) -> Result<Vec<UserPresence>, StoreError> {
        self.inner.presences(document_id).await
    }

    /// Re-read the live list and fan it out, if `document_id` is still watched.
    pub async fn refresh(&self, document_id: &str) {
        self.inner.refresh(document_id).await;
    }

    pub fn watched_document(&self) -> Option<String> {
        lock(&self.inner.feed).watching.as_ref().map(|(doc, _)| doc.clone())
    }

    /// Start watching `document_id` on behalf of `session_id`, replacing any
    /// previous feed. Events stamped with `session_id` are never fanned out.
    ///
    /// A failure to open the feeds is logged and retried after the backoff.
    pub async fn start(&self, document_id: &str, session_id: &str) {
        self.stop();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.inner.feed).watching = Some((document_id.to_string(), generation));

        let feeds = match open_feeds(&self.inner, document_id).await {
            Ok(feeds) => Some(feeds),
            Err(error) => {
                warn!(document_id, error = %error, "failed to open presence change feeds");
                None
            }
        };

        let task = tokio::spawn(run_feed(
            Arc::clone(&self.inner),
            document_id.to_string(),
            session_id.to_string(),
            generation,
            feeds,
        ));

        let mut slot = lock(&self.inner.feed);
        if slot.watching.as_ref().map(|(_, g)| *g) == Some(generation) {
            slot.task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Stop watching. Pending restarts become no-ops.
    pub fn stop(&self) {
        let mut slot = lock(&self.inner.feed);
        slot.watching = None;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
    }
}

impl<S: PresenceStore> DistributorInner<S> {
    fn is_current(&self, document_id: &str, generation: u64) -> bool {
        match &lock(&self.feed).watching {
            Some((doc, current)) => doc == document_id && *current == generation,
            None => false,
        }
    }

    fn is_watching(&self, document_id: &str) -> bool {
        matches!(&lock(&self.feed).watching, Some((doc, _)) if doc == document_id)
    }

    async fn presences(&self, document_id: &str) -> Result<Vec<UserPresence>, StoreError> {
        let rows = self.store.list(document_id).await?;
        let now = self.clock.now();
        Ok(rows.into_iter().filter(|row| row.is_live_at(now, self.presence_timeout)).collect())
    }

    async fn refresh(&self, document_id: &str) {
        match self.presences(document_id).await {
            Ok(list) => {
                if self.is_watching(document_id) {
                    self.observers.notify(list.as_slice());
                }
            }
            Err(error) => {
                warn!(document_id, error = %error, "failed to refresh presence list");
            }
        }
    }

    async fn handle_change(&self, document_id: &str, session_id: &str, row: UserPresence) {
        if row.session_id == session_id {
            trace!(document_id, presence_id = %row.id, "ignoring own presence echo");
            return;
        }
        self.refresh(document_id).await;
    }
}

async fn open_feeds<S: PresenceStore>(
    inner: &DistributorInner<S>,
    document_id: &str,
) -> Result<Feeds, StoreError> {
    Ok(Feeds {
        created: inner.store.subscribe(document_id, ChangeKind::Created).await?,
        updated: inner.store.subscribe(document_id, ChangeKind::Updated).await?,
        deleted: inner.store.subscribe(document_id, ChangeKind::Deleted).await?,
    })
}

async fn run_feed<S: PresenceStore>(
    inner: Arc<DistributorInner<S>>,
    document_id: String,
    session_id: String,
    generation: u64,
    mut feeds: Option<Feeds>,
) {
    loop {
        if let Some(opened) = feeds.take() {
            // Catch up on anything that landed before the feeds were open.
            inner.refresh(&document_id).await;
            let error = pump(&inner, &document_id, &session_id, opened).await;
            warn!(document_id = %document_id, error = %error, "presence change feed failed");
        }

        tokio::time::sleep(inner.retry_delay).await;
        if !inner.is_current(&document_id, generation) {
            debug!(document_id = %document_id, "document context changed, skipping feed restart");
            return;
        }

        match open_feeds(&inner, &document_id).await {
            Ok(opened) => {
                info!(document_id = %document_id, "presence change feed restarted");
                feeds = Some(opened);
            }
            Err(error) => {
                warn!(document_id = %document_id, error = %error, "presence feed restart failed");
            }
        }
    }
}

async fn pump<S: PresenceStore>(
    inner: &DistributorInner<S>,
    document_id: &str,
    session_id: &str,
    mut feeds: Feeds,
) -> StoreError {
    loop {
        let event = tokio::select! {
            event = feeds.created.recv() => event,
            event = feeds.updated.recv() => event,
            event = feeds.deleted.recv() => event,
        };
        match event {
            Some(Ok(row)) => inner.handle_change(document_id, session_id, row).await,
            Some(Err(error)) => return error,
            None => return StoreError::Subscription("change feed closed".into()),
        }
    }
}

fn lock(slot: &Mutex<FeedSlot>) -> MutexGuard<'_, FeedSlot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use docket_common::types::PresenceStatus;
    use tokio::sync::mpsc;
    use tokio::time;

    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, PresenceDraft, PresencePatch};

    const LOCAL_SESSION: &str = "session-local";

    fn start_time() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().expect("timestamp should be valid")
    }

    fn setup() -> (MemoryStore, ManualClock, LiveUpdateDistributor<MemoryStore>) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let distributor = LiveUpdateDistributor::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            chrono::Duration::seconds(60),
            Duration::from_secs(5),
        );
        (store, clock, distributor)
    }

    fn draft(session_id: &str, user_id: &str, last_heartbeat: DateTime<Utc>) -> PresenceDraft {
        PresenceDraft {
            document_id: "doc-1".into(),
            document_owner_id: "owner-1".into(),
            user_id: user_id.into(),
            user_email: None,
            user_name: None,
            user_color: "#e06c75".into(),
            status: PresenceStatus::Viewing,
            session_id: session_id.into(),
            joined_at: last_heartbeat,
            last_heartbeat,
        }
    }

    fn recorder(
        distributor: &LiveUpdateDistributor<MemoryStore>,
    ) -> (mpsc::UnboundedReceiver<Vec<UserPresence>>, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = distributor.subscribe(move |list| {
            let _ = tx.send(list.to_vec());
        });
        (rx, sub)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    // ── Filtering ──────────────────────────────────────────────────

    #[tokio::test]
    async fn presences_exclude_stale_and_disconnected_rows() {
        let (store, clock, distributor) = setup();
        let now = clock.now();
        let timeout = chrono::Duration::seconds(60);
        let ms = chrono::Duration::milliseconds(1);

        store.create(draft("s-stale", "u-1", now - timeout - ms)).await.expect("create");
        let fresh =
            store.create(draft("s-fresh", "u-2", now - timeout + ms)).await.expect("create");
        let gone = store.create(draft("s-gone", "u-3", now)).await.expect("create");
        store
            .update(&gone.id, PresencePatch::status(now, PresenceStatus::Disconnected))
            .await
            .expect("update");

        let live = distributor.presences("doc-1").await.expect("presences should load");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, fresh.id);
    }

    // ── Fan-out ────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_fans_out_initial_list() {
        let (store, clock, distributor) = setup();
        store.create(draft("s-other", "u-2", clock.now())).await.expect("create");
        let (mut rx, _sub) = recorder(&distributor);

        distributor.start("doc-1", LOCAL_SESSION).await;
        let list = rx.recv().await.expect("initial fan-out");
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn foreign_events_trigger_fan_out() {
        let (store, clock, distributor) = setup();
        let (mut rx, _sub) = recorder(&distributor);
        distributor.start("doc-1", LOCAL_SESSION).await;
        assert!(rx.recv().await.expect("initial fan-out").is_empty());

        store.create(draft("s-other", "u-2", clock.now())).await.expect("create");
        let list = rx.recv().await.expect("fan-out after create");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].session_id, "s-other");
    }

    #[tokio::test]
    async fn own_session_events_are_suppressed() {
        let (store, clock, distributor) = setup();
        let (mut rx, _sub) = recorder(&distributor);
        distributor.start("doc-1", LOCAL_SESSION).await;
        rx.recv().await.expect("initial fan-out");

        let own = store.create(draft(LOCAL_SESSION, "u-1", clock.now())).await.expect("create");
        store.update(&own.id, PresencePatch::heartbeat(clock.now())).await.expect("update");
        store.delete(&own.id).await.expect("delete");
        settle().await;

        assert!(rx.try_recv().is_err(), "own echoes must not fan out");
    }

    #[tokio::test]
    async fn unsubscribed_observer_stops_receiving() {
        let (store, clock, distributor) = setup();
        let (mut kept, _keep) = recorder(&distributor);
        let (mut dropped, sub) = recorder(&distributor);
        distributor.start("doc-1", LOCAL_SESSION).await;
        kept.recv().await.expect("initial fan-out");
        dropped.recv().await.expect("initial fan-out");

        sub.unsubscribe();
        sub.unsubscribe();
        store.create(draft("s-other", "u-2", clock.now())).await.expect("create");

        assert_eq!(kept.recv().await.expect("fan-out").len(), 1);
        settle().await;
        assert!(dropped.try_recv().is_err());
    }

    // ── Restart ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn broken_feed_restarts_after_backoff() {
        let (store, clock, distributor) = setup();
        let (mut rx, _sub) = recorder(&distributor);
        distributor.start("doc-1", LOCAL_SESSION).await;
        rx.recv().await.expect("initial fan-out");
        assert_eq!(store.subscriber_count("doc-1"), 3);

        store.break_subscriptions("doc-1");
        settle().await;
        assert_eq!(store.subscriber_count("doc-1"), 0);

        time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(store.subscriber_count("doc-1"), 3);
        rx.recv().await.expect("catch-up fan-out after restart");

        store.create(draft("s-other", "u-2", clock.now())).await.expect("create");
        assert_eq!(rx.recv().await.expect("fan-out").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_is_skipped_when_document_changed() {
        let (store, _clock, distributor) = setup();
        distributor.start("doc-1", LOCAL_SESSION).await;
        settle().await;

        store.break_subscriptions("doc-1");
        settle().await;
        distributor.stop();

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.subscriber_count("doc-1"), 0);
        assert_eq!(distributor.watched_document(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_during_backoff_never_reopens_old_document() {
        let (store, _clock, distributor) = setup();
        distributor.start("doc-1", LOCAL_SESSION).await;
        settle().await;

        store.break_subscriptions("doc-1");
        settle().await;
        time::sleep(Duration::from_secs(2)).await;
        distributor.start("doc-2", "session-2").await;
        settle().await;

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.subscriber_count("doc-1"), 0);
        assert_eq!(store.subscriber_count("doc-2"), 3);
        assert_eq!(distributor.watched_document(), Some("doc-2".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_subscribe_is_retried() {
        let (store, _clock, distributor) = setup();
        store.set_unavailable(true);
        distributor.start("doc-1", LOCAL_SESSION).await;
        assert_eq!(store.subscriber_count("doc-1"), 0);

        store.set_unavailable(false);
        time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(store.subscriber_count("doc-1"), 3);
    }
}
