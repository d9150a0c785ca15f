// In-process collaboration playground.
//
// One local session plus N simulated peers share a `MemoryStore`. Peers move
// their cursors on a timer and contend for the edit lock, so every presence
// fan-out and lock decision shows up in the logs.

use std::sync::Arc;
use std::time::Duration;

use docket_common::identity::display_name_for;
use docket_common::types::{CursorPosition, PresenceStatus, UserPresence};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::CollabConfig;
use crate::observers::Subscription;
use crate::presence::{JoinRequest, PresenceSession};
use crate::store::{MemoryStore, StoreError};
use crate::sync::{content_hash, SyncCoordinator, SyncError};

const PEER_TICK: Duration = Duration::from_millis(250);
const PEER_LINES: u32 = 40;

#[derive(Debug, Clone)]
pub struct PlaygroundOptions {
    pub document_id: String,
    pub user_id: String,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub peers: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PlaygroundError {
    #[error("failed to join as `{user_id}`: {source}")]
    Join { user_id: String, source: StoreError },
    #[error(transparent)]
    Sync(#[from] SyncError),
}

pub struct Playground {
    document_id: String,
    user_id: String,
    store: Arc<MemoryStore>,
    sync: SyncCoordinator<MemoryStore>,
    local: PresenceSession<MemoryStore>,
    peers: Vec<Arc<PresenceSession<MemoryStore>>>,
    tasks: Vec<JoinHandle<()>>,
    subscription: Subscription,
}

impl Playground {
    pub async fn start(
        options: PlaygroundOptions,
        config: CollabConfig,
    ) -> Result<Self, PlaygroundError> {
        let store = Arc::new(MemoryStore::new());
        let sync = SyncCoordinator::new(Arc::clone(&store), &config);

        let local = PresenceSession::new(Arc::clone(&store), config.clone());
        let document_id = options.document_id.clone();
        let subscription = local.subscribe(move |list: &[UserPresence]| {
            let users: Vec<String> = list
                .iter()
                .map(|p| display_name_for(p.user_name.as_deref(), p.user_email.as_deref()))
                .collect();
            info!(document_id = %document_id, count = list.len(), ?users, "presence update");
        });

        let mut request =
            JoinRequest::new(&options.document_id, &options.user_id, &options.user_id);
        request.user_name = options.user_name.clone();
        request.user_email = options.user_email.clone();
        local.join_document(request).await.map_err(|source| PlaygroundError::Join {
            user_id: options.user_id.clone(),
            source,
        })?;

        if sync.acquire_edit_lock(&options.document_id, &options.user_id).await? {
            let hash = content_hash(options.document_id.as_bytes());
            sync.update_sync_state(&options.document_id, &options.user_id, Some(&hash)).await?;
        }

        let mut playground = Self {
            document_id: options.document_id.clone(),
            user_id: options.user_id.clone(),
            store,
            sync,
            local,
            peers: Vec::new(),
            tasks: Vec::new(),
            subscription,
        };
        for index in 0..options.peers {
            playground.spawn_peer(&options, &config, index).await?;
        }
        Ok(playground)
    }

    async fn spawn_peer(
        &mut self,
        options: &PlaygroundOptions,
        config: &CollabConfig,
        index: usize,
    ) -> Result<(), PlaygroundError> {
        let user_id = format!("peer-{}", index + 1);
        let peer = Arc::new(PresenceSession::new(Arc::clone(&self.store), config.clone()));
        let request = JoinRequest::new(&options.document_id, &options.user_id, &user_id)
            .with_name(format!("Peer {}", index + 1))
            .with_email(format!("{user_id}@docket.local"));
        peer.join_document(request)
            .await
            .map_err(|source| PlaygroundError::Join { user_id: user_id.clone(), source })?;

        if !self.sync.acquire_edit_lock(&options.document_id, &user_id).await? {
            let holder = self.sync.lock_status(&options.document_id).await?;
            info!(user_id = %user_id, holder = ?holder.holder(), "peer waits for edit lock");
        }

        let session = Arc::clone(&peer);
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PEER_TICK);
            let offset = u32::try_from(index).unwrap_or(0).wrapping_mul(7);
            let mut step: u32 = 0;
            loop {
                ticker.tick().await;
                step = step.wrapping_add(1);
                let position = CursorPosition {
                    line: step.wrapping_add(offset) % PEER_LINES,
                    ch: step.wrapping_mul(3) % 80,
                };
                session.update_cursor_throttled(Some(position), None).await;
                if step % 20 == 0 {
                    let status = if step % 40 == 0 {
                        PresenceStatus::Viewing
                    } else {
                        PresenceStatus::Editing
                    };
                    session.update_status(status).await;
                }
            }
        }));
        self.peers.push(peer);
        Ok(())
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for peer in &self.peers {
            peer.dispose().await;
        }
        self.subscription.unsubscribe();
        self.local.dispose().await;
        if let Err(error) = self.sync.release_edit_lock(&self.document_id, &self.user_id).await {
            warn!(error = %error, "failed to release edit lock on shutdown");
        }
        info!(document_id = %self.document_id, "playground stopped");
    }
}
