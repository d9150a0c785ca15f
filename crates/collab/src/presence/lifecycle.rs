// Host page lifecycle mapped onto presence transitions.

use docket_common::types::PresenceStatus;
use tracing::debug;

use super::session::PresenceSession;
use crate::store::PresenceStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The page is being torn down; the delete may never reach the store.
    PageUnload,
    VisibilityHidden,
    VisibilityVisible,
}

/// Apply a lifecycle event to `session`.
pub async fn handle_lifecycle_event<S: PresenceStore>(
    session: &PresenceSession<S>,
    event: LifecycleEvent,
) {
    debug!(?event, "presence lifecycle event");
    match event {
        LifecycleEvent::PageUnload => session.leave_current_document().await,
        LifecycleEvent::VisibilityHidden => {
            session.update_status(PresenceStatus::Idle).await;
        }
        LifecycleEvent::VisibilityVisible => {
            session.update_status(PresenceStatus::Viewing).await;
        }
    }
}
