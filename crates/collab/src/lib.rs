// docket-collab: presence sessions, live presence fan-out and document
// sync/lock coordination over a shared remote store.

pub mod clock;
pub mod config;
pub mod observers;
pub mod playground;
pub mod presence;
pub mod store;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CollabConfig, ConfigError};
pub use observers::Subscription;
pub use presence::{JoinRequest, LifecycleEvent, PresenceSession};
pub use store::{MemoryStore, PresenceStore, StoreError, SyncStateStore};
pub use sync::{ConflictCheck, ConflictResolution, LockStatus, SyncCoordinator, SyncError};
