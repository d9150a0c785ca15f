// Presence: who is looking at a document right now.

pub mod distributor;
pub mod lifecycle;
pub mod session;
pub mod throttle;

pub use distributor::LiveUpdateDistributor;
pub use lifecycle::{handle_lifecycle_event, LifecycleEvent};
pub use session::{JoinRequest, PresenceSession};
pub use throttle::{CoalescingThrottle, Submit};
