pub mod notifier;
pub mod store;
pub mod subscriptions;
pub mod sync;
pub mod transport;

pub use store::{EntityRecord, MutationState, Origin};
pub use subscriptions::{ChangeSet, SubscriptionGuard};
pub use sync::{SyncConfig, SyncSession, SyncStatus};
pub use transport::{SyncTransport, TransportError};
