// Re-export all public items from the sync modules
pub use manager::{SyncConfig, SyncStatus, TransportManager};
pub use reconciler::{BatchSummary, Reconciler, SyncDiagnostics};
pub use session::{SyncSession, SyncSessionBuilder};

pub mod manager;
pub mod reconciler;
pub mod session;
