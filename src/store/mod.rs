// Re-export all public items from the store modules
pub use self::core::RecordStore;
pub use mutations::{MutationState, MutationTracker, PendingMutation};
pub use schema::{default_schemas, FieldSpec, FieldType, KindSchema};
pub use types::{EntityRecord, IngestOutcome, IngestReason, Origin};

pub mod core;
pub mod mutations;
pub mod schema;
pub mod types;
