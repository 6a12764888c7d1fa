pub mod model;
pub mod queue;
pub mod store;

pub use model::{AuditEntry, AuditFilter, AuditStats, BlockReason};
pub use queue::AuditQueue;
pub use store::{AuditStore, InMemoryAuditStore, PostgresAuditStore};
