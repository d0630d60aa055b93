// Audit trail: append-only per-resource revisions and lazy history reads

pub mod history;
pub mod recorder;

pub use history::AuditHistory;
pub use recorder::{AuditRecord, AuditRecorder};
