// Storage port for tickets, approvals, audit entries and comments
// Adapters own the SQL dialect or file layout; the engine only sees transactions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    ActorId, Approval, ApprovalFilter, ApprovalId, ApprovalQueueItem, ApprovalType, AuditEntry,
    AuditEntryId, AuditReview, Comment, CommentId, OrganizationId, ResourceType, Ticket, TicketId,
    TicketNumber,
};

pub mod memory;

pub use memory::InMemoryPersistence;

/// A write condition that no longer held when the transaction committed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("ticket {ticket_id} version is {found}, expected {expected}")]
    TicketVersion {
        ticket_id: TicketId,
        expected: u64,
        found: u64,
    },

    #[error("approval {approval_id} version is {found}, expected {expected}")]
    ApprovalVersion {
        approval_id: ApprovalId,
        expected: u64,
        found: u64,
    },

    #[error("audit revision {attempted} for {resource_id} is taken (latest is {latest})")]
    AuditRevision {
        resource_type: ResourceType,
        resource_id: Uuid,
        attempted: u64,
        latest: u64,
    },

    #[error("ticket number {number} already exists in organization {organization_id}")]
    DuplicateTicketNumber {
        ticket_id: TicketId,
        organization_id: OrganizationId,
        number: TicketNumber,
    },

    #[error("ticket {ticket_id} already has a {approval_type} approval in round {round}")]
    DuplicateApproval {
        ticket_id: TicketId,
        approval_type: ApprovalType,
        round: u32,
    },

    #[error("audit entry {entry_id} has already been reviewed")]
    AlreadyReviewed { entry_id: AuditEntryId },
}

impl Conflict {
    pub fn resource(&self) -> (ResourceType, Uuid) {
        match self {
            Conflict::TicketVersion { ticket_id, .. }
            | Conflict::DuplicateTicketNumber { ticket_id, .. }
            | Conflict::DuplicateApproval { ticket_id, .. } => {
                (ResourceType::Ticket, ticket_id.as_uuid())
            }
            Conflict::ApprovalVersion { approval_id, .. } => {
                (ResourceType::Approval, approval_id.as_uuid())
            }
            Conflict::AuditRevision {
                resource_type,
                resource_id,
                ..
            } => (*resource_type, *resource_id),
            Conflict::AlreadyReviewed { entry_id } => {
                (ResourceType::AuditEntry, entry_id.as_uuid())
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Commit conflict: {0}")]
    Conflict(#[from] Conflict),

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Write rejected: {reason}")]
    Rejected { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl PersistenceError {
    pub fn as_conflict(&self) -> Option<&Conflict> {
        match self {
            PersistenceError::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Entry point of a storage adapter
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, PersistenceError>;
}

/// Unit of atomicity. Writes become visible together on `commit`;
/// dropping the transaction discards them.
#[async_trait]
pub trait Transaction: Send {
    async fn get_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>, PersistenceError>;

    async fn insert_ticket(&mut self, ticket: &Ticket) -> Result<(), PersistenceError>;

    /// Conditional write: commit fails unless the stored version is still `expected_version`
    async fn update_ticket(
        &mut self,
        ticket: &Ticket,
        expected_version: u64,
    ) -> Result<(), PersistenceError>;

    async fn max_ticket_sequence(
        &mut self,
        organization_id: OrganizationId,
        year: i32,
    ) -> Result<Option<u32>, PersistenceError>;

    async fn ticket_number_taken(
        &mut self,
        organization_id: OrganizationId,
        number: TicketNumber,
    ) -> Result<bool, PersistenceError>;

    /// All rows are created or none are
    async fn insert_approvals(&mut self, approvals: &[Approval]) -> Result<(), PersistenceError>;

    async fn get_approval(&mut self, id: ApprovalId) -> Result<Option<Approval>, PersistenceError>;

    async fn find_approval_by_token_hash(
        &mut self,
        token_hash: &str,
    ) -> Result<Option<Approval>, PersistenceError>;

    /// Every round, ordered by round then sequence_order
    async fn list_approvals(&mut self, ticket_id: TicketId)
        -> Result<Vec<Approval>, PersistenceError>;

    async fn update_approval(
        &mut self,
        approval: &Approval,
        expected_version: u64,
    ) -> Result<(), PersistenceError>;

    /// One page of rows matching `filter`, joined with their live tickets and
    /// ordered by ticket priority (highest first) then age, plus the total match count
    async fn query_approvals(
        &mut self,
        filter: &ApprovalFilter,
    ) -> Result<(Vec<ApprovalQueueItem>, u64), PersistenceError>;

    /// Next revision for `resource_id`, counting entries already staged in this transaction
    async fn next_revision(&mut self, resource_id: Uuid) -> Result<u64, PersistenceError>;

    async fn insert_audit(&mut self, entry: &AuditEntry) -> Result<(), PersistenceError>;

    /// Up to `limit` entries with revision greater than `after_revision`, ascending
    async fn list_audit(
        &mut self,
        resource_id: Uuid,
        after_revision: u64,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, PersistenceError>;

    async fn get_audit_entry(
        &mut self,
        id: AuditEntryId,
    ) -> Result<Option<AuditEntry>, PersistenceError>;

    async fn get_audit_review(
        &mut self,
        entry_id: AuditEntryId,
    ) -> Result<Option<AuditReview>, PersistenceError>;

    /// Commit fails with `AlreadyReviewed` if another review landed first
    async fn insert_audit_review(&mut self, review: &AuditReview) -> Result<(), PersistenceError>;

    /// Oldest first: entries of `organization_id` that require review and have none
    async fn list_unreviewed_audit(
        &mut self,
        organization_id: OrganizationId,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, PersistenceError>;

    /// Scrub `actor` from every entry that mentions them, in the envelope or
    /// in payloads, and from review sign-offs; returns the number of entries touched
    async fn anonymize_audit_by_actor(
        &mut self,
        actor: ActorId,
        at: DateTime<Utc>,
    ) -> Result<u64, PersistenceError>;

    async fn insert_comment(&mut self, comment: &Comment) -> Result<(), PersistenceError>;

    async fn get_comment(&mut self, id: CommentId) -> Result<Option<Comment>, PersistenceError>;

    async fn update_comment(&mut self, comment: &Comment) -> Result<(), PersistenceError>;

    async fn list_comments(&mut self, ticket_id: TicketId)
        -> Result<Vec<Comment>, PersistenceError>;

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError>;
}
