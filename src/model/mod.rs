// Domain types shared by the lifecycle, approval and audit components

pub mod approval;
pub mod audit;
pub mod comment;
pub mod ids;
pub mod ticket;

pub use approval::{
    Approval, ApprovalFilter, ApprovalPage, ApprovalQueueItem, ApprovalStatus, ApprovalType,
    Decision,
};
pub use audit::{
    AuditAction, AuditCategory, AuditEntry, AuditFilter, AuditReview, ChangeSet, ResourceType,
};
pub use comment::{Comment, CommentRevision};
pub use ids::{ActorId, ApprovalId, AuditEntryId, CommentId, OrganizationId, TicketId};
pub use ticket::{
    ComplianceFramework, NewTicket, Priority, RiskLevel, Ticket, TicketNumber, TicketSnapshot,
    TicketStatus, TicketUpdate,
};
