// Changeflow Library - Change Management Workflow Engine
// Ticket lifecycle, multi-approver coordination and the audit trail behind them

pub mod approvals;
pub mod audit;
pub mod clock;
pub mod comments;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod numbering;
pub mod persistence;
pub mod telemetry;

// Re-export key types for easy access
pub use approvals::{AggregateOutcome, ApprovalCoordinator, ApproverDirectory, IssuedToken, StaticApproverDirectory};
pub use audit::{AuditHistory, AuditRecord, AuditRecorder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ApprovalPolicy, ApproverAssignment, ChangeflowConfig};
pub use context::RequestContext;
pub use engine::{ChangeEngine, ChangeEngineBuilder, DecisionOutcome, DecisionTarget};
pub use error::{CurrentState, ErrorKind, WorkflowError};
pub use lifecycle::{next_status, TicketAction, TicketLifecycle, TransitionRecord};
pub use metrics::{EngineMetrics, EngineStats};
pub use model::{
    ActorId, Approval, ApprovalFilter, ApprovalId, ApprovalPage, ApprovalQueueItem, ApprovalStatus,
    ApprovalType, AuditAction, AuditCategory, AuditEntry, AuditFilter, AuditReview, Comment,
    CommentId, ComplianceFramework, Decision, NewTicket, OrganizationId, Priority, ResourceType,
    RiskLevel, Ticket, TicketId, TicketNumber, TicketStatus, TicketUpdate,
};
pub use notify::{NotificationEvent, Notifier, NotifyError, QueueNotifier, TracingNotifier};
pub use numbering::{FileLedger, TicketNumberAllocator};
pub use persistence::{Conflict, InMemoryPersistence, Persistence, PersistenceError, Transaction};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry};
