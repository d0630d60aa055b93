use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::lifecycle::TicketAction;
use crate::model::{
    ActorId, ApprovalId, ApprovalStatus, ApprovalType, CommentId, ResourceType, TicketId,
    TicketStatus,
};
use crate::persistence::{Conflict, PersistenceError};

/// Coarse classification callers switch on to decide retry, refresh, or surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTransition,
    NotPending,
    TokenConsumed,
    TokenExpired,
    TokenInvalid,
    NotAuthorized,
    ConcurrentModification,
    OutOfSequence,
    PreconditionFailed,
    Validation,
    NotFound,
    EditWindowClosed,
    Timeout,
    PersistenceFailure,
    Serialization,
}

/// Status and version of the resource an operation was rejected against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum CurrentState {
    Ticket { status: TicketStatus, version: u64 },
    Approval { status: ApprovalStatus, version: u64 },
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid transition: cannot {action} ticket {ticket_id} in status {status} (version {version})")]
    InvalidTransition {
        ticket_id: TicketId,
        status: TicketStatus,
        action: TicketAction,
        version: u64,
    },

    #[error("Approval {approval_id} is not pending (status {status}, version {version})")]
    NotPending {
        approval_id: ApprovalId,
        status: ApprovalStatus,
        version: u64,
    },

    #[error("Approval token already used (approval {approval_id} is {status})")]
    TokenConsumed {
        approval_id: ApprovalId,
        status: ApprovalStatus,
        version: u64,
    },

    #[error("Approval token expired at {expired_at}")]
    TokenExpired {
        approval_id: ApprovalId,
        expired_at: DateTime<Utc>,
        status: ApprovalStatus,
        version: u64,
    },

    #[error("Approval token is not recognised")]
    TokenInvalid,

    #[error("Actor {actor} is not authorized: {reason}")]
    NotAuthorized { actor: ActorId, reason: String },

    #[error("Concurrent modification of {resource_type} {resource_id}; re-read and retry")]
    ConcurrentModification {
        resource_type: ResourceType,
        resource_id: Uuid,
        current: Option<CurrentState>,
    },

    #[error("Approval {approval_id} cannot be decided before {blocked_by} approval completes")]
    OutOfSequence {
        approval_id: ApprovalId,
        blocked_by: ApprovalType,
        status: ApprovalStatus,
        version: u64,
    },

    #[error("Cannot {action} ticket {ticket_id}: {reason}")]
    PreconditionFailed {
        ticket_id: TicketId,
        action: TicketAction,
        status: TicketStatus,
        version: u64,
        reason: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{resource_type} {id} not found")]
    NotFound { resource_type: ResourceType, id: Uuid },

    #[error("Comment {comment_id} can no longer be edited (window of {window_minutes} minutes has passed)")]
    EditWindowClosed {
        comment_id: CommentId,
        window_minutes: u64,
    },

    #[error("Operation {operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(PersistenceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            WorkflowError::NotPending { .. } => ErrorKind::NotPending,
            WorkflowError::TokenConsumed { .. } => ErrorKind::TokenConsumed,
            WorkflowError::TokenExpired { .. } => ErrorKind::TokenExpired,
            WorkflowError::TokenInvalid => ErrorKind::TokenInvalid,
            WorkflowError::NotAuthorized { .. } => ErrorKind::NotAuthorized,
            WorkflowError::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            WorkflowError::OutOfSequence { .. } => ErrorKind::OutOfSequence,
            WorkflowError::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::NotFound { .. } => ErrorKind::NotFound,
            WorkflowError::EditWindowClosed { .. } => ErrorKind::EditWindowClosed,
            WorkflowError::Timeout { .. } => ErrorKind::Timeout,
            WorkflowError::PersistenceFailure(_) => ErrorKind::PersistenceFailure,
            WorkflowError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Only optimistic-lock conflicts and timeouts are worth retrying with a fresh read
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConcurrentModification | ErrorKind::Timeout
        )
    }

    pub fn current_state(&self) -> Option<CurrentState> {
        match self {
            WorkflowError::InvalidTransition { status, version, .. }
            | WorkflowError::PreconditionFailed { status, version, .. } => {
                Some(CurrentState::Ticket {
                    status: *status,
                    version: *version,
                })
            }
            WorkflowError::NotPending { status, version, .. }
            | WorkflowError::TokenConsumed { status, version, .. }
            | WorkflowError::TokenExpired { status, version, .. }
            | WorkflowError::OutOfSequence { status, version, .. } => {
                Some(CurrentState::Approval {
                    status: *status,
                    version: *version,
                })
            }
            WorkflowError::ConcurrentModification { current, .. } => *current,
            _ => None,
        }
    }

    pub(crate) fn not_found(resource_type: ResourceType, id: impl Into<Uuid>) -> Self {
        WorkflowError::NotFound {
            resource_type,
            id: id.into(),
        }
    }
}

impl From<Conflict> for WorkflowError {
    fn from(conflict: Conflict) -> Self {
        let (resource_type, resource_id) = conflict.resource();
        WorkflowError::ConcurrentModification {
            resource_type,
            resource_id,
            current: None,
        }
    }
}

impl From<PersistenceError> for WorkflowError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Conflict(conflict) => conflict.into(),
            other => WorkflowError::PersistenceFailure(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_and_timeouts_are_retryable() {
        let conflict = WorkflowError::from(Conflict::TicketVersion {
            ticket_id: TicketId::new(),
            expected: 3,
            found: 4,
        });
        assert_eq!(conflict.kind(), ErrorKind::ConcurrentModification);
        assert!(conflict.is_retryable());

        let timeout = WorkflowError::Timeout {
            operation: "submit",
            after_ms: 50,
        };
        assert!(timeout.is_retryable());

        let not_pending = WorkflowError::NotPending {
            approval_id: ApprovalId::new(),
            status: ApprovalStatus::Approved,
            version: 2,
        };
        assert!(!not_pending.is_retryable());
        assert!(!WorkflowError::TokenInvalid.is_retryable());
    }

    #[test]
    fn rejections_carry_current_state() {
        let err = WorkflowError::InvalidTransition {
            ticket_id: TicketId::new(),
            status: TicketStatus::Approved,
            action: TicketAction::Cancel,
            version: 5,
        };
        assert_eq!(
            err.current_state(),
            Some(CurrentState::Ticket {
                status: TicketStatus::Approved,
                version: 5
            })
        );
        assert!(err.to_string().contains("cannot cancel"));
    }

    #[test]
    fn storage_errors_become_persistence_failures() {
        let err = WorkflowError::from(PersistenceError::Unavailable {
            reason: "pool exhausted".into(),
        });
        assert_eq!(err.kind(), ErrorKind::PersistenceFailure);
        assert!(!err.is_retryable());
    }
}
