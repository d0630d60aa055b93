use serde::{Deserialize, Serialize};
use std::fmt;

use crate::approvals::AggregateOutcome;
use crate::model::{AuditAction, TicketStatus};

/// Everything that can be asked of a ticket's status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum TicketAction {
    Submit,
    Cancel,
    /// First decision of a round recorded
    BeginReview,
    PartiallyApprove,
    Approve,
    Deny,
    RequestUpdate,
    BeginImplementation,
    Complete,
    Close,
    Reopen,
    /// Take a denied change back for rework
    Revise,
    /// Content edit; never changes status
    Edit,
    /// Soft delete; never changes status
    Retire,
}

impl TicketAction {
    pub const ALL: [TicketAction; 14] = [
        TicketAction::Submit,
        TicketAction::Cancel,
        TicketAction::BeginReview,
        TicketAction::PartiallyApprove,
        TicketAction::Approve,
        TicketAction::Deny,
        TicketAction::RequestUpdate,
        TicketAction::BeginImplementation,
        TicketAction::Complete,
        TicketAction::Close,
        TicketAction::Reopen,
        TicketAction::Revise,
        TicketAction::Edit,
        TicketAction::Retire,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TicketAction::Submit => "submit",
            TicketAction::Cancel => "cancel",
            TicketAction::BeginReview => "begin_review",
            TicketAction::PartiallyApprove => "partially_approve",
            TicketAction::Approve => "approve",
            TicketAction::Deny => "deny",
            TicketAction::RequestUpdate => "request_update",
            TicketAction::BeginImplementation => "begin_implementation",
            TicketAction::Complete => "complete",
            TicketAction::Close => "close",
            TicketAction::Reopen => "reopen",
            TicketAction::Revise => "revise",
            TicketAction::Edit => "edit",
            TicketAction::Retire => "retire",
        }
    }

    /// Audit vocabulary for the action
    pub fn audit_action(self) -> AuditAction {
        match self {
            TicketAction::Submit => AuditAction::Submit,
            TicketAction::Cancel => AuditAction::Cancel,
            TicketAction::Close => AuditAction::Close,
            TicketAction::Reopen => AuditAction::Reopen,
            TicketAction::Revise => AuditAction::Revise,
            TicketAction::Retire => AuditAction::Retire,
            TicketAction::Edit => AuditAction::Update,
            TicketAction::BeginReview
            | TicketAction::PartiallyApprove
            | TicketAction::Approve
            | TicketAction::Deny
            | TicketAction::RequestUpdate
            | TicketAction::BeginImplementation
            | TicketAction::Complete => AuditAction::StatusChange,
        }
    }

    /// Edge that carries a ticket towards an aggregate outcome, if any
    pub fn for_outcome(outcome: AggregateOutcome) -> Option<TicketAction> {
        match outcome {
            AggregateOutcome::Approved => Some(TicketAction::Approve),
            AggregateOutcome::Denied => Some(TicketAction::Deny),
            AggregateOutcome::PartiallyApproved => Some(TicketAction::PartiallyApprove),
            AggregateOutcome::UpdateRequested => Some(TicketAction::RequestUpdate),
            AggregateOutcome::InReview | AggregateOutcome::Unchanged => None,
        }
    }
}

impl fmt::Display for TicketAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The complete edge table. `None` means the action is illegal from `from`.
pub fn next_status(from: TicketStatus, action: TicketAction) -> Option<TicketStatus> {
    use TicketAction as A;
    use TicketStatus as S;

    let to = match (from, action) {
        (S::Draft | S::UpdateRequested, A::Submit) => S::Submitted,
        (S::Draft | S::Submitted, A::Cancel) => S::Cancelled,

        (S::Submitted, A::BeginReview) => S::InReview,
        (S::InReview | S::PartiallyApproved, A::Approve) => S::Approved,
        (S::InReview | S::PartiallyApproved, A::Deny) => S::Denied,
        (S::InReview | S::PartiallyApproved, A::PartiallyApprove) => S::PartiallyApproved,
        (S::InReview | S::PartiallyApproved, A::RequestUpdate) => S::UpdateRequested,

        (S::Approved, A::BeginImplementation) => S::Implementing,
        (S::Implementing, A::Complete) => S::Completed,
        (S::Completed, A::Close) => S::Closed,
        (S::Closed, A::Reopen) => S::UpdateRequested,
        (S::Denied, A::Revise) => S::UpdateRequested,

        (S::Draft | S::UpdateRequested, A::Edit) => from,
        (S::Draft | S::Closed | S::Cancelled, A::Retire) => from,

        _ => return None,
    };
    Some(to)
}
