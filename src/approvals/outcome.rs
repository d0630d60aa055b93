use serde::Serialize;

use crate::model::{Approval, ApprovalStatus, TicketStatus};

/// Ticket-level status implied by one round of approvals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOutcome {
    /// Nothing decided yet
    Unchanged,
    InReview,
    PartiallyApproved,
    Approved,
    Denied,
    UpdateRequested,
}

impl AggregateOutcome {
    /// The status this outcome asks the lifecycle for; `None` leaves the ticket where it is
    pub fn target_status(self) -> Option<TicketStatus> {
        match self {
            AggregateOutcome::Unchanged => None,
            AggregateOutcome::InReview => Some(TicketStatus::InReview),
            AggregateOutcome::PartiallyApproved => Some(TicketStatus::PartiallyApproved),
            AggregateOutcome::Approved => Some(TicketStatus::Approved),
            AggregateOutcome::Denied => Some(TicketStatus::Denied),
            AggregateOutcome::UpdateRequested => Some(TicketStatus::UpdateRequested),
        }
    }
}

/// Deterministic fold over one round's rows. Precedence: any denial, then any
/// update request, then unanimous approval, then partial approval.
pub fn aggregate_outcome(round: &[Approval]) -> AggregateOutcome {
    let count = |status: ApprovalStatus| round.iter().filter(|a| a.status == status).count();

    if round.is_empty() {
        return AggregateOutcome::Unchanged;
    }
    if count(ApprovalStatus::Denied) > 0 {
        return AggregateOutcome::Denied;
    }
    if count(ApprovalStatus::UpdateRequested) > 0 {
        return AggregateOutcome::UpdateRequested;
    }

    let approved = count(ApprovalStatus::Approved);
    if approved == round.len() {
        return AggregateOutcome::Approved;
    }
    if approved > 0 {
        return AggregateOutcome::PartiallyApproved;
    }
    if count(ApprovalStatus::Pending) < round.len() {
        // expired rows count as decided without a verdict
        return AggregateOutcome::InReview;
    }
    AggregateOutcome::Unchanged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActorId, ApprovalType, TicketId};
    use chrono::Utc;

    fn round(statuses: &[ApprovalStatus]) -> Vec<Approval> {
        let ticket = TicketId::new();
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut a = Approval::pending(
                    ticket,
                    ApprovalType::ALL[i],
                    i as u32 + 1,
                    1,
                    ActorId::new(),
                    None,
                    Utc::now(),
                );
                a.status = *status;
                a
            })
            .collect()
    }

    use ApprovalStatus::*;

    #[test]
    fn denial_wins_over_everything() {
        assert_eq!(
            aggregate_outcome(&round(&[Approved, UpdateRequested, Denied])),
            AggregateOutcome::Denied
        );
    }

    #[test]
    fn update_request_wins_over_approvals() {
        assert_eq!(
            aggregate_outcome(&round(&[Approved, UpdateRequested, Pending])),
            AggregateOutcome::UpdateRequested
        );
    }

    #[test]
    fn approved_only_when_unanimous() {
        assert_eq!(
            aggregate_outcome(&round(&[Approved, Approved])),
            AggregateOutcome::Approved
        );
        assert_eq!(
            aggregate_outcome(&round(&[Approved, Pending])),
            AggregateOutcome::PartiallyApproved
        );
    }

    #[test]
    fn undecided_round_is_unchanged() {
        assert_eq!(
            aggregate_outcome(&round(&[Pending, Pending])),
            AggregateOutcome::Unchanged
        );
        assert_eq!(aggregate_outcome(&[]), AggregateOutcome::Unchanged);
        assert_eq!(
            aggregate_outcome(&round(&[Expired, Pending])),
            AggregateOutcome::InReview
        );
    }
}
