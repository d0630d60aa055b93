use crate::config::{ApprovalConfig, ApprovalPolicy};
use crate::error::WorkflowError;
use crate::model::{Approval, ApprovalStatus, Decision};

/// Sequential mode: every lower `sequence_order` in the round must already be approved
pub fn check_sequence(
    policy: ApprovalPolicy,
    approval: &Approval,
    round: &[Approval],
) -> Result<(), WorkflowError> {
    if policy == ApprovalPolicy::Parallel {
        return Ok(());
    }

    let blocker = round
        .iter()
        .filter(|other| other.round == approval.round && other.id != approval.id)
        .filter(|other| other.sequence_order < approval.sequence_order)
        .filter(|other| other.status != ApprovalStatus::Approved)
        .min_by_key(|other| other.sequence_order);

    match blocker {
        Some(blocker) => Err(WorkflowError::OutOfSequence {
            approval_id: approval.id,
            blocked_by: blocker.approval_type,
            status: approval.status,
            version: approval.version,
        }),
        None => Ok(()),
    }
}

/// Rejections must say why when configured to
pub fn check_comment(
    config: &ApprovalConfig,
    decision: Decision,
    comment: Option<&str>,
) -> Result<(), WorkflowError> {
    let blank = comment.map_or(true, |c| c.trim().is_empty());
    if config.require_comment_on_rejection && decision.is_rejection() && blank {
        return Err(WorkflowError::Validation(format!(
            "a comment is required to {decision}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActorId, ApprovalType, TicketId};
    use chrono::Utc;

    fn round_of_three() -> Vec<Approval> {
        let ticket = TicketId::new();
        [ApprovalType::Security, ApprovalType::It, ApprovalType::Cloud]
            .into_iter()
            .enumerate()
            .map(|(i, t)| Approval::pending(ticket, t, i as u32 + 1, 1, ActorId::new(), None, Utc::now()))
            .collect()
    }

    #[test]
    fn parallel_policy_allows_any_order() {
        let round = round_of_three();
        assert!(check_sequence(ApprovalPolicy::Parallel, &round[2], &round).is_ok());
    }

    #[test]
    fn sequential_policy_names_the_first_blocker() {
        let mut round = round_of_three();
        let err = check_sequence(ApprovalPolicy::Sequential, &round[2], &round).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::OutOfSequence { blocked_by: ApprovalType::Security, .. }
        ));

        round[0].status = ApprovalStatus::Approved;
        round[1].status = ApprovalStatus::Approved;
        assert!(check_sequence(ApprovalPolicy::Sequential, &round[2], &round).is_ok());
        assert!(check_sequence(ApprovalPolicy::Sequential, &round[0], &round).is_ok());
    }

    #[test]
    fn rejections_need_a_comment() {
        let config = ApprovalConfig::default();
        assert!(check_comment(&config, Decision::Deny, None).is_err());
        assert!(check_comment(&config, Decision::RequestUpdate, Some("  ")).is_err());
        assert!(check_comment(&config, Decision::Deny, Some("missing rollback plan")).is_ok());
        assert!(check_comment(&config, Decision::Approve, None).is_ok());

        let lenient = ApprovalConfig {
            require_comment_on_rejection: false,
            ..ApprovalConfig::default()
        };
        assert!(check_comment(&lenient, Decision::Deny, None).is_ok());
    }
}
