//! Link-token decisions, delegation and racing approvers
//!
//! Tokens are single use and time limited; only their SHA-256 digest is
//! stored. These tests drive the engine from several tasks at once to check
//! that exactly one redemption wins.

use std::sync::Arc;

use changeflow::approvals::hash_token;
use changeflow::{
    ActorId, ApprovalStatus, ApprovalType, AuditAction, Decision, DecisionTarget, ErrorKind,
    NotificationEvent, TicketStatus, WorkflowError,
};
use chrono::Duration;

mod fixtures;
use fixtures::{row, Harness};

/// Caller for link decisions: no session, so an arbitrary service actor
fn link_handler() -> changeflow::RequestContext {
    changeflow::RequestContext::new(ActorId::new()).with_client("203.0.113.7", "mail-client/1.0")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_yield_exactly_one_success() {
    let h = Harness::new();
    let (ticket, approvals) = h.submitted(&[ApprovalType::Security]).await;
    let issued = h
        .engine
        .issue_token(&h.approver_of(ApprovalType::Security), approvals[0].id, None)
        .await
        .unwrap();

    let engine = Arc::new(h.engine.clone());
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        let token = issued.token.clone();
        handles.push(tokio::spawn(async move {
            engine
                .decide(
                    &link_handler(),
                    DecisionTarget::Token(token),
                    Decision::Approve,
                    None,
                    None,
                )
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                successes += 1;
                assert!(outcome.via_token);
            }
            Err(err) => assert_eq!(err.kind(), ErrorKind::TokenConsumed, "unexpected {err:?}"),
        }
    }
    assert_eq!(successes, 1);

    let final_ticket = h.engine.get_ticket(&h.requester, ticket.id).await.unwrap();
    assert_eq!(final_ticket.status, TicketStatus::Approved);
    assert_eq!(h.engine.metrics().snapshot().token_redemptions, 1);

    let approval_history = h.engine.get_history(approvals[0].id).collect_all().await.unwrap();
    let decisions = approval_history
        .iter()
        .filter(|e| e.action == AuditAction::Approve)
        .count();
    assert_eq!(decisions, 1);
}

#[tokio::test]
async fn token_decision_is_attributed_to_the_assigned_approver() {
    let mut h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::Security]).await;
    h.drain_inbox().await;

    let issued = h
        .engine
        .issue_token(&h.approver_of(ApprovalType::Security), approvals[0].id, None)
        .await
        .unwrap();
    match h.next_event().await {
        NotificationEvent::TokenIssued { token, recipient, expires_at, .. } => {
            assert_eq!(token, issued.token);
            assert_eq!(recipient, h.security);
            assert_eq!(expires_at, issued.expires_at);
        }
        other => panic!("expected TokenIssued, got {other:?}"),
    }

    let stored = h.engine.list_approvals(&h.requester, approvals[0].ticket_id).await.unwrap();
    assert_eq!(stored[0].token_hash.as_deref(), Some(hash_token(&issued.token).as_str()));
    assert_ne!(stored[0].token_hash.as_deref(), Some(issued.token.as_str()));

    let decided = h
        .engine
        .decide(
            &link_handler(),
            DecisionTarget::Token(issued.token.clone()),
            Decision::Approve,
            Some("looks good"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(decided.approval.decided_by, Some(h.security));
    assert!(decided.approval.token_consumed_at.is_some());

    let history = h.engine.get_history(approvals[0].id).collect_all().await.unwrap();
    let approve = history
        .iter()
        .find(|e| e.action == AuditAction::Approve)
        .expect("approve entry");
    assert_eq!(approve.actor, Some(h.security));
    assert!(approve.compliance_relevant);
    assert_eq!(approve.metadata["via_token"], true);
    assert_eq!(approve.ip_address.as_deref(), Some("203.0.113.7"));

    let issued_entry = history
        .iter()
        .find(|e| e.action == AuditAction::TokenIssued)
        .expect("token issue entry");
    assert!(!issued_entry.metadata.to_string().contains(&issued.token));

    let again = h
        .engine
        .decide(
            &link_handler(),
            DecisionTarget::Token(issued.token),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(again.kind(), ErrorKind::TokenConsumed);
}

#[tokio::test]
async fn expired_token_is_rejected_and_row_stays_pending() {
    let h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::It]).await;
    let issued = h
        .engine
        .issue_token(
            &h.approver_of(ApprovalType::It),
            approvals[0].id,
            Some(Duration::minutes(30)),
        )
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(31));
    let err = h
        .engine
        .decide(
            &link_handler(),
            DecisionTarget::Token(issued.token),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap_err();
    match err {
        WorkflowError::TokenExpired { expired_at, status, .. } => {
            assert_eq!(expired_at, issued.expires_at);
            assert_eq!(status, ApprovalStatus::Pending);
        }
        other => panic!("expected TokenExpired, got {other:?}"),
    }

    let rows = h.engine.list_approvals(&h.requester, approvals[0].ticket_id).await.unwrap();
    assert_eq!(rows[0].status, ApprovalStatus::Pending);
}

#[tokio::test]
async fn token_is_usable_up_to_its_expiry() {
    let h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::It]).await;
    let issued = h
        .engine
        .issue_token(
            &h.approver_of(ApprovalType::It),
            approvals[0].id,
            Some(Duration::minutes(30)),
        )
        .await
        .unwrap();

    h.clock.advance(Duration::minutes(30));
    h.engine
        .decide(
            &link_handler(),
            DecisionTarget::Token(issued.token),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn reissuing_invalidates_the_previous_token() {
    let h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::Security]).await;
    let approver = h.approver_of(ApprovalType::Security);
    let first = h.engine.issue_token(&approver, approvals[0].id, None).await.unwrap();
    let second = h.engine.issue_token(&approver, approvals[0].id, None).await.unwrap();
    assert_ne!(first.token, second.token);

    let err = h
        .engine
        .decide(
            &link_handler(),
            DecisionTarget::Token(first.token),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TokenInvalid);

    h.engine
        .decide(
            &link_handler(),
            DecisionTarget::Token(second.token),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn token_for_a_closed_round_is_consumed() {
    let h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::Security, ApprovalType::It]).await;
    let security = row(&approvals, ApprovalType::Security);
    let approver = h.approver_of(ApprovalType::Security);
    let issued = h.engine.issue_token(&approver, security.id, None).await.unwrap();

    h.engine
        .decide(
            &h.approver_of(ApprovalType::It),
            DecisionTarget::Approval(row(&approvals, ApprovalType::It).id),
            Decision::Deny,
            Some("change window conflicts with quarter close"),
            None,
        )
        .await
        .unwrap();

    let err = h
        .engine
        .decide(
            &link_handler(),
            DecisionTarget::Token(issued.token),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TokenConsumed);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn delegate_and_delegator_may_both_decide() {
    let h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::Security, ApprovalType::It]).await;
    let security = row(&approvals, ApprovalType::Security);
    let deputy = ActorId::new();

    let delegated = h
        .engine
        .delegate(&h.approver_of(ApprovalType::Security), security.id, deputy)
        .await
        .unwrap();
    assert_eq!(delegated.approver_id, deputy);
    assert_eq!(delegated.delegated_from, Some(h.security));

    let outcome = h
        .engine
        .decide(
            &h.as_actor(deputy),
            DecisionTarget::Approval(security.id),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome.approval.decided_by, Some(deputy));

    let it = row(&approvals, ApprovalType::It);
    h.engine
        .delegate(&h.approver_of(ApprovalType::It), it.id, deputy)
        .await
        .unwrap();
    let by_original = h
        .engine
        .decide(
            &h.approver_of(ApprovalType::It),
            DecisionTarget::Approval(it.id),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(by_original.approval.decided_by, Some(h.it));
    assert_eq!(by_original.ticket.status, TicketStatus::Approved);
}

#[tokio::test]
async fn delegation_is_a_single_hop() {
    let h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::Security]).await;
    let deputy = ActorId::new();

    let err = h
        .engine
        .delegate(&h.approver_of(ApprovalType::It), approvals[0].id, deputy)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);

    h.engine
        .delegate(&h.approver_of(ApprovalType::Security), approvals[0].id, deputy)
        .await
        .unwrap();
    let err = h
        .engine
        .delegate(&h.as_actor(deputy), approvals[0].id, ActorId::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn delegation_revokes_outstanding_tokens() {
    let h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::Security]).await;
    let approver = h.approver_of(ApprovalType::Security);
    let issued = h.engine.issue_token(&approver, approvals[0].id, None).await.unwrap();

    h.engine
        .delegate(&h.approver_of(ApprovalType::Security), approvals[0].id, ActorId::new())
        .await
        .unwrap();

    let err = h
        .engine
        .decide(
            &link_handler(),
            DecisionTarget::Token(issued.token),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TokenInvalid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_approvers_never_double_count() {
    let h = Harness::new();
    let types = [ApprovalType::Security, ApprovalType::It, ApprovalType::Operations];
    let (ticket, approvals) = h.submitted(&types).await;

    let engine = Arc::new(h.engine.clone());
    let mut handles = Vec::new();
    for approval_type in types {
        let engine = Arc::clone(&engine);
        let ctx = h.approver_of(approval_type);
        let approval_id = row(&approvals, approval_type).id;
        handles.push(tokio::spawn(async move {
            loop {
                let attempt = engine
                    .decide(&ctx, DecisionTarget::Approval(approval_id), Decision::Approve, None, None)
                    .await;
                match attempt {
                    Err(err) if err.is_retryable() => tokio::task::yield_now().await,
                    other => return other,
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let final_ticket = h.engine.get_ticket(&h.requester, ticket.id).await.unwrap();
    assert_eq!(final_ticket.status, TicketStatus::Approved);
    let rows = h.engine.list_approvals(&h.requester, ticket.id).await.unwrap();
    assert!(rows.iter().all(|a| a.status == ApprovalStatus::Approved && a.version == 2));

    let history = h.engine.get_history(ticket.id).collect_all().await.unwrap();
    let revisions: Vec<u64> = history.iter().map(|e| e.revision).collect();
    assert_eq!(revisions, (1..=history.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn requester_cannot_mint_links_for_their_own_ticket() {
    let h = Harness::new();
    let (ticket, approvals) = h.submitted(&[ApprovalType::Security]).await;

    let err = h
        .engine
        .issue_token(&h.requester, approvals[0].id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);

    let requester_as_admin = h.requester.clone().as_admin();
    let err = h
        .engine
        .issue_token(&requester_as_admin, approvals[0].id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);

    let err = h
        .engine
        .issue_token(&h.approver_of(ApprovalType::It), approvals[0].id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);

    let rows = h.engine.list_approvals(&h.requester, ticket.id).await.unwrap();
    assert_eq!(rows[0].status, ApprovalStatus::Pending);
    assert!(rows[0].token_hash.is_none());
    let current = h.engine.get_ticket(&h.requester, ticket.id).await.unwrap();
    assert_eq!(current.status, TicketStatus::Submitted);
}

#[tokio::test]
async fn requester_cannot_redeem_a_link_for_their_own_ticket() {
    let h = Harness::new();
    let (ticket, approvals) = h.submitted(&[ApprovalType::Security]).await;
    let issued = h
        .engine
        .issue_token(&h.approver_of(ApprovalType::Security), approvals[0].id, None)
        .await
        .unwrap();

    let err = h
        .engine
        .decide(
            &h.requester,
            DecisionTarget::Token(issued.token.clone()),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);
    let current = h.engine.get_ticket(&h.requester, ticket.id).await.unwrap();
    assert_eq!(current.status, TicketStatus::Submitted);

    h.engine
        .decide(
            &link_handler(),
            DecisionTarget::Token(issued.token),
            Decision::Approve,
            None,
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn delegator_and_administrators_may_issue_links() {
    let h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::Security, ApprovalType::It]).await;
    let security = row(&approvals, ApprovalType::Security);
    h.engine
        .delegate(&h.approver_of(ApprovalType::Security), security.id, ActorId::new())
        .await
        .unwrap();

    h.engine
        .issue_token(&h.approver_of(ApprovalType::Security), security.id, None)
        .await
        .unwrap();

    let admin = changeflow::RequestContext::new(ActorId::new()).as_admin();
    h.engine
        .issue_token(&admin, row(&approvals, ApprovalType::It).id, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn oversized_ttl_is_a_validation_error() {
    let h = Harness::new();
    let (_, approvals) = h.submitted(&[ApprovalType::Security]).await;

    let err = h
        .engine
        .issue_token(
            &h.approver_of(ApprovalType::Security),
            approvals[0].id,
            Some(Duration::days(365 * 300_000)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let rows = h.engine.list_approvals(&h.requester, approvals[0].ticket_id).await.unwrap();
    assert!(rows[0].token_hash.is_none());
}

#[tokio::test]
async fn out_of_range_configured_ttl_is_a_validation_error() {
    let mut config = changeflow::ChangeflowConfig::default();
    config.approvals.token_ttl_minutes = u64::MAX;
    let h = Harness::with_config(config);
    let (_, approvals) = h.submitted(&[ApprovalType::Security]).await;

    let err = h
        .engine
        .issue_token(&h.approver_of(ApprovalType::Security), approvals[0].id, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}
