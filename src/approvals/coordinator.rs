use chrono::Duration;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::directory::ApproverDirectory;
use super::outcome::{aggregate_outcome, AggregateOutcome};
use super::policy;
use super::token::{generate_token, hash_token, IssuedToken};
use crate::audit::{AuditRecord, AuditRecorder};
use crate::clock::Clock;
use crate::config::ApprovalConfig;
use crate::context::RequestContext;
use crate::error::WorkflowError;
use crate::lifecycle::TicketAction;
use crate::model::{
    ActorId, Approval, ApprovalId, ApprovalStatus, AuditAction, Decision, ResourceType, Ticket,
};
use crate::persistence::Transaction;

/// Result of one recorded decision, with the round's aggregate recomputed afterwards
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub approval: Approval,
    /// Siblings closed because this decision rejected the change
    pub expired: Vec<Approval>,
    pub outcome: AggregateOutcome,
    pub via_token: bool,
    /// Ticket version the decision was validated against
    pub ticket_version: u64,
}

/// Owns per-type decision state for a ticket's current approval round
#[derive(Clone)]
pub struct ApprovalCoordinator {
    recorder: AuditRecorder,
    clock: Arc<dyn Clock>,
    config: ApprovalConfig,
}

impl ApprovalCoordinator {
    pub fn new(recorder: AuditRecorder, clock: Arc<dyn Clock>, config: ApprovalConfig) -> Self {
        Self {
            recorder,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.config
    }

    /// One pending row per required type, all staged in `tx` or none at all.
    /// `ticket.approval_round` must already be the new round.
    pub async fn create_approval_set(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket: &Ticket,
        directory: &dyn ApproverDirectory,
    ) -> Result<Vec<Approval>, WorkflowError> {
        let now = self.clock.now();
        let mut rows = Vec::with_capacity(ticket.requires_approval_types.len());

        for (position, approval_type) in ticket.requires_approval_types.iter().enumerate() {
            let assignment = directory
                .resolve(ticket.organization_id, *approval_type)
                .await
                .map_err(|err| WorkflowError::PreconditionFailed {
                    ticket_id: ticket.id,
                    action: TicketAction::Submit,
                    status: ticket.status,
                    version: ticket.version,
                    reason: err.to_string(),
                })?;
            rows.push(Approval::pending(
                ticket.id,
                *approval_type,
                position as u32 + 1,
                ticket.approval_round,
                assignment.approver_id,
                assignment.delegated_from,
                now,
            ));
        }

        tx.insert_approvals(&rows).await?;
        for approval in &rows {
            let record = AuditRecord::for_approval(
                approval,
                ticket,
                AuditAction::Create,
                format!(
                    "{} approval requested for {} (round {})",
                    approval.approval_type, ticket.number, approval.round
                ),
            )
            .by(ctx)
            .with_changes(None, Some(serde_json::to_value(approval)?));
            self.recorder.append(tx, record).await?;
        }

        Ok(rows)
    }

    /// Interactive decision by an authenticated approver
    pub async fn record_decision(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        approval_id: ApprovalId,
        decision: Decision,
        comment: Option<&str>,
        conditions: Option<&str>,
    ) -> Result<DecisionRecord, WorkflowError> {
        let approval = self.load(tx, approval_id).await?;
        if !approval.status.is_pending() {
            return Err(not_pending(&approval));
        }
        if !approval.can_be_decided_by(ctx.actor) {
            return Err(WorkflowError::NotAuthorized {
                actor: ctx.actor,
                reason: format!("not the assigned {} approver", approval.approval_type),
            });
        }
        let actor = ctx.actor;
        self.apply_decision(tx, ctx, approval, decision, actor, comment, conditions, false)
            .await
    }

    /// Link-based decision; the assigned approver is the acting party
    pub async fn decide_by_token(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        token: &str,
        decision: Decision,
        comment: Option<&str>,
        conditions: Option<&str>,
    ) -> Result<DecisionRecord, WorkflowError> {
        let approval = tx
            .find_approval_by_token_hash(&hash_token(token))
            .await?
            .ok_or(WorkflowError::TokenInvalid)?;

        if approval.token_consumed_at.is_some() || !approval.status.is_pending() {
            return Err(token_consumed(&approval));
        }
        let now = self.clock.now();
        match approval.token_expires_at {
            Some(expires_at) if now <= expires_at => {}
            Some(expires_at) => {
                return Err(WorkflowError::TokenExpired {
                    approval_id: approval.id,
                    expired_at: expires_at,
                    status: approval.status,
                    version: approval.version,
                })
            }
            None => return Err(WorkflowError::TokenInvalid),
        }

        let actor = approval.approver_id;
        self.apply_decision(tx, ctx, approval, decision, actor, comment, conditions, true)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_decision(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        mut approval: Approval,
        decision: Decision,
        actor: ActorId,
        comment: Option<&str>,
        conditions: Option<&str>,
        via_token: bool,
    ) -> Result<DecisionRecord, WorkflowError> {
        policy::check_comment(&self.config, decision, comment)?;

        let ticket = tx
            .get_ticket(approval.ticket_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(ResourceType::Ticket, approval.ticket_id))?;
        if via_token && ctx.actor == ticket.created_by && !approval.can_be_decided_by(ctx.actor) {
            return Err(WorkflowError::NotAuthorized {
                actor: ctx.actor,
                reason: format!("requester of {} cannot redeem approval links", ticket.number),
            });
        }
        if approval.round != ticket.approval_round || !ticket.status.is_under_review() {
            warn!(
                approval_id = %approval.id,
                ticket_id = %ticket.id,
                ticket_status = %ticket.status,
                "Pending approval belongs to a closed review round"
            );
            return Err(if via_token {
                token_consumed(&approval)
            } else {
                not_pending(&approval)
            });
        }

        let round = self.current_round(tx, &ticket).await?;
        policy::check_sequence(self.config.policy, &approval, &round)?;

        let now = self.clock.now();
        let before = serde_json::to_value(&approval)?;
        let expected_version = approval.version;
        approval.status = decision.resulting_status();
        approval.decided_by = Some(actor);
        approval.decided_at = Some(now);
        approval.decision_comment = non_blank(comment);
        approval.conditions = non_blank(conditions);
        if approval.token_hash.is_some() && approval.token_consumed_at.is_none() {
            approval.token_consumed_at = Some(now);
        }
        approval.version += 1;
        approval.updated_at = now;
        tx.update_approval(&approval, expected_version).await?;

        let action = match decision {
            Decision::Approve => AuditAction::Approve,
            Decision::Deny => AuditAction::Deny,
            Decision::RequestUpdate => AuditAction::RequestUpdate,
        };
        let record = AuditRecord::for_approval(
            &approval,
            &ticket,
            action,
            format!(
                "{} approval for {}: {}",
                approval.approval_type, ticket.number, approval.status
            ),
        )
        .by(ctx)
        .acting_as(actor)
        .with_changes(Some(before), Some(serde_json::to_value(&approval)?))
        .with_metadata(json!({
            "decision": decision,
            "round": approval.round,
            "via_token": via_token,
        }));
        self.recorder.append(tx, record).await?;

        let expired = if decision.is_rejection() {
            let reason = format!(
                "{} approval returned {}",
                approval.approval_type, approval.status
            );
            self.expire_pending(tx, ctx, &ticket, Some(approval.id), &reason)
                .await?
        } else {
            Vec::new()
        };

        let outcome = self.aggregate(tx, &ticket).await?;
        info!(
            approval_id = %approval.id,
            ticket_id = %ticket.id,
            approval_type = %approval.approval_type,
            decision = %decision,
            actor = %actor,
            via_token,
            expired = expired.len(),
            outcome = ?outcome,
            correlation_id = %ctx.correlation_id,
            "Approval decision recorded"
        );

        Ok(DecisionRecord {
            approval,
            expired,
            outcome,
            via_token,
            ticket_version: ticket.version,
        })
    }

    /// Mint a single-use link token; any earlier token for the row stops working
    pub async fn issue_token(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        approval_id: ApprovalId,
        ttl: Option<Duration>,
    ) -> Result<(Approval, IssuedToken), WorkflowError> {
        let mut approval = self.load(tx, approval_id).await?;
        if !approval.status.is_pending() {
            return Err(not_pending(&approval));
        }
        let ticket = tx
            .get_ticket(approval.ticket_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(ResourceType::Ticket, approval.ticket_id))?;
        check_token_issuer(ctx, &approval, &ticket)?;
        if approval.round != ticket.approval_round || !ticket.status.is_under_review() {
            return Err(not_pending(&approval));
        }

        let ttl = match ttl {
            Some(ttl) => ttl,
            None => self.config.token_ttl().ok_or_else(|| {
                WorkflowError::Validation(format!(
                    "approvals.token_ttl_minutes of {} is out of range",
                    self.config.token_ttl_minutes
                ))
            })?,
        };
        if ttl <= Duration::zero() {
            return Err(WorkflowError::Validation(
                "token ttl must be positive".to_string(),
            ));
        }

        let now = self.clock.now();
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            WorkflowError::Validation(format!(
                "token ttl of {} minutes runs past the supported date range",
                ttl.num_minutes()
            ))
        })?;
        let token = generate_token();
        let reissued = approval.token_hash.is_some();
        let expected_version = approval.version;
        approval.token_hash = Some(hash_token(&token));
        approval.token_expires_at = Some(expires_at);
        approval.token_consumed_at = None;
        approval.version += 1;
        approval.updated_at = now;
        tx.update_approval(&approval, expected_version).await?;

        let record = AuditRecord::for_approval(
            &approval,
            &ticket,
            AuditAction::TokenIssued,
            format!("Approval link issued for {} approval", approval.approval_type),
        )
        .by(ctx)
        .with_metadata(json!({
            "expires_at": expires_at,
            "reissued": reissued,
            "recipient": approval.approver_id,
        }));
        self.recorder.append(tx, record).await?;

        info!(
            approval_id = %approval.id,
            ticket_id = %ticket.id,
            expires_at = %expires_at,
            reissued,
            "Approval token issued"
        );

        let issued = IssuedToken {
            approval_id: approval.id,
            token,
            expires_at,
        };
        Ok((approval, issued))
    }

    /// Hand a pending row to someone else. Only one hop: a delegated row stays put.
    pub async fn delegate(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        approval_id: ApprovalId,
        to: ActorId,
    ) -> Result<Approval, WorkflowError> {
        let mut approval = self.load(tx, approval_id).await?;
        if !approval.status.is_pending() {
            return Err(not_pending(&approval));
        }
        if approval.approver_id != ctx.actor && !ctx.is_admin {
            return Err(WorkflowError::NotAuthorized {
                actor: ctx.actor,
                reason: "only the assigned approver can delegate".to_string(),
            });
        }
        if let Some(original) = approval.delegated_from {
            return Err(WorkflowError::Validation(format!(
                "approval {} was already delegated from {original}",
                approval.id
            )));
        }
        if to == approval.approver_id {
            return Err(WorkflowError::Validation(
                "cannot delegate an approval to its current approver".to_string(),
            ));
        }
        let ticket = tx
            .get_ticket(approval.ticket_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(ResourceType::Ticket, approval.ticket_id))?;

        let now = self.clock.now();
        let before = serde_json::to_value(&approval)?;
        let expected_version = approval.version;
        approval.delegated_from = Some(approval.approver_id);
        approval.approver_id = to;
        approval.token_hash = None;
        approval.token_expires_at = None;
        approval.version += 1;
        approval.updated_at = now;
        tx.update_approval(&approval, expected_version).await?;

        let record = AuditRecord::for_approval(
            &approval,
            &ticket,
            AuditAction::Delegate,
            format!("{} approval delegated to {to}", approval.approval_type),
        )
        .by(ctx)
        .with_changes(Some(before), Some(serde_json::to_value(&approval)?));
        self.recorder.append(tx, record).await?;

        info!(approval_id = %approval.id, from = %ctx.actor, to = %to, "Approval delegated");
        Ok(approval)
    }

    /// Close every still-pending row of the ticket's current round
    pub async fn expire_pending(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket: &Ticket,
        except: Option<ApprovalId>,
        reason: &str,
    ) -> Result<Vec<Approval>, WorkflowError> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        for mut approval in self.current_round(tx, ticket).await? {
            if approval.status != ApprovalStatus::Pending || Some(approval.id) == except {
                continue;
            }
            let expected_version = approval.version;
            approval.status = ApprovalStatus::Expired;
            approval.version += 1;
            approval.updated_at = now;
            tx.update_approval(&approval, expected_version).await?;

            let record = AuditRecord::for_approval(
                &approval,
                ticket,
                AuditAction::Expire,
                format!("{} approval expired: {reason}", approval.approval_type),
            )
            .by(ctx)
            .with_changes(
                Some(json!({ "status": ApprovalStatus::Pending })),
                Some(json!({ "status": ApprovalStatus::Expired })),
            );
            self.recorder.append(tx, record).await?;
            expired.push(approval);
        }

        Ok(expired)
    }

    /// The sole source of post-decision ticket status
    pub async fn aggregate(
        &self,
        tx: &mut dyn Transaction,
        ticket: &Ticket,
    ) -> Result<AggregateOutcome, WorkflowError> {
        let round = self.current_round(tx, ticket).await?;
        Ok(aggregate_outcome(&round))
    }

    pub async fn current_round(
        &self,
        tx: &mut dyn Transaction,
        ticket: &Ticket,
    ) -> Result<Vec<Approval>, WorkflowError> {
        let mut rows = tx.list_approvals(ticket.id).await?;
        rows.retain(|a| a.round == ticket.approval_round);
        Ok(rows)
    }

    async fn load(
        &self,
        tx: &mut dyn Transaction,
        approval_id: ApprovalId,
    ) -> Result<Approval, WorkflowError> {
        tx.get_approval(approval_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(ResourceType::Approval, approval_id))
    }
}

/// Links go to the assigned approver or come from an administrator. The
/// requester never gets one, so no ticket can be signed off by its author.
fn check_token_issuer(
    ctx: &RequestContext,
    approval: &Approval,
    ticket: &Ticket,
) -> Result<(), WorkflowError> {
    if ctx.actor == ticket.created_by {
        return Err(WorkflowError::NotAuthorized {
            actor: ctx.actor,
            reason: format!("requester of {} cannot issue approval links", ticket.number),
        });
    }
    if !ctx.is_admin && !approval.can_be_decided_by(ctx.actor) {
        return Err(WorkflowError::NotAuthorized {
            actor: ctx.actor,
            reason: format!("not the assigned {} approver", approval.approval_type),
        });
    }
    Ok(())
}

fn non_blank(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}

pub(crate) fn not_pending(approval: &Approval) -> WorkflowError {
    WorkflowError::NotPending {
        approval_id: approval.id,
        status: approval.status,
        version: approval.version,
    }
}

pub(crate) fn token_consumed(approval: &Approval) -> WorkflowError {
    WorkflowError::TokenConsumed {
        approval_id: approval.id,
        status: approval.status,
        version: approval.version,
    }
}
