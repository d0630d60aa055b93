use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::transitions::{next_status, TicketAction};
use crate::approvals::{AggregateOutcome, ApprovalCoordinator, ApproverDirectory};
use crate::audit::{AuditRecord, AuditRecorder};
use crate::clock::Clock;
use crate::context::RequestContext;
use crate::error::WorkflowError;
use crate::model::{
    Approval, AuditAction, ChangeSet, NewTicket, ResourceType, Ticket, TicketId, TicketNumber,
    TicketStatus, TicketUpdate,
};
use crate::persistence::Transaction;

/// One applied edge of the status table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub ticket_id: TicketId,
    pub from: TicketStatus,
    pub to: TicketStatus,
    pub action: TicketAction,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub ticket: Ticket,
    pub approvals: Vec<Approval>,
    pub transition: TransitionRecord,
}

#[derive(Debug, Clone)]
pub struct OutcomeApplied {
    pub ticket: Ticket,
    pub transitions: Vec<TransitionRecord>,
}

/// Owns ticket status. Every operation validates the edge before staging
/// any write, so a rejected call leaves the transaction untouched.
#[derive(Clone)]
pub struct TicketLifecycle {
    recorder: AuditRecorder,
    coordinator: ApprovalCoordinator,
    clock: Arc<dyn Clock>,
}

impl TicketLifecycle {
    pub fn new(
        recorder: AuditRecorder,
        coordinator: ApprovalCoordinator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            recorder,
            coordinator,
            clock,
        }
    }

    pub async fn create_draft(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        input: NewTicket,
        number: TicketNumber,
    ) -> Result<Ticket, WorkflowError> {
        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(WorkflowError::Validation("ticket title is required".into()));
        }

        let now = self.clock.now();
        let ticket = Ticket {
            id: TicketId::new(),
            organization_id: input.organization_id,
            number,
            created_by: ctx.actor,
            title,
            description: input.description,
            status: TicketStatus::Draft,
            priority: input.priority,
            risk_level: input.risk_level,
            compliance_frameworks: dedup(input.compliance_frameworks),
            change_type: input.change_type,
            affected_systems: input.affected_systems,
            impact_description: input.impact_description,
            rollback_plan: input.rollback_plan,
            testing_plan: input.testing_plan,
            requires_approval_types: dedup(input.requires_approval_types),
            approval_round: 0,
            submitted_snapshot: None,
            status_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            closed_at: None,
            deleted_at: None,
            deletion_reason: None,
        };
        tx.insert_ticket(&ticket).await?;

        let record = AuditRecord::for_ticket(
            &ticket,
            AuditAction::Create,
            format!("Draft {} created", ticket.number),
        )
        .by(ctx)
        .with_changes(None, Some(serde_json::to_value(&ticket)?));
        self.recorder.append(tx, record).await?;

        info!(
            ticket_id = %ticket.id,
            number = %ticket.number,
            created_by = %ctx.actor,
            "Draft ticket created"
        );
        Ok(ticket)
    }

    /// Content edits while the requester holds the ticket. Approval types are
    /// frozen once the ticket has been submitted.
    pub async fn update_draft(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
        update: TicketUpdate,
    ) -> Result<Ticket, WorkflowError> {
        let ticket = self.load_active(tx, ticket_id).await?;
        ensure_owner(&ticket, ctx)?;
        ensure_edge(&ticket, TicketAction::Edit)?;
        if update.is_empty() {
            return Err(WorkflowError::Validation("update contains no changes".into()));
        }
        if update.requires_approval_types.is_some() && ticket.has_been_submitted() {
            return Err(precondition(
                &ticket,
                TicketAction::Edit,
                "approval types are frozen after submission",
            ));
        }

        let mut next = ticket.clone();
        if let Some(title) = update.title {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(WorkflowError::Validation("ticket title is required".into()));
            }
            next.title = title;
        }
        if let Some(description) = update.description {
            next.description = description;
        }
        if let Some(priority) = update.priority {
            next.priority = priority;
        }
        if let Some(risk_level) = update.risk_level {
            next.risk_level = risk_level;
        }
        if let Some(frameworks) = update.compliance_frameworks {
            next.compliance_frameworks = dedup(frameworks);
        }
        if update.change_type.is_some() {
            next.change_type = update.change_type;
        }
        if let Some(systems) = update.affected_systems {
            next.affected_systems = systems;
        }
        if update.impact_description.is_some() {
            next.impact_description = update.impact_description;
        }
        if update.rollback_plan.is_some() {
            next.rollback_plan = update.rollback_plan;
        }
        if update.testing_plan.is_some() {
            next.testing_plan = update.testing_plan;
        }
        if let Some(types) = update.requires_approval_types {
            next.requires_approval_types = dedup(types);
        }

        let changes = ChangeSet::new(
            Some(serde_json::to_value(ticket.snapshot(ticket.updated_at))?),
            Some(serde_json::to_value(next.snapshot(self.clock.now()))?),
        );
        let description = format!("{} edited", ticket.number);
        let (next, _) = self
            .transition(tx, ctx, &ticket, next, TicketAction::Edit, description, Some(changes), Value::Null)
            .await?;
        Ok(next)
    }

    /// Opens a new approval round. The rows and the status change are staged
    /// in the same transaction, so neither is visible without the other.
    pub async fn submit(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
        directory: &dyn ApproverDirectory,
    ) -> Result<SubmitOutcome, WorkflowError> {
        let ticket = self.load_active(tx, ticket_id).await?;
        ensure_owner(&ticket, ctx)?;
        ensure_edge(&ticket, TicketAction::Submit)?;
        if ticket.requires_approval_types.is_empty() {
            return Err(precondition(
                &ticket,
                TicketAction::Submit,
                "at least one approval type is required",
            ));
        }

        if ticket.status == TicketStatus::UpdateRequested {
            self.coordinator
                .expire_pending(tx, ctx, &ticket, None, "ticket resubmitted")
                .await?;
        }

        let now = self.clock.now();
        let mut next = ticket.clone();
        next.approval_round += 1;
        let approvals = self
            .coordinator
            .create_approval_set(tx, ctx, &next, directory)
            .await?;

        if next.submitted_snapshot.is_none() {
            next.submitted_snapshot = Some(next.snapshot(now));
        }
        next.submitted_at = Some(now);
        next.status_reason = None;

        let metadata = json!({
            "round": next.approval_round,
            "approval_types": next.requires_approval_types,
        });
        let description = format!("{} submitted for approval (round {})", next.number, next.approval_round);
        let (next, transition) = self
            .transition(tx, ctx, &ticket, next, TicketAction::Submit, description, None, metadata)
            .await?;

        Ok(SubmitOutcome {
            ticket: next,
            approvals,
            transition,
        })
    }

    pub async fn cancel(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
        reason: &str,
    ) -> Result<(Ticket, TransitionRecord), WorkflowError> {
        let ticket = self.load_active(tx, ticket_id).await?;
        ensure_owner(&ticket, ctx)?;
        ensure_edge(&ticket, TicketAction::Cancel)?;
        if self.coordinator.aggregate(tx, &ticket).await? == AggregateOutcome::Approved {
            return Err(precondition(
                &ticket,
                TicketAction::Cancel,
                "every required approval has already been granted",
            ));
        }

        self.coordinator
            .expire_pending(tx, ctx, &ticket, None, "ticket cancelled")
            .await?;

        let mut next = ticket.clone();
        next.status_reason = non_blank(reason);
        let description = format!("{} cancelled", ticket.number);
        let metadata = json!({ "reason": next.status_reason });
        self.transition(tx, ctx, &ticket, next, TicketAction::Cancel, description, None, metadata)
            .await
    }

    pub async fn begin_implementation(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<(Ticket, TransitionRecord), WorkflowError> {
        self.simple(tx, ctx, ticket_id, TicketAction::BeginImplementation).await
    }

    pub async fn complete(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<(Ticket, TransitionRecord), WorkflowError> {
        self.simple(tx, ctx, ticket_id, TicketAction::Complete).await
    }

    pub async fn close(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<(Ticket, TransitionRecord), WorkflowError> {
        let ticket = self.load_active(tx, ticket_id).await?;
        ensure_edge(&ticket, TicketAction::Close)?;

        let mut next = ticket.clone();
        next.closed_at = Some(self.clock.now());
        let description = format!("{} closed", ticket.number);
        self.transition(tx, ctx, &ticket, next, TicketAction::Close, description, None, Value::Null)
            .await
    }

    /// Back to the requester from `closed`; a reason is mandatory
    pub async fn reopen(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
        reason: &str,
    ) -> Result<(Ticket, TransitionRecord), WorkflowError> {
        let ticket = self.load_active(tx, ticket_id).await?;
        ensure_edge(&ticket, TicketAction::Reopen)?;
        let reason = non_blank(reason)
            .ok_or_else(|| WorkflowError::Validation("a reason is required to reopen".into()))?;

        let mut next = ticket.clone();
        next.closed_at = None;
        next.status_reason = Some(reason.clone());
        let description = format!("{} reopened: {reason}", ticket.number);
        let metadata = json!({ "reason": reason });
        self.transition(tx, ctx, &ticket, next, TicketAction::Reopen, description, None, metadata)
            .await
    }

    /// Take a denied ticket back for rework so it can be resubmitted
    pub async fn revise(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
        reason: Option<&str>,
    ) -> Result<(Ticket, TransitionRecord), WorkflowError> {
        let ticket = self.load_active(tx, ticket_id).await?;
        ensure_owner(&ticket, ctx)?;
        ensure_edge(&ticket, TicketAction::Revise)?;

        let mut next = ticket.clone();
        next.status_reason = reason.and_then(non_blank);
        let description = format!("{} taken back for revision", ticket.number);
        let metadata = json!({ "reason": next.status_reason });
        self.transition(tx, ctx, &ticket, next, TicketAction::Revise, description, None, metadata)
            .await
    }

    /// Soft delete. The row and its history stay; the ticket stops accepting operations.
    pub async fn retire(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
        reason: &str,
    ) -> Result<Ticket, WorkflowError> {
        let ticket = self.load_active(tx, ticket_id).await?;
        ensure_owner(&ticket, ctx)?;
        ensure_edge(&ticket, TicketAction::Retire)?;

        let mut next = ticket.clone();
        next.deleted_at = Some(self.clock.now());
        next.deletion_reason = non_blank(reason);
        let description = format!("{} retired", ticket.number);
        let changes = ChangeSet::new(
            Some(json!({ "deleted_at": Value::Null })),
            Some(json!({ "deleted_at": next.deleted_at, "reason": next.deletion_reason })),
        );
        let (next, _) = self
            .transition(tx, ctx, &ticket, next, TicketAction::Retire, description, Some(changes), Value::Null)
            .await?;
        Ok(next)
    }

    /// Fold a decision's aggregate into the ticket. `submitted` passes through
    /// `in_review` first; when the status does not move the ticket version is
    /// still bumped so concurrent decisions serialize on it. `seen_version` is
    /// the version the decision was validated against.
    pub async fn apply_outcome(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
        seen_version: u64,
        outcome: AggregateOutcome,
    ) -> Result<OutcomeApplied, WorkflowError> {
        let mut current = self.load_active(tx, ticket_id).await?;
        if current.version != seen_version {
            return Err(WorkflowError::ConcurrentModification {
                resource_type: ResourceType::Ticket,
                resource_id: ticket_id.as_uuid(),
                current: None,
            });
        }
        let mut transitions = Vec::new();
        let metadata = json!({ "outcome": outcome });

        if current.status == TicketStatus::Submitted && outcome != AggregateOutcome::Unchanged {
            let description = format!("{} review started", current.number);
            let (next, record) = self
                .transition(tx, ctx, &current, current.clone(), TicketAction::BeginReview, description, None, metadata.clone())
                .await?;
            current = next;
            transitions.push(record);
        }

        match TicketAction::for_outcome(outcome) {
            Some(action) => {
                let description = format!("{} approval outcome: {:?}", current.number, outcome);
                let (next, record) = self
                    .transition(tx, ctx, &current, current.clone(), action, description, None, metadata)
                    .await?;
                current = next;
                transitions.push(record);
            }
            None if transitions.is_empty() => {
                current = self.touch(tx, ctx, &current, metadata).await?;
            }
            None => {}
        }

        Ok(OutcomeApplied {
            ticket: current,
            transitions,
        })
    }

    pub async fn load_active(
        &self,
        tx: &mut dyn Transaction,
        ticket_id: TicketId,
    ) -> Result<Ticket, WorkflowError> {
        match tx.get_ticket(ticket_id).await? {
            Some(ticket) if !ticket.is_retired() => Ok(ticket),
            _ => Err(WorkflowError::not_found(ResourceType::Ticket, ticket_id)),
        }
    }

    async fn simple(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
        action: TicketAction,
    ) -> Result<(Ticket, TransitionRecord), WorkflowError> {
        let ticket = self.load_active(tx, ticket_id).await?;
        ensure_edge(&ticket, action)?;
        let description = format!("{} {}", ticket.number, action);
        self.transition(tx, ctx, &ticket, ticket.clone(), action, description, None, Value::Null)
            .await
    }

    /// Apply `action` to `before`, carrying the field edits already made on `after`
    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        before: &Ticket,
        mut after: Ticket,
        action: TicketAction,
        description: String,
        changes: Option<ChangeSet>,
        metadata: Value,
    ) -> Result<(Ticket, TransitionRecord), WorkflowError> {
        let to = next_status(before.status, action).ok_or_else(|| invalid(before, action))?;
        let now = self.clock.now();
        after.status = to;
        after.version = before.version + 1;
        after.updated_at = now;
        tx.update_ticket(&after, before.version).await?;

        let audit_action = if action == TicketAction::PartiallyApprove && to == before.status {
            AuditAction::DecisionApplied
        } else {
            action.audit_action()
        };
        let changes = changes.unwrap_or_else(|| {
            ChangeSet::new(
                Some(json!({ "status": before.status, "version": before.version })),
                Some(json!({ "status": to, "version": after.version })),
            )
        });
        let record = AuditRecord::for_ticket(&after, audit_action, description)
            .by(ctx)
            .with_changes(changes.before, changes.after)
            .with_metadata(metadata);
        self.recorder.append(tx, record).await?;

        let transition = TransitionRecord {
            ticket_id: after.id,
            from: before.status,
            to,
            action,
            version: after.version,
            timestamp: now,
        };
        info!(
            ticket_id = %transition.ticket_id,
            number = %after.number,
            from = %transition.from,
            to = %transition.to,
            action = %transition.action,
            version = transition.version,
            correlation_id = %ctx.correlation_id,
            "Ticket transition applied"
        );
        Ok((after, transition))
    }

    async fn touch(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket: &Ticket,
        metadata: Value,
    ) -> Result<Ticket, WorkflowError> {
        let mut next = ticket.clone();
        next.version += 1;
        next.updated_at = self.clock.now();
        tx.update_ticket(&next, ticket.version).await?;

        let record = AuditRecord::for_ticket(
            &next,
            AuditAction::DecisionApplied,
            format!("{} decision recorded, status unchanged", next.number),
        )
        .by(ctx)
        .with_changes(
            Some(json!({ "version": ticket.version })),
            Some(json!({ "version": next.version })),
        )
        .with_metadata(metadata);
        self.recorder.append(tx, record).await?;

        debug!(ticket_id = %next.id, version = next.version, "Ticket version bumped by decision");
        Ok(next)
    }
}

fn ensure_edge(ticket: &Ticket, action: TicketAction) -> Result<(), WorkflowError> {
    match next_status(ticket.status, action) {
        Some(_) => Ok(()),
        None => Err(invalid(ticket, action)),
    }
}

fn ensure_owner(ticket: &Ticket, ctx: &RequestContext) -> Result<(), WorkflowError> {
    if ticket.created_by == ctx.actor || ctx.is_admin {
        return Ok(());
    }
    Err(WorkflowError::NotAuthorized {
        actor: ctx.actor,
        reason: format!("only the requester of {} may do this", ticket.number),
    })
}

fn invalid(ticket: &Ticket, action: TicketAction) -> WorkflowError {
    WorkflowError::InvalidTransition {
        ticket_id: ticket.id,
        status: ticket.status,
        action,
        version: ticket.version,
    }
}

fn precondition(ticket: &Ticket, action: TicketAction, reason: &str) -> WorkflowError {
    WorkflowError::PreconditionFailed {
        ticket_id: ticket.id,
        action,
        status: ticket.status,
        version: ticket.version,
        reason: reason.to_string(),
    }
}

fn non_blank(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut unique = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}
