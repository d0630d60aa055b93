use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::approvals::coordinator::{not_pending, token_consumed};
use crate::approvals::{
    hash_token, AggregateOutcome, ApprovalCoordinator, ApproverDirectory, DecisionRecord,
    IssuedToken, StaticApproverDirectory,
};
use crate::audit::{AuditHistory, AuditRecorder};
use crate::clock::{Clock, SystemClock};
use crate::comments::CommentService;
use crate::config::ChangeflowConfig;
use crate::context::RequestContext;
use crate::error::{CurrentState, WorkflowError};
use crate::lifecycle::{TicketLifecycle, TransitionRecord};
use crate::metrics::EngineMetrics;
use crate::model::{
    ActorId, Approval, ApprovalFilter, ApprovalId, ApprovalPage, ApprovalStatus, AuditEntry,
    AuditEntryId, AuditReview, Comment, CommentId, Decision, NewTicket, OrganizationId,
    ResourceType, Ticket, TicketId, TicketUpdate,
};
use crate::notify::{NotificationEvent, Notifications, Notifier, TracingNotifier};
use crate::numbering::{FileLedger, TicketNumberAllocator};
use crate::persistence::{Conflict, Persistence, PersistenceError, Transaction};
use crate::telemetry::create_workflow_span;

/// Which approval a decision is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionTarget {
    /// Authenticated approver acting on a known row
    Approval(ApprovalId),
    /// Plaintext token from an emailed link
    Token(String),
}

/// Everything one decision changed
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub approval: Approval,
    pub expired: Vec<Approval>,
    pub outcome: AggregateOutcome,
    pub ticket: Ticket,
    pub transitions: Vec<TransitionRecord>,
    pub via_token: bool,
}

pub struct ChangeEngineBuilder {
    persistence: Arc<dyn Persistence>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Option<Arc<dyn Clock>>,
    directory: Option<Arc<dyn ApproverDirectory>>,
    metrics: Option<Arc<EngineMetrics>>,
    config: ChangeflowConfig,
}

impl ChangeEngineBuilder {
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn ApproverDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_config(mut self, config: ChangeflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ChangeEngine {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = self.metrics.unwrap_or_default();
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier));
        let directory = self.directory.unwrap_or_else(|| {
            Arc::new(StaticApproverDirectory::new(config.approvers.clone()))
        });

        let recorder = AuditRecorder::new(Arc::clone(&clock));
        let coordinator = ApprovalCoordinator::new(
            recorder.clone(),
            Arc::clone(&clock),
            config.approvals.clone(),
        );
        let lifecycle = TicketLifecycle::new(recorder.clone(), coordinator.clone(), Arc::clone(&clock));
        let comments = CommentService::new(recorder.clone(), Arc::clone(&clock), config.comments.clone());
        let ledger = config.numbering.ledger_dir.clone().map(FileLedger::new);
        let allocator = TicketNumberAllocator::new(
            ledger,
            config.numbering.max_attempts,
            Arc::clone(&clock),
        );
        let notifications = Notifications::new(
            notifier,
            config.runtime.notification_timeout(),
            Arc::clone(&metrics),
        );

        info!(
            policy = ?config.approvals.policy,
            ledger = ?config.numbering.ledger_dir,
            operation_timeout_ms = config.runtime.operation_timeout_ms,
            "Change engine ready"
        );

        ChangeEngine {
            persistence: self.persistence,
            lifecycle,
            coordinator,
            recorder,
            comments,
            allocator,
            directory,
            notifications,
            metrics,
            config,
        }
    }
}

/// Entry point for hosting layers. Each operation runs in its own
/// transaction under a deadline; nothing is visible until it commits and
/// notifications go out only after the commit succeeded.
#[derive(Clone)]
pub struct ChangeEngine {
    persistence: Arc<dyn Persistence>,
    lifecycle: TicketLifecycle,
    coordinator: ApprovalCoordinator,
    recorder: AuditRecorder,
    comments: CommentService,
    allocator: TicketNumberAllocator,
    directory: Arc<dyn ApproverDirectory>,
    notifications: Notifications,
    metrics: Arc<EngineMetrics>,
    config: ChangeflowConfig,
}

impl ChangeEngine {
    pub fn builder(persistence: Arc<dyn Persistence>) -> ChangeEngineBuilder {
        ChangeEngineBuilder {
            persistence,
            notifier: None,
            clock: None,
            directory: None,
            metrics: None,
            config: ChangeflowConfig::default(),
        }
    }

    pub fn config(&self) -> &ChangeflowConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn log_stats(&self) {
        if self.config.observability.metrics_enabled {
            self.metrics.log_stats();
        }
    }

    /// Allocates a `CHG-YYYY-NNNNN` number and stores a draft. A number
    /// taken by another writer between allocation and commit is detected at
    /// commit and a fresh one allocated.
    pub async fn create_draft(
        &self,
        ctx: &RequestContext,
        input: NewTicket,
    ) -> Result<Ticket, WorkflowError> {
        let organization_id = input.organization_id;
        self.run(ctx, "create_draft", None, async {
            for attempt in 1..=self.config.numbering.max_attempts.max(1) {
                let mut tx = self.begin().await?;
                let allocation = self.allocator.allocate(tx.as_mut(), organization_id).await?;

                let staged = self
                    .lifecycle
                    .create_draft(tx.as_mut(), ctx, input.clone(), allocation.number)
                    .await;
                let ticket = match staged {
                    Ok(ticket) => ticket,
                    Err(err) => {
                        self.allocator.release(&allocation).await;
                        return Err(err);
                    }
                };

                match tx.commit().await {
                    Ok(()) => return Ok(ticket),
                    Err(PersistenceError::Conflict(Conflict::DuplicateTicketNumber { number, .. })) => {
                        self.allocator.release(&allocation).await;
                        debug!(%number, attempt, "Ticket number taken at commit, allocating again");
                    }
                    Err(err) => {
                        self.allocator.release(&allocation).await;
                        return Err(err.into());
                    }
                }
            }
            Err(WorkflowError::ConcurrentModification {
                resource_type: ResourceType::Ticket,
                resource_id: organization_id.as_uuid(),
                current: None,
            })
        })
        .await
    }

    pub async fn update_draft(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
        update: TicketUpdate,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "update_draft", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let ticket = self.lifecycle.update_draft(tx.as_mut(), ctx, ticket_id, update).await?;
            tx.commit().await?;
            Ok(ticket)
        })
        .await
    }

    /// Opens an approval round and moves the ticket to `submitted`
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "submit", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let submitted = self
                .lifecycle
                .submit(tx.as_mut(), ctx, ticket_id, self.directory.as_ref())
                .await?;
            tx.commit().await?;

            let ticket = submitted.ticket;
            self.metrics.record_transition();
            let mut events = vec![NotificationEvent::TicketSubmitted {
                ticket_id: ticket.id,
                number: ticket.number,
                round: ticket.approval_round,
            }];
            events.extend(submitted.approvals.iter().map(|approval| {
                NotificationEvent::ApprovalRequested {
                    ticket_id: ticket.id,
                    approval_id: approval.id,
                    approval_type: approval.approval_type,
                    approver_id: approval.approver_id,
                }
            }));
            events.push(status_changed(&ticket, &submitted.transition));
            self.notifications.publish(events);
            Ok(ticket)
        })
        .await
    }

    pub async fn cancel(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
        reason: &str,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "cancel", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let (ticket, transition) = self.lifecycle.cancel(tx.as_mut(), ctx, ticket_id, reason).await?;
            tx.commit().await?;
            Ok(self.transitioned(ticket, &transition))
        })
        .await
    }

    /// Record a decision and fold the round's aggregate into the ticket, atomically
    pub async fn decide(
        &self,
        ctx: &RequestContext,
        target: DecisionTarget,
        decision: Decision,
        comment: Option<&str>,
        conditions: Option<&str>,
    ) -> Result<DecisionOutcome, WorkflowError> {
        let resource = match &target {
            DecisionTarget::Approval(approval_id) => Some(approval_id.as_uuid()),
            DecisionTarget::Token(_) => None,
        };

        self.run(ctx, "decide", resource, async {
            let decided = self
                .decide_in_tx(ctx, &target, decision, comment, conditions)
                .await;
            match decided {
                Ok(outcome) => Ok(outcome),
                Err(err) => Err(self.refine_decision(err, &target).await),
            }
        })
        .await
    }

    async fn decide_in_tx(
        &self,
        ctx: &RequestContext,
        target: &DecisionTarget,
        decision: Decision,
        comment: Option<&str>,
        conditions: Option<&str>,
    ) -> Result<DecisionOutcome, WorkflowError> {
        let mut tx = self.begin().await?;
        let record: DecisionRecord = match target {
            DecisionTarget::Approval(approval_id) => {
                self.coordinator
                    .record_decision(tx.as_mut(), ctx, *approval_id, decision, comment, conditions)
                    .await?
            }
            DecisionTarget::Token(token) => {
                self.coordinator
                    .decide_by_token(tx.as_mut(), ctx, token, decision, comment, conditions)
                    .await?
            }
        };
        let applied = self
            .lifecycle
            .apply_outcome(
                tx.as_mut(),
                ctx,
                record.approval.ticket_id,
                record.ticket_version,
                record.outcome,
            )
            .await?;
        tx.commit().await?;

        self.metrics.record_decision();
        if record.via_token {
            self.metrics.record_token_redemption();
        }
        let mut events = vec![NotificationEvent::DecisionRecorded {
            ticket_id: applied.ticket.id,
            approval_id: record.approval.id,
            decision,
            actor: record.approval.decided_by.unwrap_or(ctx.actor),
            via_token: record.via_token,
        }];
        for transition in &applied.transitions {
            self.metrics.record_transition();
            events.push(status_changed(&applied.ticket, transition));
        }
        self.notifications.publish(events);

        Ok(DecisionOutcome {
            approval: record.approval,
            expired: record.expired,
            outcome: record.outcome,
            ticket: applied.ticket,
            transitions: applied.transitions,
            via_token: record.via_token,
        })
    }

    /// Mint a link token for a pending approval; the plaintext only leaves
    /// through the returned value and the notifier
    pub async fn issue_token(
        &self,
        ctx: &RequestContext,
        approval_id: ApprovalId,
        ttl: Option<chrono::Duration>,
    ) -> Result<IssuedToken, WorkflowError> {
        self.run(ctx, "issue_token", Some(approval_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let (approval, issued) = self
                .coordinator
                .issue_token(tx.as_mut(), ctx, approval_id, ttl)
                .await?;
            tx.commit().await?;

            self.notifications.publish(vec![NotificationEvent::TokenIssued {
                ticket_id: approval.ticket_id,
                approval_id: approval.id,
                recipient: approval.approver_id,
                token: issued.token.clone(),
                expires_at: issued.expires_at,
            }]);
            Ok(issued)
        })
        .await
    }

    pub async fn delegate(
        &self,
        ctx: &RequestContext,
        approval_id: ApprovalId,
        to: ActorId,
    ) -> Result<Approval, WorkflowError> {
        self.run(ctx, "delegate", Some(approval_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let approval = self.coordinator.delegate(tx.as_mut(), ctx, approval_id, to).await?;
            tx.commit().await?;

            self.notifications.publish(vec![NotificationEvent::ApprovalRequested {
                ticket_id: approval.ticket_id,
                approval_id: approval.id,
                approval_type: approval.approval_type,
                approver_id: approval.approver_id,
            }]);
            Ok(approval)
        })
        .await
    }

    pub async fn begin_implementation(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "begin_implementation", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let (ticket, transition) = self
                .lifecycle
                .begin_implementation(tx.as_mut(), ctx, ticket_id)
                .await?;
            tx.commit().await?;
            Ok(self.transitioned(ticket, &transition))
        })
        .await
    }

    pub async fn complete(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "complete", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let (ticket, transition) = self.lifecycle.complete(tx.as_mut(), ctx, ticket_id).await?;
            tx.commit().await?;
            Ok(self.transitioned(ticket, &transition))
        })
        .await
    }

    pub async fn close(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "close", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let (ticket, transition) = self.lifecycle.close(tx.as_mut(), ctx, ticket_id).await?;
            tx.commit().await?;
            Ok(self.transitioned(ticket, &transition))
        })
        .await
    }

    pub async fn reopen(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
        reason: &str,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "reopen", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let (ticket, transition) = self.lifecycle.reopen(tx.as_mut(), ctx, ticket_id, reason).await?;
            tx.commit().await?;
            Ok(self.transitioned(ticket, &transition))
        })
        .await
    }

    /// Take a denied ticket back to `update_requested` so it can be resubmitted
    pub async fn revise(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
        reason: Option<&str>,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "revise", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let (ticket, transition) = self.lifecycle.revise(tx.as_mut(), ctx, ticket_id, reason).await?;
            tx.commit().await?;
            Ok(self.transitioned(ticket, &transition))
        })
        .await
    }

    pub async fn retire(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
        reason: &str,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "retire", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let ticket = self.lifecycle.retire(tx.as_mut(), ctx, ticket_id, reason).await?;
            tx.commit().await?;
            Ok(ticket)
        })
        .await
    }

    pub async fn get_ticket(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<Ticket, WorkflowError> {
        self.run(ctx, "get_ticket", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            self.lifecycle.load_active(tx.as_mut(), ticket_id).await
        })
        .await
    }

    /// Every round's rows, ordered by round then sequence
    pub async fn list_approvals(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<Vec<Approval>, WorkflowError> {
        self.run(ctx, "list_approvals", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            self.lifecycle.load_active(tx.as_mut(), ticket_id).await?;
            Ok(tx.list_approvals(ticket_id).await?)
        })
        .await
    }

    /// Approval queue across tickets, highest priority first. Statuses default
    /// to pending; callers who are not administrators only see rows they may decide.
    pub async fn list_pending_approvals(
        &self,
        ctx: &RequestContext,
        filter: ApprovalFilter,
    ) -> Result<ApprovalPage, WorkflowError> {
        let mut filter = filter.normalized();
        if filter.statuses.is_empty() {
            filter.statuses = vec![ApprovalStatus::Pending];
        }
        match filter.approver_id {
            None if !ctx.is_admin => filter.approver_id = Some(ctx.actor),
            Some(approver) if approver != ctx.actor && !ctx.is_admin => {
                return Err(WorkflowError::NotAuthorized {
                    actor: ctx.actor,
                    reason: "only administrators may list another approver's queue".to_string(),
                });
            }
            _ => {}
        }

        self.run(ctx, "list_pending_approvals", None, async {
            let mut tx = self.begin().await?;
            let (items, total) = tx.query_approvals(&filter).await?;
            debug!(total, page = filter.page, "Approval queue listed");
            Ok(ApprovalPage {
                items,
                total,
                page: filter.page,
                per_page: filter.per_page,
            })
        })
        .await
    }

    /// Aggregate of the current round, read from one consistent view of its rows
    pub async fn aggregate_outcome(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
    ) -> Result<AggregateOutcome, WorkflowError> {
        self.run(ctx, "aggregate_outcome", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let ticket = self.lifecycle.load_active(tx.as_mut(), ticket_id).await?;
            self.coordinator.aggregate(tx.as_mut(), &ticket).await
        })
        .await
    }

    pub async fn add_comment(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
        content: &str,
        internal: bool,
    ) -> Result<Comment, WorkflowError> {
        self.run(ctx, "add_comment", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let (ticket, comment) = self
                .comments
                .add_comment(tx.as_mut(), ctx, ticket_id, content, internal)
                .await?;
            tx.commit().await?;

            self.notifications.publish(vec![NotificationEvent::CommentAdded {
                ticket_id: ticket.id,
                comment_id: comment.id,
                author: comment.author_id,
                internal: comment.internal,
            }]);
            Ok(comment)
        })
        .await
    }

    pub async fn edit_comment(
        &self,
        ctx: &RequestContext,
        comment_id: CommentId,
        content: &str,
    ) -> Result<Comment, WorkflowError> {
        self.run(ctx, "edit_comment", Some(comment_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let comment = self.comments.edit_comment(tx.as_mut(), ctx, comment_id, content).await?;
            tx.commit().await?;
            Ok(comment)
        })
        .await
    }

    pub async fn delete_comment(
        &self,
        ctx: &RequestContext,
        comment_id: CommentId,
    ) -> Result<Comment, WorkflowError> {
        self.run(ctx, "delete_comment", Some(comment_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let comment = self.comments.delete_comment(tx.as_mut(), ctx, comment_id).await?;
            tx.commit().await?;
            Ok(comment)
        })
        .await
    }

    pub async fn list_comments(
        &self,
        ctx: &RequestContext,
        ticket_id: TicketId,
        include_internal: bool,
    ) -> Result<Vec<Comment>, WorkflowError> {
        self.run(ctx, "list_comments", Some(ticket_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            self.comments
                .list_comments(tx.as_mut(), ticket_id, include_internal)
                .await
        })
        .await
    }

    /// Lazy, restartable revision history of any ticket, approval, comment or actor
    pub fn get_history(&self, resource_id: impl Into<Uuid>) -> AuditHistory {
        AuditHistory::new(Arc::clone(&self.persistence), resource_id.into())
    }

    /// Data-subject erasure for `subject`'s audit footprint. Administrators only.
    pub async fn anonymize_actor(
        &self,
        ctx: &RequestContext,
        subject: ActorId,
    ) -> Result<u64, WorkflowError> {
        if !ctx.is_admin {
            return Err(WorkflowError::NotAuthorized {
                actor: ctx.actor,
                reason: "anonymization requires an administrator".to_string(),
            });
        }
        self.run(ctx, "anonymize_actor", Some(subject.as_uuid()), async {
            let mut tx = self.begin().await?;
            let (touched, _) = self.recorder.anonymize_actor(tx.as_mut(), ctx, subject).await?;
            tx.commit().await?;
            Ok(touched)
        })
        .await
    }

    /// Compliance sign-off on one audit entry. Administrators only; the first
    /// review of an entry wins and later calls return it.
    pub async fn mark_audit_reviewed(
        &self,
        ctx: &RequestContext,
        entry_id: AuditEntryId,
        notes: Option<&str>,
    ) -> Result<AuditReview, WorkflowError> {
        if !ctx.is_admin {
            return Err(WorkflowError::NotAuthorized {
                actor: ctx.actor,
                reason: "audit review requires an administrator".to_string(),
            });
        }
        self.run(ctx, "mark_audit_reviewed", Some(entry_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            let review = self
                .recorder
                .mark_reviewed(tx.as_mut(), ctx, entry_id, notes)
                .await?;
            match tx.commit().await {
                Ok(()) => Ok(review),
                Err(PersistenceError::Conflict(Conflict::AlreadyReviewed { .. })) => {
                    debug!(entry_id = %entry_id, "Lost review race, returning the first review");
                    let mut tx = self.begin().await?;
                    tx.get_audit_review(entry_id)
                        .await?
                        .ok_or_else(|| WorkflowError::not_found(ResourceType::AuditEntry, entry_id))
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    /// Oldest compliance-relevant entries of `organization_id` still awaiting review
    pub async fn pending_audit_reviews(
        &self,
        ctx: &RequestContext,
        organization_id: OrganizationId,
    ) -> Result<Vec<AuditEntry>, WorkflowError> {
        if !ctx.is_admin {
            return Err(WorkflowError::NotAuthorized {
                actor: ctx.actor,
                reason: "audit review requires an administrator".to_string(),
            });
        }
        self.run(ctx, "pending_audit_reviews", Some(organization_id.as_uuid()), async {
            let mut tx = self.begin().await?;
            self.recorder.pending_reviews(tx.as_mut(), organization_id).await
        })
        .await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, WorkflowError> {
        Ok(self.persistence.begin().await?)
    }

    fn transitioned(&self, ticket: Ticket, transition: &TransitionRecord) -> Ticket {
        self.metrics.record_transition();
        self.notifications
            .publish(vec![status_changed(&ticket, transition)]);
        ticket
    }

    /// Bound `work` by the caller's deadline (or the configured default) and
    /// attach the workflow span. Dropping `work` on timeout drops its
    /// uncommitted transaction.
    async fn run<T, F>(
        &self,
        ctx: &RequestContext,
        operation: &'static str,
        resource: Option<Uuid>,
        work: F,
    ) -> Result<T, WorkflowError>
    where
        F: Future<Output = Result<T, WorkflowError>>,
    {
        let limit = ctx
            .timeout
            .unwrap_or_else(|| self.config.runtime.operation_timeout());
        let resource = resource.map(|id| id.to_string());
        let span = create_workflow_span(operation, resource.as_deref(), Some(&ctx.correlation_id));

        let result = async {
            match tokio::time::timeout(limit, work).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(self.refine(err).await),
                Err(_) => {
                    self.metrics.record_timeout();
                    warn!(operation, timeout_ms = limit.as_millis() as u64, "Operation timed out");
                    Err(WorkflowError::Timeout {
                        operation,
                        after_ms: limit.as_millis() as u64,
                    })
                }
            }
        }
        .instrument(span)
        .await;

        if let Err(err) = &result {
            if err.is_retryable() && !matches!(err, WorkflowError::Timeout { .. }) {
                self.metrics.record_conflict();
            }
            debug!(operation, kind = ?err.kind(), error = %err, "Operation rejected");
        }
        result
    }

    /// A decision that lost a race surfaces as a conflict on whichever row or
    /// ticket it touched first. If the target approval has since left
    /// `pending`, the caller sees `NotPending` (or `TokenConsumed` for link
    /// decisions) instead of a retry hint.
    async fn refine_decision(&self, err: WorkflowError, target: &DecisionTarget) -> WorkflowError {
        if !matches!(err, WorkflowError::ConcurrentModification { current: None, .. }) {
            return err;
        }
        let Ok(mut tx) = self.persistence.begin().await else {
            return err;
        };
        let found = match target {
            DecisionTarget::Approval(approval_id) => tx.get_approval(*approval_id).await,
            DecisionTarget::Token(token) => tx.find_approval_by_token_hash(&hash_token(token)).await,
        };
        match found {
            Ok(Some(approval)) if !approval.status.is_pending() => {
                debug!(approval_id = %approval.id, status = %approval.status, "Lost decision race");
                match target {
                    DecisionTarget::Token(_) => token_consumed(&approval),
                    DecisionTarget::Approval(_) => not_pending(&approval),
                }
            }
            _ => self.refine(err).await,
        }
    }

    /// Attach the current status and version to a bare conflict so the
    /// caller can decide whether to retry
    async fn refine(&self, err: WorkflowError) -> WorkflowError {
        let (resource_type, resource_id) = match &err {
            WorkflowError::ConcurrentModification {
                resource_type,
                resource_id,
                current: None,
            } => (*resource_type, *resource_id),
            _ => return err,
        };

        let Ok(mut tx) = self.persistence.begin().await else {
            return err;
        };
        match resource_type {
            ResourceType::Approval => match tx.get_approval(ApprovalId::from(resource_id)).await {
                Ok(Some(approval)) if !approval.status.is_pending() => not_pending(&approval),
                Ok(Some(approval)) => WorkflowError::ConcurrentModification {
                    resource_type,
                    resource_id,
                    current: Some(CurrentState::Approval {
                        status: approval.status,
                        version: approval.version,
                    }),
                },
                _ => err,
            },
            ResourceType::Ticket => match tx.get_ticket(TicketId::from(resource_id)).await {
                Ok(Some(ticket)) => WorkflowError::ConcurrentModification {
                    resource_type,
                    resource_id,
                    current: Some(CurrentState::Ticket {
                        status: ticket.status,
                        version: ticket.version,
                    }),
                },
                _ => err,
            },
            ResourceType::Comment | ResourceType::Actor | ResourceType::AuditEntry => err,
        }
    }
}

fn status_changed(ticket: &Ticket, transition: &TransitionRecord) -> NotificationEvent {
    NotificationEvent::StatusChanged {
        ticket_id: ticket.id,
        number: ticket.number,
        from: transition.from,
        to: transition.to,
    }
}
