use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Upper bound on one read of the review backlog
pub const PENDING_REVIEW_LIMIT: usize = 100;
use uuid::Uuid;

use crate::clock::Clock;
use crate::context::RequestContext;
use crate::error::WorkflowError;
use crate::model::{
    ActorId, Approval, AuditAction, AuditEntry, AuditEntryId, AuditReview, ChangeSet, Comment,
    ComplianceFramework, OrganizationId, ResourceType, Ticket,
};
use crate::persistence::Transaction;

/// What happened, before the recorder assigns identity, revision and time
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub organization_id: Option<OrganizationId>,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub action: AuditAction,
    pub description: String,
    pub changes: ChangeSet,
    pub metadata: Value,
    pub compliance_frameworks: Vec<ComplianceFramework>,
    pub compliance_relevant: bool,
    pub actor: Option<ActorId>,
    pub actor_name: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub correlation_id: Option<String>,
}

impl AuditRecord {
    pub fn new(
        resource_type: ResourceType,
        resource_id: Uuid,
        action: AuditAction,
        description: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: None,
            resource_type,
            resource_id,
            action,
            description: description.into(),
            changes: ChangeSet::default(),
            metadata: Value::Null,
            compliance_frameworks: Vec::new(),
            compliance_relevant: action.is_compliance_relevant(),
            actor: None,
            actor_name: None,
            ip_address: None,
            user_agent: None,
            correlation_id: None,
        }
    }

    /// Ticket entries inherit the ticket's organization and frameworks
    pub fn for_ticket(ticket: &Ticket, action: AuditAction, description: impl Into<String>) -> Self {
        let mut record = Self::new(ResourceType::Ticket, ticket.id.as_uuid(), action, description);
        record.organization_id = Some(ticket.organization_id);
        record.compliance_frameworks = ticket.compliance_frameworks.clone();
        record
    }

    /// Approval entries are always compliance relevant
    pub fn for_approval(
        approval: &Approval,
        ticket: &Ticket,
        action: AuditAction,
        description: impl Into<String>,
    ) -> Self {
        let mut record =
            Self::new(ResourceType::Approval, approval.id.as_uuid(), action, description);
        record.organization_id = Some(ticket.organization_id);
        record.compliance_frameworks = ticket.compliance_frameworks.clone();
        record.compliance_relevant = true;
        record
    }

    pub fn for_comment(
        comment: &Comment,
        ticket: &Ticket,
        action: AuditAction,
        description: impl Into<String>,
    ) -> Self {
        let mut record =
            Self::new(ResourceType::Comment, comment.id.as_uuid(), action, description);
        record.organization_id = Some(ticket.organization_id);
        record
    }

    pub fn by(mut self, ctx: &RequestContext) -> Self {
        self.actor = Some(ctx.actor);
        self.actor_name = ctx.actor_name.clone();
        self.ip_address = ctx.ip_address.clone();
        self.user_agent = ctx.user_agent.clone();
        self.correlation_id = Some(ctx.correlation_id.clone());
        self
    }

    /// Attribute the entry to someone other than the session holder (link-based decisions)
    pub fn acting_as(mut self, actor: ActorId) -> Self {
        if self.actor != Some(actor) {
            self.actor_name = None;
        }
        self.actor = Some(actor);
        self
    }

    pub fn with_changes(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.changes = ChangeSet::new(before, after);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Append-only writer of per-resource revisions
#[derive(Clone)]
pub struct AuditRecorder {
    clock: Arc<dyn Clock>,
}

impl AuditRecorder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Assigns the next revision inside `tx` and stages the row. A failure here
    /// must abort the caller's transaction.
    pub async fn append(
        &self,
        tx: &mut dyn Transaction,
        record: AuditRecord,
    ) -> Result<AuditEntry, WorkflowError> {
        let revision = tx.next_revision(record.resource_id).await?;
        let entry = AuditEntry {
            id: AuditEntryId::new(),
            organization_id: record.organization_id,
            resource_type: record.resource_type,
            resource_id: record.resource_id,
            revision,
            actor: record.actor,
            actor_name: record.actor_name,
            action: record.action,
            description: record.description,
            changes: record.changes,
            metadata: record.metadata,
            ip_address: record.ip_address,
            user_agent: record.user_agent,
            correlation_id: record.correlation_id,
            compliance_relevant: record.compliance_relevant,
            compliance_frameworks: record.compliance_frameworks,
            requires_review: record.compliance_relevant,
            created_at: self.clock.now(),
            anonymized: false,
            anonymized_at: None,
        };
        tx.insert_audit(&entry).await?;

        debug!(
            resource_type = %entry.resource_type,
            resource_id = %entry.resource_id,
            revision = entry.revision,
            action = %entry.action,
            "Audit entry staged"
        );
        Ok(entry)
    }

    /// Scrub PII from every entry written by `subject` and record that it happened
    pub async fn anonymize_actor(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        subject: ActorId,
    ) -> Result<(u64, AuditEntry), WorkflowError> {
        let touched = tx.anonymize_audit_by_actor(subject, self.clock.now()).await?;
        let record = AuditRecord::new(
            ResourceType::Actor,
            subject.as_uuid(),
            AuditAction::Anonymize,
            format!("Anonymized {touched} audit entries for data-subject request"),
        )
        .by(ctx)
        .with_metadata(serde_json::json!({ "entries_anonymized": touched }));
        let entry = self.append(tx, record).await?;

        info!(
            subject = %subject,
            entries = touched,
            correlation_id = %ctx.correlation_id,
            "Audit entries anonymized"
        );
        Ok((touched, entry))
    }

    /// Sign off on an entry that requires review. The entry itself is not
    /// touched; a second review of the same entry returns the first one.
    pub async fn mark_reviewed(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        entry_id: AuditEntryId,
        notes: Option<&str>,
    ) -> Result<AuditReview, WorkflowError> {
        let entry = tx
            .get_audit_entry(entry_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(ResourceType::AuditEntry, entry_id))?;
        if !entry.requires_review {
            return Err(WorkflowError::Validation(format!(
                "audit entry {entry_id} ({}) does not require review",
                entry.action
            )));
        }
        if let Some(existing) = tx.get_audit_review(entry_id).await? {
            debug!(entry_id = %entry_id, "Audit entry already reviewed");
            return Ok(existing);
        }

        let review = AuditReview {
            entry_id,
            resource_id: entry.resource_id,
            organization_id: entry.organization_id,
            reviewed_by: Some(ctx.actor),
            reviewed_at: self.clock.now(),
            notes: notes
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_owned),
        };
        tx.insert_audit_review(&review).await?;

        info!(
            entry_id = %entry_id,
            resource_id = %entry.resource_id,
            reviewer = %ctx.actor,
            "Audit entry reviewed"
        );
        Ok(review)
    }

    pub async fn pending_reviews(
        &self,
        tx: &mut dyn Transaction,
        organization_id: OrganizationId,
    ) -> Result<Vec<AuditEntry>, WorkflowError> {
        Ok(tx
            .list_unreviewed_audit(organization_id, PENDING_REVIEW_LIMIT)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::{InMemoryPersistence, Persistence};

    #[tokio::test]
    async fn revisions_are_contiguous_within_one_transaction() {
        let store = InMemoryPersistence::new();
        let recorder = AuditRecorder::new(Arc::new(ManualClock::default()));
        let resource = Uuid::new_v4();
        let ctx = RequestContext::new(ActorId::new());

        let mut tx = store.begin().await.unwrap();
        for n in 1..=3u64 {
            let record = AuditRecord::new(ResourceType::Ticket, resource, AuditAction::Update, "edit")
                .by(&ctx);
            let entry = recorder.append(tx.as_mut(), record).await.unwrap();
            assert_eq!(entry.revision, n);
        }
        tx.commit().await.unwrap();

        let revisions: Vec<u64> = store
            .audit_entries(resource)
            .await
            .iter()
            .map(|e| e.revision)
            .collect();
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_audit_write_is_reported() {
        let store = InMemoryPersistence::new();
        store.fail_audit_inserts(true);
        let recorder = AuditRecorder::new(Arc::new(ManualClock::default()));

        let mut tx = store.begin().await.unwrap();
        let record =
            AuditRecord::new(ResourceType::Ticket, Uuid::new_v4(), AuditAction::Submit, "submit");
        let err = recorder.append(tx.as_mut(), record).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PersistenceFailure);
    }

    #[test]
    fn acting_as_replaces_the_session_actor() {
        let session = RequestContext::new(ActorId::new()).with_name("Gateway");
        let approver = ActorId::new();
        let record = AuditRecord::new(ResourceType::Approval, Uuid::new_v4(), AuditAction::Approve, "ok")
            .by(&session)
            .acting_as(approver);
        assert_eq!(record.actor, Some(approver));
        assert_eq!(record.actor_name, None);
        assert!(record.compliance_relevant);
    }

    #[tokio::test]
    async fn only_entries_requiring_review_can_be_reviewed() {
        let store = InMemoryPersistence::new();
        let recorder = AuditRecorder::new(Arc::new(ManualClock::default()));
        let reviewer = RequestContext::new(ActorId::new());
        let org = OrganizationId::new();

        let mut tx = store.begin().await.unwrap();
        let mut decision =
            AuditRecord::new(ResourceType::Approval, Uuid::new_v4(), AuditAction::Deny, "denied");
        decision.organization_id = Some(org);
        let mut edit =
            AuditRecord::new(ResourceType::Ticket, Uuid::new_v4(), AuditAction::Update, "edit");
        edit.organization_id = Some(org);
        let decision = recorder.append(tx.as_mut(), decision).await.unwrap();
        let edit = recorder.append(tx.as_mut(), edit).await.unwrap();
        tx.commit().await.unwrap();
        assert!(decision.requires_review);
        assert!(!edit.requires_review);

        let mut tx = store.begin().await.unwrap();
        let backlog = recorder.pending_reviews(tx.as_mut(), org).await.unwrap();
        assert_eq!(backlog.iter().map(|e| e.id).collect::<Vec<_>>(), vec![decision.id]);

        let err = recorder
            .mark_reviewed(tx.as_mut(), &reviewer, edit.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);

        let review = recorder
            .mark_reviewed(tx.as_mut(), &reviewer, decision.id, Some("  matches CAB minutes "))
            .await
            .unwrap();
        assert_eq!(review.reviewed_by, Some(reviewer.actor));
        assert_eq!(review.notes.as_deref(), Some("matches CAB minutes"));

        let again = recorder
            .mark_reviewed(tx.as_mut(), &RequestContext::new(ActorId::new()), decision.id, None)
            .await
            .unwrap();
        assert_eq!(again, review);
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(recorder.pending_reviews(tx.as_mut(), org).await.unwrap().is_empty());
        let stored = store.audit_entries(decision.resource_id).await;
        assert_eq!(stored, vec![decision]);
    }
}
