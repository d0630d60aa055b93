use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{Conflict, Persistence, PersistenceError, Transaction};
use crate::model::{
    ActorId, Approval, ApprovalFilter, ApprovalId, ApprovalQueueItem, AuditEntry, AuditEntryId,
    AuditReview, Comment, CommentId, OrganizationId, Ticket, TicketId, TicketNumber,
};

#[derive(Debug, Default)]
struct MemoryState {
    tickets: HashMap<TicketId, Ticket>,
    approvals: HashMap<ApprovalId, Approval>,
    audit: HashMap<Uuid, Vec<AuditEntry>>,
    reviews: HashMap<AuditEntryId, AuditReview>,
    comments: HashMap<CommentId, Comment>,
}

impl MemoryState {
    fn latest_revision(&self, resource_id: &Uuid) -> u64 {
        self.audit
            .get(resource_id)
            .and_then(|entries| entries.last())
            .map(|entry| entry.revision)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_approval_inserts: AtomicBool,
    fail_audit_inserts: AtomicBool,
    latency_ms: AtomicU64,
}

/// Reference adapter: read-committed reads, optimistic validation at commit
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    state: Arc<RwLock<MemoryState>>,
    faults: Arc<Faults>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `insert_approvals` fail, as a storage outage would
    pub fn fail_approval_inserts(&self, fail: bool) {
        self.faults.fail_approval_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_audit_inserts(&self, fail: bool) {
        self.faults.fail_audit_inserts.store(fail, Ordering::SeqCst);
    }

    /// Delay applied when a transaction begins
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub async fn ticket_count(&self) -> usize {
        self.state.read().await.tickets.len()
    }

    pub async fn audit_entries(&self, resource_id: Uuid) -> Vec<AuditEntry> {
        self.state
            .read()
            .await
            .audit
            .get(&resource_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn begin(&self) -> Result<Box<dyn Transaction>, PersistenceError> {
        let latency = self.faults.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
            tickets: HashMap::new(),
            approvals: HashMap::new(),
            audit: Vec::new(),
            reviews: HashMap::new(),
            comments: HashMap::new(),
            anonymizations: Vec::new(),
        }))
    }
}

#[derive(Debug)]
enum Staged<T> {
    Insert(T),
    Update { value: T, expected: u64 },
}

impl<T> Staged<T> {
    fn value(&self) -> &T {
        match self {
            Staged::Insert(value) | Staged::Update { value, .. } => value,
        }
    }

    fn value_mut(&mut self) -> &mut T {
        match self {
            Staged::Insert(value) | Staged::Update { value, .. } => value,
        }
    }
}

pub struct MemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    faults: Arc<Faults>,
    tickets: HashMap<TicketId, Staged<Ticket>>,
    approvals: HashMap<ApprovalId, Staged<Approval>>,
    audit: Vec<AuditEntry>,
    reviews: HashMap<AuditEntryId, AuditReview>,
    comments: HashMap<CommentId, Comment>,
    anonymizations: Vec<(ActorId, DateTime<Utc>)>,
}

impl MemoryTransaction {
    fn staged_tickets(&self) -> impl Iterator<Item = &Ticket> {
        self.tickets.values().map(Staged::value)
    }

    fn staged_numbers(&self, organization_id: OrganizationId) -> impl Iterator<Item = TicketNumber> + '_ {
        self.staged_tickets()
            .filter(move |t| t.organization_id == organization_id)
            .map(|t| t.number)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get_ticket(&mut self, id: TicketId) -> Result<Option<Ticket>, PersistenceError> {
        if let Some(staged) = self.tickets.get(&id) {
            return Ok(Some(staged.value().clone()));
        }
        Ok(self.state.read().await.tickets.get(&id).cloned())
    }

    async fn insert_ticket(&mut self, ticket: &Ticket) -> Result<(), PersistenceError> {
        let exists = self.tickets.contains_key(&ticket.id)
            || self.state.read().await.tickets.contains_key(&ticket.id);
        if exists {
            return Err(PersistenceError::Rejected {
                reason: format!("ticket {} already exists", ticket.id),
            });
        }
        self.tickets.insert(ticket.id, Staged::Insert(ticket.clone()));
        Ok(())
    }

    async fn update_ticket(
        &mut self,
        ticket: &Ticket,
        expected_version: u64,
    ) -> Result<(), PersistenceError> {
        if let Some(staged) = self.tickets.get_mut(&ticket.id) {
            let found = staged.value().version;
            if found != expected_version {
                return Err(Conflict::TicketVersion {
                    ticket_id: ticket.id,
                    expected: expected_version,
                    found,
                }
                .into());
            }
            *staged.value_mut() = ticket.clone();
            return Ok(());
        }

        let found = match self.state.read().await.tickets.get(&ticket.id) {
            Some(current) => current.version,
            None => {
                return Err(PersistenceError::Rejected {
                    reason: format!("ticket {} does not exist", ticket.id),
                })
            }
        };
        if found != expected_version {
            return Err(Conflict::TicketVersion {
                ticket_id: ticket.id,
                expected: expected_version,
                found,
            }
            .into());
        }
        self.tickets.insert(
            ticket.id,
            Staged::Update {
                value: ticket.clone(),
                expected: expected_version,
            },
        );
        Ok(())
    }

    async fn max_ticket_sequence(
        &mut self,
        organization_id: OrganizationId,
        year: i32,
    ) -> Result<Option<u32>, PersistenceError> {
        let state = self.state.read().await;
        let committed = state
            .tickets
            .values()
            .filter(|t| t.organization_id == organization_id)
            .map(|t| t.number);
        let max = committed
            .chain(self.staged_numbers(organization_id))
            .filter(|number| number.year == year)
            .map(|number| number.sequence)
            .max();
        Ok(max)
    }

    async fn ticket_number_taken(
        &mut self,
        organization_id: OrganizationId,
        number: TicketNumber,
    ) -> Result<bool, PersistenceError> {
        if self.staged_numbers(organization_id).any(|n| n == number) {
            return Ok(true);
        }
        let state = self.state.read().await;
        Ok(state
            .tickets
            .values()
            .any(|t| t.organization_id == organization_id && t.number == number))
    }

    async fn insert_approvals(&mut self, approvals: &[Approval]) -> Result<(), PersistenceError> {
        if self.faults.fail_approval_inserts.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable {
                reason: "approval table rejected the write".to_string(),
            });
        }
        for approval in approvals {
            if self.approvals.contains_key(&approval.id) {
                return Err(PersistenceError::Rejected {
                    reason: format!("approval {} staged twice", approval.id),
                });
            }
        }
        for approval in approvals {
            self.approvals
                .insert(approval.id, Staged::Insert(approval.clone()));
        }
        Ok(())
    }

    async fn get_approval(&mut self, id: ApprovalId) -> Result<Option<Approval>, PersistenceError> {
        if let Some(staged) = self.approvals.get(&id) {
            return Ok(Some(staged.value().clone()));
        }
        Ok(self.state.read().await.approvals.get(&id).cloned())
    }

    async fn find_approval_by_token_hash(
        &mut self,
        token_hash: &str,
    ) -> Result<Option<Approval>, PersistenceError> {
        let staged = self
            .approvals
            .values()
            .map(Staged::value)
            .find(|a| a.token_hash.as_deref() == Some(token_hash));
        if let Some(approval) = staged {
            return Ok(Some(approval.clone()));
        }
        let state = self.state.read().await;
        Ok(state
            .approvals
            .values()
            .filter(|a| !self.approvals.contains_key(&a.id))
            .find(|a| a.token_hash.as_deref() == Some(token_hash))
            .cloned())
    }

    async fn list_approvals(
        &mut self,
        ticket_id: TicketId,
    ) -> Result<Vec<Approval>, PersistenceError> {
        let state = self.state.read().await;
        let mut rows: Vec<Approval> = state
            .approvals
            .values()
            .filter(|a| a.ticket_id == ticket_id && !self.approvals.contains_key(&a.id))
            .cloned()
            .collect();
        rows.extend(
            self.approvals
                .values()
                .map(Staged::value)
                .filter(|a| a.ticket_id == ticket_id)
                .cloned(),
        );
        rows.sort_by_key(|a| (a.round, a.sequence_order));
        Ok(rows)
    }

    async fn update_approval(
        &mut self,
        approval: &Approval,
        expected_version: u64,
    ) -> Result<(), PersistenceError> {
        if let Some(staged) = self.approvals.get_mut(&approval.id) {
            let found = staged.value().version;
            if found != expected_version {
                return Err(Conflict::ApprovalVersion {
                    approval_id: approval.id,
                    expected: expected_version,
                    found,
                }
                .into());
            }
            *staged.value_mut() = approval.clone();
            return Ok(());
        }

        let found = match self.state.read().await.approvals.get(&approval.id) {
            Some(current) => current.version,
            None => {
                return Err(PersistenceError::Rejected {
                    reason: format!("approval {} does not exist", approval.id),
                })
            }
        };
        if found != expected_version {
            return Err(Conflict::ApprovalVersion {
                approval_id: approval.id,
                expected: expected_version,
                found,
            }
            .into());
        }
        self.approvals.insert(
            approval.id,
            Staged::Update {
                value: approval.clone(),
                expected: expected_version,
            },
        );
        Ok(())
    }

    async fn query_approvals(
        &mut self,
        filter: &ApprovalFilter,
    ) -> Result<(Vec<ApprovalQueueItem>, u64), PersistenceError> {
        let state = self.state.read().await;
        let approvals = state
            .approvals
            .values()
            .filter(|a| !self.approvals.contains_key(&a.id))
            .chain(self.approvals.values().map(Staged::value))
            .filter(|a| filter.matches(a));

        let mut items: Vec<ApprovalQueueItem> = approvals
            .filter_map(|approval| {
                let ticket = self
                    .tickets
                    .get(&approval.ticket_id)
                    .map(Staged::value)
                    .or_else(|| state.tickets.get(&approval.ticket_id))
                    .filter(|t| t.deleted_at.is_none())?;
                Some(ApprovalQueueItem {
                    approval: approval.clone(),
                    ticket_number: ticket.number,
                    ticket_title: ticket.title.clone(),
                    priority: ticket.priority,
                    risk_level: ticket.risk_level,
                })
            })
            .collect();
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.approval.created_at.cmp(&b.approval.created_at))
                .then(a.ticket_number.cmp(&b.ticket_number))
                .then(a.approval.sequence_order.cmp(&b.approval.sequence_order))
        });

        let total = items.len() as u64;
        let page = items
            .into_iter()
            .skip(filter.offset())
            .take(filter.per_page as usize)
            .collect();
        Ok((page, total))
    }

    async fn next_revision(&mut self, resource_id: Uuid) -> Result<u64, PersistenceError> {
        let staged = self
            .audit
            .iter()
            .filter(|e| e.resource_id == resource_id)
            .map(|e| e.revision)
            .max();
        let latest = match staged {
            Some(revision) => revision,
            None => self.state.read().await.latest_revision(&resource_id),
        };
        Ok(latest + 1)
    }

    async fn insert_audit(&mut self, entry: &AuditEntry) -> Result<(), PersistenceError> {
        if self.faults.fail_audit_inserts.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable {
                reason: "audit log rejected the write".to_string(),
            });
        }
        self.audit.push(entry.clone());
        Ok(())
    }

    async fn list_audit(
        &mut self,
        resource_id: Uuid,
        after_revision: u64,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, PersistenceError> {
        let state = self.state.read().await;
        let mut entries: Vec<AuditEntry> = state
            .audit
            .get(&resource_id)
            .into_iter()
            .flatten()
            .chain(self.audit.iter().filter(|e| e.resource_id == resource_id))
            .filter(|e| e.revision > after_revision)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.revision);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn get_audit_entry(
        &mut self,
        id: AuditEntryId,
    ) -> Result<Option<AuditEntry>, PersistenceError> {
        if let Some(entry) = self.audit.iter().find(|e| e.id == id) {
            return Ok(Some(entry.clone()));
        }
        let state = self.state.read().await;
        Ok(state.audit.values().flatten().find(|e| e.id == id).cloned())
    }

    async fn get_audit_review(
        &mut self,
        entry_id: AuditEntryId,
    ) -> Result<Option<AuditReview>, PersistenceError> {
        if let Some(review) = self.reviews.get(&entry_id) {
            return Ok(Some(review.clone()));
        }
        Ok(self.state.read().await.reviews.get(&entry_id).cloned())
    }

    async fn insert_audit_review(&mut self, review: &AuditReview) -> Result<(), PersistenceError> {
        if self.reviews.contains_key(&review.entry_id) {
            return Err(Conflict::AlreadyReviewed {
                entry_id: review.entry_id,
            }
            .into());
        }
        self.reviews.insert(review.entry_id, review.clone());
        Ok(())
    }

    async fn list_unreviewed_audit(
        &mut self,
        organization_id: OrganizationId,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, PersistenceError> {
        let state = self.state.read().await;
        let mut entries: Vec<AuditEntry> = state
            .audit
            .values()
            .flatten()
            .chain(self.audit.iter())
            .filter(|e| e.organization_id == Some(organization_id) && e.requires_review)
            .filter(|e| !state.reviews.contains_key(&e.id) && !self.reviews.contains_key(&e.id))
            .cloned()
            .collect();
        entries.sort_by_key(|e| (e.created_at, e.revision));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn anonymize_audit_by_actor(
        &mut self,
        actor: ActorId,
        at: DateTime<Utc>,
    ) -> Result<u64, PersistenceError> {
        let committed = {
            let state = self.state.read().await;
            state
                .audit
                .values()
                .flatten()
                .filter(|e| e.mentions(actor))
                .count()
        };
        let mut touched = committed as u64;
        for entry in self.audit.iter_mut() {
            if entry.forget(actor, at) {
                touched += 1;
            }
        }
        for review in self.reviews.values_mut() {
            if review.reviewed_by == Some(actor) {
                review.reviewed_by = None;
            }
        }
        self.anonymizations.push((actor, at));
        Ok(touched)
    }

    async fn insert_comment(&mut self, comment: &Comment) -> Result<(), PersistenceError> {
        self.comments.insert(comment.id, comment.clone());
        Ok(())
    }

    async fn get_comment(&mut self, id: CommentId) -> Result<Option<Comment>, PersistenceError> {
        if let Some(comment) = self.comments.get(&id) {
            return Ok(Some(comment.clone()));
        }
        Ok(self.state.read().await.comments.get(&id).cloned())
    }

    async fn update_comment(&mut self, comment: &Comment) -> Result<(), PersistenceError> {
        self.comments.insert(comment.id, comment.clone());
        Ok(())
    }

    async fn list_comments(
        &mut self,
        ticket_id: TicketId,
    ) -> Result<Vec<Comment>, PersistenceError> {
        let state = self.state.read().await;
        let mut comments: Vec<Comment> = state
            .comments
            .values()
            .filter(|c| c.ticket_id == ticket_id && !self.comments.contains_key(&c.id))
            .cloned()
            .collect();
        comments.extend(
            self.comments
                .values()
                .filter(|c| c.ticket_id == ticket_id)
                .cloned(),
        );
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn commit(self: Box<Self>) -> Result<(), PersistenceError> {
        let this = *self;
        let mut state = this.state.write().await;

        let mut live_slots = HashSet::new();
        for staged in this.approvals.values() {
            match staged {
                Staged::Update { value, expected } => {
                    let found = state
                        .approvals
                        .get(&value.id)
                        .map(|a| a.version)
                        .unwrap_or_default();
                    if found != *expected {
                        return Err(Conflict::ApprovalVersion {
                            approval_id: value.id,
                            expected: *expected,
                            found,
                        }
                        .into());
                    }
                }
                Staged::Insert(value) => {
                    let slot = (value.ticket_id, value.approval_type, value.round);
                    let taken = state.approvals.values().any(|a| {
                        a.ticket_id == value.ticket_id
                            && a.approval_type == value.approval_type
                            && a.round == value.round
                    });
                    if taken || !live_slots.insert(slot) {
                        return Err(Conflict::DuplicateApproval {
                            ticket_id: value.ticket_id,
                            approval_type: value.approval_type,
                            round: value.round,
                        }
                        .into());
                    }
                }
            }
        }

        for staged in this.tickets.values() {
            match staged {
                Staged::Update { value, expected } => {
                    let found = state
                        .tickets
                        .get(&value.id)
                        .map(|t| t.version)
                        .unwrap_or_default();
                    if found != *expected {
                        return Err(Conflict::TicketVersion {
                            ticket_id: value.id,
                            expected: *expected,
                            found,
                        }
                        .into());
                    }
                }
                Staged::Insert(value) => {
                    let taken = state.tickets.values().any(|t| {
                        t.organization_id == value.organization_id && t.number == value.number
                    });
                    if taken {
                        return Err(Conflict::DuplicateTicketNumber {
                            ticket_id: value.id,
                            organization_id: value.organization_id,
                            number: value.number,
                        }
                        .into());
                    }
                }
            }
        }

        let mut appended: BTreeMap<Uuid, Vec<AuditEntry>> = BTreeMap::new();
        for entry in &this.audit {
            appended.entry(entry.resource_id).or_default().push(entry.clone());
        }
        for entries in appended.values_mut() {
            entries.sort_by_key(|e| e.revision);
            let mut latest = entries
                .first()
                .map(|e| state.latest_revision(&e.resource_id))
                .unwrap_or_default();
            for entry in entries.iter() {
                if entry.revision != latest + 1 {
                    return Err(Conflict::AuditRevision {
                        resource_type: entry.resource_type,
                        resource_id: entry.resource_id,
                        attempted: entry.revision,
                        latest,
                    }
                    .into());
                }
                latest = entry.revision;
            }
        }

        for entry_id in this.reviews.keys() {
            if state.reviews.contains_key(entry_id) {
                return Err(Conflict::AlreadyReviewed {
                    entry_id: *entry_id,
                }
                .into());
            }
        }

        let (tickets, approvals, comments) = (
            this.tickets.len(),
            this.approvals.len(),
            this.comments.len(),
        );
        for (id, staged) in this.tickets {
            let ticket = match staged {
                Staged::Insert(value) | Staged::Update { value, .. } => value,
            };
            state.tickets.insert(id, ticket);
        }
        for (id, staged) in this.approvals {
            let approval = match staged {
                Staged::Insert(value) | Staged::Update { value, .. } => value,
            };
            state.approvals.insert(id, approval);
        }
        let audit_entries = this.audit.len();
        for (resource_id, entries) in appended {
            state.audit.entry(resource_id).or_default().extend(entries);
        }
        for (id, comment) in this.comments {
            state.comments.insert(id, comment);
        }
        let reviews = this.reviews.len();
        state.reviews.extend(this.reviews);
        for (actor, at) in this.anonymizations {
            for entry in state.audit.values_mut().flatten() {
                entry.forget(actor, at);
            }
            for review in state.reviews.values_mut() {
                if review.reviewed_by == Some(actor) {
                    review.reviewed_by = None;
                }
            }
        }

        debug!(
            tickets,
            approvals, comments, audit_entries, reviews, "In-memory transaction committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApprovalType, AuditAction, ChangeSet, NewTicket, ResourceType, TicketStatus};
    use crate::model::{Priority, RiskLevel};

    fn ticket(number: u32) -> Ticket {
        let now = Utc::now();
        let input = NewTicket::new(OrganizationId::new(), "Rotate TLS certificates");
        Ticket {
            id: TicketId::new(),
            organization_id: input.organization_id,
            number: TicketNumber::new(2025, number),
            created_by: ActorId::new(),
            title: input.title,
            description: String::new(),
            status: TicketStatus::Draft,
            priority: Priority::Normal,
            risk_level: RiskLevel::Medium,
            compliance_frameworks: Vec::new(),
            change_type: None,
            affected_systems: Vec::new(),
            impact_description: None,
            rollback_plan: None,
            testing_plan: None,
            requires_approval_types: Vec::new(),
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
        }
    }

    fn entry(resource_id: Uuid, revision: u64) -> AuditEntry {
        AuditEntry {
            id: crate::model::AuditEntryId::new(),
            organization_id: None,
            resource_type: ResourceType::Ticket,
            resource_id,
            revision,
            actor: None,
            actor_name: None,
            action: AuditAction::Update,
            description: "edit".into(),
            changes: ChangeSet::default(),
            metadata: serde_json::Value::Null,
            ip_address: None,
            user_agent: None,
            correlation_id: None,
            compliance_relevant: false,
            compliance_frameworks: Vec::new(),
            requires_review: false,
            created_at: Utc::now(),
            anonymized: false,
            anonymized_at: None,
        }
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_and_dropped() {
        let store = InMemoryPersistence::new();
        let t = ticket(1);

        let mut tx = store.begin().await.unwrap();
        tx.insert_ticket(&t).await.unwrap();
        assert!(tx.get_ticket(t.id).await.unwrap().is_some());

        let mut other = store.begin().await.unwrap();
        assert!(other.get_ticket(t.id).await.unwrap().is_none());

        drop(tx);
        assert_eq!(store.ticket_count().await, 0);
    }

    #[tokio::test]
    async fn stale_ticket_version_fails_at_commit() {
        let store = InMemoryPersistence::new();
        let t = ticket(1);
        let mut tx = store.begin().await.unwrap();
        tx.insert_ticket(&t).await.unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let mut bumped = t.clone();
        bumped.version = 2;
        first.update_ticket(&bumped, 1).await.unwrap();
        second.update_ticket(&bumped, 1).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(
            err.as_conflict(),
            Some(Conflict::TicketVersion { expected: 1, found: 2, .. })
        ));
    }

    #[tokio::test]
    async fn audit_revisions_must_extend_committed_history() {
        let store = InMemoryPersistence::new();
        let resource = Uuid::new_v4();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let r1 = first.next_revision(resource).await.unwrap();
        let r2 = second.next_revision(resource).await.unwrap();
        assert_eq!((r1, r2), (1, 1));
        first.insert_audit(&entry(resource, r1)).await.unwrap();
        second.insert_audit(&entry(resource, r2)).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(
            err.as_conflict(),
            Some(Conflict::AuditRevision { attempted: 1, latest: 1, .. })
        ));
        assert_eq!(store.audit_entries(resource).await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_ticket_numbers_are_rejected() {
        let store = InMemoryPersistence::new();
        let a = ticket(7);
        let mut b = ticket(7);
        b.organization_id = a.organization_id;

        let mut tx = store.begin().await.unwrap();
        tx.insert_ticket(&a).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx
            .ticket_number_taken(a.organization_id, a.number)
            .await
            .unwrap());
        assert_eq!(
            tx.max_ticket_sequence(a.organization_id, 2025).await.unwrap(),
            Some(7)
        );
        tx.insert_ticket(&b).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(
            err.as_conflict(),
            Some(Conflict::DuplicateTicketNumber { .. })
        ));
    }

    #[tokio::test]
    async fn one_live_approval_per_type_and_round() {
        let store = InMemoryPersistence::new();
        let ticket_id = TicketId::new();
        let now = Utc::now();
        let first = Approval::pending(ticket_id, ApprovalType::It, 1, 1, ActorId::new(), None, now);
        let twin = Approval::pending(ticket_id, ApprovalType::It, 2, 1, ActorId::new(), None, now);

        let mut tx = store.begin().await.unwrap();
        tx.insert_approvals(&[first, twin]).await.unwrap();
        let err = tx.commit().await.unwrap_err();
        assert!(matches!(
            err.as_conflict(),
            Some(Conflict::DuplicateApproval { round: 1, .. })
        ));
    }

    #[tokio::test]
    async fn injected_approval_failure_surfaces_as_unavailable() {
        let store = InMemoryPersistence::new();
        store.fail_approval_inserts(true);
        let approval = Approval::pending(
            TicketId::new(),
            ApprovalType::Cloud,
            1,
            1,
            ActorId::new(),
            None,
            Utc::now(),
        );
        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_approvals(&[approval]).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn concurrent_reviews_of_one_entry_conflict() {
        let store = InMemoryPersistence::new();
        let mut seeded = entry(Uuid::new_v4(), 1);
        seeded.requires_review = true;
        let mut tx = store.begin().await.unwrap();
        tx.insert_audit(&seeded).await.unwrap();
        tx.commit().await.unwrap();

        let review = |by: ActorId| AuditReview {
            entry_id: seeded.id,
            resource_id: seeded.resource_id,
            organization_id: None,
            reviewed_by: Some(by),
            reviewed_at: Utc::now(),
            notes: None,
        };
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.insert_audit_review(&review(ActorId::new())).await.unwrap();
        second.insert_audit_review(&review(ActorId::new())).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert_eq!(
            err.as_conflict(),
            Some(&Conflict::AlreadyReviewed { entry_id: seeded.id })
        );
    }

    #[tokio::test]
    async fn queue_joins_tickets_and_pages_by_priority() {
        let store = InMemoryPersistence::new();
        let approver = ActorId::new();
        let mut low = ticket(1);
        low.priority = Priority::Low;
        let mut urgent = ticket(2);
        urgent.priority = Priority::Urgent;

        let mut tx = store.begin().await.unwrap();
        for t in [&low, &urgent] {
            tx.insert_ticket(t).await.unwrap();
            let approval =
                Approval::pending(t.id, ApprovalType::Risk, 1, 1, approver, None, Utc::now());
            tx.insert_approvals(&[approval]).await.unwrap();
        }
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let filter = ApprovalFilter::pending_for(approver).on_page(1, 1).normalized();
        let (page, total) = tx.query_approvals(&filter).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].approval.ticket_id, urgent.id);
        assert_eq!(page[0].priority, Priority::Urgent);

        let (others, total) = tx
            .query_approvals(&ApprovalFilter::pending_for(ActorId::new()).normalized())
            .await
            .unwrap();
        assert!(others.is_empty());
        assert_eq!(total, 0);
    }
}
