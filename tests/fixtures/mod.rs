#![allow(dead_code)]
//! Shared engine harness for integration tests

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use changeflow::{
    ActorId, Approval, ApprovalType, ApproverAssignment, ChangeEngine, ChangeflowConfig,
    InMemoryPersistence, ManualClock, NewTicket, NotificationEvent, OrganizationId, QueueNotifier,
    RequestContext, StaticApproverDirectory, Ticket,
};

pub struct Harness {
    pub engine: ChangeEngine,
    pub store: InMemoryPersistence,
    pub clock: ManualClock,
    pub org: OrganizationId,
    pub requester: RequestContext,
    pub security: ActorId,
    pub it: ActorId,
    pub operations: ActorId,
    pub inbox: UnboundedReceiver<NotificationEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ChangeflowConfig::default())
    }

    pub fn with_config(config: ChangeflowConfig) -> Self {
        let store = InMemoryPersistence::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap());
        let (notifier, inbox) = QueueNotifier::channel();

        let security = ActorId::new();
        let it = ActorId::new();
        let operations = ActorId::new();
        let directory = StaticApproverDirectory::default()
            .with(ApprovalType::Security, assignment(security))
            .with(ApprovalType::It, assignment(it))
            .with(ApprovalType::Operations, assignment(operations));

        let engine = ChangeEngine::builder(Arc::new(store.clone()))
            .with_config(config)
            .with_clock(Arc::new(clock.clone()))
            .with_notifier(Arc::new(notifier))
            .with_directory(Arc::new(directory))
            .build();

        Self {
            engine,
            store,
            clock,
            org: OrganizationId::new(),
            requester: RequestContext::new(ActorId::new()).with_name("Riley Requester"),
            security,
            it,
            operations,
            inbox,
        }
    }

    pub fn as_actor(&self, actor: ActorId) -> RequestContext {
        RequestContext::new(actor)
    }

    pub fn approver_of(&self, approval_type: ApprovalType) -> RequestContext {
        let actor = match approval_type {
            ApprovalType::Security => self.security,
            ApprovalType::It => self.it,
            ApprovalType::Operations => self.operations,
            other => panic!("no approver configured for {other}"),
        };
        RequestContext::new(actor)
    }

    pub async fn draft(&self, types: &[ApprovalType]) -> Ticket {
        let input = NewTicket::new(self.org, "Rotate database credentials")
            .with_description("Quarterly credential rotation for the ledger database")
            .with_rollback_plan("Restore previous secret version")
            .requiring(types.iter().copied());
        self.engine
            .create_draft(&self.requester, input)
            .await
            .expect("draft created")
    }

    /// Draft and submit, returning the submitted ticket and its round's rows
    pub async fn submitted(&self, types: &[ApprovalType]) -> (Ticket, Vec<Approval>) {
        let draft = self.draft(types).await;
        let ticket = self
            .engine
            .submit(&self.requester, draft.id)
            .await
            .expect("ticket submitted");
        let approvals = self
            .engine
            .list_approvals(&self.requester, ticket.id)
            .await
            .expect("approvals listed");
        (ticket, approvals)
    }

    /// Wait for the next delivered notification
    pub async fn next_event(&mut self) -> NotificationEvent {
        tokio::time::timeout(Duration::from_secs(2), self.inbox.recv())
            .await
            .expect("notification delivered in time")
            .expect("notifier still open")
    }

    /// Let pending delivery tasks run, then drain everything received so far
    pub async fn drain_inbox(&mut self) -> Vec<NotificationEvent> {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let mut events = Vec::new();
        while let Ok(event) = self.inbox.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn assignment(approver_id: ActorId) -> ApproverAssignment {
    ApproverAssignment {
        approver_id,
        delegated_from: None,
    }
}

pub fn row(approvals: &[Approval], approval_type: ApprovalType) -> &Approval {
    approvals
        .iter()
        .rev()
        .find(|a| a.approval_type == approval_type)
        .expect("approval of requested type")
}
