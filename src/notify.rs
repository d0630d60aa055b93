use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::metrics::EngineMetrics;
use crate::model::{
    ActorId, ApprovalId, ApprovalType, CommentId, Decision, TicketId, TicketNumber, TicketStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    TicketSubmitted {
        ticket_id: TicketId,
        number: TicketNumber,
        round: u32,
    },
    ApprovalRequested {
        ticket_id: TicketId,
        approval_id: ApprovalId,
        approval_type: ApprovalType,
        approver_id: ActorId,
    },
    /// Carries the plaintext token so the delivery side can build the link
    TokenIssued {
        ticket_id: TicketId,
        approval_id: ApprovalId,
        recipient: ActorId,
        token: String,
        expires_at: DateTime<Utc>,
    },
    DecisionRecorded {
        ticket_id: TicketId,
        approval_id: ApprovalId,
        decision: Decision,
        actor: ActorId,
        via_token: bool,
    },
    StatusChanged {
        ticket_id: TicketId,
        number: TicketNumber,
        from: TicketStatus,
        to: TicketStatus,
    },
    CommentAdded {
        ticket_id: TicketId,
        comment_id: CommentId,
        author: ActorId,
        internal: bool,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::TicketSubmitted { .. } => "ticket_submitted",
            NotificationEvent::ApprovalRequested { .. } => "approval_requested",
            NotificationEvent::TokenIssued { .. } => "token_issued",
            NotificationEvent::DecisionRecorded { .. } => "decision_recorded",
            NotificationEvent::StatusChanged { .. } => "status_changed",
            NotificationEvent::CommentAdded { .. } => "comment_added",
        }
    }

    pub fn ticket_id(&self) -> TicketId {
        match self {
            NotificationEvent::TicketSubmitted { ticket_id, .. }
            | NotificationEvent::ApprovalRequested { ticket_id, .. }
            | NotificationEvent::TokenIssued { ticket_id, .. }
            | NotificationEvent::DecisionRecorded { ticket_id, .. }
            | NotificationEvent::StatusChanged { ticket_id, .. }
            | NotificationEvent::CommentAdded { ticket_id, .. } => *ticket_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Notification outbox closed")]
    Closed,
}

/// Outbound side of the engine. Implementations deliver email, chat, webhooks.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Logs events and delivers nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        info!(event = event.kind(), ticket_id = %event.ticket_id(), "Notification");
        Ok(())
    }
}

/// Hands events to a delivery worker through an unbounded channel
#[derive(Debug, Clone)]
pub struct QueueNotifier {
    outbox: mpsc::UnboundedSender<NotificationEvent>,
}

impl QueueNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        (Self { outbox }, inbox)
    }
}

#[async_trait]
impl Notifier for QueueNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.outbox
            .send(event.clone())
            .map_err(|_| NotifyError::Closed)
    }
}

/// Fire-and-forget publishing. Delivery runs on its own task, bounded by a
/// timeout; failures are logged and counted but never reach the caller.
#[derive(Clone)]
pub struct Notifications {
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    metrics: Arc<EngineMetrics>,
}

impl Notifications {
    pub fn new(notifier: Arc<dyn Notifier>, timeout: Duration, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            notifier,
            timeout,
            metrics,
        }
    }

    /// Deliver `events` in order on a background task
    pub fn publish(&self, events: Vec<NotificationEvent>) -> Option<JoinHandle<()>> {
        if events.is_empty() {
            return None;
        }
        let notifier = Arc::clone(&self.notifier);
        let metrics = Arc::clone(&self.metrics);
        let timeout = self.timeout;

        Some(tokio::spawn(async move {
            for event in events {
                deliver(notifier.as_ref(), &metrics, timeout, &event).await;
            }
        }))
    }
}

async fn deliver(
    notifier: &dyn Notifier,
    metrics: &EngineMetrics,
    timeout: Duration,
    event: &NotificationEvent,
) {
    match tokio::time::timeout(timeout, notifier.notify(event)).await {
        Ok(Ok(())) => debug!(event = event.kind(), "Notification delivered"),
        Ok(Err(err)) => {
            warn!(event = event.kind(), ticket_id = %event.ticket_id(), error = %err, "Notification failed");
            metrics.record_notification_failure();
        }
        Err(_) => {
            warn!(
                event = event.kind(),
                ticket_id = %event.ticket_id(),
                timeout_ms = timeout.as_millis() as u64,
                "Notification timed out"
            );
            metrics.record_notification_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event() -> NotificationEvent {
        NotificationEvent::StatusChanged {
            ticket_id: TicketId::new(),
            number: TicketNumber::new(2025, 1),
            from: TicketStatus::Draft,
            to: TicketStatus::Submitted,
        }
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let mut mock = MockNotifier::new();
        mock.expect_notify()
            .times(2)
            .returning(|_| Err(NotifyError::Delivery("smtp down".into())));
        let metrics = Arc::new(EngineMetrics::new());
        let notifications =
            Notifications::new(Arc::new(mock), Duration::from_millis(200), Arc::clone(&metrics));

        let handle = notifications.publish(vec![status_event(), status_event()]).unwrap();
        handle.await.unwrap();
        assert_eq!(metrics.snapshot().notification_failures, 2);
    }

    #[tokio::test]
    async fn queue_notifier_preserves_order() {
        let (notifier, mut inbox) = QueueNotifier::channel();
        let metrics = Arc::new(EngineMetrics::new());
        let notifications =
            Notifications::new(Arc::new(notifier), Duration::from_millis(200), metrics);

        let first = status_event();
        let second = status_event();
        notifications
            .publish(vec![first.clone(), second.clone()])
            .unwrap()
            .await
            .unwrap();

        assert_eq!(inbox.recv().await, Some(first));
        assert_eq!(inbox.recv().await, Some(second));
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(status_event()).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["to"], "submitted");
    }

    #[tokio::test]
    async fn nothing_to_publish_spawns_nothing() {
        let notifications = Notifications::new(
            Arc::new(TracingNotifier),
            Duration::from_millis(10),
            Arc::new(EngineMetrics::new()),
        );
        assert!(notifications.publish(Vec::new()).is_none());
    }
}
