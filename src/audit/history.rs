use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::model::{AuditEntry, AuditFilter};
use crate::persistence::Persistence;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Lazy, restartable walk over one resource's revisions in ascending order.
/// Pages are read on demand, each in its own short read transaction.
pub struct AuditHistory {
    persistence: Arc<dyn Persistence>,
    resource_id: Uuid,
    page_size: usize,
    cursor: u64,
    buffer: VecDeque<AuditEntry>,
    exhausted: bool,
    filter: AuditFilter,
}

impl AuditHistory {
    pub fn new(persistence: Arc<dyn Persistence>, resource_id: Uuid) -> Self {
        Self {
            persistence,
            resource_id,
            page_size: DEFAULT_PAGE_SIZE,
            cursor: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            filter: AuditFilter::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Skip entries the filter rejects; revision order is unchanged
    pub fn with_filter(mut self, filter: AuditFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn resource_id(&self) -> Uuid {
        self.resource_id
    }

    /// Next entry, or `None` once the history is exhausted
    pub async fn next(&mut self) -> Result<Option<AuditEntry>, WorkflowError> {
        loop {
            if self.buffer.is_empty() && !self.exhausted {
                self.fill().await?;
            }
            let Some(entry) = self.buffer.pop_front() else {
                return Ok(None);
            };
            self.cursor = entry.revision;
            if self.filter.matches(&entry) {
                return Ok(Some(entry));
            }
        }
    }

    /// Start again from revision 1
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.buffer.clear();
        self.exhausted = false;
    }

    pub async fn collect_all(&mut self) -> Result<Vec<AuditEntry>, WorkflowError> {
        self.rewind();
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Stream view; an error ends the stream after it is yielded
    pub fn into_stream(self) -> impl Stream<Item = Result<AuditEntry, WorkflowError>> + Send {
        stream::unfold(self, |mut history| async move {
            match history.next().await {
                Ok(Some(entry)) => Some((Ok(entry), history)),
                Ok(None) => None,
                Err(err) => {
                    history.buffer.clear();
                    history.exhausted = true;
                    Some((Err(err), history))
                }
            }
        })
    }

    async fn fill(&mut self) -> Result<(), WorkflowError> {
        let mut tx = self.persistence.begin().await?;
        let page = tx
            .list_audit(self.resource_id, self.cursor, self.page_size)
            .await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditRecord, AuditRecorder};
    use crate::clock::SystemClock;
    use crate::model::{AuditAction, AuditCategory, ResourceType};
    use crate::persistence::InMemoryPersistence;
    use futures::StreamExt;

    async fn seed(store: &InMemoryPersistence, resource: Uuid, count: u64) {
        let recorder = AuditRecorder::new(Arc::new(SystemClock));
        let mut tx = store.begin().await.unwrap();
        for _ in 0..count {
            let record = AuditRecord::new(ResourceType::Ticket, resource, AuditAction::Update, "edit");
            recorder.append(tx.as_mut(), record).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn pages_through_history_and_rewinds() {
        let store = InMemoryPersistence::new();
        let resource = Uuid::new_v4();
        seed(&store, resource, 7).await;

        let mut history = AuditHistory::new(Arc::new(store.clone()), resource).with_page_size(3);
        let first = history.next().await.unwrap().unwrap();
        assert_eq!(first.revision, 1);

        let all = history.collect_all().await.unwrap();
        let revisions: Vec<u64> = all.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, (1..=7).collect::<Vec<_>>());
        assert!(history.next().await.unwrap().is_none());

        history.rewind();
        assert_eq!(history.next().await.unwrap().unwrap().revision, 1);
    }

    #[tokio::test]
    async fn stream_yields_every_revision_once() {
        let store = InMemoryPersistence::new();
        let resource = Uuid::new_v4();
        seed(&store, resource, 5).await;

        let history = AuditHistory::new(Arc::new(store), resource).with_page_size(2);
        let revisions: Vec<u64> = history
            .into_stream()
            .map(|entry| entry.unwrap().revision)
            .collect()
            .await;
        assert_eq!(revisions, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn unknown_resource_has_empty_history() {
        let store = InMemoryPersistence::new();
        let mut history = AuditHistory::new(Arc::new(store), Uuid::new_v4());
        assert!(history.collect_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn filter_skips_entries_across_pages() {
        let store = InMemoryPersistence::new();
        let resource = Uuid::new_v4();
        let recorder = AuditRecorder::new(Arc::new(SystemClock));
        let mut tx = store.begin().await.unwrap();
        for action in [
            AuditAction::Create,
            AuditAction::Update,
            AuditAction::Update,
            AuditAction::Submit,
            AuditAction::Update,
            AuditAction::Cancel,
        ] {
            let record = AuditRecord::new(ResourceType::Ticket, resource, action, "step");
            recorder.append(tx.as_mut(), record).await.unwrap();
        }
        tx.commit().await.unwrap();

        let mut history = AuditHistory::new(Arc::new(store), resource)
            .with_page_size(2)
            .with_filter(AuditFilter {
                categories: vec![AuditCategory::Approval, AuditCategory::Lifecycle],
                ..AuditFilter::default()
            });
        let revisions: Vec<u64> = history
            .collect_all()
            .await
            .unwrap()
            .iter()
            .map(|e| e.revision)
            .collect();
        assert_eq!(revisions, vec![4, 6]);
    }
}
