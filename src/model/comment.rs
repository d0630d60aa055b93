use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ActorId, CommentId, TicketId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRevision {
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

/// Free-text note on a ticket, separate from approval decision comments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub ticket_id: TicketId,
    pub author_id: ActorId,
    pub content: String,
    /// Visible to approvers and operators only
    pub internal: bool,
    pub edited: bool,
    #[serde(default)]
    pub edit_history: Vec<CommentRevision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn new(
        ticket_id: TicketId,
        author_id: ActorId,
        content: String,
        internal: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CommentId::new(),
            ticket_id,
            author_id,
            content,
            internal,
            edited: false,
            edit_history: Vec::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
