use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::audit::{AuditRecord, AuditRecorder};
use crate::clock::Clock;
use crate::config::CommentConfig;
use crate::context::RequestContext;
use crate::error::WorkflowError;
use crate::model::{
    AuditAction, Comment, CommentId, CommentRevision, ResourceType, Ticket, TicketId,
};
use crate::persistence::Transaction;

/// Ticket comments. Every change is audited on the comment's own history.
#[derive(Clone)]
pub struct CommentService {
    recorder: AuditRecorder,
    clock: Arc<dyn Clock>,
    config: CommentConfig,
}

impl CommentService {
    pub fn new(recorder: AuditRecorder, clock: Arc<dyn Clock>, config: CommentConfig) -> Self {
        Self {
            recorder,
            clock,
            config,
        }
    }

    pub async fn add_comment(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        ticket_id: TicketId,
        content: &str,
        internal: bool,
    ) -> Result<(Ticket, Comment), WorkflowError> {
        let ticket = load_ticket(tx, ticket_id).await?;
        let content = required(content)?;

        let comment = Comment::new(ticket.id, ctx.actor, content, internal, self.clock.now());
        tx.insert_comment(&comment).await?;

        let record = AuditRecord::for_comment(
            &comment,
            &ticket,
            AuditAction::CommentAdded,
            format!("Comment added to {}", ticket.number),
        )
        .by(ctx)
        .with_changes(None, Some(json!({ "content": comment.content, "internal": internal })));
        self.recorder.append(tx, record).await?;

        info!(comment_id = %comment.id, ticket_id = %ticket.id, internal, "Comment added");
        Ok((ticket, comment))
    }

    /// Author only, within the configured window; the previous text is kept
    pub async fn edit_comment(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        comment_id: CommentId,
        content: &str,
    ) -> Result<Comment, WorkflowError> {
        let mut comment = load_comment(tx, comment_id).await?;
        if comment.author_id != ctx.actor {
            return Err(WorkflowError::NotAuthorized {
                actor: ctx.actor,
                reason: "only the author can edit a comment".to_string(),
            });
        }
        let now = self.clock.now();
        let expired = match self.config.edit_window() {
            Some(window) => now.signed_duration_since(comment.created_at) > window,
            None => false,
        };
        if expired {
            return Err(WorkflowError::EditWindowClosed {
                comment_id,
                window_minutes: self.config.edit_window_minutes,
            });
        }
        let content = required(content)?;
        let ticket = load_ticket(tx, comment.ticket_id).await?;

        let previous = std::mem::replace(&mut comment.content, content);
        comment.edit_history.push(CommentRevision {
            content: previous.clone(),
            edited_at: now,
        });
        comment.edited = true;
        comment.updated_at = now;
        tx.update_comment(&comment).await?;

        let record = AuditRecord::for_comment(
            &comment,
            &ticket,
            AuditAction::CommentEdited,
            format!("Comment on {} edited", ticket.number),
        )
        .by(ctx)
        .with_changes(
            Some(json!({ "content": previous })),
            Some(json!({ "content": comment.content })),
        );
        self.recorder.append(tx, record).await?;
        Ok(comment)
    }

    /// Soft delete by the author or an administrator
    pub async fn delete_comment(
        &self,
        tx: &mut dyn Transaction,
        ctx: &RequestContext,
        comment_id: CommentId,
    ) -> Result<Comment, WorkflowError> {
        let mut comment = load_comment(tx, comment_id).await?;
        if comment.author_id != ctx.actor && !ctx.is_admin {
            return Err(WorkflowError::NotAuthorized {
                actor: ctx.actor,
                reason: "only the author or an administrator can delete a comment".to_string(),
            });
        }
        let ticket = load_ticket(tx, comment.ticket_id).await?;

        let now = self.clock.now();
        comment.deleted_at = Some(now);
        comment.updated_at = now;
        tx.update_comment(&comment).await?;

        let record = AuditRecord::for_comment(
            &comment,
            &ticket,
            AuditAction::CommentDeleted,
            format!("Comment on {} deleted", ticket.number),
        )
        .by(ctx)
        .with_changes(
            Some(json!({ "content": comment.content })),
            Some(json!({ "deleted_at": now })),
        );
        self.recorder.append(tx, record).await?;
        Ok(comment)
    }

    pub async fn list_comments(
        &self,
        tx: &mut dyn Transaction,
        ticket_id: TicketId,
        include_internal: bool,
    ) -> Result<Vec<Comment>, WorkflowError> {
        let mut comments = tx.list_comments(ticket_id).await?;
        comments.retain(|c| !c.is_deleted() && (include_internal || !c.internal));
        Ok(comments)
    }
}

async fn load_ticket(tx: &mut dyn Transaction, ticket_id: TicketId) -> Result<Ticket, WorkflowError> {
    match tx.get_ticket(ticket_id).await? {
        Some(ticket) if !ticket.is_retired() => Ok(ticket),
        _ => Err(WorkflowError::not_found(ResourceType::Ticket, ticket_id)),
    }
}

async fn load_comment(
    tx: &mut dyn Transaction,
    comment_id: CommentId,
) -> Result<Comment, WorkflowError> {
    match tx.get_comment(comment_id).await? {
        Some(comment) if !comment.is_deleted() => Ok(comment),
        _ => Err(WorkflowError::not_found(ResourceType::Comment, comment_id)),
    }
}

fn required(content: &str) -> Result<String, WorkflowError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(WorkflowError::Validation("comment content is required".into()));
    }
    Ok(content.to_string())
}
