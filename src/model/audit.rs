use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use super::ids::{ActorId, AuditEntryId, OrganizationId};
use super::ticket::ComplianceFramework;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Ticket,
    Approval,
    Comment,
    Actor,
    AuditEntry,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceType::Ticket => "ticket",
            ResourceType::Approval => "approval",
            ResourceType::Comment => "comment",
            ResourceType::Actor => "actor",
            ResourceType::AuditEntry => "audit_entry",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Submit,
    StatusChange,
    DecisionApplied,
    Approve,
    Deny,
    RequestUpdate,
    TokenIssued,
    Delegate,
    Expire,
    Cancel,
    Close,
    Reopen,
    Revise,
    Retire,
    CommentAdded,
    CommentEdited,
    CommentDeleted,
    Anonymize,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Submit => "submit",
            AuditAction::StatusChange => "status_change",
            AuditAction::DecisionApplied => "decision_applied",
            AuditAction::Approve => "approve",
            AuditAction::Deny => "deny",
            AuditAction::RequestUpdate => "request_update",
            AuditAction::TokenIssued => "token_issued",
            AuditAction::Delegate => "delegate",
            AuditAction::Expire => "expire",
            AuditAction::Cancel => "cancel",
            AuditAction::Close => "close",
            AuditAction::Reopen => "reopen",
            AuditAction::Revise => "revise",
            AuditAction::Retire => "retire",
            AuditAction::CommentAdded => "comment_added",
            AuditAction::CommentEdited => "comment_edited",
            AuditAction::CommentDeleted => "comment_deleted",
            AuditAction::Anonymize => "anonymize",
        }
    }

    /// Actions regulators ask about; draft edits and comments are not among them
    pub fn is_compliance_relevant(self) -> bool {
        matches!(
            self,
            AuditAction::Submit
                | AuditAction::StatusChange
                | AuditAction::DecisionApplied
                | AuditAction::Approve
                | AuditAction::Deny
                | AuditAction::RequestUpdate
                | AuditAction::Delegate
                | AuditAction::Expire
                | AuditAction::Cancel
                | AuditAction::Close
                | AuditAction::Reopen
                | AuditAction::Retire
                | AuditAction::Anonymize
        )
    }
}

/// Coarse grouping of actions for audit filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// Content of tickets and comments
    Modification,
    /// Sign-off: submissions, decisions, links, delegation
    Approval,
    /// Status moves outside the approval round
    Lifecycle,
    /// Privacy and housekeeping operations
    Administration,
}

impl AuditCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditCategory::Modification => "modification",
            AuditCategory::Approval => "approval",
            AuditCategory::Lifecycle => "lifecycle",
            AuditCategory::Administration => "administration",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AuditAction {
    pub fn category(self) -> AuditCategory {
        match self {
            AuditAction::Create
            | AuditAction::Update
            | AuditAction::Revise
            | AuditAction::CommentAdded
            | AuditAction::CommentEdited
            | AuditAction::CommentDeleted => AuditCategory::Modification,
            AuditAction::Submit
            | AuditAction::StatusChange
            | AuditAction::DecisionApplied
            | AuditAction::Approve
            | AuditAction::Deny
            | AuditAction::RequestUpdate
            | AuditAction::TokenIssued
            | AuditAction::Delegate
            | AuditAction::Expire => AuditCategory::Approval,
            AuditAction::Cancel | AuditAction::Close | AuditAction::Reopen => {
                AuditCategory::Lifecycle
            }
            AuditAction::Retire | AuditAction::Anonymize => AuditCategory::Administration,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Before/after payload of a mutation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl ChangeSet {
    pub fn new(before: Option<Value>, after: Option<Value>) -> Self {
        Self { before, after }
    }
}

/// One immutable row of a resource's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub organization_id: Option<OrganizationId>,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    /// Contiguous per resource, starting at 1
    pub revision: u64,
    pub actor: Option<ActorId>,
    pub actor_name: Option<String>,
    pub action: AuditAction,
    pub description: String,
    pub changes: ChangeSet,
    #[serde(default)]
    pub metadata: Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub correlation_id: Option<String>,
    pub compliance_relevant: bool,
    #[serde(default)]
    pub compliance_frameworks: Vec<ComplianceFramework>,
    /// Fixed at write time; the review itself is kept as a separate `AuditReview`
    #[serde(default)]
    pub requires_review: bool,
    pub created_at: DateTime<Utc>,
    pub anonymized: bool,
    pub anonymized_at: Option<DateTime<Utc>>,
}

impl AuditEntry {
    pub fn category(&self) -> AuditCategory {
        self.action.category()
    }

    /// Scrub personal data while keeping the row and its revision
    pub fn anonymize(&mut self, at: DateTime<Utc>) {
        self.actor = None;
        self.actor_name = None;
        self.ip_address = None;
        self.user_agent = None;
        self.anonymized = true;
        self.anonymized_at = Some(at);
    }

    /// Whether `subject` wrote this entry or appears in its payloads
    pub fn mentions(&self, subject: ActorId) -> bool {
        let needle = subject.to_string();
        self.actor == Some(subject)
            || self.description.contains(&needle)
            || [&self.changes.before, &self.changes.after]
                .into_iter()
                .flatten()
                .chain(std::iter::once(&self.metadata))
                .any(|value| contains_id(value, &needle))
    }

    /// Remove `subject` from the envelope and from every payload value.
    /// Returns false when the entry never mentioned them.
    pub fn forget(&mut self, subject: ActorId, at: DateTime<Utc>) -> bool {
        let needle = subject.to_string();
        let mut touched = false;
        if self.description.contains(&needle) {
            self.description = self.description.replace(&needle, REDACTED);
            touched = true;
        }
        for value in [&mut self.changes.before, &mut self.changes.after]
            .into_iter()
            .flatten()
            .chain(std::iter::once(&mut self.metadata))
        {
            touched |= scrub_id(value, &needle);
        }
        if self.actor == Some(subject) {
            self.anonymize(at);
            return true;
        }
        if touched {
            self.anonymized = true;
            self.anonymized_at = Some(at);
        }
        touched
    }
}

const REDACTED: &str = "[redacted]";

fn contains_id(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s == needle,
        Value::Array(items) => items.iter().any(|v| contains_id(v, needle)),
        Value::Object(map) => map.values().any(|v| contains_id(v, needle)),
        _ => false,
    }
}

fn scrub_id(value: &mut Value, needle: &str) -> bool {
    match value {
        Value::String(s) if s == needle => {
            *value = Value::Null;
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |touched, v| scrub_id(v, needle) | touched),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |touched, v| scrub_id(v, needle) | touched),
        _ => false,
    }
}

/// Sign-off on a compliance-relevant entry, kept beside the entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReview {
    pub entry_id: AuditEntryId,
    pub resource_id: Uuid,
    pub organization_id: Option<OrganizationId>,
    /// Cleared when the reviewer is anonymized
    pub reviewed_by: Option<ActorId>,
    pub reviewed_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// History query; empty lists and `None` bounds match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    pub actions: Vec<AuditAction>,
    pub categories: Vec<AuditCategory>,
    pub actor: Option<ActorId>,
    /// Inclusive
    pub from: Option<DateTime<Utc>>,
    /// Inclusive
    pub to: Option<DateTime<Utc>>,
    pub compliance_relevant: Option<bool>,
}

impl AuditFilter {
    pub fn in_category(category: AuditCategory) -> Self {
        Self {
            categories: vec![category],
            ..Self::default()
        }
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        (self.actions.is_empty() || self.actions.contains(&entry.action))
            && (self.categories.is_empty() || self.categories.contains(&entry.category()))
            && self.actor.map_or(true, |actor| entry.actor == Some(actor))
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
            && self
                .compliance_relevant
                .map_or(true, |relevant| entry.compliance_relevant == relevant)
    }
}
