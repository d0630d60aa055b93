use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ids::{ActorId, ApprovalId, TicketId};
use super::ticket::{Priority, RiskLevel, TicketNumber};

/// Category of sign-off a ticket may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Operations,
    It,
    Risk,
    ChangeManagementBoard,
    AiOps,
    Security,
    NetworkEngineering,
    Cloud,
}

impl ApprovalType {
    pub const ALL: [ApprovalType; 8] = [
        ApprovalType::Operations,
        ApprovalType::It,
        ApprovalType::Risk,
        ApprovalType::ChangeManagementBoard,
        ApprovalType::AiOps,
        ApprovalType::Security,
        ApprovalType::NetworkEngineering,
        ApprovalType::Cloud,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalType::Operations => "operations",
            ApprovalType::It => "it",
            ApprovalType::Risk => "risk",
            ApprovalType::ChangeManagementBoard => "change_management_board",
            ApprovalType::AiOps => "ai_ops",
            ApprovalType::Security => "security",
            ApprovalType::NetworkEngineering => "network_engineering",
            ApprovalType::Cloud => "cloud",
        }
    }
}

impl fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ApprovalType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown approval type: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    UpdateRequested,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::UpdateRequested => "update_requested",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn is_pending(self) -> bool {
        self == ApprovalStatus::Pending
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an approver decided about one approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
    RequestUpdate,
}

impl Decision {
    pub fn resulting_status(self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Deny => ApprovalStatus::Denied,
            Decision::RequestUpdate => ApprovalStatus::UpdateRequested,
        }
    }

    /// Deny and request-update send the change back to the requester
    pub fn is_rejection(self) -> bool {
        !matches!(self, Decision::Approve)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Deny => "deny",
            Decision::RequestUpdate => "request_update",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One required sign-off for a ticket in a given approval round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub ticket_id: TicketId,
    pub approval_type: ApprovalType,
    /// 1-based position within the round
    pub sequence_order: u32,
    pub round: u32,
    pub approver_id: ActorId,
    pub delegated_from: Option<ActorId>,
    pub status: ApprovalStatus,
    pub decided_by: Option<ActorId>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_comment: Option<String>,
    pub conditions: Option<String>,
    /// SHA-256 hex digest of the outstanding link token
    #[serde(skip_serializing, default)]
    pub token_hash: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub token_consumed_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    pub fn pending(
        ticket_id: TicketId,
        approval_type: ApprovalType,
        sequence_order: u32,
        round: u32,
        approver_id: ActorId,
        delegated_from: Option<ActorId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ApprovalId::new(),
            ticket_id,
            approval_type,
            sequence_order,
            round,
            approver_id,
            delegated_from,
            status: ApprovalStatus::Pending,
            decided_by: None,
            decided_at: None,
            decision_comment: None,
            conditions: None,
            token_hash: None,
            token_expires_at: None,
            token_consumed_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `actor` may decide this approval: the assignee or the approver who delegated to them
    pub fn can_be_decided_by(&self, actor: ActorId) -> bool {
        self.approver_id == actor || self.delegated_from == Some(actor)
    }

    pub fn has_live_token(&self, now: DateTime<Utc>) -> bool {
        self.token_hash.is_some()
            && self.token_consumed_at.is_none()
            && self.token_expires_at.is_some_and(|expires| now <= expires)
    }
}

/// Cross-ticket approval query. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalFilter {
    pub statuses: Vec<ApprovalStatus>,
    pub approval_types: Vec<ApprovalType>,
    pub ticket_id: Option<TicketId>,
    /// Matches the assignee as well as the approver who delegated to them
    pub approver_id: Option<ActorId>,
    /// 1-based
    pub page: u32,
    pub per_page: u32,
}

impl ApprovalFilter {
    pub const DEFAULT_PER_PAGE: u32 = 50;
    pub const MAX_PER_PAGE: u32 = 100;

    /// Everything still waiting on `approver`
    pub fn pending_for(approver: ActorId) -> Self {
        Self {
            statuses: vec![ApprovalStatus::Pending],
            approver_id: Some(approver),
            ..Self::default()
        }
    }

    pub fn of_types(mut self, types: impl IntoIterator<Item = ApprovalType>) -> Self {
        self.approval_types = types.into_iter().collect();
        self
    }

    pub fn on_page(mut self, page: u32, per_page: u32) -> Self {
        self.page = page;
        self.per_page = per_page;
        self
    }

    /// Page defaults to 1; out-of-range page sizes fall back to the default
    pub fn normalized(mut self) -> Self {
        if self.page < 1 {
            self.page = 1;
        }
        if self.per_page < 1 || self.per_page > Self::MAX_PER_PAGE {
            self.per_page = Self::DEFAULT_PER_PAGE;
        }
        self
    }

    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.per_page as usize
    }

    pub fn matches(&self, approval: &Approval) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&approval.status))
            && (self.approval_types.is_empty()
                || self.approval_types.contains(&approval.approval_type))
            && self.ticket_id.map_or(true, |id| id == approval.ticket_id)
            && self
                .approver_id
                .map_or(true, |actor| approval.can_be_decided_by(actor))
    }
}

/// An approval with enough of its ticket to triage it from a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalQueueItem {
    #[serde(flatten)]
    pub approval: Approval,
    pub ticket_number: TicketNumber,
    pub ticket_title: String,
    pub priority: Priority,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalPage {
    pub items: Vec<ApprovalQueueItem>,
    /// Matches across all pages
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Approval {
        Approval::pending(
            TicketId::new(),
            ApprovalType::Security,
            1,
            1,
            ActorId::new(),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn approval_type_names_are_snake_case() {
        let json = serde_json::to_string(&ApprovalType::ChangeManagementBoard).unwrap();
        assert_eq!(json, "\"change_management_board\"");
        assert_eq!("ai_ops".parse::<ApprovalType>(), Ok(ApprovalType::AiOps));
        assert!("finance".parse::<ApprovalType>().is_err());
    }

    #[test]
    fn token_hash_is_never_serialized() {
        let mut approval = sample();
        approval.token_hash = Some("deadbeef".into());
        let json = serde_json::to_value(&approval).unwrap();
        assert!(json.get("token_hash").is_none());

        let back: Approval = serde_json::from_value(json).unwrap();
        assert_eq!(back.token_hash, None);
    }

    #[test]
    fn delegator_and_delegate_may_both_decide() {
        let original = ActorId::new();
        let mut approval = sample();
        let delegate = approval.approver_id;
        approval.delegated_from = Some(original);

        assert!(approval.can_be_decided_by(delegate));
        assert!(approval.can_be_decided_by(original));
        assert!(!approval.can_be_decided_by(ActorId::new()));
    }

    #[test]
    fn decisions_map_to_statuses() {
        assert_eq!(Decision::Approve.resulting_status(), ApprovalStatus::Approved);
        assert_eq!(Decision::Deny.resulting_status(), ApprovalStatus::Denied);
        assert_eq!(
            Decision::RequestUpdate.resulting_status(),
            ApprovalStatus::UpdateRequested
        );
        assert!(Decision::Deny.is_rejection());
        assert!(!Decision::Approve.is_rejection());
    }

    #[test]
    fn filter_normalizes_paging() {
        let filter = ApprovalFilter::default().on_page(0, 500).normalized();
        assert_eq!(filter.page, 1);
        assert_eq!(filter.per_page, ApprovalFilter::DEFAULT_PER_PAGE);
        assert_eq!(filter.offset(), 0);

        let filter = ApprovalFilter::default().on_page(3, 20).normalized();
        assert_eq!(filter.offset(), 40);
    }

    #[test]
    fn pending_filter_matches_delegator_and_type() {
        let original = ActorId::new();
        let mut approval = sample();
        approval.delegated_from = Some(original);

        assert!(ApprovalFilter::pending_for(original).matches(&approval));
        assert!(ApprovalFilter::pending_for(approval.approver_id).matches(&approval));
        assert!(!ApprovalFilter::pending_for(ActorId::new()).matches(&approval));
        assert!(!ApprovalFilter::pending_for(original)
            .of_types([ApprovalType::It])
            .matches(&approval));

        approval.status = ApprovalStatus::Approved;
        assert!(!ApprovalFilter::pending_for(original).matches(&approval));
    }
}
