use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use super::approval::ApprovalType;
use super::ids::{ActorId, OrganizationId, TicketId};

/// Top-level lifecycle status of a change ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Draft,
    Submitted,
    InReview,
    PartiallyApproved,
    Approved,
    Denied,
    UpdateRequested,
    Implementing,
    Completed,
    Closed,
    Cancelled,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 11] = [
        TicketStatus::Draft,
        TicketStatus::Submitted,
        TicketStatus::InReview,
        TicketStatus::PartiallyApproved,
        TicketStatus::Approved,
        TicketStatus::Denied,
        TicketStatus::UpdateRequested,
        TicketStatus::Implementing,
        TicketStatus::Completed,
        TicketStatus::Closed,
        TicketStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Draft => "draft",
            TicketStatus::Submitted => "submitted",
            TicketStatus::InReview => "in_review",
            TicketStatus::PartiallyApproved => "partially_approved",
            TicketStatus::Approved => "approved",
            TicketStatus::Denied => "denied",
            TicketStatus::UpdateRequested => "update_requested",
            TicketStatus::Implementing => "implementing",
            TicketStatus::Completed => "completed",
            TicketStatus::Closed => "closed",
            TicketStatus::Cancelled => "cancelled",
        }
    }

    /// Closed and cancelled tickets accept nothing but a reopen of `closed`
    pub fn is_terminal(self) -> bool {
        matches!(self, TicketStatus::Closed | TicketStatus::Cancelled)
    }

    /// Statuses in which approvers may still record decisions
    pub fn is_under_review(self) -> bool {
        matches!(
            self,
            TicketStatus::Submitted | TicketStatus::InReview | TicketStatus::PartiallyApproved
        )
    }

    /// Statuses in which the requester may edit ticket content
    pub fn is_editable(self) -> bool {
        matches!(self, TicketStatus::Draft | TicketStatus::UpdateRequested)
    }

    pub fn is_open(self) -> bool {
        matches!(
            self,
            TicketStatus::Draft
                | TicketStatus::Submitted
                | TicketStatus::InReview
                | TicketStatus::PartiallyApproved
                | TicketStatus::UpdateRequested
                | TicketStatus::Implementing
        )
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TicketStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown ticket status: {s}"))
    }
}

/// Urgency of a change request
/// Higher values sort first in approval queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Within 7 days
    Low = 0,
    /// Within 72 hours
    Normal = 1,
    /// Within 24 hours
    High = 2,
    /// Within 4 hours
    Urgent = 3,
    /// Within 1 hour
    Emergency = 4,
}

impl Priority {
    pub fn value(self) -> u32 {
        self as u32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
            Priority::Emergency => "emergency",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            "emergency" => Ok(Priority::Emergency),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Medium
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Regulatory frameworks a change may fall under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceFramework {
    Glba,
    Sox,
    Hipaa,
    BankingSecrecyAct,
    Gdpr,
    Custom,
}

static TICKET_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^CHG-(\d{4})-(\d{5,})$").expect("ticket number pattern is valid")
});

/// Human-readable, organization-scoped ticket number: `CHG-<year>-<sequence>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketNumber {
    pub year: i32,
    pub sequence: u32,
}

impl TicketNumber {
    pub fn new(year: i32, sequence: u32) -> Self {
        Self { year, sequence }
    }

    /// File name used by the on-disk ticket ledger
    pub fn file_name(&self) -> String {
        format!("{self}.json")
    }
}

impl fmt::Display for TicketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CHG-{}-{:05}", self.year, self.sequence)
    }
}

impl FromStr for TicketNumber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = TICKET_NUMBER_RE
            .captures(s)
            .ok_or_else(|| format!("not a ticket number: {s}"))?;
        let year = caps[1]
            .parse::<i32>()
            .map_err(|e| format!("bad year in {s}: {e}"))?;
        let sequence = caps[2]
            .parse::<u32>()
            .map_err(|e| format!("bad sequence in {s}: {e}"))?;
        Ok(Self { year, sequence })
    }
}

impl TryFrom<String> for TicketNumber {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TicketNumber> for String {
    fn from(number: TicketNumber) -> Self {
        number.to_string()
    }
}

/// Mutable ticket content, frozen into `submitted_snapshot` at first submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSnapshot {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub risk_level: RiskLevel,
    pub compliance_frameworks: Vec<ComplianceFramework>,
    pub change_type: Option<String>,
    pub affected_systems: Vec<String>,
    pub impact_description: Option<String>,
    pub rollback_plan: Option<String>,
    pub testing_plan: Option<String>,
    pub requires_approval_types: Vec<ApprovalType>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub organization_id: OrganizationId,
    pub number: TicketNumber,
    pub created_by: ActorId,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: Priority,
    pub risk_level: RiskLevel,
    pub compliance_frameworks: Vec<ComplianceFramework>,
    pub change_type: Option<String>,
    pub affected_systems: Vec<String>,
    pub impact_description: Option<String>,
    pub rollback_plan: Option<String>,
    pub testing_plan: Option<String>,
    pub requires_approval_types: Vec<ApprovalType>,
    /// Incremented on every submission; approvals of older rounds are history only
    pub approval_round: u32,
    pub submitted_snapshot: Option<TicketSnapshot>,
    /// Reason supplied with the last cancel, reopen, or revise
    pub status_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deletion_reason: Option<String>,
}

impl Ticket {
    pub fn snapshot(&self, taken_at: DateTime<Utc>) -> TicketSnapshot {
        TicketSnapshot {
            title: self.title.clone(),
            description: self.description.clone(),
            priority: self.priority,
            risk_level: self.risk_level,
            compliance_frameworks: self.compliance_frameworks.clone(),
            change_type: self.change_type.clone(),
            affected_systems: self.affected_systems.clone(),
            impact_description: self.impact_description.clone(),
            rollback_plan: self.rollback_plan.clone(),
            testing_plan: self.testing_plan.clone(),
            requires_approval_types: self.requires_approval_types.clone(),
            taken_at,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn has_been_submitted(&self) -> bool {
        self.submitted_at.is_some()
    }
}

/// Input for creating a draft ticket
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTicket {
    pub organization_id: OrganizationId,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub compliance_frameworks: Vec<ComplianceFramework>,
    pub change_type: Option<String>,
    #[serde(default)]
    pub affected_systems: Vec<String>,
    pub impact_description: Option<String>,
    pub rollback_plan: Option<String>,
    pub testing_plan: Option<String>,
    #[serde(default)]
    pub requires_approval_types: Vec<ApprovalType>,
}

impl NewTicket {
    pub fn new(organization_id: OrganizationId, title: impl Into<String>) -> Self {
        Self {
            organization_id,
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_compliance(mut self, frameworks: impl IntoIterator<Item = ComplianceFramework>) -> Self {
        self.compliance_frameworks = frameworks.into_iter().collect();
        self
    }

    pub fn requiring(mut self, types: impl IntoIterator<Item = ApprovalType>) -> Self {
        self.requires_approval_types = types.into_iter().collect();
        self
    }

    pub fn with_rollback_plan(mut self, plan: impl Into<String>) -> Self {
        self.rollback_plan = Some(plan.into());
        self
    }
}

/// Partial edit of a draft or an update-requested ticket
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub risk_level: Option<RiskLevel>,
    pub compliance_frameworks: Option<Vec<ComplianceFramework>>,
    pub change_type: Option<String>,
    pub affected_systems: Option<Vec<String>>,
    pub impact_description: Option<String>,
    pub rollback_plan: Option<String>,
    pub testing_plan: Option<String>,
    pub requires_approval_types: Option<Vec<ApprovalType>>,
}

impl TicketUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.risk_level.is_none()
            && self.compliance_frameworks.is_none()
            && self.change_type.is_none()
            && self.affected_systems.is_none()
            && self.impact_description.is_none()
            && self.rollback_plan.is_none()
            && self.testing_plan.is_none()
            && self.requires_approval_types.is_none()
    }
}
