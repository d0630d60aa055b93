use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::config::ApproverAssignment;
use crate::model::{ApprovalType, OrganizationId};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("No approver configured for {approval_type}")]
    NoApprover { approval_type: ApprovalType },

    #[error("Approver directory unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Resolves who signs off each approval type for an organization
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ApproverDirectory: Send + Sync {
    async fn resolve(
        &self,
        organization_id: OrganizationId,
        approval_type: ApprovalType,
    ) -> Result<ApproverAssignment, DirectoryError>;
}

/// Directory backed by the `[approvers]` table of the configuration
#[derive(Debug, Clone, Default)]
pub struct StaticApproverDirectory {
    assignments: HashMap<ApprovalType, ApproverAssignment>,
}

impl StaticApproverDirectory {
    pub fn new(assignments: HashMap<ApprovalType, ApproverAssignment>) -> Self {
        Self { assignments }
    }

    pub fn with(mut self, approval_type: ApprovalType, assignment: ApproverAssignment) -> Self {
        self.assignments.insert(approval_type, assignment);
        self
    }
}

#[async_trait]
impl ApproverDirectory for StaticApproverDirectory {
    async fn resolve(
        &self,
        _organization_id: OrganizationId,
        approval_type: ApprovalType,
    ) -> Result<ApproverAssignment, DirectoryError> {
        self.assignments
            .get(&approval_type)
            .cloned()
            .ok_or(DirectoryError::NoApprover { approval_type })
    }
}
