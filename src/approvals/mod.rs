//! Approval coordination
//!
//! Each submission opens an approval round: one row per required approval
//! type, created atomically with the status change. Decisions arrive either
//! from an authenticated approver or through a single-use link token, and
//! after each one the round is folded into an [`AggregateOutcome`] that the
//! ticket lifecycle applies.

pub mod coordinator;
pub mod directory;
pub mod outcome;
pub mod policy;
pub mod token;

pub use coordinator::{ApprovalCoordinator, DecisionRecord};
pub use directory::{ApproverDirectory, DirectoryError, StaticApproverDirectory};
pub use outcome::{aggregate_outcome, AggregateOutcome};
pub use token::{generate_token, hash_token, IssuedToken};

#[cfg(any(test, feature = "testing"))]
pub use directory::MockApproverDirectory;
