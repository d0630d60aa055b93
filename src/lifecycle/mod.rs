// Ticket lifecycle: the status edge table and the operations that walk it

pub mod machine;
pub mod transitions;

pub use machine::{OutcomeApplied, SubmitOutcome, TicketLifecycle, TransitionRecord};
pub use transitions::{next_status, TicketAction};
