// Ticket numbering: database maximum reconciled with an on-disk ledger

pub mod allocator;
pub mod file_ledger;

pub use allocator::{Allocation, TicketNumberAllocator};
pub use file_ledger::{FileLedger, LedgerEntry, NumberingError};
