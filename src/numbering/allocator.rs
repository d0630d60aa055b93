use chrono::Datelike;
use std::sync::Arc;
use tracing::{debug, warn};

use super::file_ledger::{FileLedger, LedgerEntry, NumberingError};
use crate::clock::Clock;
use crate::error::WorkflowError;
use crate::model::{OrganizationId, ResourceType, TicketNumber};
use crate::persistence::Transaction;

/// A number reserved for one ticket insert
#[derive(Debug, Clone)]
pub struct Allocation {
    pub number: TicketNumber,
    /// Present when the file ledger holds a claim that must be released if the insert fails
    pub claim: Option<LedgerEntry>,
}

/// Two-source ticket numbering.
///
/// The next sequence is one past the larger of the database maximum for the
/// organization's year and the highest ledger file for that year. From there
/// the allocator probes upward while either source reports the number taken,
/// then claims the ledger file with create-new semantics. Losing that race
/// starts another attempt above the lost number. If the ledger cannot be read
/// or written, allocation continues from the database alone. A duplicate
/// caught by the database at commit is handled by the caller allocating again.
#[derive(Clone)]
pub struct TicketNumberAllocator {
    ledger: Option<FileLedger>,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl TicketNumberAllocator {
    pub fn new(ledger: Option<FileLedger>, max_attempts: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            max_attempts: max_attempts.max(1),
            clock,
        }
    }

    pub async fn allocate(
        &self,
        tx: &mut dyn Transaction,
        organization_id: OrganizationId,
    ) -> Result<Allocation, WorkflowError> {
        let year = self.clock.now().year();
        let db_max = tx.max_ticket_sequence(organization_id, year).await?;
        let mut ledger = self.ledger.clone();

        let file_max = match &ledger {
            Some(file_ledger) => match self.ledger_max(file_ledger, year).await {
                Ok(max) => max,
                Err(err) => {
                    warn!(error = %err, "Ticket ledger unreadable, numbering from database only");
                    ledger = None;
                    None
                }
            },
            None => None,
        };

        let mut floor = db_max.max(file_max).unwrap_or(0) + 1;
        debug!(?db_max, ?file_max, floor, year, "Reconciled ticket number sources");

        for attempt in 1..=self.max_attempts {
            let mut sequence = floor;
            loop {
                let number = TicketNumber::new(year, sequence);
                let in_db = tx.ticket_number_taken(organization_id, number).await?;
                let in_ledger = ledger.as_ref().is_some_and(|l| l.is_taken(number));
                if !in_db && !in_ledger {
                    break;
                }
                sequence += 1;
            }
            let number = TicketNumber::new(year, sequence);

            let Some(file_ledger) = ledger.clone() else {
                return Ok(Allocation {
                    number,
                    claim: None,
                });
            };

            let entry = LedgerEntry {
                number,
                organization_id,
                claimed_at: self.clock.now(),
            };
            match claim(file_ledger, entry.clone()).await {
                Ok(true) => {
                    return Ok(Allocation {
                        number,
                        claim: Some(entry),
                    })
                }
                Ok(false) => {
                    debug!(%number, attempt, "Ticket number claimed by another writer, retrying");
                    floor = sequence + 1;
                }
                Err(err) => {
                    warn!(%number, error = %err, "Ticket ledger claim failed, numbering from database only");
                    return Ok(Allocation {
                        number,
                        claim: None,
                    });
                }
            }
        }

        warn!(attempts = self.max_attempts, "Ticket number allocation exhausted its attempts");
        Err(WorkflowError::ConcurrentModification {
            resource_type: ResourceType::Ticket,
            resource_id: organization_id.as_uuid(),
            current: None,
        })
    }

    /// Undo the ledger claim of an allocation whose ticket never committed
    pub async fn release(&self, allocation: &Allocation) {
        let (Some(ledger), Some(entry)) = (self.ledger.clone(), allocation.claim.clone()) else {
            return;
        };
        let number = entry.number;
        let released = tokio::task::spawn_blocking(move || ledger.release(&entry)).await;
        match released {
            Ok(Ok(())) => debug!(%number, "Released ticket number claim"),
            Ok(Err(err)) => warn!(%number, error = %err, "Could not release ticket number claim"),
            Err(err) => warn!(%number, error = %err, "Ticket ledger release task failed"),
        }
    }

    async fn ledger_max(&self, ledger: &FileLedger, year: i32) -> Result<Option<u32>, NumberingError> {
        let ledger = ledger.clone();
        tokio::task::spawn_blocking(move || ledger.max_sequence(year)).await?
    }
}

async fn claim(ledger: FileLedger, entry: LedgerEntry) -> Result<bool, NumberingError> {
    tokio::task::spawn_blocking(move || ledger.claim(&entry)).await?
}
