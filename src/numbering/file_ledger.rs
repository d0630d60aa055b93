use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::{OrganizationId, TicketNumber};

const LOCK_FILE: &str = ".ledger.lock";

#[derive(Debug, Error)]
pub enum NumberingError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Ledger task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Body of a claimed ledger file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub number: TicketNumber,
    pub organization_id: OrganizationId,
    pub claimed_at: DateTime<Utc>,
}

/// Directory of `CHG-YYYY-NNNNN.json` files shared with other ticket writers.
/// Every read-modify step runs under an exclusive fd-lock on `.ledger.lock`.
#[derive(Debug, Clone)]
pub struct FileLedger {
    dir: PathBuf,
}

impl FileLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, number: TicketNumber) -> PathBuf {
        self.dir.join(number.file_name())
    }

    fn with_lock<T>(&self, f: impl FnOnce() -> Result<T, NumberingError>) -> Result<T, NumberingError> {
        fs::create_dir_all(&self.dir)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        let mut lock = RwLock::new(lock_file);
        let _guard = lock.write()?;
        f()
    }

    /// Highest sequence claimed for `year`, ignoring files that are not ticket numbers
    pub fn max_sequence(&self, year: i32) -> Result<Option<u32>, NumberingError> {
        self.with_lock(|| self.scan_max(year))
    }

    fn scan_max(&self, year: i32) -> Result<Option<u32>, NumberingError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let mut max = None;
        for entry in entries {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(number) = stem.parse::<TicketNumber>() {
                if number.year == year {
                    max = max.max(Some(number.sequence));
                }
            }
        }
        Ok(max)
    }

    pub fn is_taken(&self, number: TicketNumber) -> bool {
        self.path_for(number).exists()
    }

    /// Create the number's file if nobody else has; `false` means another writer won
    pub fn claim(&self, entry: &LedgerEntry) -> Result<bool, NumberingError> {
        let path = self.path_for(entry.number);
        self.with_lock(|| {
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
                Err(err) => return Err(err.into()),
            };
            file.write_all(&serde_json::to_vec_pretty(entry)?)?;
            file.sync_all()?;
            Ok(true)
        })
    }

    /// Give a claimed number back after the ticket failed to commit
    pub fn release(&self, entry: &LedgerEntry) -> Result<(), NumberingError> {
        let path = self.path_for(entry.number);
        self.with_lock(|| {
            let owned = match File::open(&path) {
                Ok(file) => serde_json::from_reader::<_, LedgerEntry>(file)
                    .map(|found| {
                        found.organization_id == entry.organization_id
                            && found.claimed_at == entry.claimed_at
                    })
                    .unwrap_or(false),
                Err(err) if err.kind() == ErrorKind::NotFound => false,
                Err(err) => return Err(err.into()),
            };
            if owned {
                fs::remove_file(&path)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(year: i32, sequence: u32) -> LedgerEntry {
        LedgerEntry {
            number: TicketNumber::new(year, sequence),
            organization_id: OrganizationId::new(),
            claimed_at: Utc::now(),
        }
    }

    #[test]
    fn scans_only_ticket_files_for_the_year() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("CHG-2025-00004.json"), "{}").unwrap();
        fs::write(dir.path().join("CHG-2025-00011.json"), "{}").unwrap();
        fs::write(dir.path().join("CHG-2024-00090.json"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignore").unwrap();

        let ledger = FileLedger::new(dir.path());
        assert_eq!(ledger.max_sequence(2025).unwrap(), Some(11));
        assert_eq!(ledger.max_sequence(2026).unwrap(), None);
    }

    #[test]
    fn claim_is_create_new() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path());
        let first = entry(2025, 1);

        assert!(ledger.claim(&first).unwrap());
        assert!(!ledger.claim(&entry(2025, 1)).unwrap());
        assert!(ledger.is_taken(first.number));
    }

    #[test]
    fn release_only_removes_own_claim() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path());
        let mine = entry(2025, 3);
        ledger.claim(&mine).unwrap();

        ledger.release(&entry(2025, 3)).unwrap();
        assert!(ledger.is_taken(mine.number));

        ledger.release(&mine).unwrap();
        assert!(!ledger.is_taken(mine.number));
    }

    #[test]
    fn missing_directory_has_no_numbers() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path().join("not-yet"));
        assert_eq!(ledger.scan_max(2025).unwrap(), None);
    }
}
