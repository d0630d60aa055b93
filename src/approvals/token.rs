use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::ApprovalId;

const TOKEN_BYTES: usize = 32;

/// Plaintext link token handed to the notifier exactly once; only its hash is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub approval_id: ApprovalId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// 256 bits from the thread-local CSPRNG, hex encoded
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::rng().random();
    hex::encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    hex::encode(hasher.finalize())
}
