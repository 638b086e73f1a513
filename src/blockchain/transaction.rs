use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use std::fmt;

use super::account::{Account, Identity};

/// Timestamp layout mixed into transaction hashes (microsecond precision)
pub const HASH_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Represents a value transfer between two accounts
///
/// Sender and receiver are identity snapshots taken at construction, so a
/// transaction never observes later changes to the accounts it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Unique identifier, used as a storage key only
    pub id: String,

    /// Amount being transferred
    pub amount: u64,

    /// Sender's identity
    pub sender: Identity,

    /// Receiver's identity
    pub receiver: Identity,

    /// Timestamp when the transaction was created
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Creates a new transaction
    ///
    /// No validation happens here; the chain checks amount and balances
    /// before admitting it.
    ///
    /// # Arguments
    ///
    /// * `amount` - The amount to transfer
    /// * `sender` - The paying account
    /// * `receiver` - The receiving account
    pub fn new(amount: u64, sender: &Account, receiver: &Account) -> Self {
        Transaction {
            id: Uuid::new_v4().to_string(),
            amount,
            sender: sender.identity.clone(),
            receiver: receiver.identity.clone(),
            created_at: Utc::now(),
        }
    }

    /// Text hashed into this transaction's Merkle leaf for a given nonce
    pub fn hash_input(&self, nonce: u64) -> String {
        format!(
            "{}{}{}{}{}",
            self.amount,
            self.sender,
            self.receiver,
            self.created_at.format(HASH_TIMESTAMP_FORMAT),
            nonce
        )
    }

    /// Signed effect of this transaction on `identity`'s balance
    ///
    /// `None` when the transaction doesn't mention `identity` at all.
    pub fn delta_for(&self, identity: &Identity) -> Option<i128> {
        let mut delta = None;
        if &self.sender == identity {
            delta = Some(delta.unwrap_or(0) - self.amount as i128);
        }
        if &self.receiver == identity {
            delta = Some(delta.unwrap_or(0) + self.amount as i128);
        }
        delta
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} transferred {} to {}.", self.sender, self.amount, self.receiver)
    }
}
