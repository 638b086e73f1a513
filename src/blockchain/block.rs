use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::crypto::{meets_difficulty, merkle_root, sha256_hex};
use super::transaction::{Transaction, HASH_TIMESTAMP_FORMAT};

/// Label mixed into the genesis hash
pub const GENESIS_LABEL: &str = "Genesis block";

/// Errors that can occur while hashing or mining a block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Transaction list should be completed before adding the block to the chain: {actual} of {expected} transactions")]
    IncompleteBatch { expected: usize, actual: usize },

    #[error("Block capacity must be a non-zero power of two, got {0}")]
    InvalidCapacity(usize),

    #[error("Mining of block {index} cancelled after {attempts} attempts")]
    MiningCancelled { index: u64, attempts: u64 },

    #[error("Mining of block {index} gave up after {attempts} attempts")]
    NonceExhausted { index: u64, attempts: u64 },
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Hash of the previous block, empty for the genesis block
    pub previous_hash: String,

    /// Hash of this block, empty until mined
    pub hash: String,

    /// Proof of work (nonce)
    pub nonce: u64,

    /// Timestamp when the block was created
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// Number of transactions that completes this block
    pub capacity: usize,

    /// Transactions included in this block, in admission order
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Creates the genesis block
    ///
    /// Its hash is computed once here from the block metadata and is never
    /// mined or recomputed afterwards.
    pub fn genesis(capacity: usize) -> Self {
        let mut block = Block::new(0, String::new(), capacity);
        block.hash = block.calculate_genesis_hash();
        block
    }

    /// Creates an empty, unmined block
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `previous_hash` - The hash of the previous block
    /// * `capacity` - Number of transactions that completes the block
    pub fn new(index: u64, previous_hash: String, capacity: usize) -> Self {
        Block {
            index,
            previous_hash,
            hash: String::new(),
            nonce: 0,
            timestamp: Utc::now(),
            capacity,
            transactions: Vec::with_capacity(capacity),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.transactions.len() >= self.capacity
    }

    /// A non-genesis block with a finalised hash
    pub fn is_mined(&self) -> bool {
        !self.is_genesis() && !self.hash.is_empty()
    }

    /// Calculates the genesis hash from the block metadata
    pub fn calculate_genesis_hash(&self) -> String {
        sha256_hex(format!(
            "{}{}{}{}{}",
            self.index,
            GENESIS_LABEL,
            self.timestamp.format(HASH_TIMESTAMP_FORMAT),
            self.previous_hash,
            self.nonce
        ))
    }

    /// Calculates the Merkle root of the transactions at the current nonce
    ///
    /// # Returns
    ///
    /// The root as a hex string, or `IncompleteBatch` unless the block holds
    /// exactly `capacity` transactions
    pub fn compute_transactions_hash(&self) -> Result<String, BlockError> {
        self.merkle_root_at(self.nonce)
    }

    fn merkle_root_at(&self, nonce: u64) -> Result<String, BlockError> {
        if self.transactions.len() != self.capacity {
            return Err(BlockError::IncompleteBatch {
                expected: self.capacity,
                actual: self.transactions.len(),
            });
        }

        let leaves = self
            .transactions
            .iter()
            .map(|transaction| sha256_hex(transaction.hash_input(nonce)))
            .collect();

        merkle_root(leaves).ok_or(BlockError::InvalidCapacity(self.capacity))
    }

    /// Performs proof of work on this block
    ///
    /// Increments the nonce and recomputes the Merkle root until the hash
    /// starts with `difficulty` zeros. The genesis block is left untouched.
    /// The nonce and hash are only written once a solution is found, so a
    /// cancelled or exhausted search leaves the block as it was.
    ///
    /// # Arguments
    ///
    /// * `difficulty` - Number of leading '0' hex characters required
    /// * `cancel` - Checked before every attempt
    /// * `max_attempts` - Optional ceiling on the number of nonces tried
    pub fn mine(
        &mut self,
        difficulty: usize,
        cancel: &AtomicBool,
        max_attempts: Option<u64>,
    ) -> Result<(), BlockError> {
        if self.is_genesis() {
            return Ok(());
        }

        // Fail fast on a partial batch before entering the loop
        self.compute_transactions_hash()?;

        info!("Mining block ({}) with PoW ...", self.index);
        let start = Instant::now();

        let mut nonce = self.nonce;
        let mut attempts: u64 = 0;

        let hash = loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(BlockError::MiningCancelled {
                    index: self.index,
                    attempts,
                });
            }

            let exhausted = max_attempts.is_some_and(|max| attempts >= max);
            nonce = match nonce.checked_add(1) {
                Some(next) if !exhausted => next,
                _ => {
                    return Err(BlockError::NonceExhausted {
                        index: self.index,
                        attempts,
                    })
                }
            };
            attempts += 1;

            let candidate = self.merkle_root_at(nonce)?;
            if meets_difficulty(&candidate, difficulty) {
                break candidate;
            }
        };

        self.nonce = nonce;
        self.hash = hash;

        info!("Time elapsed: {:.3?}", start.elapsed());
        info!("Mined hash: {} (nonce {}, {} attempts)", self.hash, self.nonce, attempts);

        Ok(())
    }

    /// Checks that the stored hash matches the block contents
    ///
    /// The genesis hash must match its metadata; a mined block must hold a
    /// full batch whose root at the stored nonce equals the stored hash and
    /// satisfies `difficulty`. Open blocks never verify.
    pub fn verify(&self, difficulty: usize) -> bool {
        if self.is_genesis() {
            return self.hash == self.calculate_genesis_hash();
        }

        match self.compute_transactions_hash() {
            Ok(root) => root == self.hash && meets_difficulty(&self.hash, difficulty),
            Err(_) => false,
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Created at {}", self.timestamp.format(HASH_TIMESTAMP_FORMAT))?;
        if !self.hash.is_empty() {
            writeln!(f, "Hash: {}.", self.hash)?;
        }
        if self.is_genesis() {
            writeln!(f, "This is the genesis block.")?;
        } else {
            writeln!(f, "Previous hash: {}.", self.previous_hash)?;
        }
        if self.transactions.is_empty() {
            writeln!(f, "The block has no transactions.")?;
        } else {
            writeln!(f, "Transactions:")?;
            for transaction in &self.transactions {
                writeln!(f, "\t{}", transaction)?;
            }
        }
        Ok(())
    }
}
