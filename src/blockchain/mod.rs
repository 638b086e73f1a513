// Blockchain module
//
// This module contains the core ledger implementation including:
// - Block structure, Merkle root and proof of work
// - Blockchain structure and transaction admission
// - Transaction structure
// - Hashing utilities
// - Accounts
// - Chain persistence

pub mod account;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use account::{Account, AccountError, AccountState, Identity};
pub use block::{Block, BlockError};
pub use chain::{Blockchain, BlockchainError, MiningHandle};
pub use storage::{open_store, ChainStore};
pub use transaction::Transaction;
