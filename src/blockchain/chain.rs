use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;

use crate::config::{ConfigError, LedgerConfig};

use super::account::{Account, AccountError, Identity};
use super::block::{Block, BlockError};
use super::storage::{ChainStore, StorageError};
use super::transaction::Transaction;

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Cannot complete transaction: double spending detected for {identity} (requested {requested}, available {available})")]
    DoubleSpendRejected {
        identity: String,
        requested: u64,
        available: i128,
    },

    #[error("Transaction list is full ({capacity} transactions): add block to chain")]
    BlockFull { capacity: usize },

    #[error("Invalid amount: {0}")]
    InvalidAmount(u64),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
}

/// Cancels a running proof-of-work search from another thread
#[derive(Debug, Clone, Default)]
pub struct MiningHandle(Arc<AtomicBool>);

impl MiningHandle {
    /// Asks the miner to stop at its next attempt
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Represents the blockchain
///
/// `blocks[0]` is always the genesis block and the last block is always the
/// open block receiving transactions.
#[derive(Debug)]
pub struct Blockchain {
    /// The chain of blocks
    blocks: Vec<Block>,

    /// Mining difficulty (number of leading zeros required in hash)
    difficulty: usize,

    /// Transactions per block
    capacity: usize,

    /// Balance every account starts with, used to reconstruct history
    starting_balance: u64,

    max_mining_attempts: Option<u64>,

    /// Receives the full chain after every mined block
    store: Box<dyn ChainStore>,

    cancel: MiningHandle,
}

impl Blockchain {
    /// Creates a new blockchain
    ///
    /// The chain starts with the genesis block and immediately adds a block,
    /// which skips mining for the genesis block and opens block 1.
    ///
    /// # Arguments
    ///
    /// * `config` - Difficulty, capacity and starting balance
    /// * `store` - Where the chain is written after each mined block
    ///
    /// # Returns
    ///
    /// The new chain, or a `ConfigError` for a capacity or difficulty no
    /// block could ever be mined with
    pub fn new(
        config: &LedgerConfig,
        store: Box<dyn ChainStore>,
    ) -> Result<Self, BlockchainError> {
        config.validate()?;

        let mut blockchain = Blockchain {
            blocks: vec![Block::genesis(config.block_capacity)],
            difficulty: config.difficulty,
            capacity: config.block_capacity,
            starting_balance: config.starting_balance,
            max_mining_attempts: config.max_mining_attempts,
            store,
            cancel: MiningHandle::default(),
        };

        blockchain.add_block()?;

        Ok(blockchain)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn starting_balance(&self) -> u64 {
        self.starting_balance
    }

    /// Handle for cancelling a mining run from another thread
    pub fn cancel_handle(&self) -> MiningHandle {
        self.cancel.clone()
    }

    /// The block currently receiving transactions
    pub fn open_block(&self) -> &Block {
        self.blocks
            .last()
            .expect("chain always holds the genesis block")
    }

    fn open_block_mut(&mut self) -> &mut Block {
        self.blocks
            .last_mut()
            .expect("chain always holds the genesis block")
    }

    /// The most recent block with a finalised hash
    pub fn last_mined_block(&self) -> Option<&Block> {
        self.blocks
            .iter()
            .rev()
            .find(|block| block.is_mined())
    }

    /// Rebuilds an identity's balance from chain history alone
    ///
    /// # Returns
    ///
    /// The starting balance plus every amount received minus every amount
    /// sent, or `None` if no transaction mentions `identity`
    pub fn reconstructed_balance(&self, identity: &Identity) -> Option<i128> {
        self.blocks
            .iter()
            .flat_map(|block| block.transactions.iter())
            .filter_map(|transaction| transaction.delta_for(identity))
            .reduce(|sum, delta| sum + delta)
            .map(|sum| sum + self.starting_balance as i128)
    }

    /// Checks whether `sender` would spend more than its history allows
    ///
    /// An account with no history is never flagged, whatever the amount.
    pub fn check_double_spending(&self, amount: u64, sender: &Account) -> bool {
        match self.reconstructed_balance(&sender.identity) {
            Some(available) => available < amount as i128,
            None => false,
        }
    }

    /// Adds a transaction to the open block
    ///
    /// Debiting the sender, crediting the receiver and appending the
    /// transaction happen together: on any failure both accounts and the
    /// block are left as they were.
    ///
    /// # Arguments
    ///
    /// * `amount` - The amount to transfer
    /// * `sender` - The paying account
    /// * `receiver` - The receiving account
    ///
    /// # Returns
    ///
    /// A copy of the admitted transaction
    pub fn add_transaction(
        &mut self,
        amount: u64,
        sender: &mut Account,
        receiver: &mut Account,
    ) -> Result<Transaction, BlockchainError> {
        if amount == 0 {
            return Err(BlockchainError::InvalidAmount(amount));
        }

        if self.check_double_spending(amount, sender) {
            let available = self
                .reconstructed_balance(&sender.identity)
                .unwrap_or(self.starting_balance as i128);
            warn!(
                "Double spending detected: {} requested {} with {} available",
                sender.identity, amount, available
            );
            return Err(BlockchainError::DoubleSpendRejected {
                identity: sender.identity.0.clone(),
                requested: amount,
                available,
            });
        }

        let capacity = self.capacity;
        let block = self.open_block_mut();
        if block.is_full() {
            return Err(BlockchainError::BlockFull { capacity });
        }

        let sender_balance = sender.balance;
        sender.debit(amount)?;
        if let Err(err) = receiver.credit(amount) {
            sender.balance = sender_balance;
            return Err(err.into());
        }

        let transaction = Transaction::new(amount, sender, receiver);
        block.transactions.push(transaction.clone());

        info!("Block {}: {}", block.index, transaction);
        Ok(transaction)
    }

    /// Mines the open block and opens the next one
    ///
    /// On a mining failure (partial batch, cancellation, attempt ceiling) the
    /// error is logged and the chain is left exactly as it was. A failure to
    /// persist the chain is logged but does not undo the new block.
    ///
    /// # Returns
    ///
    /// The block that was just mined
    pub fn add_block(&mut self) -> Result<&Block, BlockchainError> {
        self.cancel.reset();

        let difficulty = self.difficulty;
        let max_attempts = self.max_mining_attempts;
        let cancel = Arc::clone(&self.cancel.0);

        let tail = self.open_block_mut();
        if let Err(err) = tail.mine(difficulty, &cancel, max_attempts) {
            error!("The block is not ready: {}", err);
            return Err(err.into());
        }
        let previous_hash = tail.hash.clone();

        let index = self.blocks.len() as u64;
        self.blocks
            .push(Block::new(index, previous_hash, self.capacity));
        info!("Opened block {}", index);

        if let Err(err) = self.store.save_chain(&self.blocks) {
            error!("Failed to write the chain: {}", err);
        }

        Ok(&self.blocks[self.blocks.len() - 2])
    }

    /// Validates the blockchain
    ///
    /// # Returns
    ///
    /// true if every mined block's hash matches its transactions and every
    /// block links to its predecessor, false otherwise
    pub fn is_valid(&self) -> bool {
        let last = self.blocks.len() - 1;

        for (i, block) in self.blocks.iter().enumerate() {
            if block.index != i as u64 {
                return false;
            }

            if i == 0 {
                if !block.is_genesis() || !block.verify(self.difficulty) {
                    return false;
                }
                continue;
            }

            if block.previous_hash != self.blocks[i - 1].hash {
                return false;
            }

            // The open block has no hash yet
            if i == last {
                if !block.hash.is_empty() || block.transactions.len() > self.capacity {
                    return false;
                }
            } else if !block.verify(self.difficulty) {
                return false;
            }
        }

        true
    }
}

impl fmt::Display for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Blockchain for NiceCoins!")?;
        writeln!(f)?;
        writeln!(f, "Current block:")?;
        write!(f, "{}", self.open_block())?;

        if self.blocks.len() >= 2 {
            writeln!(f)?;
            writeln!(f, "Previous block:")?;
            write!(f, "{}", self.blocks[self.blocks.len() - 2])?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::storage::MemoryStore;
    use std::thread;
    use std::time::Duration;

    fn test_config() -> LedgerConfig {
        LedgerConfig {
            difficulty: 1,
            ..LedgerConfig::default()
        }
    }

    fn new_chain() -> (Blockchain, MemoryStore) {
        let store = MemoryStore::new();
        let chain = Blockchain::new(&test_config(), Box::new(store.clone())).unwrap();
        (chain, store)
    }

    /// Fills the open block with 1-coin transfers alternating between two accounts
    fn fill_open_block(chain: &mut Blockchain, a: &mut Account, b: &mut Account) {
        while !chain.open_block().is_full() {
            if chain.open_block().transactions.len() % 2 == 0 {
                chain.add_transaction(1, a, b).unwrap();
            } else {
                chain.add_transaction(1, b, a).unwrap();
            }
        }
    }

    #[test]
    fn test_new_blockchain() {
        let (chain, store) = new_chain();
        let blocks = chain.blocks();

        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].is_genesis());
        assert_eq!(blocks[1].index, 1);
        assert_eq!(blocks[1].previous_hash, blocks[0].hash);
        assert!(blocks[1].hash.is_empty());
        assert!(blocks[1].transactions.is_empty());
        assert!(chain.last_mined_block().is_none());
        assert_eq!(store.save_count(), 1);
        assert!(chain.is_valid());
    }

    #[test]
    fn test_new_rejects_unusable_config() {
        let config = LedgerConfig {
            block_capacity: 3,
            ..test_config()
        };
        assert!(matches!(
            Blockchain::new(&config, Box::new(MemoryStore::new())),
            Err(BlockchainError::ConfigError(ConfigError::InvalidCapacity(3)))
        ));

        let config = LedgerConfig {
            difficulty: 65,
            ..test_config()
        };
        let store = MemoryStore::new();
        assert!(matches!(
            Blockchain::new(&config, Box::new(store.clone())),
            Err(BlockchainError::ConfigError(ConfigError::InvalidDifficulty(65)))
        ));
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn test_accessors_reflect_config() {
        let (chain, _) = new_chain();

        assert_eq!(chain.difficulty(), 1);
        assert_eq!(chain.capacity(), 8);
        assert_eq!(chain.starting_balance(), 10);
    }

    #[test]
    fn test_add_transaction() {
        let (mut chain, _) = new_chain();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);

        let transaction = chain.add_transaction(4, &mut juan, &mut victoria).unwrap();

        assert_eq!(transaction.amount, 4);
        assert_eq!(juan.balance, 6);
        assert_eq!(victoria.balance, 14);
        assert_eq!(chain.open_block().transactions, vec![transaction]);
    }

    #[test]
    fn test_balances_follow_history() {
        let (mut chain, _) = new_chain();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);

        chain.add_transaction(4, &mut juan, &mut victoria).unwrap();
        chain.add_transaction(10, &mut victoria, &mut juan).unwrap();

        assert_eq!(juan.balance, 16);
        assert_eq!(victoria.balance, 4);

        // Victoria only has 4 left according to history
        let result = chain.add_transaction(5, &mut victoria, &mut juan);
        assert!(matches!(
            result,
            Err(BlockchainError::DoubleSpendRejected { requested: 5, available: 4, .. })
        ));

        chain.add_transaction(2, &mut victoria, &mut juan).unwrap();
        chain.add_transaction(10, &mut juan, &mut victoria).unwrap();

        for account in [&juan, &victoria] {
            let expected = chain.reconstructed_balance(&account.identity).unwrap();
            assert_eq!(account.balance as i128, expected);
        }
        assert_eq!(juan.balance + victoria.balance, 20);
    }

    #[test]
    fn test_insufficient_funds_leaves_state_unchanged() {
        let (mut chain, _) = new_chain();
        // No history, so the double-spend check lets it through
        let mut ghost = Account::new("Ghost", 3);
        let mut victoria = Account::new("Victoria", 10);

        let result = chain.add_transaction(5, &mut ghost, &mut victoria);

        assert!(matches!(
            result,
            Err(BlockchainError::AccountError(AccountError::InsufficientFunds {
                required: 5,
                available: 3
            }))
        ));
        assert_eq!(ghost.balance, 3);
        assert_eq!(victoria.balance, 10);
        assert!(chain.open_block().transactions.is_empty());
    }

    #[test]
    fn test_credit_failure_rolls_back_debit() {
        let (mut chain, _) = new_chain();
        let mut juan = Account::new("Juan", 10);
        let mut whale = Account::new("Whale", u64::MAX);

        let result = chain.add_transaction(1, &mut juan, &mut whale);

        assert!(matches!(
            result,
            Err(BlockchainError::AccountError(AccountError::BalanceOverflow { .. }))
        ));
        assert_eq!(juan.balance, 10);
        assert_eq!(whale.balance, u64::MAX);
        assert!(chain.open_block().transactions.is_empty());
    }

    #[test]
    fn test_zero_amount_rejected() {
        let (mut chain, _) = new_chain();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);

        assert!(matches!(
            chain.add_transaction(0, &mut juan, &mut victoria),
            Err(BlockchainError::InvalidAmount(0))
        ));
        assert!(chain.open_block().transactions.is_empty());
    }

    #[test]
    fn test_no_history_is_never_flagged() {
        let (mut chain, _) = new_chain();
        let ghost = Account::new("Ghost", 0);

        assert!(!chain.check_double_spending(1_000_000, &ghost));
        assert_eq!(chain.reconstructed_balance(&ghost.identity), None);

        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);
        chain.add_transaction(4, &mut juan, &mut victoria).unwrap();

        // Others' history doesn't count for the ghost
        assert!(!chain.check_double_spending(1_000_000, &ghost));
        assert!(chain.check_double_spending(7, &juan));
        assert!(!chain.check_double_spending(6, &juan));
    }

    #[test]
    fn test_block_full() {
        let (mut chain, _) = new_chain();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);

        fill_open_block(&mut chain, &mut juan, &mut victoria);
        assert_eq!(chain.open_block().transactions.len(), 8);

        let result = chain.add_transaction(1, &mut juan, &mut victoria);

        assert!(matches!(result, Err(BlockchainError::BlockFull { capacity: 8 })));
        assert_eq!(chain.open_block().transactions.len(), 8);
        assert_eq!(juan.balance, 10);
        assert_eq!(victoria.balance, 10);
    }

    #[test]
    fn test_add_block_incomplete_leaves_chain_unchanged() {
        let (mut chain, store) = new_chain();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);
        chain.add_transaction(4, &mut juan, &mut victoria).unwrap();

        let before = chain.blocks().to_vec();
        let result = chain.add_block();

        assert!(matches!(
            result,
            Err(BlockchainError::BlockError(BlockError::IncompleteBatch {
                expected: 8,
                actual: 1
            }))
        ));
        assert_eq!(chain.blocks(), before.as_slice());
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_add_block() {
        let (mut chain, store) = new_chain();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);
        fill_open_block(&mut chain, &mut juan, &mut victoria);

        let mined = chain.add_block().unwrap().clone();

        assert_eq!(mined.index, 1);
        assert!(mined.hash.starts_with('0'));
        assert_eq!(mined.compute_transactions_hash().unwrap(), mined.hash);

        let blocks = chain.blocks();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2].index, 2);
        assert_eq!(blocks[2].previous_hash, mined.hash);
        assert!(blocks[2].transactions.is_empty());
        assert_eq!(chain.last_mined_block(), Some(&mined));
        assert!(chain.is_valid());

        assert_eq!(store.save_count(), 2);
        assert_eq!(store.latest().unwrap(), blocks.to_vec());

        // The new open block accepts transactions again
        chain.add_transaction(6, &mut juan, &mut victoria).unwrap();
        assert_eq!(chain.open_block().transactions.len(), 1);
    }

    #[test]
    fn test_genesis_hash_is_stable() {
        let (mut chain, _) = new_chain();
        let genesis_hash = chain.blocks()[0].hash.clone();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);

        fill_open_block(&mut chain, &mut juan, &mut victoria);
        chain.add_block().unwrap();

        assert_eq!(chain.blocks()[0].hash, genesis_hash);
        assert_eq!(chain.blocks()[0].calculate_genesis_hash(), genesis_hash);
    }

    #[test]
    fn test_tampering_invalidates_chain() {
        let (mut chain, _) = new_chain();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);
        fill_open_block(&mut chain, &mut juan, &mut victoria);
        chain.add_block().unwrap();
        assert!(chain.is_valid());

        chain.blocks[1].transactions[0].amount = 9;
        assert!(!chain.is_valid());
    }

    #[test]
    fn test_broken_link_invalidates_chain() {
        let (mut chain, _) = new_chain();
        chain.blocks[1].previous_hash = "forged".to_string();

        assert!(!chain.is_valid());
    }

    #[test]
    fn test_cancel_mining() {
        let store = MemoryStore::new();
        let config = LedgerConfig {
            difficulty: 64,
            max_mining_attempts: Some(10_000_000),
            ..LedgerConfig::default()
        };
        let mut chain = Blockchain::new(&config, Box::new(store.clone())).unwrap();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);
        fill_open_block(&mut chain, &mut juan, &mut victoria);

        // Keep cancelling until mining returns, since add_block clears the flag on entry
        let handle = chain.cancel_handle();
        let done = Arc::new(AtomicBool::new(false));
        let canceller = {
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                    handle.cancel();
                }
            })
        };

        let before = chain.blocks().to_vec();
        let result = chain.add_block();
        done.store(true, Ordering::Relaxed);
        canceller.join().unwrap();

        assert!(matches!(
            result,
            Err(BlockchainError::BlockError(BlockError::MiningCancelled { index: 1, .. }))
        ));
        assert_eq!(chain.blocks(), before.as_slice());
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_attempt_ceiling() {
        let config = LedgerConfig {
            difficulty: 64,
            max_mining_attempts: Some(10),
            ..LedgerConfig::default()
        };
        let mut chain = Blockchain::new(&config, Box::new(MemoryStore::new())).unwrap();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);
        fill_open_block(&mut chain, &mut juan, &mut victoria);

        assert!(matches!(
            chain.add_block(),
            Err(BlockchainError::BlockError(BlockError::NonceExhausted { attempts: 10, .. }))
        ));
        assert_eq!(chain.blocks().len(), 2);
    }

    #[test]
    fn test_custom_capacity_and_balance() {
        let config = LedgerConfig {
            difficulty: 1,
            block_capacity: 2,
            starting_balance: 100,
            ..LedgerConfig::default()
        };
        let mut chain = Blockchain::new(&config, Box::new(MemoryStore::new())).unwrap();
        let mut juan = Account::new("Juan", 100);
        let mut victoria = Account::new("Victoria", 100);

        chain.add_transaction(60, &mut juan, &mut victoria).unwrap();
        assert_eq!(chain.reconstructed_balance(&juan.identity), Some(40));

        chain.add_transaction(1, &mut victoria, &mut juan).unwrap();
        chain.add_block().unwrap();

        assert_eq!(chain.blocks().len(), 3);
        assert!(chain.is_valid());
    }

    #[test]
    fn test_display() {
        let (mut chain, _) = new_chain();
        let mut juan = Account::new("Juan", 10);
        let mut victoria = Account::new("Victoria", 10);
        chain.add_transaction(4, &mut juan, &mut victoria).unwrap();

        let rendered = chain.to_string();

        assert!(rendered.starts_with("Blockchain for NiceCoins!"));
        assert!(rendered.contains("Current block:"));
        assert!(rendered.contains("Juan transferred 4 to Victoria."));
        assert!(rendered.contains("Previous block:"));
        assert!(rendered.contains("This is the genesis block."));
    }
}
