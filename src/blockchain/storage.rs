use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use sled::{Db, Tree};
use thiserror::Error;

use crate::config::{LedgerConfig, StoreKind};

use super::block::Block;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Destination for the full chain, written after every mined block
///
/// Writes overwrite whatever was stored before; nothing is read back into a
/// running chain.
pub trait ChainStore: Send + fmt::Debug {
    fn save_chain(&self, blocks: &[Block]) -> Result<(), StorageError>;
}

/// Writes the chain as a pretty-printed JSON array
///
/// The file is replaced atomically: the dump goes to a sibling temp file
/// which is then renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Creates a store writing to `path`, creating parent directories
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ChainStore for JsonFileStore {
    fn save_chain(&self, blocks: &[Block]) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(blocks)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let temp = self.temp_path();
        fs::write(&temp, data)?;
        fs::rename(&temp, &self.path)?;

        debug!("Wrote {} blocks to {}", blocks.len(), self.path.display());
        Ok(())
    }
}

/// Stores blocks and transactions in a sled database
pub struct SledStore {
    /// The database instance
    db: Db,

    /// Blocks keyed by big-endian index
    blocks: Tree,

    /// Transactions keyed by id
    transactions: Tree,

    /// Tree for metadata
    metadata: Tree,
}

impl fmt::Debug for SledStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Opens (or creates) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let transactions = db.open_tree("transactions")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            transactions,
            metadata,
        })
    }

    fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let value = bincode::serialize(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.blocks.insert(block.index.to_be_bytes(), value)?;

        for transaction in &block.transactions {
            let value = bincode::serialize(transaction)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            self.transactions.insert(transaction.id.as_bytes(), value)?;
        }

        Ok(())
    }
}

impl ChainStore for SledStore {
    fn save_chain(&self, blocks: &[Block]) -> Result<(), StorageError> {
        self.blocks.clear()?;
        for block in blocks {
            self.save_block(block)?;
        }

        let latest_mined = blocks.iter().rev().find(|block| !block.hash.is_empty());
        if let Some(block) = latest_mined {
            self.metadata
                .insert("latest_block_hash", block.hash.as_bytes())?;
        }

        if let Some(tail) = blocks.last() {
            let height = bincode::serialize(&tail.index)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            self.metadata.insert("block_height", height)?;
        }

        self.db.flush()?;
        debug!("Saved {} blocks to sled", blocks.len());
        Ok(())
    }
}

/// Opens the store selected by the configuration
pub fn open_store(config: &LedgerConfig) -> Result<Box<dyn ChainStore>, StorageError> {
    let store: Box<dyn ChainStore> = match config.store {
        StoreKind::Json => Box::new(JsonFileStore::new(&config.data_path)?),
        StoreKind::Sled => Box::new(SledStore::new(&config.data_path)?),
        StoreKind::Memory => Box::new(MemoryStore::new()),
    };
    Ok(store)
}

/// Keeps every saved snapshot in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    snapshots: Arc<Mutex<Vec<Vec<Block>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Number of times the chain has been saved
    pub fn save_count(&self) -> usize {
        self.snapshots
            .lock()
            .map(|snapshots| snapshots.len())
            .unwrap_or(0)
    }

    /// The most recently saved chain
    pub fn latest(&self) -> Option<Vec<Block>> {
        self.snapshots
            .lock()
            .ok()
            .and_then(|snapshots| snapshots.last().cloned())
    }
}

impl ChainStore for MemoryStore {
    fn save_chain(&self, blocks: &[Block]) -> Result<(), StorageError> {
        self.snapshots
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .push(blocks.to_vec());
        Ok(())
    }
}
