use std::path::Path;

use log::debug;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;

/// Key holding the hash of the most recent block
pub const TIP_KEY: &[u8] = b"lh";

/// Key holding the difficulty the chain was created with, as a big-endian u32
pub const DIFFICULTY_KEY: &[u8] = b"difficulty";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Tip moved while committing block {0}")]
    TipConflict(String),
}

/// Persistent block store.
///
/// Blocks are keyed by their raw hash; the reserved keys [`TIP_KEY`] and
/// [`DIFFICULTY_KEY`] hold the current tip and the chain's difficulty. All of
/// them live in the same tree so that a block and the tip that points at it
/// are committed in a single transaction.
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks and the tip pointer
    chain: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage")
            .finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the store at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    ///
    /// # Returns
    ///
    /// A new BlockchainStorage instance
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Opens a store that lives only as long as this value
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let chain = db.open_tree("chain")?;
        Ok(Self { db, chain })
    }

    /// Gets the hash of the most recent block, if a chain exists
    pub fn get_tip(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.chain.get(TIP_KEY)?.map(|tip| tip.to_vec()))
    }

    /// Gets the difficulty recorded when the chain was created
    ///
    /// # Returns
    ///
    /// `None` for an empty store or one written before the difficulty was
    /// recorded
    pub fn get_difficulty(&self) -> Result<Option<u32>, StorageError> {
        match self.chain.get(DIFFICULTY_KEY)? {
            Some(value) => {
                let bytes = <[u8; 4]>::try_from(&value[..]).map_err(|_| {
                    StorageError::DeserializationError(format!(
                        "difficulty entry has {} bytes",
                        value.len()
                    ))
                })?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Gets a block by its hash
    ///
    /// # Arguments
    ///
    /// * `hash` - The raw hash of the block
    ///
    /// # Returns
    ///
    /// The decoded block, or `NotFound` if no block is stored under `hash`
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        match self.chain.get(hash)? {
            Some(value) => Block::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string())),
            None => Err(StorageError::NotFound(format!(
                "Block with hash {} not found",
                hex::encode(hash)
            ))),
        }
    }

    /// Writes `block` and moves the tip onto it in one transaction.
    ///
    /// The commit is refused with `TipConflict` unless the stored tip equals
    /// `expected_tip` (`None` meaning no chain yet). Flushes before returning.
    pub fn commit_block(&self, block: &Block, expected_tip: Option<&[u8]>) -> Result<(), StorageError> {
        self.commit(block, expected_tip, None)
    }

    /// Writes the first block of a chain together with its difficulty.
    ///
    /// Refused with `TipConflict` if a chain already exists.
    pub fn commit_genesis(&self, block: &Block, difficulty: u32) -> Result<(), StorageError> {
        self.commit(block, None, Some(difficulty))
    }

    fn commit(
        &self,
        block: &Block,
        expected_tip: Option<&[u8]>,
        difficulty: Option<u32>,
    ) -> Result<(), StorageError> {
        let encoded = block
            .serialize()
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let result: Result<(), TransactionError<StorageError>> = self.chain.transaction(|tx| {
            let current = tx.get(TIP_KEY)?;
            if current.as_deref() != expected_tip {
                return Err(ConflictableTransactionError::Abort(StorageError::TipConflict(
                    hex::encode(&block.hash),
                )));
            }

            tx.insert(block.hash.as_slice(), encoded.as_slice())?;
            tx.insert(TIP_KEY, block.hash.as_slice())?;
            if let Some(difficulty) = difficulty {
                tx.insert(DIFFICULTY_KEY, &difficulty.to_be_bytes()[..])?;
            }
            Ok(())
        });

        match result {
            Ok(()) => {}
            Err(TransactionError::Abort(err)) => return Err(err),
            Err(TransactionError::Storage(err)) => return Err(StorageError::DatabaseError(err)),
        }

        self.flush()?;
        debug!("Committed block {} ({} bytes)", hex::encode(&block.hash), encoded.len());
        Ok(())
    }

    /// Lists every stored key together with the length of its value
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, usize)>, StorageError> {
        let mut entries = Vec::new();
        for result in self.chain.iter() {
            let (key, value) = result?;
            entries.push((key.to_vec(), value.len()));
        }
        Ok(entries)
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
