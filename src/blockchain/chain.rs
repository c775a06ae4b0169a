use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard, RwLock};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::block::{Block, BlockError};
use super::config::{ChainConfig, ConfigError};
use super::crypto::{Address, IdentityMatch, OwnershipVerifier};
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{Transaction, TransactionError};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Blockchain already exists")]
    ChainAlreadyExists,

    #[error("No existing blockchain found")]
    ChainNotFound,

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("System error: {0}")]
    SystemError(String),
}

/// What a chain dump reports for one block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BlockSummary {
    /// Hex encoded previous hash (empty for genesis)
    pub prev_hash: String,

    /// Hex encoded block hash
    pub hash: String,

    pub nonce: u64,

    /// Number of transactions in the block
    pub transactions: usize,

    /// Whether the stored nonce satisfies the chain's difficulty
    pub pow_valid: bool,
}

impl BlockSummary {
    /// Summarises `block`, checking its proof of work at `difficulty`
    pub fn from_block(block: &Block, difficulty: u32) -> Self {
        BlockSummary {
            prev_hash: hex::encode(&block.prev_hash),
            hash: hex::encode(&block.hash),
            nonce: block.nonce,
            transactions: block.transactions.len(),
            pow_valid: block.validate_pow(difficulty),
        }
    }
}

/// A hash-linked chain of mined blocks backed by [`BlockchainStorage`]
pub struct Blockchain {
    /// Hash of the most recent block
    tip: RwLock<Vec<u8>>,

    /// Serialises read-tip, mine and commit; readers never take it
    append_lock: Mutex<()>,

    /// Storage for blockchain data
    storage: BlockchainStorage,

    config: ChainConfig,

    /// Answers every ownership question asked by the UTXO queries
    verifier: Box<dyn OwnershipVerifier>,
}

impl std::fmt::Debug for Blockchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blockchain")
            .field("config", &self.config)
            .finish()
    }
}

impl Blockchain {
    /// Creates a new chain whose genesis block pays the configured reward to
    /// `owner`
    ///
    /// # Arguments
    ///
    /// * `storage` - An empty block store
    /// * `config` - The chain parameters; the difficulty is recorded in the
    ///   store and used for the lifetime of the chain
    /// * `owner` - The identity receiving the genesis reward
    ///
    /// # Returns
    ///
    /// The new chain, or `ChainAlreadyExists` if the store already has a tip
    pub fn init(
        storage: BlockchainStorage,
        config: ChainConfig,
        owner: &Address,
    ) -> Result<Self, BlockchainError> {
        config.validate()?;

        if storage.get_tip()?.is_some() {
            return Err(BlockchainError::ChainAlreadyExists);
        }

        let coinbase = Transaction::new_coinbase(owner, &config.genesis_memo, config.mining_reward)?;
        let genesis = Block::genesis(coinbase, &config)?;

        match storage.commit_genesis(&genesis, config.difficulty) {
            Ok(()) => {}
            Err(StorageError::TipConflict(_)) => return Err(BlockchainError::ChainAlreadyExists),
            Err(err) => return Err(err.into()),
        }
        info!("Genesis created: {}", hex::encode(&genesis.hash));

        Ok(Blockchain::from_parts(genesis.hash, storage, config))
    }

    /// Opens an existing chain.
    ///
    /// The difficulty recorded at creation replaces the one in `config`.
    /// Stores that predate the record keep the configured difficulty.
    /// Fails with `ChainNotFound` if the store has no tip.
    pub fn open(storage: BlockchainStorage, mut config: ChainConfig) -> Result<Self, BlockchainError> {
        config.validate()?;

        let tip = storage.get_tip()?.ok_or(BlockchainError::ChainNotFound)?;

        if let Some(difficulty) = storage.get_difficulty()? {
            if difficulty != config.difficulty {
                warn!(
                    "Chain was created with difficulty {}, ignoring configured {}",
                    difficulty, config.difficulty
                );
                config.difficulty = difficulty;
                config.validate()?;
            }
        }
        info!("Loaded blockchain with tip {}", hex::encode(&tip));

        Ok(Blockchain::from_parts(tip, storage, config))
    }

    fn from_parts(tip: Vec<u8>, storage: BlockchainStorage, config: ChainConfig) -> Self {
        Blockchain {
            tip: RwLock::new(tip),
            append_lock: Mutex::new(()),
            storage,
            config,
            verifier: Box::new(IdentityMatch),
        }
    }

    /// Replaces the ownership verifier used by the UTXO queries
    pub fn with_verifier(mut self, verifier: Box<dyn OwnershipVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Parameters in effect, including the difficulty the chain was created with
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    /// The underlying block store
    pub fn storage(&self) -> &BlockchainStorage {
        &self.storage
    }

    pub(crate) fn verifier(&self) -> &dyn OwnershipVerifier {
        self.verifier.as_ref()
    }

    fn lock_append(&self) -> Result<MutexGuard<'_, ()>, BlockchainError> {
        self.append_lock
            .lock()
            .map_err(|_| BlockchainError::SystemError("append lock poisoned".to_string()))
    }

    /// Hash of the most recent block
    pub fn tip(&self) -> Result<Vec<u8>, BlockchainError> {
        let tip = self
            .tip
            .read()
            .map_err(|_| BlockchainError::SystemError("tip lock poisoned".to_string()))?;
        Ok(tip.clone())
    }

    fn set_tip(&self, hash: Vec<u8>) -> Result<(), BlockchainError> {
        let mut tip = self
            .tip
            .write()
            .map_err(|_| BlockchainError::SystemError("tip lock poisoned".to_string()))?;
        *tip = hash;
        Ok(())
    }

    /// Mines a block holding `transactions` on top of the current tip and
    /// makes it the new tip
    pub fn append_block(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        self.append_block_with_cancel(transactions, &AtomicBool::new(false))
    }

    /// Like [`append_block`](Self::append_block), but abandons mining when
    /// `cancel` is set. Nothing is written in that case.
    pub fn append_block_with_cancel(
        &self,
        transactions: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Result<Block, BlockchainError> {
        let _append = self.lock_append()?;
        self.mine_and_commit(transactions, cancel)
    }

    /// Builds a transfer from `from` to `to` and mines it into a new block.
    ///
    /// Funding and mining happen under the append lock, so concurrent sends
    /// never select the same outputs. Nothing is appended when the transfer
    /// cannot be funded.
    pub fn send(&self, from: &Address, to: &Address, amount: u64) -> Result<Block, BlockchainError> {
        let _append = self.lock_append()?;
        let tx = Transaction::new_transfer(from, to, amount, self)?;
        self.mine_and_commit(vec![tx], &AtomicBool::new(false))
    }

    // Callers hold the append lock. Readers keep seeing the previous tip
    // until the commit lands.
    fn mine_and_commit(
        &self,
        transactions: Vec<Transaction>,
        cancel: &AtomicBool,
    ) -> Result<Block, BlockchainError> {
        let last_hash = self.storage.get_tip()?.ok_or(BlockchainError::ChainNotFound)?;
        let cached = self.tip()?;
        if last_hash != cached {
            warn!(
                "Stored tip {} differs from cached tip {}",
                hex::encode(&last_hash),
                hex::encode(&cached)
            );
        }

        let block = Block::create_with_cancel(transactions, last_hash.clone(), &self.config, cancel)?;
        self.storage.commit_block(&block, Some(last_hash.as_slice()))?;
        self.set_tip(block.hash.clone())?;

        info!(
            "Appended block {} with {} transaction(s)",
            hex::encode(&block.hash),
            block.transactions.len()
        );
        Ok(block)
    }

    /// Cursor walking from the current tip back to genesis
    pub fn iter(&self) -> Result<ChainIterator<'_>, BlockchainError> {
        Ok(ChainIterator::new(self.tip()?, &self.storage))
    }

    /// Number of blocks reachable from the tip
    pub fn height(&self) -> Result<u64, BlockchainError> {
        let mut height = 0;
        for block in self.iter()? {
            block?;
            height += 1;
        }
        Ok(height)
    }

    /// Previous hash, hash and proof-of-work validity of every block, tip first
    pub fn dump_chain(&self) -> Result<Vec<BlockSummary>, BlockchainError> {
        let mut summaries = Vec::new();
        for block in self.iter()? {
            summaries.push(BlockSummary::from_block(&block?, self.config.difficulty));
        }
        Ok(summaries)
    }

    /// Checks every block's proof of work, recomputed hash and link to its
    /// predecessor
    pub fn is_valid(&self) -> Result<bool, BlockchainError> {
        let tip = self.tip()?;
        let mut expected_hash = tip.clone();

        for block in ChainIterator::new(tip, &self.storage) {
            let block = block?;

            if block.hash != expected_hash {
                return Ok(false);
            }

            let pow = match block.proof_of_work(self.config.difficulty) {
                Ok(pow) => pow,
                Err(_) => return Ok(false),
            };
            if pow.hash_for(block.nonce).as_slice() != block.hash.as_slice() || !pow.validate(block.nonce) {
                return Ok(false);
            }

            expected_hash = block.prev_hash;
        }
        Ok(true)
    }
}

/// Backward cursor over the chain, starting at the tip it was created with
pub struct ChainIterator<'a> {
    current_hash: Vec<u8>,
    storage: &'a BlockchainStorage,
    done: bool,
}

impl<'a> ChainIterator<'a> {
    /// Starts a cursor at `tip`
    pub fn new(tip: Vec<u8>, storage: &'a BlockchainStorage) -> Self {
        ChainIterator {
            current_hash: tip,
            storage,
            done: false,
        }
    }

    /// Loads the block under the cursor and moves the cursor to its parent.
    ///
    /// Once the genesis block has been returned the cursor is empty and any
    /// further call fails with `NotFound`.
    pub fn next_block(&mut self) -> Result<Block, BlockchainError> {
        let block = self.storage.get_block(&self.current_hash)?;
        self.current_hash = block.prev_hash.clone();
        Ok(block)
    }
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, BlockchainError>;

    /// Yields blocks tip first and stops after genesis or the first error
    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = self.next_block();
        match &result {
            Ok(block) => self.done = block.is_genesis(),
            Err(_) => self.done = true,
        }
        Some(result)
    }
}

impl std::iter::FusedIterator for ChainIterator<'_> {}
