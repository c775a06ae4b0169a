use std::sync::atomic::AtomicBool;

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::ChainConfig;
use super::crypto::{sha256, HASH_LEN};
use super::proof::{ProofError, ProofOfWork};
use super::transaction::Transaction;

/// Upper bound on the encoded size of a block
const MAX_BLOCK_BYTES: u64 = 32 * 1024 * 1024;

/// Errors that can occur while building or encoding a block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Block must contain at least one transaction")]
    NoTransactions,

    #[error("Proof of work error: {0}")]
    ProofError(#[from] ProofError),

    #[error("Encoding error: {0}")]
    EncodeError(String),

    #[error("Decoding error: {0}")]
    DecodeError(String),
}

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Digest found by the proof-of-work search
    pub hash: Vec<u8>,

    /// Transactions in the order they were submitted
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block, empty for the genesis block
    pub prev_hash: Vec<u8>,

    /// Nonce that produced `hash`
    pub nonce: u64,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_BLOCK_BYTES)
        .reject_trailing_bytes()
}

impl Block {
    /// Mines a new block on top of `prev_hash`
    pub fn create(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        config: &ChainConfig,
    ) -> Result<Self, BlockError> {
        Block::create_with_cancel(transactions, prev_hash, config, &AtomicBool::new(false))
    }

    /// Mines a new block, giving up as soon as `cancel` is set
    pub fn create_with_cancel(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        config: &ChainConfig,
        cancel: &AtomicBool,
    ) -> Result<Self, BlockError> {
        if transactions.is_empty() {
            return Err(BlockError::NoTransactions);
        }

        let mut block = Block {
            hash: Vec::new(),
            transactions,
            prev_hash,
            nonce: 0,
        };

        let (nonce, hash) = block
            .proof_of_work(config.difficulty)?
            .with_workers(config.mining_workers)
            .run_with_cancel(cancel)?;

        block.nonce = nonce;
        block.hash = hash.to_vec();
        Ok(block)
    }

    /// Mines the first block of a chain around its coinbase
    pub fn genesis(coinbase: Transaction, config: &ChainConfig) -> Result<Self, BlockError> {
        Block::create(vec![coinbase], Vec::new(), config)
    }

    /// The genesis block is the only one without a predecessor
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// SHA-256 over the concatenated transaction ids
    pub fn hash_transactions(&self) -> [u8; HASH_LEN] {
        let ids: Vec<u8> = self
            .transactions
            .iter()
            .flat_map(|tx| tx.id.iter().copied())
            .collect();
        sha256(&ids)
    }

    /// Proof-of-work search bound to this block's pre-mining fields
    pub fn proof_of_work(&self, difficulty: u32) -> Result<ProofOfWork<'_>, ProofError> {
        ProofOfWork::new(&self.prev_hash, self.hash_transactions(), difficulty)
    }

    /// Checks the stored nonce against `difficulty` without searching
    pub fn validate_pow(&self, difficulty: u32) -> bool {
        match self.proof_of_work(difficulty) {
            Ok(pow) => pow.validate(self.nonce),
            Err(_) => false,
        }
    }

    /// Encodes the block for storage
    ///
    /// # Returns
    ///
    /// The bincode encoding of every field, in declaration order
    pub fn serialize(&self) -> Result<Vec<u8>, BlockError> {
        codec()
            .serialize(self)
            .map_err(|e| BlockError::EncodeError(e.to_string()))
    }

    /// Decodes a block written by [`serialize`](Self::serialize)
    ///
    /// # Arguments
    ///
    /// * `data` - The stored bytes
    ///
    /// # Returns
    ///
    /// The block, or `DecodeError` for truncated, oversized or trailing data
    pub fn deserialize(data: &[u8]) -> Result<Self, BlockError> {
        codec()
            .deserialize(data)
            .map_err(|e| BlockError::DecodeError(e.to_string()))
    }
}
