use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use primitive_types::U256;
use rayon::prelude::*;
use thiserror::Error;

use super::crypto::{sha256, HASH_LEN};

/// Difficulty used when nothing else is configured
pub const DEFAULT_DIFFICULTY: u32 = 12;

/// Errors that can occur while searching for or checking a proof of work
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("Difficulty must be between 1 and 256 bits, got {0}")]
    InvalidDifficulty(u32),

    #[error("Nonce space exhausted after {limit} attempts")]
    MiningExhausted { limit: u64 },

    #[error("Mining was cancelled")]
    MiningCancelled,

    #[error("Failed to start mining workers: {0}")]
    WorkerPool(String),
}

/// Searches for a nonce whose digest falls below `2^(256 - difficulty)`.
///
/// The hashed data is `prev_hash ++ transactions_digest ++ be(nonce) ++
/// be(difficulty)`, with both integers written as 8 bytes.
#[derive(Debug, Clone)]
pub struct ProofOfWork<'a> {
    prev_hash: &'a [u8],
    transactions_digest: [u8; HASH_LEN],
    difficulty: u32,
    target: U256,
    nonce_limit: u64,
    workers: usize,
}

impl<'a> ProofOfWork<'a> {
    pub fn new(
        prev_hash: &'a [u8],
        transactions_digest: [u8; HASH_LEN],
        difficulty: u32,
    ) -> Result<Self, ProofError> {
        if difficulty == 0 || difficulty > 256 {
            return Err(ProofError::InvalidDifficulty(difficulty));
        }

        Ok(ProofOfWork {
            prev_hash,
            transactions_digest,
            difficulty,
            target: U256::one() << (256 - difficulty),
            nonce_limit: u64::MAX,
            workers: 1,
        })
    }

    /// Bounds the search to nonces in `0..limit`
    pub fn with_nonce_limit(mut self, limit: u64) -> Self {
        self.nonce_limit = limit;
        self
    }

    /// Spreads the search over `workers` threads when greater than one
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn target(&self) -> U256 {
        self.target
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Bytes hashed for a candidate nonce
    pub fn init_data(&self, nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.prev_hash.len() + HASH_LEN + 16);
        data.extend_from_slice(self.prev_hash);
        data.extend_from_slice(&self.transactions_digest);
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(&u64::from(self.difficulty).to_be_bytes());
        data
    }

    pub fn hash_for(&self, nonce: u64) -> [u8; HASH_LEN] {
        sha256(&self.init_data(nonce))
    }

    /// Whether `hash`, read as a big-endian integer, is strictly below the target
    pub fn meets_target(&self, hash: &[u8; HASH_LEN]) -> bool {
        U256::from_big_endian(hash) < self.target
    }

    /// Finds the first nonce (or, with several workers, any nonce) that
    /// satisfies the target
    pub fn run(&self) -> Result<(u64, [u8; HASH_LEN]), ProofError> {
        self.run_with_cancel(&AtomicBool::new(false))
    }

    /// Like [`run`](Self::run), but gives up with `MiningCancelled` as soon
    /// as `cancel` is set
    pub fn run_with_cancel(&self, cancel: &AtomicBool) -> Result<(u64, [u8; HASH_LEN]), ProofError> {
        let (nonce, hash) = if self.workers > 1 {
            self.search_parallel(cancel)?
        } else {
            self.search(cancel)?
        };

        debug!(
            "Found nonce {} at difficulty {}: {}",
            nonce,
            self.difficulty,
            hex::encode(hash)
        );
        Ok((nonce, hash))
    }

    /// Recomputes the digest for `nonce` without searching
    pub fn validate(&self, nonce: u64) -> bool {
        self.meets_target(&self.hash_for(nonce))
    }

    fn search(&self, cancel: &AtomicBool) -> Result<(u64, [u8; HASH_LEN]), ProofError> {
        for nonce in 0..self.nonce_limit {
            if cancel.load(Ordering::Relaxed) {
                return Err(ProofError::MiningCancelled);
            }

            let hash = self.hash_for(nonce);
            if self.meets_target(&hash) {
                return Ok((nonce, hash));
            }
        }

        Err(ProofError::MiningExhausted {
            limit: self.nonce_limit,
        })
    }

    fn search_parallel(&self, cancel: &AtomicBool) -> Result<(u64, [u8; HASH_LEN]), ProofError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| ProofError::WorkerPool(e.to_string()))?;

        let found = pool.install(|| {
            (0..self.nonce_limit).into_par_iter().find_map_any(|nonce| {
                if cancel.load(Ordering::Relaxed) {
                    return Some(Err(ProofError::MiningCancelled));
                }

                let hash = self.hash_for(nonce);
                if self.meets_target(&hash) {
                    Some(Ok((nonce, hash)))
                } else {
                    None
                }
            })
        });

        found.unwrap_or(Err(ProofError::MiningExhausted {
            limit: self.nonce_limit,
        }))
    }
}
