use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::proof::DEFAULT_DIFFICULTY;

/// Value credited by a coinbase transaction
pub const DEFAULT_MINING_REWARD: u64 = 100;

/// Memo carried by the coinbase of the genesis block
pub const GENESIS_MEMO: &str = "First transaction from Genesis";

/// Errors raised by an inconsistent configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid difficulty {0}: must be between 1 and 256")]
    InvalidDifficulty(u32),

    #[error("Mining reward must be positive")]
    ZeroReward,

    #[error("At least one mining worker is required")]
    NoWorkers,
}

/// Parameters shared by every operation on one chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Number of leading zero bits required in a block hash
    pub difficulty: u32,

    /// Value paid by coinbase transactions
    pub mining_reward: u64,

    /// Memo placed in the genesis coinbase input
    pub genesis_memo: String,

    /// Threads used by the nonce search
    pub mining_workers: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            difficulty: DEFAULT_DIFFICULTY,
            mining_reward: DEFAULT_MINING_REWARD,
            genesis_memo: GENESIS_MEMO.to_string(),
            mining_workers: 1,
        }
    }
}

impl ChainConfig {
    /// Sets the difficulty used when creating a chain.
    ///
    /// An existing chain keeps the difficulty it was created with.
    ///
    /// # Arguments
    ///
    /// * `difficulty` - Leading zero bits, between 1 and 256
    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Sets the value paid by the genesis coinbase
    pub fn with_mining_reward(mut self, reward: u64) -> Self {
        self.mining_reward = reward;
        self
    }

    /// Sets the genesis memo; an empty memo falls back to `"Coins to <owner>"`
    pub fn with_genesis_memo(mut self, memo: impl Into<String>) -> Self {
        self.genesis_memo = memo.into();
        self
    }

    /// Sets how many threads search for nonces
    pub fn with_mining_workers(mut self, workers: usize) -> Self {
        self.mining_workers = workers;
        self
    }

    /// Checks that the parameters describe a usable chain
    ///
    /// # Returns
    ///
    /// Ok(()) if the difficulty is in range and the reward and worker count
    /// are positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.difficulty == 0 || self.difficulty > 256 {
            return Err(ConfigError::InvalidDifficulty(self.difficulty));
        }
        if self.mining_reward == 0 {
            return Err(ConfigError::ZeroReward);
        }
        if self.mining_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }
}
