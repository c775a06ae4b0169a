// Blockchain module
//
// This module contains the core ledger implementation including:
// - Block structure and encoding
// - Proof of work search and validation
// - Transaction / UTXO model
// - Persistent chain store and backward iteration
// - Unspent output queries

pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod proof;
pub mod storage;
pub mod transaction;
pub mod utxo;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{BlockSummary, Blockchain, BlockchainError, ChainIterator};
pub use config::ChainConfig;
pub use crypto::{Address, IdentityMatch, OwnershipVerifier};
pub use proof::ProofOfWork;
pub use storage::BlockchainStorage;
pub use transaction::{OutPoint, Transaction, TxInput, TxOutput};
pub use utxo::{SpendableOutputs, UnspentTransaction};
