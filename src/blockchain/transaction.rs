use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::chain::{Blockchain, BlockchainError};
use super::crypto::{sha256, Address};

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_OUTPUT_INDEX: i64 = -1;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Encoding error: {0}")]
    EncodeError(String),

    #[error("Output values overflow u64")]
    ValueOverflow,
}

/// Adds up output values, failing instead of wrapping past `u64::MAX`
///
/// # Arguments
///
/// * `outputs` - The outputs to total
///
/// # Returns
///
/// The sum of their values, or `ValueOverflow`
pub fn sum_values<'a, I>(outputs: I) -> Result<u64, TransactionError>
where
    I: IntoIterator<Item = &'a TxOutput>,
{
    outputs.into_iter().try_fold(0u64, |total, out| {
        total
            .checked_add(out.value)
            .ok_or(TransactionError::ValueOverflow)
    })
}

/// Reference to an output of an earlier transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction holding the referenced output (empty for coinbase)
    pub ref_tx_id: Vec<u8>,

    /// Index of the referenced output, or `-1` for coinbase
    pub ref_output_index: i64,

    /// Ownership proof of the spender
    pub proof: String,
}

/// A value claim held by an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TxOutput {
    pub value: u64,
    pub owner: Address,
}

/// Identifies a single output within the chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: Vec<u8>,
    pub index: i64,
}

/// A transfer of value expressed as consumed outputs and created outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 over the encoded inputs and outputs
    pub id: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Builds a transaction from its parts and assigns its id
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Result<Self, TransactionError> {
        let mut tx = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };
        tx.set_id()?;
        Ok(tx)
    }

    /// Creates a reward transaction paying `reward` to `owner`.
    ///
    /// An empty `memo` is replaced by `"Coins to <owner>"`.
    pub fn new_coinbase(owner: &Address, memo: &str, reward: u64) -> Result<Self, TransactionError> {
        let memo = if memo.is_empty() {
            format!("Coins to {}", owner)
        } else {
            memo.to_string()
        };

        let input = TxInput {
            ref_tx_id: Vec::new(),
            ref_output_index: COINBASE_OUTPUT_INDEX,
            proof: memo,
        };
        let output = TxOutput {
            value: reward,
            owner: owner.clone(),
        };

        Transaction::new(vec![input], vec![output])
    }

    /// Creates a transfer of `amount` from `from` to `to`, funded by the
    /// first unspent outputs of `from` found on `chain`.
    ///
    /// Any surplus is returned to `from` as a second output.
    pub fn new_transfer(
        from: &Address,
        to: &Address,
        amount: u64,
        chain: &Blockchain,
    ) -> Result<Self, BlockchainError> {
        if amount == 0 {
            return Err(TransactionError::InvalidAmount("amount must be positive".to_string()).into());
        }

        let spendable = chain.find_spendable_outputs(from, amount)?;
        if spendable.accumulated < amount {
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available: spendable.accumulated,
            }
            .into());
        }

        let inputs = spendable
            .outputs
            .into_iter()
            .map(|out| TxInput {
                ref_tx_id: out.tx_id,
                ref_output_index: out.index,
                proof: from.0.clone(),
            })
            .collect();

        let mut outputs = vec![TxOutput {
            value: amount,
            owner: to.clone(),
        }];
        if spendable.accumulated > amount {
            outputs.push(TxOutput {
                value: spendable.accumulated - amount,
                owner: from.clone(),
            });
        }

        Ok(Transaction::new(inputs, outputs)?)
    }

    /// Recomputes the id from the inputs and outputs
    pub fn set_id(&mut self) -> Result<(), TransactionError> {
        self.id = self.compute_id()?.to_vec();
        Ok(())
    }

    /// Digest of the canonical encoding of `(inputs, outputs)`; the id field
    /// itself never takes part
    pub fn compute_id(&self) -> Result<[u8; 32], TransactionError> {
        let encoded = bincode::serialize(&(&self.inputs, &self.outputs))
            .map_err(|e| TransactionError::EncodeError(e.to_string()))?;
        Ok(sha256(&encoded))
    }

    /// A coinbase has exactly one input, with no referenced transaction and
    /// output index `-1`
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].ref_tx_id.is_empty()
            && self.inputs[0].ref_output_index == COINBASE_OUTPUT_INDEX
    }

    /// Sum of the output values
    pub fn total_output(&self) -> Result<u64, TransactionError> {
        sum_values(&self.outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::config::ChainConfig;
    use crate::blockchain::storage::BlockchainStorage;

    fn test_chain(owner: &str) -> Blockchain {
        let storage = BlockchainStorage::temporary().unwrap();
        let config = ChainConfig::default().with_difficulty(8);
        Blockchain::init(storage, config, &Address::from(owner)).unwrap()
    }

    #[test]
    fn test_coinbase_transaction() {
        let miner = Address::from("miner");
        let tx = Transaction::new_coinbase(&miner, "", 100).unwrap();

        assert!(tx.is_coinbase());
        assert_eq!(tx.inputs[0].proof, "Coins to miner");
        assert_eq!(tx.outputs, vec![TxOutput { value: 100, owner: miner }]);
        assert_eq!(tx.id.len(), 32);
    }

    #[test]
    fn test_id_excludes_id_field() {
        let mut tx = Transaction::new_coinbase(&Address::from("a"), "memo", 100).unwrap();
        let first_id = tx.id.clone();

        tx.id = vec![0xff; 32];
        tx.set_id().unwrap();
        assert_eq!(tx.id, first_id);

        tx.outputs[0].value = 99;
        tx.set_id().unwrap();
        assert_ne!(tx.id, first_id);
    }

    #[test]
    fn test_not_coinbase() {
        let tx = Transaction::new(
            vec![TxInput {
                ref_tx_id: vec![1; 32],
                ref_output_index: COINBASE_OUTPUT_INDEX,
                proof: "a".to_string(),
            }],
            vec![],
        )
        .unwrap();
        assert!(!tx.is_coinbase());

        let two_inputs = Transaction::new(
            vec![
                TxInput {
                    ref_tx_id: Vec::new(),
                    ref_output_index: COINBASE_OUTPUT_INDEX,
                    proof: "a".to_string(),
                };
                2
            ],
            vec![],
        )
        .unwrap();
        assert!(!two_inputs.is_coinbase());
    }

    #[test]
    fn test_transfer_with_change() {
        let chain = test_chain("Alice");
        let alice = Address::from("Alice");
        let bob = Address::from("Bob");

        let tx = Transaction::new_transfer(&alice, &bob, 30, &chain).unwrap();

        assert!(!tx.is_coinbase());
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].ref_output_index, 0);
        assert_eq!(tx.inputs[0].proof, "Alice");
        assert_eq!(
            tx.outputs,
            vec![
                TxOutput { value: 30, owner: bob },
                TxOutput { value: 70, owner: alice },
            ]
        );
    }

    #[test]
    fn test_transfer_exact_amount_has_no_change() {
        let chain = test_chain("Alice");
        let tx = Transaction::new_transfer(&Address::from("Alice"), &Address::from("Bob"), 100, &chain)
            .unwrap();

        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.total_output().unwrap(), 100);
    }

    #[test]
    fn test_total_output_overflow() {
        let owner = Address::from("Alice");
        let tx = Transaction::new(
            Vec::new(),
            vec![
                TxOutput { value: u64::MAX, owner: owner.clone() },
                TxOutput { value: 1, owner },
            ],
        )
        .unwrap();

        assert!(matches!(tx.total_output(), Err(TransactionError::ValueOverflow)));
        assert_eq!(sum_values(&tx.outputs[..1]).unwrap(), u64::MAX);
    }

    #[test]
    fn test_transfer_insufficient_funds() {
        let chain = test_chain("Alice");
        let result = Transaction::new_transfer(&Address::from("Bob"), &Address::from("Alice"), 1, &chain);

        assert!(matches!(
            result,
            Err(BlockchainError::TransactionError(TransactionError::InsufficientFunds {
                required: 1,
                available: 0
            }))
        ));
    }

    #[test]
    fn test_transfer_zero_amount() {
        let chain = test_chain("Alice");
        let result = Transaction::new_transfer(&Address::from("Alice"), &Address::from("Bob"), 0, &chain);

        assert!(matches!(
            result,
            Err(BlockchainError::TransactionError(TransactionError::InvalidAmount(_)))
        ));
    }
}
