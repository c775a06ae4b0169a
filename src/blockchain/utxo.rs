use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::chain::{Blockchain, BlockchainError};
use super::crypto::Address;
use super::transaction::{sum_values, OutPoint, Transaction, TransactionError, TxOutput};

/// A transaction holding at least one output still spendable by the queried
/// identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentTransaction {
    pub transaction: Transaction,

    /// Indices of the outputs that are unspent and owned by the identity,
    /// ascending
    pub unspent_outputs: Vec<usize>,
}

impl UnspentTransaction {
    /// The unspent owned outputs with their indices
    pub fn outputs(&self) -> impl Iterator<Item = (usize, &TxOutput)> + '_ {
        self.unspent_outputs
            .iter()
            .map(move |&index| (index, &self.transaction.outputs[index]))
    }
}

/// Outputs picked to fund a payment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendableOutputs {
    /// Total value of the selected outputs
    pub accumulated: u64,

    /// Selected outputs in scan order
    pub outputs: Vec<OutPoint>,
}

impl Blockchain {
    /// Replays the chain from tip to genesis and collects the transactions
    /// with outputs `identity` has not spent yet.
    ///
    /// Spends are recorded as they are met, so an output counts as unspent
    /// only if no input visited earlier in the walk (a later block, or an
    /// earlier transaction in the same block) consumed it.
    pub fn find_unspent_transactions(
        &self,
        identity: &Address,
    ) -> Result<Vec<UnspentTransaction>, BlockchainError> {
        let verifier = self.verifier();
        let mut unspent = Vec::new();
        let mut spent: HashMap<Vec<u8>, HashSet<i64>> = HashMap::new();

        for block in self.iter()? {
            let block = block?;

            for tx in block.transactions {
                let spent_here = spent.get(&tx.id);
                let unspent_outputs: Vec<usize> = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| {
                        !spent_here.map_or(false, |outs| outs.contains(&(*index as i64)))
                    })
                    .filter(|(_, out)| verifier.is_owned_by(out, identity))
                    .map(|(index, _)| index)
                    .collect();

                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        if verifier.can_unlock(input, identity) {
                            spent
                                .entry(input.ref_tx_id.clone())
                                .or_default()
                                .insert(input.ref_output_index);
                        }
                    }
                }

                if !unspent_outputs.is_empty() {
                    unspent.push(UnspentTransaction {
                        transaction: tx,
                        unspent_outputs,
                    });
                }
            }
        }

        Ok(unspent)
    }

    /// Every output `identity` can still spend
    pub fn find_utxo(&self, identity: &Address) -> Result<Vec<TxOutput>, BlockchainError> {
        let unspent = self.find_unspent_transactions(identity)?;
        Ok(unspent
            .iter()
            .flat_map(|tx| tx.outputs().map(|(_, out)| out.clone()))
            .collect())
    }

    /// Picks unspent outputs of `identity` in scan order until their total
    /// reaches `amount`.
    ///
    /// When the identity cannot afford `amount`, every owned output is
    /// selected and `accumulated` stays below `amount`. Fails with
    /// `ValueOverflow` if the selected total would not fit in a `u64`.
    pub fn find_spendable_outputs(
        &self,
        identity: &Address,
        amount: u64,
    ) -> Result<SpendableOutputs, BlockchainError> {
        let mut spendable = SpendableOutputs::default();

        'scan: for tx in self.find_unspent_transactions(identity)? {
            for (index, out) in tx.outputs() {
                if spendable.accumulated >= amount {
                    break 'scan;
                }

                spendable.accumulated = spendable
                    .accumulated
                    .checked_add(out.value)
                    .ok_or(TransactionError::ValueOverflow)?;
                spendable.outputs.push(OutPoint {
                    tx_id: tx.transaction.id.clone(),
                    index: index as i64,
                });
            }
        }

        Ok(spendable)
    }

    /// Sum of the values `identity` can still spend
    pub fn balance(&self, identity: &Address) -> Result<u64, BlockchainError> {
        Ok(sum_values(&self.find_utxo(identity)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::Block;
    use crate::blockchain::config::ChainConfig;
    use crate::blockchain::crypto::OwnershipVerifier;
    use crate::blockchain::storage::BlockchainStorage;
    use crate::blockchain::transaction::{TransactionError, TxInput};
    use proptest::prelude::*;

    fn address(name: &str) -> Address {
        Address::from(name)
    }

    fn new_chain(owner: &str) -> Blockchain {
        let config = ChainConfig::default().with_difficulty(4);
        Blockchain::init(BlockchainStorage::temporary().unwrap(), config, &address(owner)).unwrap()
    }

    fn all_blocks(chain: &Blockchain) -> Vec<Block> {
        chain.iter().unwrap().collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn test_genesis_balance() {
        let chain = new_chain("Alice");

        assert_eq!(chain.balance(&address("Alice")).unwrap(), 100);
        assert_eq!(chain.balance(&address("Bob")).unwrap(), 0);
        assert_eq!(chain.find_utxo(&address("Alice")).unwrap().len(), 1);
    }

    #[test]
    fn test_transfer_scenario() {
        let chain = new_chain("Alice");
        let (alice, bob) = (address("Alice"), address("Bob"));

        let tx = Transaction::new_transfer(&alice, &bob, 30, &chain).unwrap();
        chain.append_block(vec![tx]).unwrap();

        assert_eq!(chain.balance(&alice).unwrap(), 70);
        assert_eq!(chain.balance(&bob).unwrap(), 30);

        let tip = chain.tip().unwrap();
        let result = chain.send(&alice, &bob, 80);
        assert!(matches!(
            result,
            Err(BlockchainError::TransactionError(TransactionError::InsufficientFunds {
                required: 80,
                available: 70
            }))
        ));
        assert_eq!(chain.tip().unwrap(), tip);
        assert_eq!(chain.height().unwrap(), 2);
    }

    #[test]
    fn test_spent_outputs_are_excluded() {
        let chain = new_chain("Alice");
        let (alice, bob, carol) = (address("Alice"), address("Bob"), address("Carol"));

        chain.send(&alice, &bob, 30).unwrap();
        chain.send(&bob, &carol, 30).unwrap();
        chain.send(&alice, &carol, 70).unwrap();

        assert_eq!(chain.balance(&alice).unwrap(), 0);
        assert_eq!(chain.balance(&bob).unwrap(), 0);
        assert_eq!(chain.balance(&carol).unwrap(), 100);
        assert!(chain.find_unspent_transactions(&alice).unwrap().is_empty());
        assert_eq!(chain.find_utxo(&carol).unwrap().len(), 2);
    }

    #[test]
    fn test_self_transfer_counts_each_output_once() {
        let chain = new_chain("Alice");
        let alice = address("Alice");

        chain.send(&alice, &alice, 40).unwrap();

        let unspent = chain.find_unspent_transactions(&alice).unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].unspent_outputs, vec![0, 1]);
        assert_eq!(chain.balance(&alice).unwrap(), 100);
    }

    #[test]
    fn test_partially_spent_transaction() {
        let chain = new_chain("Alice");
        let (alice, bob) = (address("Alice"), address("Bob"));

        // Alice -> Alice gives two Alice outputs (40, 60) in one transaction
        let split = chain.send(&alice, &alice, 40).unwrap();
        let split_id = split.transactions[0].id.clone();

        // Spend only the first of them
        let spend = Transaction::new(
            vec![TxInput {
                ref_tx_id: split_id.clone(),
                ref_output_index: 0,
                proof: "Alice".to_string(),
            }],
            vec![TxOutput { value: 40, owner: bob.clone() }],
        )
        .unwrap();
        chain.append_block(vec![spend]).unwrap();

        let unspent = chain.find_unspent_transactions(&alice).unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].transaction.id, split_id);
        assert_eq!(unspent[0].unspent_outputs, vec![1]);
        assert_eq!(chain.balance(&alice).unwrap(), 60);
        assert_eq!(chain.balance(&bob).unwrap(), 40);
    }

    #[test]
    fn test_spend_in_same_block_is_not_seen() {
        let chain = new_chain("Alice");
        let (alice, bob) = (address("Alice"), address("Bob"));

        let genesis = all_blocks(&chain).pop().unwrap();
        let coinbase_id = genesis.transactions[0].id.clone();

        // Defining transaction placed before its spender inside one block:
        // the walk meets the output before the input, so it stays unspent.
        let funding = Transaction::new(
            vec![TxInput {
                ref_tx_id: coinbase_id,
                ref_output_index: 0,
                proof: "Alice".to_string(),
            }],
            vec![TxOutput { value: 100, owner: alice.clone() }],
        )
        .unwrap();
        let spender = Transaction::new(
            vec![TxInput {
                ref_tx_id: funding.id.clone(),
                ref_output_index: 0,
                proof: "Alice".to_string(),
            }],
            vec![TxOutput { value: 100, owner: bob.clone() }],
        )
        .unwrap();
        chain.append_block(vec![funding.clone(), spender]).unwrap();

        let unspent = chain.find_unspent_transactions(&alice).unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].transaction.id, funding.id);
        assert_eq!(chain.balance(&bob).unwrap(), 100);
    }

    #[test]
    fn test_spendable_outputs_stop_when_covered() {
        let chain = new_chain("Alice");
        let (alice, bob) = (address("Alice"), address("Bob"));

        // Leave Bob with three outputs of 10
        for _ in 0..3 {
            chain.send(&alice, &bob, 10).unwrap();
        }

        let spendable = chain.find_spendable_outputs(&bob, 15).unwrap();
        assert_eq!(spendable.accumulated, 20);
        assert_eq!(spendable.outputs.len(), 2);

        let all = chain.find_spendable_outputs(&bob, 1_000).unwrap();
        assert_eq!(all.accumulated, 30);
        assert_eq!(all.outputs.len(), 3);

        let tx = Transaction::new_transfer(&bob, &alice, 25, &chain).unwrap();
        assert_eq!(tx.inputs.len(), 3);
        assert_eq!(tx.outputs[1], TxOutput { value: 5, owner: bob });
    }

    #[test]
    fn test_coinbase_inputs_never_mark_spends() {
        let chain = new_chain("Alice");
        let alice = address("Alice");

        // A coinbase whose memo happens to equal an identity must not spend anything
        let reward = Transaction::new_coinbase(&address("Bob"), "Alice", 100).unwrap();
        chain.append_block(vec![reward]).unwrap();

        assert_eq!(chain.balance(&alice).unwrap(), 100);
    }

    #[test]
    fn test_value_overflow_is_an_error() {
        let alice = address("Alice");
        let config = ChainConfig::default().with_difficulty(4).with_mining_reward(u64::MAX);
        let chain = Blockchain::init(BlockchainStorage::temporary().unwrap(), config, &alice).unwrap();

        let reward = Transaction::new_coinbase(&alice, "", 1).unwrap();
        chain.append_block(vec![reward]).unwrap();
        let tip = chain.tip().unwrap();

        assert!(matches!(
            chain.balance(&alice),
            Err(BlockchainError::TransactionError(TransactionError::ValueOverflow))
        ));
        assert!(matches!(
            chain.find_spendable_outputs(&alice, 2),
            Err(BlockchainError::TransactionError(TransactionError::ValueOverflow))
        ));
        assert!(matches!(
            chain.send(&alice, &address("Bob"), 2),
            Err(BlockchainError::TransactionError(TransactionError::ValueOverflow))
        ));
        assert_eq!(chain.tip().unwrap(), tip);

        // A single output still covers amounts it can pay on its own
        let spendable = chain.find_spendable_outputs(&alice, 1).unwrap();
        assert_eq!(spendable.accumulated, 1);
    }

    struct CaseInsensitive;

    impl OwnershipVerifier for CaseInsensitive {
        fn can_unlock(&self, input: &TxInput, identity: &Address) -> bool {
            input.proof.eq_ignore_ascii_case(identity.as_str())
        }

        fn is_owned_by(&self, output: &TxOutput, identity: &Address) -> bool {
            output.owner.as_str().eq_ignore_ascii_case(identity.as_str())
        }
    }

    #[test]
    fn test_queries_go_through_the_verifier() {
        let chain = new_chain("Alice").with_verifier(Box::new(CaseInsensitive));

        assert_eq!(chain.balance(&address("ALICE")).unwrap(), 100);

        chain.send(&address("alice"), &address("Bob"), 25).unwrap();
        assert_eq!(chain.balance(&address("Alice")).unwrap(), 75);
        assert_eq!(chain.balance(&address("bob")).unwrap(), 25);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_transfers_conserve_value(amounts in proptest::collection::vec(1u64..60, 1..5)) {
            let chain = new_chain("Alice");
            let names = ["Alice", "Bob", "Carol"];

            for (i, amount) in amounts.iter().enumerate() {
                let from = address(names[i % 3]);
                let to = address(names[(i + 1) % 3]);
                let before = chain.balance(&from).unwrap();

                match Transaction::new_transfer(&from, &to, *amount, &chain) {
                    Ok(tx) => {
                        prop_assert!(before >= *amount);
                        chain.append_block(vec![tx]).unwrap();
                    }
                    Err(BlockchainError::TransactionError(TransactionError::InsufficientFunds { .. })) => {
                        prop_assert!(before < *amount);
                        let spendable = chain.find_spendable_outputs(&from, *amount).unwrap();
                        prop_assert_eq!(spendable.accumulated, before);
                    }
                    Err(err) => return Err(TestCaseError::fail(err.to_string())),
                }
            }

            let total: u64 = names
                .iter()
                .map(|name| chain.balance(&address(name)).unwrap())
                .sum();
            prop_assert_eq!(total, 100);

            for block in all_blocks(&chain) {
                for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                    let spent: u64 = tx
                        .inputs
                        .iter()
                        .map(|input| find_output(&chain, &input.ref_tx_id, input.ref_output_index))
                        .sum();
                    prop_assert_eq!(spent, tx.total_output().unwrap());
                }
            }
        }

        #[test]
        fn prop_spendable_covers_affordable_amounts(amount in 1u64..=150) {
            let chain = new_chain("Alice");
            chain.send(&address("Alice"), &address("Bob"), 25).unwrap();

            let alice = address("Alice");
            let balance = chain.balance(&alice).unwrap();
            let spendable = chain.find_spendable_outputs(&alice, amount).unwrap();

            if balance >= amount {
                prop_assert!(spendable.accumulated >= amount);
            } else {
                prop_assert!(spendable.accumulated < amount);
                prop_assert_eq!(spendable.accumulated, balance);
            }
        }
    }

    fn find_output(chain: &Blockchain, tx_id: &[u8], index: i64) -> u64 {
        all_blocks(chain)
            .iter()
            .flat_map(|block| block.transactions.iter())
            .find(|tx| tx.id == tx_id)
            .map(|tx| tx.outputs[index as usize].value)
            .unwrap()
    }
}
