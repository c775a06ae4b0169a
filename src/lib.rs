//! Single-node proof-of-work ledger with a UTXO transaction model.

pub mod api;
pub mod blockchain;
