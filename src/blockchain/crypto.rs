use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;
use std::str::FromStr;

use super::transaction::{TxInput, TxOutput};

/// Length in bytes of every digest produced by [`sha256`]
pub const HASH_LEN: usize = 32;

/// Errors that can occur while handling identities
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Computes the SHA-256 digest of `data`
pub fn sha256(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// An identity that can own outputs and sign inputs.
///
/// There are no keys behind an address: ownership is asserted by presenting
/// the same string in an input's proof field (see [`IdentityMatch`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Address(pub String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CryptoError::InvalidAddress("address must not be empty".to_string()));
        }

        Ok(Address(trimmed.to_string()))
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address(s.to_string())
    }
}

/// Decides whether an identity controls an input or an output.
///
/// The chain and the UTXO queries only ever ask ownership questions through
/// this trait, so a signature scheme can replace [`IdentityMatch`] without
/// touching either.
pub trait OwnershipVerifier: Send + Sync {
    /// Whether `identity` is allowed to spend the output referenced by `input`
    fn can_unlock(&self, input: &TxInput, identity: &Address) -> bool;

    /// Whether `output` belongs to `identity`
    fn is_owned_by(&self, output: &TxOutput, identity: &Address) -> bool;
}

/// Plain string comparison between the proof/owner fields and the identity.
///
/// Offers no security whatsoever: anyone can claim any identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMatch;

impl OwnershipVerifier for IdentityMatch {
    fn can_unlock(&self, input: &TxInput, identity: &Address) -> bool {
        input.proof == identity.0
    }

    fn is_owned_by(&self, output: &TxOutput, identity: &Address) -> bool {
        output.owner == *identity
    }
}
