//! accrual-core: pro-rata reward accrual ledger.
//!
//! Tracks stake contributed by many participants and splits a continuously arriving reward
//! stream among them by stake and holding time, without ever walking the participant set on
//! a write. Two engines share one settlement core:
//!
//! - [`tracker::RewardTracker`]: one stake ledger bound to one polled [`RewardDistributor`].
//! - [`engine::MultiPoolEngine`]: N weighted pools x M reward tokens funded by direct deposits.
//!
//! Every mutating entry point settles pending rewards for the affected account(s) before any
//! stake mutation. The core is IO-free; token movement, reward emission and time are reached
//! only through the [`TokenBank`], [`RewardDistributor`] and [`Clock`] traits.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod bank;
pub mod config;
pub mod distributor;
pub mod engine;
pub mod events;
pub mod guard;
pub mod hash;
pub mod invariants;
pub mod ledger;
pub mod math;
pub mod metrics;
pub mod settlement;
pub mod tracker;

pub use bank::{InMemoryBank, SharedBank, TokenBank};
pub use config::AccrualConfig;
pub use distributor::{Clock, LinearDistributor, ManualClock, ManualDistributor, RewardDistributor, SystemClock};
pub use engine::MultiPoolEngine;
pub use events::LedgerEvent;
pub use math::{Bps, PRECISION, U256};
pub use tracker::RewardTracker;

/// Domain tag for label-derived identifiers.
pub const ID_DERIVATION_DOMAIN_V1: &[u8] = b"ACCRUAL_ID_V1";

fn derive_id(kind: &[u8], label: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ID_DERIVATION_DOMAIN_V1);
    hasher.update(kind);
    hasher.update((label.len() as u32).to_le_bytes());
    hasher.update(label.as_bytes());
    hasher.finalize().into()
}

fn parse_hex_id(s: &str) -> std::result::Result<[u8; 32], String> {
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex id: {e}"))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("id must be 32 bytes, got {}", b.len()))
}

/// Participant / custody identifier. `AccountId::ZERO` is the null account.
///
/// Serialized as 64 hex characters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    pub const ZERO: AccountId = AccountId([0u8; 32]);

    /// Deterministic id from a human label (tests, scenarios).
    pub fn derive(label: &str) -> AccountId {
        AccountId(derive_id(b"account", label))
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> String {
        hex::encode(id.0)
    }
}

impl TryFrom<String> for AccountId {
    type Error = String;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        parse_hex_id(&s).map(AccountId)
    }
}

/// Token (asset) identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TokenId(pub [u8; 32]);

impl TokenId {
    pub fn derive(label: &str) -> TokenId {
        TokenId(derive_id(b"token", label))
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl From<TokenId> for String {
    fn from(id: TokenId) -> String {
        hex::encode(id.0)
    }
}

impl TryFrom<String> for TokenId {
    type Error = String;
    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        parse_hex_id(&s).map(TokenId)
    }
}

/// Dense pool index, assigned in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub u32);

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// Unified error type for ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccrualError {
    // Validation errors
    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("zero address")]
    ZeroAddress,

    #[error("invalid amount: requested {requested}, available {available}")]
    InvalidAmount { requested: u128, available: u128 },

    #[error("invalid asset {0}")]
    InvalidAsset(TokenId),

    #[error("unknown reward token {0}")]
    UnknownRewardToken(TokenId),

    #[error("unknown pool {0}")]
    UnknownPool(PoolId),

    #[error("a pool for stake asset {0} already exists")]
    DuplicatePool(TokenId),

    #[error("reward token {0} already registered")]
    DuplicateRewardToken(TokenId),

    #[error("allocation weight must be greater than zero")]
    InvalidWeight,

    #[error("deposit fee {bps}bp exceeds cap {max_bps}bp")]
    DepositFeeTooHigh { bps: u16, max_bps: u16 },

    #[error("referrer must differ from depositor")]
    SelfReferral,

    #[error("invalid withdraw amount: requested {requested}, available {available}")]
    InvalidWithdrawAmount { requested: u128, available: u128 },

    // Authorization errors
    #[error("caller {0} is not an approved handler")]
    InvalidHandler(AccountId),

    // Concurrency
    #[error("re-entrant call rejected")]
    Reentrancy,

    // Collaborator errors
    #[error("insufficient balance of {token} held by {holder}: requested {requested}, available {available}")]
    InsufficientBalance {
        token: TokenId,
        holder: AccountId,
        requested: u128,
        available: u128,
    },

    #[error("token bank error: {0}")]
    Bank(String),

    // Bounds / arithmetic
    #[error("bound exceeded: {0}")]
    BoundExceeded(String),

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, AccrualError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_stable_and_distinct() {
        assert_eq!(AccountId::derive("alice"), AccountId::derive("alice"));
        assert_ne!(AccountId::derive("alice"), AccountId::derive("bob"));
        assert!(!AccountId::derive("alice").is_zero());
        // Same label, different kind.
        assert_ne!(AccountId::derive("x").0, TokenId::derive("x").0);
    }

    #[test]
    fn display_is_short_hex() {
        let id = AccountId([0xab; 32]);
        assert_eq!(id.to_string(), "abababababababab");
        assert_eq!(PoolId(3).to_string(), "pool#3");
    }

    #[test]
    fn ids_serialize_as_full_hex() {
        let id = TokenId::derive("reward");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json.len(), 66);
        assert_eq!(serde_json::from_str::<TokenId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<AccountId>("\"abcd\"").is_err());
    }
}
