//! Pool, stream and position records of the multi-pool engine.

use crate::math::{Bps, U256};
use crate::settlement::{RewardAccumulator, RewardCheckpoint, StakeSupply};
use crate::TokenId;
use serde::Serialize;
use std::collections::BTreeMap;

/// Public view of a pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub stake_asset: TokenId,
    pub weight: u64,
    pub deposit_fee: Bps,
    /// Sum of all positions. Tracked explicitly rather than read from custody so that stray
    /// transfers of the stake asset cannot dilute the pool.
    pub total_staked: u128,
}

impl StakeSupply for PoolInfo {
    fn share_supply(&self) -> u128 {
        self.total_staked
    }
}

/// One reward token as seen by one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStream {
    pub accumulator: RewardAccumulator,
    /// This pool's share of arrivals not yet folded (held while the pool has no stake).
    pub pending: u128,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Pool {
    pub info: PoolInfo,
    pub streams: BTreeMap<TokenId, PoolStream>,
}

impl Pool {
    pub fn new(stake_asset: TokenId, weight: u64, deposit_fee: Bps) -> Self {
        Self {
            info: PoolInfo {
                stake_asset,
                weight,
                deposit_fee,
                total_staked: 0,
            },
            streams: BTreeMap::new(),
        }
    }

    pub fn stream(&self, token: &TokenId) -> PoolStream {
        self.streams.get(token).copied().unwrap_or_default()
    }

    pub fn accumulator(&self, token: &TokenId) -> U256 {
        self.stream(token).accumulator.value()
    }
}

/// A depositor's stake in one pool and its per-reward-token checkpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub amount: u128,
    pub checkpoints: BTreeMap<TokenId, RewardCheckpoint>,
}

impl Position {
    pub fn checkpoint(&self, token: &TokenId) -> RewardCheckpoint {
        self.checkpoints.get(token).copied().unwrap_or_default()
    }
}

/// Engine-wide record of a reward token.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RewardTokenState {
    /// Custody balance already attributed to pools and not yet paid out.
    pub unclaimed_balance: u128,
    /// Part of `unclaimed_balance` observed while no pool carried weight. Never paid out.
    pub stranded: u128,
}
