//! Ledger events, recorded in order and drained by the owner.

use crate::{AccountId, PoolId, TokenId};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    Staked {
        funding: AccountId,
        account: AccountId,
        asset: TokenId,
        amount: u128,
    },
    Unstaked {
        account: AccountId,
        asset: TokenId,
        amount: u128,
        receiver: AccountId,
    },
    Claimed {
        account: AccountId,
        receiver: AccountId,
        amount: u128,
    },
    SharesTransferred {
        from: AccountId,
        to: AccountId,
        amount: u128,
    },
    /// Reward folded into an accumulator. `pool` is `None` for the single-stream tracker.
    RewardsAccrued {
        pool: Option<PoolId>,
        token: TokenId,
        amount: u128,
    },
    PoolRegistered {
        pool: PoolId,
        stake_asset: TokenId,
        weight: u64,
        deposit_fee_bps: u16,
    },
    PoolWeightUpdated {
        pool: PoolId,
        old_weight: u64,
        new_weight: u64,
    },
    RewardTokenAdded {
        token: TokenId,
    },
    RewardDeposited {
        token: TokenId,
        from: AccountId,
        amount: u128,
    },
    Deposited {
        pool: PoolId,
        account: AccountId,
        amount: u128,
    },
    Withdrawn {
        pool: PoolId,
        account: AccountId,
        amount: u128,
    },
    EmergencyWithdrawn {
        pool: PoolId,
        account: AccountId,
        amount: u128,
    },
    RewardPaid {
        pool: PoolId,
        account: AccountId,
        token: TokenId,
        amount: u128,
    },
    RewardPayoutClamped {
        pool: PoolId,
        account: AccountId,
        token: TokenId,
        entitled: u128,
        paid: u128,
    },
    ReferralRecorded {
        account: AccountId,
        referrer: AccountId,
    },
    DepositFeeCharged {
        pool: PoolId,
        account: AccountId,
        receiver: AccountId,
        fee: u128,
    },
}

#[derive(Clone, Debug, Default)]
pub struct EventLog {
    events: Vec<LedgerEvent>,
}

impl EventLog {
    pub fn push(&mut self, event: LedgerEvent) {
        debug!(?event, "ledger event");
        self.events.push(event);
    }

    pub fn take(&mut self) -> Vec<LedgerEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn as_slice(&self) -> &[LedgerEvent] {
        &self.events
    }
}
