//! Settlement core shared by the single-stream tracker and the multi-pool engine.
//!
//! Both engines compose the same three steps:
//!
//! 1. [`advance`]: pull newly available reward from a [`RewardSource`] and fold it into a
//!    [`RewardAccumulator`] over a [`StakeSupply`]. Nothing is pulled while the supply is zero,
//!    so the reward stays with its source and is captured by the next staker.
//! 2. [`RewardCheckpoint::settle`]: credit one position with
//!    `stake * (acc_now - snapshot) / PRECISION` and move its snapshot to `acc_now`.
//! 3. Stake mutation by the caller, which must come after (2).

use crate::math::{accrued, per_share_delta, U256};
use crate::{AccrualError, Result};
use serde::{Deserialize, Serialize};

/// Current share supply of whatever the accumulator is spread over.
pub trait StakeSupply {
    fn share_supply(&self) -> u128;
}

impl StakeSupply for u128 {
    fn share_supply(&self) -> u128 {
        *self
    }
}

/// Feed of "newly available" reward. Read-only previews go through the owner's own view of
/// the feed and [`RewardAccumulator::preview`].
pub trait RewardSource {
    /// Take everything newly available.
    fn pull(&mut self) -> Result<u128>;
}

/// Rewards parked in a counter (the engine's per-pool pending buckets).
pub struct BucketSource<'a>(pub &'a mut u128);

impl RewardSource for BucketSource<'_> {
    fn pull(&mut self) -> Result<u128> {
        Ok(std::mem::take(self.0))
    }
}

/// Monotone cumulative reward per share, scaled by `PRECISION`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardAccumulator {
    per_share: U256,
}

impl RewardAccumulator {
    pub fn value(&self) -> U256 {
        self.per_share
    }

    /// True while no reward has ever been folded in.
    pub fn is_initial(&self) -> bool {
        self.per_share.is_zero()
    }

    /// Accumulator value after folding `reward` over `supply`; unchanged when either is zero.
    pub fn preview(&self, reward: u128, supply: u128) -> Result<U256> {
        if reward == 0 || supply == 0 {
            return Ok(self.per_share);
        }
        let delta = per_share_delta(reward, supply)?;
        self.per_share
            .checked_add(delta)
            .ok_or(AccrualError::Overflow("accumulator add"))
    }

    pub fn fold(&mut self, reward: u128, supply: u128) -> Result<()> {
        self.per_share = self.preview(reward, supply)?;
        Ok(())
    }
}

/// Per-position settlement state: the accumulator value last observed and the settled,
/// unpaid reward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardCheckpoint {
    pub snapshot: U256,
    pub claimable: u128,
}

impl RewardCheckpoint {
    /// Reward accrued by `stake` since the snapshot.
    pub fn pending(&self, stake: u128, acc: U256) -> Result<u128> {
        accrued(stake, self.snapshot, acc)
    }

    /// Fold pending reward into `claimable` and move the snapshot to `acc`.
    /// Returns the amount credited.
    pub fn settle(&mut self, stake: u128, acc: U256) -> Result<u128> {
        let reward = self.pending(stake, acc)?;
        let claimable = self
            .claimable
            .checked_add(reward)
            .ok_or(AccrualError::Overflow("claimable add"))?;
        self.claimable = claimable;
        self.snapshot = acc;
        Ok(reward)
    }

    /// Move the snapshot without crediting anything.
    pub fn rebase(&mut self, acc: U256) {
        self.snapshot = acc;
    }

    /// Zero and return the settled reward.
    pub fn take(&mut self) -> u128 {
        std::mem::take(&mut self.claimable)
    }
}

/// Pull from `source` and fold into `acc`. Returns the amount folded in.
pub fn advance<S, R>(acc: &mut RewardAccumulator, supply: &S, source: &mut R) -> Result<u128>
where
    S: StakeSupply + ?Sized,
    R: RewardSource + ?Sized,
{
    let supply = supply.share_supply();
    if supply == 0 {
        return Ok(0);
    }
    let reward = source.pull()?;
    acc.fold(reward, supply)?;
    Ok(reward)
}

/// Reward-weighted running average of stake:
/// `(old_avg * old_cumulative + staked * reward) / (old_cumulative + reward)`.
///
/// Returns `old_avg` when the new cumulative total is zero.
pub fn weighted_average(
    old_avg: u128,
    old_cumulative: u128,
    staked: u128,
    reward: u128,
) -> Result<u128> {
    let next_cumulative = U256::from(old_cumulative) + U256::from(reward);
    if next_cumulative.is_zero() {
        return Ok(old_avg);
    }
    let weighted = U256::from(old_avg)
        .checked_mul(U256::from(old_cumulative))
        .and_then(|a| {
            U256::from(staked)
                .checked_mul(U256::from(reward))
                .and_then(|b| a.checked_add(b))
        })
        .ok_or(AccrualError::Overflow("weighted average"))?;
    u128::try_from(weighted / next_cumulative)
        .map_err(|_| AccrualError::Overflow("weighted average narrow"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::precision;
    use proptest::prelude::*;

    struct Queue(Vec<u128>);

    impl RewardSource for Queue {
        fn pull(&mut self) -> Result<u128> {
            Ok(self.0.drain(..).sum())
        }
    }

    #[test]
    fn zero_supply_leaves_reward_with_source() {
        let mut acc = RewardAccumulator::default();
        let mut src = Queue(vec![500]);
        assert_eq!(advance(&mut acc, &0u128, &mut src).unwrap(), 0);
        assert!(acc.is_initial());
        assert_eq!(src.0, vec![500]);

        assert_eq!(advance(&mut acc, &100u128, &mut src).unwrap(), 500);
        assert_eq!(acc.value(), U256::from(5u64) * precision());
    }

    #[test]
    fn checkpoint_settles_then_takes() {
        let mut acc = RewardAccumulator::default();
        acc.fold(1_000, 100).unwrap();
        let mut cp = RewardCheckpoint::default();
        assert_eq!(cp.settle(100, acc.value()).unwrap(), 1_000);
        assert_eq!(cp.settle(100, acc.value()).unwrap(), 0);
        assert_eq!(cp.take(), 1_000);
        assert_eq!(cp.claimable, 0);
    }

    #[test]
    fn rebase_forfeits_nothing_already_settled() {
        let mut acc = RewardAccumulator::default();
        acc.fold(10, 10).unwrap();
        let mut cp = RewardCheckpoint {
            snapshot: U256::ZERO,
            claimable: 3,
        };
        cp.rebase(acc.value());
        assert_eq!(cp.pending(10, acc.value()).unwrap(), 0);
        assert_eq!(cp.claimable, 3);
    }

    #[test]
    fn preview_matches_advance() {
        let mut acc = RewardAccumulator::default();
        let previewed = acc.preview(18, 3).unwrap();
        advance(&mut acc, &3u128, &mut Queue(vec![7, 11])).unwrap();
        assert_eq!(previewed, acc.value());
    }

    #[test]
    fn bucket_source_drains() {
        let mut bucket = 40u128;
        let mut acc = RewardAccumulator::default();
        assert_eq!(advance(&mut acc, &4u128, &mut BucketSource(&mut bucket)).unwrap(), 40);
        assert_eq!(bucket, 0);
    }

    #[test]
    fn weighted_average_examples() {
        assert_eq!(weighted_average(0, 0, 100, 50).unwrap(), 100);
        // Half the lifetime reward earned at stake 100, half at 300.
        assert_eq!(weighted_average(100, 50, 300, 50).unwrap(), 200);
        assert_eq!(weighted_average(42, 0, 0, 0).unwrap(), 42);
    }

    proptest! {
        #[test]
        fn accumulator_is_monotone_and_settlement_idempotent(
            steps in proptest::collection::vec((0u128..1_000_000u128, 0u128..10_000u128), 1..32),
            stake in 0u128..10_000u128,
        ) {
            let mut acc = RewardAccumulator::default();
            let mut cp = RewardCheckpoint::default();
            for (reward, supply) in steps {
                let supply = supply.max(stake);
                let before = acc.value();
                let mut src = Queue(vec![reward]);
                advance(&mut acc, &supply, &mut src)?;
                prop_assert!(acc.value() >= before);

                cp.settle(stake, acc.value())?;
                let settled = cp;
                cp.settle(stake, acc.value())?;
                prop_assert_eq!(cp, settled);
            }
        }
    }
}
