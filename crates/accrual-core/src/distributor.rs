//! Reward feed collaborators of the single-stream tracker.
//!
//! A distributor reports how much reward has become available since it last released, and
//! releases it into the tracker's custody on `distribute`. Scheduling is the feed's concern.

use crate::bank::TokenBank;
use crate::{AccountId, AccrualError, Result, TokenId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Seconds-resolution time source.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Test/simulation clock; clones share the same instant.
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn set(&self, t: u64) {
        self.0.store(t, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Opaque reward feed consulted by the tracker.
pub trait RewardDistributor {
    fn reward_token(&self) -> TokenId;

    /// Informational emission rate.
    fn tokens_per_interval(&self) -> u128;

    /// Amount `distribute` would release now, without releasing it.
    fn pending_rewards(&self) -> u128;

    /// Release pending rewards to `recipient`; returns the amount sent.
    fn distribute(&mut self, bank: &mut dyn TokenBank, recipient: AccountId) -> Result<u128>;
}

/// Time-based emission: `(now - last_distribution_time) * tokens_per_interval`, paid out of
/// the `source` account's balance and capped by it.
#[derive(Debug)]
pub struct LinearDistributor {
    reward_token: TokenId,
    source: AccountId,
    tokens_per_interval: u128,
    last_distribution_time: u64,
    clock: Arc<dyn Clock>,
}

impl LinearDistributor {
    pub fn new(
        reward_token: TokenId,
        source: AccountId,
        tokens_per_interval: u128,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if source.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        let last_distribution_time = clock.now();
        Ok(Self {
            reward_token,
            source,
            tokens_per_interval,
            last_distribution_time,
            clock,
        })
    }

    /// Reset the emission origin to now; anything accrued before is forfeited.
    pub fn start(&mut self) {
        self.last_distribution_time = self.clock.now();
    }

    /// Change the rate. Owners must settle the consumer first (`RewardTracker::with_distributor`).
    pub fn set_tokens_per_interval(&mut self, rate: u128) {
        self.tokens_per_interval = rate;
    }

    pub fn last_distribution_time(&self) -> u64 {
        self.last_distribution_time
    }

    pub fn source(&self) -> AccountId {
        self.source
    }

    fn pending_at(&self, now: u64) -> u128 {
        let elapsed = now.saturating_sub(self.last_distribution_time);
        (elapsed as u128).saturating_mul(self.tokens_per_interval)
    }
}

impl RewardDistributor for LinearDistributor {
    fn reward_token(&self) -> TokenId {
        self.reward_token
    }

    fn tokens_per_interval(&self) -> u128 {
        self.tokens_per_interval
    }

    fn pending_rewards(&self) -> u128 {
        self.pending_at(self.clock.now())
    }

    fn distribute(&mut self, bank: &mut dyn TokenBank, recipient: AccountId) -> Result<u128> {
        let now = self.clock.now();
        let pending = self.pending_at(now);
        if pending == 0 {
            self.last_distribution_time = now;
            return Ok(0);
        }
        // The window only closes once the release has gone through.
        let funded = bank.balance_of(self.reward_token, self.source)?;
        let amount = pending.min(funded);
        bank.transfer(self.reward_token, self.source, recipient, amount)?;
        self.last_distribution_time = now;
        debug!(pending, amount, "linear distributor released rewards");
        Ok(amount)
    }
}

/// Explicit feed: amounts queued with `notify_reward` are released on the next `distribute`.
///
/// If the source is short, the released amount is capped and the remainder stays queued.
#[derive(Clone, Debug)]
pub struct ManualDistributor {
    reward_token: TokenId,
    source: AccountId,
    queued: u128,
    tokens_per_interval: u128,
}

impl ManualDistributor {
    pub fn new(reward_token: TokenId, source: AccountId) -> Result<Self> {
        if source.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        Ok(Self {
            reward_token,
            source,
            queued: 0,
            tokens_per_interval: 0,
        })
    }

    pub fn notify_reward(&mut self, amount: u128) -> Result<()> {
        self.queued = crate::math::add_u128(self.queued, amount)?;
        self.tokens_per_interval = amount;
        Ok(())
    }

    pub fn source(&self) -> AccountId {
        self.source
    }
}

impl RewardDistributor for ManualDistributor {
    fn reward_token(&self) -> TokenId {
        self.reward_token
    }

    fn tokens_per_interval(&self) -> u128 {
        self.tokens_per_interval
    }

    fn pending_rewards(&self) -> u128 {
        self.queued
    }

    fn distribute(&mut self, bank: &mut dyn TokenBank, recipient: AccountId) -> Result<u128> {
        if self.queued == 0 {
            return Ok(0);
        }
        let funded = bank.balance_of(self.reward_token, self.source)?;
        let amount = self.queued.min(funded);
        bank.transfer(self.reward_token, self.source, recipient, amount)?;
        self.queued -= amount;
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::InMemoryBank;

    fn token() -> TokenId {
        TokenId::derive("reward")
    }

    #[test]
    fn linear_emission_follows_clock() {
        let clock = ManualClock::new(1_000);
        let source = AccountId::derive("source");
        let sink = AccountId::derive("sink");
        let mut bank = InMemoryBank::new();
        bank.mint(token(), source, 1_000_000).unwrap();

        let mut d = LinearDistributor::new(token(), source, 10, Arc::new(clock.clone())).unwrap();
        assert_eq!(d.pending_rewards(), 0);
        clock.advance(7);
        assert_eq!(d.pending_rewards(), 70);

        assert_eq!(d.distribute(&mut bank, sink).unwrap(), 70);
        assert_eq!(d.pending_rewards(), 0);
        assert_eq!(d.last_distribution_time(), 1_007);
        assert_eq!(bank.balance_of(token(), sink).unwrap(), 70);
    }

    #[test]
    fn linear_emission_is_capped_by_funding() {
        let clock = ManualClock::new(0);
        let source = AccountId::derive("source");
        let sink = AccountId::derive("sink");
        let mut bank = InMemoryBank::new();
        bank.mint(token(), source, 15).unwrap();

        let mut d = LinearDistributor::new(token(), source, 10, Arc::new(clock.clone())).unwrap();
        clock.advance(5);
        assert_eq!(d.distribute(&mut bank, sink).unwrap(), 15);
    }

    /// Bank whose reads fail, standing in for an unreachable ledger.
    struct OfflineBank;

    impl TokenBank for OfflineBank {
        fn balance_of(&self, _: TokenId, _: AccountId) -> Result<u128> {
            Err(AccrualError::Bank("offline".into()))
        }

        fn transfer(&mut self, _: TokenId, _: AccountId, _: AccountId, _: u128) -> Result<()> {
            Err(AccrualError::Bank("offline".into()))
        }
    }

    #[test]
    fn failed_release_keeps_the_emission_window_open() {
        let clock = ManualClock::new(100);
        let source = AccountId::derive("source");
        let mut d = LinearDistributor::new(token(), source, 4, Arc::new(clock.clone())).unwrap();
        clock.advance(5);

        let err = d.distribute(&mut OfflineBank, AccountId::derive("sink")).unwrap_err();
        assert_eq!(err, AccrualError::Bank("offline".into()));
        assert_eq!(d.last_distribution_time(), 100);
        assert_eq!(d.pending_rewards(), 20);

        let mut bank = InMemoryBank::new();
        bank.mint(token(), source, 1_000).unwrap();
        assert_eq!(d.distribute(&mut bank, AccountId::derive("sink")).unwrap(), 20);
        assert_eq!(d.last_distribution_time(), 105);
    }

    #[test]
    fn start_forfeits_accrued_emission() {
        let clock = ManualClock::new(0);
        let mut d = LinearDistributor::new(token(), AccountId::derive("s"), 3, Arc::new(clock.clone()))
            .unwrap();
        clock.advance(10);
        d.start();
        assert_eq!(d.pending_rewards(), 0);
    }

    #[test]
    fn manual_feed_keeps_unfunded_remainder() {
        let source = AccountId::derive("source");
        let sink = AccountId::derive("sink");
        let mut bank = InMemoryBank::new();
        bank.mint(token(), source, 40).unwrap();

        let mut d = ManualDistributor::new(token(), source).unwrap();
        d.notify_reward(100).unwrap();
        assert_eq!(d.distribute(&mut bank, sink).unwrap(), 40);
        assert_eq!(d.pending_rewards(), 60);
    }

    #[test]
    fn zero_source_rejected() {
        assert_eq!(
            ManualDistributor::new(token(), AccountId::ZERO).unwrap_err(),
            AccrualError::ZeroAddress
        );
    }
}
