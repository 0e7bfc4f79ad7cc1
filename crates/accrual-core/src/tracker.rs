//! Single-stream reward tracker.
//!
//! Binds one [`StakeLedger`] to one [`RewardDistributor`]. Every mutating entry point runs:
//!
//! 1. re-entrancy guard, then the handler / private-mode gate
//! 2. validation (amounts, addresses, assets, balances, credit headroom)
//! 3. settlement: distributor pull into the global accumulator, then the affected accounts
//! 4. inbound transfer, measured by custody balance difference
//! 5. stake / share / claim mutation, then outbound transfer
//!
//! Failures in (1)-(2) leave the tracker untouched. Settlement itself never changes what
//! any account is owed, only where it is recorded, so a failure after (3) moves no tokens
//! and leaves every entitlement as it was.

use crate::bank::{transfer_in, TokenBank};
use crate::config::StakingConfig;
use crate::distributor::RewardDistributor;
use crate::events::{EventLog, LedgerEvent};
use crate::guard::{HandlerSet, ReentrancyGuard};
use crate::hash::{StateHasher, TRACKER_STATE_DOMAIN_V1};
use crate::invariants::{AccumulatorKey, Audited, InvariantId, InvariantViolation};
use crate::ledger::StakeLedger;
use crate::math::{add_u128, U256};
use crate::metrics::LedgerMetrics;
use crate::settlement::{self, RewardAccumulator, RewardCheckpoint, RewardSource};
use crate::{AccountId, AccrualError, Result, TokenId};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Per-account reward state. Absent accounts read as `Participant::default()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub checkpoint: RewardCheckpoint,
    /// Lifetime reward credited; never decreases.
    pub cumulative_rewards: u128,
    /// Reward-weighted average stake, for downstream vesting.
    pub average_staked_amount: u128,
}

/// Distributor pull measured by what actually reached custody.
struct DistributorFeed<'a, B: TokenBank, D: RewardDistributor> {
    bank: &'a mut B,
    distributor: &'a mut D,
    custody: AccountId,
}

impl<B: TokenBank, D: RewardDistributor> RewardSource for DistributorFeed<'_, B, D> {
    fn pull(&mut self) -> Result<u128> {
        let token = self.distributor.reward_token();
        let before = self.bank.balance_of(token, self.custody)?;
        self.distributor.distribute(&mut *self.bank, self.custody)?;
        let after = self.bank.balance_of(token, self.custody)?;
        after
            .checked_sub(before)
            .ok_or_else(|| AccrualError::Bank("custody reward balance decreased on distribute".into()))
    }
}

pub struct RewardTracker<B: TokenBank, D: RewardDistributor> {
    custody: AccountId,
    bank: B,
    distributor: D,
    ledger: StakeLedger,
    accumulator: RewardAccumulator,
    participants: BTreeMap<AccountId, Participant>,
    handlers: HandlerSet,
    modes: StakingConfig,
    guard: ReentrancyGuard,
    events: EventLog,
    metrics: LedgerMetrics,
}

impl<B: TokenBank, D: RewardDistributor> RewardTracker<B, D> {
    /// `custody` is the account holding staked assets and undistributed-to-claimant rewards.
    pub fn new(
        custody: AccountId,
        bank: B,
        distributor: D,
        deposit_tokens: impl IntoIterator<Item = TokenId>,
        modes: StakingConfig,
    ) -> Result<Self> {
        if custody.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        Ok(Self {
            custody,
            bank,
            distributor,
            ledger: StakeLedger::new(deposit_tokens),
            accumulator: RewardAccumulator::default(),
            participants: BTreeMap::new(),
            handlers: HandlerSet::default(),
            modes,
            guard: ReentrancyGuard::new(),
            events: EventLog::default(),
            metrics: LedgerMetrics::new(),
        })
    }

    // =========================================================================
    // Administration (gated by the governance layer, not here)
    // =========================================================================

    pub fn set_handler(&mut self, account: AccountId, active: bool) {
        self.handlers.set(account, active);
    }

    pub fn set_deposit_token(&mut self, token: TokenId, accepted: bool) {
        self.ledger.set_accepted(token, accepted);
    }

    pub fn set_modes(&mut self, modes: StakingConfig) {
        self.modes = modes;
    }

    /// Settle the global accumulator, then hand out the distributor (e.g. to change its
    /// rate), so rewards up to now are accounted under the old parameters.
    pub fn with_distributor<R>(&mut self, f: impl FnOnce(&mut D) -> R) -> Result<R> {
        let _token = self.guard.enter()?;
        self.advance_global()?;
        Ok(f(&mut self.distributor))
    }

    // =========================================================================
    // Staking
    // =========================================================================

    /// Stake `amount` of `asset` from the caller's own balance. Returns the amount credited
    /// (after any transfer-time deduction).
    #[instrument(level = "debug", skip_all, fields(caller = %caller, asset = %asset, amount = amount))]
    pub fn stake(&mut self, caller: AccountId, asset: TokenId, amount: u128) -> Result<u128> {
        let _token = self.guard.enter()?;
        let r = self
            .handlers
            .authorize_if(self.modes.private_staking_mode, caller)
            .and_then(|_| self.stake_inner(caller, caller, asset, amount));
        self.record(r)
    }

    /// Handler-only: stake from `funding` on behalf of `account`.
    #[instrument(level = "debug", skip_all, fields(handler = %handler, account = %account, amount = amount))]
    pub fn stake_for_account(
        &mut self,
        handler: AccountId,
        funding: AccountId,
        account: AccountId,
        asset: TokenId,
        amount: u128,
    ) -> Result<u128> {
        let _token = self.guard.enter()?;
        let r = self
            .handlers
            .authorize(handler)
            .and_then(|_| self.stake_inner(funding, account, asset, amount));
        self.record(r)
    }

    fn stake_inner(
        &mut self,
        funding: AccountId,
        account: AccountId,
        asset: TokenId,
        amount: u128,
    ) -> Result<u128> {
        if amount == 0 {
            return Err(AccrualError::ZeroAmount);
        }
        if funding.is_zero() || account.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        self.ledger.ensure_accepted(asset)?;
        let available = self.bank.balance_of(asset, funding)?;
        if available < amount {
            return Err(AccrualError::InsufficientBalance {
                token: asset,
                holder: funding,
                requested: amount,
                available,
            });
        }
        // What arrives is at most `amount`, so the credit below cannot overflow.
        self.ledger.check_credit(&account, &asset, amount)?;

        self.advance_global()?;
        self.settle_account(account)?;

        let received = transfer_in(&mut self.bank, asset, funding, self.custody, amount)?;
        if received == 0 {
            return Err(AccrualError::ZeroAmount);
        }
        self.ledger.credit(account, asset, received)?;

        self.metrics.stakes.inc();
        info!(account = %account, asset = %asset, requested = amount, received, "staked");
        self.events.push(LedgerEvent::Staked {
            funding,
            account,
            asset,
            amount: received,
        });
        Ok(received)
    }

    /// Unstake `amount` of `asset` back to the caller.
    #[instrument(level = "debug", skip_all, fields(caller = %caller, asset = %asset, amount = amount))]
    pub fn unstake(&mut self, caller: AccountId, asset: TokenId, amount: u128) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self
            .handlers
            .authorize_if(self.modes.private_staking_mode, caller)
            .and_then(|_| self.unstake_inner(caller, asset, amount, caller));
        self.record(r)
    }

    /// Handler-only: unstake `account`'s stake to `receiver`.
    #[instrument(level = "debug", skip_all, fields(handler = %handler, account = %account, amount = amount))]
    pub fn unstake_for_account(
        &mut self,
        handler: AccountId,
        account: AccountId,
        asset: TokenId,
        amount: u128,
        receiver: AccountId,
    ) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self
            .handlers
            .authorize(handler)
            .and_then(|_| self.unstake_inner(account, asset, amount, receiver));
        self.record(r)
    }

    fn unstake_inner(
        &mut self,
        account: AccountId,
        asset: TokenId,
        amount: u128,
        receiver: AccountId,
    ) -> Result<()> {
        if amount == 0 {
            return Err(AccrualError::ZeroAmount);
        }
        if account.is_zero() || receiver.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        self.ledger.ensure_accepted(asset)?;
        self.ledger.check_debit(&account, &asset, amount)?;
        let held = self.bank.balance_of(asset, self.custody)?;
        if held < amount {
            return Err(AccrualError::InsufficientBalance {
                token: asset,
                holder: self.custody,
                requested: amount,
                available: held,
            });
        }

        self.advance_global()?;
        self.settle_account(account)?;
        self.ledger.debit(account, asset, amount)?;
        if let Err(e) = self.bank.transfer(asset, self.custody, receiver, amount) {
            self.ledger.credit(account, asset, amount)?;
            return Err(e);
        }

        self.metrics.unstakes.inc();
        info!(account = %account, asset = %asset, amount, "unstaked");
        self.events.push(LedgerEvent::Unstaked {
            account,
            asset,
            amount,
            receiver,
        });
        Ok(())
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Settle and pay out everything claimable. Returns the amount paid (may be zero).
    #[instrument(level = "debug", skip_all, fields(caller = %caller, receiver = %receiver))]
    pub fn claim(&mut self, caller: AccountId, receiver: AccountId) -> Result<u128> {
        let _token = self.guard.enter()?;
        let r = self
            .handlers
            .authorize_if(self.modes.private_claiming_mode, caller)
            .and_then(|_| self.claim_inner(caller, receiver));
        self.record(r)
    }

    #[instrument(level = "debug", skip_all, fields(handler = %handler, account = %account))]
    pub fn claim_for_account(
        &mut self,
        handler: AccountId,
        account: AccountId,
        receiver: AccountId,
    ) -> Result<u128> {
        let _token = self.guard.enter()?;
        let r = self
            .handlers
            .authorize(handler)
            .and_then(|_| self.claim_inner(account, receiver));
        self.record(r)
    }

    fn claim_inner(&mut self, account: AccountId, receiver: AccountId) -> Result<u128> {
        if account.is_zero() || receiver.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        self.advance_global()?;
        self.settle_account(account)?;

        let mut p = self.participant(&account);
        let amount = p.checkpoint.claimable;
        if amount == 0 {
            return Ok(0);
        }
        // Pay before zeroing so a failed transfer leaves the claim intact.
        self.bank
            .transfer(self.distributor.reward_token(), self.custody, receiver, amount)?;
        p.checkpoint.take();
        self.participants.insert(account, p);

        self.metrics.claims.inc();
        self.metrics.rewards_paid.add_amount(amount);
        info!(account = %account, receiver = %receiver, amount, "claimed");
        self.events.push(LedgerEvent::Claimed {
            account,
            receiver,
            amount,
        });
        Ok(amount)
    }

    /// Settle the global accumulator only.
    pub fn update_rewards(&mut self) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self.advance_global().map(|_| ());
        self.record(r)
    }

    /// Settle the global accumulator and `account`.
    pub fn update_rewards_for(&mut self, account: AccountId) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = if account.is_zero() {
            Err(AccrualError::ZeroAddress)
        } else {
            self.advance_global()
                .and_then(|_| self.settle_account(account))
                .map(|_| ())
        };
        self.record(r)
    }

    // =========================================================================
    // Share token
    // =========================================================================

    /// Move staked-share balance. Both sides are settled first; staked amounts (and so
    /// reward weight) stay with the original staker.
    #[instrument(level = "debug", skip_all, fields(sender = %sender, recipient = %recipient, amount = amount))]
    pub fn transfer(&mut self, sender: AccountId, recipient: AccountId, amount: u128) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self
            .handlers
            .authorize_if(self.modes.private_transfer_mode, sender)
            .and_then(|_| self.transfer_inner(sender, recipient, amount));
        self.record(r)
    }

    pub fn transfer_for_account(
        &mut self,
        handler: AccountId,
        sender: AccountId,
        recipient: AccountId,
        amount: u128,
    ) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self
            .handlers
            .authorize(handler)
            .and_then(|_| self.transfer_inner(sender, recipient, amount));
        self.record(r)
    }

    fn transfer_inner(&mut self, sender: AccountId, recipient: AccountId, amount: u128) -> Result<()> {
        if sender.is_zero() || recipient.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        let available = self.ledger.share_balance(&sender);
        if amount > available {
            return Err(AccrualError::InvalidAmount {
                requested: amount,
                available,
            });
        }
        self.advance_global()?;
        self.settle_account(sender)?;
        self.settle_account(recipient)?;
        self.ledger.move_shares(sender, recipient, amount)?;
        self.events.push(LedgerEvent::SharesTransferred {
            from: sender,
            to: recipient,
            amount,
        });
        Ok(())
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    fn advance_global(&mut self) -> Result<u128> {
        if self.ledger.total_staked() == 0 {
            let pending = self.distributor.pending_rewards();
            if pending > 0 {
                warn!(pending, "no stake; rewards stay with the distributor");
            }
        }
        let mut feed = DistributorFeed {
            bank: &mut self.bank,
            distributor: &mut self.distributor,
            custody: self.custody,
        };
        let folded = settlement::advance(&mut self.accumulator, &self.ledger, &mut feed)?;
        if folded > 0 {
            self.metrics.rewards_accrued.add_amount(folded);
            debug!(folded, total_staked = self.ledger.total_staked(), "rewards folded into accumulator");
            self.events.push(LedgerEvent::RewardsAccrued {
                pool: None,
                token: self.distributor.reward_token(),
                amount: folded,
            });
        }
        Ok(folded)
    }

    fn settle_account(&mut self, account: AccountId) -> Result<u128> {
        self.metrics.settlements.inc();
        if self.accumulator.is_initial() {
            return Ok(0);
        }
        let staked = self.ledger.staked_amount(&account);
        let mut p = self.participant(&account);
        let reward = p.checkpoint.settle(staked, self.accumulator.value())?;
        if staked > 0 && reward > 0 {
            p.average_staked_amount = settlement::weighted_average(
                p.average_staked_amount,
                p.cumulative_rewards,
                staked,
                reward,
            )?;
            p.cumulative_rewards = add_u128(p.cumulative_rewards, reward)?;
        }
        self.participants.insert(account, p);
        Ok(reward)
    }

    fn record<T>(&self, r: Result<T>) -> Result<T> {
        if let Err(e) = &r {
            self.metrics.rejected_operations.inc();
            debug!(error = %e, "operation rejected");
        }
        r
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Get-or-default participant record.
    pub fn participant(&self, account: &AccountId) -> Participant {
        self.participants.get(account).copied().unwrap_or_default()
    }

    /// Settled plus not-yet-settled reward, including what the distributor would release now.
    pub fn claimable(&self, account: &AccountId) -> Result<u128> {
        let p = self.participant(account);
        let acc = self
            .accumulator
            .preview(self.distributor.pending_rewards(), self.ledger.total_staked())?;
        if acc.is_zero() {
            return Ok(p.checkpoint.claimable);
        }
        let pending = p.checkpoint.pending(self.ledger.staked_amount(account), acc)?;
        add_u128(p.checkpoint.claimable, pending)
    }

    /// Settled, unpaid reward only.
    pub fn claimable_reward(&self, account: &AccountId) -> u128 {
        self.participant(account).checkpoint.claimable
    }

    pub fn staked_amount(&self, account: &AccountId) -> u128 {
        self.ledger.staked_amount(account)
    }

    pub fn deposit_balance(&self, account: &AccountId, asset: &TokenId) -> u128 {
        self.ledger.deposit_balance(account, asset)
    }

    pub fn total_deposit_supply(&self, asset: &TokenId) -> u128 {
        self.ledger.total_deposit_supply(asset)
    }

    pub fn average_staked_amount(&self, account: &AccountId) -> u128 {
        self.participant(account).average_staked_amount
    }

    pub fn cumulative_rewards(&self, account: &AccountId) -> u128 {
        self.participant(account).cumulative_rewards
    }

    pub fn cumulative_reward_per_share(&self) -> U256 {
        self.accumulator.value()
    }

    pub fn previous_cumulative_reward_per_share(&self, account: &AccountId) -> U256 {
        self.participant(account).checkpoint.snapshot
    }

    pub fn total_staked(&self) -> u128 {
        self.ledger.total_staked()
    }

    /// Share balance.
    pub fn balance_of(&self, account: &AccountId) -> u128 {
        self.ledger.share_balance(account)
    }

    /// Share supply.
    pub fn total_supply(&self) -> u128 {
        self.ledger.total_shares()
    }

    pub fn reward_token(&self) -> TokenId {
        self.distributor.reward_token()
    }

    pub fn tokens_per_interval(&self) -> u128 {
        self.distributor.tokens_per_interval()
    }

    pub fn custody(&self) -> AccountId {
        self.custody
    }

    pub fn is_handler(&self, account: &AccountId) -> bool {
        self.handlers.contains(account)
    }

    pub fn is_deposit_token(&self, token: &TokenId) -> bool {
        self.ledger.is_accepted(token)
    }

    pub fn modes(&self) -> &StakingConfig {
        &self.modes
    }

    pub fn accounts(&self) -> impl Iterator<Item = &AccountId> {
        self.participants.keys()
    }

    pub fn bank(&self) -> &B {
        &self.bank
    }

    /// Direct bank access for harnesses (minting, funding distributors).
    pub fn bank_mut(&mut self) -> &mut B {
        &mut self.bank
    }

    pub fn distributor(&self) -> &D {
        &self.distributor
    }

    pub fn reentrancy_guard(&self) -> &ReentrancyGuard {
        &self.guard
    }

    pub fn metrics(&self) -> &LedgerMetrics {
        &self.metrics
    }

    pub fn events(&self) -> &[LedgerEvent] {
        self.events.as_slice()
    }

    pub fn take_events(&mut self) -> Vec<LedgerEvent> {
        self.events.take()
    }
}

impl<B: TokenBank, D: RewardDistributor> Audited for RewardTracker<B, D> {
    fn state_hash(&self) -> [u8; 32] {
        let mut h = StateHasher::new(TRACKER_STATE_DOMAIN_V1);
        h.u256(self.accumulator.value())
            .u128(self.ledger.total_staked())
            .u128(self.ledger.total_shares());
        h.flag(self.modes.private_staking_mode)
            .flag(self.modes.private_claiming_mode)
            .flag(self.modes.private_transfer_mode);

        let accepted: Vec<_> = self.ledger.accepted_assets().collect();
        h.count(accepted.len());
        for t in accepted {
            h.id(&t.0);
        }
        // Zero entries read the same as absent ones.
        let staked: Vec<_> = self.ledger.staked_accounts().filter(|(_, v)| **v > 0).collect();
        h.count(staked.len());
        for (a, v) in staked {
            h.id(&a.0).u128(*v);
        }
        let shares: Vec<_> = self.ledger.share_holders().filter(|(_, v)| **v > 0).collect();
        h.count(shares.len());
        for (a, v) in shares {
            h.id(&a.0).u128(*v);
        }
        let deposits: Vec<_> = self.ledger.deposit_entries().filter(|(_, v)| **v > 0).collect();
        h.count(deposits.len());
        for ((a, t), v) in deposits {
            h.id(&a.0).id(&t.0).u128(*v);
        }
        let participants: Vec<_> = self
            .participants
            .iter()
            .filter(|(_, p)| **p != Participant::default())
            .collect();
        h.count(participants.len());
        for (a, p) in participants {
            h.id(&a.0)
                .u256(p.checkpoint.snapshot)
                .u128(p.checkpoint.claimable)
                .u128(p.cumulative_rewards)
                .u128(p.average_staked_amount);
        }
        h.finish()
    }

    fn check_invariants(&self) -> std::result::Result<(), InvariantViolation> {
        let staked_sum = self
            .ledger
            .staked_accounts()
            .try_fold(0u128, |acc, (_, v)| acc.checked_add(*v))
            .ok_or_else(|| InvariantViolation::new(InvariantId::StakeConservation, "sum overflow"))?;
        if staked_sum != self.ledger.total_staked() {
            return Err(InvariantViolation::new(
                InvariantId::StakeConservation,
                format!(
                    "sum of staked amounts {staked_sum} != total_staked {}",
                    self.ledger.total_staked()
                ),
            ));
        }

        let share_sum = self
            .ledger
            .share_holders()
            .try_fold(0u128, |acc, (_, v)| acc.checked_add(*v))
            .ok_or_else(|| InvariantViolation::new(InvariantId::ShareSupplyMatchesStake, "sum overflow"))?;
        if share_sum != self.ledger.total_shares() || share_sum != self.ledger.total_staked() {
            return Err(InvariantViolation::new(
                InvariantId::ShareSupplyMatchesStake,
                format!(
                    "share balances {share_sum}, share supply {}, total_staked {}",
                    self.ledger.total_shares(),
                    self.ledger.total_staked()
                ),
            ));
        }

        let mut per_asset: BTreeMap<TokenId, u128> = BTreeMap::new();
        for ((_, asset), v) in self.ledger.deposit_entries() {
            let e = per_asset.entry(*asset).or_default();
            *e = e.checked_add(*v).ok_or_else(|| {
                InvariantViolation::new(InvariantId::DepositSupplyMatchesBalances, "sum overflow")
            })?;
        }
        let deposit_total = per_asset.values().try_fold(0u128, |acc, v| acc.checked_add(*v));
        if deposit_total != Some(self.ledger.total_staked()) {
            return Err(InvariantViolation::new(
                InvariantId::DepositSupplyMatchesBalances,
                "deposit balances do not add up to total_staked",
            ));
        }
        for (asset, sum) in &per_asset {
            let supply = self.ledger.total_deposit_supply(asset);
            if *sum != supply {
                return Err(InvariantViolation::new(
                    InvariantId::DepositSupplyMatchesBalances,
                    format!("asset {asset}: balances {sum} != supply {supply}"),
                ));
            }
            let held = self.bank.balance_of(*asset, self.custody).map_err(|e| {
                InvariantViolation::new(InvariantId::CustodyCoversStake, e.to_string())
            })?;
            if held < supply {
                return Err(InvariantViolation::new(
                    InvariantId::CustodyCoversStake,
                    format!("asset {asset}: custody holds {held} < deposits {supply}"),
                ));
            }
        }
        Ok(())
    }

    fn accumulators(&self) -> BTreeMap<AccumulatorKey, U256> {
        BTreeMap::from([((None, self.distributor.reward_token()), self.accumulator.value())])
    }
}
