//! Multi-pool, multi-token reward engine.
//!
//! N pools, each with its own stake asset and allocation weight, share M reward tokens that
//! are funded by direct deposits. Arrival of a reward token is measured as
//! `custody balance - unclaimed_balance`; each observed arrival is split across pools by
//! weight into per-pool pending buckets, and a bucket is folded into that pool's accumulator
//! as soon as the pool has stake. A pool with no stake keeps its bucket, so its share is
//! captured by its next depositor. An arrival observed while no pool carries weight belongs
//! to no pool: it is marked observed and stays stranded in custody, so a pool registered or
//! re-weighted later never earns it.
//!
//! Positions are harvested automatically on every deposit and withdraw. Reward payouts are
//! clamped to what custody actually holds.

pub mod pool;

pub use pool::{PoolInfo, PoolStream, Position, RewardTokenState};

use crate::bank::{transfer_in, TokenBank};
use crate::config::PoolBoundsConfig;
use crate::events::{EventLog, LedgerEvent};
use crate::guard::ReentrancyGuard;
use crate::hash::{StateHasher, ENGINE_STATE_DOMAIN_V1};
use crate::invariants::{AccumulatorKey, Audited, InvariantId, InvariantViolation};
use crate::math::{add_u128, floor_bps, sub_u128, weighted_share, Bps, BPS_U16, U256};
use crate::metrics::LedgerMetrics;
use crate::settlement::{self, BucketSource};
use crate::{AccountId, AccrualError, PoolId, Result, TokenId};
use pool::Pool;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

pub struct MultiPoolEngine<B: TokenBank> {
    custody: AccountId,
    bank: B,
    bounds: PoolBoundsConfig,
    pools: Vec<Pool>,
    positions: BTreeMap<(PoolId, AccountId), Position>,
    reward_tokens: BTreeMap<TokenId, RewardTokenState>,
    total_weight: u64,
    fee_receiver: AccountId,
    referrers: BTreeMap<AccountId, AccountId>,
    guard: ReentrancyGuard,
    events: EventLog,
    metrics: LedgerMetrics,
}

impl<B: TokenBank> MultiPoolEngine<B> {
    pub fn new(
        custody: AccountId,
        bank: B,
        fee_receiver: AccountId,
        bounds: PoolBoundsConfig,
    ) -> Result<Self> {
        if custody.is_zero() || fee_receiver.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        if bounds.max_deposit_fee_bps > BPS_U16 {
            return Err(AccrualError::Config(format!(
                "max_deposit_fee_bps must be at most {BPS_U16}"
            )));
        }
        Ok(Self {
            custody,
            bank,
            bounds,
            pools: Vec::new(),
            positions: BTreeMap::new(),
            reward_tokens: BTreeMap::new(),
            total_weight: 0,
            fee_receiver,
            referrers: BTreeMap::new(),
            guard: ReentrancyGuard::new(),
            events: EventLog::default(),
            metrics: LedgerMetrics::new(),
        })
    }

    // =========================================================================
    // Administration (gated by the governance layer, not here)
    // =========================================================================

    /// Register a new pool. Existing pools are synced first, so the new pool earns only
    /// from this point on.
    #[instrument(level = "debug", skip_all, fields(stake_asset = %stake_asset, weight = weight, deposit_fee_bps = deposit_fee_bps))]
    pub fn register_pool(
        &mut self,
        stake_asset: TokenId,
        weight: u64,
        deposit_fee_bps: u16,
    ) -> Result<PoolId> {
        let _token = self.guard.enter()?;
        let r = self.register_pool_inner(stake_asset, weight, deposit_fee_bps);
        self.record(r)
    }

    fn register_pool_inner(
        &mut self,
        stake_asset: TokenId,
        weight: u64,
        deposit_fee_bps: u16,
    ) -> Result<PoolId> {
        if weight == 0 {
            return Err(AccrualError::InvalidWeight);
        }
        let deposit_fee = self.checked_fee(deposit_fee_bps)?;
        if self.pools.len() >= self.bounds.max_pools {
            return Err(AccrualError::BoundExceeded(format!(
                "pool count limit {} reached",
                self.bounds.max_pools
            )));
        }
        if self.pools.iter().any(|p| p.info.stake_asset == stake_asset) {
            return Err(AccrualError::DuplicatePool(stake_asset));
        }
        if self.reward_tokens.contains_key(&stake_asset) {
            return Err(AccrualError::InvalidAsset(stake_asset));
        }
        let pid = PoolId(
            u32::try_from(self.pools.len())
                .map_err(|_| AccrualError::BoundExceeded("pool id space".into()))?,
        );
        let total_weight = self
            .total_weight
            .checked_add(weight)
            .ok_or(AccrualError::Overflow("total weight add"))?;

        self.absorb_arrivals()?;
        self.fold_all()?;

        self.pools.push(Pool::new(stake_asset, weight, deposit_fee));
        self.total_weight = total_weight;

        info!(pool = %pid, stake_asset = %stake_asset, weight, "pool registered");
        self.events.push(LedgerEvent::PoolRegistered {
            pool: pid,
            stake_asset,
            weight,
            deposit_fee_bps: deposit_fee.get(),
        });
        Ok(pid)
    }

    /// Change a pool's allocation weight. All pools are synced first. Zero pauses the pool.
    pub fn set_pool_weight(&mut self, pid: PoolId, weight: u64) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self.set_pool_weight_inner(pid, weight);
        self.record(r)
    }

    fn set_pool_weight_inner(&mut self, pid: PoolId, weight: u64) -> Result<()> {
        let idx = self.pool_index(pid)?;
        let old_weight = self.pools[idx].info.weight;
        let total_weight = (self.total_weight - old_weight)
            .checked_add(weight)
            .ok_or(AccrualError::Overflow("total weight add"))?;

        self.absorb_arrivals()?;
        self.fold_all()?;

        self.pools[idx].info.weight = weight;
        self.total_weight = total_weight;
        info!(pool = %pid, old_weight, new_weight = weight, "pool weight updated");
        self.events.push(LedgerEvent::PoolWeightUpdated {
            pool: pid,
            old_weight,
            new_weight: weight,
        });
        Ok(())
    }

    pub fn set_pool_deposit_fee(&mut self, pid: PoolId, deposit_fee_bps: u16) -> Result<()> {
        let idx = self.pool_index(pid)?;
        let fee = self.checked_fee(deposit_fee_bps)?;
        self.pools[idx].info.deposit_fee = fee;
        Ok(())
    }

    pub fn set_fee_receiver(&mut self, receiver: AccountId) -> Result<()> {
        if receiver.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        self.fee_receiver = receiver;
        Ok(())
    }

    /// Register a reward stream. Its accumulators start at zero in every pool.
    pub fn add_reward_token(&mut self, token: TokenId) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self.add_reward_token_inner(token);
        self.record(r)
    }

    fn add_reward_token_inner(&mut self, token: TokenId) -> Result<()> {
        if self.reward_tokens.contains_key(&token) {
            return Err(AccrualError::DuplicateRewardToken(token));
        }
        if self.reward_tokens.len() >= self.bounds.max_reward_tokens {
            return Err(AccrualError::BoundExceeded(format!(
                "reward token limit {} reached",
                self.bounds.max_reward_tokens
            )));
        }
        // Arrival is a balance difference; a stake asset would read deposits as rewards.
        if self.pools.iter().any(|p| p.info.stake_asset == token) {
            return Err(AccrualError::InvalidAsset(token));
        }
        self.reward_tokens.insert(token, RewardTokenState::default());
        info!(token = %token, "reward token added");
        self.events.push(LedgerEvent::RewardTokenAdded { token });
        Ok(())
    }

    // =========================================================================
    // Reward intake and sync
    // =========================================================================

    /// Pull `amount` of a registered reward token from `from` and distribute everything
    /// newly arrived across pools. Returns the amount custody actually received.
    #[instrument(level = "debug", skip_all, fields(from = %from, token = %token, amount = amount))]
    pub fn deposit_reward(&mut self, from: AccountId, token: TokenId, amount: u128) -> Result<u128> {
        let _token = self.guard.enter()?;
        let r = self.deposit_reward_inner(from, token, amount);
        self.record(r)
    }

    fn deposit_reward_inner(&mut self, from: AccountId, token: TokenId, amount: u128) -> Result<u128> {
        if !self.reward_tokens.contains_key(&token) {
            return Err(AccrualError::UnknownRewardToken(token));
        }
        if from.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        if amount == 0 {
            return Err(AccrualError::ZeroAmount);
        }
        let available = self.bank.balance_of(token, from)?;
        if available < amount {
            return Err(AccrualError::InsufficientBalance {
                token,
                holder: from,
                requested: amount,
                available,
            });
        }

        let received = transfer_in(&mut self.bank, token, from, self.custody, amount)?;
        self.absorb_arrivals()?;
        self.fold_all()?;

        self.events.push(LedgerEvent::RewardDeposited {
            token,
            from,
            amount: received,
        });
        Ok(received)
    }

    /// Fold newly arrived rewards into one pool's accumulators.
    pub fn sync_pool(&mut self, pid: PoolId) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self.pool_index(pid).and_then(|idx| {
            self.absorb_arrivals()?;
            self.fold_pool(idx)
        });
        self.record(r)
    }

    pub fn sync_all_pools(&mut self) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self.absorb_arrivals().and_then(|_| self.fold_all());
        self.record(r)
    }

    /// Split every unobserved arrival across pools by weight. Rounding dust stays unobserved
    /// and joins the next arrival.
    fn absorb_arrivals(&mut self) -> Result<()> {
        let tokens: Vec<TokenId> = self.reward_tokens.keys().copied().collect();
        for token in tokens {
            self.absorb_token(token)?;
        }
        Ok(())
    }

    fn absorb_token(&mut self, token: TokenId) -> Result<()> {
        let arrived = self.arrived(&token)?;
        if arrived == 0 {
            return Ok(());
        }
        if self.total_weight == 0 {
            let state = self
                .reward_tokens
                .get_mut(&token)
                .ok_or(AccrualError::UnknownRewardToken(token))?;
            let unclaimed = add_u128(state.unclaimed_balance, arrived)?;
            let stranded = add_u128(state.stranded, arrived)?;
            state.unclaimed_balance = unclaimed;
            state.stranded = stranded;
            warn!(token = %token, arrived, "no weighted pool; reward arrival stranded");
            return Ok(());
        }
        let mut pending = Vec::with_capacity(self.pools.len());
        let mut distributed = 0u128;
        for pool in &self.pools {
            let share = weighted_share(arrived, pool.info.weight, self.total_weight)?;
            distributed = add_u128(distributed, share)?;
            pending.push(add_u128(pool.stream(&token).pending, share)?);
        }
        let state = self
            .reward_tokens
            .get_mut(&token)
            .ok_or(AccrualError::UnknownRewardToken(token))?;
        let unclaimed = add_u128(state.unclaimed_balance, distributed)?;

        state.unclaimed_balance = unclaimed;
        for (pool, p) in self.pools.iter_mut().zip(pending) {
            pool.streams.entry(token).or_default().pending = p;
        }
        debug!(token = %token, arrived, distributed, "reward arrival absorbed");
        Ok(())
    }

    fn arrived(&self, token: &TokenId) -> Result<u128> {
        let state = self
            .reward_tokens
            .get(token)
            .ok_or(AccrualError::UnknownRewardToken(*token))?;
        let held = self.bank.balance_of(*token, self.custody)?;
        Ok(held.saturating_sub(state.unclaimed_balance))
    }

    fn fold_pool(&mut self, idx: usize) -> Result<()> {
        let pid = pool_id(idx);
        let tokens: Vec<TokenId> = self.reward_tokens.keys().copied().collect();
        let pool = self
            .pools
            .get_mut(idx)
            .ok_or(AccrualError::UnknownPool(pid))?;

        let mut folded = Vec::new();
        for token in tokens {
            let stream = pool.streams.entry(token).or_default();
            if stream.pending > 0 && pool.info.total_staked == 0 {
                warn!(pool = %pid, token = %token, held = stream.pending, "pool has no stake; reward held");
            }
            let amount = settlement::advance(
                &mut stream.accumulator,
                &pool.info,
                &mut BucketSource(&mut stream.pending),
            )?;
            if amount > 0 {
                folded.push((token, amount));
            }
        }

        self.metrics.settlements.inc();
        for (token, amount) in folded {
            self.metrics.rewards_accrued.add_amount(amount);
            self.events.push(LedgerEvent::RewardsAccrued {
                pool: Some(pid),
                token,
                amount,
            });
        }
        Ok(())
    }

    fn fold_all(&mut self) -> Result<()> {
        for idx in 0..self.pools.len() {
            self.fold_pool(idx)?;
        }
        Ok(())
    }

    // =========================================================================
    // Positions
    // =========================================================================

    /// Deposit `amount` of the pool's stake asset. Harvests an existing position first, takes
    /// the pool's deposit fee, and returns the net amount credited.
    #[instrument(level = "debug", skip_all, fields(caller = %caller, pool = %pid, amount = amount))]
    pub fn deposit(
        &mut self,
        caller: AccountId,
        pid: PoolId,
        amount: u128,
        referrer: Option<AccountId>,
    ) -> Result<u128> {
        let _token = self.guard.enter()?;
        let r = self.deposit_inner(caller, pid, amount, referrer);
        self.record(r)
    }

    fn deposit_inner(
        &mut self,
        caller: AccountId,
        pid: PoolId,
        amount: u128,
        referrer: Option<AccountId>,
    ) -> Result<u128> {
        let idx = self.pool_index(pid)?;
        if caller.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        if amount == 0 {
            return Err(AccrualError::InvalidAmount {
                requested: 0,
                available: 0,
            });
        }
        let referrer = referrer.filter(|r| !r.is_zero());
        if referrer == Some(caller) {
            return Err(AccrualError::SelfReferral);
        }
        let asset = self.pools[idx].info.stake_asset;
        let available = self.bank.balance_of(asset, caller)?;
        if available < amount {
            return Err(AccrualError::InsufficientBalance {
                token: asset,
                holder: caller,
                requested: amount,
                available,
            });
        }

        // What arrives is at most `amount`, so the credit below cannot overflow.
        add_u128(self.user_amount(pid, &caller), amount)?;
        add_u128(self.pools[idx].info.total_staked, amount)?;

        // Settle and harvest before any stake moves in.
        self.absorb_arrivals()?;
        self.fold_pool(idx)?;
        if self.user_amount(pid, &caller) > 0 {
            self.harvest_position(idx, caller)?;
        }

        let received = transfer_in(&mut self.bank, asset, caller, self.custody, amount)?;
        if received == 0 {
            return Err(AccrualError::ZeroAmount);
        }
        let fee = floor_bps(received, self.pools[idx].info.deposit_fee)?;
        let net = sub_u128(received, fee)?;
        let key = (pid, caller);
        let mut position = self.positions.get(&key).cloned().unwrap_or_default();
        let new_amount = add_u128(position.amount, net)?;
        let new_total = add_u128(self.pools[idx].info.total_staked, net)?;

        if fee > 0 {
            if let Err(e) = self.bank.transfer(asset, self.custody, self.fee_receiver, fee) {
                self.bank.transfer(asset, self.custody, caller, received)?;
                return Err(e);
            }
            self.events.push(LedgerEvent::DepositFeeCharged {
                pool: pid,
                account: caller,
                receiver: self.fee_receiver,
                fee,
            });
        }

        position.amount = new_amount;
        for token in self.reward_tokens.keys() {
            position
                .checkpoints
                .entry(*token)
                .or_default()
                .rebase(self.pools[idx].accumulator(token));
        }
        self.positions.insert(key, position);
        self.pools[idx].info.total_staked = new_total;

        if let Some(referrer) = referrer {
            if !self.referrers.contains_key(&caller) {
                self.referrers.insert(caller, referrer);
                self.events.push(LedgerEvent::ReferralRecorded {
                    account: caller,
                    referrer,
                });
            }
        }

        self.metrics.stakes.inc();
        info!(pool = %pid, account = %caller, received, fee, net, "deposited");
        self.events.push(LedgerEvent::Deposited {
            pool: pid,
            account: caller,
            amount: net,
        });
        Ok(net)
    }

    /// Withdraw `amount` (zero harvests only). Pays all reward tokens of the pool first.
    #[instrument(level = "debug", skip_all, fields(caller = %caller, pool = %pid, amount = amount))]
    pub fn withdraw(&mut self, caller: AccountId, pid: PoolId, amount: u128) -> Result<()> {
        let _token = self.guard.enter()?;
        let r = self.withdraw_inner(caller, pid, amount);
        self.record(r)
    }

    /// Claim every reward token of a pool without moving stake.
    pub fn harvest(&mut self, caller: AccountId, pid: PoolId) -> Result<()> {
        self.withdraw(caller, pid, 0)
    }

    fn withdraw_inner(&mut self, caller: AccountId, pid: PoolId, amount: u128) -> Result<()> {
        let idx = self.pool_index(pid)?;
        if caller.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        let current = self.user_amount(pid, &caller);
        if amount > current {
            return Err(AccrualError::InvalidWithdrawAmount {
                requested: amount,
                available: current,
            });
        }
        let asset = self.pools[idx].info.stake_asset;
        if amount > 0 {
            self.ensure_custody_holds(asset, amount)?;
        }

        self.absorb_arrivals()?;
        self.fold_pool(idx)?;
        self.harvest_position(idx, caller)?;

        if amount > 0 {
            let key = (pid, caller);
            let new_total = sub_u128(self.pools[idx].info.total_staked, amount)?;
            self.bank.transfer(asset, self.custody, caller, amount)?;
            if let Some(position) = self.positions.get_mut(&key) {
                position.amount -= amount;
            }
            self.pools[idx].info.total_staked = new_total;

            self.metrics.unstakes.inc();
            info!(pool = %pid, account = %caller, amount, "withdrawn");
            self.events.push(LedgerEvent::Withdrawn {
                pool: pid,
                account: caller,
                amount,
            });
        }
        Ok(())
    }

    /// Return the caller's whole stake without touching reward accounting. Unpaid rewards of
    /// the position are forfeited.
    #[instrument(level = "debug", skip_all, fields(caller = %caller, pool = %pid))]
    pub fn emergency_withdraw(&mut self, caller: AccountId, pid: PoolId) -> Result<u128> {
        let _token = self.guard.enter()?;
        let r = self.emergency_withdraw_inner(caller, pid);
        self.record(r)
    }

    fn emergency_withdraw_inner(&mut self, caller: AccountId, pid: PoolId) -> Result<u128> {
        let idx = self.pool_index(pid)?;
        if caller.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        let key = (pid, caller);
        let amount = self.user_amount(pid, &caller);
        let asset = self.pools[idx].info.stake_asset;
        let new_total = sub_u128(self.pools[idx].info.total_staked, amount)?;
        if amount > 0 {
            self.ensure_custody_holds(asset, amount)?;
            self.bank.transfer(asset, self.custody, caller, amount)?;
        }
        self.positions.remove(&key);
        self.pools[idx].info.total_staked = new_total;

        self.metrics.emergency_withdrawals.inc();
        warn!(pool = %pid, account = %caller, amount, "emergency withdraw");
        self.events.push(LedgerEvent::EmergencyWithdrawn {
            pool: pid,
            account: caller,
            amount,
        });
        Ok(amount)
    }

    /// Settle every reward token of a position and pay it out.
    fn harvest_position(&mut self, idx: usize, account: AccountId) -> Result<()> {
        let pid = pool_id(idx);
        let key = (pid, account);
        let mut position = self.positions.get(&key).cloned().unwrap_or_default();

        let mut payouts = Vec::with_capacity(self.reward_tokens.len());
        for token in self.reward_tokens.keys() {
            let mut cp = position.checkpoint(token);
            cp.settle(position.amount, self.pools[idx].accumulator(token))?;
            payouts.push((*token, cp.take()));
            position.checkpoints.insert(*token, cp);
        }
        self.positions.insert(key, position);

        for (i, (token, entitled)) in payouts.iter().enumerate() {
            if let Err(e) = self.pay_reward(pid, account, *token, *entitled) {
                // Whatever was not paid stays claimable on the position.
                if let Some(p) = self.positions.get_mut(&key) {
                    for (t, owed) in &payouts[i..] {
                        let cp = p.checkpoints.entry(*t).or_default();
                        cp.claimable = cp.claimable.saturating_add(*owed);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Pay `entitled`, clamped to custody's balance. `unclaimed_balance` drops by the full
    /// entitlement; any shortfall is not carried.
    fn pay_reward(
        &mut self,
        pid: PoolId,
        account: AccountId,
        token: TokenId,
        entitled: u128,
    ) -> Result<u128> {
        if entitled == 0 {
            return Ok(0);
        }
        let held = self.bank.balance_of(token, self.custody)?;
        let paid = entitled.min(held);
        if paid > 0 {
            self.bank.transfer(token, self.custody, account, paid)?;
        }
        if let Some(state) = self.reward_tokens.get_mut(&token) {
            state.unclaimed_balance = state.unclaimed_balance.saturating_sub(entitled);
        }

        self.metrics.claims.inc();
        self.metrics.rewards_paid.add_amount(paid);
        if paid < entitled {
            self.metrics.payouts_clamped.inc();
            warn!(pool = %pid, account = %account, token = %token, entitled, paid, "reward payout clamped to custody balance");
            self.events.push(LedgerEvent::RewardPayoutClamped {
                pool: pid,
                account,
                token,
                entitled,
                paid,
            });
        }
        self.events.push(LedgerEvent::RewardPaid {
            pool: pid,
            account,
            token,
            amount: paid,
        });
        Ok(paid)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn pool_index(&self, pid: PoolId) -> Result<usize> {
        let idx = pid.0 as usize;
        if idx < self.pools.len() {
            Ok(idx)
        } else {
            Err(AccrualError::UnknownPool(pid))
        }
    }

    fn checked_fee(&self, bps: u16) -> Result<Bps> {
        if bps > self.bounds.max_deposit_fee_bps {
            return Err(AccrualError::DepositFeeTooHigh {
                bps,
                max_bps: self.bounds.max_deposit_fee_bps,
            });
        }
        Bps::new(bps)
    }

    fn ensure_custody_holds(&self, asset: TokenId, amount: u128) -> Result<()> {
        let held = self.bank.balance_of(asset, self.custody)?;
        if held < amount {
            return Err(AccrualError::InsufficientBalance {
                token: asset,
                holder: self.custody,
                requested: amount,
                available: held,
            });
        }
        Ok(())
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

    pub fn pool_info(&self, pid: PoolId) -> Result<&PoolInfo> {
        let idx = self.pool_index(pid)?;
        Ok(&self.pools[idx].info)
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn user_amount(&self, pid: PoolId, account: &AccountId) -> u128 {
        self.positions
            .get(&(pid, *account))
            .map(|p| p.amount)
            .unwrap_or(0)
    }

    pub fn position(&self, pid: PoolId, account: &AccountId) -> Position {
        self.positions
            .get(&(pid, *account))
            .cloned()
            .unwrap_or_default()
    }

    /// Reward `account` would receive on harvest now, including arrivals not yet observed.
    pub fn pending_reward(&self, pid: PoolId, account: &AccountId, token: &TokenId) -> Result<u128> {
        let idx = self.pool_index(pid)?;
        let arrived = self.arrived(token)?;
        let pool = &self.pools[idx];
        let stream = pool.stream(token);
        let mut bucket = stream.pending;
        if self.total_weight > 0 {
            bucket = add_u128(
                bucket,
                weighted_share(arrived, pool.info.weight, self.total_weight)?,
            )?;
        }
        let acc = stream.accumulator.preview(bucket, pool.info.total_staked)?;
        match self.positions.get(&(pid, *account)) {
            None => Ok(0),
            Some(p) => {
                let cp = p.checkpoint(token);
                add_u128(cp.claimable, cp.pending(p.amount, acc)?)
            }
        }
    }

    /// Cumulative reward per share of `token` in pool `pid`.
    pub fn reward_per_share(&self, pid: PoolId, token: &TokenId) -> Result<U256> {
        let idx = self.pool_index(pid)?;
        if !self.reward_tokens.contains_key(token) {
            return Err(AccrualError::UnknownRewardToken(*token));
        }
        Ok(self.pools[idx].accumulator(token))
    }

    pub fn unclaimed_balance(&self, token: &TokenId) -> Result<u128> {
        self.reward_tokens
            .get(token)
            .map(|s| s.unclaimed_balance)
            .ok_or(AccrualError::UnknownRewardToken(*token))
    }

    /// Rewards that arrived while no pool carried weight.
    pub fn stranded_balance(&self, token: &TokenId) -> Result<u128> {
        self.reward_tokens
            .get(token)
            .map(|s| s.stranded)
            .ok_or(AccrualError::UnknownRewardToken(*token))
    }

    pub fn reward_tokens(&self) -> impl Iterator<Item = &TokenId> {
        self.reward_tokens.keys()
    }

    pub fn referrer_of(&self, account: &AccountId) -> Option<AccountId> {
        self.referrers.get(account).copied()
    }

    pub fn fee_receiver(&self) -> AccountId {
        self.fee_receiver
    }

    pub fn custody(&self) -> AccountId {
        self.custody
    }

    pub fn bounds(&self) -> &PoolBoundsConfig {
        &self.bounds
    }

    /// Accounts holding or having held a position in `pid`.
    pub fn accounts(&self, pid: PoolId) -> impl Iterator<Item = &AccountId> {
        self.positions
            .keys()
            .filter(move |(p, _)| *p == pid)
            .map(|(_, a)| a)
    }

    pub fn bank(&self) -> &B {
        &self.bank
    }

    /// Direct bank access for harnesses.
    pub fn bank_mut(&mut self) -> &mut B {
        &mut self.bank
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

fn pool_id(idx: usize) -> PoolId {
    // Indices come from `pool_index`, which only admits registered (u32) ids.
    PoolId(idx as u32)
}

impl<B: TokenBank> Audited for MultiPoolEngine<B> {
    fn state_hash(&self) -> [u8; 32] {
        let mut h = StateHasher::new(ENGINE_STATE_DOMAIN_V1);
        h.u64(self.total_weight).id(&self.fee_receiver.0);

        h.count(self.reward_tokens.len());
        for (token, state) in &self.reward_tokens {
            h.id(&token.0).u128(state.unclaimed_balance).u128(state.stranded);
        }
        h.count(self.pools.len());
        for pool in &self.pools {
            h.id(&pool.info.stake_asset.0)
                .u64(pool.info.weight)
                .u64(pool.info.deposit_fee.get() as u64)
                .u128(pool.info.total_staked);
            h.count(pool.streams.len());
            for (token, s) in &pool.streams {
                h.id(&token.0).u256(s.accumulator.value()).u128(s.pending);
            }
        }
        h.count(self.positions.len());
        for ((pid, account), p) in &self.positions {
            h.u64(pid.0 as u64).id(&account.0).u128(p.amount);
            h.count(p.checkpoints.len());
            for (token, cp) in &p.checkpoints {
                h.id(&token.0).u256(cp.snapshot).u128(cp.claimable);
            }
        }
        h.count(self.referrers.len());
        for (a, r) in &self.referrers {
            h.id(&a.0).id(&r.0);
        }
        h.finish()
    }

    fn check_invariants(&self) -> std::result::Result<(), InvariantViolation> {
        let weight_sum = self
            .pools
            .iter()
            .try_fold(0u64, |acc, p| acc.checked_add(p.info.weight));
        if weight_sum != Some(self.total_weight) {
            return Err(InvariantViolation::new(
                InvariantId::WeightsMatchTotal,
                format!("sum of weights {weight_sum:?} != total_weight {}", self.total_weight),
            ));
        }

        for (idx, pool) in self.pools.iter().enumerate() {
            let pid = pool_id(idx);
            let sum = self
                .positions
                .iter()
                .filter(|((p, _), _)| *p == pid)
                .try_fold(0u128, |acc, (_, pos)| acc.checked_add(pos.amount));
            if sum != Some(pool.info.total_staked) {
                return Err(InvariantViolation::new(
                    InvariantId::PoolTotalsMatchPositions,
                    format!(
                        "{pid}: positions sum {sum:?} != total_staked {}",
                        pool.info.total_staked
                    ),
                ));
            }
            let held = self
                .bank
                .balance_of(pool.info.stake_asset, self.custody)
                .map_err(|e| InvariantViolation::new(InvariantId::CustodyCoversStake, e.to_string()))?;
            if held < pool.info.total_staked {
                return Err(InvariantViolation::new(
                    InvariantId::CustodyCoversStake,
                    format!("{pid}: custody holds {held} < total_staked {}", pool.info.total_staked),
                ));
            }
        }
        Ok(())
    }

    fn accumulators(&self) -> BTreeMap<AccumulatorKey, U256> {
        let mut out = BTreeMap::new();
        for (idx, pool) in self.pools.iter().enumerate() {
            for token in self.reward_tokens.keys() {
                out.insert((Some(pool_id(idx)), *token), pool.accumulator(token));
            }
        }
        out
    }
}
