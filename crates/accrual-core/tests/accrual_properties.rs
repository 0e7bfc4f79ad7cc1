//! Cross-engine accrual properties.
//!
//! Runs the same reward scenarios through the single-stream tracker and the multi-pool
//! engine, and replays random action traces through the invariant rail.

use accrual_core::{
    config::{PoolBoundsConfig, StakingConfig},
    invariants::{first_counterexample, Audited},
    math::floor_bps,
    AccountId, AccrualError, Bps, InMemoryBank, LedgerEvent, ManualDistributor, MultiPoolEngine,
    PoolId, RewardTracker, TokenBank, TokenId,
};
use proptest::prelude::*;

// =============================================================================
// Fixtures
// =============================================================================

fn stake_token() -> TokenId {
    TokenId::derive("stake")
}

fn second_stake_token() -> TokenId {
    TokenId::derive("stake-2")
}

fn reward_token() -> TokenId {
    TokenId::derive("reward")
}

fn alice() -> AccountId {
    AccountId::derive("alice")
}

fn bob() -> AccountId {
    AccountId::derive("bob")
}

fn carol() -> AccountId {
    AccountId::derive("carol")
}

fn feeder() -> AccountId {
    AccountId::derive("feeder")
}

fn funded_bank() -> InMemoryBank {
    let mut bank = InMemoryBank::new();
    for who in [alice(), bob(), carol()] {
        bank.mint(stake_token(), who, 1_000_000).unwrap();
        bank.mint(second_stake_token(), who, 1_000_000).unwrap();
    }
    bank.mint(reward_token(), feeder(), u64::MAX as u128).unwrap();
    bank
}

type Tracker = RewardTracker<InMemoryBank, ManualDistributor>;
type Engine = MultiPoolEngine<InMemoryBank>;

fn tracker() -> Tracker {
    let distributor = ManualDistributor::new(reward_token(), feeder()).unwrap();
    RewardTracker::new(
        AccountId::derive("tracker"),
        funded_bank(),
        distributor,
        [stake_token()],
        StakingConfig::default(),
    )
    .unwrap()
}

fn engine(deposit_fee_bps: u16) -> (Engine, PoolId) {
    let mut e = MultiPoolEngine::new(
        AccountId::derive("chef"),
        funded_bank(),
        AccountId::derive("treasury"),
        PoolBoundsConfig::default(),
    )
    .unwrap();
    e.add_reward_token(reward_token()).unwrap();
    let pid = e.register_pool(stake_token(), 100, deposit_fee_bps).unwrap();
    (e, pid)
}

fn notify(t: &mut Tracker, amount: u128) {
    t.with_distributor(|d| d.notify_reward(amount))
        .unwrap()
        .unwrap();
}

// =============================================================================
// Reference scenario
// =============================================================================

#[test]
fn both_engines_split_late_joiner_scenario_identically() {
    let mut t = tracker();
    t.stake(alice(), stake_token(), 100).unwrap();
    notify(&mut t, 1_000);
    t.stake(bob(), stake_token(), 100).unwrap();
    notify(&mut t, 1_000);

    let (mut e, pid) = engine(0);
    e.deposit(alice(), pid, 100, None).unwrap();
    e.deposit_reward(feeder(), reward_token(), 1_000).unwrap();
    e.deposit(bob(), pid, 100, None).unwrap();
    e.deposit_reward(feeder(), reward_token(), 1_000).unwrap();

    assert_eq!(t.claimable(&alice()).unwrap(), 1_500);
    assert_eq!(t.claimable(&bob()).unwrap(), 500);
    assert_eq!(e.pending_reward(pid, &alice(), &reward_token()).unwrap(), 1_500);
    assert_eq!(e.pending_reward(pid, &bob(), &reward_token()).unwrap(), 500);

    // Trackers and pools agree on the per-share accumulator too.
    assert_eq!(
        t.cumulative_reward_per_share(),
        e.reward_per_share(pid, &reward_token()).unwrap()
    );
}

#[test]
fn deposit_fee_scenario() {
    let (mut e, pid) = engine(100);
    assert_eq!(e.deposit(alice(), pid, 10_000, None).unwrap(), 9_900);
    assert_eq!(
        e.bank()
            .balance_of(stake_token(), AccountId::derive("treasury"))
            .unwrap(),
        100
    );
    assert!(e
        .events()
        .iter()
        .any(|ev| matches!(ev, LedgerEvent::DepositFeeCharged { fee: 100, .. })));
}

#[test]
fn deposit_fee_is_taken_from_what_arrived() {
    let (mut e, pid) = engine(100);
    let treasury = AccountId::derive("treasury");
    e.bank_mut()
        .set_transfer_tax(stake_token(), Bps::new(200).unwrap());

    let received = 10_000 - 200;
    let fee = floor_bps(received, Bps::new(100).unwrap()).unwrap();
    assert_eq!(fee, 98);
    assert_eq!(e.deposit(alice(), pid, 10_000, None).unwrap(), received - fee);
    assert_eq!(e.user_amount(pid, &alice()), 9_702);
    assert_eq!(e.pool_info(pid).unwrap().total_staked, 9_702);
    assert_eq!(e.bank().balance_of(stake_token(), e.custody()).unwrap(), 9_702);
    // The fee leg is itself a taxed transfer.
    assert_eq!(e.bank().balance_of(stake_token(), treasury).unwrap(), 97);
    assert!(e
        .events()
        .iter()
        .any(|ev| matches!(ev, LedgerEvent::DepositFeeCharged { fee: 98, .. })));
    assert!(e.check_invariants().is_ok());
}

#[test]
fn payout_shortfall_is_clamped_not_carried() {
    let (mut e, pid) = engine(0);
    let custody = AccountId::derive("chef");
    e.deposit(alice(), pid, 100, None).unwrap();
    e.deposit_reward(feeder(), reward_token(), 1_000).unwrap();
    e.bank_mut()
        .transfer(reward_token(), custody, carol(), 400)
        .unwrap();

    e.harvest(alice(), pid).unwrap();
    assert_eq!(e.bank().balance_of(reward_token(), alice()).unwrap(), 600);
    assert_eq!(e.unclaimed_balance(&reward_token()).unwrap(), 0);
    assert_eq!(e.pending_reward(pid, &alice(), &reward_token()).unwrap(), 0);

    // New funding is fully distributable again.
    e.deposit_reward(feeder(), reward_token(), 100).unwrap();
    assert_eq!(e.pending_reward(pid, &alice(), &reward_token()).unwrap(), 100);
}

// =============================================================================
// Timing
// =============================================================================

#[test]
fn reward_released_before_first_stake_goes_to_first_staker() {
    let mut t = tracker();
    notify(&mut t, 700);
    t.update_rewards().unwrap();
    assert!(t.cumulative_reward_per_share().is_zero());

    t.stake(alice(), stake_token(), 7).unwrap();
    t.update_rewards().unwrap();
    assert_eq!(t.claimable(&alice()).unwrap(), 700);
}

#[test]
fn no_reward_for_time_before_stake() {
    let mut t = tracker();
    t.stake(alice(), stake_token(), 10).unwrap();
    notify(&mut t, 500);
    t.update_rewards().unwrap();
    t.stake(carol(), stake_token(), 1_000).unwrap();
    assert_eq!(t.claimable(&carol()).unwrap(), 0);
    assert_eq!(t.claim(carol(), carol()).unwrap(), 0);
}

#[test]
fn transfer_taxed_stake_is_credited_net() {
    let mut t = tracker();
    t.bank_mut()
        .set_transfer_tax(stake_token(), Bps::new(100).unwrap());
    assert_eq!(t.stake(alice(), stake_token(), 1_000).unwrap(), 990);
    assert_eq!(t.staked_amount(&alice()), 990);
    assert_eq!(t.total_staked(), 990);
    assert!(t.check_invariants().is_ok());
}

#[test]
fn failed_operations_leave_state_untouched() {
    let mut t = tracker();
    t.stake(alice(), stake_token(), 10).unwrap();
    notify(&mut t, 100);
    let before = t.state_hash();

    let rejected = [
        t.stake(alice(), stake_token(), 0).unwrap_err(),
        t.stake(alice(), reward_token(), 5).unwrap_err(),
        t.stake(alice(), stake_token(), 2_000_000).unwrap_err(),
        t.unstake(alice(), stake_token(), 11).unwrap_err(),
        t.transfer(alice(), bob(), 11).unwrap_err(),
    ];
    assert_eq!(rejected[0], AccrualError::ZeroAmount);
    assert_eq!(rejected[1], AccrualError::InvalidAsset(reward_token()));
    assert!(matches!(rejected[2], AccrualError::InsufficientBalance { .. }));
    assert_eq!(t.state_hash(), before);
}

#[test]
fn held_guard_rejects_every_entry_point() {
    let (mut e, pid) = engine(0);
    let mut t = tracker();
    let e_guard = e.reentrancy_guard().enter().unwrap();
    let t_guard = t.reentrancy_guard().enter().unwrap();

    assert_eq!(t.stake(alice(), stake_token(), 1).unwrap_err(), AccrualError::Reentrancy);
    assert_eq!(t.claim(alice(), alice()).unwrap_err(), AccrualError::Reentrancy);
    assert_eq!(t.update_rewards().unwrap_err(), AccrualError::Reentrancy);
    assert_eq!(e.deposit(alice(), pid, 1, None).unwrap_err(), AccrualError::Reentrancy);
    assert_eq!(e.sync_all_pools().unwrap_err(), AccrualError::Reentrancy);
    assert_eq!(
        e.deposit_reward(feeder(), reward_token(), 1).unwrap_err(),
        AccrualError::Reentrancy
    );

    drop((e_guard, t_guard));
    assert_eq!(t.stake(alice(), stake_token(), 1).unwrap(), 1);
    assert_eq!(e.deposit(alice(), pid, 1, None).unwrap(), 1);
}

// =============================================================================
// Random traces
// =============================================================================

#[derive(Clone, Debug)]
enum Action {
    Stake(u8, u128),
    Unstake(u8, u128),
    Claim(u8),
    Transfer(u8, u8, u128),
    Notify(u128),
    Update,
}

fn who(i: u8) -> AccountId {
    match i % 3 {
        0 => alice(),
        1 => bob(),
        _ => carol(),
    }
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (any::<u8>(), 0u128..20_000).prop_map(|(w, a)| Action::Stake(w, a)),
        (any::<u8>(), 0u128..20_000).prop_map(|(w, a)| Action::Unstake(w, a)),
        any::<u8>().prop_map(Action::Claim),
        (any::<u8>(), any::<u8>(), 0u128..20_000).prop_map(|(a, b, n)| Action::Transfer(a, b, n)),
        (0u128..1_000_000).prop_map(Action::Notify),
        Just(Action::Update),
    ]
}

fn apply(t: &mut Tracker, action: &Action) -> accrual_core::Result<()> {
    match *action {
        Action::Stake(w, a) => t.stake(who(w), stake_token(), a).map(|_| ()),
        Action::Unstake(w, a) => t.unstake(who(w), stake_token(), a),
        Action::Claim(w) => t.claim(who(w), who(w)).map(|_| ()),
        Action::Transfer(a, b, n) => t.transfer(who(a), who(b), n),
        Action::Notify(n) => t.with_distributor(|d| d.notify_reward(n))?,
        Action::Update => t.update_rewards(),
    }
}

#[derive(Clone, Debug)]
enum EngineAction {
    Deposit(u8, bool, u128),
    Withdraw(u8, bool, u128),
    Harvest(u8, bool),
    Emergency(u8, bool),
    Reward(u128),
    /// Reward sent straight to custody, observed on the next sync.
    Stray(u128),
    SetWeight(bool, u64),
    Sync,
}

fn engine_action() -> impl Strategy<Value = EngineAction> {
    prop_oneof![
        (any::<u8>(), any::<bool>(), 0u128..20_000).prop_map(|(w, p, a)| EngineAction::Deposit(w, p, a)),
        (any::<u8>(), any::<bool>(), 0u128..20_000).prop_map(|(w, p, a)| EngineAction::Withdraw(w, p, a)),
        (any::<u8>(), any::<bool>()).prop_map(|(w, p)| EngineAction::Harvest(w, p)),
        (any::<u8>(), any::<bool>()).prop_map(|(w, p)| EngineAction::Emergency(w, p)),
        (1u128..1_000_000).prop_map(EngineAction::Reward),
        (1u128..1_000_000).prop_map(EngineAction::Stray),
        (any::<bool>(), 0u64..4).prop_map(|(p, w)| EngineAction::SetWeight(p, w)),
        Just(EngineAction::Sync),
    ]
}

fn two_pool_engine() -> (Engine, [PoolId; 2]) {
    let (mut e, p0) = engine(100);
    let p1 = e.register_pool(second_stake_token(), 300, 0).unwrap();
    (e, [p0, p1])
}

fn apply_engine(e: &mut Engine, pools: [PoolId; 2], action: &EngineAction) -> accrual_core::Result<()> {
    let pool = |second: bool| if second { pools[1] } else { pools[0] };
    match *action {
        EngineAction::Deposit(w, p, a) => e.deposit(who(w), pool(p), a, None).map(|_| ()),
        EngineAction::Withdraw(w, p, a) => e.withdraw(who(w), pool(p), a),
        EngineAction::Harvest(w, p) => e.harvest(who(w), pool(p)),
        EngineAction::Emergency(w, p) => e.emergency_withdraw(who(w), pool(p)).map(|_| ()),
        EngineAction::Reward(a) => e.deposit_reward(feeder(), reward_token(), a).map(|_| ()),
        EngineAction::Stray(a) => {
            let custody = e.custody();
            e.bank_mut().transfer(reward_token(), feeder(), custody, a)
        }
        EngineAction::SetWeight(p, w) => e.set_pool_weight(pool(p), w),
        EngineAction::Sync => e.sync_all_pools(),
    }
}

proptest! {
    #[test]
    fn engine_traces_have_no_counterexample(actions in proptest::collection::vec(engine_action(), 1..60)) {
        let (mut e, pools) = two_pool_engine();
        let cx = first_counterexample(&mut e, &actions, |e, a| apply_engine(e, pools, a));
        prop_assert!(cx.is_none(), "{}", cx.map(|c| c.short()).unwrap_or_default());
    }

    /// With constant positions, each depositor's reward matches its pool's weight share times
    /// its stake share of that pool, up to rounding bounded by the number of arrivals.
    #[test]
    fn engine_positions_earn_their_weighted_share(
        weights in (1u64..100, 1u64..100),
        stakes in (1u128..1_000_000, 1u128..1_000_000, 1u128..1_000_000),
        rewards in proptest::collection::vec(1u128..10_000_000, 1..20),
    ) {
        let (wa, wb) = weights;
        let (a, c, b) = stakes;
        let (mut e, [p0, p1]) = two_pool_engine();
        e.set_pool_deposit_fee(p0, 0).unwrap();
        e.set_pool_weight(p0, wa).unwrap();
        e.set_pool_weight(p1, wb).unwrap();
        e.deposit(alice(), p0, a, None).unwrap();
        e.deposit(carol(), p0, c, None).unwrap();
        e.deposit(bob(), p1, b, None).unwrap();

        let total_weight = (wa + wb) as u128;
        let mut ideal_a = 0u128;
        let mut ideal_b = 0u128;
        for r in &rewards {
            e.deposit_reward(feeder(), reward_token(), *r).unwrap();
            ideal_a += r * wa as u128 * a / (total_weight * (a + c));
            ideal_b += r * wb as u128 / total_weight;
        }
        let got_a = e.pending_reward(p0, &alice(), &reward_token()).unwrap();
        let got_b = e.pending_reward(p1, &bob(), &reward_token()).unwrap();
        let got_c = e.pending_reward(p0, &carol(), &reward_token()).unwrap();
        let slack = 3 * rewards.len() as u128 + 3;
        prop_assert!(got_a + slack >= ideal_a && got_a <= ideal_a + slack,
            "alice got {} ideal {}", got_a, ideal_a);
        prop_assert!(got_b + slack >= ideal_b && got_b <= ideal_b + slack,
            "bob got {} ideal {}", got_b, ideal_b);
        let total: u128 = rewards.iter().sum();
        prop_assert!(got_a + got_b + got_c <= total);
    }

    #[test]
    fn tracker_traces_have_no_counterexample(actions in proptest::collection::vec(action(), 1..60)) {
        let mut t = tracker();
        let cx = first_counterexample(&mut t, &actions, apply);
        prop_assert!(cx.is_none(), "{}", cx.map(|c| c.short()).unwrap_or_default());
    }

    /// Whatever was released is either paid out or still in custody, and payouts never
    /// exceed what was released.
    #[test]
    fn rewards_are_conserved(actions in proptest::collection::vec(action(), 1..60)) {
        let mut t = tracker();
        let custody = t.custody();
        for a in &actions {
            let _ = apply(&mut t, a);
        }
        t.update_rewards().unwrap();
        let released = u64::MAX as u128 - t.bank().balance_of(reward_token(), feeder()).unwrap();
        let paid: u128 = [alice(), bob(), carol()]
            .iter()
            .map(|a| t.bank().balance_of(reward_token(), *a).unwrap())
            .sum();
        let held = t.bank().balance_of(reward_token(), custody).unwrap();
        prop_assert_eq!(paid + held, released);
        let owed: u128 = [alice(), bob(), carol()]
            .iter()
            .map(|a| t.claimable(a).unwrap())
            .sum();
        prop_assert!(owed <= held);
    }

    /// With constant stakes, each staker's reward matches its stake share up to one unit of
    /// rounding per fold.
    #[test]
    fn constant_stakes_earn_their_share(
        a in 1u128..1_000_000,
        b in 1u128..1_000_000,
        rewards in proptest::collection::vec(1u128..10_000_000, 1..20),
    ) {
        let mut t = tracker();
        t.stake(alice(), stake_token(), a).unwrap();
        t.stake(bob(), stake_token(), b).unwrap();
        let mut ideal_a = 0u128;
        for r in &rewards {
            notify(&mut t, *r);
            ideal_a += r * a / (a + b);
        }
        t.update_rewards().unwrap();
        let got_a = t.claimable(&alice()).unwrap();
        let slack = rewards.len() as u128 + 1;
        prop_assert!(got_a + slack >= ideal_a && got_a <= ideal_a + slack,
            "got {} ideal {}", got_a, ideal_a);
        let total: u128 = rewards.iter().sum();
        prop_assert!(got_a + t.claimable(&bob()).unwrap() <= total);
    }

    #[test]
    fn settlement_is_idempotent(
        stake in 1u128..100_000,
        reward in 0u128..1_000_000,
    ) {
        let mut t = tracker();
        t.stake(alice(), stake_token(), stake).unwrap();
        notify(&mut t, reward);
        t.update_rewards_for(alice()).unwrap();
        let once = t.state_hash();
        t.update_rewards_for(alice()).unwrap();
        prop_assert_eq!(t.state_hash(), once);
    }
}
