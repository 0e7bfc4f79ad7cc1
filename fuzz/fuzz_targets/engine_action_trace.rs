#![no_main]

use accrual_core::config::PoolBoundsConfig;
use accrual_core::invariants::first_counterexample;
use accrual_core::{AccountId, InMemoryBank, MultiPoolEngine, PoolId, TokenBank, TokenId};
use libfuzzer_sys::fuzz_target;

const MAX_ACTIONS: usize = 128;
const ACCOUNTS: usize = 3;
const POOLS: u32 = 3;

struct Cursor<'a> {
    bytes: &'a [u8],
    index: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, index: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.index.checked_add(n)?;
        if end > self.bytes.len() {
            return None;
        }
        let out = &self.bytes[self.index..end];
        self.index = end;
        Some(out)
    }

    fn take_u8(&mut self) -> Option<u8> {
        Some(*self.take(1)?.first()?)
    }

    fn take_u32_le(&mut self) -> Option<u32> {
        let s = self.take(4)?;
        Some(u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }
}

#[derive(Debug)]
enum Action {
    Deposit(usize, PoolId, u128),
    Withdraw(usize, PoolId, u128),
    Harvest(usize, PoolId),
    Emergency(usize, PoolId),
    DepositReward(usize, u128),
    StrayReward(usize, u128),
    SetWeight(PoolId, u64),
    Sync,
    /// Drains custody of a reward token to force clamped payouts.
    Drain(usize, u128),
}

fn decode(data: &[u8]) -> Vec<Action> {
    let mut c = Cursor::new(data);
    let mut out = Vec::new();
    while out.len() < MAX_ACTIONS {
        let Some(tag) = c.take_u8() else { break };
        let Some(sel) = c.take_u8() else { break };
        let Some(amount) = c.take_u32_le().map(u128::from) else { break };
        let who = sel as usize % ACCOUNTS;
        let pool = PoolId((sel as u32 >> 2) % (POOLS + 1));
        let token = (sel as usize >> 4) % 2;
        out.push(match tag % 9 {
            0 => Action::Deposit(who, pool, amount),
            1 => Action::Withdraw(who, pool, amount),
            2 => Action::Harvest(who, pool),
            3 => Action::Emergency(who, pool),
            4 => Action::DepositReward(token, amount),
            5 => Action::StrayReward(token, amount),
            6 => Action::SetWeight(pool, (amount % 8) as u64),
            7 => Action::Sync,
            _ => Action::Drain(token, amount % 1_000),
        });
    }
    out
}

fn account(i: usize) -> AccountId {
    AccountId::derive(&format!("fuzz-{i}"))
}

fn stake_token(p: u32) -> TokenId {
    TokenId::derive(&format!("lp-{p}"))
}

fn reward_token(i: usize) -> TokenId {
    TokenId::derive(&format!("reward-{i}"))
}

fuzz_target!(|data: &[u8]| {
    let actions = decode(data);
    if actions.is_empty() {
        return;
    }

    let custody = AccountId::derive("chef");
    let funder = AccountId::derive("funder");
    let sink = AccountId::derive("sink");
    let mut bank = InMemoryBank::new();
    for p in 0..POOLS {
        for i in 0..ACCOUNTS {
            bank.mint(stake_token(p), account(i), u32::MAX as u128 * 4)
                .expect("mint stake");
        }
    }
    for t in 0..2 {
        bank.mint(reward_token(t), funder, u64::MAX as u128)
            .expect("mint reward");
    }
    let mut engine = MultiPoolEngine::new(custody, bank, AccountId::derive("treasury"), PoolBoundsConfig::default())
        .expect("engine");
    for t in 0..2 {
        engine.add_reward_token(reward_token(t)).expect("reward token");
    }
    for p in 0..POOLS {
        engine
            .register_pool(stake_token(p), u64::from(p) + 1, (p * 100) as u16)
            .expect("pool");
    }

    let cx = first_counterexample(&mut engine, &actions, |e, action| match *action {
        Action::Deposit(w, pid, a) => e.deposit(account(w), pid, a, None).map(|_| ()),
        Action::Withdraw(w, pid, a) => e.withdraw(account(w), pid, a),
        Action::Harvest(w, pid) => e.harvest(account(w), pid),
        Action::Emergency(w, pid) => e.emergency_withdraw(account(w), pid).map(|_| ()),
        Action::DepositReward(t, a) => e.deposit_reward(funder, reward_token(t), a).map(|_| ()),
        Action::StrayReward(t, a) => e.bank_mut().transfer(reward_token(t), funder, custody, a),
        Action::SetWeight(pid, w) => e.set_pool_weight(pid, w),
        Action::Sync => e.sync_all_pools(),
        Action::Drain(t, a) => {
            let held = e.bank().balance_of(reward_token(t), custody)?;
            e.bank_mut().transfer(reward_token(t), custody, sink, a.min(held))
        }
    });

    if let Some(cx) = cx {
        panic!("{}\nactions: {:?}", cx.short(), actions);
    }
});
