#![no_main]

use accrual_core::config::StakingConfig;
use accrual_core::invariants::first_counterexample;
use accrual_core::{AccountId, InMemoryBank, ManualDistributor, RewardTracker, TokenId};
use libfuzzer_sys::fuzz_target;

const MAX_ACTIONS: usize = 128;
const ACCOUNTS: usize = 4;

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
    Stake(usize, u128),
    Unstake(usize, u128),
    Claim(usize, usize),
    Transfer(usize, usize, u128),
    Notify(u128),
    Update,
    UpdateFor(usize),
    ToggleTax(u16),
}

fn decode(data: &[u8]) -> Vec<Action> {
    let mut c = Cursor::new(data);
    let mut out = Vec::new();
    while out.len() < MAX_ACTIONS {
        let Some(tag) = c.take_u8() else { break };
        let Some(who) = c.take_u8().map(|b| b as usize % ACCOUNTS) else { break };
        // u32 amounts keep traces inside funded balances often enough to be interesting.
        let Some(amount) = c.take_u32_le().map(u128::from) else { break };
        let other = (who + 1 + (tag as usize >> 3)) % ACCOUNTS;
        out.push(match tag % 8 {
            0 => Action::Stake(who, amount),
            1 => Action::Unstake(who, amount),
            2 => Action::Claim(who, other),
            3 => Action::Transfer(who, other, amount),
            4 => Action::Notify(amount),
            5 => Action::Update,
            6 => Action::UpdateFor(who),
            _ => Action::ToggleTax((amount % 500) as u16),
        });
    }
    out
}

fn account(i: usize) -> AccountId {
    AccountId::derive(&format!("fuzz-{i}"))
}

fuzz_target!(|data: &[u8]| {
    let actions = decode(data);
    if actions.is_empty() {
        return;
    }

    let stake = TokenId::derive("stake");
    let reward = TokenId::derive("reward");
    let feeder = AccountId::derive("feeder");
    let mut bank = InMemoryBank::new();
    for i in 0..ACCOUNTS {
        bank.mint(stake, account(i), u32::MAX as u128 * 4)
            .expect("mint stake");
    }
    bank.mint(reward, feeder, u64::MAX as u128).expect("mint reward");
    let distributor = ManualDistributor::new(reward, feeder).expect("distributor");
    let mut tracker = RewardTracker::new(
        AccountId::derive("custody"),
        bank,
        distributor,
        [stake],
        StakingConfig::default(),
    )
    .expect("tracker");

    let cx = first_counterexample(&mut tracker, &actions, |t, action| match *action {
        Action::Stake(w, a) => t.stake(account(w), stake, a).map(|_| ()),
        Action::Unstake(w, a) => t.unstake(account(w), stake, a),
        Action::Claim(w, r) => t.claim(account(w), account(r)).map(|_| ()),
        Action::Transfer(a, b, n) => t.transfer(account(a), account(b), n),
        Action::Notify(n) => t.with_distributor(|d| d.notify_reward(n))?,
        Action::Update => t.update_rewards(),
        Action::UpdateFor(w) => t.update_rewards_for(account(w)),
        Action::ToggleTax(bps) => {
            let bps = accrual_core::Bps::new(bps)?;
            t.bank_mut().set_transfer_tax(stake, bps);
            Ok(())
        }
    });

    if let Some(cx) = cx {
        panic!("{}\nactions: {:?}", cx.short(), actions);
    }
});
