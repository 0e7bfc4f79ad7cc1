//! `accrual simulate`: replay a JSON scenario against one of the two engines.
//!
//! Accounts and tokens are referenced by label and mapped to ids with
//! `AccountId::derive` / `TokenId::derive`. A rejected step is reported and the replay
//! continues, as a ledger would keep serving after a failed transaction.

use accrual_core::invariants::Audited;
use accrual_core::{
    AccountId, AccrualConfig, InMemoryBank, LedgerEvent, ManualDistributor, MultiPoolEngine,
    PoolId, RewardTracker, TokenBank, TokenId,
};
use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

/// Funding account behind `notify_reward` in tracker scenarios.
const FEEDER_LABEL: &str = "reward-feeder";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Tracker,
    MultiPool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub engine: EngineKind,

    /// Tracker: reward token label.
    #[serde(default = "default_reward_token")]
    pub reward_token: String,

    /// Tracker: accepted stake asset labels.
    #[serde(default)]
    pub stake_tokens: Vec<String>,

    /// Multi-pool: deposit fee receiver label.
    #[serde(default = "default_fee_receiver")]
    pub fee_receiver: String,

    pub steps: Vec<Step>,
}

fn default_reward_token() -> String {
    "reward".into()
}

fn default_fee_receiver() -> String {
    "treasury".into()
}

/// One scenario step. Amounts may be given as JSON numbers or, beyond `u64::MAX`, as
/// decimal strings.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Mint {
        token: String,
        to: String,
        #[serde(with = "amount")]
        amount: u128,
    },
    Stake {
        account: String,
        token: String,
        #[serde(with = "amount")]
        amount: u128,
    },
    Unstake {
        account: String,
        token: String,
        #[serde(with = "amount")]
        amount: u128,
    },
    NotifyReward {
        #[serde(with = "amount")]
        amount: u128,
    },
    Claim {
        account: String,
    },
    RegisterPool {
        stake_token: String,
        weight: u64,
        #[serde(default)]
        deposit_fee_bps: u16,
    },
    AddRewardToken {
        token: String,
    },
    DepositReward {
        from: String,
        token: String,
        #[serde(with = "amount")]
        amount: u128,
    },
    Deposit {
        account: String,
        pool: u32,
        #[serde(with = "amount")]
        amount: u128,
        #[serde(default)]
        referrer: Option<String>,
    },
    Withdraw {
        account: String,
        pool: u32,
        #[serde(with = "amount")]
        amount: u128,
    },
    Harvest {
        account: String,
        pool: u32,
    },
    EmergencyWithdraw {
        account: String,
        pool: u32,
    },
}

/// Token amounts. Internally tagged steps are buffered before they are decoded, and the
/// buffer only carries integers up to `u64::MAX`; larger amounts travel as strings.
mod amount {
    use serde::{de::Error as _, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Decimal(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(u128::from(n)),
            Raw::Decimal(s) => s
                .parse()
                .map_err(|_| D::Error::custom(format!("invalid amount {s:?}"))),
        }
    }
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Mint { .. } => "mint",
            Step::Stake { .. } => "stake",
            Step::Unstake { .. } => "unstake",
            Step::NotifyReward { .. } => "notify_reward",
            Step::Claim { .. } => "claim",
            Step::RegisterPool { .. } => "register_pool",
            Step::AddRewardToken { .. } => "add_reward_token",
            Step::DepositReward { .. } => "deposit_reward",
            Step::Deposit { .. } => "deposit",
            Step::Withdraw { .. } => "withdraw",
            Step::Harvest { .. } => "harvest",
            Step::EmergencyWithdraw { .. } => "emergency_withdraw",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccountReport {
    pub label: String,
    pub id: AccountId,
    /// Stake by position ("tracker" or "pool#N").
    pub staked: BTreeMap<String, u128>,
    /// Claimable reward by "position/token".
    pub claimable: BTreeMap<String, u128>,
    /// Bank balances by token label.
    pub balances: BTreeMap<String, u128>,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub engine: EngineKind,
    pub steps: Vec<StepOutcome>,
    pub accounts: Vec<AccountReport>,
    pub events: Vec<LedgerEvent>,
    pub metrics: serde_json::Value,
    pub state_hash: String,
    /// First invariant violation, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invariant_violation: Option<String>,
}

/// Label registry. Remembers every label used so the report can list it.
#[derive(Default)]
struct Book {
    accounts: BTreeMap<String, AccountId>,
    tokens: BTreeMap<String, TokenId>,
}

impl Book {
    fn account(&mut self, label: &str) -> AccountId {
        *self
            .accounts
            .entry(label.to_owned())
            .or_insert_with(|| AccountId::derive(label))
    }

    fn token(&mut self, label: &str) -> TokenId {
        *self
            .tokens
            .entry(label.to_owned())
            .or_insert_with(|| TokenId::derive(label))
    }

    fn balances<B: TokenBank>(&self, bank: &B, account: AccountId) -> Result<BTreeMap<String, u128>> {
        let mut out = BTreeMap::new();
        for (label, token) in &self.tokens {
            out.insert(label.clone(), bank.balance_of(*token, account)?);
        }
        Ok(out)
    }
}

pub fn run(scenario: PathBuf, format: OutputFormat, config: &AccrualConfig) -> Result<()> {
    let raw = fs::read_to_string(&scenario)
        .with_context(|| format!("Failed to read scenario {}", scenario.display()))?;
    let parsed: Scenario = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid scenario {}", scenario.display()))?;

    let report = simulate(&parsed, config)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Human => print_human(&report),
    }
    if let Some(violation) = &report.invariant_violation {
        bail!("invariant violated after replay: {violation}");
    }
    Ok(())
}

pub fn simulate(scenario: &Scenario, config: &AccrualConfig) -> Result<Report> {
    match scenario.engine {
        EngineKind::Tracker => simulate_tracker(scenario, config),
        EngineKind::MultiPool => simulate_engine(scenario, config),
    }
}

fn outcome(index: usize, step: &Step, result: Result<String>) -> StepOutcome {
    match result {
        Ok(msg) => StepOutcome {
            index,
            op: step.name(),
            result: Some(msg),
            error: None,
        },
        Err(e) => {
            warn!(step = index, op = step.name(), error = %e, "step rejected");
            StepOutcome {
                index,
                op: step.name(),
                result: None,
                error: Some(e.to_string()),
            }
        }
    }
}

// =============================================================================
// Single-stream tracker
// =============================================================================

type Tracker = RewardTracker<InMemoryBank, ManualDistributor>;

fn simulate_tracker(scenario: &Scenario, config: &AccrualConfig) -> Result<Report> {
    let mut book = Book::default();
    let reward = book.token(&scenario.reward_token);
    let stake_tokens: Vec<TokenId> = scenario
        .stake_tokens
        .iter()
        .map(|label| book.token(label))
        .collect();
    let feeder = AccountId::derive(FEEDER_LABEL);
    let distributor = ManualDistributor::new(reward, feeder)?;
    let mut tracker = RewardTracker::new(
        AccountId::derive("tracker-custody"),
        InMemoryBank::new(),
        distributor,
        stake_tokens,
        config.staking.clone(),
    )?;

    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (i, step) in scenario.steps.iter().enumerate() {
        let result = apply_tracker_step(&mut tracker, &mut book, reward, feeder, step);
        steps.push(outcome(i, step, result));
    }
    tracker.update_rewards()?;
    info!(steps = steps.len(), "tracker scenario replayed");

    let mut accounts = Vec::with_capacity(book.accounts.len());
    for (label, id) in &book.accounts {
        let mut staked = BTreeMap::new();
        staked.insert("tracker".to_owned(), tracker.staked_amount(id));
        let mut claimable = BTreeMap::new();
        claimable.insert(
            format!("tracker/{}", scenario.reward_token),
            tracker.claimable(id)?,
        );
        accounts.push(AccountReport {
            label: label.clone(),
            id: *id,
            staked,
            claimable,
            balances: book.balances(tracker.bank(), *id)?,
        });
    }

    Ok(Report {
        engine: EngineKind::Tracker,
        steps,
        accounts,
        events: tracker.take_events(),
        metrics: tracker.metrics().to_json(),
        state_hash: hex::encode(tracker.state_hash()),
        invariant_violation: tracker.check_invariants().err().map(|v| v.to_string()),
    })
}

fn apply_tracker_step(
    tracker: &mut Tracker,
    book: &mut Book,
    reward: TokenId,
    feeder: AccountId,
    step: &Step,
) -> Result<String> {
    match step {
        Step::Mint { token, to, amount } => {
            let (token, to) = (book.token(token), book.account(to));
            tracker.bank_mut().mint(token, to, *amount)?;
            Ok(format!("minted {amount}"))
        }
        Step::Stake {
            account,
            token,
            amount,
        } => {
            let credited = tracker.stake(book.account(account), book.token(token), *amount)?;
            Ok(format!("staked {credited}"))
        }
        Step::Unstake {
            account,
            token,
            amount,
        } => {
            tracker.unstake(book.account(account), book.token(token), *amount)?;
            Ok(format!("unstaked {amount}"))
        }
        Step::NotifyReward { amount } => {
            tracker.bank_mut().mint(reward, feeder, *amount)?;
            tracker.with_distributor(|d| d.notify_reward(*amount))??;
            Ok(format!("queued {amount}"))
        }
        Step::Claim { account } => {
            let account = book.account(account);
            let paid = tracker.claim(account, account)?;
            Ok(format!("claimed {paid}"))
        }
        other => bail!("`{}` is not a tracker step", other.name()),
    }
}

// =============================================================================
// Multi-pool engine
// =============================================================================

type Engine = MultiPoolEngine<InMemoryBank>;

fn simulate_engine(scenario: &Scenario, config: &AccrualConfig) -> Result<Report> {
    let mut book = Book::default();
    let fee_receiver = book.account(&scenario.fee_receiver);
    let mut engine = MultiPoolEngine::new(
        AccountId::derive("engine-custody"),
        InMemoryBank::new(),
        fee_receiver,
        config.pools.clone(),
    )?;

    let mut steps = Vec::with_capacity(scenario.steps.len());
    for (i, step) in scenario.steps.iter().enumerate() {
        let result = apply_engine_step(&mut engine, &mut book, step);
        steps.push(outcome(i, step, result));
    }
    engine.sync_all_pools()?;
    info!(steps = steps.len(), pools = engine.pool_count(), "multi-pool scenario replayed");

    let token_labels: BTreeMap<TokenId, String> = book
        .tokens
        .iter()
        .map(|(label, id)| (*id, label.clone()))
        .collect();
    let reward_tokens: Vec<TokenId> = engine.reward_tokens().copied().collect();

    let mut accounts = Vec::with_capacity(book.accounts.len());
    for (label, id) in &book.accounts {
        let mut staked = BTreeMap::new();
        let mut claimable = BTreeMap::new();
        for pid in (0..engine.pool_count()).map(|i| PoolId(i as u32)) {
            let amount = engine.user_amount(pid, id);
            if amount > 0 {
                staked.insert(pid.to_string(), amount);
            }
            for token in &reward_tokens {
                let pending = engine.pending_reward(pid, id, token)?;
                if pending > 0 {
                    let name = token_labels
                        .get(token)
                        .cloned()
                        .unwrap_or_else(|| token.to_string());
                    claimable.insert(format!("{pid}/{name}"), pending);
                }
            }
        }
        accounts.push(AccountReport {
            label: label.clone(),
            id: *id,
            staked,
            claimable,
            balances: book.balances(engine.bank(), *id)?,
        });
    }

    Ok(Report {
        engine: EngineKind::MultiPool,
        steps,
        accounts,
        events: engine.take_events(),
        metrics: engine.metrics().to_json(),
        state_hash: hex::encode(engine.state_hash()),
        invariant_violation: engine.check_invariants().err().map(|v| v.to_string()),
    })
}

fn apply_engine_step(engine: &mut Engine, book: &mut Book, step: &Step) -> Result<String> {
    match step {
        Step::Mint { token, to, amount } => {
            let (token, to) = (book.token(token), book.account(to));
            engine.bank_mut().mint(token, to, *amount)?;
            Ok(format!("minted {amount}"))
        }
        Step::RegisterPool {
            stake_token,
            weight,
            deposit_fee_bps,
        } => {
            let pid = engine.register_pool(book.token(stake_token), *weight, *deposit_fee_bps)?;
            Ok(format!("registered {pid}"))
        }
        Step::AddRewardToken { token } => {
            engine.add_reward_token(book.token(token))?;
            Ok(format!("reward token {token} added"))
        }
        Step::DepositReward {
            from,
            token,
            amount,
        } => {
            let received = engine.deposit_reward(book.account(from), book.token(token), *amount)?;
            Ok(format!("reward received {received}"))
        }
        Step::Deposit {
            account,
            pool,
            amount,
            referrer,
        } => {
            let referrer = referrer.as_deref().map(|r| book.account(r));
            let net = engine.deposit(book.account(account), PoolId(*pool), *amount, referrer)?;
            Ok(format!("deposited {net}"))
        }
        Step::Withdraw {
            account,
            pool,
            amount,
        } => {
            engine.withdraw(book.account(account), PoolId(*pool), *amount)?;
            Ok(format!("withdrew {amount}"))
        }
        Step::Harvest { account, pool } => {
            engine.harvest(book.account(account), PoolId(*pool))?;
            Ok("harvested".into())
        }
        Step::EmergencyWithdraw { account, pool } => {
            let amount = engine.emergency_withdraw(book.account(account), PoolId(*pool))?;
            Ok(format!("emergency withdrew {amount}"))
        }
        other => bail!("`{}` is not a multi-pool step", other.name()),
    }
}

// =============================================================================
// Output
// =============================================================================

fn print_human(report: &Report) {
    println!("Engine: {:?}", report.engine);
    println!();
    println!("Steps:");
    for s in &report.steps {
        match (&s.result, &s.error) {
            (_, Some(err)) => println!("  [{:>3}] {:<18} REJECTED: {err}", s.index, s.op),
            (Some(msg), None) => println!("  [{:>3}] {:<18} {msg}", s.index, s.op),
            (None, None) => println!("  [{:>3}] {:<18}", s.index, s.op),
        }
    }
    println!();
    println!("Accounts:");
    for a in &report.accounts {
        println!("  {} ({})", a.label, a.id);
        for (pos, amount) in &a.staked {
            println!("    staked    {pos:<20} {amount}");
        }
        for (key, amount) in &a.claimable {
            println!("    claimable {key:<20} {amount}");
        }
        for (token, amount) in a.balances.iter().filter(|(_, v)| **v > 0) {
            println!("    balance   {token:<20} {amount}");
        }
    }
    println!();
    println!("Events: {}", report.events.len());
    for ev in &report.events {
        match serde_json::to_string(ev) {
            Ok(line) => println!("  {line}"),
            Err(_) => println!("  {ev:?}"),
        }
    }
    println!();
    println!("State hash: {}", report.state_hash);
    match &report.invariant_violation {
        Some(v) => println!("Invariants: VIOLATED ({v})"),
        None => println!("Invariants: ok"),
    }
}
