//! Fixed-point reward-per-share arithmetic.
//!
//! Reward per share is `reward * PRECISION / share_supply`, held in 256 bits so that any
//! `u128` reward times `PRECISION` fits. Every payout multiplies before it divides:
//! `stake * (acc_now - acc_then) / PRECISION`, one truncation per settlement.

use crate::{AccrualError, Result};
use serde::{Deserialize, Serialize};

pub use ruint::aliases::U256;

/// Fixed-point scale of every reward-per-share accumulator.
pub const PRECISION: u128 = 1_000_000_000_000_000_000_000_000_000_000;

pub const BPS_U16: u16 = 10_000;
pub const BPS_U128: u128 = 10_000;

/// Basis points in `[0, 10_000]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Bps(u16);

impl Bps {
    pub const ZERO: Bps = Bps(0);
    pub const MAX: Bps = Bps(BPS_U16);

    pub fn new(v: u16) -> Result<Bps> {
        if v <= BPS_U16 {
            Ok(Bps(v))
        } else {
            Err(AccrualError::Config(format!("bps out of range: {v} > {BPS_U16}")))
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn as_u128(self) -> u128 {
        self.0 as u128
    }
}

impl TryFrom<u16> for Bps {
    type Error = AccrualError;
    fn try_from(value: u16) -> std::result::Result<Self, Self::Error> {
        Bps::new(value)
    }
}

impl From<Bps> for u16 {
    fn from(value: Bps) -> Self {
        value.0
    }
}

pub fn precision() -> U256 {
    U256::from(PRECISION)
}

pub fn add_u128(a: u128, b: u128) -> Result<u128> {
    a.checked_add(b).ok_or(AccrualError::Overflow("u128 add"))
}

pub fn sub_u128(a: u128, b: u128) -> Result<u128> {
    a.checked_sub(b).ok_or(AccrualError::Overflow("u128 sub"))
}

/// `floor(a * b / denom)` with a 256-bit intermediate.
pub fn mul_div_floor(a: u128, b: u128, denom: u128) -> Result<u128> {
    if denom == 0 {
        return Err(AccrualError::Overflow("mul_div by zero"));
    }
    let prod = U256::from(a)
        .checked_mul(U256::from(b))
        .ok_or(AccrualError::Overflow("mul_div mul"))?;
    let out = prod / U256::from(denom);
    u128::try_from(out).map_err(|_| AccrualError::Overflow("mul_div narrow"))
}

pub fn floor_bps(amount: u128, bps: Bps) -> Result<u128> {
    mul_div_floor(amount, bps.as_u128(), BPS_U128)
}

/// Accumulator increment for `reward` spread over `share_supply`.
///
/// Callers guard `share_supply == 0`; it is reported as an error rather than skipped so a
/// missing guard cannot silently drop rewards.
pub fn per_share_delta(reward: u128, share_supply: u128) -> Result<U256> {
    if share_supply == 0 {
        return Err(AccrualError::Overflow("per_share_delta with zero supply"));
    }
    let scaled = U256::from(reward)
        .checked_mul(precision())
        .ok_or(AccrualError::Overflow("per_share_delta mul"))?;
    Ok(scaled / U256::from(share_supply))
}

/// Reward earned by `stake` while the accumulator moved from `from` to `to`.
pub fn accrued(stake: u128, from: U256, to: U256) -> Result<u128> {
    let delta = to
        .checked_sub(from)
        .ok_or(AccrualError::Overflow("accumulator went backwards"))?;
    if stake == 0 || delta.is_zero() {
        return Ok(0);
    }
    let prod = U256::from(stake)
        .checked_mul(delta)
        .ok_or(AccrualError::Overflow("accrued mul"))?;
    u128::try_from(prod / precision()).map_err(|_| AccrualError::Overflow("accrued narrow"))
}

/// Pool share of `amount` under allocation weights: `floor(amount * weight / total_weight)`.
pub fn weighted_share(amount: u128, weight: u64, total_weight: u64) -> Result<u128> {
    mul_div_floor(amount, weight as u128, total_weight as u128)
}
