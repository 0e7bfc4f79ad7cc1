//! Operation counters for the ledgers.
//!
//! Relaxed atomics: the counters are observational and never feed back into accounting.
//!
//! ```rust,ignore
//! let m = tracker.metrics();
//! println!("{}", m.to_json());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// A simple counter that can only increase.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a token amount, saturating at `u64::MAX`.
    pub fn add_amount(&self, amount: u128) {
        let n = u64::try_from(amount).unwrap_or(u64::MAX);
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(n))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct LedgerMetrics {
    pub settlements: Counter,
    pub rewards_accrued: Counter,
    pub stakes: Counter,
    pub unstakes: Counter,
    pub claims: Counter,
    pub rewards_paid: Counter,
    pub payouts_clamped: Counter,
    pub emergency_withdrawals: Counter,
    pub rejected_operations: Counter,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "settlements": self.settlements.get(),
            "rewards_accrued": self.rewards_accrued.get(),
            "stakes": self.stakes.get(),
            "unstakes": self.unstakes.get(),
            "claims": self.claims.get(),
            "rewards_paid": self.rewards_paid.get(),
            "payouts_clamped": self.payouts_clamped.get(),
            "emergency_withdrawals": self.emergency_withdrawals.get(),
            "rejected_operations": self.rejected_operations.get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = LedgerMetrics::new();
        m.stakes.inc();
        m.stakes.inc();
        m.rewards_paid.add_amount(1_500);
        m.rewards_paid.add_amount(u128::MAX);
        assert_eq!(m.stakes.get(), 2);
        assert_eq!(m.to_json()["stakes"], 2);
        assert_eq!(m.rewards_paid.get(), u64::MAX);
    }
}
