//! Ledger invariants and the action-trace rail that checks them.

use crate::math::U256;
use crate::{AccrualError, PoolId, TokenId};
use std::collections::BTreeMap;

/// Stable identifiers for ledger invariants (used in tests, fuzzing and counterexamples).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantId {
    /// An operation returned `Err` but the state hash changed.
    NoMutationOnError,

    /// `total_staked` disagreed with the sum of per-account stake.
    StakeConservation,

    /// Minted share supply disagreed with total stake.
    ShareSupplyMatchesStake,

    /// Per-asset deposit supply disagreed with the sum of deposit balances.
    DepositSupplyMatchesBalances,

    /// A pool's recorded total disagreed with the sum of its positions.
    PoolTotalsMatchPositions,

    /// `total_weight` disagreed with the sum of pool weights.
    WeightsMatchTotal,

    /// An accumulator moved backwards between two observations.
    AccumulatorMonotone,

    /// Custody held less stake asset than the ledger owes stakers.
    CustodyCoversStake,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantViolation {
    pub id: InvariantId,
    pub details: String,
}

impl InvariantViolation {
    pub fn new(id: InvariantId, details: impl Into<String>) -> Self {
        Self {
            id,
            details: details.into(),
        }
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.id, self.details)
    }
}

impl std::error::Error for InvariantViolation {}

impl From<InvariantViolation> for AccrualError {
    fn from(v: InvariantViolation) -> Self {
        AccrualError::Invariant(v.to_string())
    }
}

/// One reward-per-share accumulator: the pool it belongs to (none for a single-stream
/// tracker) and its reward token.
pub type AccumulatorKey = (Option<PoolId>, TokenId);

/// A ledger that can be fingerprinted and audited between operations.
pub trait Audited {
    /// Hash over all accounting state (not events or metrics).
    fn state_hash(&self) -> [u8; 32];

    fn check_invariants(&self) -> Result<(), InvariantViolation>;

    /// Current value of every reward-per-share accumulator.
    fn accumulators(&self) -> BTreeMap<AccumulatorKey, U256>;
}

/// Every accumulator observed in `before` must still exist and must not have decreased.
pub fn check_accumulators_monotone(
    before: &BTreeMap<AccumulatorKey, U256>,
    after: &BTreeMap<AccumulatorKey, U256>,
) -> Result<(), InvariantViolation> {
    for ((pool, token), old) in before {
        let new = after.get(&(*pool, *token)).copied().unwrap_or(U256::ZERO);
        if new < *old {
            let scope = pool.map(|p| p.to_string()).unwrap_or_else(|| "tracker".into());
            return Err(InvariantViolation::new(
                InvariantId::AccumulatorMonotone,
                format!("{scope} token {token}: accumulator fell from {old} to {new}"),
            ));
        }
    }
    Ok(())
}

/// First invariant failure found while replaying a trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Counterexample {
    pub violation: InvariantViolation,
    /// Index of the action after which the violation was observed.
    pub at_step: usize,
    pub state_hash: [u8; 32],
}

impl Counterexample {
    pub fn short(&self) -> String {
        format!(
            "Invariant {:?} violated at step {} (state_hash={})",
            self.violation.id,
            self.at_step,
            hex::encode(self.state_hash)
        )
    }
}

/// Apply `actions` in order, checking "no mutation on error" for failing actions, and the
/// ledger invariants plus accumulator monotonicity after every successful one.
pub fn first_counterexample<L, A, F>(
    ledger: &mut L,
    actions: &[A],
    mut apply: F,
) -> Option<Counterexample>
where
    L: Audited,
    F: FnMut(&mut L, &A) -> crate::Result<()>,
{
    for (i, action) in actions.iter().enumerate() {
        let before = ledger.state_hash();
        let accumulators = ledger.accumulators();
        match apply(ledger, action) {
            Err(e) => {
                let after = ledger.state_hash();
                if after != before {
                    return Some(Counterexample {
                        violation: InvariantViolation::new(
                            InvariantId::NoMutationOnError,
                            format!("action returned Err but state hash changed: {e}"),
                        ),
                        at_step: i,
                        state_hash: after,
                    });
                }
            }
            Ok(()) => {
                let checked = ledger.check_invariants().and_then(|_| {
                    check_accumulators_monotone(&accumulators, &ledger.accumulators())
                });
                if let Err(violation) = checked {
                    return Some(Counterexample {
                        violation,
                        at_step: i,
                        state_hash: ledger.state_hash(),
                    });
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        a: u64,
        b: u64,
        total: u64,
        per_share: u64,
    }

    impl Audited for Counter {
        fn state_hash(&self) -> [u8; 32] {
            let mut out = [0u8; 32];
            out[..8].copy_from_slice(&self.a.to_le_bytes());
            out[8..16].copy_from_slice(&self.b.to_le_bytes());
            out[16..24].copy_from_slice(&self.total.to_le_bytes());
            out[24..].copy_from_slice(&self.per_share.to_le_bytes());
            out
        }

        fn accumulators(&self) -> BTreeMap<AccumulatorKey, U256> {
            BTreeMap::from([((None, TokenId::derive("r")), U256::from(self.per_share))])
        }

        fn check_invariants(&self) -> Result<(), InvariantViolation> {
            if self.a + self.b != self.total {
                return Err(InvariantViolation::new(InvariantId::StakeConservation, "a + b != total"));
            }
            Ok(())
        }
    }

    #[test]
    fn rail_reports_mutation_on_error() {
        let mut c = Counter::default();
        let cx = first_counterexample(&mut c, &[1u64, 2], |c, n| {
            c.a += n;
            c.total += n;
            if *n == 2 {
                return Err(AccrualError::ZeroAmount);
            }
            Ok(())
        })
        .expect("counterexample");
        assert_eq!(cx.violation.id, InvariantId::NoMutationOnError);
        assert_eq!(cx.at_step, 1);
    }

    #[test]
    fn rail_reports_broken_invariant() {
        let mut c = Counter::default();
        let cx = first_counterexample(&mut c, &[3u64], |c, n| {
            c.b += n;
            Ok(())
        })
        .expect("counterexample");
        assert_eq!(cx.violation.id, InvariantId::StakeConservation);
        assert!(cx.short().contains("StakeConservation"));
    }

    #[test]
    fn rail_reports_accumulator_moving_backwards() {
        let mut c = Counter::default();
        let cx = first_counterexample(&mut c, &[7u64, 3], |c, n| {
            c.per_share = *n;
            Ok(())
        })
        .expect("counterexample");
        assert_eq!(cx.violation.id, InvariantId::AccumulatorMonotone);
        assert_eq!(cx.at_step, 1);
        assert!(cx.violation.details.contains("from 7 to 3"));
    }

    #[test]
    fn vanished_accumulator_counts_as_zero() {
        let token = TokenId::derive("r");
        let before = BTreeMap::from([((Some(PoolId(0)), token), U256::from(1u64))]);
        let err = check_accumulators_monotone(&before, &BTreeMap::new()).unwrap_err();
        assert_eq!(err.id, InvariantId::AccumulatorMonotone);
        assert!(err.details.starts_with("pool#0"));
        assert!(check_accumulators_monotone(&BTreeMap::new(), &before).is_ok());
    }

    #[test]
    fn violation_converts_into_error() {
        let e: AccrualError = InvariantViolation::new(InvariantId::AccumulatorMonotone, "x").into();
        assert!(matches!(e, AccrualError::Invariant(_)));
    }
}
