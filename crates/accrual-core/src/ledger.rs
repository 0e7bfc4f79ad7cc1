//! Stake ledger: who owns how much stake, per deposit asset, plus the 1:1 share balances.
//!
//! Bookkeeping only. Token movement and settlement ordering belong to the tracker; every
//! mutator here checks all arithmetic first and then commits, so an `Err` leaves the ledger
//! untouched.

use crate::math::{add_u128, sub_u128};
use crate::settlement::StakeSupply;
use crate::{AccountId, AccrualError, Result, TokenId};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StakeLedger {
    staked: BTreeMap<AccountId, u128>,
    deposits: BTreeMap<(AccountId, TokenId), u128>,
    deposit_supply: BTreeMap<TokenId, u128>,
    accepted: BTreeSet<TokenId>,
    shares: BTreeMap<AccountId, u128>,
    total_staked: u128,
    total_shares: u128,
}

impl StakeLedger {
    pub fn new(accepted: impl IntoIterator<Item = TokenId>) -> Self {
        Self {
            accepted: accepted.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn set_accepted(&mut self, token: TokenId, accepted: bool) {
        if accepted {
            self.accepted.insert(token);
        } else {
            self.accepted.remove(&token);
        }
    }

    pub fn is_accepted(&self, token: &TokenId) -> bool {
        self.accepted.contains(token)
    }

    pub fn ensure_accepted(&self, token: TokenId) -> Result<()> {
        if self.is_accepted(&token) {
            Ok(())
        } else {
            Err(AccrualError::InvalidAsset(token))
        }
    }

    pub fn staked_amount(&self, account: &AccountId) -> u128 {
        self.staked.get(account).copied().unwrap_or(0)
    }

    pub fn deposit_balance(&self, account: &AccountId, asset: &TokenId) -> u128 {
        self.deposits.get(&(*account, *asset)).copied().unwrap_or(0)
    }

    pub fn total_deposit_supply(&self, asset: &TokenId) -> u128 {
        self.deposit_supply.get(asset).copied().unwrap_or(0)
    }

    pub fn share_balance(&self, account: &AccountId) -> u128 {
        self.shares.get(account).copied().unwrap_or(0)
    }

    pub fn total_shares(&self) -> u128 {
        self.total_shares
    }

    pub fn total_staked(&self) -> u128 {
        self.total_staked
    }

    pub fn staked_accounts(&self) -> impl Iterator<Item = (&AccountId, &u128)> {
        self.staked.iter()
    }

    pub fn share_holders(&self) -> impl Iterator<Item = (&AccountId, &u128)> {
        self.shares.iter()
    }

    pub fn deposit_entries(&self) -> impl Iterator<Item = (&(AccountId, TokenId), &u128)> {
        self.deposits.iter()
    }

    pub fn accepted_assets(&self) -> impl Iterator<Item = &TokenId> {
        self.accepted.iter()
    }

    /// Credit `amount` of `asset` to `account` and mint the same number of shares.
    pub fn credit(&mut self, account: AccountId, asset: TokenId, amount: u128) -> Result<()> {
        let staked = add_u128(self.staked_amount(&account), amount)?;
        let total_staked = add_u128(self.total_staked, amount)?;
        let deposit = add_u128(self.deposit_balance(&account, &asset), amount)?;
        let deposit_supply = add_u128(self.total_deposit_supply(&asset), amount)?;
        let shares = add_u128(self.share_balance(&account), amount)?;
        let total_shares = add_u128(self.total_shares, amount)?;

        self.staked.insert(account, staked);
        self.total_staked = total_staked;
        self.deposits.insert((account, asset), deposit);
        self.deposit_supply.insert(asset, deposit_supply);
        self.shares.insert(account, shares);
        self.total_shares = total_shares;
        Ok(())
    }

    /// Validate a credit without applying it.
    pub fn check_credit(&self, account: &AccountId, asset: &TokenId, amount: u128) -> Result<()> {
        for held in [
            self.staked_amount(account),
            self.total_staked,
            self.deposit_balance(account, asset),
            self.total_deposit_supply(asset),
            self.share_balance(account),
            self.total_shares,
        ] {
            add_u128(held, amount)?;
        }
        Ok(())
    }

    /// Validate a debit without applying it.
    pub fn check_debit(&self, account: &AccountId, asset: &TokenId, amount: u128) -> Result<()> {
        for available in [
            self.staked_amount(account),
            self.deposit_balance(account, asset),
            self.share_balance(account),
        ] {
            if amount > available {
                return Err(AccrualError::InvalidAmount {
                    requested: amount,
                    available,
                });
            }
        }
        Ok(())
    }

    /// Debit stake and burn the matching shares.
    pub fn debit(&mut self, account: AccountId, asset: TokenId, amount: u128) -> Result<()> {
        self.check_debit(&account, &asset, amount)?;
        let staked = sub_u128(self.staked_amount(&account), amount)?;
        let total_staked = sub_u128(self.total_staked, amount)?;
        let deposit = sub_u128(self.deposit_balance(&account, &asset), amount)?;
        let deposit_supply = sub_u128(self.total_deposit_supply(&asset), amount)?;
        let shares = sub_u128(self.share_balance(&account), amount)?;
        let total_shares = sub_u128(self.total_shares, amount)?;

        // Zero entries are kept: an unstaked account is still a known participant.
        self.staked.insert(account, staked);
        self.total_staked = total_staked;
        self.deposits.insert((account, asset), deposit);
        self.deposit_supply.insert(asset, deposit_supply);
        self.shares.insert(account, shares);
        self.total_shares = total_shares;
        Ok(())
    }

    /// Move share balance only; staked amounts stay with the original staker.
    pub fn move_shares(&mut self, from: AccountId, to: AccountId, amount: u128) -> Result<()> {
        let available = self.share_balance(&from);
        if amount > available {
            return Err(AccrualError::InvalidAmount {
                requested: amount,
                available,
            });
        }
        if from == to {
            return Ok(());
        }
        let to_balance = add_u128(self.share_balance(&to), amount)?;
        self.shares.insert(from, available - amount);
        self.shares.insert(to, to_balance);
        Ok(())
    }
}

impl StakeSupply for StakeLedger {
    fn share_supply(&self) -> u128 {
        self.total_staked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gmx() -> TokenId {
        TokenId::derive("gmx")
    }

    fn esgmx() -> TokenId {
        TokenId::derive("esgmx")
    }

    #[test]
    fn credit_and_debit_keep_totals() {
        let a = AccountId::derive("a");
        let mut ledger = StakeLedger::new([gmx(), esgmx()]);
        ledger.credit(a, gmx(), 70).unwrap();
        ledger.credit(a, esgmx(), 30).unwrap();
        assert_eq!(ledger.staked_amount(&a), 100);
        assert_eq!(ledger.total_staked(), 100);
        assert_eq!(ledger.total_shares(), 100);

        ledger.debit(a, gmx(), 70).unwrap();
        assert_eq!(ledger.staked_amount(&a), 30);
        assert_eq!(ledger.deposit_balance(&a, &gmx()), 0);
        assert_eq!(ledger.total_deposit_supply(&esgmx()), 30);
    }

    #[test]
    fn debit_is_bounded_by_the_specific_asset() {
        let a = AccountId::derive("a");
        let mut ledger = StakeLedger::new([gmx(), esgmx()]);
        ledger.credit(a, gmx(), 70).unwrap();
        ledger.credit(a, esgmx(), 30).unwrap();
        let before = ledger.clone();
        let err = ledger.debit(a, esgmx(), 31).unwrap_err();
        assert_eq!(
            err,
            AccrualError::InvalidAmount {
                requested: 31,
                available: 30
            }
        );
        assert_eq!(ledger, before);
    }

    #[test]
    fn moved_shares_block_unstake_of_sender() {
        let (a, b) = (AccountId::derive("a"), AccountId::derive("b"));
        let mut ledger = StakeLedger::new([gmx()]);
        ledger.credit(a, gmx(), 50).unwrap();
        ledger.move_shares(a, b, 20).unwrap();
        assert_eq!(ledger.staked_amount(&a), 50);
        assert_eq!(ledger.share_balance(&b), 20);
        assert!(ledger.check_debit(&a, &gmx(), 50).is_err());
        assert!(ledger.check_debit(&a, &gmx(), 30).is_ok());
    }

    #[test]
    fn unaccepted_asset_rejected() {
        let ledger = StakeLedger::new([gmx()]);
        assert_eq!(
            ledger.ensure_accepted(esgmx()).unwrap_err(),
            AccrualError::InvalidAsset(esgmx())
        );
    }
}
