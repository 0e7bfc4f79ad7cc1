//! Token movement collaborator.
//!
//! The ledgers never trust a requested inbound amount: [`transfer_in`] measures the custody
//! balance before and after and credits what actually arrived, so assets that deduct on
//! transfer (taxed tokens) are accounted correctly.

use crate::math::{add_u128, floor_bps, sub_u128, Bps};
use crate::{AccountId, AccrualError, Result, TokenId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Balance debit/credit primitive consumed by the tracker and the multi-pool engine.
pub trait TokenBank {
    fn balance_of(&self, token: TokenId, holder: AccountId) -> Result<u128>;

    /// Moves `amount` from `from` to `to`. All-or-nothing.
    fn transfer(&mut self, token: TokenId, from: AccountId, to: AccountId, amount: u128)
        -> Result<()>;
}

/// Pull `amount` of `token` from `from` into `custody`, returning what custody actually received.
pub fn transfer_in<B: TokenBank + ?Sized>(
    bank: &mut B,
    token: TokenId,
    from: AccountId,
    custody: AccountId,
    amount: u128,
) -> Result<u128> {
    let before = bank.balance_of(token, custody)?;
    bank.transfer(token, from, custody, amount)?;
    let after = bank.balance_of(token, custody)?;
    after
        .checked_sub(before)
        .ok_or_else(|| AccrualError::Bank("custody balance decreased on inbound transfer".into()))
}

/// In-memory balances with optional per-token transfer tax (burned on transfer).
#[derive(Clone, Debug, Default)]
pub struct InMemoryBank {
    balances: HashMap<(TokenId, AccountId), u128>,
    supply: HashMap<TokenId, u128>,
    transfer_tax: HashMap<TokenId, Bps>,
}

impl InMemoryBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&mut self, token: TokenId, to: AccountId, amount: u128) -> Result<()> {
        if to.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        let new_supply = add_u128(self.total_supply(token), amount)?;
        let new_balance = add_u128(self.balance(token, to), amount)?;
        self.supply.insert(token, new_supply);
        self.balances.insert((token, to), new_balance);
        Ok(())
    }

    /// Deduct `bps` of every transfer of `token` (the deduction is burned).
    pub fn set_transfer_tax(&mut self, token: TokenId, bps: Bps) {
        if bps == Bps::ZERO {
            self.transfer_tax.remove(&token);
        } else {
            self.transfer_tax.insert(token, bps);
        }
    }

    pub fn total_supply(&self, token: TokenId) -> u128 {
        self.supply.get(&token).copied().unwrap_or(0)
    }

    fn balance(&self, token: TokenId, holder: AccountId) -> u128 {
        self.balances.get(&(token, holder)).copied().unwrap_or(0)
    }
}

impl TokenBank for InMemoryBank {
    fn balance_of(&self, token: TokenId, holder: AccountId) -> Result<u128> {
        Ok(self.balance(token, holder))
    }

    fn transfer(
        &mut self,
        token: TokenId,
        from: AccountId,
        to: AccountId,
        amount: u128,
    ) -> Result<()> {
        if from.is_zero() || to.is_zero() {
            return Err(AccrualError::ZeroAddress);
        }
        if amount == 0 {
            return Ok(());
        }
        let available = self.balance(token, from);
        if available < amount {
            return Err(AccrualError::InsufficientBalance {
                token,
                holder: from,
                requested: amount,
                available,
            });
        }
        let tax = match self.transfer_tax.get(&token) {
            Some(bps) => floor_bps(amount, *bps)?,
            None => 0,
        };
        let credited = sub_u128(amount, tax)?;

        // Commit: debit first so a self-transfer nets correctly.
        self.balances.insert((token, from), available - amount);
        let to_balance = add_u128(self.balance(token, to), credited)?;
        self.balances.insert((token, to), to_balance);
        if tax > 0 {
            let supply = sub_u128(self.total_supply(token), tax)?;
            self.supply.insert(token, supply);
        }
        Ok(())
    }
}

/// Cloneable handle to one [`InMemoryBank`] shared by several ledgers and a harness.
#[derive(Clone, Debug, Default)]
pub struct SharedBank {
    inner: Arc<RwLock<InMemoryBank>>,
}

impl SharedBank {
    pub fn new(bank: InMemoryBank) -> Self {
        Self {
            inner: Arc::new(RwLock::new(bank)),
        }
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, InMemoryBank>> {
        self.inner
            .read()
            .map_err(|_| AccrualError::Bank("shared bank lock poisoned".into()))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, InMemoryBank>> {
        self.inner
            .write()
            .map_err(|_| AccrualError::Bank("shared bank lock poisoned".into()))
    }

    pub fn mint(&self, token: TokenId, to: AccountId, amount: u128) -> Result<()> {
        self.write()?.mint(token, to, amount)
    }
}

impl TokenBank for SharedBank {
    fn balance_of(&self, token: TokenId, holder: AccountId) -> Result<u128> {
        self.read()?.balance_of(token, holder)
    }

    fn transfer(
        &mut self,
        token: TokenId,
        from: AccountId,
        to: AccountId,
        amount: u128,
    ) -> Result<()> {
        self.write()?.transfer(token, from, to, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t() -> TokenId {
        TokenId::derive("stake")
    }

    #[test]
    fn transfer_moves_balance() {
        let (a, b) = (AccountId::derive("a"), AccountId::derive("b"));
        let mut bank = InMemoryBank::new();
        bank.mint(t(), a, 100).unwrap();
        bank.transfer(t(), a, b, 40).unwrap();
        assert_eq!(bank.balance_of(t(), a).unwrap(), 60);
        assert_eq!(bank.balance_of(t(), b).unwrap(), 40);
    }

    #[test]
    fn overdraft_is_rejected_without_effect() {
        let (a, b) = (AccountId::derive("a"), AccountId::derive("b"));
        let mut bank = InMemoryBank::new();
        bank.mint(t(), a, 10).unwrap();
        let err = bank.transfer(t(), a, b, 11).unwrap_err();
        assert!(matches!(err, AccrualError::InsufficientBalance { available: 10, .. }));
        assert_eq!(bank.balance_of(t(), a).unwrap(), 10);
    }

    #[test]
    fn transfer_in_reports_amount_after_tax() {
        let (a, custody) = (AccountId::derive("a"), AccountId::derive("custody"));
        let mut bank = InMemoryBank::new();
        bank.mint(t(), a, 1_000).unwrap();
        bank.set_transfer_tax(t(), Bps::new(200).unwrap());
        let got = transfer_in(&mut bank, t(), a, custody, 1_000).unwrap();
        assert_eq!(got, 980);
        assert_eq!(bank.total_supply(t()), 980);
    }

    #[test]
    fn shared_bank_handles_see_the_same_balances() {
        let a = AccountId::derive("a");
        let shared = SharedBank::default();
        let other = shared.clone();
        shared.mint(t(), a, 5).unwrap();
        assert_eq!(other.balance_of(t(), a).unwrap(), 5);
    }
}
