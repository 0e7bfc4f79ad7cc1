//! Entry gates: the non-blocking re-entrancy flag and the trusted-handler allowlist.

use crate::{AccountId, AccrualError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-instance "operation in progress" flag. Entering while set fails fast.
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    busy: Arc<AtomicBool>,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag for the duration of the returned token.
    pub fn enter(&self) -> Result<GuardToken> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AccrualError::Reentrancy)?;
        Ok(GuardToken {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_entered(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the guard on drop, including on early `?` returns.
#[must_use = "the guard is released as soon as the token is dropped"]
#[derive(Debug)]
pub struct GuardToken {
    busy: Arc<AtomicBool>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Accounts allowed to act on behalf of others (`*_for_account`) and to bypass private modes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSet {
    handlers: BTreeSet<AccountId>,
}

impl HandlerSet {
    pub fn set(&mut self, account: AccountId, active: bool) {
        if active {
            self.handlers.insert(account);
        } else {
            self.handlers.remove(&account);
        }
    }

    pub fn contains(&self, account: &AccountId) -> bool {
        self.handlers.contains(account)
    }

    pub fn authorize(&self, caller: AccountId) -> Result<()> {
        if self.contains(&caller) {
            Ok(())
        } else {
            Err(AccrualError::InvalidHandler(caller))
        }
    }

    /// Gate that only applies when `private_mode` is on.
    pub fn authorize_if(&self, private_mode: bool, caller: AccountId) -> Result<()> {
        if private_mode {
            self.authorize(caller)
        } else {
            Ok(())
        }
    }
}
