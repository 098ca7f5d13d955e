// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Currency accounts.
//!
//! A [`CurrencyAccount`] holds the balance of one user for one
//! [`CurrencyKind`] together with the optimistic-lock version. Every
//! successful mutation bumps the version by exactly one; a rejected mutation
//! leaves both balance and version untouched.
//!
//! # Example
//!
//! ```
//! use gem_ledger::{CurrencyAccount, CurrencyKind, UserId};
//!
//! let mut account = CurrencyAccount::new(UserId::new("user-1"), CurrencyKind::Paid);
//! account.grant(1_000).unwrap();
//! assert_eq!(account.balance(), 1_000);
//! assert_eq!(account.version(), 1);
//! ```

use crate::base::{CurrencyKind, UserId};
use crate::error::BalanceError;
use serde::Serialize;

/// Largest single amount and largest balance an account may hold.
pub const MAX_AMOUNT: i64 = 10_000_000_000_000;

/// Lowest balance reachable through [`CurrencyAccount::consume_allow_negative`].
pub const MIN_BALANCE: i64 = -MAX_AMOUNT;

/// Rejects amounts outside `(0, MAX_AMOUNT]`.
pub(crate) fn validate_amount(amount: i64) -> Result<(), BalanceError> {
    if amount <= 0 {
        return Err(BalanceError::InvalidAmount);
    }
    if amount > MAX_AMOUNT {
        return Err(BalanceError::AmountTooLarge);
    }
    Ok(())
}

pub(crate) fn validate_balance(balance: i64) -> Result<(), BalanceError> {
    if !(MIN_BALANCE..=MAX_AMOUNT).contains(&balance) {
        return Err(BalanceError::BalanceOutOfRange);
    }
    Ok(())
}

/// Balance of one (owner, currency kind) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrencyAccount {
    owner: UserId,
    currency: CurrencyKind,
    balance: i64,
    version: u64,
}

impl CurrencyAccount {
    /// Creates an empty account at version 0.
    pub fn new(owner: UserId, currency: CurrencyKind) -> Self {
        Self {
            owner,
            currency,
            balance: 0,
            version: 0,
        }
    }

    /// Rebuilds an account from persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`BalanceError::BalanceOutOfRange`] if `balance` lies outside
    /// `[MIN_BALANCE, MAX_AMOUNT]`.
    pub fn restore(
        owner: UserId,
        currency: CurrencyKind,
        balance: i64,
        version: u64,
    ) -> Result<Self, BalanceError> {
        validate_balance(balance)?;
        Ok(Self {
            owner,
            currency,
            balance,
            version,
        })
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn currency(&self) -> CurrencyKind {
        self.currency
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn assert_invariants(&self) {
        debug_assert!(
            (MIN_BALANCE..=MAX_AMOUNT).contains(&self.balance),
            "Invariant violated: balance out of range: {}",
            self.balance
        );
    }

    fn apply(&mut self, balance: i64) {
        self.balance = balance;
        self.version += 1;
        self.assert_invariants();
    }

    /// Increases the balance.
    ///
    /// # Errors
    ///
    /// - [`BalanceError::InvalidAmount`] if `amount <= 0`.
    /// - [`BalanceError::AmountTooLarge`] if `amount > MAX_AMOUNT`.
    /// - [`BalanceError::BalanceOutOfRange`] if the new balance would exceed `MAX_AMOUNT`.
    pub fn grant(&mut self, amount: i64) -> Result<(), BalanceError> {
        validate_amount(amount)?;
        // Written as a subtraction so the check itself cannot overflow.
        if self.balance > MAX_AMOUNT - amount {
            return Err(BalanceError::BalanceOutOfRange);
        }
        self.apply(self.balance + amount);
        Ok(())
    }

    /// Decreases the balance, never below zero.
    ///
    /// # Errors
    ///
    /// Same amount guards as [`grant`](Self::grant), plus
    /// [`BalanceError::InsufficientBalance`] if `balance < amount`.
    pub fn consume(&mut self, amount: i64) -> Result<(), BalanceError> {
        validate_amount(amount)?;
        if self.balance < amount {
            return Err(BalanceError::InsufficientBalance);
        }
        self.apply(self.balance - amount);
        Ok(())
    }

    /// Decreases the balance, allowing it to go negative down to `MIN_BALANCE`.
    ///
    /// # Errors
    ///
    /// Same amount guards as [`grant`](Self::grant), plus
    /// [`BalanceError::BalanceOutOfRange`] if the result would fall below `MIN_BALANCE`.
    pub fn consume_allow_negative(&mut self, amount: i64) -> Result<(), BalanceError> {
        validate_amount(amount)?;
        if self.balance < MIN_BALANCE + amount {
            return Err(BalanceError::BalanceOutOfRange);
        }
        self.apply(self.balance - amount);
        Ok(())
    }
}
