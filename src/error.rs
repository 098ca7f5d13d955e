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

//! Error types for balances, codes, persistence and redemption.
//!
//! Domain errors ([`BalanceError`], [`CodeError`] and the domain variants of
//! [`RedemptionError`]) describe an invalid request. [`StoreError`] describes
//! an infrastructure failure and always reaches callers wrapped in
//! [`RedemptionError::Store`] together with the operation that failed.

use crate::ledger::EntryStatus;
use thiserror::Error;

/// A string did not name any variant of a closed enum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Account mutation guards.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Amount exceeds the largest representable grant
    #[error("amount exceeds the maximum allowed")]
    AmountTooLarge,

    /// Result would leave the allowed balance range
    #[error("balance out of range")]
    BalanceOutOfRange,

    /// Consumption exceeds the current balance
    #[error("insufficient balance")]
    InsufficientBalance,
}

/// Redemption code validation and state errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// Code string is empty or uses characters outside `[A-Za-z0-9_-]`
    #[error("invalid code format: {0}")]
    InvalidFormat(String),

    /// `valid_until` precedes `valid_from`
    #[error("validity window ends before it starts")]
    InvalidWindow,

    /// Grant amount is outside `(0, MAX_AMOUNT]`
    #[error(transparent)]
    Amount(#[from] BalanceError),

    /// Code is disabled, expired, outside its window or used up
    #[error("code cannot be redeemed")]
    NotRedeemable,
}

/// Ledger entry construction and status errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error(transparent)]
    Amount(#[from] BalanceError),

    #[error("cannot move ledger entry from {from} to {to}")]
    InvalidStatusTransition { from: EntryStatus, to: EntryStatus },
}

/// Persistence failures reported by repository implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// The persisted account version moved since it was read
    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// The record is still referenced by another record
    #[error("record is referenced: {0}")]
    Referenced(String),

    /// The store could not provide a connection or transaction
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Result type for repository operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the redemption orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedemptionError {
    /// No code with the given natural key exists
    #[error("redemption code not found")]
    CodeNotFound,

    /// Code is expired, disabled, outside its window or used up
    #[error("redemption code cannot be redeemed")]
    CodeNotRedeemable,

    /// The user already redeemed this code
    #[error("user has already redeemed this code")]
    UserAlreadyRedeemed,

    /// A code with the same natural key exists
    #[error("redemption code already exists")]
    CodeAlreadyExists,

    /// Redemptions still reference the code
    #[error("redemption code has redemptions and cannot be deleted")]
    CodeCannotBeDeleted,

    /// Code definition failed validation
    #[error("invalid redemption code: {0}")]
    InvalidCode(String),

    #[error(transparent)]
    Balance(#[from] BalanceError),

    /// Infrastructure failure, wrapped with the operation that hit it
    #[error("{context}: {source}")]
    Store {
        context: &'static str,
        source: StoreError,
    },
}

impl RedemptionError {
    pub fn store(context: &'static str, source: StoreError) -> Self {
        Self::Store { context, source }
    }

    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CodeNotFound => "CODE_NOT_FOUND",
            Self::CodeNotRedeemable => "CODE_NOT_REDEEMABLE",
            Self::UserAlreadyRedeemed => "USER_ALREADY_REDEEMED",
            Self::CodeAlreadyExists => "CODE_ALREADY_EXISTS",
            Self::CodeCannotBeDeleted => "CODE_CANNOT_BE_DELETED",
            Self::InvalidCode(_) => "INVALID_CODE",
            Self::Balance(BalanceError::InvalidAmount) => "INVALID_AMOUNT",
            Self::Balance(BalanceError::AmountTooLarge) => "AMOUNT_TOO_LARGE",
            Self::Balance(BalanceError::BalanceOutOfRange) => "BALANCE_OUT_OF_RANGE",
            Self::Balance(BalanceError::InsufficientBalance) => "INSUFFICIENT_BALANCE",
            Self::Store { .. } => "STORE_FAILURE",
        }
    }

    /// `true` when the request itself is invalid, `false` for infrastructure
    /// failures that may succeed on a later attempt.
    pub fn is_domain(&self) -> bool {
        !matches!(self, Self::Store { .. })
    }
}

impl From<CodeError> for RedemptionError {
    fn from(error: CodeError) -> Self {
        match error {
            CodeError::NotRedeemable => Self::CodeNotRedeemable,
            CodeError::Amount(balance) => Self::Balance(balance),
            invalid @ (CodeError::InvalidFormat(_) | CodeError::InvalidWindow) => {
                Self::InvalidCode(invalid.to_string())
            }
        }
    }
}

impl From<LedgerError> for RedemptionError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Amount(balance) => Self::Balance(balance),
            transition @ LedgerError::InvalidStatusTransition { .. } => {
                Self::store("invalid ledger entry", StoreError::Backend(transition.to_string()))
            }
        }
    }
}

/// Scope acquisition and commit failures.
impl From<StoreError> for RedemptionError {
    fn from(source: StoreError) -> Self {
        Self::store("atomic scope failed", source)
    }
}
