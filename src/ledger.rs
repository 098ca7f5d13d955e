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

//! Ledger entries.
//!
//! Every balance change is recorded as an append-only [`LedgerEntry`]. Only
//! the status may change after the entry is written, following:
//! - [`Pending`](EntryStatus::Pending) → [`Completed`](EntryStatus::Completed),
//!   [`Failed`](EntryStatus::Failed) or [`Cancelled`](EntryStatus::Cancelled)

use crate::account::{validate_amount, validate_balance};
use crate::base::{CurrencyKind, LedgerEntryId, UserId};
use crate::error::{LedgerError, ParseEnumError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque key-value data attached to entries and codes.
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Grant,
    Consume,
    Refund,
    Expire,
    Compensate,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Consume => "consume",
            Self::Refund => "refund",
            Self::Expire => "expire",
            Self::Compensate => "compensate",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "grant" => Ok(Self::Grant),
            "consume" => Ok(Self::Consume),
            "refund" => Ok(Self::Refund),
            "expire" => Ok(Self::Expire),
            "compensate" => Ok(Self::Compensate),
            _ => Err(ParseEnumError::new("entry kind", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, to: EntryStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Completed | Self::Failed | Self::Cancelled)
        )
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseEnumError::new("entry status", s)),
        }
    }
}

/// The balance movement a ledger entry records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    pub owner: UserId,
    pub kind: EntryKind,
    pub currency: CurrencyKind,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
}

/// Immutable record of one balance change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    id: LedgerEntryId,
    owner: UserId,
    kind: EntryKind,
    currency: CurrencyKind,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    status: EntryStatus,
    external_ref: Option<String>,
    requester: Option<String>,
    metadata: Metadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Records a balance change as a pending entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Amount`] if the amount lies outside
    /// `(0, MAX_AMOUNT]` or either balance lies outside the account range.
    pub fn record(
        id: LedgerEntryId,
        change: BalanceChange,
        now: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        validate_amount(change.amount)?;
        validate_balance(change.balance_before)?;
        validate_balance(change.balance_after)?;

        Ok(Self {
            id,
            owner: change.owner,
            kind: change.kind,
            currency: change.currency,
            amount: change.amount,
            balance_before: change.balance_before,
            balance_after: change.balance_after,
            status: EntryStatus::Pending,
            external_ref: None,
            requester: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_external_ref(mut self, external_ref: impl Into<String>) -> Self {
        self.external_ref = Some(external_ref.into());
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Moves the entry to a new status.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidStatusTransition`] unless the entry is
    /// pending and `status` is terminal.
    pub fn update_status(&mut self, status: EntryStatus, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if !self.status.can_transition_to(status) {
            return Err(LedgerError::InvalidStatusTransition {
                from: self.status,
                to: status,
            });
        }
        self.status = status;
        self.updated_at = now;
        Ok(())
    }

    pub fn id(&self) -> &LedgerEntryId {
        &self.id
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn currency(&self) -> CurrencyKind {
        self.currency
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn balance_before(&self) -> i64 {
        self.balance_before
    }

    pub fn balance_after(&self) -> i64 {
        self.balance_after
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn external_ref(&self) -> Option<&str> {
        self.external_ref.as_deref()
    }

    pub fn requester(&self) -> Option<&str> {
        self.requester.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
