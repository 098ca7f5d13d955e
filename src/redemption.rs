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

//! Redemption records.
//!
//! At most one [`RedemptionRecord`] exists per (code, user) pair. Stores must
//! enforce this with a uniqueness constraint: the application-level check
//! before the write is advisory only.

use crate::base::{CurrencyKind, LedgerEntryId, RedemptionId, UserId};
use crate::ledger::EntryStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionRecord {
    pub id: RedemptionId,
    pub code: String,
    pub user: UserId,
    pub ledger_entry_id: LedgerEntryId,
    pub redeemed_at: DateTime<Utc>,
}

impl RedemptionRecord {
    pub fn new(
        id: RedemptionId,
        code: impl Into<String>,
        user: UserId,
        ledger_entry_id: LedgerEntryId,
        redeemed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            code: code.into(),
            user,
            ledger_entry_id,
            redeemed_at,
        }
    }

    /// The uniqueness key of the record.
    pub fn key(&self) -> (String, UserId) {
        (self.code.clone(), self.user.clone())
    }
}

/// Outcome of a successful redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedemptionReceipt {
    pub redemption_id: RedemptionId,
    pub ledger_entry_id: LedgerEntryId,
    pub code: String,
    pub currency: CurrencyKind,
    pub amount: i64,
    pub balance_after: i64,
    pub status: EntryStatus,
}
