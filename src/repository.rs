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

//! Persistence contracts.
//!
//! The engine never talks to a database directly. It needs the capabilities
//! below, implemented by a transactional store:
//!
//! - [`AccountRepository`] - versioned currency accounts
//! - [`LedgerRepository`] - append-only ledger entries
//! - [`CodeRepository`] - redemption codes and the redemption fence
//! - [`AtomicScope`] - opens a [`UnitOfWork`] that commits all of its writes
//!   or none of them
//!
//! Implementations:
//! - [`MemoryStore`](crate::MemoryStore) - in-process store for tests, tools and development

use crate::account::CurrencyAccount;
use crate::base::{CurrencyKind, LedgerEntryId, UserId};
use crate::code::RedemptionCode;
use crate::error::StoreResult;
use crate::ledger::LedgerEntry;
use crate::redemption::RedemptionRecord;
use async_trait::async_trait;

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Get the account of `owner` for `currency`, `None` if it was never created.
    async fn find_account(
        &self,
        owner: &UserId,
        currency: CurrencyKind,
    ) -> StoreResult<Option<CurrencyAccount>>;

    /// Insert a new account. Fails with `Duplicate` if the pair exists.
    async fn create_account(&self, account: &CurrencyAccount) -> StoreResult<()>;

    /// Overwrite an account if its persisted version is still `expected_version`.
    ///
    /// Fails with `VersionConflict` when another writer got there first and
    /// with `NotFound` when the account does not exist.
    async fn save_account(
        &self,
        account: &CurrencyAccount,
        expected_version: u64,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Append an entry. Fails with `Duplicate` on an id collision.
    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn find_entry(&self, id: &LedgerEntryId) -> StoreResult<Option<LedgerEntry>>;

    /// Entries of `owner`, newest first.
    async fn find_entries_by_owner(
        &self,
        owner: &UserId,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<LedgerEntry>>;

    async fn find_entry_by_external_ref(
        &self,
        external_ref: &str,
    ) -> StoreResult<Option<LedgerEntry>>;
}

#[async_trait]
pub trait CodeRepository: Send + Sync {
    async fn find_code(&self, code: &str) -> StoreResult<Option<RedemptionCode>>;

    /// Overwrite an existing code. Fails with `NotFound` if it does not exist.
    async fn update_code(&self, code: &RedemptionCode) -> StoreResult<()>;

    /// Insert a new code. Fails with `Duplicate` if the natural key exists.
    async fn create_code(&self, code: &RedemptionCode) -> StoreResult<()>;

    /// Remove a code. Fails with `Referenced` while any redemption points at it.
    async fn delete_code(&self, code: &str) -> StoreResult<()>;

    /// One page of codes, newest first, with the total number of codes.
    async fn list_codes(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<(Vec<RedemptionCode>, usize)>;

    async fn has_user_redeemed(&self, code: &str, user: &UserId) -> StoreResult<bool>;

    /// Insert a redemption record. Fails with `Duplicate` if the user already
    /// has a record for the code.
    async fn save_redemption(&self, record: &RedemptionRecord) -> StoreResult<()>;
}

/// Repositories bound to one open transaction.
///
/// Reads observe the transaction's own writes. Nothing becomes visible to
/// other readers before [`commit`](UnitOfWork::commit). Dropping a unit of
/// work without committing it rolls it back.
#[async_trait]
pub trait UnitOfWork: AccountRepository + LedgerRepository + CodeRepository + Send + Sync {
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Source of units of work.
#[async_trait]
pub trait AtomicScope: Send + Sync {
    /// Open a transaction. Fails with `Unavailable` when none can be acquired.
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>>;
}
