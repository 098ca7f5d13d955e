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

//! In-memory transactional store.
//!
//! [`MemoryStore`] implements every repository contract plus [`AtomicScope`].
//! Data is lost when the process exits.
//!
//! # Transactions
//!
//! A [`MemoryTransaction`] stages its writes privately and sees them in its
//! own reads. On commit the staged writes are validated against the
//! committed tables (account versions, uniqueness, references) and applied
//! under a single write lock, so readers observe either none or all of them.
//!
//! Transactions opened through [`AtomicScope::begin`] hold the store's writer
//! slot until they finish. Repository writes made directly on the store run as
//! one-statement transactions: they wait for the same slot and commit
//! immediately. A direct write therefore never lands between a transaction's
//! staged write and its commit; it sees the committed result and fails with
//! [`StoreError::VersionConflict`] if its expected version is stale. Direct
//! reads never wait.
//!
//! Issuing a direct write on a store while the same task holds an open
//! transaction on it waits forever, or until the acquire timeout when one is
//! set.
//!
//! # Lock ordering
//!
//! `changes` is always locked before `tables`, and neither is held across an
//! `.await`.

use crate::account::CurrencyAccount;
use crate::base::{CurrencyKind, LedgerEntryId, UserId};
use crate::code::RedemptionCode;
use crate::error::{StoreError, StoreResult};
use crate::ledger::LedgerEntry;
use crate::redemption::RedemptionRecord;
use crate::repository::{
    AccountRepository, AtomicScope, CodeRepository, LedgerRepository, UnitOfWork,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

type AccountKey = (UserId, CurrencyKind);
type RedemptionKey = (String, UserId);

/// Committed state.
#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<AccountKey, CurrencyAccount>,
    /// Append order.
    entries: Vec<LedgerEntry>,
    entry_ids: HashSet<LedgerEntryId>,
    codes: HashMap<String, RedemptionCode>,
    redemptions: HashMap<RedemptionKey, RedemptionRecord>,
}

#[derive(Debug)]
struct StagedAccount {
    account: CurrencyAccount,
    /// Committed version the write was based on, `None` for a new account.
    basis: Option<u64>,
}

#[derive(Debug)]
enum CodeWrite {
    Create(RedemptionCode),
    Update(RedemptionCode),
    Delete,
}

/// Writes staged by one transaction.
#[derive(Debug, Default)]
struct Changes {
    accounts: HashMap<AccountKey, StagedAccount>,
    codes: HashMap<String, CodeWrite>,
    entries: Vec<LedgerEntry>,
    redemptions: HashMap<RedemptionKey, RedemptionRecord>,
}

impl Changes {
    fn len(&self) -> usize {
        self.accounts.len() + self.codes.len() + self.entries.len() + self.redemptions.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(&self, tables: &Tables) -> StoreResult<()> {
        for (key, staged) in &self.accounts {
            let committed = tables.accounts.get(key);
            match (staged.basis, committed) {
                (None, Some(_)) => {
                    return Err(StoreError::Duplicate(format!("account {}/{}", key.0, key.1)));
                }
                (Some(_), None) => {
                    return Err(StoreError::NotFound(format!("account {}/{}", key.0, key.1)));
                }
                (Some(expected), Some(current)) if current.version() != expected => {
                    return Err(StoreError::VersionConflict {
                        expected,
                        actual: current.version(),
                    });
                }
                _ => {}
            }
        }

        for (code, write) in &self.codes {
            let exists = tables.codes.contains_key(code);
            match write {
                CodeWrite::Create(_) if exists => {
                    return Err(StoreError::Duplicate(format!("code {code}")));
                }
                CodeWrite::Update(_) | CodeWrite::Delete if !exists => {
                    return Err(StoreError::NotFound(format!("code {code}")));
                }
                CodeWrite::Delete if tables.redemptions.keys().any(|(c, _)| c == code) => {
                    return Err(StoreError::Referenced(format!("code {code}")));
                }
                _ => {}
            }
        }

        if let Some(entry) = self.entries.iter().find(|e| tables.entry_ids.contains(e.id())) {
            return Err(StoreError::Duplicate(format!("ledger entry {}", entry.id())));
        }

        if let Some((code, user)) = self.redemptions.keys().find(|k| tables.redemptions.contains_key(*k)) {
            return Err(StoreError::Duplicate(format!("redemption of {code} by {user}")));
        }

        Ok(())
    }

    fn apply_to(self, tables: &mut Tables) {
        for (key, staged) in self.accounts {
            tables.accounts.insert(key, staged.account);
        }
        for (code, write) in self.codes {
            match write {
                CodeWrite::Create(value) | CodeWrite::Update(value) => {
                    tables.codes.insert(code, value);
                }
                CodeWrite::Delete => {
                    tables.codes.remove(&code);
                }
            }
        }
        for entry in self.entries {
            tables.entry_ids.insert(entry.id().clone());
            tables.entries.push(entry);
        }
        tables.redemptions.extend(self.redemptions);
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

/// Thread-safe in-memory store. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    acquire_timeout: Option<Duration>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes [`AtomicScope::begin`] fail with [`StoreError::Unavailable`]
    /// when the writer slot is not free within `timeout`.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Snapshot of all accounts ordered by owner, then currency.
    pub fn accounts(&self) -> Vec<CurrencyAccount> {
        let tables = self.shared.tables.read();
        let mut accounts: Vec<_> = tables.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| (a.owner(), a.currency()).cmp(&(b.owner(), b.currency())));
        accounts
    }

    /// Snapshot of the ledger in append order.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.shared.tables.read().entries.clone()
    }

    /// Snapshot of all redemption records, unordered.
    pub fn redemptions(&self) -> Vec<RedemptionRecord> {
        self.shared.tables.read().redemptions.values().cloned().collect()
    }

    fn detached(&self) -> MemoryTransaction {
        MemoryTransaction::new(Arc::clone(&self.shared), None)
    }

    /// Waits for the writer slot, bounded by the acquire timeout.
    async fn acquire_writer(&self) -> StoreResult<OwnedMutexGuard<()>> {
        let slot = Arc::clone(&self.shared.writer).lock_owned();
        match self.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, slot).await.map_err(|_| {
                StoreError::Unavailable(format!("no transaction slot free within {timeout:?}"))
            }),
            None => Ok(slot.await),
        }
    }

    /// Runs one write as its own transaction.
    async fn autocommit(
        &self,
        write: impl FnOnce(&MemoryTransaction) -> StoreResult<()> + Send,
    ) -> StoreResult<()> {
        let writer = self.acquire_writer().await?;
        let transaction = MemoryTransaction::new(Arc::clone(&self.shared), Some(writer));
        write(&transaction)?;
        transaction.apply()
    }
}

/// One open transaction on a [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    changes: Mutex<Changes>,
    _writer: Option<OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    fn new(shared: Arc<Shared>, writer: Option<OwnedMutexGuard<()>>) -> Self {
        Self {
            shared,
            changes: Mutex::new(Changes::default()),
            _writer: writer,
        }
    }

    /// Validates and applies staged writes, leaving the transaction empty.
    fn apply(&self) -> StoreResult<()> {
        let changes = std::mem::take(&mut *self.changes.lock());
        if changes.is_empty() {
            return Ok(());
        }
        let mut tables = self.shared.tables.write();
        changes.validate(&tables)?;
        changes.apply_to(&mut tables);
        Ok(())
    }

    fn account(&self, key: &AccountKey) -> Option<CurrencyAccount> {
        let changes = self.changes.lock();
        if let Some(staged) = changes.accounts.get(key) {
            return Some(staged.account.clone());
        }
        self.shared.tables.read().accounts.get(key).cloned()
    }

    fn stage_account_create(&self, account: &CurrencyAccount) -> StoreResult<()> {
        let key = (account.owner().clone(), account.currency());
        let mut changes = self.changes.lock();
        let exists = changes.accounts.contains_key(&key)
            || self.shared.tables.read().accounts.contains_key(&key);
        if exists {
            return Err(StoreError::Duplicate(format!("account {}/{}", key.0, key.1)));
        }
        changes.accounts.insert(
            key,
            StagedAccount {
                account: account.clone(),
                basis: None,
            },
        );
        Ok(())
    }

    fn stage_account_save(&self, account: &CurrencyAccount, expected_version: u64) -> StoreResult<()> {
        let key = (account.owner().clone(), account.currency());
        let mut changes = self.changes.lock();
        let (current, basis) = match changes.accounts.get(&key) {
            Some(staged) => (staged.account.version(), staged.basis),
            None => {
                let tables = self.shared.tables.read();
                let committed = tables
                    .accounts
                    .get(&key)
                    .ok_or_else(|| StoreError::NotFound(format!("account {}/{}", key.0, key.1)))?;
                (committed.version(), Some(committed.version()))
            }
        };
        if current != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: current,
            });
        }
        changes.accounts.insert(
            key,
            StagedAccount {
                account: account.clone(),
                basis,
            },
        );
        Ok(())
    }

    fn stage_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        let mut changes = self.changes.lock();
        let exists = changes.entries.iter().any(|e| e.id() == entry.id())
            || self.shared.tables.read().entry_ids.contains(entry.id());
        if exists {
            return Err(StoreError::Duplicate(format!("ledger entry {}", entry.id())));
        }
        changes.entries.push(entry.clone());
        Ok(())
    }

    /// Committed entries followed by staged ones, oldest first.
    fn visible_entries(&self) -> Vec<LedgerEntry> {
        let changes = self.changes.lock();
        let tables = self.shared.tables.read();
        tables
            .entries
            .iter()
            .chain(changes.entries.iter())
            .cloned()
            .collect()
    }

    fn code(&self, code: &str) -> Option<RedemptionCode> {
        let changes = self.changes.lock();
        match changes.codes.get(code) {
            Some(CodeWrite::Create(value) | CodeWrite::Update(value)) => Some(value.clone()),
            Some(CodeWrite::Delete) => None,
            None => self.shared.tables.read().codes.get(code).cloned(),
        }
    }

    fn stage_code_create(&self, code: &RedemptionCode) -> StoreResult<()> {
        let key = code.code().to_string();
        let exists = self.code(&key).is_some();
        if exists {
            return Err(StoreError::Duplicate(format!("code {key}")));
        }
        let mut changes = self.changes.lock();
        // Re-creating a code deleted in this transaction overwrites the committed row.
        let write = match changes.codes.get(&key) {
            Some(CodeWrite::Delete) => CodeWrite::Update(code.clone()),
            _ => CodeWrite::Create(code.clone()),
        };
        changes.codes.insert(key, write);
        Ok(())
    }

    fn stage_code_update(&self, code: &RedemptionCode) -> StoreResult<()> {
        let key = code.code().to_string();
        if self.code(&key).is_none() {
            return Err(StoreError::NotFound(format!("code {key}")));
        }
        let mut changes = self.changes.lock();
        let write = match changes.codes.get(&key) {
            Some(CodeWrite::Create(_)) => CodeWrite::Create(code.clone()),
            _ => CodeWrite::Update(code.clone()),
        };
        changes.codes.insert(key, write);
        Ok(())
    }

    fn stage_code_delete(&self, code: &str) -> StoreResult<()> {
        if self.code(code).is_none() {
            return Err(StoreError::NotFound(format!("code {code}")));
        }
        let mut changes = self.changes.lock();
        let referenced = changes.redemptions.keys().any(|(c, _)| c == code)
            || self
                .shared
                .tables
                .read()
                .redemptions
                .keys()
                .any(|(c, _)| c == code);
        if referenced {
            return Err(StoreError::Referenced(format!("code {code}")));
        }
        match changes.codes.get(code) {
            Some(CodeWrite::Create(_)) => {
                changes.codes.remove(code);
            }
            _ => {
                changes.codes.insert(code.to_string(), CodeWrite::Delete);
            }
        }
        Ok(())
    }

    /// All visible codes, newest first.
    fn visible_codes(&self) -> Vec<RedemptionCode> {
        let changes = self.changes.lock();
        let mut codes = self.shared.tables.read().codes.clone();
        for (key, write) in &changes.codes {
            match write {
                CodeWrite::Create(value) | CodeWrite::Update(value) => {
                    codes.insert(key.clone(), value.clone());
                }
                CodeWrite::Delete => {
                    codes.remove(key);
                }
            }
        }
        let mut codes: Vec<_> = codes.into_values().collect();
        codes.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| a.code().cmp(b.code()))
        });
        codes
    }

    fn redeemed(&self, key: &RedemptionKey) -> bool {
        let changes = self.changes.lock();
        changes.redemptions.contains_key(key)
            || self.shared.tables.read().redemptions.contains_key(key)
    }

    fn stage_redemption(&self, record: &RedemptionRecord) -> StoreResult<()> {
        let key = record.key();
        if self.redeemed(&key) {
            return Err(StoreError::Duplicate(format!(
                "redemption of {} by {}",
                key.0, key.1
            )));
        }
        self.changes.lock().redemptions.insert(key, record.clone());
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let pending = self.changes.get_mut().len();
        if pending > 0 {
            debug!(pending, "rolling back unfinished transaction");
        }
    }
}

#[async_trait]
impl AccountRepository for MemoryTransaction {
    async fn find_account(
        &self,
        owner: &UserId,
        currency: CurrencyKind,
    ) -> StoreResult<Option<CurrencyAccount>> {
        Ok(self.account(&(owner.clone(), currency)))
    }

    async fn create_account(&self, account: &CurrencyAccount) -> StoreResult<()> {
        self.stage_account_create(account)
    }

    async fn save_account(
        &self,
        account: &CurrencyAccount,
        expected_version: u64,
    ) -> StoreResult<()> {
        self.stage_account_save(account, expected_version)
    }
}

#[async_trait]
impl LedgerRepository for MemoryTransaction {
    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        self.stage_entry(entry)
    }

    async fn find_entry(&self, id: &LedgerEntryId) -> StoreResult<Option<LedgerEntry>> {
        Ok(self.visible_entries().into_iter().find(|e| e.id() == id))
    }

    async fn find_entries_by_owner(
        &self,
        owner: &UserId,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<LedgerEntry>> {
        Ok(self
            .visible_entries()
            .into_iter()
            .rev()
            .filter(|e| e.owner() == owner)
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn find_entry_by_external_ref(
        &self,
        external_ref: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        Ok(self
            .visible_entries()
            .into_iter()
            .find(|e| e.external_ref() == Some(external_ref)))
    }
}

#[async_trait]
impl CodeRepository for MemoryTransaction {
    async fn find_code(&self, code: &str) -> StoreResult<Option<RedemptionCode>> {
        Ok(self.code(code))
    }

    async fn update_code(&self, code: &RedemptionCode) -> StoreResult<()> {
        self.stage_code_update(code)
    }

    async fn create_code(&self, code: &RedemptionCode) -> StoreResult<()> {
        self.stage_code_create(code)
    }

    async fn delete_code(&self, code: &str) -> StoreResult<()> {
        self.stage_code_delete(code)
    }

    async fn list_codes(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<(Vec<RedemptionCode>, usize)> {
        let codes = self.visible_codes();
        let total = codes.len();
        Ok((codes.into_iter().skip(offset).take(limit).collect(), total))
    }

    async fn has_user_redeemed(&self, code: &str, user: &UserId) -> StoreResult<bool> {
        Ok(self.redeemed(&(code.to_string(), user.clone())))
    }

    async fn save_redemption(&self, record: &RedemptionRecord) -> StoreResult<()> {
        self.stage_redemption(record)
    }
}

#[async_trait]
impl UnitOfWork for MemoryTransaction {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.apply()
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let discarded = std::mem::take(&mut *self.changes.lock());
        debug!(discarded = discarded.len(), "transaction rolled back");
        Ok(())
    }
}

#[async_trait]
impl AtomicScope for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let writer = self.acquire_writer().await?;
        Ok(Box::new(MemoryTransaction::new(
            Arc::clone(&self.shared),
            Some(writer),
        )))
    }
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn find_account(
        &self,
        owner: &UserId,
        currency: CurrencyKind,
    ) -> StoreResult<Option<CurrencyAccount>> {
        Ok(self.detached().account(&(owner.clone(), currency)))
    }

    async fn create_account(&self, account: &CurrencyAccount) -> StoreResult<()> {
        self.autocommit(|tx| tx.stage_account_create(account)).await
    }

    async fn save_account(
        &self,
        account: &CurrencyAccount,
        expected_version: u64,
    ) -> StoreResult<()> {
        self.autocommit(|tx| tx.stage_account_save(account, expected_version)).await
    }
}

#[async_trait]
impl LedgerRepository for MemoryStore {
    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        self.autocommit(|tx| tx.stage_entry(entry)).await
    }

    async fn find_entry(&self, id: &LedgerEntryId) -> StoreResult<Option<LedgerEntry>> {
        self.detached().find_entry(id).await
    }

    async fn find_entries_by_owner(
        &self,
        owner: &UserId,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<LedgerEntry>> {
        self.detached()
            .find_entries_by_owner(owner, limit, offset)
            .await
    }

    async fn find_entry_by_external_ref(
        &self,
        external_ref: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        self.detached().find_entry_by_external_ref(external_ref).await
    }
}

#[async_trait]
impl CodeRepository for MemoryStore {
    async fn find_code(&self, code: &str) -> StoreResult<Option<RedemptionCode>> {
        Ok(self.detached().code(code))
    }

    async fn update_code(&self, code: &RedemptionCode) -> StoreResult<()> {
        self.autocommit(|tx| tx.stage_code_update(code)).await
    }

    async fn create_code(&self, code: &RedemptionCode) -> StoreResult<()> {
        self.autocommit(|tx| tx.stage_code_create(code)).await
    }

    async fn delete_code(&self, code: &str) -> StoreResult<()> {
        self.autocommit(|tx| tx.stage_code_delete(code)).await
    }

    async fn list_codes(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<(Vec<RedemptionCode>, usize)> {
        self.detached().list_codes(limit, offset).await
    }

    async fn has_user_redeemed(&self, code: &str, user: &UserId) -> StoreResult<bool> {
        Ok(self.detached().redeemed(&(code.to_string(), user.clone())))
    }

    async fn save_redemption(&self, record: &RedemptionRecord) -> StoreResult<()> {
        self.autocommit(|tx| tx.stage_redemption(record)).await
    }
}
