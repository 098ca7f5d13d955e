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

//! Shared fixtures for integration tests.
//!
//! [`FlakyStore`] wraps a [`MemoryStore`] and injects failures into the units
//! of work it opens, so tests can drive the orchestrator through conflict,
//! failure and panic paths.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use gem_ledger::{
    AccountRepository, AtomicScope, CodeRepository, CodeType, CurrencyAccount, CurrencyKind,
    LedgerEntry, LedgerEntryId, LedgerRepository, MemoryStore, Metadata, NewCode,
    RedemptionCode, RedemptionOrchestrator, RedemptionRecord, RetryPolicy, StoreError,
    StoreResult, UnitOfWork, UserId,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

// === Fixtures ===

pub fn user(id: &str) -> UserId {
    UserId::new(id)
}

/// An active code valid from an hour ago until tomorrow.
pub fn make_code(code: &str, currency: CurrencyKind, amount: i64, max_uses: u32) -> NewCode {
    let now = Utc::now();
    NewCode {
        code: code.to_string(),
        code_type: CodeType::Promotion,
        currency,
        amount,
        max_uses,
        valid_from: now - Duration::hours(1),
        valid_until: now + Duration::days(1),
        metadata: Metadata::new(),
    }
}

/// Retries quickly so conflict tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, std::time::Duration::from_millis(1))
}

pub fn make_engine(store: &MemoryStore) -> RedemptionOrchestrator {
    RedemptionOrchestrator::new(Arc::new(store.clone()), Arc::new(store.clone()))
        .with_retry_policy(fast_retry())
}

pub fn make_flaky_engine(flaky: &FlakyStore) -> RedemptionOrchestrator {
    RedemptionOrchestrator::new(Arc::new(flaky.inner.clone()), Arc::new(flaky.clone()))
        .with_retry_policy(fast_retry())
}

/// Store `balance` for `owner` through `version` successive grants.
pub async fn seed_account(
    store: &MemoryStore,
    owner: &UserId,
    currency: CurrencyKind,
    balance: i64,
    version: u64,
) -> CurrencyAccount {
    assert!(version >= 1 && balance >= version as i64);
    let mut account = CurrencyAccount::new(owner.clone(), currency);
    store.create_account(&account).await.unwrap();

    let step = balance / version as i64;
    for i in 0..version {
        let amount = if i + 1 == version {
            balance - account.balance()
        } else {
            step
        };
        let expected = account.version();
        account.grant(amount).unwrap();
        store.save_account(&account, expected).await.unwrap();
    }
    account
}

pub async fn stored_account(
    store: &MemoryStore,
    owner: &UserId,
    currency: CurrencyKind,
) -> Option<CurrencyAccount> {
    store.find_account(owner, currency).await.unwrap()
}

pub async fn stored_code(store: &MemoryStore, code: &str) -> RedemptionCode {
    store.find_code(code).await.unwrap().unwrap()
}

// === Fault injection ===

#[derive(Debug, Default)]
pub struct Faults {
    /// Number of upcoming `save_account` calls to reject with a version conflict.
    pub version_conflicts: AtomicU32,
    pub fail_append: AtomicBool,
    pub fail_save_redemption: AtomicBool,
    pub panic_on_append: AtomicBool,
    /// Number of upcoming commits to reject with a version conflict.
    pub commit_conflicts: AtomicU32,
    /// Calls observed so far.
    pub begins: AtomicU32,
    pub save_account_calls: AtomicU32,
}

impl Faults {
    pub fn conflict_next(&self, times: u32) {
        self.version_conflicts.store(times, Ordering::SeqCst);
    }

    pub fn conflict_next_commits(&self, times: u32) {
        self.commit_conflicts.store(times, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        take_one(&self.version_conflicts)
    }

    fn take_commit_conflict(&self) -> bool {
        take_one(&self.commit_conflicts)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Scope over a [`MemoryStore`] whose units of work fail on demand.
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub faults: Arc<Faults>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AtomicScope for FlakyStore {
    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        self.faults.begins.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.begin().await?;
        Ok(Box::new(FlakyUnit {
            inner,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FlakyUnit {
    inner: Box<dyn UnitOfWork>,
    faults: Arc<Faults>,
}

#[async_trait]
impl AccountRepository for FlakyUnit {
    async fn find_account(
        &self,
        owner: &UserId,
        currency: CurrencyKind,
    ) -> StoreResult<Option<CurrencyAccount>> {
        self.inner.find_account(owner, currency).await
    }

    async fn create_account(&self, account: &CurrencyAccount) -> StoreResult<()> {
        self.inner.create_account(account).await
    }

    async fn save_account(
        &self,
        account: &CurrencyAccount,
        expected_version: u64,
    ) -> StoreResult<()> {
        self.faults.save_account_calls.fetch_add(1, Ordering::SeqCst);
        if self.faults.take_conflict() {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        self.inner.save_account(account, expected_version).await
    }
}

#[async_trait]
impl LedgerRepository for FlakyUnit {
    async fn append_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        if self.faults.panic_on_append.load(Ordering::SeqCst) {
            panic!("injected panic while appending {}", entry.id());
        }
        if self.faults.fail_append.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected append failure".to_string()));
        }
        self.inner.append_entry(entry).await
    }

    async fn find_entry(&self, id: &LedgerEntryId) -> StoreResult<Option<LedgerEntry>> {
        self.inner.find_entry(id).await
    }

    async fn find_entries_by_owner(
        &self,
        owner: &UserId,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<LedgerEntry>> {
        self.inner.find_entries_by_owner(owner, limit, offset).await
    }

    async fn find_entry_by_external_ref(
        &self,
        external_ref: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        self.inner.find_entry_by_external_ref(external_ref).await
    }
}

#[async_trait]
impl CodeRepository for FlakyUnit {
    async fn find_code(&self, code: &str) -> StoreResult<Option<RedemptionCode>> {
        self.inner.find_code(code).await
    }

    async fn update_code(&self, code: &RedemptionCode) -> StoreResult<()> {
        self.inner.update_code(code).await
    }

    async fn create_code(&self, code: &RedemptionCode) -> StoreResult<()> {
        self.inner.create_code(code).await
    }

    async fn delete_code(&self, code: &str) -> StoreResult<()> {
        self.inner.delete_code(code).await
    }

    async fn list_codes(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<(Vec<RedemptionCode>, usize)> {
        self.inner.list_codes(limit, offset).await
    }

    async fn has_user_redeemed(&self, code: &str, user: &UserId) -> StoreResult<bool> {
        self.inner.has_user_redeemed(code, user).await
    }

    async fn save_redemption(&self, record: &RedemptionRecord) -> StoreResult<()> {
        if self.faults.fail_save_redemption.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected redemption failure".to_string()));
        }
        self.inner.save_redemption(record).await
    }
}

#[async_trait]
impl UnitOfWork for FlakyUnit {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.faults.take_commit_conflict() {
            // Another writer moved the account after it was staged.
            self.inner.rollback().await?;
            return Err(StoreError::VersionConflict {
                expected: 1,
                actual: 2,
            });
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.inner.rollback().await
    }
}

// === Stale redemption check ===

/// Code repository whose redemption check always answers "not yet", as a
/// replica lagging behind a concurrent commit would.
#[derive(Clone)]
pub struct LaggingCodes {
    pub inner: MemoryStore,
}

#[async_trait]
impl CodeRepository for LaggingCodes {
    async fn find_code(&self, code: &str) -> StoreResult<Option<RedemptionCode>> {
        self.inner.find_code(code).await
    }

    async fn update_code(&self, code: &RedemptionCode) -> StoreResult<()> {
        self.inner.update_code(code).await
    }

    async fn create_code(&self, code: &RedemptionCode) -> StoreResult<()> {
        self.inner.create_code(code).await
    }

    async fn delete_code(&self, code: &str) -> StoreResult<()> {
        self.inner.delete_code(code).await
    }

    async fn list_codes(
        &self,
        limit: usize,
        offset: usize,
    ) -> StoreResult<(Vec<RedemptionCode>, usize)> {
        self.inner.list_codes(limit, offset).await
    }

    async fn has_user_redeemed(&self, _code: &str, _user: &UserId) -> StoreResult<bool> {
        Ok(false)
    }

    async fn save_redemption(&self, record: &RedemptionRecord) -> StoreResult<()> {
        self.inner.save_redemption(record).await
    }
}

/// Engine whose pre-scope redemption check never sees earlier redemptions.
pub fn make_lagging_engine(store: &MemoryStore) -> RedemptionOrchestrator {
    RedemptionOrchestrator::new(
        Arc::new(LaggingCodes {
            inner: store.clone(),
        }),
        Arc::new(store.clone()),
    )
    .with_retry_policy(fast_retry())
}
