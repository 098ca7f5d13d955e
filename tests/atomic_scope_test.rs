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

//! Atomic scope tests: rollback on error, panic and cancellation.

mod common;

use common::*;
use gem_ledger::{
    AccountRepository, AtomicScope, CurrencyAccount, CurrencyKind, MemoryStore, RedemptionError,
    RedemptionOrchestrator, RetryPolicy, StoreError, atomic,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

// === Panics ===

#[tokio::test]
async fn panic_inside_work_rolls_back_and_resumes() {
    let store = MemoryStore::new();
    let scoped = store.clone();

    let joined = tokio::spawn(async move {
        atomic::run::<_, (), StoreError, _>(&scoped, |unit| {
            Box::pin(async move {
                unit.create_account(&CurrencyAccount::new(user("alice"), CurrencyKind::Paid))
                    .await?;
                panic!("work function crashed");
            })
        })
        .await
    })
    .await;

    let error = joined.unwrap_err();
    assert!(error.is_panic());
    assert!(store.accounts().is_empty());

    // The writer slot was released despite the panic.
    let unit = tokio::time::timeout(Duration::from_secs(1), store.begin())
        .await
        .expect("writer slot still held")
        .unwrap();
    unit.rollback().await.unwrap();
}

#[tokio::test]
async fn panic_during_redemption_leaves_no_writes() {
    let flaky = FlakyStore::new();
    let engine = Arc::new(make_flaky_engine(&flaky));
    let alice = user("alice");
    seed_account(&flaky.inner, &alice, CurrencyKind::Free, 10, 1).await;
    engine
        .create_code(make_code("BOOM", CurrencyKind::Free, 5, 0))
        .await
        .unwrap();
    flaky.faults.panic_on_append.store(true, Ordering::SeqCst);

    let task_engine = Arc::clone(&engine);
    let task_user = alice.clone();
    let joined = tokio::spawn(async move { task_engine.redeem("BOOM", &task_user).await }).await;
    assert!(joined.unwrap_err().is_panic());

    let account = stored_account(&flaky.inner, &alice, CurrencyKind::Free)
        .await
        .unwrap();
    assert_eq!((account.balance(), account.version()), (10, 1));
    assert_eq!(stored_code(&flaky.inner, "BOOM").await.current_uses(), 0);

    flaky.faults.panic_on_append.store(false, Ordering::SeqCst);
    let receipt = engine.redeem("BOOM", &alice).await.unwrap();
    assert_eq!(receipt.balance_after, 15);
}

// === Cancellation ===

#[tokio::test]
async fn cancelled_redemption_rolls_back_during_backoff() {
    let flaky = FlakyStore::new();
    let engine = RedemptionOrchestrator::new(
        Arc::new(flaky.inner.clone()),
        Arc::new(flaky.clone()),
    )
    .with_retry_policy(RetryPolicy::new(3, Duration::from_secs(30)));
    engine
        .create_code(make_code("SLOW", CurrencyKind::Paid, 100, 0))
        .await
        .unwrap();
    flaky.faults.conflict_next(1);

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        engine.redeem("SLOW", &user("alice")),
    )
    .await;

    assert!(result.is_err(), "redeem should still be backing off");
    assert_eq!(flaky.faults.save_account_calls.load(Ordering::SeqCst), 1);
    assert!(flaky.inner.accounts().is_empty());
    assert_eq!(stored_code(&flaky.inner, "SLOW").await.current_uses(), 0);

    // The abandoned unit released the writer slot.
    let receipt = tokio::time::timeout(
        Duration::from_secs(1),
        engine.redeem("SLOW", &user("alice")),
    )
    .await
    .expect("writer slot still held")
    .unwrap();
    assert_eq!(receipt.balance_after, 100);
}

// === Acquisition ===

#[tokio::test]
async fn busy_scope_reports_unavailable() {
    let store = MemoryStore::new().with_acquire_timeout(Duration::from_millis(20));
    let engine = make_engine(&store);
    engine
        .create_code(make_code("BUSY", CurrencyKind::Free, 1, 0))
        .await
        .unwrap();

    let held = store.begin().await.unwrap();
    let result = engine.redeem("BUSY", &user("alice")).await;
    drop(held);

    match result {
        Err(RedemptionError::Store { source, .. }) => {
            assert!(matches!(source, StoreError::Unavailable(_)));
        }
        other => panic!("expected an unavailable store, got {other:?}"),
    }
    assert_eq!(stored_code(&store, "BUSY").await.current_uses(), 0);
    engine.redeem("BUSY", &user("alice")).await.unwrap();
}

#[tokio::test]
async fn error_inside_work_discards_every_staged_write() {
    let store = MemoryStore::new();
    let result: Result<(), StoreError> = atomic::run(&store, |unit| {
        Box::pin(async move {
            unit.create_account(&CurrencyAccount::new(user("a"), CurrencyKind::Paid))
                .await?;
            unit.create_account(&CurrencyAccount::new(user("b"), CurrencyKind::Free))
                .await?;
            // Second create of the same pair fails and aborts the unit.
            unit.create_account(&CurrencyAccount::new(user("a"), CurrencyKind::Paid))
                .await
        })
    })
    .await;

    assert!(matches!(result, Err(StoreError::Duplicate(_))));
    assert!(store.accounts().is_empty());
}

#[tokio::test]
async fn failed_commit_is_reported_and_applies_nothing() {
    let flaky = FlakyStore::new();
    flaky.faults.conflict_next_commits(1);

    let result: Result<(), StoreError> = atomic::run(&flaky, |unit| {
        Box::pin(async move {
            unit.create_account(&CurrencyAccount::new(user("alice"), CurrencyKind::Paid))
                .await
        })
    })
    .await;

    assert_eq!(
        result,
        Err(StoreError::VersionConflict {
            expected: 1,
            actual: 2
        })
    );
    assert!(flaky.inner.accounts().is_empty());
}
