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

//! All-or-nothing execution of a unit of work.
//!
//! [`run`] opens a [`UnitOfWork`], hands it to the work function and then:
//!
//! - commits when the work returns `Ok`
//! - rolls back when the work returns `Err`, then returns that error
//! - rolls back when the work panics, then resumes the panic
//!
//! If the returned future is dropped before it completes, the unit of work is
//! dropped with it, which rolls it back.

use crate::error::StoreError;
use crate::repository::{AtomicScope, UnitOfWork};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

/// Run `work` inside one unit of work opened on `scope`.
///
/// A failure to open or commit the unit of work is returned through
/// `E: From<StoreError>`. A failed rollback is logged and does not replace
/// the error that caused it.
///
/// # Example
///
/// ```
/// use gem_ledger::{atomic, CurrencyAccount, CurrencyKind, MemoryStore, StoreError, UserId};
/// use gem_ledger::AccountRepository;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// let alice = UserId::new("alice");
///
/// let created: Result<(), StoreError> = atomic::run(&store, |unit| {
///     let account = CurrencyAccount::new(UserId::new("alice"), CurrencyKind::Free);
///     Box::pin(async move { unit.create_account(&account).await })
/// })
/// .await;
///
/// assert!(created.is_ok());
/// assert!(store.find_account(&alice, CurrencyKind::Free).await.unwrap().is_some());
/// # }
/// ```
pub async fn run<S, T, E, F>(scope: &S, work: F) -> Result<T, E>
where
    S: AtomicScope + ?Sized,
    E: From<StoreError>,
    F: for<'a> FnOnce(&'a dyn UnitOfWork) -> BoxFuture<'a, Result<T, E>>,
{
    let unit = scope.begin().await?;

    let outcome = AssertUnwindSafe(work(unit.as_ref())).catch_unwind().await;

    match outcome {
        Ok(Ok(value)) => {
            unit.commit().await?;
            debug!("unit of work committed");
            Ok(value)
        }
        Ok(Err(error)) => {
            if let Err(rollback) = unit.rollback().await {
                warn!(error = %rollback, "rollback after failed unit of work did not complete");
            }
            Err(error)
        }
        Err(panic) => {
            if let Err(rollback) = unit.rollback().await {
                warn!(error = %rollback, "rollback after panic did not complete");
            }
            warn!("unit of work panicked, rolled back");
            std::panic::resume_unwind(panic)
        }
    }
}
