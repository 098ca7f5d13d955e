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

//! Code redemption and code administration.
//!
//! [`RedemptionOrchestrator::redeem`] validates a code, checks whether the
//! user already redeemed it and then, inside one atomic scope, consumes a use
//! of the code, grants its amount to the user's account, appends a ledger
//! entry and saves the redemption record.
//!
//! # Concurrency
//!
//! The orchestrator holds no locks of its own. Two mechanisms in the store
//! keep concurrent requests correct:
//!
//! - Account writes are conditional on the version read. A conflict reloads
//!   the account and retries with exponential backoff, up to the
//!   [`RetryPolicy`] bound.
//! - A store that only detects the version conflict at commit rolls the unit
//!   of work back. The whole redemption then runs again in a fresh unit of
//!   work, under the same bound.
//! - The store rejects a second redemption record for the same (code, user).
//!   The losing request fails with
//!   [`UserAlreadyRedeemed`](RedemptionError::UserAlreadyRedeemed) and its
//!   whole unit of work, balance grant included, is rolled back.
//!
//! Dropping the future returned by `redeem` cancels any backoff in progress
//! and rolls back the open unit of work.

use crate::account::CurrencyAccount;
use crate::atomic;
use crate::base::{CurrencyKind, LedgerEntryId, RedemptionId, UserId};
use crate::code::{CodeStatus, CodeType, NewCode, RedemptionCode};
use crate::error::{RedemptionError, StoreError};
use crate::ledger::{BalanceChange, EntryKind, EntryStatus, LedgerEntry};
use crate::redemption::{RedemptionReceipt, RedemptionRecord};
use crate::repository::{
    AccountRepository, AtomicScope, CodeRepository, LedgerRepository, UnitOfWork,
};
use crate::retry::RetryPolicy;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Page size used when a query asks for zero or fewer codes.
pub const DEFAULT_PAGE_SIZE: i64 = 50;
/// Largest page a query may ask for.
pub const MAX_PAGE_SIZE: i64 = 100;

/// Listing parameters for [`RedemptionOrchestrator::list_codes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeQuery {
    /// Clamped to `1..=100`; `0` or negative selects 50.
    pub limit: i64,
    /// Negative values are treated as `0`.
    pub offset: i64,
    pub status: Option<CodeStatus>,
    pub code_type: Option<CodeType>,
}

impl CodeQuery {
    fn page(&self) -> (usize, usize) {
        let limit = if self.limit <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.limit.min(MAX_PAGE_SIZE)
        };
        let offset = self.offset.max(0);
        (
            usize::try_from(limit).unwrap_or(0),
            usize::try_from(offset).unwrap_or(0),
        )
    }

    fn matches(&self, code: &RedemptionCode) -> bool {
        self.status.is_none_or(|s| s == code.status())
            && self.code_type.is_none_or(|t| t == code.code_type())
    }
}

/// One page of codes.
///
/// Filters apply to the fetched page, so `codes` may hold fewer than `limit`
/// items while more matches exist further on. `total` counts every stored
/// code regardless of the filters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodePage {
    pub codes: Vec<RedemptionCode>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

pub struct RedemptionOrchestrator {
    codes: Arc<dyn CodeRepository>,
    scope: Arc<dyn AtomicScope>,
    retry: RetryPolicy,
}

impl RedemptionOrchestrator {
    /// `codes` serves reads and admin writes outside a scope; `scope` opens
    /// the unit of work each redemption runs in.
    pub fn new(codes: Arc<dyn CodeRepository>, scope: Arc<dyn AtomicScope>) -> Self {
        Self {
            codes,
            scope,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Redeem `code` for `user`.
    ///
    /// # Errors
    ///
    /// - [`CodeNotFound`](RedemptionError::CodeNotFound) if no such code exists.
    /// - [`CodeNotRedeemable`](RedemptionError::CodeNotRedeemable) if the code
    ///   is disabled, expired, outside its window or used up.
    /// - [`UserAlreadyRedeemed`](RedemptionError::UserAlreadyRedeemed) if the
    ///   user already holds a redemption of the code, including one committed
    ///   by a concurrent request.
    /// - [`Balance`](RedemptionError::Balance) if the grant would take the
    ///   balance past [`MAX_AMOUNT`](crate::MAX_AMOUNT).
    /// - [`Store`](RedemptionError::Store) on persistence failures, including
    ///   version conflicts that outlast the retry policy.
    ///
    /// Validation failures return before any write. Failures inside the
    /// atomic scope leave no trace in the store.
    #[instrument(skip_all, fields(code = %code, user = %user))]
    pub async fn redeem(
        &self,
        code: &str,
        user: &UserId,
    ) -> Result<RedemptionReceipt, RedemptionError> {
        let code = code.trim();

        let found = self
            .codes
            .find_code(code)
            .await
            .map_err(|e| RedemptionError::store("failed to find code", e))?
            .ok_or(RedemptionError::CodeNotFound)?;

        if !found.is_valid() {
            return Err(RedemptionError::CodeNotRedeemable);
        }

        let redeemed = self
            .codes
            .has_user_redeemed(found.code(), user)
            .await
            .map_err(|e| RedemptionError::store("failed to check redemption", e))?;
        if redeemed {
            return Err(RedemptionError::UserAlreadyRedeemed);
        }

        // The code may have been used up while the redemption check ran.
        if !found.can_be_redeemed() {
            return Err(RedemptionError::CodeNotRedeemable);
        }

        let request = Redemption {
            code: found.code().to_string(),
            user: user.clone(),
            ledger_entry_id: LedgerEntryId::generate(),
            redemption_id: RedemptionId::generate(),
            retry: self.retry,
        };

        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;
        let receipt = loop {
            let pending = request.clone();
            let outcome = atomic::run(self.scope.as_ref(), move |unit| {
                Box::pin(async move { pending.apply(unit).await.map_err(ScopeFailure::Failed) })
            })
            .await;
            match outcome {
                Ok(receipt) => break receipt,
                Err(ScopeFailure::Failed(error)) => return Err(error),
                Err(ScopeFailure::Conflict(error)) if attempt < max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(attempt, max_attempts, ?delay, %error, "commit conflict, running redemption again");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(ScopeFailure::Conflict(error)) => {
                    return Err(RedemptionError::store(
                        "failed to commit redemption after retries",
                        error,
                    ));
                }
            }
        };

        info!(
            redemption_id = %receipt.redemption_id,
            amount = receipt.amount,
            balance_after = receipt.balance_after,
            "code redeemed"
        );
        Ok(receipt)
    }

    /// Validate and store a new code.
    pub async fn create_code(&self, new: NewCode) -> Result<RedemptionCode, RedemptionError> {
        let code = RedemptionCode::new(new, Utc::now())?;

        let existing = self
            .codes
            .find_code(code.code())
            .await
            .map_err(|e| RedemptionError::store("failed to find code", e))?;
        if existing.is_some() {
            return Err(RedemptionError::CodeAlreadyExists);
        }

        self.codes.create_code(&code).await.map_err(|e| match e {
            StoreError::Duplicate(_) => RedemptionError::CodeAlreadyExists,
            other => RedemptionError::store("failed to create code", other),
        })?;

        info!(code = %code.code(), code_type = %code.code_type(), amount = code.amount(), "code created");
        Ok(code)
    }

    /// Delete a code that nobody has redeemed.
    pub async fn delete_code(&self, code: &str) -> Result<(), RedemptionError> {
        let code = code.trim();
        self.find_existing(code).await?;

        self.codes.delete_code(code).await.map_err(|e| match e {
            StoreError::Referenced(_) => RedemptionError::CodeCannotBeDeleted,
            StoreError::NotFound(_) => RedemptionError::CodeNotFound,
            other => RedemptionError::store("failed to delete code", other),
        })?;

        info!(code, "code deleted");
        Ok(())
    }

    pub async fn get_code(&self, code: &str) -> Result<RedemptionCode, RedemptionError> {
        self.find_existing(code.trim()).await
    }

    pub async fn list_codes(&self, query: &CodeQuery) -> Result<CodePage, RedemptionError> {
        let (limit, offset) = query.page();
        let (codes, total) = self
            .codes
            .list_codes(limit, offset)
            .await
            .map_err(|e| RedemptionError::store("failed to list codes", e))?;

        Ok(CodePage {
            codes: codes.into_iter().filter(|c| query.matches(c)).collect(),
            total,
            limit,
            offset,
        })
    }

    /// Stop a code from being redeemed.
    pub async fn disable_code(&self, code: &str) -> Result<RedemptionCode, RedemptionError> {
        self.transition(code, RedemptionCode::disable).await
    }

    /// Mark a code expired ahead of its window.
    pub async fn expire_code(&self, code: &str) -> Result<RedemptionCode, RedemptionError> {
        self.transition(code, RedemptionCode::expire).await
    }

    async fn transition(
        &self,
        code: &str,
        apply: fn(&mut RedemptionCode, chrono::DateTime<Utc>),
    ) -> Result<RedemptionCode, RedemptionError> {
        let mut found = self.find_existing(code.trim()).await?;
        apply(&mut found, Utc::now());
        self.codes
            .update_code(&found)
            .await
            .map_err(|e| RedemptionError::store("failed to update code", e))?;

        info!(code = %found.code(), status = %found.status(), "code status changed");
        Ok(found)
    }

    async fn find_existing(&self, code: &str) -> Result<RedemptionCode, RedemptionError> {
        self.codes
            .find_code(code)
            .await
            .map_err(|e| RedemptionError::store("failed to find code", e))?
            .ok_or(RedemptionError::CodeNotFound)
    }
}

/// Owned inputs of the in-scope part of one redemption.
#[derive(Clone)]
struct Redemption {
    code: String,
    user: UserId,
    ledger_entry_id: LedgerEntryId,
    redemption_id: RedemptionId,
    retry: RetryPolicy,
}

/// Balances around a successful grant.
struct Granted {
    before: i64,
    after: i64,
}

enum GrantFailure {
    /// Someone else wrote the account first; reload and try again.
    Conflict(StoreError),
    Fatal(RedemptionError),
}

/// Outcome of one unit of work that did not commit.
enum ScopeFailure {
    /// The commit found an account version moved; nothing was applied.
    Conflict(StoreError),
    Failed(RedemptionError),
}

/// Begin and commit failures.
impl From<StoreError> for ScopeFailure {
    fn from(error: StoreError) -> Self {
        if error.is_version_conflict() {
            Self::Conflict(error)
        } else {
            Self::Failed(error.into())
        }
    }
}

impl Redemption {
    async fn apply(self, unit: &dyn UnitOfWork) -> Result<RedemptionReceipt, RedemptionError> {
        let now = Utc::now();

        // Reloaded through the unit so a use consumed since validation is seen.
        let mut code = unit
            .find_code(&self.code)
            .await
            .map_err(|e| RedemptionError::store("failed to find code", e))?
            .ok_or(RedemptionError::CodeNotFound)?;
        code.redeem_at(now)?;
        unit.update_code(&code)
            .await
            .map_err(|e| RedemptionError::store("failed to update code", e))?;

        let granted = self
            .grant_with_retry(unit, code.currency(), code.amount())
            .await?;

        let entry = LedgerEntry::record(
            self.ledger_entry_id.clone(),
            BalanceChange {
                owner: self.user.clone(),
                kind: EntryKind::Grant,
                currency: code.currency(),
                amount: code.amount(),
                balance_before: granted.before,
                balance_after: granted.after,
            },
            now,
        )?
        .with_status(EntryStatus::Completed)
        .with_metadata("code", code.code())
        .with_metadata("redemption_id", self.redemption_id.as_str())
        .with_metadata("code_type", code.code_type().as_str());
        unit.append_entry(&entry)
            .await
            .map_err(|e| RedemptionError::store("failed to append ledger entry", e))?;

        let record = RedemptionRecord::new(
            self.redemption_id.clone(),
            code.code(),
            self.user.clone(),
            self.ledger_entry_id.clone(),
            now,
        );
        unit.save_redemption(&record).await.map_err(|e| match e {
            StoreError::Duplicate(_) => RedemptionError::UserAlreadyRedeemed,
            other => RedemptionError::store("failed to save redemption", other),
        })?;

        Ok(RedemptionReceipt {
            redemption_id: self.redemption_id,
            ledger_entry_id: self.ledger_entry_id,
            code: code.code().to_string(),
            currency: code.currency(),
            amount: code.amount(),
            balance_after: granted.after,
            status: entry.status(),
        })
    }

    async fn grant_with_retry(
        &self,
        unit: &dyn UnitOfWork,
        currency: CurrencyKind,
        amount: i64,
    ) -> Result<Granted, RedemptionError> {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            match self.try_grant(unit, currency, amount).await {
                Ok(granted) => return Ok(granted),
                Err(GrantFailure::Fatal(error)) => return Err(error),
                Err(GrantFailure::Conflict(error)) if attempt < max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(attempt, max_attempts, ?delay, %error, "account write conflict, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(GrantFailure::Conflict(error)) => {
                    return Err(RedemptionError::store(
                        "failed to update account after retries",
                        error,
                    ));
                }
            }
        }
    }

    async fn try_grant(
        &self,
        unit: &dyn UnitOfWork,
        currency: CurrencyKind,
        amount: i64,
    ) -> Result<Granted, GrantFailure> {
        let found = unit
            .find_account(&self.user, currency)
            .await
            .map_err(|e| GrantFailure::Fatal(RedemptionError::store("failed to find account", e)))?;

        let mut account = match found {
            Some(account) => account,
            None => {
                let account = CurrencyAccount::new(self.user.clone(), currency);
                match unit.create_account(&account).await {
                    Ok(()) => account,
                    Err(e @ StoreError::Duplicate(_)) => return Err(GrantFailure::Conflict(e)),
                    Err(e) => {
                        return Err(GrantFailure::Fatal(RedemptionError::store(
                            "failed to create account",
                            e,
                        )));
                    }
                }
            }
        };

        let expected = account.version();
        let before = account.balance();
        account
            .grant(amount)
            .map_err(|e| GrantFailure::Fatal(e.into()))?;

        match unit.save_account(&account, expected).await {
            Ok(()) => Ok(Granted {
                before,
                after: account.balance(),
            }),
            Err(e) if e.is_version_conflict() => Err(GrantFailure::Conflict(e)),
            Err(e) => Err(GrantFailure::Fatal(RedemptionError::store(
                "failed to update account",
                e,
            ))),
        }
    }
}
