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

//! # Gem Ledger
//!
//! This library keeps per-user virtual currency balances ("gems") and lets
//! holders of promotional codes redeem each code once for a currency grant.
//! Every balance change is recorded in an append-only ledger.
//!
//! ## Core Components
//!
//! - [`RedemptionOrchestrator`]: Redeems codes and administers them
//! - [`CurrencyAccount`]: Balance with an optimistic-lock version
//! - [`RedemptionCode`]: Code with validity window, usage cap and status
//! - [`LedgerEntry`]: Immutable record of one balance change
//! - [`AtomicScope`] / [`UnitOfWork`]: All-or-nothing persistence contracts
//! - [`MemoryStore`]: In-process store implementing every contract
//!
//! ## Example
//!
//! ```
//! use chrono::{Duration, Utc};
//! use gem_ledger::{CodeType, CurrencyKind, MemoryStore, Metadata, NewCode};
//! use gem_ledger::{RedemptionError, RedemptionOrchestrator, UserId};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = MemoryStore::new();
//! let engine = RedemptionOrchestrator::new(Arc::new(store.clone()), Arc::new(store.clone()));
//!
//! let now = Utc::now();
//! engine
//!     .create_code(NewCode {
//!         code: "WELCOME".to_string(),
//!         code_type: CodeType::Promotion,
//!         currency: CurrencyKind::Free,
//!         amount: 100,
//!         max_uses: 0,
//!         valid_from: now - Duration::days(1),
//!         valid_until: now + Duration::days(30),
//!         metadata: Metadata::new(),
//!     })
//!     .await
//!     .unwrap();
//!
//! let alice = UserId::new("alice");
//! let receipt = engine.redeem("WELCOME", &alice).await.unwrap();
//! assert_eq!(receipt.balance_after, 100);
//!
//! // A code is redeemable once per user.
//! assert_eq!(
//!     engine.redeem("WELCOME", &alice).await,
//!     Err(RedemptionError::UserAlreadyRedeemed)
//! );
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! The orchestrator keeps no per-request state and can be shared across
//! tasks. Concurrent redemptions are made safe by the store: account writes
//! are version-checked and redemption records are unique per (code, user).

pub mod account;
pub mod atomic;
mod base;
pub mod code;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod redemption;
pub mod repository;
pub mod retry;

pub use account::{CurrencyAccount, MAX_AMOUNT, MIN_BALANCE};
pub use base::{CurrencyKind, LedgerEntryId, RedemptionId, UserId};
pub use code::{CodeStatus, CodeType, NewCode, RedemptionCode};
pub use config::{ConfigError, EngineConfig};
pub use error::{
    BalanceError, CodeError, LedgerError, ParseEnumError, RedemptionError, StoreError, StoreResult,
};
pub use ledger::{BalanceChange, EntryKind, EntryStatus, LedgerEntry, Metadata};
pub use logging::{LogFormat, LoggingError, init_logging};
pub use memory::{MemoryStore, MemoryTransaction};
pub use orchestrator::{CodePage, CodeQuery, RedemptionOrchestrator};
pub use redemption::{RedemptionReceipt, RedemptionRecord};
pub use repository::{AccountRepository, AtomicScope, CodeRepository, LedgerRepository, UnitOfWork};
pub use retry::RetryPolicy;
