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

//! Redemption codes.
//!
//! ```text
//!  Active ──disable()──► Disabled
//!     │
//!     └────expire()────► Expired
//! ```
//!
//! Only an active code inside its `[valid_from, valid_until]` window with
//! uses left can be redeemed. The window check is evaluated at redemption
//! time and never changes the status by itself.

use crate::account::validate_amount;
use crate::base::CurrencyKind;
use crate::error::{CodeError, ParseEnumError};
use crate::ledger::Metadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_CODE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeType {
    Promotion,
    Gift,
    Event,
}

impl CodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promotion => "promotion",
            Self::Gift => "gift",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for CodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "promotion" => Ok(Self::Promotion),
            "gift" => Ok(Self::Gift),
            "event" => Ok(Self::Event),
            _ => Err(ParseEnumError::new("code type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeStatus {
    Active,
    Expired,
    Disabled,
}

impl CodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for CodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "disabled" => Ok(Self::Disabled),
            _ => Err(ParseEnumError::new("code status", s)),
        }
    }
}

/// Definition of a code to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCode {
    pub code: String,
    pub code_type: CodeType,
    pub currency: CurrencyKind,
    pub amount: i64,
    /// Total redemptions allowed across all users; `0` means unlimited.
    pub max_uses: u32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Promotional code granting a fixed amount of currency.
///
/// Deserializing runs the same checks as [`RedemptionCode::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredCode")]
pub struct RedemptionCode {
    code: String,
    code_type: CodeType,
    currency: CurrencyKind,
    amount: i64,
    max_uses: u32,
    current_uses: u32,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    status: CodeStatus,
    metadata: Metadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Serialized form of a [`RedemptionCode`], validated on the way in.
#[derive(Deserialize)]
struct StoredCode {
    code: String,
    code_type: CodeType,
    currency: CurrencyKind,
    amount: i64,
    max_uses: u32,
    current_uses: u32,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    status: CodeStatus,
    #[serde(default)]
    metadata: Metadata,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StoredCode> for RedemptionCode {
    type Error = CodeError;

    fn try_from(stored: StoredCode) -> Result<Self, Self::Error> {
        validate_code(&stored.code)?;
        validate_amount(stored.amount)?;
        if stored.valid_until < stored.valid_from {
            return Err(CodeError::InvalidWindow);
        }

        Ok(Self {
            code: stored.code,
            code_type: stored.code_type,
            currency: stored.currency,
            amount: stored.amount,
            max_uses: stored.max_uses,
            current_uses: stored.current_uses,
            valid_from: stored.valid_from,
            valid_until: stored.valid_until,
            status: stored.status,
            metadata: stored.metadata,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        })
    }
}

fn validate_code(code: &str) -> Result<(), CodeError> {
    if code.is_empty() {
        return Err(CodeError::InvalidFormat("code is empty".to_string()));
    }
    if code.len() > MAX_CODE_LEN {
        return Err(CodeError::InvalidFormat(format!(
            "code is longer than {MAX_CODE_LEN} characters"
        )));
    }
    if let Some(c) = code
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(CodeError::InvalidFormat(format!("unexpected character {c:?}")));
    }
    Ok(())
}

impl RedemptionCode {
    /// Creates an active code with no uses.
    ///
    /// # Errors
    ///
    /// - [`CodeError::InvalidFormat`] if the trimmed code is empty, longer than
    ///   64 characters or contains characters outside `[A-Za-z0-9_-]`.
    /// - [`CodeError::Amount`] if the amount lies outside `(0, MAX_AMOUNT]`.
    /// - [`CodeError::InvalidWindow`] if `valid_until < valid_from`.
    pub fn new(new: NewCode, now: DateTime<Utc>) -> Result<Self, CodeError> {
        let code = new.code.trim().to_string();
        validate_code(&code)?;
        validate_amount(new.amount)?;
        if new.valid_until < new.valid_from {
            return Err(CodeError::InvalidWindow);
        }

        Ok(Self {
            code,
            code_type: new.code_type,
            currency: new.currency,
            amount: new.amount,
            max_uses: new.max_uses,
            current_uses: 0,
            valid_from: new.valid_from,
            valid_until: new.valid_until,
            status: CodeStatus::Active,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status == CodeStatus::Active
            && self.valid_from <= now
            && now <= self.valid_until
            && (self.max_uses == 0 || self.current_uses < self.max_uses)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn can_be_redeemed_at(&self, now: DateTime<Utc>) -> bool {
        self.is_valid_at(now)
    }

    pub fn can_be_redeemed(&self) -> bool {
        self.can_be_redeemed_at(Utc::now())
    }

    /// Consumes one use of the code.
    ///
    /// This is the only place `current_uses` changes. It does not know which
    /// user is redeeming; per-user uniqueness is enforced by the redemption
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`CodeError::NotRedeemable`] if the code cannot be redeemed at `now`.
    pub fn redeem_at(&mut self, now: DateTime<Utc>) -> Result<(), CodeError> {
        if !self.can_be_redeemed_at(now) {
            return Err(CodeError::NotRedeemable);
        }
        self.current_uses += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn redeem(&mut self) -> Result<(), CodeError> {
        self.redeem_at(Utc::now())
    }

    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.status = CodeStatus::Disabled;
        self.updated_at = now;
    }

    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.status = CodeStatus::Expired;
        self.updated_at = now;
    }

    /// Uses left before the cap, `None` for unlimited codes.
    pub fn remaining_uses(&self) -> Option<u32> {
        (self.max_uses > 0).then(|| self.max_uses.saturating_sub(self.current_uses))
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn code_type(&self) -> CodeType {
        self.code_type
    }

    pub fn currency(&self) -> CurrencyKind {
        self.currency
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn max_uses(&self) -> u32 {
        self.max_uses
    }

    pub fn current_uses(&self) -> u32 {
        self.current_uses
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    pub fn status(&self) -> CodeStatus {
        self.status
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MAX_AMOUNT;
    use crate::error::BalanceError;
    use chrono::Duration;

    fn new_code(max_uses: u32, now: DateTime<Utc>) -> NewCode {
        NewCode {
            code: "TESTCODE123".to_string(),
            code_type: CodeType::Promotion,
            currency: CurrencyKind::Paid,
            amount: 1_000,
            max_uses,
            valid_from: now - Duration::hours(1),
            valid_until: now + Duration::hours(1),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn new_code_is_active_and_unused() {
        let now = Utc::now();
        let code = RedemptionCode::new(new_code(10, now), now).unwrap();
        assert_eq!(code.status(), CodeStatus::Active);
        assert_eq!(code.current_uses(), 0);
        assert_eq!(code.remaining_uses(), Some(10));
        assert!(code.is_valid_at(now));
    }

    #[test]
    fn constructor_validates_definition() {
        let now = Utc::now();

        let mut blank = new_code(1, now);
        blank.code = "   ".into();
        assert!(matches!(
            RedemptionCode::new(blank, now),
            Err(CodeError::InvalidFormat(_))
        ));

        let mut spaced = new_code(1, now);
        spaced.code = "HELLO WORLD".into();
        assert!(matches!(
            RedemptionCode::new(spaced, now),
            Err(CodeError::InvalidFormat(_))
        ));

        let mut long = new_code(1, now);
        long.code = "A".repeat(65);
        assert!(matches!(
            RedemptionCode::new(long, now),
            Err(CodeError::InvalidFormat(_))
        ));

        let mut free = new_code(1, now);
        free.amount = 0;
        assert_eq!(
            RedemptionCode::new(free, now),
            Err(CodeError::Amount(BalanceError::InvalidAmount))
        );

        let mut huge = new_code(1, now);
        huge.amount = MAX_AMOUNT + 1;
        assert_eq!(
            RedemptionCode::new(huge, now),
            Err(CodeError::Amount(BalanceError::AmountTooLarge))
        );

        let mut backwards = new_code(1, now);
        backwards.valid_until = backwards.valid_from - Duration::seconds(1);
        assert_eq!(RedemptionCode::new(backwards, now), Err(CodeError::InvalidWindow));
    }

    #[test]
    fn code_is_trimmed() {
        let now = Utc::now();
        let mut padded = new_code(0, now);
        padded.code = "  SUMMER-24_A ".into();
        let code = RedemptionCode::new(padded, now).unwrap();
        assert_eq!(code.code(), "SUMMER-24_A");
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let now = Utc::now();
        let code = RedemptionCode::new(new_code(0, now), now).unwrap();
        assert!(code.is_valid_at(code.valid_from()));
        assert!(code.is_valid_at(code.valid_until()));
        assert!(!code.is_valid_at(code.valid_from() - Duration::milliseconds(1)));
        assert!(!code.is_valid_at(code.valid_until() + Duration::milliseconds(1)));
    }

    #[test]
    fn redeem_stops_at_max_uses() {
        let now = Utc::now();
        let mut code = RedemptionCode::new(new_code(2, now), now).unwrap();
        code.redeem_at(now).unwrap();
        code.redeem_at(now).unwrap();
        assert_eq!(code.redeem_at(now), Err(CodeError::NotRedeemable));
        assert_eq!(code.current_uses(), 2);
        assert_eq!(code.remaining_uses(), Some(0));
    }

    #[test]
    fn unlimited_codes_keep_counting() {
        let now = Utc::now();
        let mut code = RedemptionCode::new(new_code(0, now), now).unwrap();
        for _ in 0..100 {
            code.redeem_at(now).unwrap();
        }
        assert_eq!(code.current_uses(), 100);
        assert_eq!(code.remaining_uses(), None);
    }

    #[test]
    fn disabled_and_expired_codes_cannot_be_redeemed() {
        let now = Utc::now();
        let mut disabled = RedemptionCode::new(new_code(0, now), now).unwrap();
        disabled.disable(now);
        assert_eq!(disabled.status(), CodeStatus::Disabled);
        assert_eq!(disabled.redeem_at(now), Err(CodeError::NotRedeemable));

        let mut expired = RedemptionCode::new(new_code(0, now), now).unwrap();
        expired.expire(now);
        assert!(!expired.can_be_redeemed_at(now));
        assert_eq!(expired.current_uses(), 0);
    }

    #[test]
    fn enums_parse_their_display_form() {
        for code_type in [CodeType::Promotion, CodeType::Gift, CodeType::Event] {
            assert_eq!(code_type.to_string().parse::<CodeType>(), Ok(code_type));
        }
        for status in [CodeStatus::Active, CodeStatus::Expired, CodeStatus::Disabled] {
            assert_eq!(status.to_string().parse::<CodeStatus>(), Ok(status));
        }
        assert_eq!(
            "coupon".parse::<CodeType>(),
            Err(ParseEnumError::new("code type", "coupon"))
        );
    }

    #[test]
    fn deserializing_rejects_what_new_rejects() {
        let now = Utc::now();
        let code = RedemptionCode::new(new_code(5, now), now).unwrap();
        let stored = serde_json::to_value(&code).unwrap();
        assert_eq!(serde_json::from_value::<RedemptionCode>(stored.clone()).unwrap(), code);

        let mut backwards = stored.clone();
        backwards["valid_until"] = stored["valid_from"].clone();
        backwards["valid_from"] = stored["valid_until"].clone();
        let error = serde_json::from_value::<RedemptionCode>(backwards).unwrap_err();
        assert!(error.to_string().contains("validity window"));

        let mut spaced = stored.clone();
        spaced["code"] = "NOT VALID".into();
        assert!(serde_json::from_value::<RedemptionCode>(spaced).is_err());

        let mut free = stored;
        free["amount"] = 0.into();
        assert!(serde_json::from_value::<RedemptionCode>(free).is_err());
    }
}
