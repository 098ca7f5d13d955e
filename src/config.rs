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

//! Environment-based configuration.
//!
//! All settings are optional:
//! - `GEM_LEDGER_MAX_ATTEMPTS` - account write attempts per redemption (default: 3)
//! - `GEM_LEDGER_RETRY_BASE_MS` - first backoff delay in milliseconds (default: 10)
//! - `GEM_LEDGER_LOG_LEVEL` - tracing filter directive (default: "info")
//! - `GEM_LEDGER_LOG_FORMAT` - "pretty" or "json" (default: "pretty")

use crate::logging::LogFormat;
use crate::retry::RetryPolicy;
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const MAX_ATTEMPTS_VAR: &str = "GEM_LEDGER_MAX_ATTEMPTS";
pub const RETRY_BASE_MS_VAR: &str = "GEM_LEDGER_RETRY_BASE_MS";
pub const LOG_LEVEL_VAR: &str = "GEM_LEDGER_LOG_LEVEL";
pub const LOG_FORMAT_VAR: &str = "GEM_LEDGER_LOG_FORMAT";

/// Upper bound on configured attempts.
const MAX_CONFIGURED_ATTEMPTS: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_attempts = match lookup(MAX_ATTEMPTS_VAR) {
            Some(raw) => {
                let attempts: u32 = raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(MAX_ATTEMPTS_VAR, raw.clone()))?;
                if !(1..=MAX_CONFIGURED_ATTEMPTS).contains(&attempts) {
                    return Err(ConfigError::InvalidValue(
                        MAX_ATTEMPTS_VAR,
                        format!("{attempts} is outside 1..={MAX_CONFIGURED_ATTEMPTS}"),
                    ));
                }
                attempts
            }
            None => defaults.retry.max_attempts(),
        };

        let base_delay = match lookup(RETRY_BASE_MS_VAR) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidValue(RETRY_BASE_MS_VAR, raw.clone()))?,
            None => defaults.retry.base_delay(),
        };

        let log_level = lookup(LOG_LEVEL_VAR)
            .map(|level| level.trim().to_string())
            .filter(|level| !level.is_empty())
            .unwrap_or(defaults.log_level);

        let log_format = match lookup(LOG_FORMAT_VAR) {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| ConfigError::InvalidValue(LOG_FORMAT_VAR, e))?,
            None => defaults.log_format,
        };

        Ok(Self {
            retry: RetryPolicy::new(max_attempts, base_delay),
            log_level,
            log_format,
        })
    }
}
