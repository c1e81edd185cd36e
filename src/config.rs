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

//! Service configuration.
//!
//! Loaded from `LEDGER_*` environment variables (a `.env` file is honoured)
//! with defaults for everything:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `LEDGER_API_HOST` | `0.0.0.0` |
//! | `LEDGER_API_PORT` | `8080` |
//! | `LEDGER_JOURNAL_PATH` | unset (in-memory journal) |
//! | `LEDGER_MAX_RETRIES` | `5` |
//! | `LEDGER_BACKOFF_BASE_MS` | `50` |
//! | `LEDGER_BACKOFF_CAP_MS` | `2000` |
//! | `LEDGER_CORRELATION_RETENTION` | `1024` |
//! | `LEDGER_RESUME_INTERVAL_MS` | `1000` |
//! | `LEDGER_IN_FLIGHT_WAIT_MS` | `2000` |
//! | `LEDGER_OVERDRAFT_ACCOUNTS` | empty, comma separated account ids |

use crate::base::AccountId;
use crate::retry::RetryPolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {key}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub reason: String,
}

/// Full service configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub api: ApiConfig,
    pub ledger: LedgerConfig,
}

/// HTTP listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// File journal location; `None` keeps the journal in memory.
    pub journal_path: Option<PathBuf>,
    pub retry: RetryPolicy,
    /// Applied correlation ids remembered per account.
    pub correlation_retention: usize,
    /// How often the server re-drives parked transfers.
    pub resume_interval: Duration,
    /// How long a duplicate submission waits for an in-flight transfer.
    pub in_flight_wait: Duration,
    /// Accounts opened with overdraft when created by their first credit.
    pub overdraft_accounts: Vec<AccountId>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            journal_path: None,
            retry: RetryPolicy::default(),
            correlation_retention: 1024,
            resume_interval: Duration::from_secs(1),
            in_flight_wait: Duration::from_secs(2),
            overdraft_accounts: Vec::new(),
        }
    }
}

impl LedgerConfig {
    /// Fast settings for tests: short backoff, no journal file.
    pub fn test() -> Self {
        Self {
            retry: RetryPolicy {
                max_retries: 3,
                backoff_base: Duration::from_millis(1),
                backoff_cap: Duration::from_millis(4),
            },
            resume_interval: Duration::from_millis(20),
            in_flight_wait: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

impl Config {
    /// Loads configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();

        let defaults = LedgerConfig::default();
        let api = ApiConfig {
            host: env::var("LEDGER_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env("LEDGER_API_PORT", 8080)?,
        };

        let retry = RetryPolicy {
            max_retries: parse_env("LEDGER_MAX_RETRIES", defaults.retry.max_retries)?,
            backoff_base: millis_env("LEDGER_BACKOFF_BASE_MS", defaults.retry.backoff_base)?,
            backoff_cap: millis_env("LEDGER_BACKOFF_CAP_MS", defaults.retry.backoff_cap)?,
        };

        let correlation_retention =
            parse_env("LEDGER_CORRELATION_RETENTION", defaults.correlation_retention)?;
        if correlation_retention == 0 {
            return Err(ConfigError {
                key: "LEDGER_CORRELATION_RETENTION".into(),
                reason: "must be at least 1".into(),
            });
        }

        let ledger = LedgerConfig {
            journal_path: env::var("LEDGER_JOURNAL_PATH")
                .ok()
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
            retry,
            correlation_retention,
            resume_interval: millis_env("LEDGER_RESUME_INTERVAL_MS", defaults.resume_interval)?,
            in_flight_wait: millis_env("LEDGER_IN_FLIGHT_WAIT_MS", defaults.in_flight_wait)?,
            overdraft_accounts: parse_accounts(
                "LEDGER_OVERDRAFT_ACCOUNTS",
                &env::var("LEDGER_OVERDRAFT_ACCOUNTS").unwrap_or_default(),
            )?,
        };

        Ok(Self { api, ledger })
    }

    /// Test configuration: loopback with an OS-assigned port.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            ledger: LedgerConfig::test(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError {
            key: key.to_string(),
            reason: format!("cannot parse {value:?}"),
        }),
        Err(_) => Ok(default),
    }
}

fn millis_env(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let millis = parse_env(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

fn parse_accounts(key: &str, value: &str) -> Result<Vec<AccountId>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            AccountId::parse(id).map_err(|err| ConfigError {
                key: key.to_string(),
                reason: err.to_string(),
            })
        })
        .collect()
}
