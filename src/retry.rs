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

//! Bounded exponential backoff for transient failures.

use crate::LedgerError;
use std::time::Duration;
use tracing::warn;

/// Retry budget for one workflow step.
///
/// A step is attempted at most `max_retries + 1` times. The delay before
/// retry `n` (0-based) is `min(backoff_cap, backoff_base * 2^n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits; used where retries must not slow a caller down.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff_base: Duration::ZERO,
            backoff_cap: Duration::ZERO,
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
        }
    }

    /// Runs `step` until it succeeds, fails with a non-transient error, or
    /// the budget is spent.
    ///
    /// # Errors
    ///
    /// Non-transient errors are returned as they are. A transient error on
    /// the last attempt becomes [`LedgerError::Irrecoverable`].
    pub async fn run<T, F>(&self, step: &str, mut op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Result<T, LedgerError>,
    {
        let mut backoff = self.backoff();
        loop {
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        step,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        step,
                        attempts = backoff.attempts(),
                        error = %err,
                        "retry budget exhausted"
                    );
                    return Err(LedgerError::Irrecoverable {
                        attempts: backoff.attempts(),
                        last_error: err.to_string(),
                    });
                }
            }
        }
    }
}

/// Retry state of a single step.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    /// Records a failed attempt and returns the wait before the next one,
    /// or `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let retry = self.attempts;
        self.attempts += 1;
        (retry < self.policy.max_retries).then(|| self.policy.delay(retry))
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
