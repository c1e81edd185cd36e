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

//! Core identifier types for accounts, transfers, holds and correlations.
//!
//! Amounts are plain `i64` minor units (cents for USD); there is no floating
//! point anywhere in the ledger.

use crate::LedgerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Amount of money in minor units.
pub type MinorUnits = i64;

const MAX_ACCOUNT_ID_LEN: usize = 64;
const MAX_KEY_LEN: usize = 128;

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

fn check_token(kind: &str, value: &str, max_len: usize) -> Result<(), LedgerError> {
    if value.is_empty() {
        return Err(LedgerError::Validation(format!("{kind} must not be empty")));
    }
    if value.len() > max_len {
        return Err(LedgerError::Validation(format!(
            "{kind} exceeds {max_len} characters"
        )));
    }
    if !value.chars().all(is_id_char) {
        return Err(LedgerError::Validation(format!(
            "{kind} contains invalid characters: {value:?}"
        )));
    }
    Ok(())
}

/// Unique identifier for an account.
///
/// Opaque to the ledger. Well-formed ids are 1 to 64 ASCII alphanumerics,
/// `-`, `_`, `.` or `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        check_token("account id", &value, MAX_ACCOUNT_ID_LEN)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-supplied token naming one logical transfer intent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        check_token("idempotency key", &value, MAX_KEY_LEN)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned to a transfer when its idempotency key is first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a hold (reservation) on an account's balance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct HoldId(String);

impl HoldId {
    pub fn parse(value: impl Into<String>) -> Result<Self, LedgerError> {
        let value = value.into();
        check_token("hold id", &value, MAX_KEY_LEN)?;
        Ok(Self(value))
    }

    /// Hold that keeps funds credited by a transactional transfer until it finishes.
    pub fn for_transfer(transfer_id: TransferId) -> Self {
        Self(format!("tx:{transfer_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HoldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deduplication token for a single account operation.
///
/// An account applies each correlation id at most once; a repeated call
/// returns the receipt of the first application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Correlation used by both the debit and the credit step of a
    /// single-leg transfer.
    pub fn for_transfer(transfer_id: TransferId) -> Self {
        Self(transfer_id.to_string())
    }

    /// Correlation of step `index` of a multi-leg transfer.
    pub fn for_step(transfer_id: TransferId, index: usize) -> Self {
        Self(format!("{transfer_id}:{index}"))
    }

    /// Correlation of the operation that takes this one back.
    pub fn compensating(&self) -> Self {
        Self(format!("{}:compensate", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
