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

//! Error types for ledger operations.
//!
//! Errors fall in four classes:
//!
//! | Class | Variants | Retried |
//! |-------|----------|---------|
//! | Validation | [`LedgerError::Validation`] | never, rejected before any durable step |
//! | Business | `InsufficientFunds`, `AccountNotFound`, `AccountClosed`, ... | never |
//! | Transient | [`LedgerError::Transient`] | yes, with backoff |
//! | Irrecoverable | [`LedgerError::Irrecoverable`] | no, retry budget spent |

use crate::base::{AccountId, HoldId, IdempotencyKey, MinorUnits, TransferId};
use crate::journal::JournalError;
use thiserror::Error;

/// Ledger processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed request input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Debit or hold would take the available balance below zero
    #[error(
        "insufficient funds in account {account}: available {available}, requested {requested}"
    )]
    InsufficientFunds {
        account: AccountId,
        available: MinorUnits,
        requested: MinorUnits,
    },

    /// Operation addressed an account that was never opened
    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    /// Account was explicitly opened twice
    #[error("account {0} already exists")]
    AccountExists(AccountId),

    /// Account is closed
    #[error("account {0} is closed")]
    AccountClosed(AccountId),

    /// Close requested on an account that still holds money
    #[error("account {account} cannot be closed with balance {balance} and {held} held")]
    NonZeroBalance {
        account: AccountId,
        balance: MinorUnits,
        held: MinorUnits,
    },

    /// Referenced hold does not exist (or was already released)
    #[error("hold {hold} not found on account {account}")]
    HoldNotFound { account: AccountId, hold: HoldId },

    /// Hold id already in use on the account
    #[error("hold {hold} already exists on account {account}")]
    HoldExists { account: AccountId, hold: HoldId },

    /// No transfer was ever submitted under the key
    #[error("no transfer with idempotency key {0}")]
    TransferNotFound(IdempotencyKey),

    /// Infrastructure failure, safe to retry
    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    /// Retry budget exhausted for a transient failure
    #[error("gave up after {attempts} attempts: {last_error}")]
    Irrecoverable { attempts: u32, last_error: String },

    /// Transfer was admitted but has not reached a terminal state yet
    #[error("transfer {0} is still in flight")]
    InFlight(TransferId),
}

impl LedgerError {
    /// Whether the failure may succeed if the same call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

impl From<JournalError> for LedgerError {
    fn from(err: JournalError) -> Self {
        LedgerError::Transient(err.to_string())
    }
}
