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

//! # Durable Ledger
//!
//! A crash-safe ledger: money moves between keyed accounts exactly once per
//! client request, and every step is journaled so an interrupted transfer
//! finishes (or is compensated) after a restart.
//!
//! ## Core Components
//!
//! - [`AccountObject`]: single-writer account with credit, debit, holds and
//!   correlation-id deduplication
//! - [`AccountRegistry`]: accounts keyed by id, opened on first credit
//! - [`TransferWorkflow`]: step-by-step saga over one or more legs, undone in
//!   reverse order when a step is refused
//! - [`IdempotencyGuard`]: one transfer per client idempotency key
//! - [`Engine`]: wires the above to a [`Journal`] and recovers from it
//! - [`LedgerGateway`]: HTTP surface
//!
//! ## Example
//!
//! ```
//! use durable_ledger::{
//!     AccountId, CorrelationId, Engine, IdempotencyKey, LedgerConfig, TransferRequest,
//!     TransferStatus,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = Engine::new(LedgerConfig::test());
//! let alice = AccountId::parse("alice").unwrap();
//! let bob = AccountId::parse("bob").unwrap();
//!
//! engine.accounts().credit(&alice, 100, &CorrelationId::new("funding")).unwrap();
//!
//! let key = IdempotencyKey::parse("k1").unwrap();
//! let outcome = engine
//!     .transfer(key, TransferRequest::new(alice.clone(), bob.clone(), 30))
//!     .await
//!     .unwrap();
//!
//! assert_eq!(outcome.status, TransferStatus::Committed);
//! assert_eq!(engine.accounts().get_balance(&alice).unwrap().balance, 70);
//! assert_eq!(engine.accounts().get_balance(&bob).unwrap().balance, 30);
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! Operations on one account are serialized by that account's lock; different
//! accounts proceed in parallel. No lock is held across a workflow step.

pub mod account;
mod base;
pub mod config;
mod engine;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod journal;
pub mod registry;
pub mod retry;
pub mod transfer;
pub mod workflow;

pub use account::{
    AccountObject, AccountOptions, Balance, LedgerEntry, Operation, OperationKind, Receipt,
};
pub use base::{AccountId, CorrelationId, HoldId, IdempotencyKey, MinorUnits, TransferId};
pub use config::{ApiConfig, Config, ConfigError, LedgerConfig};
pub use engine::Engine;
pub use error::LedgerError;
pub use gateway::LedgerGateway;
pub use idempotency::{Admission, IdempotencyGuard};
pub use journal::{FileJournal, Journal, JournalEntry, JournalError, MemoryJournal};
pub use registry::AccountRegistry;
pub use retry::RetryPolicy;
pub use transfer::{
    TransferLeg, TransferOutcome, TransferRecord, TransferRequest, TransferStatus, TransferStep,
};
pub use workflow::TransferWorkflow;
