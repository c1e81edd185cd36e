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

//! Ledger engine.
//!
//! The [`Engine`] wires the journal, the account registry, the idempotency
//! guard and the transfer workflow together.
//!
//! # Transfers
//!
//! [`Engine::transfer`] validates the request, admits it through the
//! [`IdempotencyGuard`] and runs the saga on its own task, so a caller that
//! goes away does not cancel a half-finished transfer.
//!
//! # Recovery
//!
//! [`Engine::with_journal`] replays the journal: account facts rebuild the
//! registry, transfer records rebuild the idempotency table, and every
//! transfer that is not terminal is queued. [`Engine::resume_pending`] drives
//! the queue; the server calls it at startup and then periodically.

use crate::LedgerError;
use crate::base::IdempotencyKey;
use crate::config::LedgerConfig;
use crate::idempotency::{Admission, IdempotencyGuard};
use crate::journal::{Journal, JournalEntry, JournalError, MemoryJournal};
use crate::registry::AccountRegistry;
use crate::transfer::{TransferOutcome, TransferRecord, TransferRequest};
use crate::workflow::TransferWorkflow;
use crossbeam::queue::SegQueue;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Ledger engine.
///
/// # Invariants
///
/// - Every state change is journaled before it is visible in memory.
/// - Each idempotency key yields at most one transfer with economic effect.
/// - A transfer that is not terminal is either running or queued for
///   [`Engine::resume_pending`].
pub struct Engine {
    config: LedgerConfig,
    accounts: Arc<AccountRegistry>,
    guard: Arc<IdempotencyGuard>,
    workflow: Arc<TransferWorkflow>,
    /// Keys of transfers waiting to be driven again.
    pending: Arc<SegQueue<IdempotencyKey>>,
}

impl Engine {
    /// Creates an engine with an in-memory journal.
    pub fn new(config: LedgerConfig) -> Self {
        Self::build(config, Arc::new(MemoryJournal::new()))
    }

    /// Creates an engine on top of `journal`, recovering everything in it.
    ///
    /// # Errors
    ///
    /// Fails if the journal cannot be read or its entries do not replay
    /// cleanly.
    pub fn with_journal(
        config: LedgerConfig,
        journal: Arc<dyn Journal>,
    ) -> Result<Self, LedgerError> {
        let entries = journal.replay()?;
        let engine = Self::build(config, journal);
        engine.recover(&entries)?;
        Ok(engine)
    }

    fn build(config: LedgerConfig, journal: Arc<dyn Journal>) -> Self {
        let accounts = Arc::new(AccountRegistry::new(
            Arc::clone(&journal),
            config.correlation_retention,
            config.overdraft_accounts.iter().cloned(),
        ));
        let guard = Arc::new(IdempotencyGuard::new(journal));
        let workflow = Arc::new(TransferWorkflow::new(
            Arc::clone(&accounts),
            Arc::clone(&guard),
            config.retry,
        ));
        Self {
            config,
            accounts,
            guard,
            workflow,
            pending: Arc::new(SegQueue::new()),
        }
    }

    fn recover(&self, entries: &[JournalEntry]) -> Result<(), LedgerError> {
        for (index, entry) in entries.iter().enumerate() {
            let restored = match entry {
                JournalEntry::Transfer(record) => {
                    self.guard.restore(record.clone());
                    Ok(())
                }
                other => self.accounts.restore(other),
            };
            restored.map_err(|err| JournalError::Corrupt {
                line: index + 1,
                reason: err.to_string(),
            })?;
        }

        let unfinished = self.guard.unfinished();
        for record in &unfinished {
            self.pending.push(record.idempotency_key.clone());
        }
        info!(
            entries = entries.len(),
            accounts = self.accounts.len(),
            transfers = self.guard.len(),
            pending = unfinished.len(),
            "journal recovered"
        );
        Ok(())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Account operations.
    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    /// Applies every leg of `request` at most once per `key`, or none of them.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] for a malformed request or a key reused
    ///   with a different request.
    /// - [`LedgerError::Transient`] if the transfer could not be admitted.
    /// - [`LedgerError::InFlight`] if the transfer is still running; asking
    ///   again with the same key returns the outcome once it is known.
    pub async fn transfer(
        &self,
        key: IdempotencyKey,
        request: TransferRequest,
    ) -> Result<TransferOutcome, LedgerError> {
        request.validate()?;

        match self.guard.begin(&key, &request)? {
            Admission::Duplicate(outcome) => Ok(outcome),
            Admission::InFlight(waiter) => {
                let transfer_id = waiter.transfer_id();
                match tokio::time::timeout(self.config.in_flight_wait, waiter.wait()).await {
                    Ok(Some(outcome)) => Ok(outcome),
                    _ => Err(LedgerError::InFlight(transfer_id)),
                }
            }
            Admission::Fresh(ticket) => self.drive(ticket.into_record()).await,
        }
    }

    async fn drive(&self, record: TransferRecord) -> Result<TransferOutcome, LedgerError> {
        let transfer_id = record.transfer_id;
        let workflow = Arc::clone(&self.workflow);
        let pending = Arc::clone(&self.pending);

        let task = tokio::spawn(async move {
            let key = record.idempotency_key.clone();
            let result = workflow.run(record).await;
            if let Err(err) = &result {
                warn!(transfer = %transfer_id, error = %err, "transfer parked for recovery");
                pending.push(key);
            }
            result
        });

        match task.await {
            Ok(Ok(record)) => Ok(record.outcome()),
            Ok(Err(_)) => Err(LedgerError::InFlight(transfer_id)),
            Err(err) => {
                error!(transfer = %transfer_id, error = %err, "transfer task aborted");
                Err(LedgerError::InFlight(transfer_id))
            }
        }
    }

    /// Latest record for an idempotency key.
    pub fn transfer_record(&self, key: &IdempotencyKey) -> Option<TransferRecord> {
        self.guard.get(key)
    }

    /// Drives every queued transfer once. Returns how many reached a terminal state.
    ///
    /// Transfers that fail again are queued for the next call.
    pub async fn resume_pending(&self) -> usize {
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        while let Some(key) = self.pending.pop() {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        let mut resumed = 0;
        for key in keys {
            let Some(record) = self.guard.get(&key) else {
                continue;
            };
            if record.status.is_terminal() {
                continue;
            }

            let transfer_id = record.transfer_id;
            match self.workflow.run(record).await {
                Ok(done) => {
                    info!(transfer = %transfer_id, status = %done.status, "transfer resumed");
                    resumed += 1;
                }
                Err(err) => {
                    warn!(transfer = %transfer_id, error = %err, "transfer still pending");
                    self.pending.push(key);
                }
            }
        }
        resumed
    }

    /// Number of transfers waiting for [`Engine::resume_pending`].
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}
