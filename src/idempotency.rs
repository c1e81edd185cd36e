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

//! Transfer deduplication by idempotency key.
//!
//! The guard owns the durable [`TransferRecord`] of every key it has seen.
//! Admission uses the [`DashMap`] entry API, so concurrent submissions of
//! one key serialize on that key's map entry and exactly one of them is
//! admitted as [`Admission::Fresh`].

use crate::LedgerError;
use crate::base::{IdempotencyKey, TransferId};
use crate::journal::{Journal, JournalEntry};
use crate::transfer::{TransferOutcome, TransferRecord, TransferRequest};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Answer to [`IdempotencyGuard::begin`].
#[derive(Debug)]
pub enum Admission {
    /// First sighting of the key. The caller owns the transfer and must drive it.
    Fresh(Ticket),
    /// The key already reached a terminal state.
    Duplicate(TransferOutcome),
    /// Another caller is driving the transfer.
    InFlight(Waiter),
}

/// Permission to run a freshly admitted transfer.
#[derive(Debug)]
pub struct Ticket {
    record: TransferRecord,
}

impl Ticket {
    pub fn record(&self) -> &TransferRecord {
        &self.record
    }

    pub fn into_record(self) -> TransferRecord {
        self.record
    }
}

/// Resolves when an in-flight transfer records its outcome.
#[derive(Debug)]
pub struct Waiter {
    transfer_id: TransferId,
    outcome: watch::Receiver<Option<TransferOutcome>>,
}

impl Waiter {
    pub fn transfer_id(&self) -> TransferId {
        self.transfer_id
    }

    /// Waits for the terminal outcome. Returns `None` if the guard is dropped first.
    pub async fn wait(mut self) -> Option<TransferOutcome> {
        self.outcome
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| outcome.clone())
    }
}

#[derive(Debug)]
enum Slot {
    Running {
        record: TransferRecord,
        done: watch::Sender<Option<TransferOutcome>>,
    },
    Done(TransferRecord),
}

impl Slot {
    fn running(record: TransferRecord) -> Self {
        let (done, _) = watch::channel(None);
        Slot::Running { record, done }
    }

    fn record(&self) -> &TransferRecord {
        match self {
            Slot::Running { record, .. } | Slot::Done(record) => record,
        }
    }
}

/// Idempotency table of transfers.
pub struct IdempotencyGuard {
    slots: DashMap<IdempotencyKey, Slot>,
    journal: Arc<dyn Journal>,
}

impl IdempotencyGuard {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        Self {
            slots: DashMap::new(),
            journal,
        }
    }

    /// Admits a transfer request under `key`.
    ///
    /// A fresh key gets a PENDING record, journaled before this returns.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Validation`] if `key` was used for a different request.
    /// - [`LedgerError::Transient`] if the PENDING record could not be journaled.
    pub fn begin(
        &self,
        key: &IdempotencyKey,
        request: &TransferRequest,
    ) -> Result<Admission, LedgerError> {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let slot = entry.get();
                if slot.record().request != *request {
                    return Err(LedgerError::Validation(format!(
                        "idempotency key {key} was already used for a different transfer"
                    )));
                }
                Ok(match slot {
                    Slot::Done(record) => Admission::Duplicate(record.outcome()),
                    Slot::Running { record, done } => Admission::InFlight(Waiter {
                        transfer_id: record.transfer_id,
                        outcome: done.subscribe(),
                    }),
                })
            }
            Entry::Vacant(entry) => {
                let record = TransferRecord::new(key.clone(), request.clone());
                self.journal.append(&JournalEntry::Transfer(record.clone()))?;
                debug!(key = %key, transfer = %record.transfer_id, "transfer admitted");
                entry.insert(Slot::running(record.clone()));
                Ok(Admission::Fresh(Ticket { record }))
            }
        }
    }

    /// Journals an intermediate transition.
    pub fn checkpoint(&self, record: &TransferRecord) -> Result<(), LedgerError> {
        self.journal.append(&JournalEntry::Transfer(record.clone()))?;
        if let Some(mut slot) = self.slots.get_mut(&record.idempotency_key) {
            if let Slot::Running { record: current, .. } = slot.value_mut() {
                *current = record.clone();
            }
        }
        Ok(())
    }

    /// Journals the terminal record, stores its outcome and wakes waiters.
    pub fn complete(&self, record: &TransferRecord) -> Result<(), LedgerError> {
        debug_assert!(record.status.is_terminal());
        self.journal.append(&JournalEntry::Transfer(record.clone()))?;

        let previous = self
            .slots
            .insert(record.idempotency_key.clone(), Slot::Done(record.clone()));
        if let Some(Slot::Running { done, .. }) = previous {
            done.send_replace(Some(record.outcome()));
        }
        Ok(())
    }

    /// Latest durable record for `key`.
    pub fn get(&self, key: &IdempotencyKey) -> Option<TransferRecord> {
        self.slots.get(key).map(|slot| slot.record().clone())
    }

    /// Records that have not reached a terminal state.
    pub fn unfinished(&self) -> Vec<TransferRecord> {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Running { .. }))
            .map(|slot| slot.record().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Applies a journaled record during recovery. Later records replace earlier ones.
    pub(crate) fn restore(&self, record: TransferRecord) {
        let key = record.idempotency_key.clone();
        let slot = if record.status.is_terminal() {
            Slot::Done(record)
        } else {
            Slot::running(record)
        };
        self.slots.insert(key, slot);
    }
}
