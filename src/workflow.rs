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

//! Transfer saga.
//!
//! [`TransferWorkflow::run`] drives a [`TransferRecord`] through the steps of
//! its plan, starting from whatever state it was last journaled in:
//!
//! | From | Step | Success | Refused / budget spent |
//! |------|------|---------|------------------------|
//! | PENDING | first debit | DEBITED | FAILED |
//! | DEBITED | next step | DEBITED, COMMITTED after the last | COMPENSATING |
//! | COMPENSATING | undo last applied | COMPENSATING, COMPENSATED after the first | parked |
//!
//! Every transition is journaled after its step, and COMPENSATING is
//! journaled before the first undo, so recovery never re-runs a forward step
//! that is already being taken back. Steps and undos carry fixed correlation
//! ids, so re-running one after a crash never applies it twice. No account
//! lock is held while the workflow waits.

use crate::LedgerError;
use crate::idempotency::IdempotencyGuard;
use crate::registry::AccountRegistry;
use crate::retry::RetryPolicy;
use crate::transfer::{TransferRecord, TransferStatus, TransferStep};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TransferWorkflow {
    accounts: Arc<AccountRegistry>,
    guard: Arc<IdempotencyGuard>,
    retry: RetryPolicy,
}

impl TransferWorkflow {
    pub fn new(
        accounts: Arc<AccountRegistry>,
        guard: Arc<IdempotencyGuard>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            accounts,
            guard,
            retry,
        }
    }

    /// Drives `record` to a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error when a transition, a hold release or an undo could
    /// not be made durable within the retry budget. The record is then left
    /// in its last journaled state and must be run again later.
    pub async fn run(&self, mut record: TransferRecord) -> Result<TransferRecord, LedgerError> {
        let steps = record.steps();
        loop {
            record = match record.status {
                TransferStatus::Pending | TransferStatus::Debited => {
                    self.forward(&record, &steps).await?
                }
                TransferStatus::Compensating => self.compensate(&record, &steps).await?,
                _ => return Ok(record),
            };
        }
    }

    /// Applies the next step of the plan.
    async fn forward(
        &self,
        record: &TransferRecord,
        steps: &[TransferStep],
    ) -> Result<TransferRecord, LedgerError> {
        let step = step_at(record, steps, record.progress)?;
        let result = self
            .retry
            .run("step", || {
                self.accounts
                    .apply(&step.account, step.operation.clone(), &step.correlation)
            })
            .await;

        let err = match result {
            Ok(receipt) => {
                debug!(
                    transfer = %record.transfer_id,
                    step = record.progress,
                    account = %step.account,
                    operation = ?step.operation.kind(),
                    balance = receipt.balance,
                    "step applied"
                );
                return self.stepped(record, steps.len()).await;
            }
            // A transaction hold fully spent by a later leg is already gone.
            Err(LedgerError::HoldNotFound { .. }) if step.cleanup => {
                return self.stepped(record, steps.len()).await;
            }
            Err(err) if step.cleanup => return Err(err),
            Err(err) => err,
        };

        let next = if record.progress == 0 {
            warn!(transfer = %record.transfer_id, error = %err, "transfer failed");
            record.advanced(TransferStatus::Failed, Some(err.to_string()))?
        } else {
            warn!(
                transfer = %record.transfer_id,
                step = record.progress,
                account = %step.account,
                error = %err,
                "step refused, compensating"
            );
            record.advanced(TransferStatus::Compensating, Some(err.to_string()))?
        };
        self.persist(&next).await?;
        Ok(next)
    }

    async fn stepped(
        &self,
        record: &TransferRecord,
        total: usize,
    ) -> Result<TransferRecord, LedgerError> {
        let status = if record.progress + 1 == total {
            TransferStatus::Committed
        } else {
            TransferStatus::Debited
        };
        let mut next = record.advanced(status, None)?;
        next.progress += 1;
        self.persist(&next).await?;
        if status == TransferStatus::Committed {
            info!(transfer = %record.transfer_id, steps = total, "transfer committed");
        }
        Ok(next)
    }

    /// Takes back the last applied step that is not undone yet.
    async fn compensate(
        &self,
        record: &TransferRecord,
        steps: &[TransferStep],
    ) -> Result<TransferRecord, LedgerError> {
        let remaining = record.progress.saturating_sub(record.undone);
        if remaining > 0 {
            let step = step_at(record, steps, remaining - 1)?;
            if let Some(undo) = step.undo() {
                self.retry
                    .run("compensate", || {
                        self.accounts
                            .apply(&undo.account, undo.operation.clone(), &undo.correlation)
                    })
                    .await?;
                debug!(
                    transfer = %record.transfer_id,
                    step = remaining - 1,
                    account = %undo.account,
                    "step undone"
                );
            }
        }

        let status = if remaining <= 1 {
            TransferStatus::Compensated
        } else {
            TransferStatus::Compensating
        };
        let mut next = record.advanced(status, None)?;
        next.undone = record.progress.min(record.undone + 1);
        self.persist(&next).await?;
        if status == TransferStatus::Compensated {
            info!(transfer = %record.transfer_id, "transfer compensated");
        }
        Ok(next)
    }

    async fn persist(&self, record: &TransferRecord) -> Result<(), LedgerError> {
        if record.status.is_terminal() {
            self.retry.run("complete", || self.guard.complete(record)).await
        } else {
            self.retry.run("checkpoint", || self.guard.checkpoint(record)).await
        }
    }
}

fn step_at<'a>(
    record: &TransferRecord,
    steps: &'a [TransferStep],
    index: usize,
) -> Result<&'a TransferStep, LedgerError> {
    steps.get(index).ok_or_else(|| {
        LedgerError::Validation(format!(
            "transfer {} has no step {index} in a plan of {}",
            record.transfer_id,
            steps.len()
        ))
    })
}
