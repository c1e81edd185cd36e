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

//! Transfer records and plans.
//!
//! A transfer moves money along one or more legs. Its request expands into
//! an ordered list of [`TransferStep`]s (a debit then a credit per leg, plus
//! hold releases for a transactional transfer) and the record tracks how
//! far along that list it got:
//! - [`Pending`] → [`Debited`] (first step applied) or [`Failed`] (first step refused)
//! - [`Debited`] → [`Debited`] (another step applied), [`Committed`] (last step
//!   applied) or [`Compensating`] (a later step refused)
//! - [`Compensating`] → [`Compensating`] (one step undone) or [`Compensated`]
//!   (every applied step undone)
//!
//! [`Pending`]: TransferStatus::Pending
//! [`Debited`]: TransferStatus::Debited
//! [`Failed`]: TransferStatus::Failed
//! [`Committed`]: TransferStatus::Committed
//! [`Compensating`]: TransferStatus::Compensating
//! [`Compensated`]: TransferStatus::Compensated

use crate::LedgerError;
use crate::account::Operation;
use crate::base::{AccountId, CorrelationId, HoldId, IdempotencyKey, MinorUnits, TransferId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    Debited,
    Committed,
    Compensating,
    Compensated,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Compensated | Self::Failed)
    }

    fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Debited)
                | (Self::Pending, Self::Failed)
                | (Self::Debited, Self::Debited)
                | (Self::Debited, Self::Committed)
                | (Self::Debited, Self::Compensating)
                | (Self::Compensating, Self::Compensating)
                | (Self::Compensating, Self::Compensated)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Debited => "DEBITED",
            Self::Committed => "COMMITTED",
            Self::Compensating => "COMPENSATING",
            Self::Compensated => "COMPENSATED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// One movement of money between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeg {
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: MinorUnits,
    /// Debit the source through this hold rather than its available balance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hold: Option<HoldId>,
}

impl TransferLeg {
    pub fn new(from_account: AccountId, to_account: AccountId, amount: MinorUnits) -> Self {
        Self {
            from_account,
            to_account,
            amount,
            source_hold: None,
        }
    }

    pub fn with_source_hold(mut self, hold: HoldId) -> Self {
        self.source_hold = Some(hold);
        self
    }
}

/// What the client asked to move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Applied in order.
    pub legs: Vec<TransferLeg>,
    /// Credited funds stay held until every leg is applied, so a later leg
    /// can only spend what earlier legs of this transfer brought in.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub transactional: bool,
}

impl TransferRequest {
    /// A single-leg transfer.
    pub fn new(from_account: AccountId, to_account: AccountId, amount: MinorUnits) -> Self {
        Self::bulk(vec![TransferLeg::new(from_account, to_account, amount)])
    }

    /// Legs applied one after another; the ones already applied are taken
    /// back in reverse order when a later one is refused.
    pub fn bulk(legs: Vec<TransferLeg>) -> Self {
        Self {
            legs,
            transactional: false,
        }
    }

    /// Like [`TransferRequest::bulk`], with every credit held under the
    /// transfer's hold until the last leg is applied.
    pub fn transactional_bulk(legs: Vec<TransferLeg>) -> Self {
        Self {
            legs,
            transactional: true,
        }
    }

    /// Debits the source of the last leg through `hold`.
    pub fn with_source_hold(mut self, hold: HoldId) -> Self {
        if let Some(leg) = self.legs.last_mut() {
            leg.source_hold = Some(hold);
        }
        self
    }

    /// Checks the request before any durable step is taken.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.legs.is_empty() {
            return Err(LedgerError::Validation(
                "transfer needs at least one leg".into(),
            ));
        }
        for leg in &self.legs {
            if leg.amount <= 0 {
                return Err(LedgerError::Validation(format!(
                    "amount must be positive, got {}",
                    leg.amount
                )));
            }
            if leg.from_account == leg.to_account {
                return Err(LedgerError::Validation(format!(
                    "source and destination are both {}",
                    leg.from_account
                )));
            }
        }
        Ok(())
    }

    /// Expands the request into the account operations of transfer `transfer_id`.
    pub fn plan(&self, transfer_id: TransferId) -> Vec<TransferStep> {
        let single = self.legs.len() == 1;
        let correlation = |index: usize| {
            if single {
                CorrelationId::for_transfer(transfer_id)
            } else {
                CorrelationId::for_step(transfer_id, index)
            }
        };
        let tx_hold = self.transactional.then(|| HoldId::for_transfer(transfer_id));

        let mut steps = Vec::with_capacity(self.legs.len() * 2);
        let mut credited: Vec<&AccountId> = Vec::new();
        for leg in &self.legs {
            let hold = match (&leg.source_hold, &tx_hold) {
                (Some(hold), _) => Some(hold.clone()),
                (None, Some(tx)) if credited.contains(&&leg.from_account) => Some(tx.clone()),
                _ => None,
            };
            steps.push(TransferStep {
                account: leg.from_account.clone(),
                operation: Operation::Debit {
                    amount: leg.amount,
                    hold,
                },
                correlation: correlation(steps.len()),
                cleanup: false,
            });
            steps.push(TransferStep {
                account: leg.to_account.clone(),
                operation: Operation::Credit {
                    amount: leg.amount,
                    hold: tx_hold.clone(),
                },
                correlation: correlation(steps.len()),
                cleanup: false,
            });
            if !credited.contains(&&leg.to_account) {
                credited.push(&leg.to_account);
            }
        }

        if let Some(tx) = tx_hold {
            let release = CorrelationId::new(format!("{transfer_id}:release"));
            for account in credited {
                steps.push(TransferStep {
                    account: account.clone(),
                    operation: Operation::ReleaseHold { hold: tx.clone() },
                    correlation: release.clone(),
                    cleanup: true,
                });
            }
        }
        steps
    }
}

/// One account operation of a transfer plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStep {
    pub account: AccountId,
    pub operation: Operation,
    pub correlation: CorrelationId,
    /// Releases a transaction hold. Runs after every other step and is never
    /// taken back.
    pub cleanup: bool,
}

impl TransferStep {
    /// The step that takes this one back, if there is one.
    pub fn undo(&self) -> Option<TransferStep> {
        let operation = match &self.operation {
            Operation::Debit { amount, hold } => Operation::Reverse {
                amount: *amount,
                hold: hold.clone(),
            },
            Operation::Credit { amount, hold } => Operation::Debit {
                amount: *amount,
                hold: hold.clone(),
            },
            _ => return None,
        };
        Some(TransferStep {
            account: self.account.clone(),
            operation,
            correlation: self.correlation.compensating(),
            cleanup: false,
        })
    }
}

/// Durable state of one transfer, keyed by its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: TransferId,
    pub idempotency_key: IdempotencyKey,
    pub request: TransferRequest,
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Plan steps applied so far.
    #[serde(default)]
    pub progress: usize,
    /// Applied steps taken back so far, counted from the last one.
    #[serde(default)]
    pub undone: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    pub fn new(idempotency_key: IdempotencyKey, request: TransferRequest) -> Self {
        Self {
            transfer_id: TransferId::new(),
            idempotency_key,
            request,
            status: TransferStatus::Pending,
            reason: None,
            progress: 0,
            undone: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn steps(&self) -> Vec<TransferStep> {
        self.request.plan(self.transfer_id)
    }

    /// Returns a copy of the record moved to `next`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Validation`] for a transition the state machine does
    /// not allow.
    pub fn advanced(
        &self,
        next: TransferStatus,
        reason: Option<String>,
    ) -> Result<Self, LedgerError> {
        if !self.status.can_advance_to(next) {
            return Err(LedgerError::Validation(format!(
                "transfer {} cannot move from {} to {next}",
                self.transfer_id, self.status
            )));
        }
        let mut record = self.clone();
        record.status = next;
        if reason.is_some() {
            record.reason = reason;
        }
        if next.is_terminal() {
            record.completed_at = Some(Utc::now());
        }
        Ok(record)
    }

    pub fn outcome(&self) -> TransferOutcome {
        TransferOutcome {
            transfer_id: self.transfer_id,
            status: self.status,
            reason: self.reason.clone(),
        }
    }
}

/// Result reported to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    pub transfer_id: TransferId,
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
