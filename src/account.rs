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

//! Account objects.
//!
//! An [`AccountObject`] is the single writer of one account's state. Every
//! operation runs under the object's mutex, so operations addressed to the
//! same account never overlap, while different accounts proceed in parallel.
//!
//! Each mutation follows the same three steps:
//!
//! 1. **plan**: validate and compute the next balances without touching state,
//! 2. **journal**: append the operation to the durable journal,
//! 3. **commit**: apply the planned change in memory.
//!
//! A failure in 1 or 2 leaves the account exactly as it was.
//!
//! # Example
//!
//! ```
//! use durable_ledger::{AccountId, AccountObject, AccountOptions, CorrelationId, MemoryJournal};
//!
//! let journal = MemoryJournal::new();
//! let account = AccountObject::new(AccountId::parse("a").unwrap(), AccountOptions::default(), 16);
//!
//! let receipt = account.credit(100, &CorrelationId::new("c1"), &journal).unwrap();
//! assert_eq!(receipt.balance, 100);
//!
//! // Same correlation id: not applied twice.
//! let again = account.credit(100, &CorrelationId::new("c1"), &journal).unwrap();
//! assert_eq!(again, receipt);
//! assert_eq!(account.balance().balance, 100);
//! ```

use crate::LedgerError;
use crate::base::{AccountId, CorrelationId, HoldId, MinorUnits};
use crate::journal::{Journal, JournalEntry};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Per-account configuration fixed at open time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOptions {
    /// Allows the available balance to go below zero on debit.
    #[serde(default)]
    pub overdraft: bool,
}

/// A mutation addressed to one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Credit {
        amount: MinorUnits,
        /// Also reserve the credited funds under this hold, creating it if needed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hold: Option<HoldId>,
    },
    Debit {
        amount: MinorUnits,
        /// Debit the funds reserved by this hold instead of the available balance.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hold: Option<HoldId>,
    },
    /// Compensating credit. Restores funds taken by an earlier debit and is
    /// accepted even by a closed account. With a hold, the funds go back into
    /// that reservation.
    Reverse {
        amount: MinorUnits,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hold: Option<HoldId>,
    },
    Hold {
        hold: HoldId,
        amount: MinorUnits,
    },
    ReleaseHold {
        hold: HoldId,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Credit { .. } => OperationKind::Credit,
            Operation::Debit { .. } => OperationKind::Debit,
            Operation::Reverse { .. } => OperationKind::Reverse,
            Operation::Hold { .. } => OperationKind::Hold,
            Operation::ReleaseHold { .. } => OperationKind::ReleaseHold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Credit,
    Debit,
    Reverse,
    Hold,
    ReleaseHold,
}

/// Outcome of an applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Receipt {
    /// Amount moved by the operation (the released amount for a release).
    pub amount: MinorUnits,
    pub balance: MinorUnits,
    pub held: MinorUnits,
    pub version: u64,
}

/// Consistent read of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub account_id: AccountId,
    pub balance: MinorUnits,
    pub held: MinorUnits,
    pub available: MinorUnits,
    pub version: u64,
    pub overdraft: bool,
    pub closed: bool,
}

/// One line of an account's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub version: u64,
    pub correlation_id: CorrelationId,
    pub operation: OperationKind,
    pub amount: MinorUnits,
    pub balance_after: MinorUnits,
    pub held_after: MinorUnits,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded memory of applied correlation ids, oldest evicted first.
#[derive(Debug)]
struct AppliedLog {
    capacity: usize,
    order: VecDeque<CorrelationId>,
    results: HashMap<CorrelationId, (OperationKind, Receipt)>,
}

impl AppliedLog {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            results: HashMap::new(),
        }
    }

    fn get(&self, correlation: &CorrelationId) -> Option<&(OperationKind, Receipt)> {
        self.results.get(correlation)
    }

    fn record(&mut self, correlation: CorrelationId, kind: OperationKind, receipt: Receipt) {
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.results.remove(&evicted);
            }
        }
        self.order.push_back(correlation.clone());
        self.results.insert(correlation, (kind, receipt));
    }
}

/// Planned next state of an account.
#[derive(Debug)]
struct Change {
    amount: MinorUnits,
    balance: MinorUnits,
    held: MinorUnits,
    /// `Some((hold, None))` removes the hold, `Some((hold, Some(n)))` sets it.
    hold: Option<(HoldId, Option<MinorUnits>)>,
}

#[derive(Debug)]
struct AccountState {
    account_id: AccountId,
    balance: MinorUnits,
    held: MinorUnits,
    version: u64,
    options: AccountOptions,
    closed: bool,
    holds: HashMap<HoldId, MinorUnits>,
    applied: AppliedLog,
    entries: Vec<LedgerEntry>,
}

impl AccountState {
    fn new(account_id: AccountId, options: AccountOptions, retention: usize) -> Self {
        Self {
            account_id,
            balance: 0,
            held: 0,
            version: 0,
            options,
            closed: false,
            holds: HashMap::new(),
            applied: AppliedLog::new(retention),
            entries: Vec::new(),
        }
    }

    /// Never overflows: [`AccountState::change`] rejects any state where it would.
    fn available(&self) -> MinorUnits {
        self.balance - self.held
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.options.overdraft || self.available() >= 0,
            "Invariant violated: available balance went negative: {}",
            self.available()
        );
        debug_assert!(
            self.held == self.holds.values().sum::<MinorUnits>(),
            "Invariant violated: held {} does not match open holds",
            self.held
        );
    }

    fn ensure_open(&self) -> Result<(), LedgerError> {
        if self.closed {
            return Err(LedgerError::AccountClosed(self.account_id.clone()));
        }
        Ok(())
    }

    fn ensure_positive(amount: MinorUnits) -> Result<(), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "amount must be positive, got {amount}"
            )));
        }
        Ok(())
    }

    fn overflow(&self) -> LedgerError {
        LedgerError::Validation(format!("balance of {} would overflow", self.account_id))
    }

    /// Builds a change from checked arithmetic, refusing states whose
    /// available balance is not representable.
    fn change(
        &self,
        amount: MinorUnits,
        balance: Option<MinorUnits>,
        held: Option<MinorUnits>,
        hold: Option<(HoldId, Option<MinorUnits>)>,
    ) -> Result<Change, LedgerError> {
        let (Some(balance), Some(held)) = (balance, held) else {
            return Err(self.overflow());
        };
        if balance.checked_sub(held).is_none() {
            return Err(self.overflow());
        }
        Ok(Change {
            amount,
            balance,
            held,
            hold,
        })
    }

    /// Adds `amount` to the balance, and to `hold` when one is named.
    fn credit_change(
        &self,
        amount: MinorUnits,
        hold: Option<&HoldId>,
    ) -> Result<Change, LedgerError> {
        let balance = self.balance.checked_add(amount);
        match hold {
            None => self.change(amount, balance, Some(self.held), None),
            Some(hold) => {
                let reserved = self.holds.get(hold).copied().unwrap_or(0);
                let reserved = reserved.checked_add(amount).ok_or_else(|| self.overflow())?;
                self.change(
                    amount,
                    balance,
                    self.held.checked_add(amount),
                    Some((hold.clone(), Some(reserved))),
                )
            }
        }
    }

    /// Checks that `amount` can leave the available balance.
    fn ensure_available(&self, amount: MinorUnits) -> Result<(), LedgerError> {
        if !self.options.overdraft && self.available() < amount {
            return Err(LedgerError::InsufficientFunds {
                account: self.account_id.clone(),
                available: self.available(),
                requested: amount,
            });
        }
        Ok(())
    }

    fn plan(&self, operation: &Operation) -> Result<Change, LedgerError> {
        match operation {
            Operation::Credit { amount, hold } => {
                Self::ensure_positive(*amount)?;
                self.ensure_open()?;
                self.credit_change(*amount, hold.as_ref())
            }
            Operation::Reverse { amount, hold } => {
                Self::ensure_positive(*amount)?;
                self.credit_change(*amount, hold.as_ref())
            }
            Operation::Debit { amount, hold: None } => {
                Self::ensure_positive(*amount)?;
                self.ensure_open()?;
                self.ensure_available(*amount)?;
                self.change(
                    *amount,
                    self.balance.checked_sub(*amount),
                    Some(self.held),
                    None,
                )
            }
            Operation::Debit {
                amount,
                hold: Some(hold),
            } => {
                Self::ensure_positive(*amount)?;
                self.ensure_open()?;
                let reserved = self.reserved(hold)?;
                if reserved < *amount {
                    return Err(LedgerError::InsufficientFunds {
                        account: self.account_id.clone(),
                        available: reserved,
                        requested: *amount,
                    });
                }
                let remaining = reserved - amount;
                self.change(
                    *amount,
                    self.balance.checked_sub(*amount),
                    self.held.checked_sub(*amount),
                    Some((hold.clone(), (remaining > 0).then_some(remaining))),
                )
            }
            Operation::Hold { hold, amount } => {
                Self::ensure_positive(*amount)?;
                self.ensure_open()?;
                if self.holds.contains_key(hold) {
                    return Err(LedgerError::HoldExists {
                        account: self.account_id.clone(),
                        hold: hold.clone(),
                    });
                }
                self.ensure_available(*amount)?;
                self.change(
                    *amount,
                    Some(self.balance),
                    self.held.checked_add(*amount),
                    Some((hold.clone(), Some(*amount))),
                )
            }
            Operation::ReleaseHold { hold } => {
                let reserved = self.reserved(hold)?;
                self.change(
                    reserved,
                    Some(self.balance),
                    self.held.checked_sub(reserved),
                    Some((hold.clone(), None)),
                )
            }
        }
    }

    fn reserved(&self, hold: &HoldId) -> Result<MinorUnits, LedgerError> {
        self.holds
            .get(hold)
            .copied()
            .ok_or_else(|| LedgerError::HoldNotFound {
                account: self.account_id.clone(),
                hold: hold.clone(),
            })
    }

    fn commit(
        &mut self,
        kind: OperationKind,
        correlation: CorrelationId,
        change: Change,
        at: DateTime<Utc>,
    ) -> Receipt {
        self.balance = change.balance;
        self.held = change.held;
        match change.hold {
            Some((hold, Some(amount))) => {
                self.holds.insert(hold, amount);
            }
            Some((hold, None)) => {
                self.holds.remove(&hold);
            }
            None => {}
        }
        self.version += 1;
        self.assert_invariants();

        let receipt = Receipt {
            amount: change.amount,
            balance: self.balance,
            held: self.held,
            version: self.version,
        };
        self.entries.push(LedgerEntry {
            version: self.version,
            correlation_id: correlation.clone(),
            operation: kind,
            amount: change.amount,
            balance_after: self.balance,
            held_after: self.held,
            recorded_at: at,
        });
        self.applied.record(correlation, kind, receipt);
        receipt
    }

    /// Returns the stored receipt when `correlation` was already applied.
    fn replayed(
        &self,
        correlation: &CorrelationId,
        kind: OperationKind,
    ) -> Result<Option<Receipt>, LedgerError> {
        match self.applied.get(correlation) {
            Some((applied_kind, receipt)) if *applied_kind == kind => Ok(Some(*receipt)),
            Some((applied_kind, _)) => Err(LedgerError::Validation(format!(
                "correlation id {correlation} was already used for {applied_kind:?} on account {}",
                self.account_id
            ))),
            None => Ok(None),
        }
    }

    fn snapshot(&self) -> Balance {
        Balance {
            account_id: self.account_id.clone(),
            balance: self.balance,
            held: self.held,
            available: self.available(),
            version: self.version,
            overdraft: self.options.overdraft,
            closed: self.closed,
        }
    }
}

/// Single-writer account.
#[derive(Debug)]
pub struct AccountObject {
    account_id: AccountId,
    inner: Mutex<AccountState>,
}

impl AccountObject {
    /// Creates an empty account remembering the last `retention` correlation ids.
    pub fn new(account_id: AccountId, options: AccountOptions, retention: usize) -> Self {
        Self {
            inner: Mutex::new(AccountState::new(account_id.clone(), options, retention)),
            account_id,
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Reads balance and version behind the account lock.
    pub fn balance(&self) -> Balance {
        self.inner.lock().snapshot()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn credit(
        &self,
        amount: MinorUnits,
        correlation: &CorrelationId,
        journal: &dyn Journal,
    ) -> Result<Receipt, LedgerError> {
        self.execute(Operation::Credit { amount, hold: None }, correlation, journal)
    }

    pub fn debit(
        &self,
        amount: MinorUnits,
        correlation: &CorrelationId,
        journal: &dyn Journal,
    ) -> Result<Receipt, LedgerError> {
        self.execute(Operation::Debit { amount, hold: None }, correlation, journal)
    }

    /// Applies `operation` once per correlation id.
    ///
    /// The journal append happens under the account lock, so the journal
    /// holds each account's operations in commit order.
    pub fn execute(
        &self,
        operation: Operation,
        correlation: &CorrelationId,
        journal: &dyn Journal,
    ) -> Result<Receipt, LedgerError> {
        let kind = operation.kind();
        let mut state = self.inner.lock();

        if let Some(receipt) = state.replayed(correlation, kind)? {
            return Ok(receipt);
        }

        let change = state.plan(&operation)?;
        let at = Utc::now();
        journal.append(&JournalEntry::AccountChanged {
            account_id: self.account_id.clone(),
            correlation_id: correlation.clone(),
            operation,
            version: state.version + 1,
            at,
        })?;
        let receipt = state.commit(kind, correlation.clone(), change, at);

        // Hand the lock to the longest waiter so callers are served in arrival order.
        MutexGuard::unlock_fair(state);
        Ok(receipt)
    }

    /// Closes the account. Requires zero balance and no open holds.
    pub fn close(&self, journal: &dyn Journal) -> Result<Balance, LedgerError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Ok(state.snapshot());
        }
        if state.balance != 0 || state.held != 0 {
            return Err(LedgerError::NonZeroBalance {
                account: self.account_id.clone(),
                balance: state.balance,
                held: state.held,
            });
        }

        journal.append(&JournalEntry::AccountClosed {
            account_id: self.account_id.clone(),
            version: state.version + 1,
            at: Utc::now(),
        })?;
        state.closed = true;
        state.version += 1;
        Ok(state.snapshot())
    }

    /// Re-applies a journaled operation during recovery.
    pub(crate) fn restore(
        &self,
        operation: &Operation,
        correlation: &CorrelationId,
        version: u64,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut state = self.inner.lock();
        Self::check_replay_version(&state, version)?;
        let change = state.plan(operation)?;
        state.commit(operation.kind(), correlation.clone(), change, at);
        Ok(())
    }

    pub(crate) fn restore_close(&self, version: u64) -> Result<(), LedgerError> {
        let mut state = self.inner.lock();
        Self::check_replay_version(&state, version)?;
        state.closed = true;
        state.version = version;
        Ok(())
    }

    fn check_replay_version(state: &AccountState, version: u64) -> Result<(), LedgerError> {
        if version != state.version + 1 {
            return Err(LedgerError::Validation(format!(
                "journal version {version} does not follow {} on account {}",
                state.version, state.account_id
            )));
        }
        Ok(())
    }
}
