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

//! Registry of account objects keyed by account id.
//!
//! The registry only routes calls: it looks up (or creates) the
//! [`AccountObject`] for an id, clones its `Arc` out of the map and then
//! drops the map guard before the account lock is taken. Operations on
//! different accounts therefore never contend on anything but a map shard
//! for the duration of a lookup.

use crate::LedgerError;
use crate::account::{AccountObject, AccountOptions, Balance, LedgerEntry, Operation, Receipt};
use crate::base::{AccountId, CorrelationId, HoldId, MinorUnits};
use crate::journal::{Journal, JournalEntry};
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Accounts indexed by id.
pub struct AccountRegistry {
    accounts: DashMap<AccountId, Arc<AccountObject>>,
    journal: Arc<dyn Journal>,
    retention: usize,
    /// Accounts that get overdraft when opened implicitly.
    overdraft_accounts: HashSet<AccountId>,
}

impl AccountRegistry {
    pub fn new(
        journal: Arc<dyn Journal>,
        retention: usize,
        overdraft_accounts: impl IntoIterator<Item = AccountId>,
    ) -> Self {
        Self {
            accounts: DashMap::new(),
            journal,
            retention,
            overdraft_accounts: overdraft_accounts.into_iter().collect(),
        }
    }

    /// Returns the account object for `account_id`, if it was ever opened.
    pub fn get(&self, account_id: &AccountId) -> Option<Arc<AccountObject>> {
        self.accounts.get(account_id).map(|entry| Arc::clone(entry.value()))
    }

    fn require(&self, account_id: &AccountId) -> Result<Arc<AccountObject>, LedgerError> {
        self.get(account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))
    }

    fn implicit_options(&self, account_id: &AccountId) -> AccountOptions {
        AccountOptions {
            overdraft: self.overdraft_accounts.contains(account_id),
        }
    }

    /// Opens a new account.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AccountExists`] if the id is already taken.
    pub fn open(
        &self,
        account_id: &AccountId,
        options: AccountOptions,
    ) -> Result<Balance, LedgerError> {
        let account = self.insert(account_id, options, true)?;
        Ok(account.balance())
    }

    /// Inserts an account, journaling the open first.
    ///
    /// The vacant map entry stays locked across the journal append so two
    /// racing opens of one id produce a single `AccountOpened` entry. That
    /// blocks the entry's map shard for one journal write; an account is
    /// opened once, so the stall is bounded by the number of accounts.
    fn insert(
        &self,
        account_id: &AccountId,
        options: AccountOptions,
        explicit: bool,
    ) -> Result<Arc<AccountObject>, LedgerError> {
        match self.accounts.entry(account_id.clone()) {
            Entry::Occupied(_) if explicit => Err(LedgerError::AccountExists(account_id.clone())),
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                self.journal.append(&JournalEntry::AccountOpened {
                    account_id: account_id.clone(),
                    options,
                    at: Utc::now(),
                })?;
                let account = Arc::new(AccountObject::new(
                    account_id.clone(),
                    options,
                    self.retention,
                ));
                entry.insert(Arc::clone(&account));
                info!(
                    account = %account_id,
                    overdraft = options.overdraft,
                    explicit,
                    "account opened"
                );
                Ok(account)
            }
        }
    }

    /// Credits an account, opening it on first use.
    pub fn credit(
        &self,
        account_id: &AccountId,
        amount: MinorUnits,
        correlation: &CorrelationId,
    ) -> Result<Receipt, LedgerError> {
        self.apply(account_id, Operation::Credit { amount, hold: None }, correlation)
    }

    /// Applies any operation. A credit opens an unknown account; everything
    /// else requires it to exist.
    pub fn apply(
        &self,
        account_id: &AccountId,
        operation: Operation,
        correlation: &CorrelationId,
    ) -> Result<Receipt, LedgerError> {
        let Operation::Credit { amount, .. } = &operation else {
            return self.execute(account_id, operation, correlation);
        };
        // Reject before an implicit open can create the account.
        if *amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "amount must be positive, got {amount}"
            )));
        }
        let account = match self.get(account_id) {
            Some(account) => account,
            None => self.insert(account_id, self.implicit_options(account_id), false)?,
        };
        account.execute(operation, correlation, self.journal.as_ref())
    }

    pub fn debit(
        &self,
        account_id: &AccountId,
        amount: MinorUnits,
        correlation: &CorrelationId,
    ) -> Result<Receipt, LedgerError> {
        self.execute(account_id, Operation::Debit { amount, hold: None }, correlation)
    }

    /// Debits funds previously reserved by `hold`.
    pub fn debit_hold(
        &self,
        account_id: &AccountId,
        hold: &HoldId,
        amount: MinorUnits,
        correlation: &CorrelationId,
    ) -> Result<Receipt, LedgerError> {
        self.execute(
            account_id,
            Operation::Debit {
                amount,
                hold: Some(hold.clone()),
            },
            correlation,
        )
    }

    /// Compensating credit; applies to closed accounts too.
    pub fn reverse(
        &self,
        account_id: &AccountId,
        amount: MinorUnits,
        correlation: &CorrelationId,
    ) -> Result<Receipt, LedgerError> {
        self.execute(account_id, Operation::Reverse { amount, hold: None }, correlation)
    }

    pub fn hold(
        &self,
        account_id: &AccountId,
        hold: &HoldId,
        amount: MinorUnits,
        correlation: &CorrelationId,
    ) -> Result<Receipt, LedgerError> {
        self.execute(
            account_id,
            Operation::Hold {
                hold: hold.clone(),
                amount,
            },
            correlation,
        )
    }

    pub fn release_hold(
        &self,
        account_id: &AccountId,
        hold: &HoldId,
        correlation: &CorrelationId,
    ) -> Result<Receipt, LedgerError> {
        self.execute(
            account_id,
            Operation::ReleaseHold { hold: hold.clone() },
            correlation,
        )
    }

    fn execute(
        &self,
        account_id: &AccountId,
        operation: Operation,
        correlation: &CorrelationId,
    ) -> Result<Receipt, LedgerError> {
        let account = self.require(account_id)?;
        account.execute(operation, correlation, self.journal.as_ref())
    }

    pub fn close(&self, account_id: &AccountId) -> Result<Balance, LedgerError> {
        let balance = self.require(account_id)?.close(self.journal.as_ref())?;
        info!(account = %account_id, version = balance.version, "account closed");
        Ok(balance)
    }

    pub fn get_balance(&self, account_id: &AccountId) -> Result<Balance, LedgerError> {
        Ok(self.require(account_id)?.balance())
    }

    pub fn entries(&self, account_id: &AccountId) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.require(account_id)?.entries())
    }

    /// Balances of every account, ordered by id.
    pub fn balances(&self) -> Vec<Balance> {
        let accounts: Vec<Arc<AccountObject>> = self
            .accounts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut balances: Vec<Balance> = accounts.iter().map(|a| a.balance()).collect();
        balances.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        balances
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Applies one journaled account fact without journaling it again.
    pub(crate) fn restore(&self, entry: &JournalEntry) -> Result<(), LedgerError> {
        match entry {
            JournalEntry::AccountOpened {
                account_id,
                options,
                ..
            } => {
                self.accounts
                    .entry(account_id.clone())
                    .or_insert_with(|| {
                        Arc::new(AccountObject::new(
                            account_id.clone(),
                            *options,
                            self.retention,
                        ))
                    });
            }
            JournalEntry::AccountChanged {
                account_id,
                correlation_id,
                operation,
                version,
                at,
            } => {
                self.require(account_id)?
                    .restore(operation, correlation_id, *version, *at)?;
            }
            JournalEntry::AccountClosed {
                account_id,
                version,
                ..
            } => {
                self.require(account_id)?.restore_close(*version)?;
            }
            JournalEntry::Transfer(_) => {}
        }
        debug!(?entry, "restored account entry");
        Ok(())
    }
}
