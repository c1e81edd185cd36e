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

//! Shared test doubles.

#![allow(dead_code)]

use durable_ledger::{Journal, JournalEntry, JournalError, MemoryJournal};
use parking_lot::Mutex;
use std::sync::Arc;

type Matcher = Box<dyn Fn(&JournalEntry) -> bool + Send + Sync>;

/// Journal that refuses selected appends.
///
/// Each armed rule fails up to `remaining` appends whose entry matches,
/// then lets writes through again.
pub struct FlakyJournal {
    inner: Arc<MemoryJournal>,
    rules: Mutex<Vec<(Matcher, u32)>>,
}

impl FlakyJournal {
    pub fn new() -> Self {
        Self::over(Arc::new(MemoryJournal::new()))
    }

    pub fn over(inner: Arc<MemoryJournal>) -> Self {
        Self {
            inner,
            rules: Mutex::new(Vec::new()),
        }
    }

    /// The journal that received every successful append.
    pub fn inner(&self) -> Arc<MemoryJournal> {
        Arc::clone(&self.inner)
    }

    pub fn fail_next<F>(&self, times: u32, matches: F)
    where
        F: Fn(&JournalEntry) -> bool + Send + Sync + 'static,
    {
        self.rules.lock().push((Box::new(matches), times));
    }

    pub fn heal(&self) {
        self.rules.lock().clear();
    }
}

impl Journal for FlakyJournal {
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        {
            let mut rules = self.rules.lock();
            for (matches, remaining) in rules.iter_mut() {
                if *remaining > 0 && matches(entry) {
                    *remaining -= 1;
                    return Err(JournalError::Unavailable("injected failure".into()));
                }
            }
        }
        self.inner.append(entry)
    }

    fn replay(&self) -> Result<Vec<JournalEntry>, JournalError> {
        self.inner.replay()
    }
}

/// Matches account changes of `account`.
pub fn change_of(account: &str) -> impl Fn(&JournalEntry) -> bool + Send + Sync + 'static {
    let account = account.to_string();
    move |entry| {
        matches!(
            entry,
            JournalEntry::AccountChanged { account_id, .. } if account_id.as_str() == account
        )
    }
}

/// Matches transfer records in `status`.
pub fn transfer_in(
    status: durable_ledger::TransferStatus,
) -> impl Fn(&JournalEntry) -> bool + Send + Sync + 'static {
    move |entry| matches!(entry, JournalEntry::Transfer(record) if record.status == status)
}
