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

//! Account registry and account object integration tests.

use durable_ledger::{
    AccountId, AccountOptions, AccountRegistry, CorrelationId, HoldId, LedgerError, MemoryJournal,
    OperationKind,
};
use std::sync::Arc;
use std::thread;

fn id(value: &str) -> AccountId {
    AccountId::parse(value).unwrap()
}

fn corr(value: &str) -> CorrelationId {
    CorrelationId::new(value)
}

fn registry() -> AccountRegistry {
    AccountRegistry::new(Arc::new(MemoryJournal::new()), 1024, [])
}

#[test]
fn credit_creates_account() {
    let accounts = registry();
    let receipt = accounts.credit(&id("a"), 100, &corr("c1")).unwrap();

    assert_eq!(receipt.balance, 100);
    assert_eq!(receipt.version, 1);
    let balance = accounts.get_balance(&id("a")).unwrap();
    assert_eq!(balance.balance, 100);
    assert_eq!(balance.available, 100);
    assert!(!balance.closed);
}

#[test]
fn repeated_credit_applies_once() {
    let accounts = registry();
    let first = accounts.credit(&id("a"), 100, &corr("c1")).unwrap();
    for _ in 0..10 {
        assert_eq!(accounts.credit(&id("a"), 100, &corr("c1")).unwrap(), first);
    }

    let balance = accounts.get_balance(&id("a")).unwrap();
    assert_eq!(balance.balance, 100);
    assert_eq!(balance.version, 1);
}

#[test]
fn repeated_debit_applies_once() {
    let accounts = registry();
    accounts.credit(&id("a"), 100, &corr("c1")).unwrap();
    accounts.debit(&id("a"), 30, &corr("d1")).unwrap();
    accounts.debit(&id("a"), 30, &corr("d1")).unwrap();

    assert_eq!(accounts.get_balance(&id("a")).unwrap().balance, 70);
}

#[test]
fn debit_insufficient_funds() {
    let accounts = registry();
    accounts.credit(&id("a"), 50, &corr("c1")).unwrap();

    let result = accounts.debit(&id("a"), 100, &corr("d1"));
    assert_eq!(
        result,
        Err(LedgerError::InsufficientFunds {
            account: id("a"),
            available: 50,
            requested: 100,
        })
    );

    // Balance unchanged
    let balance = accounts.get_balance(&id("a")).unwrap();
    assert_eq!(balance.balance, 50);
    assert_eq!(balance.version, 1);
}

#[test]
fn debit_to_exactly_zero() {
    let accounts = registry();
    accounts.credit(&id("a"), 50, &corr("c1")).unwrap();
    let receipt = accounts.debit(&id("a"), 50, &corr("d1")).unwrap();
    assert_eq!(receipt.balance, 0);
}

#[test]
fn overdraft_account_can_go_negative() {
    let accounts = registry();
    accounts
        .open(&id("house"), AccountOptions { overdraft: true })
        .unwrap();
    let receipt = accounts.debit(&id("house"), 500, &corr("d1")).unwrap();
    assert_eq!(receipt.balance, -500);
}

#[test]
fn failed_debit_can_be_retried_after_funding() {
    let accounts = registry();
    accounts.credit(&id("a"), 10, &corr("c1")).unwrap();
    assert!(accounts.debit(&id("a"), 20, &corr("d1")).is_err());

    // The refused attempt was not recorded, so the same correlation applies now.
    accounts.credit(&id("a"), 10, &corr("c2")).unwrap();
    let receipt = accounts.debit(&id("a"), 20, &corr("d1")).unwrap();
    assert_eq!(receipt.balance, 0);
}

#[test]
fn version_increments_by_one_per_mutation() {
    let accounts = registry();
    accounts.credit(&id("a"), 100, &corr("c1")).unwrap();
    accounts.debit(&id("a"), 10, &corr("d1")).unwrap();
    accounts
        .hold(&id("a"), &HoldId::parse("h").unwrap(), 10, &corr("h1"))
        .unwrap();
    accounts
        .release_hold(&id("a"), &HoldId::parse("h").unwrap(), &corr("r1"))
        .unwrap();

    assert_eq!(accounts.get_balance(&id("a")).unwrap().version, 4);
}

#[test]
fn hold_then_debit_from_hold() {
    let accounts = registry();
    let hold = HoldId::parse("h1").unwrap();
    accounts.credit(&id("a"), 100, &corr("c1")).unwrap();
    accounts.hold(&id("a"), &hold, 80, &corr("h1")).unwrap();

    // Only 20 is available outside the hold.
    assert!(matches!(
        accounts.debit(&id("a"), 30, &corr("d1")),
        Err(LedgerError::InsufficientFunds { available: 20, .. })
    ));

    let receipt = accounts.debit_hold(&id("a"), &hold, 50, &corr("d2")).unwrap();
    assert_eq!(receipt.balance, 50);
    assert_eq!(receipt.held, 30);

    let receipt = accounts.release_hold(&id("a"), &hold, &corr("r1")).unwrap();
    assert_eq!(receipt.amount, 30);
    assert_eq!(accounts.get_balance(&id("a")).unwrap().available, 50);
}

#[test]
fn duplicate_hold_id_is_rejected() {
    let accounts = registry();
    let hold = HoldId::parse("h1").unwrap();
    accounts.credit(&id("a"), 100, &corr("c1")).unwrap();
    accounts.hold(&id("a"), &hold, 10, &corr("h1")).unwrap();

    assert!(matches!(
        accounts.hold(&id("a"), &hold, 10, &corr("h2")),
        Err(LedgerError::HoldExists { .. })
    ));
}

#[test]
fn close_lifecycle() {
    let accounts = registry();
    accounts.credit(&id("a"), 10, &corr("c1")).unwrap();
    assert!(matches!(
        accounts.close(&id("a")),
        Err(LedgerError::NonZeroBalance { .. })
    ));

    accounts.debit(&id("a"), 10, &corr("d1")).unwrap();
    assert!(accounts.close(&id("a")).unwrap().closed);

    assert_eq!(
        accounts.credit(&id("a"), 5, &corr("c2")),
        Err(LedgerError::AccountClosed(id("a")))
    );
    assert_eq!(
        accounts.debit(&id("a"), 5, &corr("d2")),
        Err(LedgerError::AccountClosed(id("a")))
    );
    // Reversals still land.
    assert_eq!(accounts.reverse(&id("a"), 5, &corr("r1")).unwrap().balance, 5);
}

#[test]
fn operations_on_unknown_accounts() {
    let accounts = registry();
    assert_eq!(
        accounts.get_balance(&id("ghost")),
        Err(LedgerError::AccountNotFound(id("ghost")))
    );
    assert!(accounts.close(&id("ghost")).is_err());
    assert!(accounts.entries(&id("ghost")).is_err());
}

#[test]
fn invalid_credit_does_not_create_account() {
    let accounts = registry();
    assert!(matches!(
        accounts.credit(&id("a"), 0, &corr("c1")),
        Err(LedgerError::Validation(_))
    ));
    assert!(accounts.is_empty());
}

#[test]
fn entries_follow_mutations() {
    let accounts = registry();
    accounts.credit(&id("a"), 100, &corr("c1")).unwrap();
    accounts.debit(&id("a"), 40, &corr("d1")).unwrap();

    let entries = accounts.entries(&id("a")).unwrap();
    let kinds: Vec<OperationKind> = entries.iter().map(|e| e.operation).collect();
    assert_eq!(kinds, vec![OperationKind::Credit, OperationKind::Debit]);
    assert_eq!(entries[1].correlation_id, corr("d1"));
    assert_eq!(entries[1].balance_after, 60);
}

#[test]
fn correlation_memory_is_bounded() {
    let accounts = AccountRegistry::new(Arc::new(MemoryJournal::new()), 2, []);
    accounts.credit(&id("a"), 1, &corr("c1")).unwrap();
    accounts.credit(&id("a"), 1, &corr("c2")).unwrap();
    accounts.credit(&id("a"), 1, &corr("c3")).unwrap();

    // c3 and c2 are remembered.
    accounts.credit(&id("a"), 1, &corr("c3")).unwrap();
    assert_eq!(accounts.get_balance(&id("a")).unwrap().balance, 3);

    // c1 fell out of the window and is applied again.
    accounts.credit(&id("a"), 1, &corr("c1")).unwrap();
    assert_eq!(accounts.get_balance(&id("a")).unwrap().balance, 4);
}

#[test]
fn concurrent_operations_on_one_account_are_serialized() {
    let accounts = Arc::new(registry());
    accounts
        .open(&id("a"), AccountOptions::default())
        .unwrap();

    const THREADS: usize = 10;
    const OPS_PER_THREAD: usize = 100;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let accounts = Arc::clone(&accounts);
            thread::spawn(move || {
                for i in 0..OPS_PER_THREAD {
                    accounts
                        .credit(&id("a"), 1, &corr(&format!("c-{t}-{i}")))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    let balance = accounts.get_balance(&id("a")).unwrap();
    assert_eq!(balance.balance, (THREADS * OPS_PER_THREAD) as i64);
    assert_eq!(balance.version, (THREADS * OPS_PER_THREAD) as u64);
}

#[test]
fn concurrent_credits_and_debits_lose_no_update() {
    let accounts = Arc::new(registry());
    accounts.credit(&id("a"), 1_000, &corr("fund")).unwrap();

    const THREADS: usize = 10;
    const OPS_PER_THREAD: usize = 100;
    const CREDIT: i64 = 3;
    const DEBIT: i64 = 2;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let accounts = Arc::clone(&accounts);
            thread::spawn(move || {
                for i in 0..OPS_PER_THREAD {
                    let correlation = corr(&format!("op-{t}-{i}"));
                    if i % 2 == 0 {
                        accounts.credit(&id("a"), CREDIT, &correlation).unwrap();
                    } else {
                        // Even if every debit ran first the balance stays above zero.
                        accounts.debit(&id("a"), DEBIT, &correlation).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    let total = (THREADS * OPS_PER_THREAD) as i64;
    let balance = accounts.get_balance(&id("a")).unwrap();
    assert_eq!(balance.balance, 1_000 + total / 2 * CREDIT - total / 2 * DEBIT);
    assert_eq!(balance.version, 1 + total as u64);
    assert_eq!(accounts.entries(&id("a")).unwrap().len(), 1 + total as usize);
}
