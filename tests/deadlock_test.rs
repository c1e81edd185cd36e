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

//! Deadlock detection tests using parking_lot's built-in deadlock detector.
//!
//! These tests drive the real account registry and engine from many threads
//! and fail if the lock graph ever contains a cycle.

use durable_ledger::{
    AccountId, AccountRegistry, CorrelationId, Engine, HoldId, IdempotencyKey, LedgerConfig,
    MemoryJournal, MinorUnits, TransferRequest,
};
use parking_lot::deadlock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

fn id(value: &str) -> AccountId {
    AccountId::parse(value).unwrap()
}

// === Deadlock Detection Infrastructure ===

/// Starts a background thread that checks for deadlocks.
/// Returns a handle to stop the detector.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

/// Stops the deadlock detector.
fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150));
}

// === Tests ===

/// Many threads hammering one account with mixed operations.
#[test]
fn no_deadlock_high_contention_single_account() {
    let detector = start_deadlock_detector();
    let accounts = Arc::new(AccountRegistry::new(Arc::new(MemoryJournal::new()), 4096, []));
    accounts.credit(&id("hot"), 1_000, &CorrelationId::new("seed")).unwrap();

    const NUM_THREADS: usize = 32;
    const OPS_PER_THREAD: usize = 100;

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let accounts = Arc::clone(&accounts);
            thread::spawn(move || {
                for i in 0..OPS_PER_THREAD {
                    let correlation = CorrelationId::new(format!("{t}-{i}"));
                    match i % 4 {
                        0 => {
                            accounts.credit(&id("hot"), 10, &correlation).unwrap();
                        }
                        1 => {
                            let _ = accounts.debit(&id("hot"), 7, &correlation);
                        }
                        2 => {
                            let hold = HoldId::parse(format!("h-{t}-{i}")).unwrap();
                            if accounts.hold(&id("hot"), &hold, 3, &correlation).is_ok() {
                                let release = CorrelationId::new(format!("{t}-{i}-release"));
                                accounts.release_hold(&id("hot"), &hold, &release).unwrap();
                            }
                        }
                        _ => {
                            let _ = accounts.get_balance(&id("hot")).unwrap();
                            let _ = accounts.entries(&id("hot")).unwrap();
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    let balance = accounts.get_balance(&id("hot")).unwrap();
    assert!(balance.available >= 0);
    assert_eq!(balance.held, 0);
}

/// Threads opening and crediting many accounts while others list balances.
#[test]
fn no_deadlock_registry_growth_with_readers() {
    let detector = start_deadlock_detector();
    let accounts = Arc::new(AccountRegistry::new(Arc::new(MemoryJournal::new()), 64, []));

    let writers: Vec<_> = (0..8)
        .map(|t| {
            let accounts = Arc::clone(&accounts);
            thread::spawn(move || {
                for i in 0..200 {
                    let account = id(&format!("acct-{}", (t * 200 + i) % 300));
                    let correlation = CorrelationId::new(format!("{t}-{i}"));
                    accounts.credit(&account, 1, &correlation).unwrap();
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let accounts = Arc::clone(&accounts);
            thread::spawn(move || {
                for _ in 0..50 {
                    let total: MinorUnits = accounts.balances().iter().map(|b| b.balance).sum();
                    assert!(total >= 0);
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().expect("Thread panicked");
    }

    stop_deadlock_detector(detector);

    let total: MinorUnits = accounts.balances().iter().map(|b| b.balance).sum();
    assert_eq!(total, 8 * 200);
    assert_eq!(accounts.len(), 300);
}

/// Opposing transfers (A to B and B to A) running at the same time.
#[test]
fn no_deadlock_opposing_transfers() {
    let detector = start_deadlock_detector();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(8)
        .enable_all()
        .build()
        .unwrap();
    let engine = Arc::new(Engine::new(LedgerConfig::test()));
    engine.accounts().credit(&id("A"), 10_000, &CorrelationId::new("fund-A")).unwrap();
    engine.accounts().credit(&id("B"), 10_000, &CorrelationId::new("fund-B")).unwrap();

    runtime.block_on(async {
        let tasks: Vec<_> = (0..500)
            .map(|i| {
                let engine = Arc::clone(&engine);
                let (from, to) = if i % 2 == 0 { ("A", "B") } else { ("B", "A") };
                tokio::spawn(async move {
                    let key = IdempotencyKey::parse(format!("t-{i}")).unwrap();
                    engine
                        .transfer(key, TransferRequest::new(id(from), id(to), 5))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("task panicked").unwrap();
        }
    });

    stop_deadlock_detector(detector);

    let a = engine.accounts().get_balance(&id("A")).unwrap().balance;
    let b = engine.accounts().get_balance(&id("B")).unwrap().balance;
    assert_eq!(a + b, 20_000);
    assert_eq!(a, 10_000);
}
