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

//! Engine public API integration tests.

use durable_ledger::{
    AccountId, CorrelationId, Engine, HoldId, IdempotencyKey, LedgerConfig, LedgerError,
    MinorUnits, TransferRequest, TransferStatus,
};
use std::sync::Arc;

fn id(value: &str) -> AccountId {
    AccountId::parse(value).unwrap()
}

fn key(value: &str) -> IdempotencyKey {
    IdempotencyKey::parse(value).unwrap()
}

fn request(from: &str, to: &str, amount: MinorUnits) -> TransferRequest {
    TransferRequest::new(id(from), id(to), amount)
}

fn balance(engine: &Engine, account: &str) -> MinorUnits {
    engine.accounts().get_balance(&id(account)).unwrap().balance
}

/// A funded with 100, B opened empty.
fn engine_with_accounts() -> Engine {
    let engine = Engine::new(LedgerConfig::test());
    engine
        .accounts()
        .credit(&id("A"), 100, &CorrelationId::new("fund-A"))
        .unwrap();
    engine
        .accounts()
        .open(&id("B"), Default::default())
        .unwrap();
    engine
}

#[tokio::test]
async fn transfer_commits() {
    let engine = engine_with_accounts();

    let outcome = engine.transfer(key("k1"), request("A", "B", 30)).await.unwrap();

    assert_eq!(outcome.status, TransferStatus::Committed);
    assert!(outcome.reason.is_none());
    assert_eq!(balance(&engine, "A"), 70);
    assert_eq!(balance(&engine, "B"), 30);
}

#[tokio::test]
async fn resubmitted_key_returns_original_outcome() {
    let engine = engine_with_accounts();
    let first = engine.transfer(key("k1"), request("A", "B", 30)).await.unwrap();

    for _ in 0..5 {
        let again = engine.transfer(key("k1"), request("A", "B", 30)).await.unwrap();
        assert_eq!(again, first);
    }

    assert_eq!(balance(&engine, "A"), 70);
    assert_eq!(balance(&engine, "B"), 30);
}

#[tokio::test]
async fn insufficient_funds_fails_without_effect() {
    let engine = engine_with_accounts();
    engine.transfer(key("k1"), request("A", "B", 30)).await.unwrap();

    let outcome = engine.transfer(key("k2"), request("A", "B", 500)).await.unwrap();

    assert_eq!(outcome.status, TransferStatus::Failed);
    assert!(outcome.reason.unwrap().contains("insufficient funds"));
    assert_eq!(balance(&engine, "A"), 70);
    assert_eq!(balance(&engine, "B"), 30);

    // FAILED is terminal and sticky.
    let again = engine.transfer(key("k2"), request("A", "B", 500)).await.unwrap();
    assert_eq!(again.status, TransferStatus::Failed);
}

#[tokio::test]
async fn key_reuse_with_different_request_is_rejected() {
    let engine = engine_with_accounts();
    engine.transfer(key("k1"), request("A", "B", 30)).await.unwrap();

    let result = engine.transfer(key("k1"), request("A", "B", 31)).await;
    assert!(matches!(result, Err(LedgerError::Validation(_))));
    assert_eq!(balance(&engine, "A"), 70);
}

#[tokio::test]
async fn invalid_requests_leave_no_record() {
    let engine = engine_with_accounts();

    let zero = engine.transfer(key("k1"), request("A", "B", 0)).await;
    assert!(matches!(zero, Err(LedgerError::Validation(_))));

    let negative = engine.transfer(key("k2"), request("A", "B", -10)).await;
    assert!(matches!(negative, Err(LedgerError::Validation(_))));

    let same = engine.transfer(key("k3"), request("A", "A", 10)).await;
    assert!(matches!(same, Err(LedgerError::Validation(_))));

    assert!(engine.transfer_record(&key("k1")).is_none());
    assert!(engine.transfer_record(&key("k3")).is_none());
    assert_eq!(balance(&engine, "A"), 100);
}

#[tokio::test]
async fn unknown_source_fails() {
    let engine = engine_with_accounts();
    let outcome = engine
        .transfer(key("k1"), request("ghost", "B", 10))
        .await
        .unwrap();

    assert_eq!(outcome.status, TransferStatus::Failed);
    assert!(outcome.reason.unwrap().contains("not found"));
}

#[tokio::test]
async fn transfer_opens_unknown_destination() {
    let engine = engine_with_accounts();
    let outcome = engine.transfer(key("k1"), request("A", "C", 10)).await.unwrap();

    assert_eq!(outcome.status, TransferStatus::Committed);
    assert_eq!(balance(&engine, "C"), 10);
}

#[tokio::test]
async fn transfer_from_hold() {
    let engine = engine_with_accounts();
    let hold = HoldId::parse("h1").unwrap();
    engine
        .accounts()
        .hold(&id("A"), &hold, 60, &CorrelationId::new("hold-1"))
        .unwrap();

    let outcome = engine
        .transfer(key("k1"), request("A", "B", 60).with_source_hold(hold.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.status, TransferStatus::Committed);
    let a = engine.accounts().get_balance(&id("A")).unwrap();
    assert_eq!(a.balance, 40);
    assert_eq!(a.held, 0);
    assert_eq!(balance(&engine, "B"), 60);
}

#[tokio::test]
async fn compensated_hold_transfer_restores_the_hold() {
    let engine = engine_with_accounts();
    let hold = HoldId::parse("h1").unwrap();
    engine
        .accounts()
        .hold(&id("A"), &hold, 60, &CorrelationId::new("hold-1"))
        .unwrap();
    engine.accounts().close(&id("B")).unwrap();

    let outcome = engine
        .transfer(key("k1"), request("A", "B", 60).with_source_hold(hold.clone()))
        .await
        .unwrap();

    assert_eq!(outcome.status, TransferStatus::Compensated);
    let a = engine.accounts().get_balance(&id("A")).unwrap();
    assert_eq!((a.balance, a.held, a.available), (100, 60, 40));

    // The reservation is usable again.
    engine
        .accounts()
        .release_hold(&id("A"), &hold, &CorrelationId::new("release-1"))
        .unwrap();
    assert_eq!(engine.accounts().get_balance(&id("A")).unwrap().held, 0);
}

#[tokio::test]
async fn transfer_record_tracks_progress() {
    let engine = engine_with_accounts();
    let outcome = engine.transfer(key("k1"), request("A", "B", 30)).await.unwrap();

    let record = engine.transfer_record(&key("k1")).unwrap();
    assert_eq!(record.transfer_id, outcome.transfer_id);
    assert_eq!(record.status, TransferStatus::Committed);
    assert!(record.completed_at.unwrap() >= record.created_at);

    // Both legs carry the transfer id as correlation.
    let entries = engine.accounts().entries(&id("B")).unwrap();
    assert_eq!(
        entries.last().unwrap().correlation_id.as_str(),
        outcome.transfer_id.to_string()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_of_one_key_move_money_once() {
    let engine = Arc::new(engine_with_accounts());

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.transfer(key("k1"), request("A", "B", 30)).await })
        })
        .collect();

    let mut transfer_ids = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.status, TransferStatus::Committed);
                transfer_ids.push(outcome.transfer_id);
            }
            Err(LedgerError::InFlight(transfer_id)) => transfer_ids.push(transfer_id),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    transfer_ids.dedup();
    assert_eq!(transfer_ids.len(), 1);
    assert_eq!(balance(&engine, "A"), 70);
    assert_eq!(balance(&engine, "B"), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transfers_conserve_money() {
    let engine = Arc::new(Engine::new(LedgerConfig::test()));
    let names = ["w", "x", "y", "z"];
    for name in names {
        engine
            .accounts()
            .credit(&id(name), 1_000, &CorrelationId::new(format!("fund-{name}")))
            .unwrap();
    }

    let tasks: Vec<_> = (0..400)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let from = names[i % 4];
            let to = names[(i + 1 + i / 4) % 4];
            let to = if to == from { names[(i + 2) % 4] } else { to };
            tokio::spawn(async move {
                engine
                    .transfer(key(&format!("t-{i}")), request(from, to, (i % 50 + 1) as i64))
                    .await
            })
        })
        .collect();

    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.status.is_terminal());
    }

    let total: MinorUnits = names.iter().map(|name| balance(&engine, name)).sum();
    assert_eq!(total, 4_000);
    for name in names {
        assert!(engine.accounts().get_balance(&id(name)).unwrap().available >= 0);
    }
}
