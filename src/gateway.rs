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

//! HTTP gateway.
//!
//! ```bash
//! # Fund an account (opens it on first credit)
//! curl -X POST http://localhost:8080/accounts/alice/credit \
//!   -H "Content-Type: application/json" \
//!   -d '{"amount": 10000, "correlationId": "funding-1"}'
//!
//! # Transfer
//! curl -X POST http://localhost:8080/transfers \
//!   -H "Content-Type: application/json" \
//!   -d '{"idempotencyKey": "k1", "fromAccount": "alice", "toAccount": "bob", "amount": 2500}'
//!
//! # Transactional bulk transfer
//! curl -X POST http://localhost:8080/transfers \
//!   -H "Content-Type: application/json" \
//!   -d '{"idempotencyKey": "k2", "transactional": true, "legs": [
//!         {"fromAccount": "alice", "toAccount": "bob", "amount": 500},
//!         {"fromAccount": "bob", "toAccount": "carol", "amount": 200}]}'
//!
//! # Balance
//! curl http://localhost:8080/accounts/alice/balance
//! ```

use crate::account::{AccountOptions, Balance, LedgerEntry, OperationKind, Receipt};
use crate::base::{AccountId, CorrelationId, HoldId, IdempotencyKey, MinorUnits, TransferId};
use crate::engine::Engine;
use crate::transfer::{
    TransferLeg, TransferOutcome, TransferRecord, TransferRequest, TransferStatus,
};
use crate::LedgerError;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Header accepted in place of `idempotencyKey` in the transfer body.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// === Request/Response DTOs ===

/// A transfer is either one leg given inline or a `legs` list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub from_account: Option<String>,
    #[serde(default)]
    pub to_account: Option<String>,
    #[serde(default)]
    pub amount: Option<MinorUnits>,
    #[serde(default)]
    pub source_hold_id: Option<String>,
    #[serde(default)]
    pub legs: Vec<LegBody>,
    #[serde(default)]
    pub transactional: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegBody {
    pub from_account: String,
    pub to_account: String,
    pub amount: MinorUnits,
    #[serde(default)]
    pub source_hold_id: Option<String>,
}

impl LegBody {
    fn into_leg(self) -> Result<TransferLeg, LedgerError> {
        let leg = TransferLeg::new(
            AccountId::parse(self.from_account)?,
            AccountId::parse(self.to_account)?,
            self.amount,
        );
        match self.source_hold_id {
            Some(hold) => Ok(leg.with_source_hold(HoldId::parse(hold)?)),
            None => Ok(leg),
        }
    }
}

impl TransferBody {
    fn into_request(self) -> Result<TransferRequest, LedgerError> {
        let inline = self.from_account.is_some()
            || self.to_account.is_some()
            || self.amount.is_some()
            || self.source_hold_id.is_some();
        let legs = match (self.legs.is_empty(), inline) {
            (false, true) => {
                return Err(LedgerError::Validation(
                    "give either legs or fromAccount/toAccount/amount, not both".into(),
                ));
            }
            (false, false) => self.legs,
            (true, _) => {
                let (Some(from_account), Some(to_account), Some(amount)) =
                    (self.from_account, self.to_account, self.amount)
                else {
                    return Err(LedgerError::Validation(
                        "fromAccount, toAccount and amount are required".into(),
                    ));
                };
                vec![LegBody {
                    from_account,
                    to_account,
                    amount,
                    source_hold_id: self.source_hold_id,
                }]
            }
        };

        let legs = legs
            .into_iter()
            .map(LegBody::into_leg)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(if self.transactional {
            TransferRequest::transactional_bulk(legs)
        } else {
            TransferRequest::bulk(legs)
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegResponse {
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount: MinorUnits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_hold_id: Option<HoldId>,
}

impl From<TransferLeg> for LegResponse {
    fn from(leg: TransferLeg) -> Self {
        Self {
            from_account: leg.from_account,
            to_account: leg.to_account,
            amount: leg.amount,
            source_hold_id: leg.source_hold,
        }
    }
}

/// Transfer record as served. A single leg is flattened into the top level.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub transfer_id: TransferId,
    pub idempotency_key: IdempotencyKey,
    #[serde(flatten)]
    pub leg: Option<LegResponse>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub legs: Vec<LegResponse>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub transactional: bool,
    pub status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<TransferRecord> for TransferResponse {
    fn from(record: TransferRecord) -> Self {
        let mut legs: Vec<LegResponse> =
            record.request.legs.into_iter().map(LegResponse::from).collect();
        let leg = if legs.len() == 1 { legs.pop() } else { None };
        Self {
            transfer_id: record.transfer_id,
            idempotency_key: record.idempotency_key,
            leg,
            legs,
            transactional: record.request.transactional,
            status: record.status,
            reason: record.reason,
            created_at: record.created_at,
            completed_at: record.completed_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAccountBody {
    pub account_id: String,
    #[serde(default)]
    pub overdraft: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBody {
    pub amount: MinorUnits,
    pub correlation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldBody {
    pub hold_id: String,
    pub amount: MinorUnits,
    pub correlation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseQuery {
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub account_id: AccountId,
    pub balance: MinorUnits,
    pub held: MinorUnits,
    pub available: MinorUnits,
    pub version: u64,
    pub closed: bool,
}

impl From<Balance> for BalanceResponse {
    fn from(balance: Balance) -> Self {
        Self {
            account_id: balance.account_id,
            balance: balance.balance,
            held: balance.held,
            available: balance.available,
            version: balance.version,
            closed: balance.closed,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResponse {
    pub account_id: AccountId,
    pub amount: MinorUnits,
    pub balance: MinorUnits,
    pub held: MinorUnits,
    pub version: u64,
}

impl ReceiptResponse {
    fn new(account_id: AccountId, receipt: Receipt) -> Self {
        Self {
            account_id,
            amount: receipt.amount,
            balance: receipt.balance,
            held: receipt.held,
            version: receipt.version,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryResponse {
    pub version: u64,
    pub correlation_id: CorrelationId,
    pub operation: OperationKind,
    pub amount: MinorUnits,
    pub balance_after: MinorUnits,
    pub held_after: MinorUnits,
    pub recorded_at: DateTime<Utc>,
}

impl From<LedgerEntry> for EntryResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            version: entry.version,
            correlation_id: entry.correlation_id,
            operation: entry.operation,
            amount: entry.amount,
            balance_after: entry.balance_after,
            held_after: entry.held_after,
            recorded_at: entry.recorded_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub accounts: usize,
    pub pending_transfers: usize,
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Error Handling ===

/// Wrapper for converting [`LedgerError`] into HTTP responses.
#[derive(Debug)]
pub struct AppError(LedgerError);

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError(err)
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            LedgerError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            LedgerError::InsufficientFunds { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_FUNDS")
            }
            LedgerError::AccountNotFound(_) => (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND"),
            LedgerError::HoldNotFound { .. } => (StatusCode::NOT_FOUND, "HOLD_NOT_FOUND"),
            LedgerError::TransferNotFound(_) => (StatusCode::NOT_FOUND, "TRANSFER_NOT_FOUND"),
            LedgerError::AccountExists(_) => (StatusCode::CONFLICT, "ACCOUNT_EXISTS"),
            LedgerError::AccountClosed(_) => (StatusCode::CONFLICT, "ACCOUNT_CLOSED"),
            LedgerError::NonZeroBalance { .. } => (StatusCode::CONFLICT, "NON_ZERO_BALANCE"),
            LedgerError::HoldExists { .. } => (StatusCode::CONFLICT, "HOLD_EXISTS"),
            LedgerError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT_FAILURE"),
            LedgerError::Irrecoverable { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "IRRECOVERABLE")
            }
            LedgerError::InFlight(_) => (StatusCode::ACCEPTED, "IN_FLIGHT"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        debug!(status = status.as_u16(), code, error = %self.0, "request rejected");
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// === Handlers ===

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

fn account_id(raw: String) -> Result<AccountId, AppError> {
    Ok(AccountId::parse(raw)?)
}

/// POST /transfers
async fn create_transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TransferBody>,
) -> Result<Response, AppError> {
    let raw_key = body
        .idempotency_key
        .clone()
        .or_else(|| {
            headers
                .get(IDEMPOTENCY_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| LedgerError::Validation("idempotencyKey is required".into()))?;
    let key = IdempotencyKey::parse(raw_key)?;

    let request = body.into_request()?;

    match state.engine.transfer(key, request).await {
        Ok(outcome) => Ok((StatusCode::OK, Json(outcome)).into_response()),
        Err(LedgerError::InFlight(transfer_id)) => Ok((
            StatusCode::ACCEPTED,
            Json(TransferOutcome {
                transfer_id,
                status: TransferStatus::Pending,
                reason: None,
            }),
        )
            .into_response()),
        Err(err) => Err(err.into()),
    }
}

/// GET /transfers/{key}
async fn get_transfer(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<TransferResponse>, AppError> {
    let key = IdempotencyKey::parse(key)?;
    let record = state
        .engine
        .transfer_record(&key)
        .ok_or(LedgerError::TransferNotFound(key))?;
    Ok(Json(record.into()))
}

/// POST /accounts
async fn open_account(
    State(state): State<AppState>,
    Json(body): Json<OpenAccountBody>,
) -> Result<(StatusCode, Json<BalanceResponse>), AppError> {
    let id = account_id(body.account_id)?;
    let balance = state.engine.accounts().open(
        &id,
        AccountOptions {
            overdraft: body.overdraft,
        },
    )?;
    Ok((StatusCode::CREATED, Json(balance.into())))
}

/// GET /accounts/{id}/balance
async fn get_balance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BalanceResponse>, AppError> {
    let id = account_id(id)?;
    Ok(Json(state.engine.accounts().get_balance(&id)?.into()))
}

/// POST /accounts/{id}/credit
async fn credit_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreditBody>,
) -> Result<Json<ReceiptResponse>, AppError> {
    let id = account_id(id)?;
    let correlation = CorrelationId::new(body.correlation_id);
    let receipt = state.engine.accounts().credit(&id, body.amount, &correlation)?;
    Ok(Json(ReceiptResponse::new(id, receipt)))
}

/// POST /accounts/{id}/close
async fn close_account(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BalanceResponse>, AppError> {
    let id = account_id(id)?;
    Ok(Json(state.engine.accounts().close(&id)?.into()))
}

/// POST /accounts/{id}/holds
async fn place_hold(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<HoldBody>,
) -> Result<(StatusCode, Json<ReceiptResponse>), AppError> {
    let id = account_id(id)?;
    let hold = HoldId::parse(body.hold_id)?;
    let correlation = CorrelationId::new(body.correlation_id);
    let receipt = state
        .engine
        .accounts()
        .hold(&id, &hold, body.amount, &correlation)?;
    Ok((StatusCode::CREATED, Json(ReceiptResponse::new(id, receipt))))
}

/// DELETE /accounts/{id}/holds/{holdId}
async fn release_hold(
    State(state): State<AppState>,
    Path((id, hold)): Path<(String, String)>,
    Query(query): Query<ReleaseQuery>,
) -> Result<Json<ReceiptResponse>, AppError> {
    let id = account_id(id)?;
    let hold = HoldId::parse(hold)?;
    // Repeated DELETEs without a correlation id resolve to the same release.
    let correlation = CorrelationId::new(
        query
            .correlation_id
            .unwrap_or_else(|| format!("release:{hold}")),
    );
    let receipt = state
        .engine
        .accounts()
        .release_hold(&id, &hold, &correlation)?;
    Ok(Json(ReceiptResponse::new(id, receipt)))
}

/// GET /accounts/{id}/entries
async fn list_entries(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EntryResponse>>, AppError> {
    let id = account_id(id)?;
    let entries = state.engine.accounts().entries(&id)?;
    Ok(Json(entries.into_iter().map(EntryResponse::from).collect()))
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        accounts: state.engine.accounts().len(),
        pending_transfers: state.engine.pending_len(),
    })
}

// === Gateway ===

/// HTTP front end of an [`Engine`].
#[derive(Clone)]
pub struct LedgerGateway {
    engine: Arc<Engine>,
}

impl LedgerGateway {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            engine: Arc::clone(&self.engine),
        };
        Router::new()
            .route("/transfers", post(create_transfer))
            .route("/transfers/{key}", get(get_transfer))
            .route("/accounts", post(open_account))
            .route("/accounts/{id}/balance", get(get_balance))
            .route("/accounts/{id}/credit", post(credit_account))
            .route("/accounts/{id}/close", post(close_account))
            .route("/accounts/{id}/holds", post(place_hold))
            .route("/accounts/{id}/holds/{hold_id}", delete(release_hold))
            .route("/accounts/{id}/entries", get(list_entries))
            .route("/health", get(health))
            .with_state(state)
    }

    /// Serves the API on `listener` until `shutdown` resolves.
    ///
    /// Parked transfers are re-driven on every `resume_interval` tick, the
    /// first tick firing immediately.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let period = engine.config().resume_interval.max(Duration::from_millis(1));
        let resumer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if engine.pending_len() > 0 {
                    engine.resume_pending().await;
                }
            }
        });

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "ledger gateway listening");
        }
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;
        resumer.abort();
        result
    }
}
