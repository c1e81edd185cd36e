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

use clap::{Parser, Subcommand};
use csv::{ReaderBuilder, Trim, Writer};
use durable_ledger::{
    AccountId, Config, ConfigError, CorrelationId, Engine, FileJournal, IdempotencyKey,
    JournalError, LedgerConfig, LedgerError, LedgerGateway, MinorUnits, TransferRequest,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Durable ledger - crash-safe accounts and idempotent transfers
#[derive(Parser, Debug)]
#[command(name = "durable-ledger")]
#[command(about = "A crash-safe ledger with idempotent transfers", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        /// Address to bind (overrides LEDGER_API_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides LEDGER_API_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Journal file (overrides LEDGER_JOURNAL_PATH)
        #[arg(long, value_name = "PATH")]
        journal: Option<PathBuf>,
    },

    /// Drive a CSV of credits and transfers through the ledger and print balances
    ///
    /// Expected format: type,account,counterparty,amount,key
    /// Example: durable-ledger replay movements.csv > balances.csv
    Replay {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Journal file; balances already in it are kept
        #[arg(long, value_name = "PATH")]
        journal: Option<PathBuf>,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let result = match args.command {
        Command::Serve {
            host,
            port,
            journal,
        } => serve(host, port, journal).await,
        Command::Replay { input, journal } => replay(input, journal).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "durable-ledger failed");
            ExitCode::FAILURE
        }
    }
}

/// Builds an engine on the configured journal, recovering its contents.
fn open_engine(config: LedgerConfig) -> Result<Engine, CliError> {
    match &config.journal_path {
        Some(path) => {
            let journal = Arc::new(FileJournal::open(path)?);
            info!(path = %path.display(), "opening journal");
            Ok(Engine::with_journal(config, journal)?)
        }
        None => {
            warn!("no journal configured, state will not survive a restart");
            Ok(Engine::new(config))
        }
    }
}

async fn serve(
    host: Option<String>,
    port: Option<u16>,
    journal: Option<PathBuf>,
) -> Result<(), CliError> {
    let mut config = Config::from_env()?;
    if let Some(host) = host {
        config.api.host = host;
    }
    if let Some(port) = port {
        config.api.port = port;
    }
    if journal.is_some() {
        config.ledger.journal_path = journal;
    }

    let engine = Arc::new(open_engine(config.ledger)?);
    let resumed = engine.resume_pending().await;
    if resumed > 0 {
        info!(resumed, "finished transfers interrupted by the last shutdown");
    }

    let listener = TcpListener::bind((config.api.host.as_str(), config.api.port)).await?;
    LedgerGateway::new(engine)
        .serve(listener, shutdown_signal())
        .await?;
    info!("ledger gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn replay(input: PathBuf, journal: Option<PathBuf>) -> Result<(), CliError> {
    let mut config = Config::from_env()?.ledger;
    config.journal_path = journal;

    let engine = open_engine(config)?;
    let file = File::open(&input)?;
    let summary = process_rows(&engine, BufReader::new(file)).await?;
    info!(
        applied = summary.applied,
        rejected = summary.rejected,
        skipped = summary.skipped,
        "replay finished"
    );

    write_balances(&engine, std::io::stdout())?;
    Ok(())
}

/// Raw CSV row.
///
/// Fields: `type, account, counterparty, amount, key`
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "type")]
    kind: String,
    account: String,
    #[serde(default)]
    counterparty: Option<String>,
    amount: MinorUnits,
    #[serde(default)]
    key: Option<String>,
}

/// Row counts of a replay run.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReplaySummary {
    applied: usize,
    rejected: usize,
    skipped: usize,
}

/// Applies CSV rows in order.
///
/// `credit` rows fund `account`; `key` is the correlation id. `transfer`
/// rows move `amount` from `account` to `counterparty`; `key` is the
/// idempotency key. Rows without a key get one derived from their line so
/// that replaying the same file into the same journal has no new effect.
///
/// ```csv
/// type,account,counterparty,amount,key
/// credit,alice,,100,fund-1
/// transfer,alice,bob,30,t-1
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails. Malformed rows are skipped and
/// rejected operations are counted.
async fn process_rows<R: Read>(engine: &Engine, reader: R) -> Result<ReplaySummary, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let mut summary = ReplaySummary::default();
    for (index, result) in rdr.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                debug!(line, error = %err, "skipping malformed row");
                summary.skipped += 1;
                continue;
            }
        };

        match apply_row(engine, row, line).await {
            Ok(true) => summary.applied += 1,
            Ok(false) => {
                debug!(line, "skipping unknown row type");
                summary.skipped += 1;
            }
            Err(err) => {
                debug!(line, error = %err, "row rejected");
                summary.rejected += 1;
            }
        }
    }
    Ok(summary)
}

/// Returns `Ok(false)` for a row type that is not understood.
async fn apply_row(engine: &Engine, row: CsvRow, line: usize) -> Result<bool, LedgerError> {
    let account = AccountId::parse(row.account)?;
    let key = row.key.filter(|key| !key.is_empty());

    match row.kind.to_lowercase().as_str() {
        "credit" => {
            let correlation = CorrelationId::new(key.unwrap_or_else(|| format!("replay:{line}")));
            engine.accounts().credit(&account, row.amount, &correlation)?;
            Ok(true)
        }
        "transfer" => {
            let counterparty = row
                .counterparty
                .ok_or_else(|| LedgerError::Validation("transfer needs a counterparty".into()))?;
            let key = IdempotencyKey::parse(key.unwrap_or_else(|| format!("replay-{line}")))?;
            let counterparty = AccountId::parse(counterparty)?;
            let request = TransferRequest::new(account, counterparty, row.amount);
            let outcome = engine.transfer(key, request).await?;
            debug!(line, status = %outcome.status, "transfer replayed");
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Output row.
#[derive(Debug, Serialize)]
struct BalanceRow {
    account: String,
    balance: MinorUnits,
    held: MinorUnits,
    available: MinorUnits,
    version: u64,
    closed: bool,
}

/// Writes every account as CSV, ordered by account id.
///
/// ```csv
/// account,balance,held,available,version,closed
/// alice,70,0,70,2,false
/// bob,30,0,30,1,false
/// ```
fn write_balances<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for balance in engine.accounts().balances() {
        wtr.serialize(BalanceRow {
            account: balance.account_id.to_string(),
            balance: balance.balance,
            held: balance.held,
            available: balance.available,
            version: balance.version,
            closed: balance.closed,
        })?;
    }
    wtr.flush()?;
    Ok(())
}
