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

//! Durable step journal.
//!
//! Every account mutation and every transfer state transition is appended to
//! the journal *before* it takes effect in memory. On startup the engine
//! replays the journal to rebuild account state, the idempotency table and
//! any transfer that was interrupted mid-flight.
//!
//! Two implementations are provided:
//!
//! - [`MemoryJournal`]: a `Vec` behind a mutex, for tests and ephemeral runs.
//! - [`FileJournal`]: JSON lines, flushed and `fsync`ed on every append. A
//!   failed append is cut back off the file so a retry cannot duplicate it.

use crate::account::{AccountOptions, Operation};
use crate::base::{AccountId, CorrelationId};
use crate::transfer::TransferRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// One durable fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    AccountOpened {
        account_id: AccountId,
        options: AccountOptions,
        at: DateTime<Utc>,
    },
    AccountChanged {
        account_id: AccountId,
        correlation_id: CorrelationId,
        operation: Operation,
        /// Account version after the change, used to verify replay order.
        version: u64,
        at: DateTime<Utc>,
    },
    AccountClosed {
        account_id: AccountId,
        version: u64,
        at: DateTime<Utc>,
    },
    /// Snapshot of a transfer record after a state transition.
    Transfer(TransferRecord),
}

/// Journal failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JournalError {
    #[error("journal i/o error: {0}")]
    Io(String),

    #[error("journal entry {line} is corrupt: {reason}")]
    Corrupt { line: usize, reason: String },

    /// Journal refused the write; used by fault-injecting journals.
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for JournalError {
    fn from(err: std::io::Error) -> Self {
        JournalError::Io(err.to_string())
    }
}

/// Append-only durable log.
pub trait Journal: Send + Sync {
    /// Persists `entry`. Once this returns `Ok` the entry survives a crash.
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError>;

    /// Returns every entry in append order.
    fn replay(&self) -> Result<Vec<JournalEntry>, JournalError>;
}

/// In-memory journal.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn replay(&self) -> Result<Vec<JournalEntry>, JournalError> {
        Ok(self.entries.lock().clone())
    }
}

/// What an append needs from the journal file.
trait AppendTarget: Write {
    fn length(&self) -> io::Result<u64>;
    fn truncate(&mut self, length: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl AppendTarget for File {
    fn length(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, length: u64) -> io::Result<()> {
        self.set_len(length)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Appends whole lines or nothing.
#[derive(Debug)]
struct Appender<F> {
    file: F,
    /// Set when a failed append could not be rolled back; the file tail is
    /// then unknown and no further line may follow it.
    broken: Option<String>,
}

impl<F: AppendTarget> Appender<F> {
    fn new(file: F) -> Self {
        Self { file, broken: None }
    }

    fn append(&mut self, line: &[u8]) -> Result<(), JournalError> {
        if let Some(reason) = &self.broken {
            return Err(JournalError::Io(format!("journal needs reopening: {reason}")));
        }

        let length = self.file.length()?;
        let written = self
            .file
            .write_all(line)
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync());
        let Err(err) = written else {
            return Ok(());
        };

        // The next successful sync also makes the shorter length durable.
        match self.file.truncate(length) {
            Ok(()) => {
                warn!(length, error = %err, "journal append failed, tail rolled back");
                Err(err.into())
            }
            Err(rollback) => {
                let reason = format!("{err}; rollback to {length} bytes failed: {rollback}");
                warn!(%reason, "journal append failed and left a dirty tail");
                self.broken = Some(reason.clone());
                Err(JournalError::Io(reason))
            }
        }
    }
}

/// JSON-lines journal on disk.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    writer: Mutex<Appender<File>>,
}

impl FileJournal {
    /// Opens (or creates) the journal at `path`.
    ///
    /// A trailing line without a newline is the remains of a write that was
    /// interrupted by a crash; it was never acknowledged, so it is cut off
    /// before new entries are appended.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        if !contents.is_empty() && contents.last() != Some(&b'\n') {
            let keep = contents
                .iter()
                .rposition(|b| *b == b'\n')
                .map_or(0, |pos| pos + 1);
            file.set_len(keep as u64)?;
            file.seek(SeekFrom::End(0))?;
            warn!(
                path = %path.display(),
                discarded = contents.len() - keep,
                "truncated torn journal tail"
            );
        }

        Ok(Self {
            path,
            writer: Mutex::new(Appender::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn append(&self, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut line =
            serde_json::to_string(entry).map_err(|e| JournalError::Io(e.to_string()))?;
        line.push('\n');

        self.writer.lock().append(line.as_bytes())
    }

    fn replay(&self) -> Result<Vec<JournalEntry>, JournalError> {
        // Hold the writer so no append interleaves with the read.
        let _writer = self.writer.lock();
        let reader = BufReader::new(File::open(&self.path)?);

        let mut entries = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|e| JournalError::Corrupt {
                line: index + 1,
                reason: e.to_string(),
            })?;
            entries.push(entry);
        }
        debug!(path = %self.path.display(), entries = entries.len(), "journal replayed");
        Ok(entries)
    }
}
