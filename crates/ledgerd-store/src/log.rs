//! The append-only event log: the durability root of the ledger.
//!
//! One JSON object per line, in sequence order. An append is acknowledged
//! only after the line has been written, flushed and `fsync`ed.
//!
//! # Crash safety
//!
//! - A trailing line without a newline is a torn write from a crash; it is
//!   discarded on open and the file truncated back to the last full line.
//! - A complete line that fails to parse, or a break in sequence
//!   contiguity, is corruption and fails the open.
//! - A failed append is rolled back by truncating to the last committed
//!   length. If the rollback fails too, the log is poisoned.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ledgerd_types::Event;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

/// File name of the log inside the data directory.
pub const LOG_FILE_NAME: &str = "events.jsonl";

/// Events recovered from an existing log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogReplay {
    /// Every complete event, in sequence order.
    pub events: Vec<Event>,
    /// Bytes of torn trailing write that were discarded.
    pub discarded_tail_bytes: u64,
}

/// Writer handle on the append-only log.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: File,
    committed_len: u64,
    poisoned: bool,
    #[cfg(feature = "fault-injection")]
    failing_appends: u32,
}

impl EventLog {
    /// Open (or create) the log at `path`, replaying its contents.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptLog`] or [`StoreError::SequenceGap`] if
    /// the existing log is damaged beyond a torn tail, and
    /// [`StoreError::Io`] if the file cannot be read or opened.
    pub async fn open(path: &Path) -> Result<(Self, LogReplay), StoreError> {
        let bytes = read_if_exists(path).await?;
        let parsed = parse_log(&bytes)?;
        let total_len = u64::try_from(bytes.len()).unwrap_or(u64::MAX);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let discarded_tail_bytes = total_len.saturating_sub(parsed.valid_len);
        if discarded_tail_bytes > 0 {
            tracing::warn!(
                path = %path.display(),
                discarded_tail_bytes,
                "Discarding torn write at end of event log"
            );
            file.set_len(parsed.valid_len).await?;
            file.sync_all().await?;
        }

        tracing::debug!(
            path = %path.display(),
            events = parsed.events.len(),
            "Event log opened"
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                committed_len: parsed.valid_len,
                poisoned: false,
                #[cfg(feature = "fault-injection")]
                failing_appends: 0,
            },
            LogReplay {
                events: parsed.events,
                discarded_tail_bytes,
            },
        ))
    }

    /// Read every complete event from the log at `path` without opening it
    /// for writing. A torn tail is ignored rather than repaired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read or is corrupt.
    pub async fn read_all(path: &Path) -> Result<Vec<Event>, StoreError> {
        let bytes = read_if_exists(path).await?;
        Ok(parse_log(&bytes)?.events)
    }

    /// Append one event as a single line and make it durable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LogPoisoned`] if an earlier failure could not
    /// be rolled back, [`StoreError::Serialization`] if the event cannot be
    /// encoded, or [`StoreError::Io`] if the write or `fsync` fails. On
    /// I/O failure nothing of the line remains in the file.
    pub async fn append(&mut self, event: &Event) -> Result<(), StoreError> {
        if self.poisoned {
            return Err(StoreError::LogPoisoned);
        }

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        match self.write_durable(&line).await {
            Ok(()) => {
                let written = u64::try_from(line.len()).unwrap_or(u64::MAX);
                self.committed_len = self.committed_len.saturating_add(written);
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = self.file.set_len(self.committed_len).await {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %rollback,
                        "Event log rollback failed; refusing further appends"
                    );
                    self.poisoned = true;
                }
                Err(StoreError::Io(err))
            }
        }
    }

    /// Flush and `fsync` the file, including metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the sync fails.
    pub async fn sync(&mut self) -> Result<(), StoreError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length in bytes of the durable, complete prefix of the log.
    pub const fn committed_len(&self) -> u64 {
        self.committed_len
    }

    /// Whether appends are refused after an unrecoverable failure.
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Make the next `count` appends fail after writing half their line,
    /// as a full disk would.
    #[cfg(feature = "fault-injection")]
    pub const fn fail_next_appends(&mut self, count: u32) {
        self.failing_appends = count;
    }

    async fn write_durable(&mut self, line: &[u8]) -> std::io::Result<()> {
        #[cfg(feature = "fault-injection")]
        if self.failing_appends > 0 {
            self.failing_appends = self.failing_appends.saturating_sub(1);
            let half = line.get(..line.len() / 2).unwrap_or_default();
            self.file.write_all(half).await?;
            self.file.flush().await?;
            return Err(std::io::Error::other("injected append failure"));
        }
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }
}

/// The valid prefix of a log file.
#[derive(Debug)]
struct ParsedLog {
    events: Vec<Event>,
    valid_len: u64,
}

async fn read_if_exists(path: &Path) -> Result<Vec<u8>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(StoreError::Io(err)),
    }
}

/// Parse newline-terminated events, checking sequence contiguity.
///
/// Bytes after the last newline are a torn write and excluded from
/// `valid_len`. Blank lines are tolerated.
fn parse_log(bytes: &[u8]) -> Result<ParsedLog, StoreError> {
    let mut events: Vec<Event> = Vec::new();
    let mut valid_len: u64 = 0;
    let mut line_no: u64 = 0;

    for chunk in bytes.split_inclusive(|b| *b == b'\n') {
        if chunk.last() != Some(&b'\n') {
            // Torn tail.
            break;
        }
        line_no = line_no.saturating_add(1);
        valid_len = valid_len.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));

        if chunk.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let event: Event =
            serde_json::from_slice(chunk).map_err(|source| StoreError::CorruptLog {
                line: line_no,
                reason: source.to_string(),
            })?;

        let expected = events
            .last()
            .map_or(1, |prev| prev.sequence_id.saturating_add(1));
        if event.sequence_id != expected {
            return Err(StoreError::SequenceGap {
                line: line_no,
                expected,
                found: event.sequence_id,
            });
        }
        events.push(event);
    }

    Ok(ParsedLog { events, valid_len })
}
