//! Journal Writer: Append-only ledger journal with checksums
//!
//! Every state change of the journal-backed store (exchange registration,
//! activation toggles, user registration, trade commits) is one entry. The
//! entry sequence doubles as the trade commit sequence.
//!
//! # Binary Format (per entry)
//! ```text
//! [body_len:    u32]
//! [sequence:    u64]
//! [timestamp:   i64]
//! [kind:        u8]
//! [payload_len: u32][payload: bytes]
//! [checksum:    u32]  // CRC32C over sequence+timestamp+kind+payload
//! ```

use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown entry kind: {0}")]
    UnknownKind(u8),

    #[error("Sequence error: expected {expected}, got {got}")]
    SequenceError { expected: u64, got: u64 },

    #[error("Journal size limit exceeded: {current} >= {limit}")]
    SizeLimitExceeded { current: u64, limit: u64 },

    #[error("Journal writer failed at seq={sequence}; reopen the journal to continue")]
    WriterFailed { sequence: u64 },
}

// Smallest body: seq + ts + kind + payload_len + crc
const MIN_BODY_LEN: usize = 8 + 8 + 1 + 4 + 4;
// Anything larger is treated as a corrupt length prefix
const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

// ── Entry Kind ──────────────────────────────────────────────────────

/// What an entry records. The discriminant is the on-disk byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    ExchangeRegistered = 1,
    ExchangeActivation = 2,
    UserRegistered = 3,
    TradeCommitted = 4,
}

impl EntryKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Result<Self, JournalError> {
        match byte {
            1 => Ok(EntryKind::ExchangeRegistered),
            2 => Ok(EntryKind::ExchangeActivation),
            3 => Ok(EntryKind::UserRegistered),
            4 => Ok(EntryKind::TradeCommitted),
            other => Err(JournalError::UnknownKind(other)),
        }
    }
}

// ── Journal Entry ───────────────────────────────────────────────────

/// A single journal entry representing one persisted state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic entry sequence; also the commit sequence of trades
    pub sequence: u64,
    /// Unix nanosecond timestamp of the append
    pub timestamp: i64,
    pub kind: EntryKind,
    /// Bincode-serialized record
    pub payload: Vec<u8>,
    /// CRC32C checksum over (sequence ++ timestamp ++ kind ++ payload)
    pub checksum: u32,
}

impl JournalEntry {
    /// Create a new entry, computing the CRC32C checksum automatically.
    pub fn new(sequence: u64, timestamp: i64, kind: EntryKind, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(sequence, timestamp, kind, &payload);
        Self {
            sequence,
            timestamp,
            kind,
            payload,
            checksum,
        }
    }

    /// Serialize `record` with bincode into a new entry.
    pub fn encode<T: Serialize>(
        sequence: u64,
        timestamp: i64,
        kind: EntryKind,
        record: &T,
    ) -> Result<Self, JournalError> {
        let payload =
            bincode::serialize(record).map_err(|e| JournalError::Serialization(e.to_string()))?;
        Ok(Self::new(sequence, timestamp, kind, payload))
    }

    /// Deserialize the payload.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, JournalError> {
        bincode::deserialize(&self.payload).map_err(|e| JournalError::Serialization(e.to_string()))
    }

    /// Compute CRC32C over the concatenation of (sequence, timestamp, kind, payload).
    pub fn compute_checksum(sequence: u64, timestamp: i64, kind: EntryKind, payload: &[u8]) -> u32 {
        let mut buf = Vec::with_capacity(8 + 8 + 1 + payload.len());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.push(kind.as_byte());
        buf.extend_from_slice(payload);
        crc32c(&buf)
    }

    /// Validate the stored checksum against recomputed value.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.timestamp, self.kind, &self.payload)
    }

    /// Serialize entry to the binary wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_len = self.payload.len() as u32;
        let body_len = (MIN_BODY_LEN as u32) + payload_len;

        let mut buf = Vec::with_capacity(4 + body_len as usize);
        buf.extend_from_slice(&body_len.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserialize entry from the binary wire format.
    ///
    /// Returns `(entry, bytes_consumed)` on success. Corrupted or short input
    /// yields an error, never a panic.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), JournalError> {
        let total = Self::declared_frame_len(data)?
            .ok_or_else(|| JournalError::Serialization("Not enough data for length prefix".into()))?;
        let body_len = total - 4;

        if data.len() < total {
            return Err(JournalError::Serialization(format!(
                "Incomplete entry: need {} bytes, have {}",
                total,
                data.len()
            )));
        }

        let body = &data[4..total];
        let sequence = read_u64(body, 0).unwrap_or_default();
        let timestamp = read_u64(body, 8).unwrap_or_default() as i64;
        let kind = EntryKind::from_byte(body[16])?;
        let payload_len = read_u32(body, 17).unwrap_or_default() as usize;

        if MIN_BODY_LEN + payload_len != body_len {
            return Err(JournalError::Serialization(format!(
                "payload_len {} inconsistent with body_len {}",
                payload_len, body_len
            )));
        }

        let payload = body[21..21 + payload_len].to_vec();
        let checksum = read_u32(body, 21 + payload_len).unwrap_or_default();

        let entry = Self {
            sequence,
            timestamp,
            kind,
            payload,
            checksum,
        };
        Ok((entry, total))
    }

    /// Frame length announced by the length prefix at the start of `data`.
    ///
    /// `Ok(None)` if the prefix itself is incomplete; an error if it is
    /// outside the plausible range.
    pub fn declared_frame_len(data: &[u8]) -> Result<Option<usize>, JournalError> {
        let Some(body_len) = read_u32(data, 0) else {
            return Ok(None);
        };
        let body_len = body_len as usize;
        if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body_len) {
            return Err(JournalError::Serialization(format!(
                "Implausible body length: {}",
                body_len
            )));
        }
        Ok(Some(4 + body_len))
    }
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    let bytes = data.get(at..at + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

// ── Flush / Fsync Policies ──────────────────────────────────────────

/// Controls when buffered data is flushed to OS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Flush after every write.
    EveryWrite,
    /// Flush every N writes.
    EveryN(usize),
}

/// Controls when `fsync` (durable write) is called.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every write.
    EveryWrite,
    /// Fsync every N writes.
    EveryN(usize),
    /// Fsync only on file rotation.
    OnRotation,
}

// ── Journal Writer Configuration ────────────────────────────────────

/// Configuration for the journal writer.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory for journal files.
    pub dir: PathBuf,
    /// Maximum file size in bytes before rotation (default 64 MiB).
    pub max_file_size: u64,
    /// Maximum total journal size in bytes (0 = unlimited).
    pub max_total_size: u64,
    pub flush_policy: FlushPolicy,
    pub fsync_policy: FsyncPolicy,
}

impl JournalConfig {
    /// Create a config with durable defaults: a commit is acknowledged only
    /// after fsync.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_file_size: 64 * 1024 * 1024,
            max_total_size: 0,
            flush_policy: FlushPolicy::EveryWrite,
            fsync_policy: FsyncPolicy::EveryWrite,
        }
    }
}

// ── Journal Writer ──────────────────────────────────────────────────

/// Append-only journal writer with checksums, rotation, and fsync control.
pub struct JournalWriter {
    config: JournalConfig,
    writer: BufWriter<File>,
    current_file: PathBuf,
    current_file_size: u64,
    next_sequence: u64,
    writes_since_flush: usize,
    writes_since_fsync: usize,
    file_index: u64,
    total_size: u64,
    /// Sequence of the append that failed; set once, cleared only by reopening
    failed_at: Option<u64>,
}

impl JournalWriter {
    /// Open a journal writer, creating the directory if needed.
    ///
    /// Appends continue in the highest-numbered existing file. The caller
    /// sets the next sequence after replaying the journal.
    pub fn open(config: JournalConfig) -> Result<Self, JournalError> {
        fs::create_dir_all(&config.dir)?;

        let file_index = Self::find_latest_index(&config.dir);
        let current_file = journal_path(&config.dir, file_index);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current_file)?;

        let current_file_size = file.metadata()?.len();
        let total_size = Self::compute_total_size(&config.dir)?;

        info!(
            dir = %config.dir.display(),
            file_index,
            total_size,
            "Journal writer opened"
        );

        Ok(Self {
            config,
            writer: BufWriter::new(file),
            current_file,
            current_file_size,
            next_sequence: 1,
            writes_since_flush: 0,
            writes_since_fsync: 0,
            file_index,
            total_size,
            failed_at: None,
        })
    }

    /// Set the next expected sequence number (used after replay).
    pub fn set_next_sequence(&mut self, seq: u64) {
        self.next_sequence = seq;
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn current_file_path(&self) -> &Path {
        &self.current_file
    }

    /// Append a journal entry. The sequence must be exactly the next one.
    ///
    /// After an IO failure the bytes of the failed entry may still sit in
    /// the buffer or on disk, so the writer refuses every later append and
    /// sync until the journal is reopened and its tail re-read.
    pub fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        self.check_healthy()?;
        if entry.sequence != self.next_sequence {
            return Err(JournalError::SequenceError {
                expected: self.next_sequence,
                got: entry.sequence,
            });
        }

        if self.config.max_total_size > 0 && self.total_size >= self.config.max_total_size {
            return Err(JournalError::SizeLimitExceeded {
                current: self.total_size,
                limit: self.config.max_total_size,
            });
        }

        if let Err(e) = self.write_entry(entry) {
            self.fail(entry.sequence, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Encode a record and append it as the next entry.
    pub fn append_record<T: Serialize>(
        &mut self,
        timestamp: i64,
        kind: EntryKind,
        record: &T,
    ) -> Result<JournalEntry, JournalError> {
        let entry = JournalEntry::encode(self.next_sequence, timestamp, kind, record)?;
        self.append(&entry)?;
        Ok(entry)
    }

    /// Force flush + fsync (used before shutdown / rotation).
    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.check_healthy()?;
        if let Err(e) = self.flush_and_sync() {
            self.fail(self.next_sequence.saturating_sub(1), &e);
            return Err(e);
        }
        Ok(())
    }

    /// Whether an earlier IO failure has stopped this writer.
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn check_healthy(&self) -> Result<(), JournalError> {
        match self.failed_at {
            Some(sequence) => Err(JournalError::WriterFailed { sequence }),
            None => Ok(()),
        }
    }

    fn fail(&mut self, sequence: u64, err: &JournalError) {
        error!(sequence, error = %err, file = %self.current_file.display(), "Journal write failed");
        self.failed_at = Some(sequence);
    }

    fn write_entry(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        if self.current_file_size >= self.config.max_file_size {
            self.rotate()?;
        }

        let bytes = entry.to_bytes();
        self.writer.write_all(&bytes)?;

        let written = bytes.len() as u64;
        self.current_file_size += written;
        self.total_size += written;
        self.next_sequence = entry.sequence + 1;
        self.writes_since_flush += 1;
        self.writes_since_fsync += 1;

        self.apply_flush_policy()?;
        self.apply_fsync_policy()?;

        debug!(sequence = entry.sequence, kind = ?entry.kind, bytes = written, "Journal entry appended");
        Ok(())
    }

    fn flush_and_sync(&mut self) -> Result<(), JournalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.writes_since_flush = 0;
        self.writes_since_fsync = 0;
        Ok(())
    }

    fn apply_flush_policy(&mut self) -> Result<(), JournalError> {
        let should_flush = match self.config.flush_policy {
            FlushPolicy::EveryWrite => true,
            FlushPolicy::EveryN(n) => self.writes_since_flush >= n,
        };
        if should_flush {
            self.writer.flush()?;
            self.writes_since_flush = 0;
        }
        Ok(())
    }

    fn apply_fsync_policy(&mut self) -> Result<(), JournalError> {
        let should_fsync = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => self.writes_since_fsync >= n,
            FsyncPolicy::OnRotation => false,
        };
        if should_fsync {
            self.writer.flush()?;
            self.writer.get_ref().sync_all()?;
            self.writes_since_fsync = 0;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), JournalError> {
        self.flush_and_sync()?;

        self.file_index += 1;
        self.current_file = journal_path(&self.config.dir, self.file_index);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.current_file)?;

        self.writer = BufWriter::new(file);
        self.current_file_size = 0;
        info!(file = %self.current_file.display(), "Journal rotated");
        Ok(())
    }

    fn find_latest_index(dir: &Path) -> u64 {
        list_journal_files(dir)
            .ok()
            .and_then(|files| files.last().map(|(idx, _)| *idx))
            .unwrap_or(0)
    }

    fn compute_total_size(dir: &Path) -> Result<u64, JournalError> {
        let mut total = 0u64;
        for (_, path) in list_journal_files(dir)? {
            total += fs::metadata(path)?.len();
        }
        Ok(total)
    }
}

/// Path of the journal file with the given index.
pub fn journal_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("journal-{:06}.bin", index))
}

/// Journal files in `dir` as (index, path), sorted by index.
pub fn list_journal_files(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<(u64, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let idx = name
                .strip_prefix("journal-")?
                .strip_suffix(".bin")?
                .parse::<u64>()
                .ok()?;
            Some((idx, e.path()))
        })
        .collect();
    files.sort_by_key(|(idx, _)| *idx);
    Ok(files)
}

// ── Tests ───────────────────────────────────────────────────────────
