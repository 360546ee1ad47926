//! Journal Reader: Sequential reader with corruption detection
//!
//! Features:
//! - Sequential entry reading across rotated journal files
//! - CRC32C checksum validation on every read
//! - Corruption detection with byte-offset reporting
//! - Torn-tail detection, so a store can cut an interrupted final append
//!   before appending again
//! - Anything else unparseable is damage, and reading stops with an error
//! - Gapless / monotonic sequence validation

use crate::journal::{list_journal_files, JournalEntry, JournalError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Checksum mismatch at byte offset {offset}: entry seq={sequence}")]
    ChecksumMismatch { offset: u64, sequence: u64 },

    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("Sequence not monotonic: prev={prev}, current={current}")]
    NotMonotonic { prev: u64, current: u64 },

    #[error("Malformed entry in {file} at byte {file_offset}: {detail}")]
    Malformed {
        file: PathBuf,
        file_offset: u64,
        detail: String,
    },
}

// ── Corruption Log Entry ────────────────────────────────────────────

/// Structured corruption log entry for diagnostics.
#[derive(Debug, Clone)]
pub struct CorruptionRecord {
    /// File the corruption was found in.
    pub file: PathBuf,
    /// Byte offset within `file`.
    pub file_offset: u64,
    /// Byte offset across all journal files.
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    /// Incomplete final frame of the last file
    TruncatedEntry,
    /// Unparseable bytes that are not a torn final append
    MalformedEntry,
}

// ── Journal Reader ──────────────────────────────────────────────────

/// Sequential journal reader with checksum validation and corruption detection.
pub struct JournalReader {
    files: Vec<PathBuf>,
    current_file_idx: usize,
    /// Raw data of the current file.
    data: Vec<u8>,
    /// Current read position within `data`.
    pos: usize,
    /// Byte offset across all files.
    global_offset: u64,
    last_sequence: Option<u64>,
    corruption_log: Vec<CorruptionRecord>,
}

impl JournalReader {
    /// Open a reader over all journal files in the given directory.
    pub fn open(dir: &Path) -> Result<Self, ReaderError> {
        let files = list_journal_files(dir)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        let mut reader = Self {
            files,
            current_file_idx: 0,
            data: Vec::new(),
            pos: 0,
            global_offset: 0,
            last_sequence: None,
            corruption_log: Vec::new(),
        };
        reader.load_current_file()?;
        Ok(reader)
    }

    /// Read the next valid entry, validating its checksum.
    ///
    /// Returns `None` when all entries have been read. An incomplete frame
    /// at the very end of the last file is logged as `TruncatedEntry` and
    /// reading ends there; any other unparseable region is an error.
    pub fn next_entry(&mut self) -> Result<Option<JournalEntry>, ReaderError> {
        loop {
            if self.pos >= self.data.len() && !self.advance_file()? {
                return Ok(None);
            }

            let offset_before = self.global_offset;
            match JournalEntry::from_bytes(&self.data[self.pos..]) {
                Ok((entry, consumed)) => {
                    let file_offset = self.pos as u64;
                    self.pos += consumed;
                    self.global_offset += consumed as u64;

                    if !entry.verify_checksum() {
                        self.record(
                            file_offset,
                            offset_before,
                            CorruptionKind::ChecksumMismatch,
                            format!(
                                "CRC32C mismatch for seq={}, stored={:#010x}",
                                entry.sequence, entry.checksum
                            ),
                        );
                        return Err(ReaderError::ChecksumMismatch {
                            offset: offset_before,
                            sequence: entry.sequence,
                        });
                    }

                    self.last_sequence = Some(entry.sequence);
                    return Ok(Some(entry));
                }
                Err(e) => {
                    let file_offset = self.pos as u64;
                    let remaining = self.data.len() - self.pos;
                    let in_last_file = self.current_file_idx + 1 >= self.files.len();

                    if in_last_file && is_torn_append(&self.data[self.pos..]) {
                        self.record(
                            file_offset,
                            offset_before,
                            CorruptionKind::TruncatedEntry,
                            format!("Torn final append: {} bytes remaining", remaining),
                        );
                        self.global_offset += remaining as u64;
                        self.pos = self.data.len();
                        continue;
                    }

                    let detail = format!("{} ({} bytes remaining)", e, remaining);
                    self.record(
                        file_offset,
                        offset_before,
                        CorruptionKind::MalformedEntry,
                        detail.clone(),
                    );
                    return Err(ReaderError::Malformed {
                        file: self.files.get(self.current_file_idx).cloned().unwrap_or_default(),
                        file_offset,
                        detail,
                    });
                }
            }
        }
    }

    /// Read all valid entries, collecting them into a Vec.
    pub fn read_all(&mut self) -> Result<Vec<JournalEntry>, ReaderError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn corruption_log(&self) -> &[CorruptionRecord] {
        &self.corruption_log
    }

    /// Validate that a list of entries has gapless, monotonic sequences.
    pub fn validate_sequences(entries: &[JournalEntry]) -> Result<(), ReaderError> {
        for window in entries.windows(2) {
            let prev = &window[0];
            let curr = &window[1];

            if curr.sequence <= prev.sequence {
                return Err(ReaderError::NotMonotonic {
                    prev: prev.sequence,
                    current: curr.sequence,
                });
            }

            if curr.sequence != prev.sequence + 1 {
                return Err(ReaderError::SequenceGap {
                    expected: prev.sequence + 1,
                    got: curr.sequence,
                });
            }
        }
        Ok(())
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn record(&mut self, file_offset: u64, byte_offset: u64, kind: CorruptionKind, detail: String) {
        let file = self
            .files
            .get(self.current_file_idx)
            .cloned()
            .unwrap_or_default();
        warn!(file = %file.display(), file_offset, kind = ?kind, "{}", detail);
        self.corruption_log.push(CorruptionRecord {
            file,
            file_offset,
            byte_offset,
            kind,
            detail,
        });
    }

    fn load_current_file(&mut self) -> Result<(), ReaderError> {
        self.data.clear();
        self.pos = 0;
        if let Some(path) = self.files.get(self.current_file_idx) {
            self.data = fs::read(path)?;
        }
        Ok(())
    }

    fn advance_file(&mut self) -> Result<bool, ReaderError> {
        self.current_file_idx += 1;
        if self.current_file_idx < self.files.len() {
            self.load_current_file()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// An interrupted append leaves a prefix of one frame: fewer bytes than
/// the frame declares, or zero fill from a preallocated extent.
fn is_torn_append(tail: &[u8]) -> bool {
    if tail.iter().all(|b| *b == 0) {
        return true;
    }
    match JournalEntry::declared_frame_len(tail) {
        Ok(Some(total)) => tail.len() < total,
        Ok(None) => true,
        Err(_) => false,
    }
}

// ── Tests ───────────────────────────────────────────────────────────
