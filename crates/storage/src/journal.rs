// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only command journal with in-place commit markers.
//!
//! The journal is a numbered sequence of `journal.<N>` files in the state
//! directory. Each record is one text line:
//!
//! ```text
//! <sentinel><sec>.<ms>\t<uid>\t<COMMAND>\t<jobid>\t<revision>\t<json>\n
//! ```
//!
//! The sentinel byte is a space at append time. Once a background save has
//! persisted every object mutated up to a record, that record's sentinel is
//! overwritten in place with `*`. Recovery replays every record strictly
//! after the newest `*` across all files.

use gq_core::Command;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Roll to a new journal file once the current one exceeds this size.
const JOURNAL_FILE_LIMIT: u64 = 16 * 1024 * 1024;

/// Errors from journal operations. Write failures are fatal to the
/// controller: durability has been lost.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt journal record in {path} line {line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// How eagerly appended records reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// `fdatasync` after every append.
    Immediate,
    /// Sync on the deferred flush tick; at most one flush window of
    /// records may be lost on crash.
    Deferred,
}

/// Position of a record's sentinel byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub file_no: u64,
    pub offset: u64,
}

/// The append side of the journal.
pub struct Journal {
    dir: PathBuf,
    file: File,
    file_no: u64,
    write_pos: u64,
    sync_mode: SyncMode,
    needs_sync: bool,
    last_commit: Option<Marker>,
}

fn journal_path(dir: &Path, file_no: u64) -> PathBuf {
    dir.join(format!("journal.{file_no}"))
}

/// Numerically-sorted list of `(file_no, path)` for existing journal files.
fn journal_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, JournalError> {
    let pattern = dir.join("journal.*");
    let mut files = Vec::new();
    let entries = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    for entry in entries {
        let path = entry.map_err(|e| io::Error::other(e.to_string()))?;
        let file_no = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(|e| e.parse().ok());
        match file_no {
            Some(n) => files.push((n, path)),
            // journal.<N>.new or other strays are not journal files
            None => continue,
        }
    }
    files.sort_by_key(|(n, _)| *n);
    Ok(files)
}

impl Journal {
    /// Open the journal for appending. A fresh file with the next index is
    /// always started, so each controller run appends to its own file.
    pub fn open(dir: &Path, sync_mode: SyncMode) -> Result<Journal, JournalError> {
        fs::create_dir_all(dir)?;
        let next_no = journal_files(dir)?
            .last()
            .map(|(n, _)| n + 1)
            .unwrap_or(1);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal_path(dir, next_no))?;
        let write_pos = file.metadata()?.len();
        debug!(file_no = next_no, "opened journal file");

        Ok(Journal {
            dir: dir.to_owned(),
            file,
            file_no: next_no,
            write_pos,
            sync_mode,
            needs_sync: false,
            last_commit: None,
        })
    }

    /// Append one command record.
    ///
    /// Returns the marker position of the record. The store must not be
    /// mutated before this returns; with [`SyncMode::Deferred`] the record
    /// is on its way to disk but not yet synced.
    pub fn append(
        &mut self,
        uid: u32,
        revision: u64,
        cmd: &Command,
        now_ms: u64,
    ) -> Result<Marker, JournalError> {
        if self.write_pos >= JOURNAL_FILE_LIMIT {
            self.roll()?;
        }

        let payload = serde_json::to_string(cmd)?;
        let line = format!(
            " {}.{:03}\t{}\t{}\t{}\t{}\t{}\n",
            now_ms / 1000,
            now_ms % 1000,
            uid,
            cmd.name(),
            cmd.jobid(),
            revision,
            payload,
        );

        let marker = Marker {
            file_no: self.file_no,
            offset: self.write_pos,
        };
        self.file.write_all(line.as_bytes())?;
        self.write_pos += line.len() as u64;
        self.needs_sync = true;
        self.last_commit = Some(marker);

        if self.sync_mode == SyncMode::Immediate {
            self.flush()?;
        }

        Ok(marker)
    }

    /// Sync appended records to disk. This is the durability point in
    /// deferred mode; also used for the synchronous flush after recon.
    pub fn flush(&mut self) -> Result<(), JournalError> {
        if self.needs_sync {
            self.file.sync_data()?;
            self.needs_sync = false;
        }
        Ok(())
    }

    pub fn needs_flush(&self) -> bool {
        self.needs_sync
    }

    /// Marker of the most recently appended record, if any.
    pub fn last_commit(&self) -> Option<Marker> {
        self.last_commit
    }

    /// Start the next journal file.
    pub fn roll(&mut self) -> Result<(), JournalError> {
        self.flush()?;
        let next_no = self.file_no + 1;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal_path(&self.dir, next_no))?;
        self.file_no = next_no;
        self.write_pos = self.file.metadata()?.len();
        debug!(file_no = next_no, "rolled journal file");
        Ok(())
    }

    pub fn state_dir(&self) -> &Path {
        &self.dir
    }
}

/// Overwrite the sentinel at `marker` with `*`, superseding any earlier
/// marker. Called by the background saver once a save is fully durable.
pub fn write_marker(dir: &Path, marker: &Marker) -> Result<(), JournalError> {
    let path = journal_path(dir, marker.file_no);
    let file = OpenOptions::new().write(true).open(&path)?;
    file.write_all_at(b"*", marker.offset)?;
    file.sync_data()?;
    Ok(())
}

/// Read every record strictly after the newest commit marker, across all
/// journal files in ascending order.
///
/// A corrupt record stops the scan: anything after a torn write cannot be
/// trusted. Earlier valid records are still returned.
pub fn read_unpersisted(dir: &Path) -> Result<Vec<Command>, JournalError> {
    let mut pending: Vec<Command> = Vec::new();

    for (_, path) in journal_files(dir)? {
        let reader = BufReader::new(File::open(&path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!(path = %path.display(), line = line_no + 1,
                        "stopping journal scan at undecodable record");
                    return Ok(pending);
                }
                Err(e) => return Err(e.into()),
            };
            if line.is_empty() {
                continue;
            }

            let persisted = match line.as_bytes()[0] {
                b' ' => false,
                b'*' => true,
                _ => {
                    warn!(path = %path.display(), line = line_no + 1,
                        "stopping journal scan at corrupt sentinel");
                    return Ok(pending);
                }
            };

            if persisted {
                // Everything up to and including this record is reflected
                // in the object files.
                pending.clear();
                continue;
            }

            match parse_record(&line[1..]) {
                Some(cmd) => pending.push(cmd),
                None => {
                    warn!(path = %path.display(), line = line_no + 1,
                        "stopping journal scan at unparseable record");
                    return Ok(pending);
                }
            }
        }
    }

    Ok(pending)
}

/// Parse the tab-separated record body after the sentinel byte.
fn parse_record(body: &str) -> Option<Command> {
    let mut fields = body.splitn(6, '\t');
    let _timestamp = fields.next()?;
    let _uid = fields.next()?;
    let _name = fields.next()?;
    let _jobid = fields.next()?;
    let _revision = fields.next()?;
    let payload = fields.next()?;
    serde_json::from_str(payload).ok()
}

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;
