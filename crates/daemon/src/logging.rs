// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Logfile handling with SIGHUP reopen support.
//!
//! Writes go through a shared handle whose underlying file can be swapped
//! while the subscriber keeps running, so external log rotation works:
//! move the file aside, send SIGHUP, and the controller reopens the
//! configured path.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

enum Sink {
    File { path: PathBuf, file: File },
    Stderr,
}

/// Shared handle to the controller's log destination.
#[derive(Clone)]
pub struct LogHandle {
    sink: Arc<Mutex<Sink>>,
}

impl LogHandle {
    /// Log to a file, creating it (and its directory) as needed.
    pub fn file(path: PathBuf) -> io::Result<LogHandle> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        Ok(LogHandle {
            sink: Arc::new(Mutex::new(Sink::File { path, file })),
        })
    }

    /// Log to stderr (no logfile configured).
    pub fn stderr() -> LogHandle {
        LogHandle {
            sink: Arc::new(Mutex::new(Sink::Stderr)),
        }
    }

    /// Reopen the logfile at its configured path. No-op for stderr.
    pub fn reopen(&self) -> io::Result<()> {
        let mut sink = self.sink.lock();
        if let Sink::File { path, file } = &mut *sink {
            *file = open_append(path)?;
        }
        Ok(())
    }

    /// A writer for `tracing_subscriber`'s `with_writer`.
    pub fn writer(&self) -> LogWriter {
        LogWriter {
            sink: Arc::clone(&self.sink),
        }
    }
}

fn open_append(path: &std::path::Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct LogWriter {
    sink: Arc<Mutex<Sink>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.sink.lock() {
            Sink::File { file, .. } => file.write(buf),
            Sink::Stderr => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.sink.lock() {
            Sink::File { file, .. } => file.flush(),
            Sink::Stderr => io::stderr().flush(),
        }
    }
}

#[cfg(test)]
#[path = "logging_tests.rs"]
mod tests;
