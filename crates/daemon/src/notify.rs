// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Notification seam for the external mail process.
//!
//! The controller only queues per-job completion notices; delivery is the
//! mailer's problem. Notices are never generated while replaying the
//! journal, so a recovery pass cannot re-send mail.

use gq_core::{JobId, JobState};
use parking_lot::Mutex;
use std::sync::Arc;

/// A job-completion notice for the submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub jobid: JobId,
    pub name: String,
    pub submitter_uid: u32,
    pub state: JobState,
    pub exit_code: i32,
}

pub trait Notifier: Send {
    fn job_finished(&self, notice: &Notice);
}

/// Production default: the mail process consumes the accounting stream,
/// the controller itself sends nothing.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn job_finished(&self, _notice: &Notice) {}
}

/// Records notices for assertions in tests.
#[derive(Clone, Default)]
pub struct FakeNotifier {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl FakeNotifier {
    pub fn new() -> FakeNotifier {
        FakeNotifier::default()
    }

    pub fn taken(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock())
    }
}

impl Notifier for FakeNotifier {
    fn job_finished(&self, notice: &Notice) {
        self.notices.lock().push(notice.clone());
    }
}

#[cfg(test)]
#[path = "notify_tests.rs"]
mod tests;
