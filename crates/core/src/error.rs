// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed errors surfaced to clients in response frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client-visible failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("Job not found")]
    NoJob,
    #[error("Queue not found")]
    NoQueue,
    #[error("Resource not found")]
    NoResource,
    #[error("Permission denied")]
    NoPerm,
    #[error("Invalid argument provided")]
    InvalidArgument,
    #[error("Invalid state")]
    InvalidState,
    #[error("Job already exists")]
    JobExists,
    #[error("Queue already exists")]
    QueueExists,
    #[error("Resource already exists")]
    ResourceExists,
    #[error("Queue is not empty")]
    QueueNotEmpty,
    #[error("Nothing to update")]
    NothingToUpdate,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Invalid message received")]
    InvalidResponse,
    #[error("Disconnected from daemon")]
    Disconnect,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
