// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared error vocabulary for the gateway.

use thiserror::Error;

/// Errors surfaced by gateway services.
///
/// Transient backend faults are retried locally and only become
/// `BackendUnavailable` once a retry budget is exhausted.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("workflow submit failed: {0}")]
    SubmitFailed(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("client connection gone")]
    ClientGone,

    #[error("connection evicted")]
    Evicted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Convenience for `NotFound` with a formatted subject.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
