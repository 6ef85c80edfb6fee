// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frames the gateway sends to its clients.

use easel_core::{ClientId, JobState, RequestId};
use serde::{Deserialize, Serialize};

/// Normal close, sent when a connection is evicted.
pub const CLOSE_NORMAL: u16 = 1000;

/// Internal-error close, sent after the backend reconnect budget is spent.
pub const CLOSE_BACKEND_LOST: u16 = 1011;

/// First text frame on a registered connection: tells the client its cid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloFrame {
    pub uuid: ClientId,
}

impl HelloFrame {
    pub fn new(cid: ClientId) -> Self {
        Self { uuid: cid }
    }
}

/// Status update for a submitted workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStatusFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: RequestId,
    pub status: JobState,
}

impl WorkflowStatusFrame {
    pub fn new(request_id: RequestId, status: JobState) -> Self {
        Self { kind: "workflow_status".to_string(), request_id, status }
    }
}

/// Final text frame before a 1011 close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendLostFrame {
    pub error: String,
}

impl BackendLostFrame {
    pub fn new() -> Self {
        Self { error: "Lost connection to backend".to_string() }
    }
}

impl Default for BackendLostFrame {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
