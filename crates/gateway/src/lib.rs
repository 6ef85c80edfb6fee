// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Easel gateway library.
//!
//! A stateful WebSocket gateway in front of a graph-execution image
//! engine: clients register one WebSocket, queue workflows over HTTP, and
//! receive status frames and image output back on the same socket.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod backend;
pub mod config;
pub mod connections;
pub mod engine;
pub mod http;
pub mod jobs;
pub mod status;
pub mod submit;
pub mod workflows;

#[cfg(test)]
pub mod test_support;

pub use backend::{BackendConn, BackendDialer, BackendFrame, EngineDialer};
pub use config::{EngineConfig, GatewayConfig};
pub use connections::{ClientFrame, ClientHandle, CloseCallback, ConnectionManager};
pub use engine::{EngineProcess, EngineStatus};
pub use http::{router, AppState};
pub use jobs::{JobRegistry, StatusCallback};
pub use status::StatusListener;
pub use submit::{EngineApi, HttpEngineApi, Submitter};
pub use workflows::{analyze_workflow, WorkflowStore};
