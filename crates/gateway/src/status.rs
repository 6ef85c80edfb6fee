// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Status listener: the gateway's single control-channel subscription.
//!
//! Holds one WebSocket to the engine's status channel under a sid minted
//! once per process. Every submitted prompt names that sid as its event
//! destination, so this task sees the lifecycle of every job and drives
//! the registry.

use std::sync::Arc;
use std::time::Duration;

use easel_core::{Clock, GatewayError, SessionId, SystemClock};
use easel_wire::EngineEvent;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendDialer, BackendFrame};
use crate::jobs::JobRegistry;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(128);
const MAX_FAILURES: u32 = 5;

pub struct StatusListener<C: Clock = SystemClock> {
    dialer: Arc<dyn BackendDialer>,
    registry: Arc<JobRegistry<C>>,
    sid: SessionId,
    cancel: CancellationToken,
}

impl<C: Clock> StatusListener<C> {
    pub fn new(dialer: Arc<dyn BackendDialer>, registry: Arc<JobRegistry<C>>) -> Self {
        Self { dialer, registry, sid: SessionId::mint(), cancel: CancellationToken::new() }
    }

    /// The process-wide sid submissions are tagged with.
    pub fn sid(&self) -> &SessionId {
        &self.sid
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Consume the control channel until shutdown.
    ///
    /// Transport errors reconnect with exponential backoff, reset to base
    /// after a successful recv. Returning `BackendUnavailable` after the
    /// failure budget means the gateway is degraded: connections keep
    /// proxying, but status events no longer flow.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let mut failures: u32 = 0;
        let mut backoff = BACKOFF_BASE;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match self.dialer.connect_control(&self.sid).await {
                Ok(mut conn) => {
                    info!(sid = %self.sid, "status listener connected");
                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                conn.close().await;
                                return Ok(());
                            }
                            frame = conn.recv() => match frame {
                                Ok(BackendFrame::Text(text)) => {
                                    failures = 0;
                                    backoff = BACKOFF_BASE;
                                    self.handle_frame(&text).await;
                                }
                                // The control channel is text-only, but any
                                // successful recv still proves the transport
                                // is healthy.
                                Ok(BackendFrame::Binary(_)) => {
                                    failures = 0;
                                    backoff = BACKOFF_BASE;
                                    debug!("binary frame on status channel, ignoring");
                                }
                                Err(e) => {
                                    warn!(sid = %self.sid, error = %e, "status channel lost");
                                    conn.close().await;
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(sid = %self.sid, error = %e, "status channel dial failed"),
            }

            failures += 1;
            if failures > MAX_FAILURES {
                return Err(GatewayError::BackendUnavailable(format!(
                    "status channel gone after {MAX_FAILURES} reconnect attempts"
                )));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn handle_frame(&self, text: &str) {
        match EngineEvent::parse(text) {
            Ok(Some(event)) => {
                self.registry.handle_event(&event).await;
            }
            Ok(None) => {}
            Err(e) => {
                let violation = GatewayError::ProtocolViolation(e.to_string());
                debug!(error = %violation, "dropping undecodable status frame");
            }
        }
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
