// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fakes for exercising connection and status flows without an engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use easel_core::{GatewayError, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backend::{BackendConn, BackendDialer, BackendFrame};

/// Test-side handle onto a [`FakeConn`].
#[derive(Clone)]
pub struct FakeConnHandle {
    to_pump: Arc<Mutex<Option<mpsc::UnboundedSender<BackendFrame>>>>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl FakeConnHandle {
    /// Deliver a frame as if the engine had sent it.
    pub fn push(&self, frame: BackendFrame) {
        if let Some(tx) = self.to_pump.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    pub fn push_text(&self, text: &str) {
        self.push(BackendFrame::Text(text.to_string()));
    }

    /// Sever the transport; the next recv on the conn fails.
    pub fn kill(&self) {
        self.to_pump.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

pub struct FakeConn {
    rx: mpsc::UnboundedReceiver<BackendFrame>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

pub fn fake_conn() -> (FakeConnHandle, FakeConn) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(false));
    let handle = FakeConnHandle {
        to_pump: Arc::new(Mutex::new(Some(tx))),
        sent: sent.clone(),
        closed: closed.clone(),
    };
    (handle, FakeConn { rx, sent, closed })
}

#[async_trait]
impl BackendConn for FakeConn {
    async fn recv(&mut self) -> Result<BackendFrame, GatewayError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| GatewayError::BackendUnavailable("connection closed".to_string()))
    }

    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        if *self.closed.lock() {
            return Err(GatewayError::BackendUnavailable("connection closed".to_string()));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&mut self) {
        *self.closed.lock() = true;
    }
}

#[derive(Default)]
struct DialerState {
    counter: usize,
    session_requests: Vec<Option<SessionId>>,
    sessions: Vec<FakeConnHandle>,
    controls: Vec<FakeConnHandle>,
    fail_remaining: u32,
    fail_always: bool,
}

/// Scriptable dialer: every connect hands back a fresh [`FakeConn`] whose
/// handle the test keeps.
#[derive(Default)]
pub struct FakeDialer {
    state: Mutex<DialerState>,
}

impl FakeDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_remaining = n;
    }

    /// Make every further connect attempt fail.
    pub fn fail_always(&self) {
        self.state.lock().fail_always = true;
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// The sids connect_session was asked to resume, in order.
    pub fn session_requests(&self) -> Vec<Option<SessionId>> {
        self.state.lock().session_requests.clone()
    }

    pub fn last_session(&self) -> Option<FakeConnHandle> {
        self.state.lock().sessions.last().cloned()
    }

    pub fn control_count(&self) -> usize {
        self.state.lock().controls.len()
    }

    pub fn last_control(&self) -> Option<FakeConnHandle> {
        self.state.lock().controls.last().cloned()
    }
}

#[async_trait]
impl BackendDialer for FakeDialer {
    async fn connect_session(
        &self,
        sid: Option<&SessionId>,
    ) -> Result<(SessionId, Box<dyn BackendConn>), GatewayError> {
        let mut state = self.state.lock();
        state.session_requests.push(sid.cloned());
        if state.fail_always || state.fail_remaining > 0 {
            state.fail_remaining = state.fail_remaining.saturating_sub(1);
            return Err(GatewayError::BackendUnavailable("scripted failure".to_string()));
        }
        let sid = match sid {
            Some(sid) => sid.clone(),
            None => {
                state.counter += 1;
                SessionId::from_string(format!("sid-{}", state.counter))
            }
        };
        let (handle, conn) = fake_conn();
        state.sessions.push(handle);
        Ok((sid, Box::new(conn)))
    }

    async fn connect_control(&self, _sid: &SessionId) -> Result<Box<dyn BackendConn>, GatewayError> {
        let mut state = self.state.lock();
        if state.fail_always || state.fail_remaining > 0 {
            state.fail_remaining = state.fail_remaining.saturating_sub(1);
            return Err(GatewayError::BackendUnavailable("scripted failure".to_string()));
        }
        let (handle, conn) = fake_conn();
        state.controls.push(handle);
        Ok(Box::new(conn))
    }
}

/// Poll until the condition holds or a short deadline passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
