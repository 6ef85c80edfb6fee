// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection manager: pairs client WebSockets with engine sessions and
//! runs the duplex proxy between them.
//!
//! Each live pair is spread over three TTL maps (client handle, backend
//! handle, pump guard) plus a cid↔sid index. The backend→client direction
//! runs as a pump task that owns its socket outright; reconnecting with
//! the same sid is a state transition inside the pump, never a mutation of
//! shared state. Eviction of any map entry drives a coordinated teardown
//! of the whole pair; the index is cleared first, which is what makes the
//! cross-map pop chain idempotent.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use easel_core::{Clock, ClientId, EvictHook, GatewayError, IdleMap, SessionId, SystemClock};
use easel_wire::{strip_frame_header, BackendLostFrame, HelloFrame, CLOSE_BACKEND_LOST, CLOSE_NORMAL};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendConn, BackendDialer, BackendFrame};

pub const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Frames queued toward a client while its backend reconnects.
const PUMP_QUEUE_CAPACITY: usize = 64;

/// Frames queued toward a client writer task.
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(128);

/// Consecutive failed reconnect cycles before the pair is torn down.
const RECONNECT_BUDGET: u32 = 5;

/// A frame on its way to a client WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Sending side of a client connection's writer queue.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientFrame>,
}

impl ClientHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ClientFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<(), GatewayError> {
        self.tx.send(frame).await.map_err(|_| GatewayError::ClientGone)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Command channel into a backend pump.
enum PumpCommand {
    Forward(String),
}

/// Sending side of a pump's command queue.
#[derive(Clone)]
pub struct BackendHandle {
    tx: mpsc::Sender<PumpCommand>,
}

impl BackendHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Cancellation guard for a pump task.
#[derive(Clone)]
struct PumpGuard {
    cancel: CancellationToken,
}

/// Callback invoked with the connection id after a pair is torn down.
/// Must be idempotent: both sides of a pair report their own id.
#[async_trait]
pub trait CloseCallback: Send + Sync {
    async fn on_close(&self, id: &str);
}

#[derive(Default)]
struct Links {
    cid_to_sid: HashMap<String, String>,
    sid_to_cid: HashMap<String, String>,
}

pub struct ConnectionManager<C: Clock = SystemClock> {
    dialer: Arc<dyn BackendDialer>,
    clients: IdleMap<ClientHandle, C>,
    backends: IdleMap<BackendHandle, C>,
    pumps: IdleMap<PumpGuard, C>,
    links: Mutex<Links>,
    close_callbacks: Mutex<Vec<Arc<dyn CloseCallback>>>,
}

impl ConnectionManager<SystemClock> {
    pub fn new(dialer: Arc<dyn BackendDialer>) -> Arc<Self> {
        Self::with_clock(dialer, SystemClock, CONNECTION_IDLE_TIMEOUT)
    }
}

impl<C: Clock> ConnectionManager<C> {
    pub fn with_clock(
        dialer: Arc<dyn BackendDialer>,
        clock: C,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            dialer,
            clients: IdleMap::with_hook(
                idle_timeout,
                clock.clone(),
                Arc::new(ClientEvict { mgr: weak.clone() }),
            ),
            backends: IdleMap::with_hook(
                idle_timeout,
                clock.clone(),
                Arc::new(BackendEvict { mgr: weak.clone() }),
            ),
            pumps: IdleMap::with_hook(idle_timeout, clock, Arc::new(PumpEvict)),
            links: Mutex::new(Links::default()),
            close_callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn add_close_callback(&self, callback: Arc<dyn CloseCallback>) {
        self.close_callbacks.lock().push(callback);
    }

    /// Accept a client connection: mint or resume its cid, pair it with a
    /// backend session, and announce the cid over the socket.
    pub async fn accept_client(
        self: &Arc<Self>,
        resume: Option<ClientId>,
        handle: ClientHandle,
    ) -> Result<(ClientId, SessionId), GatewayError> {
        let cid = resume.unwrap_or_else(ClientId::mint);
        self.clients.set(cid.as_str(), handle.clone()).await;

        let existing = self.links.lock().cid_to_sid.get(cid.as_str()).cloned();
        let sid = match existing {
            Some(sid) => match self.backends.get(&sid).await {
                Some(backend) if !backend.is_closed() => {
                    debug!(%cid, %sid, "reusing live backend session");
                    SessionId::from_string(sid)
                }
                _ => {
                    // Stale pairing: unlink first so the pop below cannot
                    // cascade into the client we just registered.
                    debug!(%cid, %sid, "backend session is gone, dialing a new one");
                    self.unlink(cid.as_str(), &sid);
                    self.backends.pop(&sid).await;
                    self.start_pump(&cid).await?
                }
            },
            None => self.start_pump(&cid).await?,
        };

        {
            let mut links = self.links.lock();
            links.cid_to_sid.insert(cid.to_string(), sid.to_string());
            links.sid_to_cid.insert(sid.to_string(), cid.to_string());
        }

        let hello = serde_json::to_string(&HelloFrame::new(cid.clone()))
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        if handle.send(ClientFrame::Text(hello)).await.is_err() {
            debug!(%cid, "client went away during accept");
            self.disconnect(cid.as_str()).await;
            return Err(GatewayError::ClientGone);
        }

        info!(%cid, %sid, "client connected");
        Ok((cid, sid))
    }

    /// Dial a fresh backend session and spawn its pump.
    async fn start_pump(self: &Arc<Self>, cid: &ClientId) -> Result<SessionId, GatewayError> {
        let (sid, conn) = self.dialer.connect_session(None).await?;
        let (tx, rx) = mpsc::channel(PUMP_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        self.backends.set(sid.as_str(), BackendHandle { tx }).await;
        self.pumps.set(sid.as_str(), PumpGuard { cancel: cancel.clone() }).await;

        let pump = Pump {
            mgr: Arc::downgrade(self),
            cid: cid.clone(),
            sid: sid.clone(),
            dialer: self.dialer.clone(),
            cancel,
            rx,
            conn,
        };
        tokio::spawn(pump.run());
        Ok(sid)
    }

    /// Forward a client text frame to its paired backend.
    ///
    /// While the pump is reconnecting the frames queue; a full queue drops
    /// the frame rather than stalling the client's read loop.
    pub async fn forward_to_backend(&self, cid: &str, text: String) -> Result<(), GatewayError> {
        self.touch_pair(cid).await;
        let sid = self
            .links
            .lock()
            .cid_to_sid
            .get(cid)
            .cloned()
            .ok_or_else(|| GatewayError::not_found(format!("session for client {cid}")))?;
        let backend = self
            .backends
            .get(&sid)
            .await
            .ok_or_else(|| GatewayError::not_found(format!("backend {sid}")))?;
        match backend.tx.try_send(PumpCommand::Forward(text)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(cid, %sid, "backend queue full, dropping client frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(GatewayError::BackendUnavailable(format!("pump for {sid} is gone")))
            }
        }
    }

    /// Send a frame to a client, refreshing the pair's liveness.
    pub async fn send_to_client(&self, cid: &str, frame: ClientFrame) -> Result<(), GatewayError> {
        let Some(handle) = self.clients.get(cid).await else {
            warn!(cid, "client connection not found");
            return Err(GatewayError::not_found(format!("connection {cid}")));
        };
        self.touch_pair(cid).await;
        handle.send(frame).await
    }

    /// Refresh the whole pair: any traffic in either direction counts as
    /// activity for the client map and the linked backend/pump maps.
    async fn touch_pair(&self, cid: &str) {
        self.clients.refresh(cid).await;
        let sid = self.links.lock().cid_to_sid.get(cid).cloned();
        if let Some(sid) = sid {
            self.backends.refresh(&sid).await;
            self.pumps.refresh(&sid).await;
        }
    }

    pub fn session_for_client(&self, cid: &str) -> Option<SessionId> {
        self.links.lock().cid_to_sid.get(cid).map(SessionId::from_string)
    }

    pub fn client_for_session(&self, sid: &str) -> Option<ClientId> {
        self.links.lock().sid_to_cid.get(sid).map(ClientId::from_string)
    }

    /// Tear down a connection by either of its ids.
    pub async fn disconnect(&self, id: &str) {
        if self.clients.pop(id).await.is_none() && self.backends.pop(id).await.is_none() {
            debug!(id, "disconnect: connection not found");
        }
    }

    /// Tear down every live pair.
    pub async fn close_all(&self) {
        for cid in self.clients.keys().await {
            self.disconnect(&cid).await;
        }
        for sid in self.backends.keys().await {
            self.disconnect(&sid).await;
        }
    }

    /// Sweep all three connection maps once.
    pub async fn sweep(&self) {
        self.clients.sweep().await;
        self.backends.sweep().await;
        self.pumps.sweep().await;
    }

    /// Periodic TTL sweep over the connection maps.
    pub async fn run_sweep_forever(&self, interval: Duration) {
        loop {
            self.sweep().await;
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.len().await
    }

    fn unlink(&self, cid: &str, sid: &str) {
        let mut links = self.links.lock();
        links.cid_to_sid.remove(cid);
        links.sid_to_cid.remove(sid);
    }

    /// Remove the pair index for `cid`, returning the sid it pointed at.
    fn unlink_client(&self, cid: &str) -> Option<String> {
        let mut links = self.links.lock();
        let sid = links.cid_to_sid.remove(cid)?;
        links.sid_to_cid.remove(&sid);
        Some(sid)
    }

    /// Remove the pair index for `sid`, returning the cid it pointed at.
    fn unlink_session(&self, sid: &str) -> Option<String> {
        let mut links = self.links.lock();
        let cid = links.sid_to_cid.remove(sid)?;
        links.cid_to_sid.remove(&cid);
        Some(cid)
    }

    async fn run_close_callbacks(&self, id: &str) {
        let callbacks: Vec<_> = self.close_callbacks.lock().clone();
        for callback in callbacks {
            callback.on_close(id).await;
        }
    }

    /// Teardown driven by a client map eviction.
    async fn client_evicted(&self, cid: &str, handle: ClientHandle) {
        debug!(cid, "closing client connection");
        if let Some(sid) = self.unlink_client(cid) {
            self.backends.pop(&sid).await;
        }
        let _ = handle
            .send(ClientFrame::Close { code: CLOSE_NORMAL, reason: "connection closed".to_string() })
            .await;
        self.run_close_callbacks(cid).await;
    }

    /// Teardown driven by a backend map eviction. Cancels the pump before
    /// anything closes the backend socket (the pump owns it and closes it
    /// on cancellation).
    async fn backend_evicted(&self, sid: &str, _handle: BackendHandle) {
        debug!(sid, "closing backend session");
        if let Some(cid) = self.unlink_session(sid) {
            self.clients.pop(&cid).await;
        }
        self.pumps.pop(sid).await;
        self.run_close_callbacks(sid).await;
    }
}

struct ClientEvict<C: Clock> {
    mgr: Weak<ConnectionManager<C>>,
}

#[async_trait]
impl<C: Clock> EvictHook<ClientHandle> for ClientEvict<C> {
    async fn on_evict(&self, cid: &str, handle: ClientHandle) -> Result<(), GatewayError> {
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.client_evicted(cid, handle).await;
        }
        Ok(())
    }
}

struct BackendEvict<C: Clock> {
    mgr: Weak<ConnectionManager<C>>,
}

#[async_trait]
impl<C: Clock> EvictHook<BackendHandle> for BackendEvict<C> {
    async fn on_evict(&self, sid: &str, handle: BackendHandle) -> Result<(), GatewayError> {
        if let Some(mgr) = self.mgr.upgrade() {
            mgr.backend_evicted(sid, handle).await;
        }
        Ok(())
    }
}

struct PumpEvict;

#[async_trait]
impl EvictHook<PumpGuard> for PumpEvict {
    async fn on_evict(&self, sid: &str, guard: PumpGuard) -> Result<(), GatewayError> {
        debug!(sid, "cancelling pump task");
        guard.cancel.cancel();
        Ok(())
    }
}

/// The backend→client pump. Owns its socket; the manager reaches it only
/// through the command channel and the cancellation token.
struct Pump<C: Clock> {
    mgr: Weak<ConnectionManager<C>>,
    cid: ClientId,
    sid: SessionId,
    dialer: Arc<dyn BackendDialer>,
    cancel: CancellationToken,
    rx: mpsc::Receiver<PumpCommand>,
    conn: Box<dyn BackendConn>,
}

impl<C: Clock> Pump<C> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.conn.close().await;
                    break;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(PumpCommand::Forward(text)) => {
                        if let Err(e) = self.conn.send_text(text).await {
                            warn!(sid = %self.sid, error = %e, "client frame lost, backend send failed");
                            if !self.reconnect().await {
                                break;
                            }
                        }
                    }
                    // Manager dropped the handle; pair is being torn down.
                    None => {
                        self.conn.close().await;
                        break;
                    }
                },
                frame = self.conn.recv() => match frame {
                    Ok(BackendFrame::Binary(bytes)) => self.forward_binary(&bytes).await,
                    // Text on the session channel is not forwarded; status
                    // flows through the control channel instead.
                    Ok(BackendFrame::Text(_)) => {}
                    Err(e) => {
                        warn!(sid = %self.sid, error = %e, "backend connection lost");
                        if !self.reconnect().await {
                            break;
                        }
                    }
                },
            }
        }
        debug!(sid = %self.sid, "pump finished");
    }

    async fn forward_binary(&mut self, bytes: &[u8]) {
        let Some(payload) = strip_frame_header(bytes) else {
            warn!(sid = %self.sid, len = bytes.len(), "dropping undersized binary frame");
            return;
        };
        let Some(mgr) = self.mgr.upgrade() else {
            return;
        };
        if let Err(e) = mgr.send_to_client(self.cid.as_str(), ClientFrame::Binary(payload.to_vec())).await
        {
            debug!(cid = %self.cid, error = %e, "image frame not delivered");
        }
    }

    /// Re-dial the engine with the same sid so it reattaches the session.
    ///
    /// Returns false once the budget is spent or the pump was cancelled;
    /// the pair is then torn down and the run loop must exit.
    async fn reconnect(&mut self) -> bool {
        self.conn.close().await;
        let mut backoff = RECONNECT_BASE;
        let mut failures: u32 = 0;
        loop {
            info!(sid = %self.sid, ?backoff, "reconnecting to backend");
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
            match self.dialer.connect_session(Some(&self.sid)).await {
                Ok((_, conn)) => {
                    info!(sid = %self.sid, "backend reconnected");
                    self.conn = conn;
                    return true;
                }
                Err(e) => {
                    failures += 1;
                    warn!(sid = %self.sid, failures, error = %e, "backend reconnect failed");
                    if failures >= RECONNECT_BUDGET {
                        self.fail().await;
                        return false;
                    }
                    backoff = (backoff * 2).min(RECONNECT_CAP);
                }
            }
        }
    }

    /// Reconnect budget exhausted: tell the client once, close 1011, and
    /// tear the pair down.
    async fn fail(&mut self) {
        let Some(mgr) = self.mgr.upgrade() else {
            return;
        };
        if let Ok(text) = serde_json::to_string(&BackendLostFrame::new()) {
            let _ = mgr.send_to_client(self.cid.as_str(), ClientFrame::Text(text)).await;
        }
        let _ = mgr
            .send_to_client(
                self.cid.as_str(),
                ClientFrame::Close {
                    code: CLOSE_BACKEND_LOST,
                    reason: "backend unavailable".to_string(),
                },
            )
            .await;
        mgr.disconnect(self.cid.as_str()).await;
    }
}

#[cfg(test)]
#[path = "connections_tests.rs"]
mod tests;
