// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound WebSocket connections to the engine.
//!
//! The engine exposes two channels: the per-session image channel
//! (`/comfy-api/ws`) that connection pumps bridge to clients, and the
//! control channel (`/ws`) the status listener consumes. Both open with a
//! text handshake frame naming the session id.

use std::time::Duration;

use async_trait::async_trait;
use easel_core::{GatewayError, SessionId};
use easel_wire::parse_handshake;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// A frame received from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// One open engine connection. Abstracted so tests can stand in fake
/// sockets for reconnect and eviction scenarios.
#[async_trait]
pub trait BackendConn: Send {
    /// Receive the next data frame. Control frames (ping/pong) are handled
    /// internally; a closed transport surfaces as an error.
    async fn recv(&mut self) -> Result<BackendFrame, GatewayError>;

    async fn send_text(&mut self, text: String) -> Result<(), GatewayError>;

    async fn close(&mut self);
}

/// Dials engine channels. The connection manager reconnects through this
/// seam with the same sid to preserve in-flight output routing.
#[async_trait]
pub trait BackendDialer: Send + Sync {
    /// Open a session (image) channel. With `sid`, asks the engine to
    /// reattach the existing session; the returned sid must then match.
    async fn connect_session(
        &self,
        sid: Option<&SessionId>,
    ) -> Result<(SessionId, Box<dyn BackendConn>), GatewayError>;

    /// Open the control (status) channel with a gateway-owned sid.
    /// Single attempt; the status listener owns the retry policy.
    async fn connect_control(&self, sid: &SessionId) -> Result<Box<dyn BackendConn>, GatewayError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tungstenite-backed engine connection.
pub struct EngineConn {
    stream: WsStream,
}

#[async_trait]
impl BackendConn for EngineConn {
    async fn recv(&mut self) -> Result<BackendFrame, GatewayError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(BackendFrame::Text(text.to_string())),
                Some(Ok(Message::Binary(data))) => return Ok(BackendFrame::Binary(data.to_vec())),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(GatewayError::BackendUnavailable("connection closed".to_string()))
                }
                Some(Ok(_)) => continue, // Ping/Pong
                Some(Err(e)) => return Err(GatewayError::BackendUnavailable(e.to_string())),
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), GatewayError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| GatewayError::BackendUnavailable(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Dialer for a real engine at a fixed base URL.
pub struct EngineDialer {
    /// HTTP base URL, e.g. `http://127.0.0.1:8188`.
    base_url: String,
}

impl EngineDialer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }

    fn ws_url(&self, path_and_query: &str) -> String {
        // ws:// mirrors http://, wss:// mirrors https://.
        let base = self.base_url.replacen("http", "ws", 1);
        format!("{base}{path_and_query}")
    }

    async fn dial(&self, path_and_query: &str) -> Result<WsStream, GatewayError> {
        let url = self.ws_url(path_and_query);
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| GatewayError::BackendUnavailable(format!("dial {url}: {e}")))?;
        Ok(stream)
    }

    /// Dial a channel and consume its handshake frame.
    async fn dial_with_handshake(
        &self,
        path_and_query: &str,
    ) -> Result<(SessionId, EngineConn), GatewayError> {
        let mut conn = EngineConn { stream: self.dial(path_and_query).await? };
        let sid = match conn.recv().await {
            Ok(BackendFrame::Text(text)) => match parse_handshake(&text) {
                Ok(sid) => sid,
                Err(e) => {
                    conn.close().await;
                    return Err(GatewayError::ProtocolViolation(e.to_string()));
                }
            },
            Ok(BackendFrame::Binary(_)) => {
                conn.close().await;
                return Err(GatewayError::ProtocolViolation(
                    "binary frame before handshake".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };
        Ok((sid, conn))
    }

    async fn try_session(
        &self,
        sid: Option<&SessionId>,
    ) -> Result<(SessionId, EngineConn), GatewayError> {
        let path = match sid {
            Some(sid) => format!("/comfy-api/ws?clientId={sid}"),
            None => "/comfy-api/ws".to_string(),
        };
        let (returned, mut conn) = self.dial_with_handshake(&path).await?;
        if let Some(requested) = sid {
            if returned != *requested {
                conn.close().await;
                return Err(GatewayError::ProtocolViolation(format!(
                    "engine returned sid {returned} for requested {requested}"
                )));
            }
        }
        Ok((returned, conn))
    }
}

#[async_trait]
impl BackendDialer for EngineDialer {
    async fn connect_session(
        &self,
        sid: Option<&SessionId>,
    ) -> Result<(SessionId, Box<dyn BackendConn>), GatewayError> {
        for attempt in 1..=MAX_RETRIES {
            match self.try_session(sid).await {
                Ok((sid, conn)) => {
                    info!(%sid, attempt, "connected to engine session channel");
                    return Ok((sid, Box::new(conn)));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "engine session dial failed");
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(GatewayError::BackendUnavailable(format!(
            "no engine session after {MAX_RETRIES} attempts"
        )))
    }

    async fn connect_control(&self, sid: &SessionId) -> Result<Box<dyn BackendConn>, GatewayError> {
        let (returned, mut conn) = self.dial_with_handshake(&format!("/ws?clientId={sid}")).await?;
        if returned != *sid {
            conn.close().await;
            return Err(GatewayError::ProtocolViolation(format!(
                "control channel answered with sid {returned}, expected {sid}"
            )));
        }
        Ok(Box::new(conn))
    }
}

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;
