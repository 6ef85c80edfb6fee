// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frames spoken by the engine.
//!
//! Control channel (`/ws?clientId=`): text JSON `{"type": ..., "data": {...}}`.
//! Session channel (`/comfy-api/ws`): a text handshake frame first
//! (`{"event":"status","data":{"sid":...}}`), then binary image frames with
//! an 8-byte header (4-byte big-endian event type + 4 bytes of metadata).

use easel_core::{PromptId, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the engine's internal binary frame header. The gateway strips
/// the whole header before forwarding the payload to a client.
pub const FRAME_HEADER_LEN: usize = 8;

/// Errors from decoding engine frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed engine frame: {0}")]
    Malformed(String),

    #[error("handshake frame missing sid")]
    MissingSid,
}

/// Decoded control-channel event.
///
/// Every variant except `Unknown` drives the job state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Start { prompt_id: PromptId },
    Executing { prompt_id: PromptId, node: Option<String> },
    Success { prompt_id: PromptId },
    Error { prompt_id: PromptId },
    Interrupted { prompt_id: PromptId },
    Cached { prompt_id: PromptId },
    Unknown { prompt_id: PromptId, kind: String },
}

#[derive(Deserialize)]
struct RawControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: RawControlData,
}

#[derive(Default, Deserialize)]
struct RawControlData {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    node: Option<String>,
}

impl EngineEvent {
    /// Parse a control-channel text frame.
    ///
    /// Returns `Ok(None)` for well-formed frames that carry no prompt id
    /// (the engine publishes queue/monitor chatter on the same channel).
    pub fn parse(text: &str) -> Result<Option<EngineEvent>, FrameError> {
        let raw: RawControlFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
        let Some(prompt_id) = raw.data.prompt_id else {
            return Ok(None);
        };
        let prompt_id = PromptId::from_string(prompt_id);
        let event = match raw.kind.as_str() {
            "execution_start" => EngineEvent::Start { prompt_id },
            "executing" => EngineEvent::Executing { prompt_id, node: raw.data.node },
            "execution_success" => EngineEvent::Success { prompt_id },
            "execution_error" => EngineEvent::Error { prompt_id },
            "execution_interrupted" => EngineEvent::Interrupted { prompt_id },
            "execution_cached" => EngineEvent::Cached { prompt_id },
            _ => EngineEvent::Unknown { prompt_id, kind: raw.kind },
        };
        Ok(Some(event))
    }

    pub fn prompt_id(&self) -> &PromptId {
        match self {
            EngineEvent::Start { prompt_id }
            | EngineEvent::Executing { prompt_id, .. }
            | EngineEvent::Success { prompt_id }
            | EngineEvent::Error { prompt_id }
            | EngineEvent::Interrupted { prompt_id }
            | EngineEvent::Cached { prompt_id }
            | EngineEvent::Unknown { prompt_id, .. } => prompt_id,
        }
    }
}

#[derive(Deserialize)]
struct RawHandshake {
    event: String,
    data: RawHandshakeData,
}

#[derive(Deserialize)]
struct RawHandshakeData {
    #[serde(default)]
    sid: Option<String>,
}

/// Parse the first frame of a session or control connection.
pub fn parse_handshake(text: &str) -> Result<SessionId, FrameError> {
    let raw: RawHandshake =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
    if raw.event != "status" {
        return Err(FrameError::Malformed(format!("unexpected handshake event {:?}", raw.event)));
    }
    match raw.data.sid {
        Some(sid) if !sid.is_empty() => Ok(SessionId::from_string(sid)),
        _ => Err(FrameError::MissingSid),
    }
}

/// Strip the engine's binary frame header, returning the image payload.
///
/// Returns `None` for frames shorter than the header; those are dropped as
/// protocol violations rather than forwarded truncated.
pub fn strip_frame_header(frame: &[u8]) -> Option<&[u8]> {
    frame.get(FRAME_HEADER_LEN..)
}

/// Body of `POST /prompt`.
#[derive(Debug, Serialize)]
pub struct SubmitBody {
    pub prompt: serde_json::Value,
    /// The status listener's sid; lifecycle events for this prompt are
    /// published to that control channel.
    pub client_id: SessionId,
}

/// Successful reply to `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitReply {
    pub prompt_id: PromptId,
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
