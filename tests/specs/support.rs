// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness: an in-process fake engine and a freshly wired gateway.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message;

use easel_gateway::{
    router, AppState, ConnectionManager, EngineDialer, HttpEngineApi, JobRegistry, StatusListener,
    Submitter, WorkflowStore,
};

pub const API_KEY: &str = "spec-secret";

type Channels = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>;

/// The engine's side of the protocol: one WebSocket server for the session
/// and control channels, one HTTP stub for `POST /prompt`.
pub struct FakeEngine {
    /// Base for WebSocket dials (the gateway's dialer turns http into ws).
    pub ws_base: String,
    /// Base for job submission.
    pub http_base: String,
    sessions: Channels,
    controls: Channels,
    pub prompts: Arc<Mutex<Vec<Value>>>,
}

impl FakeEngine {
    pub async fn spawn() -> Self {
        let sessions: Channels = Arc::new(Mutex::new(HashMap::new()));
        let controls: Channels = Arc::new(Mutex::new(HashMap::new()));
        let prompts: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));

        // WebSocket half.
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws_listener.local_addr().unwrap();
        {
            let sessions = sessions.clone();
            let controls = controls.clone();
            tokio::spawn(async move {
                let mut counter = 0usize;
                while let Ok((stream, _)) = ws_listener.accept().await {
                    counter += 1;
                    let sessions = sessions.clone();
                    let controls = controls.clone();
                    tokio::spawn(serve_ws(stream, counter, sessions, controls));
                }
            });
        }

        // HTTP half.
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http_listener.local_addr().unwrap();
        {
            let prompts = prompts.clone();
            let app = Router::new().route("/prompt", post(prompt_handler)).with_state(prompts);
            tokio::spawn(async move {
                let _ = axum::serve(http_listener, app).await;
            });
        }

        Self {
            ws_base: format!("http://{ws_addr}"),
            http_base: format!("http://{http_addr}"),
            sessions,
            controls,
            prompts,
        }
    }

    /// Block until the gateway's status listener is connected; returns its sid.
    pub async fn wait_for_control(&self) -> String {
        wait_for(|| self.controls.lock().unwrap().keys().next().cloned()).await
    }

    pub async fn wait_for_session(&self, sid: &str) {
        let sid = sid.to_string();
        wait_for(|| self.sessions.lock().unwrap().contains_key(&sid).then_some(())).await;
    }

    /// Publish a control-channel event to the gateway.
    pub fn send_control(&self, sid: &str, text: &str) {
        let controls = self.controls.lock().unwrap();
        controls[sid].send(Message::Text(text.to_string().into())).unwrap();
    }

    /// Stream an image frame on a session channel: 8-byte engine header
    /// plus the payload.
    pub fn send_session_image(&self, sid: &str, payload: &[u8]) {
        let mut frame = vec![0, 0, 0, 1, 0, 0, 0, 0];
        frame.extend_from_slice(payload);
        let sessions = self.sessions.lock().unwrap();
        sessions[sid].send(Message::Binary(frame.into())).unwrap();
    }

    /// Close a session channel from the engine side.
    pub fn kill_session(&self, sid: &str) {
        if let Some(tx) = self.sessions.lock().unwrap().remove(sid) {
            let _ = tx.send(Message::Close(None));
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

async fn prompt_handler(
    State(prompts): State<Arc<Mutex<Vec<Value>>>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let mut prompts = prompts.lock().unwrap();
    prompts.push(body);
    Json(json!({ "prompt_id": format!("P{}", prompts.len()) }))
}

/// Serve one engine-side WebSocket connection: handshake frame first, then
/// forward whatever the test scripts through the channel registry.
async fn serve_ws(
    stream: tokio::net::TcpStream,
    counter: usize,
    sessions: Channels,
    controls: Channels,
) {
    let uri: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let seen_uri = uri.clone();
    let callback = move |request: &WsRequest, response: WsResponse| {
        *seen_uri.lock().unwrap() = request.uri().to_string();
        Ok(response)
    };
    let Ok(mut ws) = accept_hdr_async(stream, callback).await else {
        return;
    };

    let uri = uri.lock().unwrap().clone();
    let is_session = uri.starts_with("/comfy-api/ws");
    let sid = uri
        .split_once("clientId=")
        .map(|(_, sid)| sid.to_string())
        .unwrap_or_else(|| format!("engine{counter:04}"));

    let handshake = format!(r#"{{"event":"status","data":{{"sid":"{sid}"}}}}"#);
    if ws.send(Message::Text(handshake.into())).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let registry = if is_session { &sessions } else { &controls };
    registry.lock().unwrap().insert(sid.clone(), tx);

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if ws.send(message).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
            incoming = ws.next() => match incoming {
                Some(Ok(_)) => {} // the fake engine ignores inbound traffic
                _ => break,
            },
        }
    }
    registry.lock().unwrap().remove(&sid);
}

/// A gateway wired to a fake engine, listening on an ephemeral port.
pub struct TestGateway {
    pub base: String,
    _workflows: tempfile::TempDir,
}

impl TestGateway {
    pub async fn spawn(engine: &FakeEngine) -> Self {
        let workflows = tempfile::tempdir().unwrap();
        std::fs::write(
            workflows.path().join("hello.json"),
            sample_workflow().to_string(),
        )
        .unwrap();

        let dialer = Arc::new(EngineDialer::new(engine.ws_base.clone()));
        let connections = ConnectionManager::new(dialer.clone());
        let registry = Arc::new(JobRegistry::new());
        let listener = Arc::new(StatusListener::new(dialer, registry.clone()));
        let store = Arc::new(WorkflowStore::new(vec![workflows.path().to_path_buf()]));
        let submitter = Arc::new(Submitter::new(
            store.clone(),
            registry.clone(),
            connections.clone(),
            Arc::new(HttpEngineApi::new(engine.http_base.clone())),
            listener.sid().clone(),
        ));

        tokio::spawn(async move {
            let _ = listener.run().await;
        });

        let app = router(AppState {
            api_key: API_KEY.to_string(),
            connections,
            registry,
            submitter,
            store,
            engine: None,
        });
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(tcp, app).await;
        });

        Self { base: format!("http://{addr}"), _workflows: workflows }
    }

    pub fn ws_register_url(&self) -> String {
        format!("{}/ws/register", self.base.replacen("http", "ws", 1))
    }
}

fn sample_workflow() -> Value {
    json!({
        "in1": {
            "class_type": "ComfyUIDeployExternalImage",
            "inputs": {
                "input_id": "https://example.com/default.png",
                "display_name": "Source image",
                "description": "Image to transform"
            }
        },
        "scale": {
            "class_type": "ImageScale",
            "inputs": { "image": ["in1", 0], "width": 512, "height": 512 }
        },
        "out1": {
            "class_type": "ComfyUIDeployWebsocketImageOutput",
            "inputs": { "images": ["scale", 0], "output_id": "", "client_id": "" }
        }
    })
}

/// Poll a probe until it yields, for at most ten seconds.
pub async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..1000 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within ten seconds");
}
