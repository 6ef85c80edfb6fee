// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end gateway scenarios against the fake engine.

use futures_util::StreamExt;
use serde_json::Value;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use crate::support::{wait_for, FakeEngine, TestGateway, API_KEY};

type ClientWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn register_client(gateway: &TestGateway, resume: Option<&str>) -> (ClientWs, String) {
    let url = match resume {
        Some(cid) => format!("{}?cid={cid}", gateway.ws_register_url()),
        None => gateway.ws_register_url(),
    };
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert("token", API_KEY.parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let hello = next_text(&mut ws).await;
    let hello: Value = serde_json::from_str(&hello).unwrap();
    let cid = hello["uuid"].as_str().unwrap().to_string();
    (ws, cid)
}

async fn next_text(ws: &mut ClientWs) -> String {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return text.to_string(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn next_binary(ws: &mut ClientWs) -> Vec<u8> {
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Binary(bytes) => return bytes.to_vec(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected a binary frame, got {other:?}"),
        }
    }
}

async fn queue_workflow(gateway: &TestGateway, cid: &str) -> String {
    let response = reqwest::Client::new()
        .post(format!("{}/workflows/hello/queue?websocket_cid={cid}", gateway.base))
        .header("X-API-Key", API_KEY)
        .json(&serde_json::json!([{ "node_id": "in1", "value": "https://ex/img.png" }]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    body["request_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn happy_path_streams_status_and_image_frames() {
    let engine = FakeEngine::spawn().await;
    let gateway = TestGateway::spawn(&engine).await;
    let control_sid = engine.wait_for_control().await;

    let (mut ws, cid) = register_client(&gateway, None).await;
    assert_eq!(cid.len(), 32);

    let request_id = queue_workflow(&gateway, &cid).await;
    assert_eq!(request_id.len(), 24);
    assert!(request_id.chars().all(|c| c.is_ascii_hexdigit()));

    // The engine received the rewritten descriptor, tagged with the
    // status listener's sid.
    let prompt = wait_for(|| engine.prompts.lock().unwrap().first().cloned()).await;
    assert_eq!(prompt["client_id"].as_str().unwrap(), control_sid);
    assert_eq!(prompt["prompt"]["in1"]["inputs"]["input_id"], "https://ex/img.png");
    assert_eq!(prompt["prompt"]["out1"]["inputs"]["output_id"], request_id.as_str());
    let session_sid = prompt["prompt"]["out1"]["inputs"]["client_id"].as_str().unwrap().to_string();

    // Drive the job through its lifecycle on the control channel.
    engine.send_control(
        &control_sid,
        r#"{"type":"execution_start","data":{"prompt_id":"P1"}}"#,
    );
    engine.send_control(
        &control_sid,
        r#"{"type":"execution_success","data":{"prompt_id":"P1"}}"#,
    );

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let frame: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(frame["type"], "workflow_status");
        assert_eq!(frame["request_id"].as_str().unwrap(), request_id);
        statuses.push(frame["status"].as_str().unwrap().to_string());
    }
    assert_eq!(statuses, ["queued", "running", "completed"]);

    // Image output arrives on the same socket with the engine header gone.
    engine.send_session_image(&session_sid, b"fake png bytes");
    assert_eq!(next_binary(&mut ws).await, b"fake png bytes");

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn ws_register_rejects_a_bad_token() {
    let engine = FakeEngine::spawn().await;
    let gateway = TestGateway::spawn(&engine).await;

    let mut request = gateway.ws_register_url().into_client_request().unwrap();
    request.headers_mut().insert("token", "wrong".parse().unwrap());
    let error = tokio_tungstenite::connect_async(request).await.unwrap_err();
    let message = error.to_string();
    assert!(message.contains("401"), "unexpected handshake error: {message}");
}

#[tokio::test]
async fn resumed_cid_is_honored_after_a_disconnect() {
    let engine = FakeEngine::spawn().await;
    let gateway = TestGateway::spawn(&engine).await;

    let (ws, cid) = register_client(&gateway, None).await;
    wait_for(|| (engine.session_count() == 1).then_some(())).await;

    // A clean disconnect tears the pair down, backend included.
    drop(ws);
    wait_for(|| (engine.session_count() == 0).then_some(())).await;

    // Registering again with the old cid keeps the identity and pairs it
    // with a fresh engine session.
    let (_ws2, cid2) = register_client(&gateway, Some(&cid)).await;
    assert_eq!(cid2, cid);
    wait_for(|| (engine.session_count() == 1).then_some(())).await;
}

#[tokio::test]
async fn backend_loss_reconnects_with_the_same_sid() {
    let engine = FakeEngine::spawn().await;
    let gateway = TestGateway::spawn(&engine).await;
    let _control_sid = engine.wait_for_control().await;

    let (mut ws, cid) = register_client(&gateway, None).await;
    let _request_id = queue_workflow(&gateway, &cid).await;
    let prompt = wait_for(|| engine.prompts.lock().unwrap().first().cloned()).await;
    let session_sid = prompt["prompt"]["out1"]["inputs"]["client_id"].as_str().unwrap().to_string();

    // Swallow the queued status frame, then cut the session channel.
    let _ = next_text(&mut ws).await;
    engine.kill_session(&session_sid);

    // The gateway reattaches the same session id and frames keep flowing.
    engine.wait_for_session(&session_sid).await;
    engine.send_session_image(&session_sid, b"after reconnect");
    assert_eq!(next_binary(&mut ws).await, b"after reconnect");
}
