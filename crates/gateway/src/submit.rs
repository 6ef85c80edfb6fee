// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow submission.
//!
//! Rewrites a fresh copy of the analyzed descriptor with the caller's
//! input values and the output routing for this request, posts it to the
//! engine, and registers the resulting job.

use std::sync::Arc;

use async_trait::async_trait;
use easel_core::{
    Clock, ClientId, GatewayError, Job, PromptId, RequestId, SessionId, SystemClock,
    WorkflowDescriptor, WorkflowInput,
};
use easel_wire::{SubmitBody, SubmitReply, WorkflowStatusFrame};
use futures_util::FutureExt;
use tracing::{debug, info};

use crate::connections::{ClientFrame, ConnectionManager};
use crate::jobs::{JobRegistry, StatusCallback};
use crate::workflows::WorkflowStore;

/// The engine's job submission endpoint.
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn submit(&self, body: &SubmitBody) -> Result<PromptId, GatewayError>;
}

/// `POST /prompt` against a real engine.
pub struct HttpEngineApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEngineApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl EngineApi for HttpEngineApi {
    async fn submit(&self, body: &SubmitBody) -> Result<PromptId, GatewayError> {
        let response = self
            .client
            .post(format!("{}/prompt", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::SubmitFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::SubmitFailed(format!(
                "engine answered {}",
                response.status()
            )));
        }
        let reply: SubmitReply =
            response.json().await.map_err(|e| GatewayError::SubmitFailed(e.to_string()))?;
        Ok(reply.prompt_id)
    }
}

pub struct Submitter<C: Clock = SystemClock> {
    store: Arc<WorkflowStore>,
    registry: Arc<JobRegistry<C>>,
    connections: Arc<ConnectionManager<C>>,
    engine: Arc<dyn EngineApi>,
    /// The status listener's sid; every submission is tagged with it so
    /// lifecycle events land on the gateway's control channel.
    status_sid: SessionId,
}

impl<C: Clock> Submitter<C> {
    pub fn new(
        store: Arc<WorkflowStore>,
        registry: Arc<JobRegistry<C>>,
        connections: Arc<ConnectionManager<C>>,
        engine: Arc<dyn EngineApi>,
        status_sid: SessionId,
    ) -> Self {
        Self { store, registry, connections, engine, status_sid }
    }

    /// Queue a workflow for execution on behalf of a registered client.
    ///
    /// Returns the minted request id; status events and image frames for it
    /// arrive on the client's WebSocket.
    pub async fn queue_workflow(
        &self,
        cid: &ClientId,
        workflow_id: &str,
        inputs: Vec<WorkflowInput>,
    ) -> Result<RequestId, GatewayError> {
        let sid = self
            .connections
            .session_for_client(cid.as_str())
            .ok_or_else(|| GatewayError::not_found(format!("connection {cid}")))?;

        let descriptor = self.store.descriptor(workflow_id)?;
        let request_id = RequestId::mint();
        let rewritten = rewrite_descriptor(descriptor, inputs, &request_id, &sid)?;

        let prompt = serde_json::to_value(&rewritten.nodes)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        let body = SubmitBody { prompt, client_id: self.status_sid.clone() };
        let prompt_id = self.engine.submit(&body).await?;
        info!(%cid, workflow_id, %request_id, %prompt_id, "workflow queued");

        let job = Job::queued(prompt_id, request_id.clone(), sid, rewritten);
        let callback = self.status_callback(cid.clone());
        self.registry.insert(job.clone(), callback.clone()).await;
        callback(job).await;

        Ok(request_id)
    }

    /// Build the callback that pushes status frames to the client.
    fn status_callback(&self, cid: ClientId) -> StatusCallback {
        let connections = self.connections.clone();
        Arc::new(move |job: Job| {
            let connections = connections.clone();
            let cid = cid.clone();
            async move {
                let frame = WorkflowStatusFrame::new(job.request_id.clone(), job.state);
                let Ok(text) = serde_json::to_string(&frame) else {
                    return;
                };
                if let Err(e) = connections.send_to_client(cid.as_str(), ClientFrame::Text(text)).await
                {
                    debug!(%cid, request_id = %job.request_id, error = %e, "status frame not delivered");
                }
            }
            .boxed()
        })
    }
}

/// Produce the per-request descriptor: caller inputs written into their
/// nodes, output nodes routed at this request and session. The cached
/// descriptor is consumed by value; callers pass a clone.
pub fn rewrite_descriptor(
    mut descriptor: WorkflowDescriptor,
    inputs: Vec<WorkflowInput>,
    request_id: &RequestId,
    sid: &SessionId,
) -> Result<WorkflowDescriptor, GatewayError> {
    if !request_id.fits_engine_limit() {
        return Err(GatewayError::SubmitFailed(format!(
            "request id {request_id} exceeds the engine limit"
        )));
    }

    for input in &inputs {
        let node = descriptor.nodes.get_mut(&input.node_id).ok_or_else(|| {
            GatewayError::not_found(format!("input node {}", input.node_id))
        })?;
        let fields = node
            .get_mut("inputs")
            .and_then(|v| v.as_object_mut())
            .ok_or_else(|| GatewayError::SubmitFailed(format!(
                "node {} has no inputs object",
                input.node_id
            )))?;
        fields.insert("input_id".to_string(), input.value.clone());
    }
    descriptor.inputs = inputs;

    for output in &mut descriptor.outputs {
        output.output_id = request_id.to_string();
        output.connection_id = sid.to_string();
        let node = descriptor.nodes.get_mut(&output.node_id).ok_or_else(|| {
            GatewayError::not_found(format!("output node {}", output.node_id))
        })?;
        let fields = node
            .get_mut("inputs")
            .and_then(|v| v.as_object_mut())
            .ok_or_else(|| GatewayError::SubmitFailed(format!(
                "node {} has no inputs object",
                output.node_id
            )))?;
        fields.insert("output_id".to_string(), serde_json::Value::String(request_id.to_string()));
        fields.insert("client_id".to_string(), serde_json::Value::String(sid.to_string()));
    }

    Ok(descriptor)
}

#[cfg(test)]
#[path = "submit_tests.rs"]
mod tests;
