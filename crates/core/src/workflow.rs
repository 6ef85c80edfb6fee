// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow descriptor data model.
//!
//! A descriptor is the analyzed form of an API-format workflow file: the
//! node graph plus the per-request attachment points (external input nodes
//! and websocket image output nodes). Descriptors are read-mostly; request
//! handling rewrites a fresh copy, never a cached one.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A caller-suppliable input binding on an external input node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub node_id: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A websocket image output node, rewritten per request with the
/// destination session and the request id the frames belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowImageOutput {
    pub node_id: String,
    pub node_type: String,
    pub connection_id: String,
    pub output_id: String,
}

/// A dataflow edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
    pub parameter: String,
}

/// Analyzed workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    pub workflow_id: String,
    /// Node definitions keyed by node id, in file order. This is the map
    /// that gets rewritten and submitted to the engine.
    pub nodes: IndexMap<String, serde_json::Value>,
    pub edges: Vec<WorkflowEdge>,
    /// Nodes with inputs but no incoming edges.
    pub source_ids: Vec<String>,
    /// Nodes with no outgoing edges.
    pub sink_ids: Vec<String>,
    /// Literal (non-edge) input values per node.
    pub external_parameters: IndexMap<String, IndexMap<String, serde_json::Value>>,
    pub inputs: Vec<WorkflowInput>,
    pub outputs: Vec<WorkflowImageOutput>,
}
