// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow loading and graph analysis.
//!
//! Workflow files are API-format JSON: a flat map of node id to node
//! definition. UI-format exports (which carry a top-level `nodes` array)
//! are rejected. Analysis classifies the per-request attachment points by
//! class-type prefix and derives the edge structure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use easel_core::{GatewayError, WorkflowDescriptor, WorkflowEdge, WorkflowImageOutput, WorkflowInput};
use indexmap::IndexMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// External input nodes take a caller-supplied `input_id` value.
pub const EXTERNAL_INPUT_PREFIX: &str = "ComfyUIDeployExternal";

/// Websocket image output nodes, including the misspelled class names
/// older engine plugin versions shipped with.
pub const IMAGE_OUTPUT_PREFIXES: [&str; 4] = [
    "ComfyDeployWebscoketImageOutput",
    "ComfyDeployWebsocketImageOutput",
    "ComfyUIDeployWebscoketImageOutput",
    "ComfyUIDeployWebsocketImageOutput",
];

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow {0} is not an API-format definition")]
    NotApiFormat(String),

    #[error("failed to read workflow file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse workflow file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Loads and analyzes workflow files from a set of directories, caching
/// descriptors by workflow id. Later directories override earlier ones.
pub struct WorkflowStore {
    dirs: Vec<PathBuf>,
    cache: Mutex<HashMap<String, WorkflowDescriptor>>,
}

impl WorkflowStore {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs, cache: Mutex::new(HashMap::new()) }
    }

    /// Sorted ids of every valid workflow with at least one external input.
    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .workflow_files()
            .into_iter()
            .filter_map(|(id, path)| match self.load(&id, &path) {
                Ok(descriptor) if !descriptor.inputs.is_empty() => Some(id),
                Ok(_) => None,
                Err(e) => {
                    debug!(workflow_id = id, error = %e, "skipping workflow");
                    None
                }
            })
            .collect();
        ids.sort();
        ids
    }

    /// The cached descriptor for a workflow id.
    pub fn descriptor(&self, workflow_id: &str) -> Result<WorkflowDescriptor, GatewayError> {
        if let Some(descriptor) = self.cache.lock().get(workflow_id) {
            return Ok(descriptor.clone());
        }
        let path = self
            .workflow_files()
            .remove(workflow_id)
            .ok_or_else(|| GatewayError::not_found(format!("workflow {workflow_id}")))?;
        self.load(workflow_id, &path)
            .map_err(|e| GatewayError::not_found(format!("workflow {workflow_id}: {e}")))
    }

    fn load(&self, workflow_id: &str, path: &Path) -> Result<WorkflowDescriptor, WorkflowError> {
        if let Some(descriptor) = self.cache.lock().get(workflow_id) {
            return Ok(descriptor.clone());
        }
        let raw = std::fs::read_to_string(path)?;
        let workflow: IndexMap<String, serde_json::Value> = serde_json::from_str(&raw)?;
        let descriptor = analyze_workflow(workflow_id, workflow)?;
        self.cache.lock().insert(workflow_id.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    /// Map of workflow id to file path across all configured directories.
    fn workflow_files(&self) -> HashMap<String, PathBuf> {
        let mut files = HashMap::new();
        for dir in &self.dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue; // missing or unreadable directory
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        files.insert(stem.to_string(), path);
                    }
                }
            }
        }
        files
    }
}

/// True when the input value is an edge reference `[source_node_id, output_index]`.
fn is_edge_ref(value: &serde_json::Value) -> bool {
    value.as_array().is_some_and(|arr| !arr.is_empty() && arr[0].is_string())
}

/// Analyze an API-format workflow into a descriptor.
pub fn analyze_workflow(
    workflow_id: &str,
    workflow: IndexMap<String, serde_json::Value>,
) -> Result<WorkflowDescriptor, WorkflowError> {
    // UI exports have a top-level `nodes` array instead of a node map.
    if workflow.contains_key("nodes") {
        return Err(WorkflowError::NotApiFormat(workflow_id.to_string()));
    }

    let node_ids: Vec<&String> =
        workflow.iter().filter(|(_, n)| n.get("class_type").is_some()).map(|(id, _)| id).collect();
    let mut incoming: HashMap<&str, usize> = node_ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut outgoing: HashMap<&str, usize> = node_ids.iter().map(|id| (id.as_str(), 0)).collect();

    let mut edges = Vec::new();
    let mut external_parameters: IndexMap<String, IndexMap<String, serde_json::Value>> =
        IndexMap::new();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    for (node_id, node) in &workflow {
        let Some(class_type) = node.get("class_type").and_then(|v| v.as_str()) else {
            continue;
        };
        let node_inputs = node.get("inputs").and_then(|v| v.as_object());

        let mut literals: IndexMap<String, serde_json::Value> = IndexMap::new();
        if let Some(node_inputs) = node_inputs {
            for (param, value) in node_inputs {
                if is_edge_ref(value) {
                    let source = value[0].as_str().unwrap_or_default().to_string();
                    // Count degrees only for edges between known nodes.
                    if incoming.contains_key(source.as_str()) {
                        if let Some(count) = incoming.get_mut(node_id.as_str()) {
                            *count += 1;
                        }
                        if let Some(count) = outgoing.get_mut(source.as_str()) {
                            *count += 1;
                        }
                    }
                    edges.push(WorkflowEdge {
                        from: source,
                        to: node_id.clone(),
                        parameter: param.clone(),
                    });
                } else {
                    literals.insert(param.clone(), value.clone());
                }
            }
        }
        if !literals.is_empty() {
            external_parameters.insert(node_id.clone(), literals);
        }

        if class_type.starts_with(EXTERNAL_INPUT_PREFIX) {
            let get = |key: &str| node_inputs.and_then(|m| m.get(key)).cloned();
            let get_str = |key: &str| {
                node_inputs.and_then(|m| m.get(key)).and_then(|v| v.as_str()).map(String::from)
            };
            inputs.push(WorkflowInput {
                node_id: node_id.clone(),
                value: get("input_id").unwrap_or(serde_json::Value::Null),
                node_type: Some(class_type.to_string()),
                display_name: get_str("display_name"),
                description: get_str("description"),
            });
        }
        if IMAGE_OUTPUT_PREFIXES.iter().any(|p| class_type.starts_with(p)) {
            outputs.push(WorkflowImageOutput {
                node_id: node_id.clone(),
                node_type: class_type.to_string(),
                connection_id: String::new(),
                output_id: String::new(),
            });
        }
    }

    let source_ids = node_ids
        .iter()
        .filter(|id| {
            incoming.get(id.as_str()).copied() == Some(0)
                && workflow
                    .get(id.as_str())
                    .and_then(|n| n.get("inputs"))
                    .and_then(|v| v.as_object())
                    .is_some_and(|m| !m.is_empty())
        })
        .map(|id| (*id).clone())
        .collect();
    let sink_ids = node_ids
        .iter()
        .filter(|id| outgoing.get(id.as_str()).copied() == Some(0))
        .map(|id| (*id).clone())
        .collect();

    Ok(WorkflowDescriptor {
        workflow_id: workflow_id.to_string(),
        nodes: workflow,
        edges,
        source_ids,
        sink_ids,
        external_parameters,
        inputs,
        outputs,
    })
}

#[cfg(test)]
#[path = "workflows_tests.rs"]
mod tests;
