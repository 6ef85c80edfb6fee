// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow job model and its state machine.

use serde::{Deserialize, Serialize};

use crate::id::{PromptId, RequestId, SessionId};
use crate::workflow::WorkflowDescriptor;

/// Lifecycle state of a submitted workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl JobState {
    /// Terminal states release the job from the registry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Interrupted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A submitted workflow execution.
///
/// Created on a successful submit and removed on a terminal status event,
/// on TTL expiry, or at gateway shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub prompt_id: PromptId,
    pub request_id: RequestId,
    /// Session the engine streams image frames to.
    pub sid: SessionId,
    /// The rewritten descriptor this job was submitted with.
    pub descriptor: WorkflowDescriptor,
    pub executing_node_id: Option<String>,
    pub state: JobState,
}

impl Job {
    pub fn queued(
        prompt_id: PromptId,
        request_id: RequestId,
        sid: SessionId,
        descriptor: WorkflowDescriptor,
    ) -> Self {
        Self {
            prompt_id,
            request_id,
            sid,
            descriptor,
            executing_node_id: None,
            state: JobState::Queued,
        }
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
