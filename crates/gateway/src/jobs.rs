// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job registry: prompt-id keyed state for in-flight workflows.
//!
//! Three TTL maps with a 24 h idle timeout. Create and terminal cleanup
//! touch all three; the per-event refresh touches only `prompt_id → Job`,
//! whose TTL is the one that reflects job liveness.

use std::sync::Arc;
use std::time::Duration;

use easel_core::{Clock, IdleMap, Job, JobState, PromptId, RequestId, SystemClock};
use easel_wire::EngineEvent;
use futures_util::future::BoxFuture;
use tracing::debug;

pub const JOB_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24);

/// Async callback fired with a job snapshot after every handled status
/// event, starting with the initial `queued` one.
pub type StatusCallback = Arc<dyn Fn(Job) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct JobRegistry<C: Clock = SystemClock> {
    jobs: IdleMap<Job, C>,
    callbacks: IdleMap<StatusCallback, C>,
    requests: IdleMap<PromptId, C>,
}

impl JobRegistry<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for JobRegistry<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> JobRegistry<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            jobs: IdleMap::with_clock(JOB_IDLE_TIMEOUT, clock.clone()),
            callbacks: IdleMap::with_clock(JOB_IDLE_TIMEOUT, clock.clone()),
            requests: IdleMap::with_clock(JOB_IDLE_TIMEOUT, clock),
        }
    }

    /// Register a freshly submitted job in all three maps.
    pub async fn insert(&self, job: Job, callback: StatusCallback) {
        let prompt_id = job.prompt_id.clone();
        let request_id = job.request_id.clone();
        self.requests.set(request_id.as_str(), prompt_id.clone()).await;
        self.callbacks.set(prompt_id.as_str(), callback).await;
        self.jobs.set(prompt_id.as_str(), job).await;
    }

    pub async fn job(&self, prompt_id: &PromptId) -> Option<Job> {
        self.jobs.get(prompt_id.as_str()).await
    }

    pub async fn prompt_for_request(&self, request_id: &RequestId) -> Option<PromptId> {
        self.requests.get(request_id.as_str()).await
    }

    pub async fn contains_callback(&self, prompt_id: &PromptId) -> bool {
        self.callbacks.contains(prompt_id.as_str()).await
    }

    /// Apply a decoded control-channel event.
    ///
    /// Refreshes the job's TTL, advances its state, fires the status
    /// callback with the updated snapshot, and on a terminal state removes
    /// the job, the callback, and the request mapping. Events for unknown
    /// prompts, or prompts whose callback is gone, are dropped.
    pub async fn handle_event(&self, event: &EngineEvent) -> Option<Job> {
        let prompt_id = event.prompt_id();
        self.jobs.refresh(prompt_id.as_str()).await;

        let mut job = self.jobs.get(prompt_id.as_str()).await?;
        let callback = self.callbacks.get(prompt_id.as_str()).await?;

        match event {
            EngineEvent::Start { .. } => job.state = JobState::Running,
            EngineEvent::Executing { node, .. } => {
                job.state = JobState::Running;
                job.executing_node_id = node.clone();
            }
            EngineEvent::Success { .. } | EngineEvent::Cached { .. } => {
                job.state = JobState::Completed
            }
            EngineEvent::Error { .. } => job.state = JobState::Failed,
            EngineEvent::Interrupted { .. } => job.state = JobState::Interrupted,
            EngineEvent::Unknown { kind, .. } => {
                debug!(%prompt_id, kind, "ignoring engine event");
                return None;
            }
        }

        self.jobs.set(prompt_id.as_str(), job.clone()).await;
        callback(job.clone()).await;

        if job.state.is_terminal() {
            self.remove(&job).await;
        }
        Some(job)
    }

    /// Drop a job from all three maps.
    pub async fn remove(&self, job: &Job) {
        self.jobs.pop(job.prompt_id.as_str()).await;
        self.callbacks.pop(job.prompt_id.as_str()).await;
        self.requests.pop(job.request_id.as_str()).await;
    }

    /// Sweep all three maps once.
    pub async fn sweep(&self) {
        self.jobs.sweep().await;
        self.callbacks.sweep().await;
        self.requests.sweep().await;
    }

    /// Periodic TTL sweep over the job maps.
    pub async fn run_sweep_forever(&self, interval: Duration) {
        loop {
            self.sweep().await;
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
#[path = "jobs_tests.rs"]
mod tests;
