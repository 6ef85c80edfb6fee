// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine process supervisor.
//!
//! Spawns the engine as a child process, re-logs its output, learns the
//! advertised address from the startup banner, and probes the HTTP root
//! until the engine answers. Shutdown is SIGINT first, SIGKILL after a
//! grace period.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::EngineConfig;

/// Marker line the engine prints once its HTTP server is up.
const ADDRESS_BANNER: &str = "go to: ";

const START_TIMEOUT_S: u32 = 20;
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    NotRunning,
    Starting,
    Running,
    Error,
}

struct ProcessState {
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct EngineProcess {
    config: EngineConfig,
    // Serializes start/stop/status transitions.
    state: Mutex<ProcessState>,
    address: SyncMutex<Option<String>>,
    http: reqwest::Client,
}

impl EngineProcess {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let address = SyncMutex::new(config.address.clone());
        Arc::new(Self {
            config,
            state: Mutex::new(ProcessState { child: None, tasks: Vec::new() }),
            address,
            http: reqwest::Client::new(),
        })
    }

    /// The engine's base URL, configured or scraped from its banner.
    pub fn address(&self) -> Option<String> {
        self.address.lock().clone()
    }

    /// Start the engine child process. Idempotent while running.
    pub async fn start(self: &Arc<Self>) -> EngineStatus {
        let mut state = self.state.lock().await;
        if self.check_running(&mut state).await {
            info!("engine is already running");
            return EngineStatus::Running;
        }

        let (Some(interpreter), Some(script), Some(workspace)) = (
            self.config.interpreter_path(),
            self.config.main_script(),
            self.config.workspace_path.clone(),
        ) else {
            error!("engine install or workspace path not configured");
            return EngineStatus::Error;
        };

        info!(?interpreter, ?script, "starting engine");
        let spawned = Command::new(interpreter)
            .arg(script)
            .arg("--listen")
            .arg(&self.config.listen_address)
            .arg("--port")
            .arg(self.config.listen_port.to_string())
            .arg("--base-directory")
            .arg(workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                error!(error = %e, "failed to spawn engine");
                return EngineStatus::NotRunning;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            state.tasks.push(tokio::spawn(stream_reader(stdout, "stdout", self.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            state.tasks.push(tokio::spawn(stream_reader(stderr, "stderr", self.clone())));
        }

        // Give the process a moment to fail fast on a broken install.
        tokio::time::sleep(Duration::from_secs(1)).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                error!(%status, "engine exited during startup");
                return EngineStatus::NotRunning;
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "engine status unavailable");
                return EngineStatus::Error;
            }
        }

        state.child = Some(child);
        state.tasks.push(tokio::spawn(self.clone().wait_for_start()));
        EngineStatus::Starting
    }

    /// Stop the engine child process: SIGINT, grace period, then SIGKILL.
    pub async fn stop(&self) -> EngineStatus {
        let mut state = self.state.lock().await;
        let Some(mut child) = state.child.take() else {
            return EngineStatus::NotRunning;
        };

        info!("stopping engine");
        let result = async {
            if let Some(id) = child.id() {
                let _ = kill(Pid::from_raw(id as i32), Signal::SIGINT);
            }
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(status) => status.map(|_| ()),
                Err(_) => {
                    info!("engine did not exit gracefully, killing");
                    child.kill().await
                }
            }
        }
        .await;

        for task in state.tasks.drain(..) {
            task.abort();
        }

        match result {
            Ok(()) => EngineStatus::NotRunning,
            Err(e) => {
                error!(error = %e, "error stopping engine");
                EngineStatus::Error
            }
        }
    }

    pub async fn status(&self) -> EngineStatus {
        let mut state = self.state.lock().await;
        if self.check_running(&mut state).await {
            EngineStatus::Running
        } else {
            EngineStatus::NotRunning
        }
    }

    /// Wait for the engine's HTTP root to answer, then declare it started.
    async fn wait_for_start(self: Arc<Self>) {
        for _ in 0..START_TIMEOUT_S {
            if self.probe_http().await {
                info!(address = ?self.address(), "engine is up");
                return;
            }
            info!("waiting for engine to start");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        error!("engine did not start within the timeout period");
    }

    /// Process alive and HTTP root answering. Assumes the state lock is held.
    async fn check_running(&self, state: &mut ProcessState) -> bool {
        let alive = match state.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        alive && self.probe_http().await
    }

    async fn probe_http(&self) -> bool {
        let Some(address) = self.address() else {
            return false;
        };
        match self.http.get(&address).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn scan_banner(&self, line: &str) {
        if let Some(rest) = line.split(ADDRESS_BANNER).nth(1) {
            let address = rest.trim().trim_end_matches('/').to_string();
            if address.starts_with("http") {
                info!(%address, "engine advertised its address");
                *self.address.lock() = Some(address);
            }
        }
    }
}

/// Re-log one of the child's output streams line by line.
async fn stream_reader(
    pipe: impl AsyncRead + Unpin + Send + 'static,
    name: &'static str,
    engine: Arc<EngineProcess>,
) {
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                engine.scan_banner(&line);
                info!(target: "engine", "[{name}] {line}");
            }
            Ok(None) => break,
            Err(e) => {
                warn!(target: "engine", stream = name, error = %e, "stream read failed");
                break;
            }
        }
    }
}
