// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the gateway.
//!
//! Everything is read once at startup into a `GatewayConfig`; services get
//! the pieces they need by value. No hidden global settings.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Gateway listener and auth settings (`APP_*`).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: String,
    pub listen_address: String,
    pub listen_port: u16,
    pub engine: EngineConfig,
}

/// Engine process and address settings (`ENGINE_*`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of a running engine. When set, the gateway does not spawn
    /// the engine itself.
    pub address: Option<String>,
    pub install_path: Option<PathBuf>,
    pub workspace_path: Option<PathBuf>,
    pub listen_address: String,
    pub listen_port: u16,
    /// Extra directory of workflow JSON files, in addition to the engine
    /// workspace's own workflows directory.
    pub extra_workflows_dir: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: required("APP_API_KEY")?,
            listen_address: var_or("APP_LISTEN_ADDRESS", "127.0.0.1"),
            listen_port: port_or("APP_LISTEN_PORT", 8189)?,
            engine: EngineConfig::from_env()?,
        })
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            address: std::env::var("ENGINE_ADDRESS").ok().filter(|s| !s.is_empty()),
            install_path: std::env::var("ENGINE_INSTALL_PATH").ok().map(PathBuf::from),
            workspace_path: std::env::var("ENGINE_WORKSPACE_PATH").ok().map(PathBuf::from),
            listen_address: var_or("ENGINE_LISTEN_ADDRESS", "127.0.0.1"),
            listen_port: port_or("ENGINE_LISTEN_PORT", 8188)?,
            extra_workflows_dir: std::env::var("EASEL_WORKFLOWS_DIR").ok().map(PathBuf::from),
        })
    }

    /// Python interpreter inside the engine's virtualenv. Installers have
    /// shipped both `.venv` and `venv` layouts.
    pub fn interpreter_path(&self) -> Option<PathBuf> {
        let install = self.install_path.as_ref()?;
        let venv = install.join(".venv/bin/python");
        if venv.exists() {
            Some(venv)
        } else {
            Some(install.join("venv/bin/python"))
        }
    }

    pub fn main_script(&self) -> Option<PathBuf> {
        self.install_path.as_ref().map(|p| p.join("main.py"))
    }

    /// Where the engine workspace keeps its workflow files.
    pub fn workflows_path(&self) -> Option<PathBuf> {
        self.workspace_path.as_ref().map(|p| p.join("user/default/workflows"))
    }

    /// Address the engine is expected to answer on when none was scraped.
    pub fn default_address(&self) -> String {
        format!("http://{}:{}", self.listen_address, self.listen_port)
    }

    /// All directories scanned for workflow files, in override order.
    pub fn workflow_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(p) = self.workflows_path() {
            dirs.push(p);
        }
        if let Some(p) = &self.extra_workflows_dir {
            dirs.push(p.clone());
        }
        dirs
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).ok().filter(|s| !s.is_empty()).ok_or(ConfigError::Missing(key))
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|s| !s.is_empty()).unwrap_or_else(|| default.to_string())
}

fn port_or(key: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(key) {
        Ok(s) if !s.is_empty() => {
            s.parse::<u16>().map_err(|e| ConfigError::Invalid(key, e.to_string()))
        }
        _ => Ok(default),
    }
}
