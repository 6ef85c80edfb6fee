// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! easeld: the Easel gateway daemon.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use easel_core::GatewayError;
use easel_gateway::{
    router, AppState, ConnectionManager, EngineDialer, EngineProcess, GatewayConfig, HttpEngineApi,
    JobRegistry, StatusListener, Submitter, WorkflowStore,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for a spawned engine to advertise its address.
const ADDRESS_WAIT: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gateway failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), GatewayError> {
    let config = GatewayConfig::from_env().map_err(|e| GatewayError::Internal(e.to_string()))?;

    // Spawn the engine unless an external one was configured.
    let engine_process = EngineProcess::new(config.engine.clone());
    let spawned = config.engine.address.is_none() && config.engine.install_path.is_some();
    if spawned {
        engine_process.start().await;
    }
    let engine_address = if spawned {
        wait_for_engine_address(&engine_process, &config).await
    } else {
        engine_process.address().unwrap_or_else(|| config.engine.default_address())
    };
    info!(%engine_address, "using engine at this address");

    let dialer = Arc::new(EngineDialer::new(engine_address.clone()));
    let connections = ConnectionManager::new(dialer.clone());
    let registry = Arc::new(JobRegistry::new());
    let listener = Arc::new(StatusListener::new(dialer, registry.clone()));
    let store = Arc::new(WorkflowStore::new(config.engine.workflow_dirs()));
    let submitter = Arc::new(Submitter::new(
        store.clone(),
        registry.clone(),
        connections.clone(),
        Arc::new(HttpEngineApi::new(engine_address)),
        listener.sid().clone(),
    ));

    {
        let connections = connections.clone();
        tokio::spawn(async move { connections.run_sweep_forever(SWEEP_INTERVAL).await });
    }
    {
        let registry = registry.clone();
        tokio::spawn(async move { registry.run_sweep_forever(SWEEP_INTERVAL).await });
    }
    {
        let listener = listener.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(error = %e, "status listener gave up, gateway is degraded");
            }
        });
    }

    let app = router(AppState {
        api_key: config.api_key.clone(),
        connections: connections.clone(),
        registry,
        submitter,
        store,
        engine: Some(engine_process.clone()),
    });

    let bind = format!("{}:{}", config.listen_address, config.listen_port);
    let tcp = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| GatewayError::Internal(format!("bind {bind}: {e}")))?;
    info!(%bind, "gateway listening");

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;

    info!("shutting down");
    listener.shutdown();
    connections.close_all().await;
    engine_process.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "shutdown signal listener failed");
    }
    info!("shutdown requested");
}

/// Resolve the engine base URL: configured address, scraped banner, or the
/// configured listen host/port as a last resort.
async fn wait_for_engine_address(engine: &Arc<EngineProcess>, config: &GatewayConfig) -> String {
    let deadline = tokio::time::Instant::now() + ADDRESS_WAIT;
    loop {
        if let Some(address) = engine.address() {
            return address;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("engine never advertised an address, falling back to the configured one");
            return config.engine.default_address();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
