mod bridge;
mod broker_session;
mod config;
mod db;
mod models;
mod recorder;
mod rest_server;
mod service_utils;
mod translator;

use crate::bridge::BridgeController;
use crate::broker_session::BrokerSession;
use crate::config::Config;
use crate::db::DatabaseService;
use crate::recorder::ActivityRecorder;
use crate::rest_server::{build_rest_server, run_rest_server};
use crate::service_utils::{drain_recorder, start_broker_session, wait_for_signal, Lifecycle};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let db_service = match DatabaseService::new(&config.db_path) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to open activity database '{}': {}", config.db_path, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {}", e);
        return ExitCode::FAILURE;
    }
    info!("Database initialized successfully.");

    let lifecycle = Lifecycle::new();

    let recorder = ActivityRecorder::new(db_service.clone(), config.record_timeout());
    let (recorder_handle, recorder_worker) = recorder.spawn(config.audit_queue_capacity);

    let session = BrokerSession::new(config.session_config());
    let bridge = Arc::new(BridgeController::new(
        session.clone(),
        recorder_handle,
        config.lanes.clone(),
        config.control_topic.clone(),
        config.command_topic.clone(),
    ));

    let rest_api_task = config.rest_enabled.then(|| {
        let rocket = build_rest_server(db_service.clone(), session.clone());
        tokio::spawn(run_rest_server(rocket, lifecycle.subscribe()))
    });

    info!(
        "Bridging '{}' -> '{}' via {}:{} (lanes: {}).",
        config.control_topic,
        config.command_topic,
        config.mqtt_host,
        config.mqtt_port,
        config
            .lanes
            .iter()
            .map(|lane| lane.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut session_task = start_broker_session(session, bridge, &lifecycle);

    let finished = tokio::select! {
        _ = wait_for_signal() => None,
        result = &mut session_task => Some(result),
    };
    let result = match finished {
        Some(result) => {
            lifecycle.shutdown();
            result
        }
        None => {
            info!("Gateway is shutting down...");
            lifecycle.shutdown();
            session_task.await
        }
    };

    let exit = match result {
        Ok(Ok(())) => {
            info!("Broker session stopped.");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!(
                "{}. Check MQTT_HOST/MQTT_PORT and credentials, or raise MQTT_MAX_RETRIES.",
                e
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Broker session task failed: {:?}", e);
            ExitCode::FAILURE
        }
    };

    // The bridge held the last recorder handle; its task has ended, so the
    // queue closes and the worker drains.
    drain_recorder(recorder_worker, config.shutdown_drain()).await;

    if let Some(task) = rest_api_task {
        let _ = task.await;
    }
    info!("All services shut down successfully.");
    exit
}
