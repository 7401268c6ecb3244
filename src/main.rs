use std::sync::Arc;

use anyhow::Result;
use axum::{routing::get, Router};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ocpp_charge_point_simulator::collaborators::{ChannelEventBus, InMemorySessionStore, SharedEventBus, SharedSessionStore};
use ocpp_charge_point_simulator::config::AppConfig;
use ocpp_charge_point_simulator::engine::Engine;
use ocpp_charge_point_simulator::session::supervisor::SupervisorConfig;
use ocpp_charge_point_simulator::telemetry;

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = AppConfig::load().unwrap_or_else(|e| {
        eprintln!("no config/default.toml found ({e:#}), running with built-in defaults");
        default_config()
    });

    let _log_guard = telemetry::init_tracing(cfg.telemetry.log_json, cfg.telemetry.log_file.as_deref());

    let session_store: SharedSessionStore = Arc::new(InMemorySessionStore::new());
    let event_bus: SharedEventBus = Arc::new(ChannelEventBus::new(1024));

    let supervisor_config = SupervisorConfig {
        request_timeout: cfg.engine.request_timeout(),
        outbound_queue_depth: cfg.engine.outbound_queue_depth,
        timezone: cfg.engine.timezone(),
        station_max_power_kw: cfg.engine.station_max_power_kw,
        reconnect_initial: cfg.engine.reconnect_initial(),
        reconnect_max: cfg.engine.reconnect_max(),
    };

    let engine = Arc::new(Engine::new(
        session_store,
        event_bus,
        supervisor_config,
        cfg.engine.max_sessions,
    ));

    let metrics_cancel = CancellationToken::new();
    {
        let engine = engine.clone();
        let period = cfg.engine.metrics_snapshot_interval();
        let cancel = metrics_cancel.clone();
        tokio::spawn(async move { engine.run_metrics_loop(period, cancel).await });
    }

    let mut app: Router = Router::new().route("/healthz", get(healthz));

    #[cfg(feature = "metrics")]
    {
        app = app.route("/metrics", get(metrics_handler));
    }

    let addr = cfg.server.socket_addr()?;
    info!(%addr, "starting OCPP charge point simulator");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    metrics_cancel.cancel();
    for id in engine.session_ids().await {
        engine.delete(id).await;
    }

    warn!("shutdown complete");
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> String {
    METRICS_HANDLE.render()
}

#[cfg(feature = "metrics")]
static METRICS_HANDLE: Lazy<metrics_exporter_prometheus::PrometheusHandle> = Lazy::new(|| {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install the Prometheus recorder")
});

/// Used when no `config/*.toml` is present, so the binary is runnable
/// out of the box for a quick demo or smoke test.
fn default_config() -> AppConfig {
    use ocpp_charge_point_simulator::config::{EngineConfig, ServerConfig, SessionDefaultsConfig, TelemetryConfig};

    AppConfig {
        server: ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            enable_cors: false,
        },
        engine: EngineConfig {
            max_sessions: 2000,
            default_heartbeat_secs: 30,
            default_meter_values_secs: 10,
            ocpp_request_timeout_ms: 30_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            outbound_queue_depth: 128,
            station_max_power_kw: 11.0,
            nominal_voltage_v: 230.0,
            timezone: "UTC".to_string(),
            load_test_pacing_per_sec: 100,
            load_test_batch_size: 1000,
            metrics_snapshot_interval_secs: 5,
        },
        session_defaults: SessionDefaultsConfig {
            default_vehicle_profile_id: "generic-60kwh".to_string(),
            default_initial_soc_percent: 20.0,
            default_target_soc_percent: 80.0,
        },
        telemetry: TelemetryConfig {
            log_level: "info".to_string(),
            log_json: false,
            log_file: None,
            enable_metrics: true,
            metrics_port: 9090,
        },
    }
}

