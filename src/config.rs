#![allow(dead_code)]
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use validator::Validate;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub engine: EngineConfig,

    #[validate(nested)]
    pub session_defaults: SessionDefaultsConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// HTTP server configuration for the ambient health/metrics surface.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub enable_cors: bool,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .context("failed to parse socket address")
    }
}

/// Engine-wide defaults: session limits, OCPP timing, transport pacing.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EngineConfig {
    #[validate(range(min = 1, max = 100_000))]
    pub max_sessions: usize,

    #[validate(range(min = 1, max = 3600))]
    pub default_heartbeat_secs: i64,

    #[validate(range(min = 1, max = 3600))]
    pub default_meter_values_secs: i64,

    #[validate(range(min = 1000, max = 300_000))]
    pub ocpp_request_timeout_ms: u64,

    #[validate(range(min = 100, max = 60_000))]
    pub reconnect_initial_ms: u64,

    #[validate(range(min = 1_000, max = 600_000))]
    pub reconnect_max_ms: u64,

    #[validate(range(min = 1, max = 10_000))]
    pub outbound_queue_depth: usize,

    #[validate(range(min = 1.0, max = 1000.0))]
    pub station_max_power_kw: f64,

    #[serde(default = "default_nominal_voltage_v")]
    pub nominal_voltage_v: f64,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_load_test_pacing_per_sec")]
    pub load_test_pacing_per_sec: usize,

    #[serde(default = "default_load_test_batch_size")]
    pub load_test_batch_size: usize,

    #[serde(default = "default_metrics_snapshot_interval_secs")]
    pub metrics_snapshot_interval_secs: u64,
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.ocpp_request_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn metrics_snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_snapshot_interval_secs)
    }

    /// Falls back to UTC for an unrecognised IANA name rather than failing
    /// startup over a cosmetic timezone typo.
    pub fn timezone(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

/// Defaults applied to a session created without an explicit override.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SessionDefaultsConfig {
    #[validate(length(min = 1))]
    pub default_vehicle_profile_id: String,

    #[validate(range(min = 0.0, max = 100.0))]
    pub default_initial_soc_percent: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub default_target_soc_percent: f64,
}

/// Logging and metrics-export configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub log_file: Option<std::path::PathBuf>,

    #[serde(default)]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_request_timeout_secs() -> u64 {
    30
}
fn default_nominal_voltage_v() -> f64 {
    230.0
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_load_test_pacing_per_sec() -> usize {
    100
}
fn default_load_test_batch_size() -> usize {
    1000
}
fn default_metrics_snapshot_interval_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}

impl AppConfig {
    /// Load configuration from TOML files and environment variables.
    ///
    /// Configuration is loaded in this order (later overrides earlier):
    /// 1. `config/default.toml`
    /// 2. `config/development.toml`, or the named environment's file
    /// 3. Environment variables with the `CPSIM__` prefix
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")));
        } else {
            figment = figment.merge(Toml::file("config/development.toml").nested());
        }

        figment = figment.merge(Env::prefixed("CPSIM__").split("__"));

        let config: AppConfig = figment.extract().context("failed to parse configuration")?;
        config.validate().context("configuration validation failed")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_socket_addr() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            enable_cors: false,
        };
        let addr = config.socket_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn engine_config_rejects_zero_session_limit() {
        let config = EngineConfig {
            max_sessions: 0,
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
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unrecognised_timezone_falls_back_to_utc() {
        let config = EngineConfig {
            max_sessions: 10,
            default_heartbeat_secs: 30,
            default_meter_values_secs: 10,
            ocpp_request_timeout_ms: 30_000,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            outbound_queue_depth: 128,
            station_max_power_kw: 11.0,
            nominal_voltage_v: 230.0,
            timezone: "Not/A_Zone".to_string(),
            load_test_pacing_per_sec: 100,
            load_test_batch_size: 1000,
            metrics_snapshot_interval_secs: 5,
        };
        assert_eq!(config.timezone(), chrono_tz::UTC);
    }
}
