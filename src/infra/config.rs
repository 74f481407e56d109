//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default `config/dev.toml`).
//! Every section and key is optional; a missing or unparsable file falls back to
//! defaults with a warning.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Which services this process hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Driver,
    Trip,
    Gateway,
    All,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Driver => "driver",
            Role::Trip => "trip",
            Role::Gateway => "gateway",
            Role::All => "all",
        }
    }

    pub fn runs_driver(&self) -> bool {
        matches!(self, Role::Driver | Role::All)
    }

    pub fn runs_trip(&self) -> bool {
        matches!(self, Role::Trip | Role::All)
    }

    pub fn runs_gateway(&self) -> bool {
        matches!(self, Role::Gateway | Role::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingMode {
    Haversine,
    Osrm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Memory,
    Mqtt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub role: Role,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { name: "ride-dispatch".to_string(), role: Role::All }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub listen_port: u16,
    /// Full availability republish period (0 to disable)
    pub republish_interval_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { listen_port: 50051, republish_interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TripConfig {
    pub listen_port: u16,
    /// Base URL of the driver service RPC surface
    pub driver_url: String,
    pub rpc_timeout_ms: u64,
    pub pricing: PricingMode,
    pub osrm_url: String,
    pub base_fare: f64,
    pub per_km_rate: f64,
    /// Release attempts before a compensating release is dead-lettered
    pub compensation_attempts: u32,
    pub compensation_backoff_ms: u64,
}

impl Default for TripConfig {
    fn default() -> Self {
        Self {
            listen_port: 50052,
            driver_url: "http://127.0.0.1:50051".to_string(),
            rpc_timeout_ms: 2000,
            pricing: PricingMode::Haversine,
            osrm_url: "http://router.project-osrm.org".to_string(),
            base_fare: 2.50,
            per_km_rate: 1.50,
            compensation_attempts: 3,
            compensation_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Age after which an in-progress trip is auto-completed
    pub dwell_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 120, dwell_secs: 120 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Websocket listener port
    pub listen_port: u16,
    pub push_timeout_ms: u64,
    pub driver_url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            push_timeout_ms: 1000,
            driver_url: "http://127.0.0.1:50051".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
    pub host: String,
    pub port: u16,
    pub partitions: usize,
    /// MQTT client id prefix; doubles as the consumer group across processes
    pub client_id: String,
    pub poll_interval_ms: u64,
    /// Startup wait for the broker's ConnAck
    pub connect_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Memory,
            host: "localhost".to_string(),
            port: 1883,
            partitions: 4,
            client_id: "ride-dispatch".to_string(),
            poll_interval_ms: 100,
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: "0.0.0.0".to_string(), port: 1883 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 30, prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub service: ServiceConfig,
    pub driver: DriverConfig,
    pub trip: TripConfig,
    pub sweeper: SweeperConfig,
    pub gateway: GatewayConfig,
    pub bus: BusConfig,
    pub broker: BrokerConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    service_name: String,
    role: Role,
    driver_listen_port: u16,
    republish_interval_secs: u64,
    trip_listen_port: u16,
    trip_driver_url: String,
    rpc_timeout_ms: u64,
    pricing_mode: PricingMode,
    osrm_url: String,
    base_fare: f64,
    per_km_rate: f64,
    compensation_attempts: u32,
    compensation_backoff_ms: u64,
    sweeper_enabled: bool,
    sweeper_interval_secs: u64,
    sweeper_dwell_secs: u64,
    gateway_listen_port: u16,
    push_timeout_ms: u64,
    gateway_driver_url: String,
    bus_kind: BusKind,
    bus_host: String,
    bus_port: u16,
    bus_partitions: usize,
    bus_client_id: String,
    bus_poll_interval_ms: u64,
    bus_connect_timeout_ms: u64,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    pub(crate) fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        let TomlConfig { service, driver, trip, sweeper, gateway, bus, broker, metrics } = toml_config;
        Self {
            service_name: service.name,
            role: service.role,
            driver_listen_port: driver.listen_port,
            republish_interval_secs: driver.republish_interval_secs,
            trip_listen_port: trip.listen_port,
            trip_driver_url: trip.driver_url,
            rpc_timeout_ms: trip.rpc_timeout_ms,
            pricing_mode: trip.pricing,
            osrm_url: trip.osrm_url,
            base_fare: trip.base_fare,
            per_km_rate: trip.per_km_rate,
            compensation_attempts: trip.compensation_attempts,
            compensation_backoff_ms: trip.compensation_backoff_ms,
            sweeper_enabled: sweeper.enabled,
            sweeper_interval_secs: sweeper.interval_secs,
            sweeper_dwell_secs: sweeper.dwell_secs,
            gateway_listen_port: gateway.listen_port,
            push_timeout_ms: gateway.push_timeout_ms,
            gateway_driver_url: gateway.driver_url,
            bus_kind: bus.kind,
            bus_host: bus.host,
            bus_port: bus.port,
            bus_partitions: bus.partitions,
            bus_client_id: bus.client_id,
            bus_poll_interval_ms: bus.poll_interval_ms,
            bus_connect_timeout_ms: bus.connect_timeout_ms,
            broker_enabled: broker.enabled,
            broker_bind_address: broker.bind_address,
            broker_port: broker.port,
            metrics_interval_secs: metrics.interval_secs,
            prometheus_port: metrics.prometheus_port,
            config_file: config_file.to_string(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Override the role from the command line
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn driver_listen_port(&self) -> u16 {
        self.driver_listen_port
    }

    pub fn republish_interval_secs(&self) -> u64 {
        self.republish_interval_secs
    }

    pub fn trip_listen_port(&self) -> u16 {
        self.trip_listen_port
    }

    pub fn trip_driver_url(&self) -> &str {
        &self.trip_driver_url
    }

    pub fn rpc_timeout_ms(&self) -> u64 {
        self.rpc_timeout_ms
    }

    pub fn pricing_mode(&self) -> PricingMode {
        self.pricing_mode
    }

    pub fn osrm_url(&self) -> &str {
        &self.osrm_url
    }

    pub fn base_fare(&self) -> f64 {
        self.base_fare
    }

    pub fn per_km_rate(&self) -> f64 {
        self.per_km_rate
    }

    pub fn compensation_attempts(&self) -> u32 {
        self.compensation_attempts
    }

    pub fn compensation_backoff_ms(&self) -> u64 {
        self.compensation_backoff_ms
    }

    pub fn sweeper_enabled(&self) -> bool {
        self.sweeper_enabled
    }

    pub fn sweeper_interval_secs(&self) -> u64 {
        self.sweeper_interval_secs
    }

    pub fn sweeper_dwell_secs(&self) -> u64 {
        self.sweeper_dwell_secs
    }

    pub fn gateway_listen_port(&self) -> u16 {
        self.gateway_listen_port
    }

    pub fn push_timeout_ms(&self) -> u64 {
        self.push_timeout_ms
    }

    pub fn gateway_driver_url(&self) -> &str {
        &self.gateway_driver_url
    }

    pub fn bus_kind(&self) -> BusKind {
        self.bus_kind
    }

    pub fn bus_host(&self) -> &str {
        &self.bus_host
    }

    pub fn bus_port(&self) -> u16 {
        self.bus_port
    }

    pub fn bus_partitions(&self) -> usize {
        self.bus_partitions
    }

    pub fn bus_client_id(&self) -> &str {
        &self.bus_client_id
    }

    pub fn bus_poll_interval_ms(&self) -> u64 {
        self.bus_poll_interval_ms
    }

    pub fn bus_connect_timeout_ms(&self) -> u64 {
        self.bus_connect_timeout_ms
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
