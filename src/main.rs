//! Ride dispatch - driver registry, trip booking and live availability feed
//!
//! One binary hosts any combination of the three services, selected by role:
//! - `driver` - driver registry RPC surface, applies trip events
//! - `trip` - booking saga RPC surface and stale-trip sweeper
//! - `gateway` - websocket feed of available drivers
//! - `all` - everything in one process, wired in-process
//!
//! Module structure:
//! - `domain/` - Core types (Driver, Trip, events, errors)
//! - `io/` - External interfaces (bus, RPC, OSRM, websocket, Prometheus)
//! - `services/` - Business logic (registry, orchestrator, hub)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use anyhow::Context;
use clap::Parser;
use ride_dispatch::domain::events::{DRIVER_LOCATIONS_TOPIC, TRIP_EVENTS_TOPIC};
use ride_dispatch::infra::{BusKind, Config, Metrics, PricingMode, Role};
use ride_dispatch::io::{
    prometheus, rpc_server, ws_gateway, InMemoryBus, MessageBus, MqttBus, OsrmPricingOracle,
    RemoteDriverDirectory, RpcService,
};
use ride_dispatch::services::event_bridge::spawn_consumer;
use ride_dispatch::services::{
    AvailabilityRelay, AvailabilityRepublisher, AvailabilitySource, CompensationPolicy, DistanceFareOracle,
    DriverDirectory, DriverRegistry, DriverReplica, EventProducer, FareSchedule, Hub, PricingOracle,
    TripEventApplier, TripOrchestrator, TripSweeper,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Ride dispatch services
#[derive(Parser, Debug)]
#[command(name = "ride-dispatch", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Override `[service] role` from the config file
    #[arg(short, long, value_enum)]
    role: Option<Role>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-request visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = Config::load_from_path(&args.config);
    if let Some(role) = args.role {
        config = config.with_role(role);
    }
    let role = config.role();

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), role = %role.as_str(), "ride_dispatch_starting");

    info!(
        config_file = %config.config_file(),
        service = %config.service_name(),
        bus = ?config.bus_kind(),
        bus_host = %config.bus_host(),
        bus_port = %config.bus_port(),
        partitions = %config.bus_partitions(),
        pricing = ?config.pricing_mode(),
        driver_port = %config.driver_listen_port(),
        republish_interval_secs = %config.republish_interval_secs(),
        trip_port = %config.trip_listen_port(),
        gateway_port = %config.gateway_listen_port(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    start_embedded_broker(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let bus: Arc<dyn MessageBus> = match config.bus_kind() {
        BusKind::Memory => {
            if role != Role::All {
                warn!(role = %role.as_str(), "memory_bus_outside_all_role");
            }
            Arc::new(InMemoryBus::new(config.bus_partitions()))
        }
        BusKind::Mqtt => {
            let (bus, handle) = MqttBus::connect(&config, shutdown_rx.clone())
                .await
                .with_context(|| format!("connecting to bus at {}:{}", config.bus_host(), config.bus_port()))?;
            tasks.push(handle);
            Arc::new(bus)
        }
    };

    let rpc_timeout = Duration::from_millis(config.rpc_timeout_ms());

    // Driver service
    let registry = if role.runs_driver() {
        let producer = EventProducer::new(bus.clone(), metrics.clone());
        let registry = Arc::new(DriverRegistry::new(metrics.clone(), Some(producer)));

        let subscription = bus
            .subscribe(TRIP_EVENTS_TOPIC, &format!("{}-driver", config.bus_client_id()))
            .context("subscribing driver service to trip events")?;
        tasks.extend(spawn_consumer(
            subscription,
            Arc::new(TripEventApplier::new(registry.clone())),
            metrics.clone(),
            shutdown_rx.clone(),
        ));

        if config.republish_interval_secs() > 0 {
            let republisher = AvailabilityRepublisher::new(
                registry.clone(),
                Duration::from_secs(config.republish_interval_secs()),
            );
            tasks.push(tokio::spawn(republisher.run(shutdown_rx.clone())));
        }

        let listener = rpc_server::bind(config.driver_listen_port())
            .await
            .with_context(|| format!("binding driver RPC port {}", config.driver_listen_port()))?;
        tasks.push(tokio::spawn(rpc_server::serve(
            listener,
            RpcService::Driver(registry.clone()),
            metrics.clone(),
            shutdown_rx.clone(),
        )));
        Some(registry)
    } else {
        None
    };

    // Trip service
    if role.runs_trip() {
        let directory: Arc<dyn DriverDirectory> = match &registry {
            Some(registry) => registry.clone(),
            None => Arc::new(
                RemoteDriverDirectory::new(config.trip_driver_url(), rpc_timeout)
                    .context("building driver service client")?,
            ),
        };

        let schedule = FareSchedule::new(config.base_fare(), config.per_km_rate());
        let pricing: Arc<dyn PricingOracle> = match config.pricing_mode() {
            PricingMode::Haversine => Arc::new(DistanceFareOracle::new(schedule)),
            PricingMode::Osrm => Arc::new(
                OsrmPricingOracle::new(config.osrm_url(), schedule, rpc_timeout)
                    .context("building OSRM client")?,
            ),
        };

        let compensation = CompensationPolicy {
            attempts: config.compensation_attempts(),
            backoff: Duration::from_millis(config.compensation_backoff_ms()),
        };
        let orchestrator = Arc::new(TripOrchestrator::new(
            directory,
            pricing,
            Some(EventProducer::new(bus.clone(), metrics.clone())),
            compensation,
            metrics.clone(),
        ));

        if config.sweeper_enabled() {
            let sweeper = TripSweeper::new(
                orchestrator.clone(),
                Duration::from_secs(config.sweeper_interval_secs()),
                Duration::from_secs(config.sweeper_dwell_secs()),
            );
            tasks.push(tokio::spawn(sweeper.run(shutdown_rx.clone())));
        }

        let listener = rpc_server::bind(config.trip_listen_port())
            .await
            .with_context(|| format!("binding trip RPC port {}", config.trip_listen_port()))?;
        tasks.push(tokio::spawn(rpc_server::serve(
            listener,
            RpcService::Trip(orchestrator),
            metrics.clone(),
            shutdown_rx.clone(),
        )));
    }

    // Gateway
    if role.runs_gateway() {
        let replica = Arc::new(DriverReplica::new());
        let hub = Arc::new(Hub::new(
            replica.clone(),
            Duration::from_millis(config.push_timeout_ms()),
            metrics.clone(),
        ));

        // Subscribe before seeding so events raced with the snapshot queue up behind it
        let subscription = bus
            .subscribe(DRIVER_LOCATIONS_TOPIC, &format!("{}-gateway", config.bus_client_id()))
            .context("subscribing gateway to driver locations")?;

        let seed_source: Arc<dyn AvailabilitySource> = match &registry {
            Some(registry) => registry.clone(),
            None => Arc::new(
                RemoteDriverDirectory::new(config.gateway_driver_url(), rpc_timeout)
                    .context("building driver service client")?,
            ),
        };
        match seed_source.list_available().await {
            Ok(drivers) => replica.seed(drivers),
            Err(e) => warn!(error = %e, "replica_seed_failed"),
        }

        tasks.extend(spawn_consumer(
            subscription,
            Arc::new(AvailabilityRelay::new(replica, hub.clone())),
            metrics.clone(),
            shutdown_rx.clone(),
        ));

        let listener = ws_gateway::bind(config.gateway_listen_port())
            .await
            .with_context(|| format!("binding gateway port {}", config.gateway_listen_port()))?;
        tasks.push(tokio::spawn(ws_gateway::serve(listener, hub, shutdown_rx.clone())));
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        let service = config.service_name().to_string();
        tokio::spawn(async move {
            if let Err(e) =
                prometheus::start_metrics_server(prometheus_port, prom_metrics, service, prom_shutdown).await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut report_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = report_shutdown.changed() => {
                    if *report_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "task_join_failed");
        }
    }

    metrics.report().log();
    info!("ride_dispatch_shutdown_complete");
    Ok(())
}

fn start_embedded_broker(config: &Config) {
    if ride_dispatch::infra::broker::start_embedded_broker(config) && config.bus_kind() != BusKind::Mqtt {
        warn!("broker_started_without_mqtt_bus");
    }
}
