//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `bus` - MessageBus trait and the in-process partitioned bus
//! - `mqtt_bus` - MessageBus over an MQTT broker for multi-process deployments
//! - `rpc` / `rpc_server` / `rpc_client` - JSON-over-HTTP service surfaces
//! - `osrm` - Road-distance pricing oracle
//! - `ws_gateway` - Websocket feed of available drivers
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod bus;
pub mod mqtt_bus;
pub mod osrm;
pub mod prometheus;
pub mod rpc;
pub mod rpc_client;
pub mod rpc_server;
pub mod ws_gateway;

// Re-export commonly used types
pub use bus::{BusMessage, InMemoryBus, MessageBus, Subscription};
pub use mqtt_bus::MqttBus;
pub use osrm::OsrmPricingOracle;
pub use rpc_client::{RemoteDriverDirectory, TripClient};
pub use rpc_server::RpcService;
