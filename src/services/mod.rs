//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `registry` - Authoritative driver store (driver service)
//! - `proximity` - Great-circle ranking of candidate drivers
//! - `directory` - Traits the orchestrator and hub use to reach drivers
//! - `orchestrator` - Booking saga with compensating release
//! - `trip_store` - Trip records and driver claims
//! - `pricing` - Fare oracles
//! - `sweeper` - Auto-completion of stale trips
//! - `republisher` - Periodic full availability publish
//! - `event_bridge` - Bus producers and consumers
//! - `replica` - Gateway-side availability projection
//! - `hub` - Real-time observer fan-out

pub mod directory;
pub mod event_bridge;
pub mod hub;
pub mod orchestrator;
pub mod pricing;
pub mod proximity;
pub mod registry;
pub mod replica;
pub mod republisher;
pub mod sweeper;
pub mod trip_store;

// Re-export commonly used types
pub use directory::{AvailabilitySource, DriverDirectory};
pub use event_bridge::{AvailabilityRelay, EventProducer, TripEventApplier};
pub use hub::{Hub, Observer, ObserverError};
pub use orchestrator::{CompensationPolicy, TripOrchestrator, TripRequest};
pub use pricing::{DistanceFareOracle, FareSchedule, PricingOracle};
pub use registry::DriverRegistry;
pub use replica::DriverReplica;
pub use republisher::AvailabilityRepublisher;
pub use sweeper::TripSweeper;
