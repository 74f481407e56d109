//! Wire events exchanged over the message bus
//!
//! Two topics carry all cross-service state:
//! - `driver_locations` - a driver's availability at a point in time, keyed by driver id
//! - `trip_events` - trip lifecycle facts, keyed by trip id
//!
//! Delivery is at-least-once, so every consumer of these types must be idempotent.

use crate::domain::error::DispatchError;
use crate::domain::types::{Driver, DriverId, TripId};
use serde::{Deserialize, Serialize};

/// Topic for driver availability updates
pub const DRIVER_LOCATIONS_TOPIC: &str = "driver_locations";

/// Topic for trip lifecycle events
pub const TRIP_EVENTS_TOPIC: &str = "trip_events";

/// Availability fact published by the driver registry
///
/// Carries the full driver record so read replicas can upsert it without a
/// round trip to the owning registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityEvent {
    pub id: DriverId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    pub is_available: bool,
}

impl AvailabilityEvent {
    pub fn partition_key(&self) -> &str {
        self.id.as_str()
    }

    pub fn into_driver(self) -> Driver {
        Driver {
            id: self.id,
            name: self.name,
            lat: self.lat,
            lon: self.lon,
            is_available: self.is_available,
        }
    }
}

impl From<&Driver> for AvailabilityEvent {
    fn from(driver: &Driver) -> Self {
        Self {
            id: driver.id.clone(),
            name: driver.name.clone(),
            lat: driver.lat,
            lon: driver.lon,
            is_available: driver.is_available,
        }
    }
}

/// Trip lifecycle event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripEventType {
    #[serde(rename = "TRIP_CREATED")]
    Created,
    #[serde(rename = "TRIP_COMPLETED")]
    Completed,
}

impl TripEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripEventType::Created => "TRIP_CREATED",
            TripEventType::Completed => "TRIP_COMPLETED",
        }
    }
}

/// Trip lifecycle fact published by the trip orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEvent {
    pub event_type: TripEventType,
    pub trip_id: TripId,
    pub driver_id: DriverId,
}

impl TripEvent {
    pub fn created(trip_id: TripId, driver_id: DriverId) -> Self {
        Self { event_type: TripEventType::Created, trip_id, driver_id }
    }

    pub fn completed(trip_id: TripId, driver_id: DriverId) -> Self {
        Self { event_type: TripEventType::Completed, trip_id, driver_id }
    }

    pub fn partition_key(&self) -> &str {
        self.trip_id.as_str()
    }

    /// Availability the driver should have after this event is applied
    pub fn driver_available_after(&self) -> bool {
        matches!(self.event_type, TripEventType::Completed)
    }
}

/// Serialize an event to its JSON wire form
pub fn encode<T: Serialize>(event: &T) -> Result<Vec<u8>, DispatchError> {
    serde_json::to_vec(event).map_err(|e| DispatchError::MalformedEvent(e.to_string()))
}

/// Parse an event from its JSON wire form
pub fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, DispatchError> {
    serde_json::from_slice(payload).map_err(|e| DispatchError::MalformedEvent(e.to_string()))
}
