//! Core entities shared by the driver directory, trip orchestrator and gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable) identifier
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Newtype wrapper for driver IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub String);

impl DriverId {
    pub fn generate() -> Self {
        Self(new_uuid_v7())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriverId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype wrapper for trip IDs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TripId(pub String);

impl TripId {
    pub fn generate() -> Self {
        Self(new_uuid_v7())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TripId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TripId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A point on the globe in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    #[inline]
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Canonical driver record, owned by the registry of the driver service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub is_available: bool,
}

impl Driver {
    #[inline]
    pub fn location(&self) -> Location {
        Location::new(self.lat, self.lon)
    }
}

/// Trip lifecycle; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Requested,
    InProgress,
    Completed,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Requested => "requested",
            TripStatus::InProgress => "in_progress",
            TripStatus::Completed => "completed",
        }
    }

    /// Whether `next` is the immediate successor of `self`
    pub fn can_advance_to(&self, next: TripStatus) -> bool {
        matches!(
            (self, next),
            (TripStatus::Requested, TripStatus::InProgress)
                | (TripStatus::InProgress, TripStatus::Completed)
        )
    }
}

/// Trip record, owned by the trip orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub rider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<DriverId>,
    pub start_lat: f64,
    pub start_lon: f64,
    pub end_lat: f64,
    pub end_lon: f64,
    pub status: TripStatus,
    pub price: f64,
    pub requested_at: DateTime<Utc>,
}

impl Trip {
    pub fn start(&self) -> Location {
        Location::new(self.start_lat, self.start_lon)
    }

    pub fn end(&self) -> Location {
        Location::new(self.end_lat, self.end_lon)
    }
}

/// Round a fare to cents
#[inline]
pub fn round_price(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(TripStatus::Requested.can_advance_to(TripStatus::InProgress));
        assert!(TripStatus::InProgress.can_advance_to(TripStatus::Completed));
        assert!(!TripStatus::Requested.can_advance_to(TripStatus::Completed));
        assert!(!TripStatus::Completed.can_advance_to(TripStatus::InProgress));
        assert!(!TripStatus::InProgress.can_advance_to(TripStatus::InProgress));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TripStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(TripStatus::Completed.as_str(), "completed");
    }

    #[test]
    fn test_round_price() {
        assert_eq!(round_price(4.004), 4.0);
        assert_eq!(round_price(4.005_1), 4.01);
        assert_eq!(round_price(169.28), 169.28);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = DriverId::generate();
        let b = DriverId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }
}
