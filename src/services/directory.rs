//! Service seams for reading and mutating driver availability
//!
//! The trip orchestrator and gateway hub only see these traits; whether the
//! registry lives in-process or behind an RPC hop is a wiring decision.

use crate::domain::error::DispatchResult;
use crate::domain::types::{Driver, DriverId, Location, TripId};
use async_trait::async_trait;

/// Anything that can produce a snapshot of currently available drivers
#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    /// Snapshot of drivers with `is_available = true` at call time
    async fn list_available(&self) -> DispatchResult<Vec<Driver>>;
}

/// Authoritative driver directory (the registry or a client for it)
#[async_trait]
pub trait DriverDirectory: AvailabilitySource {
    /// Available drivers ordered nearest first from `origin`
    async fn find_available(&self, origin: Location) -> DispatchResult<Vec<Driver>>;

    /// Overwrite a driver's availability flag
    async fn update_status(&self, id: &DriverId, available: bool) -> DispatchResult<()>;

    /// Reserve or release a driver on behalf of `trip_id`
    ///
    /// Directories that track assignments drop writes for trips older than the
    /// one the driver is currently reserved for.
    async fn update_for_trip(&self, id: &DriverId, _trip_id: &TripId, available: bool) -> DispatchResult<()> {
        self.update_status(id, available).await
    }
}
