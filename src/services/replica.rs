//! Read replica of driver availability, fed by `driver_locations` events
//!
//! Lives in processes that do not own the registry. It is eventually consistent
//! and never writes back; callers must not treat it as current.

use crate::domain::error::DispatchResult;
use crate::domain::events::AvailabilityEvent;
use crate::domain::types::{Driver, DriverId};
use crate::services::directory::AvailabilitySource;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::info;

#[derive(Default)]
pub struct DriverReplica {
    drivers: RwLock<FxHashMap<DriverId, Driver>>,
}

impl DriverReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootstrap from a directory snapshot taken at startup
    pub fn seed(&self, drivers: Vec<Driver>) {
        let mut map = self.drivers.write();
        let count = drivers.len();
        for driver in drivers {
            map.insert(driver.id.clone(), driver);
        }
        info!(drivers = %count, "replica_seeded");
    }

    /// Upsert the event's driver record; returns false for a no-op replay
    pub fn apply(&self, event: AvailabilityEvent) -> bool {
        let driver = event.into_driver();
        let mut map = self.drivers.write();
        match map.get(&driver.id) {
            Some(existing) if *existing == driver => false,
            _ => {
                map.insert(driver.id.clone(), driver);
                true
            }
        }
    }

    pub fn get(&self, id: &DriverId) -> Option<Driver> {
        self.drivers.read().get(id).cloned()
    }

    pub fn available(&self) -> Vec<Driver> {
        let mut available: Vec<Driver> =
            self.drivers.read().values().filter(|d| d.is_available).cloned().collect();
        available.sort_by(|a, b| a.id.cmp(&b.id));
        available
    }

    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AvailabilitySource for DriverReplica {
    async fn list_available(&self) -> DispatchResult<Vec<Driver>> {
        Ok(self.available())
    }
}
