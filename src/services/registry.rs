//! Driver registry - canonical driver records for this process
//!
//! The registry is the only writer of `Driver::is_available`. Every write emits an
//! AvailabilityEvent while the write lock is still held, so the per-driver order on
//! the bus matches the order in which writes were applied here.
//!
//! Trip-scoped writes (the booking saga's reserve/release and the trip lifecycle
//! events) also record which trip the driver was last reserved for. Trip ids are
//! time-ordered, so a write for an older trip, or a replay for the current one,
//! is dropped instead of flipping a driver that has since been re-booked.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::types::{Driver, DriverId, Location, TripId};
use crate::infra::metrics::Metrics;
use crate::services::directory::{AvailabilitySource, DriverDirectory};
use crate::services::event_bridge::EventProducer;
use crate::services::proximity;
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// The trip a driver was last reserved for, and whether it is still open
#[derive(Debug, Clone, PartialEq, Eq)]
struct Assignment {
    trip_id: TripId,
    active: bool,
}

impl Assignment {
    /// Whether a write for `trip_id` is current given the recorded assignment
    ///
    /// A newer trip always wins. For the recorded trip only the closing release
    /// applies; anything older is stale.
    fn admits(current: Option<&Assignment>, trip_id: &TripId, available: bool) -> bool {
        match current {
            None => true,
            Some(a) if *trip_id > a.trip_id => true,
            Some(a) if *trip_id == a.trip_id => a.active && available,
            Some(_) => false,
        }
    }
}

#[derive(Default)]
struct Inner {
    drivers: FxHashMap<DriverId, Driver>,
    assignments: FxHashMap<DriverId, Assignment>,
}

pub struct DriverRegistry {
    state: RwLock<Inner>,
    producer: Option<EventProducer>,
    metrics: Arc<Metrics>,
}

impl DriverRegistry {
    pub fn new(metrics: Arc<Metrics>, producer: Option<EventProducer>) -> Self {
        Self { state: RwLock::new(Inner::default()), producer, metrics }
    }

    /// Register a new driver; it starts out available
    pub fn register(&self, name: &str, location: Location) -> Driver {
        let driver = Driver {
            id: DriverId::generate(),
            name: name.to_string(),
            lat: location.lat,
            lon: location.lon,
            is_available: true,
        };

        let mut state = self.state.write();
        state.drivers.insert(driver.id.clone(), driver.clone());
        self.emit(&driver);
        drop(state);

        self.metrics.record_driver_registered();
        info!(driver_id = %driver.id, name = %driver.name, lat = %driver.lat, lon = %driver.lon, "driver_registered");
        driver
    }

    /// Overwrite a driver's availability and publish the new state
    pub fn update_status(&self, id: &DriverId, available: bool) -> DispatchResult<()> {
        let mut state = self.state.write();
        let driver = state.drivers.get_mut(id).ok_or_else(|| DispatchError::DriverNotFound(id.clone()))?;

        let changed = driver.is_available != available;
        driver.is_available = available;
        self.emit(driver);
        drop(state);

        self.record_write(id, available, changed);
        Ok(())
    }

    /// Reserve (`available = false`) or release a driver on behalf of a trip
    ///
    /// Stale and replayed writes leave the record untouched and emit nothing.
    /// Returns whether the availability flag changed.
    pub fn apply_trip_status(&self, id: &DriverId, trip_id: &TripId, available: bool) -> DispatchResult<bool> {
        let mut state = self.state.write();
        let Inner { drivers, assignments } = &mut *state;
        let driver = drivers.get_mut(id).ok_or_else(|| DispatchError::DriverNotFound(id.clone()))?;

        if !Assignment::admits(assignments.get(id), trip_id, available) {
            drop(state);
            debug!(driver_id = %id, trip_id = %trip_id, available = %available, "trip_status_stale");
            return Ok(false);
        }

        assignments.insert(id.clone(), Assignment { trip_id: trip_id.clone(), active: !available });
        let changed = driver.is_available != available;
        driver.is_available = available;
        if changed {
            self.emit(driver);
        }
        drop(state);

        self.record_write(id, available, changed);
        Ok(changed)
    }

    /// Re-emit the current state of every driver
    ///
    /// Heals replicas that missed an event. Returns the number of drivers published.
    pub fn republish(&self) -> usize {
        let state = self.state.read();
        for driver in state.drivers.values() {
            self.emit(driver);
        }
        state.drivers.len()
    }

    fn record_write(&self, id: &DriverId, available: bool, changed: bool) {
        self.metrics.record_status_update();
        if changed {
            info!(driver_id = %id, available = %available, "driver_status_updated");
        } else {
            debug!(driver_id = %id, available = %available, "driver_status_unchanged");
        }
    }

    pub fn get_by_id(&self, id: &DriverId) -> DispatchResult<Driver> {
        self.state.read().drivers.get(id).cloned().ok_or_else(|| DispatchError::DriverNotFound(id.clone()))
    }

    /// Snapshot of available drivers, ordered by id (registration order for v7 ids)
    pub fn available(&self) -> Vec<Driver> {
        let mut available: Vec<Driver> =
            self.state.read().drivers.values().filter(|d| d.is_available).cloned().collect();
        available.sort_by(|a, b| a.id.cmp(&b.id));
        available
    }

    /// Available drivers nearest first
    pub fn find_closest_available(&self, origin: Location) -> Vec<Driver> {
        proximity::rank(origin, self.available())
    }

    pub fn len(&self) -> usize {
        self.state.read().drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit(&self, driver: &Driver) {
        if let Some(ref producer) = self.producer {
            producer.publish_availability(driver);
        }
    }
}

#[async_trait]
impl AvailabilitySource for DriverRegistry {
    async fn list_available(&self) -> DispatchResult<Vec<Driver>> {
        Ok(self.available())
    }
}

#[async_trait]
impl DriverDirectory for DriverRegistry {
    async fn find_available(&self, origin: Location) -> DispatchResult<Vec<Driver>> {
        Ok(self.find_closest_available(origin))
    }

    async fn update_status(&self, id: &DriverId, available: bool) -> DispatchResult<()> {
        DriverRegistry::update_status(self, id, available)
    }

    async fn update_for_trip(&self, id: &DriverId, trip_id: &TripId, available: bool) -> DispatchResult<()> {
        self.apply_trip_status(id, trip_id, available).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{decode, AvailabilityEvent, DRIVER_LOCATIONS_TOPIC};
    use crate::io::bus::{InMemoryBus, MessageBus};

    fn registry() -> DriverRegistry {
        DriverRegistry::new(Arc::new(Metrics::new()), None)
    }

    #[test]
    fn test_register_assigns_id_and_availability() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let b = registry.register("B", Location::new(1.0, 1.0));

        assert_ne!(a.id, b.id);
        assert!(a.is_available);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_by_id(&a.id).unwrap(), a);
    }

    #[test]
    fn test_unavailable_driver_never_listed() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let b = registry.register("B", Location::new(1.0, 1.0));

        registry.update_status(&a.id, false).unwrap();

        let available = registry.available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, b.id);
        assert!(registry.find_closest_available(Location::new(0.0, 0.0)).iter().all(|d| d.id != a.id));
    }

    #[test]
    fn test_update_unknown_driver_is_not_found_and_state_unchanged() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let before = registry.available();

        let err = registry.update_status(&DriverId::from("ghost"), false).unwrap_err();
        assert_eq!(err, DispatchError::DriverNotFound(DriverId::from("ghost")));
        assert_eq!(registry.available(), before);
        assert!(registry.get_by_id(&a.id).unwrap().is_available);
    }

    #[test]
    fn test_get_unknown_driver() {
        let registry = registry();
        assert!(registry.get_by_id(&DriverId::from("nope")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_empty_registry_lists_nothing() {
        let registry = registry();
        assert!(registry.is_empty());
        assert!(registry.find_closest_available(Location::new(0.0, 0.0)).is_empty());
    }

    #[test]
    fn test_find_closest_available_orders_by_distance() {
        let registry = registry();
        registry.register("far", Location::new(10.0, 10.0));
        registry.register("near", Location::new(0.01, 0.01));

        let ranked = registry.find_closest_available(Location::new(0.0, 0.0));
        assert_eq!(ranked[0].name, "near");
        assert_eq!(ranked[1].name, "far");
    }

    #[tokio::test]
    async fn test_writes_emit_availability_events_in_order() {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(InMemoryBus::new(1));
        let mut sub = bus.subscribe(DRIVER_LOCATIONS_TOPIC, "test").unwrap();
        let registry =
            DriverRegistry::new(metrics.clone(), Some(EventProducer::new(bus.clone(), metrics)));

        let a = registry.register("A", Location::new(0.0, 0.0));
        registry.update_status(&a.id, false).unwrap();
        registry.update_status(&a.id, true).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let msg = sub.partitions[0].recv().await.unwrap();
            assert_eq!(msg.key, a.id.as_str());
            let event: AvailabilityEvent = decode(&msg.payload).unwrap();
            seen.push(event.is_available);
        }
        assert_eq!(seen, vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_trip_status_replay_is_silent() {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(InMemoryBus::new(1));
        let mut sub = bus.subscribe(DRIVER_LOCATIONS_TOPIC, "test").unwrap();
        let registry =
            DriverRegistry::new(metrics.clone(), Some(EventProducer::new(bus.clone(), metrics)));
        let t1 = TripId::from("t1");

        let a = registry.register("A", Location::new(0.0, 0.0));
        assert!(registry.apply_trip_status(&a.id, &t1, false).unwrap());
        assert!(!registry.apply_trip_status(&a.id, &t1, false).unwrap());

        // register + one real change
        assert!(sub.partitions[0].recv().await.is_some());
        assert!(sub.partitions[0].recv().await.is_some());
        assert!(sub.partitions[0].try_recv().is_err());
    }

    #[test]
    fn test_stale_release_does_not_free_rebooked_driver() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let (t1, t2) = (TripId::from("t1"), TripId::from("t2"));

        registry.apply_trip_status(&a.id, &t1, false).unwrap();
        registry.apply_trip_status(&a.id, &t1, true).unwrap();
        registry.apply_trip_status(&a.id, &t2, false).unwrap();

        // Redelivered trip1 events arrive after the re-booking
        assert!(!registry.apply_trip_status(&a.id, &t1, true).unwrap());
        assert!(!registry.apply_trip_status(&a.id, &t1, false).unwrap());
        assert!(!registry.get_by_id(&a.id).unwrap().is_available);

        assert!(registry.apply_trip_status(&a.id, &t2, true).unwrap());
        assert!(registry.get_by_id(&a.id).unwrap().is_available);
    }

    #[test]
    fn test_completed_trip_cannot_reserve_again() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let t1 = TripId::from("t1");

        registry.apply_trip_status(&a.id, &t1, false).unwrap();
        registry.apply_trip_status(&a.id, &t1, true).unwrap();
        // Late TRIP_CREATED replay for a finished trip
        assert!(!registry.apply_trip_status(&a.id, &t1, false).unwrap());
        assert!(registry.get_by_id(&a.id).unwrap().is_available);
    }

    #[test]
    fn test_assignment_admits() {
        let (t1, t2) = (TripId::from("t1"), TripId::from("t2"));
        let open = Assignment { trip_id: t2.clone(), active: true };
        let closed = Assignment { trip_id: t2.clone(), active: false };

        assert!(Assignment::admits(None, &t1, false));
        assert!(Assignment::admits(Some(&open), &t2, true));
        assert!(!Assignment::admits(Some(&open), &t2, false));
        assert!(!Assignment::admits(Some(&closed), &t2, true));
        assert!(!Assignment::admits(Some(&open), &t1, true));
        assert!(Assignment::admits(Some(&closed), &TripId::from("t3"), false));
    }

    #[tokio::test]
    async fn test_republish_emits_every_driver() {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(InMemoryBus::new(1));
        let registry =
            DriverRegistry::new(metrics.clone(), Some(EventProducer::new(bus.clone(), metrics)));
        registry.register("A", Location::new(0.0, 0.0));
        registry.register("B", Location::new(1.0, 1.0));

        let mut sub = bus.subscribe(DRIVER_LOCATIONS_TOPIC, "late").unwrap();
        assert_eq!(registry.republish(), 2);
        assert!(sub.partitions[0].recv().await.is_some());
        assert!(sub.partitions[0].recv().await.is_some());
    }

    #[test]
    fn test_concurrent_updates_for_different_drivers() {
        let registry = Arc::new(registry());
        let ids: Vec<DriverId> =
            (0..8).map(|i| registry.register(&format!("d{i}"), Location::new(0.0, i as f64)).id).collect();

        let handles: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.update_status(&id, i % 2 == 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Last write for every driver was `true`
        assert_eq!(registry.available().len(), 8);
    }
}
