//! Trip orchestrator - booking and completion sagas
//!
//! CreateTrip: query drivers -> claim + reserve the nearest -> price -> persist
//! (InProgress) -> publish TRIP_CREATED. A pricing failure after the reservation
//! releases the driver again before the error is returned. The release is retried
//! with linear backoff; a release that still fails is dead-lettered and retried by
//! the sweeper until it goes through.
//!
//! CompleteTrip: release the driver -> persist (Completed) -> publish TRIP_COMPLETED.
//! The release runs first so a completed trip never leaves its driver reserved. If
//! it fails the trip stays InProgress and the caller retries. Concurrent completions
//! of one trip release once; the others wait for the outcome.
//!
//! Reserve and release writes carry the trip id, so a delayed release for an old
//! trip cannot free a driver that has been booked again since.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::events::TripEvent;
use crate::domain::types::{round_price, DriverId, Location, Trip, TripId, TripStatus};
use crate::infra::metrics::Metrics;
use crate::services::directory::DriverDirectory;
use crate::services::event_bridge::EventProducer;
use crate::services::pricing::PricingOracle;
use crate::services::proximity;
use crate::services::trip_store::{Completion, TripStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// CreateTrip input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRequest {
    pub rider_id: String,
    pub start_lat: f64,
    pub start_lon: f64,
    pub end_lat: f64,
    pub end_lon: f64,
}

impl TripRequest {
    pub fn new(rider_id: &str, start: Location, end: Location) -> Self {
        Self {
            rider_id: rider_id.to_string(),
            start_lat: start.lat,
            start_lon: start.lon,
            end_lat: end.lat,
            end_lon: end.lon,
        }
    }

    pub fn start(&self) -> Location {
        Location::new(self.start_lat, self.start_lon)
    }

    pub fn end(&self) -> Location {
        Location::new(self.end_lat, self.end_lon)
    }
}

/// Retry budget for the compensating release
#[derive(Debug, Clone, Copy)]
pub struct CompensationPolicy {
    pub attempts: u32,
    /// Delay after attempt n is `backoff * n`
    pub backoff: Duration,
}

impl Default for CompensationPolicy {
    fn default() -> Self {
        Self { attempts: 3, backoff: Duration::from_millis(200) }
    }
}

/// Poll interval while another caller completes the same trip
const COMPLETION_WAIT: Duration = Duration::from_millis(10);

/// A driver whose compensating release exhausted its retries
#[derive(Debug, Clone, PartialEq)]
pub struct StrandedRelease {
    pub driver_id: DriverId,
    /// The aborted booking the reservation was made for
    pub trip_id: TripId,
    pub reason: String,
    pub attempts: u32,
    pub since: DateTime<Utc>,
}

pub struct TripOrchestrator {
    directory: Arc<dyn DriverDirectory>,
    pricing: Arc<dyn PricingOracle>,
    store: TripStore,
    producer: Option<EventProducer>,
    compensation: CompensationPolicy,
    stranded: Mutex<Vec<StrandedRelease>>,
    metrics: Arc<Metrics>,
}

impl TripOrchestrator {
    pub fn new(
        directory: Arc<dyn DriverDirectory>,
        pricing: Arc<dyn PricingOracle>,
        producer: Option<EventProducer>,
        compensation: CompensationPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            directory,
            pricing,
            store: TripStore::new(),
            producer,
            compensation,
            stranded: Mutex::new(Vec::new()),
            metrics,
        }
    }

    pub async fn create_trip(&self, request: TripRequest) -> DispatchResult<Trip> {
        let started = Instant::now();
        let start = request.start();
        let end = request.end();

        let candidates = self.directory.find_available(start).await.map_err(|e| {
            self.metrics.record_reservation_failure();
            warn!(rider_id = %request.rider_id, error = %e, "saga_driver_query_failed");
            DispatchError::ReservationFailed(format!("driver query failed: {e}"))
        })?;
        let ranked = proximity::rank(start, candidates.into_iter().filter(|d| d.is_available).collect());
        debug!(rider_id = %request.rider_id, candidates = %ranked.len(), "saga_drivers_queried");

        // First candidate not already held by a concurrent saga or open trip
        let Some(driver) = ranked.into_iter().find(|d| self.store.claim_driver(&d.id)) else {
            self.metrics.record_no_driver();
            info!(rider_id = %request.rider_id, "saga_no_available_driver");
            return Err(DispatchError::NoAvailableDriver);
        };

        // The id is fixed before the reservation so every write for this booking carries it
        let trip_id = TripId::generate();
        if let Err(e) = self.directory.update_for_trip(&driver.id, &trip_id, false).await {
            self.store.release_claim(&driver.id);
            self.metrics.record_reservation_failure();
            warn!(rider_id = %request.rider_id, driver_id = %driver.id, error = %e, "saga_reservation_failed");
            return Err(DispatchError::ReservationFailed(e.to_string()));
        }
        debug!(driver_id = %driver.id, "saga_driver_reserved");

        let price = match self.pricing.quote(start, end).await {
            Ok(price) => round_price(price),
            Err(e) => {
                self.metrics.record_pricing_failure();
                warn!(rider_id = %request.rider_id, driver_id = %driver.id, error = %e, "saga_pricing_failed");
                self.compensate(&driver.id, &trip_id).await;
                return Err(DispatchError::PricingFailed(e.to_string()));
            }
        };
        debug!(driver_id = %driver.id, price = %price, "saga_priced");

        let trip = Trip {
            id: trip_id,
            rider_id: request.rider_id,
            driver_id: Some(driver.id.clone()),
            start_lat: start.lat,
            start_lon: start.lon,
            end_lat: end.lat,
            end_lon: end.lon,
            status: TripStatus::InProgress,
            price,
            requested_at: Utc::now(),
        };
        self.store.insert(trip.clone());

        if let Some(ref producer) = self.producer {
            producer.publish_trip(&TripEvent::created(trip.id.clone(), driver.id.clone()));
        }

        let latency = started.elapsed();
        self.metrics.record_trip_created(latency);
        info!(
            trip_id = %trip.id,
            rider_id = %trip.rider_id,
            driver_id = %driver.id,
            price = %trip.price,
            latency_ms = %latency.as_millis(),
            "trip_created"
        );
        Ok(trip)
    }

    /// Complete a trip; completing an already completed trip returns it unchanged
    pub async fn complete_trip(&self, id: &TripId) -> DispatchResult<Trip> {
        let (trip, _guard) = loop {
            match self.store.begin_completion(id)? {
                Completion::Started(trip, guard) => break (trip, guard),
                Completion::Done(trip) => {
                    debug!(trip_id = %id, "trip_already_completed");
                    return Ok(trip);
                }
                Completion::InFlight => tokio::time::sleep(COMPLETION_WAIT).await,
            }
        };

        if let Some(ref driver_id) = trip.driver_id {
            if let Err(e) = self.directory.update_for_trip(driver_id, &trip.id, true).await {
                self.metrics.record_release_failure();
                warn!(trip_id = %id, driver_id = %driver_id, error = %e, "trip_release_failed");
                return Err(DispatchError::ReleaseFailed(e.to_string()));
            }
        }

        let (trip, transitioned) = self.store.mark_completed(id)?;
        if transitioned {
            if let (Some(producer), Some(driver_id)) = (&self.producer, &trip.driver_id) {
                producer.publish_trip(&TripEvent::completed(trip.id.clone(), driver_id.clone()));
            }
            self.metrics.record_trip_completed();
            info!(trip_id = %trip.id, driver_id = ?trip.driver_id.as_ref().map(|d| d.as_str()), "trip_completed");
        }
        Ok(trip)
    }

    pub fn get_trip(&self, id: &TripId) -> DispatchResult<Trip> {
        self.store.get(id)
    }

    pub fn in_progress_trips(&self) -> Vec<Trip> {
        self.store.in_progress()
    }

    /// In-progress trips requested at or before `cutoff`
    pub fn stale_trips(&self, cutoff: DateTime<Utc>) -> Vec<Trip> {
        self.store.in_progress_before(cutoff)
    }

    pub fn in_progress_for_driver(&self, id: &DriverId) -> usize {
        self.store.in_progress_for_driver(id)
    }

    /// Release a reserved driver after a failed saga
    ///
    /// Returns true once the driver is free again. On exhaustion the release is
    /// dead-lettered and the driver stays claimed so no other saga picks it up.
    pub async fn compensate(&self, driver_id: &DriverId, trip_id: &TripId) -> bool {
        let attempts = self.compensation.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.directory.update_for_trip(driver_id, trip_id, true).await {
                Ok(()) => {
                    self.store.release_claim(driver_id);
                    self.metrics.record_compensation();
                    info!(driver_id = %driver_id, trip_id = %trip_id, attempt = %attempt, "compensation_released_driver");
                    return true;
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(driver_id = %driver_id, attempt = %attempt, error = %e, "compensation_attempt_failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.compensation.backoff * attempt).await;
                    }
                }
            }
        }

        self.metrics.record_release_dead_lettered();
        error!(driver_id = %driver_id, trip_id = %trip_id, attempts = %attempts, error = %last_error, "compensation_failed");
        self.stranded.lock().push(StrandedRelease {
            driver_id: driver_id.clone(),
            trip_id: trip_id.clone(),
            reason: last_error,
            attempts,
            since: Utc::now(),
        });
        false
    }

    pub fn stranded_releases(&self) -> Vec<StrandedRelease> {
        self.stranded.lock().clone()
    }

    /// One more release attempt for every dead-lettered driver
    ///
    /// Returns the number released.
    pub async fn retry_stranded(&self) -> usize {
        let pending = std::mem::take(&mut *self.stranded.lock());
        if pending.is_empty() {
            return 0;
        }

        let mut recovered = 0;
        let mut still_stranded = Vec::new();
        for mut release in pending {
            match self.directory.update_for_trip(&release.driver_id, &release.trip_id, true).await {
                Ok(()) => {
                    self.store.release_claim(&release.driver_id);
                    self.metrics.record_dead_letter_recovered();
                    info!(driver_id = %release.driver_id, attempts = %(release.attempts + 1), "stranded_release_recovered");
                    recovered += 1;
                }
                Err(e) => {
                    release.attempts += 1;
                    release.reason = e.to_string();
                    warn!(driver_id = %release.driver_id, attempts = %release.attempts, error = %e, "stranded_release_retry_failed");
                    still_stranded.push(release);
                }
            }
        }

        self.stranded.lock().extend(still_stranded);
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{decode, TripEventType, TRIP_EVENTS_TOPIC};
    use crate::domain::types::Driver;
    use crate::io::bus::{InMemoryBus, MessageBus};
    use crate::services::directory::AvailabilitySource;
    use crate::services::pricing::{DistanceFareOracle, PricingError};
    use crate::services::registry::DriverRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingPricing;

    #[async_trait]
    impl PricingOracle for FailingPricing {
        async fn quote(&self, _start: Location, _end: Location) -> Result<f64, PricingError> {
            Err(PricingError::Status(503))
        }
    }

    /// Registry wrapper that fails the first `fail_releases` releases
    struct FlakyDirectory {
        inner: Arc<DriverRegistry>,
        fail_releases: AtomicU32,
        releases: AtomicU32,
        fail_reserve: bool,
        release_delay: Duration,
    }

    impl FlakyDirectory {
        fn new(inner: Arc<DriverRegistry>, fail_releases: u32) -> Self {
            Self {
                inner,
                fail_releases: AtomicU32::new(fail_releases),
                releases: AtomicU32::new(0),
                fail_reserve: false,
                release_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl AvailabilitySource for FlakyDirectory {
        async fn list_available(&self) -> DispatchResult<Vec<Driver>> {
            Ok(self.inner.available())
        }
    }

    #[async_trait]
    impl DriverDirectory for FlakyDirectory {
        async fn find_available(&self, origin: Location) -> DispatchResult<Vec<Driver>> {
            Ok(self.inner.find_closest_available(origin))
        }

        async fn update_status(&self, id: &DriverId, available: bool) -> DispatchResult<()> {
            if !available && self.fail_reserve {
                return Err(DispatchError::Transport("connection refused".to_string()));
            }
            if available {
                self.releases.fetch_add(1, Ordering::SeqCst);
                if !self.release_delay.is_zero() {
                    tokio::time::sleep(self.release_delay).await;
                }
                let remaining = self.fail_releases.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_releases.store(remaining - 1, Ordering::SeqCst);
                    return Err(DispatchError::Transport("connection reset".to_string()));
                }
            }
            self.inner.update_status(id, available)
        }
    }

    fn fast_policy() -> CompensationPolicy {
        CompensationPolicy { attempts: 3, backoff: Duration::from_millis(1) }
    }

    fn registry() -> Arc<DriverRegistry> {
        Arc::new(DriverRegistry::new(Arc::new(Metrics::new()), None))
    }

    fn orchestrator(directory: Arc<dyn DriverDirectory>, pricing: Arc<dyn PricingOracle>) -> TripOrchestrator {
        TripOrchestrator::new(directory, pricing, None, fast_policy(), Arc::new(Metrics::new()))
    }

    fn request() -> TripRequest {
        TripRequest::new("rider-1", Location::new(0.0, 0.0), Location::new(1.0, 1.0))
    }

    #[tokio::test]
    async fn test_reserves_closest_driver() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let b = registry.register("B", Location::new(1.0, 1.0));
        let orch = orchestrator(registry.clone(), Arc::new(DistanceFareOracle::default()));

        let trip = orch.create_trip(request()).await.unwrap();

        assert_eq!(trip.driver_id, Some(a.id.clone()));
        assert_eq!(trip.status, TripStatus::InProgress);
        assert!(trip.price > 0.0);
        let available: Vec<DriverId> = registry.available().into_iter().map(|d| d.id).collect();
        assert_eq!(available, vec![b.id]);
        assert_eq!(orch.get_trip(&trip.id).unwrap(), trip);
    }

    #[tokio::test]
    async fn test_empty_registry_no_driver_and_no_trip() {
        let orch = orchestrator(registry(), Arc::new(DistanceFareOracle::default()));
        assert_eq!(orch.create_trip(request()).await.unwrap_err(), DispatchError::NoAvailableDriver);
        assert!(orch.in_progress_trips().is_empty());
        assert!(orch.store.is_empty());
    }

    #[tokio::test]
    async fn test_pricing_failure_releases_driver_exactly_once() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let directory = Arc::new(FlakyDirectory::new(registry.clone(), 0));
        let orch = orchestrator(directory.clone(), Arc::new(FailingPricing));

        let err = orch.create_trip(request()).await.unwrap_err();

        assert!(matches!(err, DispatchError::PricingFailed(_)));
        assert_eq!(directory.releases.load(Ordering::SeqCst), 1);
        assert!(registry.get_by_id(&a.id).unwrap().is_available);
        assert!(!orch.store.is_claimed(&a.id));
        assert!(orch.store.is_empty());
        assert!(orch.stranded_releases().is_empty());
    }

    #[tokio::test]
    async fn test_compensation_retries_then_succeeds() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let directory = Arc::new(FlakyDirectory::new(registry.clone(), 2));
        let orch = orchestrator(directory.clone(), Arc::new(FailingPricing));

        assert!(orch.create_trip(request()).await.is_err());
        assert_eq!(directory.releases.load(Ordering::SeqCst), 3);
        assert!(registry.get_by_id(&a.id).unwrap().is_available);
        assert!(orch.stranded_releases().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_compensation_is_dead_lettered_then_recovered() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let directory = Arc::new(FlakyDirectory::new(registry.clone(), 3));
        let orch = orchestrator(directory.clone(), Arc::new(FailingPricing));

        assert!(matches!(orch.create_trip(request()).await, Err(DispatchError::PricingFailed(_))));
        let stranded = orch.stranded_releases();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0].driver_id, a.id);
        assert_eq!(stranded[0].attempts, 3);
        assert!(orch.store.is_empty());
        assert!(!registry.get_by_id(&a.id).unwrap().is_available);
        assert!(orch.store.is_claimed(&a.id));

        assert_eq!(orch.retry_stranded().await, 1);
        assert!(orch.stranded_releases().is_empty());
        assert!(registry.get_by_id(&a.id).unwrap().is_available);
        assert!(!orch.store.is_claimed(&a.id));
    }

    #[tokio::test]
    async fn test_reservation_failure_leaves_no_state() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let mut flaky = FlakyDirectory::new(registry.clone(), 0);
        flaky.fail_reserve = true;
        let orch = orchestrator(Arc::new(flaky), Arc::new(DistanceFareOracle::default()));

        assert!(matches!(orch.create_trip(request()).await, Err(DispatchError::ReservationFailed(_))));
        assert!(!orch.store.is_claimed(&a.id));
        assert!(orch.store.is_empty());
        assert!(registry.get_by_id(&a.id).unwrap().is_available);
    }

    #[tokio::test]
    async fn test_complete_trip_frees_driver_and_is_idempotent() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let directory = Arc::new(FlakyDirectory::new(registry.clone(), 0));
        let orch = orchestrator(directory.clone(), Arc::new(DistanceFareOracle::default()));
        let trip = orch.create_trip(request()).await.unwrap();

        let done = orch.complete_trip(&trip.id).await.unwrap();
        assert_eq!(done.status, TripStatus::Completed);
        assert!(registry.get_by_id(&a.id).unwrap().is_available);

        let again = orch.complete_trip(&trip.id).await.unwrap();
        assert_eq!(again, done);
        assert_eq!(directory.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_complete_unknown_trip() {
        let orch = orchestrator(registry(), Arc::new(DistanceFareOracle::default()));
        let id = TripId::from("nope");
        assert_eq!(orch.complete_trip(&id).await.unwrap_err(), DispatchError::TripNotFound(id));
    }

    #[tokio::test]
    async fn test_release_failure_keeps_trip_in_progress() {
        let registry = registry();
        registry.register("A", Location::new(0.0, 0.0));
        let directory = Arc::new(FlakyDirectory::new(registry.clone(), 1));
        let orch = orchestrator(directory, Arc::new(DistanceFareOracle::default()));
        let trip = orch.create_trip(request()).await.unwrap();

        assert!(matches!(orch.complete_trip(&trip.id).await, Err(DispatchError::ReleaseFailed(_))));
        assert_eq!(orch.get_trip(&trip.id).unwrap().status, TripStatus::InProgress);

        // Caller retries
        assert_eq!(orch.complete_trip(&trip.id).await.unwrap().status, TripStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completions_release_once() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let mut slow = FlakyDirectory::new(registry.clone(), 0);
        slow.release_delay = Duration::from_millis(50);
        let directory = Arc::new(slow);
        let orch = Arc::new(orchestrator(directory.clone(), Arc::new(DistanceFareOracle::default())));
        let trip = orch.create_trip(request()).await.unwrap();

        let first = tokio::spawn({
            let (orch, id) = (orch.clone(), trip.id.clone());
            async move { orch.complete_trip(&id).await }
        });
        let second = tokio::spawn({
            let (orch, id) = (orch.clone(), trip.id.clone());
            async move { orch.complete_trip(&id).await }
        });
        assert_eq!(first.await.unwrap().unwrap().status, TripStatus::Completed);
        assert_eq!(second.await.unwrap().unwrap().status, TripStatus::Completed);
        assert_eq!(directory.releases.load(Ordering::SeqCst), 1);

        // Rebooked driver is not freed by anything left over from the first trip
        let next = orch.create_trip(request()).await.unwrap();
        assert_eq!(next.driver_id, Some(a.id.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.get_by_id(&a.id).unwrap().is_available);
        assert_eq!(directory.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_completion_lets_waiter_retry() {
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let mut slow = FlakyDirectory::new(registry.clone(), 1);
        slow.release_delay = Duration::from_millis(20);
        let orch = orchestrator(Arc::new(slow), Arc::new(DistanceFareOracle::default()));
        let trip = orch.create_trip(request()).await.unwrap();

        let (first, second) = tokio::join!(orch.complete_trip(&trip.id), orch.complete_trip(&trip.id));
        assert!(matches!(first, Err(DispatchError::ReleaseFailed(_))));
        assert_eq!(second.unwrap().status, TripStatus::Completed);
        assert!(registry.get_by_id(&a.id).unwrap().is_available);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_never_double_book() {
        let registry = registry();
        let drivers: Vec<DriverId> =
            (0..3).map(|i| registry.register(&format!("d{i}"), Location::new(0.0, i as f64 * 0.01)).id).collect();
        let orch = Arc::new(orchestrator(registry.clone(), Arc::new(DistanceFareOracle::default())));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let orch = orch.clone();
                tokio::spawn(async move { orch.create_trip(request()).await })
            })
            .collect();

        let mut booked = 0;
        let mut rejected = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => booked += 1,
                Err(DispatchError::NoAvailableDriver) => rejected += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(booked, 3);
        assert_eq!(rejected, 5);
        for id in &drivers {
            assert_eq!(orch.in_progress_for_driver(id), 1);
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(InMemoryBus::new(1));
        let mut sub = bus.subscribe(TRIP_EVENTS_TOPIC, "test").unwrap();
        let registry = registry();
        let a = registry.register("A", Location::new(0.0, 0.0));
        let orch = TripOrchestrator::new(
            registry,
            Arc::new(DistanceFareOracle::default()),
            Some(EventProducer::new(bus.clone(), metrics.clone())),
            fast_policy(),
            metrics,
        );

        let trip = orch.create_trip(request()).await.unwrap();
        orch.complete_trip(&trip.id).await.unwrap();
        orch.complete_trip(&trip.id).await.unwrap();

        let created: TripEvent = decode(&sub.partitions[0].recv().await.unwrap().payload).unwrap();
        let completed: TripEvent = decode(&sub.partitions[0].recv().await.unwrap().payload).unwrap();
        assert_eq!(created.event_type, TripEventType::Created);
        assert_eq!(created.driver_id, a.id);
        assert_eq!(completed.event_type, TripEventType::Completed);
        assert_eq!(completed.trip_id, trip.id);
        // Second completion published nothing
        assert!(sub.partitions[0].try_recv().is_err());
    }
}
