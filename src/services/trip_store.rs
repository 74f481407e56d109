//! Volatile trip store owned by the orchestrator
//!
//! Besides the trip records it tracks driver claims: a driver id is claimed before
//! the reservation RPC and stays claimed until its trip completes or the saga
//! aborts. At most one claim per driver exists at any instant, which bounds the
//! in-progress trips per driver to one.
//!
//! Completion is single-flight per trip: `begin_completion` hands out at most one
//! guard per trip, and the mark clears when the guard drops.

use crate::domain::error::{DispatchError, DispatchResult};
use crate::domain::types::{DriverId, Trip, TripId, TripStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Default)]
struct Inner {
    trips: FxHashMap<TripId, Trip>,
    claims: FxHashSet<DriverId>,
    completing: FxHashSet<TripId>,
}

/// Result of trying to start a trip's completion
pub enum Completion<'a> {
    /// This caller owns the completion until the guard drops
    Started(Trip, CompletionGuard<'a>),
    /// Already completed
    Done(Trip),
    /// Another caller is completing it
    InFlight,
}

/// Clears the in-flight completion mark when dropped
pub struct CompletionGuard<'a> {
    store: &'a TripStore,
    id: TripId,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.store.inner.write().completing.remove(&self.id);
    }
}

#[derive(Default)]
pub struct TripStore {
    inner: RwLock<Inner>,
}

impl TripStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a driver for a saga; false if another saga or trip already holds it
    pub fn claim_driver(&self, id: &DriverId) -> bool {
        self.inner.write().claims.insert(id.clone())
    }

    pub fn release_claim(&self, id: &DriverId) -> bool {
        self.inner.write().claims.remove(id)
    }

    pub fn is_claimed(&self, id: &DriverId) -> bool {
        self.inner.read().claims.contains(id)
    }

    pub fn insert(&self, trip: Trip) {
        self.inner.write().trips.insert(trip.id.clone(), trip);
    }

    pub fn get(&self, id: &TripId) -> DispatchResult<Trip> {
        self.inner.read().trips.get(id).cloned().ok_or_else(|| DispatchError::TripNotFound(id.clone()))
    }

    /// Mark a trip as being completed by the caller
    pub fn begin_completion(&self, id: &TripId) -> DispatchResult<Completion<'_>> {
        let mut inner = self.inner.write();
        let Inner { trips, completing, .. } = &mut *inner;
        let trip = trips.get(id).ok_or_else(|| DispatchError::TripNotFound(id.clone()))?;
        if trip.status == TripStatus::Completed {
            return Ok(Completion::Done(trip.clone()));
        }
        if !completing.insert(id.clone()) {
            return Ok(Completion::InFlight);
        }
        let trip = trip.clone();
        drop(inner);
        Ok(Completion::Started(trip, CompletionGuard { store: self, id: id.clone() }))
    }

    /// Move a trip to Completed and drop its driver claim
    ///
    /// Returns the trip and whether this call made the transition. A trip that is
    /// already completed is returned unchanged.
    pub fn mark_completed(&self, id: &TripId) -> DispatchResult<(Trip, bool)> {
        let mut inner = self.inner.write();
        let trip = inner.trips.get_mut(id).ok_or_else(|| DispatchError::TripNotFound(id.clone()))?;
        if !trip.status.can_advance_to(TripStatus::Completed) {
            return Ok((trip.clone(), false));
        }
        trip.status = TripStatus::Completed;
        let trip = trip.clone();
        if let Some(ref driver_id) = trip.driver_id {
            inner.claims.remove(driver_id);
        }
        Ok((trip, true))
    }

    /// In-progress trips, oldest first
    pub fn in_progress(&self) -> Vec<Trip> {
        let mut trips: Vec<Trip> = self
            .inner
            .read()
            .trips
            .values()
            .filter(|t| t.status == TripStatus::InProgress)
            .cloned()
            .collect();
        trips.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then_with(|| a.id.cmp(&b.id)));
        trips
    }

    /// In-progress trips requested at or before `cutoff`
    pub fn in_progress_before(&self, cutoff: DateTime<Utc>) -> Vec<Trip> {
        self.in_progress().into_iter().filter(|t| t.requested_at <= cutoff).collect()
    }

    pub fn in_progress_for_driver(&self, id: &DriverId) -> usize {
        self.inner
            .read()
            .trips
            .values()
            .filter(|t| t.status == TripStatus::InProgress && t.driver_id.as_ref() == Some(id))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().trips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
