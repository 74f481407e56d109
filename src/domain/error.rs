//! Error taxonomy for dispatch operations

use crate::domain::types::{DriverId, TripId};
use thiserror::Error;

/// Failures surfaced by registry, orchestrator and bridge operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("driver not found: {0}")]
    DriverNotFound(DriverId),

    #[error("trip not found: {0}")]
    TripNotFound(TripId),

    /// Business condition, not a system failure; safe to retry later
    #[error("no available driver")]
    NoAvailableDriver,

    #[error("driver reservation failed: {0}")]
    ReservationFailed(String),

    #[error("pricing failed: {0}")]
    PricingFailed(String),

    /// Trip completion could not free its driver; the trip stays in progress
    #[error("driver release failed: {0}")]
    ReleaseFailed(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl DispatchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DispatchError::DriverNotFound(_) | DispatchError::TripNotFound(_))
    }

    /// Stable machine-readable code used on the RPC wire
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::DriverNotFound(_) => "driver_not_found",
            DispatchError::TripNotFound(_) => "trip_not_found",
            DispatchError::NoAvailableDriver => "no_available_driver",
            DispatchError::ReservationFailed(_) => "reservation_failed",
            DispatchError::PricingFailed(_) => "pricing_failed",
            DispatchError::ReleaseFailed(_) => "release_failed",
            DispatchError::MalformedEvent(_) => "malformed_event",
            DispatchError::Transport(_) => "transport",
        }
    }

    /// Rebuild an error from its wire code and detail string
    pub fn from_code(code: &str, detail: &str) -> Self {
        match code {
            "driver_not_found" => DispatchError::DriverNotFound(DriverId::from(detail)),
            "trip_not_found" => DispatchError::TripNotFound(TripId::from(detail)),
            "no_available_driver" => DispatchError::NoAvailableDriver,
            "reservation_failed" => DispatchError::ReservationFailed(detail.to_string()),
            "pricing_failed" => DispatchError::PricingFailed(detail.to_string()),
            "release_failed" => DispatchError::ReleaseFailed(detail.to_string()),
            "malformed_event" => DispatchError::MalformedEvent(detail.to_string()),
            _ => DispatchError::Transport(detail.to_string()),
        }
    }

    /// Detail string paired with `code()` on the wire
    pub fn detail(&self) -> String {
        match self {
            DispatchError::DriverNotFound(id) => id.to_string(),
            DispatchError::TripNotFound(id) => id.to_string(),
            DispatchError::NoAvailableDriver => String::new(),
            DispatchError::ReservationFailed(s)
            | DispatchError::PricingFailed(s)
            | DispatchError::ReleaseFailed(s)
            | DispatchError::MalformedEvent(s)
            | DispatchError::Transport(s) => s.clone(),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
