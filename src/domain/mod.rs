//! Domain models - entities, wire events and errors
//!
//! - `types` - Driver, Trip and their identifiers
//! - `events` - AvailabilityEvent / TripEvent bus payloads
//! - `error` - DispatchError taxonomy

pub mod error;
pub mod events;
pub mod types;

pub use error::{DispatchError, DispatchResult};
pub use events::{AvailabilityEvent, TripEvent, TripEventType};
pub use types::{Driver, DriverId, Location, Trip, TripId, TripStatus};
