//! Nearest-driver ranking by great-circle distance
//!
//! Pure functions, no shared state. Ranking is deterministic: equal distances
//! fall back to driver id order, so identical input always yields identical output.

use crate::domain::types::{Driver, Location};

/// Mean Earth radius in kilometers
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two points in kilometers
pub fn haversine_km(from: Location, to: Location) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lon = (to.lon - from.lon).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Order candidates nearest first
pub fn rank(origin: Location, candidates: Vec<Driver>) -> Vec<Driver> {
    let mut scored: Vec<(f64, Driver)> =
        candidates.into_iter().map(|d| (haversine_km(origin, d.location()), d)).collect();

    // total_cmp keeps NaN coordinates at the tail instead of breaking the order
    scored.sort_by(|(da, a), (db, b)| da.total_cmp(db).then_with(|| a.id.cmp(&b.id)));

    scored.into_iter().map(|(_, d)| d).collect()
}
