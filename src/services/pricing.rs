//! Trip pricing - fare schedule and the oracle seam
//!
//! Fare = base + distance_km * per_km, rounded to cents. The distance comes from
//! the oracle: great-circle for `DistanceFareOracle`, road distance for the
//! routing-service oracle in `io::osrm`.

use crate::domain::types::{round_price, Location};
use crate::services::proximity::haversine_km;
use async_trait::async_trait;
use thiserror::Error;

pub const DEFAULT_BASE_FARE: f64 = 2.50;
pub const DEFAULT_PER_KM_RATE: f64 = 1.50;

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("routing request failed: {0}")]
    Request(String),
    #[error("routing service returned status {0}")]
    Status(u16),
    #[error("no route found")]
    NoRoute,
    #[error("invalid fare {0}")]
    InvalidFare(f64),
}

/// Opaque distance -> price capability
#[async_trait]
pub trait PricingOracle: Send + Sync {
    async fn quote(&self, start: Location, end: Location) -> Result<f64, PricingError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareSchedule {
    pub base_fare: f64,
    pub per_km_rate: f64,
}

impl Default for FareSchedule {
    fn default() -> Self {
        Self { base_fare: DEFAULT_BASE_FARE, per_km_rate: DEFAULT_PER_KM_RATE }
    }
}

impl FareSchedule {
    pub fn new(base_fare: f64, per_km_rate: f64) -> Self {
        Self { base_fare, per_km_rate }
    }

    /// Fare for a distance, rejecting anything that is not a positive finite amount
    pub fn fare(&self, distance_km: f64) -> Result<f64, PricingError> {
        let price = round_price(self.base_fare + distance_km * self.per_km_rate);
        if price.is_finite() && price > 0.0 {
            Ok(price)
        } else {
            Err(PricingError::InvalidFare(price))
        }
    }
}

/// Prices on great-circle distance; needs no external service
#[derive(Debug, Clone, Default)]
pub struct DistanceFareOracle {
    schedule: FareSchedule,
}

impl DistanceFareOracle {
    pub fn new(schedule: FareSchedule) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl PricingOracle for DistanceFareOracle {
    async fn quote(&self, start: Location, end: Location) -> Result<f64, PricingError> {
        self.schedule.fare(haversine_km(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fare_formula() {
        let schedule = FareSchedule::default();
        assert_eq!(schedule.fare(0.0).unwrap(), 2.5);
        assert_eq!(schedule.fare(10.0).unwrap(), 17.5);
        assert_eq!(schedule.fare(1.234).unwrap(), 4.35);
    }

    #[test]
    fn test_rejects_non_positive_or_nan() {
        assert!(FareSchedule::new(0.0, 0.0).fare(5.0).is_err());
        assert!(FareSchedule::default().fare(f64::NAN).is_err());
    }

    #[tokio::test]
    async fn test_distance_oracle_prices_one_degree() {
        let oracle = DistanceFareOracle::default();
        let price = oracle.quote(Location::new(0.0, 0.0), Location::new(0.0, 1.0)).await.unwrap();
        // 111.195 km * 1.50 + 2.50
        assert_eq!(price, 169.29);
    }
}
