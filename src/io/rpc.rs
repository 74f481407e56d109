//! JSON-over-HTTP wire types shared by the RPC server and client

use crate::domain::error::DispatchError;
use crate::domain::types::{Location, TripId};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

/// `code` used for requests the server could not parse or validate
pub const BAD_REQUEST_CODE: &str = "bad_request";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDriverRequest {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    #[serde(alias = "is_available")]
    pub available: bool,
    /// Set by the booking saga; scopes the write to one trip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<TripId>,
}

/// Error payload for every non-2xx response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    #[serde(default)]
    pub detail: String,
}

impl ErrorBody {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self { code: BAD_REQUEST_CODE.to_string(), detail: detail.into() }
    }

    pub fn into_error(self) -> DispatchError {
        DispatchError::from_code(&self.code, &self.detail)
    }
}

impl From<&DispatchError> for ErrorBody {
    fn from(err: &DispatchError) -> Self {
        Self { code: err.code().to_string(), detail: err.detail() }
    }
}

pub fn status_for(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::DriverNotFound(_) | DispatchError::TripNotFound(_) => StatusCode::NOT_FOUND,
        DispatchError::NoAvailableDriver => StatusCode::CONFLICT,
        DispatchError::ReservationFailed(_)
        | DispatchError::PricingFailed(_)
        | DispatchError::ReleaseFailed(_)
        | DispatchError::Transport(_) => StatusCode::BAD_GATEWAY,
        DispatchError::MalformedEvent(_) => StatusCode::BAD_REQUEST,
    }
}

/// Reject coordinates outside the WGS84 range
pub fn validate_location(location: Location) -> Result<(), String> {
    if !(location.lat.is_finite() && (-90.0..=90.0).contains(&location.lat)) {
        return Err(format!("latitude out of range: {}", location.lat));
    }
    if !(location.lon.is_finite() && (-180.0..=180.0).contains(&location.lon)) {
        return Err(format!("longitude out of range: {}", location.lon));
    }
    Ok(())
}

/// First value for `key` in a raw `a=1&b=2` query string, percent-decoded
pub fn query_param(query: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes()).find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}
