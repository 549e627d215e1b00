//! Upstream collaborators: the locale list backend, places search,
//! geocoding and travel distance.
//!
//! Only the traits are required by the engine. `google` and `backend`
//! provide HTTP implementations over [`HttpTransport`](crate::capabilities::HttpTransport).

pub mod backend;
pub mod google;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::HttpError;
use crate::coordinator::AbortSignal;
use crate::model::{LatLon, LocaleId, LocalePage, ValidatedCoordinate};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request denied: {0}")]
    Denied(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider call timed out after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(#[from] HttpError),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no result: {0}")]
    NoResult(String),
}

impl ProviderError {
    /// Denial and rate limiting stop every remaining query to that provider.
    pub fn is_access_denial(&self) -> bool {
        match self {
            ProviderError::Denied(_) | ProviderError::RateLimited(_) => true,
            ProviderError::Transport(e) => e.is_denied() || e.is_rate_limited(),
            _ => false,
        }
    }
}

/// Status field shared by the places, geocoding and distance APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    Ok,
    ZeroResults,
    RequestDenied,
    OverQueryLimit,
    InvalidRequest,
    Other(String),
}

impl ProviderStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "OK" => Self::Ok,
            "ZERO_RESULTS" => Self::ZeroResults,
            "REQUEST_DENIED" => Self::RequestDenied,
            "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => Self::OverQueryLimit,
            "INVALID_REQUEST" => Self::InvalidRequest,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_access_denial(&self) -> bool {
        matches!(self, Self::RequestDenied | Self::OverQueryLimit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceResult {
    pub name: String,
    pub location: LatLon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacesResponse {
    pub status: ProviderStatus,
    pub results: Vec<PlaceResult>,
}

/// Precision of a geocoding match, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LocationType {
    Rooftop,
    RangeInterpolated,
    GeometricCenter,
    Approximate,
}

impl LocationType {
    pub fn parse(value: &str) -> Self {
        match value {
            "ROOFTOP" => Self::Rooftop,
            "RANGE_INTERPOLATED" => Self::RangeInterpolated,
            "GEOMETRIC_CENTER" => Self::GeometricCenter,
            _ => Self::Approximate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeCandidate {
    pub location: LatLon,
    pub location_type: LocationType,
    pub partial_match: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResponse {
    pub status: ProviderStatus,
    pub results: Vec<GeocodeCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleQuery {
    pub search_text: String,
    pub country_code: Option<String>,
    pub state_code: Option<String>,
    pub spot_types: Vec<String>,
    pub page: u32,
    pub page_size: u32,
    pub include_inactive: bool,
}

#[async_trait::async_trait]
pub trait LocaleListProvider: Send + Sync {
    async fn list(&self, query: &LocaleQuery, abort: &AbortSignal)
        -> Result<LocalePage, ProviderError>;
}

#[async_trait::async_trait]
pub trait PlacesSearch: Send + Sync {
    async fn text_search(
        &self,
        query: &str,
        country_code: Option<&str>,
    ) -> Result<PlacesResponse, ProviderError>;
}

#[async_trait::async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<GeocodeResponse, ProviderError>;
}

#[async_trait::async_trait]
pub trait TravelDistanceProvider: Send + Sync {
    async fn driving_distance_km(
        &self,
        locale_id: &LocaleId,
        origin: ValidatedCoordinate,
        destination: ValidatedCoordinate,
    ) -> Result<f64, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing() {
        assert_eq!(ProviderStatus::parse("OK"), ProviderStatus::Ok);
        assert!(ProviderStatus::parse("REQUEST_DENIED").is_access_denial());
        assert!(ProviderStatus::parse("OVER_QUERY_LIMIT").is_access_denial());
        assert!(!ProviderStatus::parse("ZERO_RESULTS").is_access_denial());
        assert_eq!(
            ProviderStatus::parse("WEIRD"),
            ProviderStatus::Other("WEIRD".into())
        );
    }

    #[test]
    fn location_type_orders_by_precision() {
        let mut types = vec![
            LocationType::Approximate,
            LocationType::Rooftop,
            LocationType::GeometricCenter,
            LocationType::RangeInterpolated,
        ];
        types.sort();
        assert_eq!(
            types,
            vec![
                LocationType::Rooftop,
                LocationType::RangeInterpolated,
                LocationType::GeometricCenter,
                LocationType::Approximate,
            ]
        );
        assert_eq!(LocationType::parse("bogus"), LocationType::Approximate);
    }

    #[test]
    fn transport_denial_counts_as_access_denial() {
        let err = ProviderError::Transport(HttpError::HttpStatus {
            status: 403,
            message: String::new(),
            request_id: "r".into(),
        });
        assert!(err.is_access_denial());
        assert!(!ProviderError::Timeout(10).is_access_denial());
    }
}
