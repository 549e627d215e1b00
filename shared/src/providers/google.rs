//! Places text search, geocoding and distance matrix over HTTP.

use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{
    GeocodeCandidate, GeocodeResponse, Geocoder, LocationType, PlaceResult, PlacesResponse,
    PlacesSearch, ProviderError, ProviderStatus, TravelDistanceProvider,
};
use crate::capabilities::{HttpRequest, HttpTransport, ValidatedUrl};
use crate::model::{LatLon, LocaleId, ValidatedCoordinate};

pub const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com/maps/api";

/// The API key is never logged; `SecretString` redacts its `Debug` output.
#[derive(Debug, Deserialize)]
pub struct GoogleMapsConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key: SecretString,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl GoogleMapsConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: default_base_url(),
            api_key: SecretString::new(api_key.into()),
            timeout_ms: default_timeout_ms(),
        }
    }
}

pub struct GoogleMapsClient {
    transport: Arc<dyn HttpTransport>,
    base_url: ValidatedUrl,
    api_key: SecretString,
    timeout: Duration,
}

impl GoogleMapsClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: GoogleMapsConfig) -> Result<Self, ProviderError> {
        let base_url = ValidatedUrl::new(config.base_url.trim_end_matches('/'))?;
        Ok(Self {
            transport,
            base_url,
            api_key: config.api_key,
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let endpoint = ValidatedUrl::new(format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path))?;
        let url = endpoint.with_query(
            params
                .iter()
                .copied()
                .chain(std::iter::once(("key", self.api_key.expose_secret().as_str()))),
        )?;
        let request = HttpRequest::get(url).with_timeout(self.timeout)?;
        debug!(path, request_id = request.request_id(), "calling maps endpoint");

        let response = self.transport.execute(request).await?.error_for_status()?;
        Ok(response.json()?)
    }
}

#[derive(Deserialize)]
struct WireLocation {
    lat: f64,
    lng: f64,
}

impl From<WireLocation> for LatLon {
    fn from(w: WireLocation) -> Self {
        LatLon::new(w.lat, w.lng)
    }
}

#[derive(Deserialize)]
struct WireGeometry {
    location: WireLocation,
    #[serde(default)]
    location_type: Option<String>,
}

#[derive(Deserialize)]
struct WirePlace {
    #[serde(default)]
    name: String,
    geometry: WireGeometry,
}

#[derive(Deserialize)]
struct WirePlacesResponse {
    status: String,
    #[serde(default)]
    results: Vec<WirePlace>,
}

#[derive(Deserialize)]
struct WireGeocodeResult {
    geometry: WireGeometry,
    #[serde(default)]
    partial_match: bool,
}

#[derive(Deserialize)]
struct WireGeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<WireGeocodeResult>,
}

#[derive(Deserialize)]
struct WireMatrixResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    rows: Vec<WireMatrixRow>,
}

#[derive(Deserialize)]
struct WireMatrixRow {
    #[serde(default)]
    elements: Vec<WireMatrixElement>,
}

#[derive(Deserialize)]
struct WireMatrixElement {
    status: String,
    #[serde(default)]
    distance: Option<WireMatrixValue>,
}

#[derive(Deserialize)]
struct WireMatrixValue {
    value: f64,
}

fn format_coordinate(coord: ValidatedCoordinate) -> String {
    format!("{:.6},{:.6}", coord.lat(), coord.lon())
}

#[async_trait::async_trait]
impl PlacesSearch for GoogleMapsClient {
    #[instrument(skip(self))]
    async fn text_search(
        &self,
        query: &str,
        country_code: Option<&str>,
    ) -> Result<PlacesResponse, ProviderError> {
        let region = country_code.map(str::to_lowercase);
        let mut params = vec![("query", query)];
        if let Some(region) = region.as_deref() {
            params.push(("region", region));
        }

        let wire: WirePlacesResponse = self.get_json("place/textsearch/json", &params).await?;
        Ok(PlacesResponse {
            status: ProviderStatus::parse(&wire.status),
            results: wire
                .results
                .into_iter()
                .map(|p| PlaceResult {
                    name: p.name,
                    location: p.geometry.location.into(),
                })
                .collect(),
        })
    }
}

#[async_trait::async_trait]
impl Geocoder for GoogleMapsClient {
    #[instrument(skip(self))]
    async fn geocode(&self, address: &str) -> Result<GeocodeResponse, ProviderError> {
        let wire: WireGeocodeResponse = self
            .get_json("geocode/json", &[("address", address)])
            .await?;
        Ok(GeocodeResponse {
            status: ProviderStatus::parse(&wire.status),
            results: wire
                .results
                .into_iter()
                .map(|r| GeocodeCandidate {
                    location_type: r
                        .geometry
                        .location_type
                        .as_deref()
                        .map_or(LocationType::Approximate, LocationType::parse),
                    location: r.geometry.location.into(),
                    partial_match: r.partial_match,
                })
                .collect(),
        })
    }
}

#[async_trait::async_trait]
impl TravelDistanceProvider for GoogleMapsClient {
    #[instrument(skip(self, origin, destination), fields(locale_id = %locale_id))]
    async fn driving_distance_km(
        &self,
        locale_id: &LocaleId,
        origin: ValidatedCoordinate,
        destination: ValidatedCoordinate,
    ) -> Result<f64, ProviderError> {
        let origins = format_coordinate(origin);
        let destinations = format_coordinate(destination);
        let wire: WireMatrixResponse = self
            .get_json(
                "distancematrix/json",
                &[
                    ("origins", origins.as_str()),
                    ("destinations", destinations.as_str()),
                    ("mode", "driving"),
                    ("units", "metric"),
                ],
            )
            .await?;

        let message = wire.error_message.unwrap_or_else(|| wire.status.clone());
        match ProviderStatus::parse(&wire.status) {
            ProviderStatus::Ok => {}
            ProviderStatus::RequestDenied => return Err(ProviderError::Denied(message)),
            ProviderStatus::OverQueryLimit => return Err(ProviderError::RateLimited(message)),
            _ => return Err(ProviderError::Malformed(message)),
        }

        let element = wire
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.elements.into_iter().next())
            .ok_or_else(|| ProviderError::Malformed("distance matrix without elements".into()))?;

        if element.status != "OK" {
            return Err(ProviderError::NoResult(format!("route status {}", element.status)));
        }

        let meters = element
            .distance
            .map(|d| d.value)
            .filter(|m| m.is_finite() && *m >= 0.0)
            .ok_or_else(|| ProviderError::Malformed("route without distance".into()))?;
        Ok(meters / 1000.0)
    }
}
