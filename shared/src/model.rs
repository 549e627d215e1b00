use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocaleId(pub String);

impl LocaleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocaleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum CoordinateError {
    #[error("coordinate is not finite")]
    NonFinite,
    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("coordinate is the 0,0 placeholder")]
    Placeholder,
}

/// Raw lat/lon as delivered by a backend or provider. Not trusted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn validate(self) -> Result<ValidatedCoordinate, CoordinateError> {
        ValidatedCoordinate::new(self.lat, self.lon)
    }

    pub fn is_valid(self) -> bool {
        self.validate().is_ok()
    }
}

/// A coordinate that can take part in a distance computation.
///
/// `0,0` is rejected: upstream records use it as a "not geocoded" marker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LatLon", into = "LatLon")]
pub struct ValidatedCoordinate {
    lat: f64,
    lon: f64,
}

impl ValidatedCoordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(CoordinateError::LongitudeOutOfRange(lon));
        }
        if lat == 0.0 && lon == 0.0 {
            return Err(CoordinateError::Placeholder);
        }
        Ok(Self { lat, lon })
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lon(self) -> f64 {
        self.lon
    }
}

impl TryFrom<LatLon> for ValidatedCoordinate {
    type Error = CoordinateError;

    fn try_from(value: LatLon) -> Result<Self, Self::Error> {
        Self::new(value.lat, value.lon)
    }
}

impl From<ValidatedCoordinate> for LatLon {
    fn from(coord: ValidatedCoordinate) -> Self {
        Self {
            lat: coord.lat,
            lon: coord.lon,
        }
    }
}

/// Explicit timestamp unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self(ms)
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

/// A point of interest as returned by the locale list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Locale {
    pub id: LocaleId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default, alias = "stateProvince")]
    pub state_code: Option<String>,
    #[serde(default)]
    pub spot_types: BTreeSet<String>,
    #[serde(default)]
    pub coordinate: Option<LatLon>,
    #[serde(default)]
    pub created_at: UnixTimeMs,
}

impl Locale {
    pub fn new(id: impl Into<String>, name: impl Into<String>, created_at: UnixTimeMs) -> Self {
        Self {
            id: LocaleId::new(id),
            name: name.into(),
            description: None,
            country_code: None,
            state_code: None,
            spot_types: BTreeSet::new(),
            coordinate: None,
            created_at,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_country(mut self, country_code: impl Into<String>) -> Self {
        self.country_code = Some(country_code.into());
        self
    }

    #[must_use]
    pub fn with_coordinate(mut self, lat: f64, lon: f64) -> Self {
        self.coordinate = Some(LatLon::new(lat, lon));
        self
    }

    /// The stored coordinate, only when it is usable.
    pub fn valid_coordinate(&self) -> Option<ValidatedCoordinate> {
        self.coordinate.and_then(|c| c.validate().ok())
    }

    pub fn country(&self) -> Option<&str> {
        non_blank(self.country_code.as_deref())
    }

    /// First `max_words` whitespace-separated words of the description.
    pub fn description_prefix(&self, max_words: usize) -> Option<String> {
        let description = non_blank(self.description.as_deref())?;
        let prefix = description
            .split_whitespace()
            .take(max_words)
            .collect::<Vec<_>>()
            .join(" ");
        Some(prefix)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceSource {
    StraightLine,
    Travel,
}

/// View-model annotation of a locale. The source record is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedLocale {
    pub locale: Locale,
    pub coordinate: Option<ValidatedCoordinate>,
    pub distance_km: Option<f64>,
    pub distance_source: Option<DistanceSource>,
    pub distance_pending: bool,
}

impl RankedLocale {
    pub fn new(locale: Locale) -> Self {
        let coordinate = locale.valid_coordinate();
        Self {
            locale,
            coordinate,
            distance_km: None,
            distance_source: None,
            distance_pending: false,
        }
    }

    pub fn id(&self) -> &LocaleId {
        &self.locale.id
    }

    pub fn clear_distance(&mut self) {
        self.distance_km = None;
        self.distance_source = None;
    }

    pub fn distance_text(&self) -> Option<String> {
        self.distance_km.map(format_distance_km)
    }
}

#[must_use]
pub fn format_distance_km(km: f64) -> String {
    if !km.is_finite() || km < 0.0 {
        return "Unknown".to_string();
    }

    if km < 1.0 {
        format!("{:.0} m", km * 1000.0)
    } else if km < 10.0 {
        format!("{km:.1} km")
    } else {
        format!("{:.0} km", km.round())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub has_next: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LocalePage {
    pub locales: Vec<Locale>,
    #[serde(default)]
    pub pagination: Pagination,
}
