//! Network resolution strategies, tried in order by the resolver.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::landmarks::LandmarkOverride;
use crate::model::{Locale, ValidatedCoordinate};
use crate::providers::{GeocodeCandidate, Geocoder, PlacesSearch, ProviderError, ProviderStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Places,
    Geocoding,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StrategyOutcome {
    Resolved(ValidatedCoordinate),
    /// Not applicable or no usable result; the chain advances.
    Skip,
    /// The provider refused service; its remaining strategies are skipped.
    Abort,
}

/// Everything a strategy may derive its query from.
pub struct ResolveContext<'a> {
    pub locale: &'a Locale,
    pub country: Option<&'a str>,
    pub description_prefix: Option<String>,
    pub landmark: Option<&'static LandmarkOverride>,
    pub call_timeout: Duration,
}

impl<'a> ResolveContext<'a> {
    pub fn new(locale: &'a Locale, prefix_words: usize, call_timeout: Duration) -> Self {
        Self {
            locale,
            country: locale.country(),
            description_prefix: locale.description_prefix(prefix_words),
            landmark: super::landmarks::lookup(&locale.name),
            call_timeout,
        }
    }

    fn with_country(&self, query: String) -> String {
        match self.country {
            Some(cc) => format!("{query}, {cc}"),
            None => query,
        }
    }

    fn name(&self) -> &str {
        self.locale.name.trim()
    }
}

#[async_trait::async_trait]
pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn provider(&self) -> ProviderKind;
    async fn try_resolve(&self, ctx: &ResolveContext<'_>) -> StrategyOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacesQueryKind {
    DescriptionPrefix,
    Landmark,
    TouristAttraction,
    PopularPlaces,
    BareName,
}

impl PlacesQueryKind {
    pub const ORDER: [PlacesQueryKind; 5] = [
        Self::DescriptionPrefix,
        Self::Landmark,
        Self::TouristAttraction,
        Self::PopularPlaces,
        Self::BareName,
    ];

    fn query(self, ctx: &ResolveContext<'_>) -> Option<String> {
        let name = ctx.name();
        let query = match self {
            Self::DescriptionPrefix => format!("{}, {name}", ctx.description_prefix.as_deref()?),
            Self::Landmark => ctx.landmark?.canonical.to_string(),
            Self::TouristAttraction => format!("tourist attraction {name}"),
            Self::PopularPlaces => format!("popular places {name}"),
            Self::BareName => name.to_string(),
        };
        Some(ctx.with_country(query))
    }
}

pub struct PlacesQueryStrategy {
    kind: PlacesQueryKind,
    places: Arc<dyn PlacesSearch>,
}

impl PlacesQueryStrategy {
    pub fn new(kind: PlacesQueryKind, places: Arc<dyn PlacesSearch>) -> Self {
        Self { kind, places }
    }
}

#[async_trait::async_trait]
impl ResolveStrategy for PlacesQueryStrategy {
    fn name(&self) -> &'static str {
        match self.kind {
            PlacesQueryKind::DescriptionPrefix => "places_description_prefix",
            PlacesQueryKind::Landmark => "places_landmark",
            PlacesQueryKind::TouristAttraction => "places_tourist_attraction",
            PlacesQueryKind::PopularPlaces => "places_popular_places",
            PlacesQueryKind::BareName => "places_bare_name",
        }
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Places
    }

    async fn try_resolve(&self, ctx: &ResolveContext<'_>) -> StrategyOutcome {
        let Some(query) = self.kind.query(ctx) else {
            return StrategyOutcome::Skip;
        };
        if query.trim().is_empty() {
            return StrategyOutcome::Skip;
        }

        let call = self.places.text_search(&query, ctx.country);
        let response = match tokio::time::timeout(ctx.call_timeout, call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return outcome_for_error(self.name(), &e),
            Err(_) => return outcome_for_error(self.name(), &timed_out(ctx.call_timeout)),
        };

        match response.status {
            ProviderStatus::Ok => {}
            status if status.is_access_denial() => {
                warn!(strategy = self.name(), ?status, "places search refused, skipping provider");
                return StrategyOutcome::Abort;
            }
            status => {
                debug!(strategy = self.name(), ?status, "places query returned no match");
                return StrategyOutcome::Skip;
            }
        }

        response
            .results
            .iter()
            .find_map(|place| place.location.validate().ok())
            .map_or(StrategyOutcome::Skip, StrategyOutcome::Resolved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Landmark,
    DescriptionPrefix,
    Name,
}

impl AddressKind {
    pub const ORDER: [AddressKind; 3] = [Self::Landmark, Self::DescriptionPrefix, Self::Name];

    fn address(self, ctx: &ResolveContext<'_>) -> Option<String> {
        let name = ctx.name();
        match self {
            Self::Landmark => Some(ctx.landmark?.address.to_string()),
            Self::DescriptionPrefix => Some(ctx.with_country(format!(
                "{}, {name}",
                ctx.description_prefix.as_deref()?
            ))),
            Self::Name => Some(ctx.with_country(name.to_string())),
        }
    }
}

pub struct GeocodeAddressStrategy {
    kind: AddressKind,
    geocoder: Arc<dyn Geocoder>,
}

impl GeocodeAddressStrategy {
    pub fn new(kind: AddressKind, geocoder: Arc<dyn Geocoder>) -> Self {
        Self { kind, geocoder }
    }
}

#[async_trait::async_trait]
impl ResolveStrategy for GeocodeAddressStrategy {
    fn name(&self) -> &'static str {
        match self.kind {
            AddressKind::Landmark => "geocode_landmark",
            AddressKind::DescriptionPrefix => "geocode_description_prefix",
            AddressKind::Name => "geocode_name",
        }
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Geocoding
    }

    async fn try_resolve(&self, ctx: &ResolveContext<'_>) -> StrategyOutcome {
        let Some(address) = self.kind.address(ctx) else {
            return StrategyOutcome::Skip;
        };
        if address.trim().is_empty() {
            return StrategyOutcome::Skip;
        }

        let response = match tokio::time::timeout(ctx.call_timeout, self.geocoder.geocode(&address)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return outcome_for_error(self.name(), &e),
            Err(_) => return outcome_for_error(self.name(), &timed_out(ctx.call_timeout)),
        };

        match response.status {
            ProviderStatus::Ok => {}
            status if status.is_access_denial() => {
                warn!(strategy = self.name(), ?status, "geocoder refused, skipping provider");
                return StrategyOutcome::Abort;
            }
            status => {
                debug!(strategy = self.name(), ?status, "geocode returned no match");
                return StrategyOutcome::Skip;
            }
        }

        best_candidate(&response.results).map_or(StrategyOutcome::Skip, StrategyOutcome::Resolved)
    }
}

/// Most precise location type first, then full matches over partial ones.
pub fn best_candidate(candidates: &[GeocodeCandidate]) -> Option<ValidatedCoordinate> {
    candidates
        .iter()
        .filter_map(|c| c.location.validate().ok().map(|coord| (c, coord)))
        .min_by_key(|(c, _)| (c.location_type, c.partial_match))
        .map(|(_, coord)| coord)
}

fn timed_out(limit: Duration) -> ProviderError {
    ProviderError::Timeout(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
}

fn outcome_for_error(strategy: &'static str, error: &ProviderError) -> StrategyOutcome {
    if error.is_access_denial() {
        warn!(strategy, error = %error, "provider refused, skipping provider");
        StrategyOutcome::Abort
    } else {
        debug!(strategy, error = %error, "strategy failed, advancing");
        StrategyOutcome::Skip
    }
}

/// The full network chain: places queries, then geocoding addresses.
pub fn default_chain(
    places: Arc<dyn PlacesSearch>,
    geocoder: Arc<dyn Geocoder>,
) -> Vec<Box<dyn ResolveStrategy>> {
    let mut chain: Vec<Box<dyn ResolveStrategy>> = Vec::with_capacity(8);
    for kind in PlacesQueryKind::ORDER {
        chain.push(Box::new(PlacesQueryStrategy::new(kind, Arc::clone(&places))));
    }
    for kind in AddressKind::ORDER {
        chain.push(Box::new(GeocodeAddressStrategy::new(kind, Arc::clone(&geocoder))));
    }
    chain
}
