//! Coordinate resolution for locales that may lack a stored coordinate.
//!
//! Short-circuits on the first success: stored coordinate, cache tiers,
//! places search, then geocoding. Exhausting the chain yields
//! [`ResolveOutcome::NotFound`]; a coordinate is never made up.

pub mod cache;
pub mod landmarks;
pub mod strategy;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::model::{Locale, ValidatedCoordinate};
use crate::providers::{Geocoder, PlacesSearch};

pub use self::cache::{CacheTier, Clock, CoordinateCache, CoordinateCacheEntry, CoordinateCacheKey, SystemClock};
pub use self::landmarks::LandmarkOverride;
pub use self::strategy::{ProviderKind, ResolveContext, ResolveStrategy, StrategyOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    Stored,
    Cache(CacheTier),
    Network(ProviderKind),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolveOutcome {
    Resolved {
        coordinate: ValidatedCoordinate,
        source: ResolveSource,
    },
    NotFound,
}

impl ResolveOutcome {
    pub fn coordinate(self) -> Option<ValidatedCoordinate> {
        match self {
            ResolveOutcome::Resolved { coordinate, .. } => Some(coordinate),
            ResolveOutcome::NotFound => None,
        }
    }
}

pub struct CoordinateResolver {
    cache: Arc<CoordinateCache>,
    chain: Vec<Box<dyn ResolveStrategy>>,
    prefix_words: usize,
    key_chars: usize,
    call_timeout: Duration,
}

impl CoordinateResolver {
    pub fn new(
        cache: Arc<CoordinateCache>,
        places: Arc<dyn PlacesSearch>,
        geocoder: Arc<dyn Geocoder>,
        config: &EngineConfig,
    ) -> Self {
        Self::with_chain(cache, strategy::default_chain(places, geocoder), config)
    }

    pub fn with_chain(
        cache: Arc<CoordinateCache>,
        chain: Vec<Box<dyn ResolveStrategy>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            cache,
            chain,
            prefix_words: config.description_prefix_words,
            key_chars: config.description_key_chars,
            call_timeout: config.resolver_call_timeout(),
        }
    }

    pub fn cache(&self) -> &Arc<CoordinateCache> {
        &self.cache
    }

    #[instrument(skip(self, locale), fields(locale_id = %locale.id))]
    pub async fn resolve(&self, locale: &Locale) -> ResolveOutcome {
        if let Some(coordinate) = locale.valid_coordinate() {
            return ResolveOutcome::Resolved {
                coordinate,
                source: ResolveSource::Stored,
            };
        }

        let key = match CoordinateCacheKey::for_locale(locale, self.key_chars) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(error = %e, "could not derive coordinate cache key");
                None
            }
        };

        if let Some(key) = &key {
            if let Some((coordinate, tier)) = self.cache.lookup(key).await {
                return ResolveOutcome::Resolved {
                    coordinate,
                    source: ResolveSource::Cache(tier),
                };
            }
        }

        let ctx = ResolveContext::new(locale, self.prefix_words, self.call_timeout);
        let mut refused: HashSet<ProviderKind> = HashSet::new();

        for strategy in &self.chain {
            let provider = strategy.provider();
            if refused.contains(&provider) {
                continue;
            }
            match strategy.try_resolve(&ctx).await {
                StrategyOutcome::Resolved(coordinate) => {
                    debug!(strategy = strategy.name(), "coordinate resolved");
                    if let Some(key) = &key {
                        self.cache.insert(key, coordinate).await;
                    }
                    return ResolveOutcome::Resolved {
                        coordinate,
                        source: ResolveSource::Network(provider),
                    };
                }
                StrategyOutcome::Abort => {
                    refused.insert(provider);
                }
                StrategyOutcome::Skip => {}
            }
        }

        debug!("resolution chain exhausted");
        ResolveOutcome::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::cache::tests::ManualClock;
    use super::*;
    use crate::capabilities::InMemoryKvStore;
    use crate::model::{LatLon, UnixTimeMs};
    use crate::providers::{
        GeocodeCandidate, GeocodeResponse, LocationType, PlaceResult, PlacesResponse,
        ProviderError, ProviderStatus,
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePlaces {
        calls: Mutex<Vec<String>>,
        /// Queries containing this needle return a result.
        needle: Option<&'static str>,
        status: Option<ProviderStatus>,
        hang: bool,
    }

    #[async_trait::async_trait]
    impl PlacesSearch for FakePlaces {
        async fn text_search(
            &self,
            query: &str,
            _country_code: Option<&str>,
        ) -> Result<PlacesResponse, ProviderError> {
            self.calls.lock().unwrap().push(query.to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(status) = &self.status {
                return Ok(PlacesResponse {
                    status: status.clone(),
                    results: Vec::new(),
                });
            }
            match self.needle {
                Some(needle) if query.contains(needle) => Ok(PlacesResponse {
                    status: ProviderStatus::Ok,
                    results: vec![PlaceResult {
                        name: needle.to_string(),
                        location: LatLon::new(12.3052, 76.6552),
                    }],
                }),
                _ => Ok(PlacesResponse {
                    status: ProviderStatus::ZeroResults,
                    results: Vec::new(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct FakeGeocoder {
        calls: Mutex<Vec<String>>,
        denied: bool,
    }

    #[async_trait::async_trait]
    impl Geocoder for FakeGeocoder {
        async fn geocode(&self, address: &str) -> Result<GeocodeResponse, ProviderError> {
            self.calls.lock().unwrap().push(address.to_string());
            if self.denied {
                return Err(ProviderError::Denied("key revoked".into()));
            }
            Ok(GeocodeResponse {
                status: ProviderStatus::Ok,
                results: vec![GeocodeCandidate {
                    location: LatLon::new(15.335, 76.46),
                    location_type: LocationType::GeometricCenter,
                    partial_match: false,
                }],
            })
        }
    }

    struct Harness {
        places: Arc<FakePlaces>,
        geocoder: Arc<FakeGeocoder>,
        resolver: CoordinateResolver,
    }

    fn harness(places: FakePlaces, geocoder: FakeGeocoder) -> Harness {
        let places = Arc::new(places);
        let geocoder = Arc::new(geocoder);
        let cache = Arc::new(CoordinateCache::with_clock(
            Arc::new(InMemoryKvStore::new()),
            16,
            crate::config::COORDINATE_CACHE_TTL_MS,
            ManualClock::at(1_000),
        ));
        let config = EngineConfig {
            resolver_call_timeout_ms: 50,
            ..Default::default()
        };
        let resolver = CoordinateResolver::new(cache, places.clone(), geocoder.clone(), &config);
        Harness {
            places,
            geocoder,
            resolver,
        }
    }

    fn places_calls(h: &Harness) -> Vec<String> {
        h.places.calls.lock().unwrap().clone()
    }

    fn geocoder_calls(h: &Harness) -> Vec<String> {
        h.geocoder.calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn valid_stored_coordinate_makes_no_network_call() {
        let h = harness(FakePlaces::default(), FakeGeocoder::default());
        let locale = Locale::new("a", "Coorg", UnixTimeMs(0)).with_coordinate(12.42, 75.74);

        let outcome = h.resolver.resolve(&locale).await;
        assert!(matches!(
            outcome,
            ResolveOutcome::Resolved {
                source: ResolveSource::Stored,
                ..
            }
        ));
        assert!(places_calls(&h).is_empty());
        assert!(geocoder_calls(&h).is_empty());
    }

    #[tokio::test]
    async fn mysure_resolves_through_landmark_override_without_geocoding() {
        let h = harness(
            FakePlaces {
                needle: Some("Mysore Palace"),
                ..Default::default()
            },
            FakeGeocoder::default(),
        );
        let locale = Locale::new("m", "Mysure", UnixTimeMs(0));

        let coordinate = h.resolver.resolve(&locale).await.coordinate().unwrap();
        assert_eq!(coordinate.lat(), 12.3052);
        assert_eq!(places_calls(&h), vec!["Mysore Palace, Mysuru, Karnataka"]);
        assert!(geocoder_calls(&h).is_empty());
    }

    #[tokio::test]
    async fn second_resolution_is_served_from_cache() {
        let h = harness(
            FakePlaces {
                needle: Some("Hampi"),
                ..Default::default()
            },
            FakeGeocoder::default(),
        );
        let locale = Locale::new("h", "Hampi", UnixTimeMs(0)).with_country("IN");

        let first = h.resolver.resolve(&locale).await;
        let calls_after_first = places_calls(&h).len();
        let second = h.resolver.resolve(&locale).await;

        assert_eq!(first.coordinate(), second.coordinate());
        assert_eq!(places_calls(&h).len(), calls_after_first);
        assert!(matches!(
            second,
            ResolveOutcome::Resolved {
                source: ResolveSource::Cache(CacheTier::Global),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn places_denial_falls_through_to_geocoding() {
        let h = harness(
            FakePlaces {
                status: Some(ProviderStatus::RequestDenied),
                ..Default::default()
            },
            FakeGeocoder::default(),
        );
        let locale = Locale::new("h", "Hampi", UnixTimeMs(0)).with_country("IN");

        let outcome = h.resolver.resolve(&locale).await;
        assert!(matches!(
            outcome,
            ResolveOutcome::Resolved {
                source: ResolveSource::Network(ProviderKind::Geocoding),
                ..
            }
        ));
        assert_eq!(places_calls(&h).len(), 1);
        assert_eq!(geocoder_calls(&h), vec!["Hampi, IN"]);
    }

    #[tokio::test]
    async fn zero_results_advance_through_every_places_query() {
        let h = harness(FakePlaces::default(), FakeGeocoder::default());
        let locale = Locale::new("h", "Hampi", UnixTimeMs(0))
            .with_description("Boulder strewn ruins of Vijayanagara");

        h.resolver.resolve(&locale).await;
        assert_eq!(
            places_calls(&h),
            vec![
                "Boulder strewn ruins of Vijayanagara, Hampi",
                "tourist attraction Hampi",
                "popular places Hampi",
                "Hampi",
            ]
        );
        assert_eq!(
            geocoder_calls(&h),
            vec!["Boulder strewn ruins of Vijayanagara, Hampi"]
        );
    }

    #[tokio::test]
    async fn exhausted_chain_is_not_found() {
        let h = harness(
            FakePlaces::default(),
            FakeGeocoder {
                denied: true,
                ..Default::default()
            },
        );
        let locale = Locale::new("x", "Nowhere", UnixTimeMs(0)).with_coordinate(0.0, 0.0);

        assert_eq!(h.resolver.resolve(&locale).await, ResolveOutcome::NotFound);
        assert_eq!(geocoder_calls(&h).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_strategy_failures() {
        let h = harness(
            FakePlaces {
                hang: true,
                ..Default::default()
            },
            FakeGeocoder::default(),
        );
        let locale = Locale::new("h", "Hampi", UnixTimeMs(0));

        let outcome = h.resolver.resolve(&locale).await;
        assert_eq!(places_calls(&h).len(), 3);
        assert!(outcome.coordinate().is_some());
    }
}
