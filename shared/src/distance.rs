//! Straight-line and travel distances between the user and a locale.
//!
//! Straight-line distance is pure and synchronous. Travel distance goes to
//! the routing provider through a session cache keyed by rounded coordinate
//! pairs, and degrades to straight-line when the provider fails.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::coordinator::AbortSignal;
use crate::model::{DistanceSource, LatLon, LocaleId, ValidatedCoordinate};
use crate::providers::{ProviderError, TravelDistanceProvider};

pub const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Great-circle distance in km.
#[must_use]
pub fn haversine_km(p1: ValidatedCoordinate, p2: ValidatedCoordinate) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (p1.lat() - p2.lat()).abs() < EPSILON && (p1.lon() - p2.lon()).abs() < EPSILON {
        return 0.0;
    }

    let lat1_rad = p1.lat().to_radians();
    let lat2_rad = p2.lat().to_radians();
    let delta_lat = (p2.lat() - p1.lat()).to_radians();
    let delta_lon = (p2.lon() - p1.lon()).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}

#[must_use]
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(i32::try_from(decimals).unwrap_or(8));
    (value * factor).round() / factor
}

fn rounded(coord: ValidatedCoordinate, decimals: u32) -> ValidatedCoordinate {
    // Rounding an in-range value keeps it in range; fall back to the raw
    // coordinate if it lands on the 0,0 placeholder.
    ValidatedCoordinate::new(round_to(coord.lat(), decimals), round_to(coord.lon(), decimals))
        .unwrap_or(coord)
}

/// Straight-line km over coordinates rounded to `decimals`.
///
/// `None` when either side is missing or invalid.
#[must_use]
pub fn straight_line_km(a: Option<LatLon>, b: Option<LatLon>, decimals: u32) -> Option<f64> {
    let a = a?.validate().ok()?;
    let b = b?.validate().ok()?;
    Some(haversine_km(rounded(a, decimals), rounded(b, decimals)))
}

/// Rounded `(user, locale)` coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DistanceKey {
    user: (i64, i64),
    locale: (i64, i64),
}

impl DistanceKey {
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(user: ValidatedCoordinate, locale: ValidatedCoordinate, decimals: u32) -> Self {
        let factor = 10f64.powi(i32::try_from(decimals).unwrap_or(8));
        let scale = |v: f64| (v * factor).round() as i64;
        Self {
            user: (scale(user.lat()), scale(user.lon())),
            locale: (scale(locale.lat()), scale(locale.lon())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub km: f64,
    pub source: DistanceSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRun {
    Completed { batches: usize },
    Aborted { batches: usize },
}

#[derive(Debug, Default)]
struct TravelCache {
    entries: HashMap<DistanceKey, f64>,
    /// User position the current entries were computed from.
    anchor: Option<ValidatedCoordinate>,
}

pub struct DistanceEngine {
    travel: Arc<dyn TravelDistanceProvider>,
    cache: Mutex<TravelCache>,
    decimals: u32,
    call_timeout: Duration,
    relocation_threshold_km: f64,
    batch_size: usize,
    inter_batch_delay: Duration,
}

impl DistanceEngine {
    pub fn new(travel: Arc<dyn TravelDistanceProvider>, config: &EngineConfig) -> Self {
        Self {
            travel,
            cache: Mutex::new(TravelCache::default()),
            decimals: config.distance_rounding_decimals,
            call_timeout: config.travel_call_timeout(),
            relocation_threshold_km: config.relocation_threshold_km,
            batch_size: config.travel_batch_size.max(1),
            inter_batch_delay: config.inter_batch_delay(),
        }
    }

    pub fn straight_line(&self, a: Option<LatLon>, b: Option<LatLon>) -> Option<f64> {
        straight_line_km(a, b, self.decimals)
    }

    pub async fn travel_distance(
        &self,
        locale_id: &LocaleId,
        user: Option<LatLon>,
        locale: Option<LatLon>,
    ) -> Option<f64> {
        self.measure(locale_id, user, locale).await.map(|m| m.km)
    }

    /// Travel distance with its provenance. Only real travel distances are
    /// cached; a straight-line fallback is recomputed next time.
    #[instrument(skip(self, user, locale), fields(locale_id = %locale_id))]
    pub async fn measure(
        &self,
        locale_id: &LocaleId,
        user: Option<LatLon>,
        locale: Option<LatLon>,
    ) -> Option<Measurement> {
        let user = user?.validate().ok()?;
        let Some(destination) = locale.and_then(|c| c.validate().ok()) else {
            debug!("locale coordinate invalid, no distance");
            return None;
        };

        let key = DistanceKey::new(user, destination, self.decimals);
        if let Some(km) = self.cache.lock().await.entries.get(&key).copied() {
            debug!("travel distance cache hit");
            return Some(Measurement {
                km,
                source: DistanceSource::Travel,
            });
        }

        let call = self.travel.driving_distance_km(locale_id, user, destination);
        let failure = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(km)) if km.is_finite() && km >= 0.0 => {
                let mut cache = self.cache.lock().await;
                cache.anchor.get_or_insert(user);
                cache.entries.insert(key, km);
                return Some(Measurement {
                    km,
                    source: DistanceSource::Travel,
                });
            }
            Ok(Ok(km)) => format!("unusable distance {km}"),
            Ok(Err(e)) => e.to_string(),
            Err(_) => {
                ProviderError::Timeout(u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX))
                    .to_string()
            }
        };

        warn!(error = %failure, "travel distance unavailable, using straight line");
        Some(Measurement {
            km: haversine_km(rounded(user, self.decimals), rounded(destination, self.decimals)),
            source: DistanceSource::StraightLine,
        })
    }

    /// Records the live user position. Moving beyond the relocation threshold
    /// drops every cached travel distance. Returns whether that happened.
    pub async fn observe_user_position(&self, user: ValidatedCoordinate) -> bool {
        let mut cache = self.cache.lock().await;
        let Some(anchor) = cache.anchor else {
            cache.anchor = Some(user);
            return false;
        };
        let moved_km = haversine_km(anchor, user);
        if moved_km <= self.relocation_threshold_km {
            return false;
        }
        info!(moved_km, dropped = cache.entries.len(), "user relocated, invalidating travel distances");
        cache.entries.clear();
        cache.anchor = Some(user);
        true
    }

    /// Forgets every travel distance and the position they were measured from.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        cache.entries.clear();
        cache.anchor = None;
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.entries.len()
    }

    /// Measures `targets` in fixed-size concurrent batches with a pause
    /// between batches. `on_batch` receives each batch as it completes.
    ///
    /// The abort signal is checked between batches and during the pause.
    pub async fn travel_distances_in_batches<F>(
        &self,
        user: ValidatedCoordinate,
        targets: Vec<(LocaleId, LatLon)>,
        abort: &AbortSignal,
        mut on_batch: F,
    ) -> BatchRun
    where
        F: FnMut(Vec<(LocaleId, Option<Measurement>)>) + Send,
    {
        let total = targets.len().div_ceil(self.batch_size);
        let mut done = 0;

        for chunk in targets.chunks(self.batch_size) {
            if abort.is_aborted() {
                return BatchRun::Aborted { batches: done };
            }

            let measured = join_all(chunk.iter().map(|(id, coord)| async move {
                let m = self.measure(id, Some(user.into()), Some(*coord)).await;
                (id.clone(), m)
            }))
            .await;

            if abort.is_aborted() {
                return BatchRun::Aborted { batches: done };
            }
            on_batch(measured);
            done += 1;

            if done < total && !self.inter_batch_delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.inter_batch_delay) => {}
                    () = abort.aborted() => return BatchRun::Aborted { batches: done },
                }
            }
        }

        BatchRun::Completed { batches: done }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BLR: LatLon = LatLon::new(12.9716, 77.5946);
    const MYS: LatLon = LatLon::new(12.2958, 76.6394);

    struct FakeTravel {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeTravel {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TravelDistanceProvider for FakeTravel {
        async fn driving_distance_km(
            &self,
            _locale_id: &LocaleId,
            origin: ValidatedCoordinate,
            destination: ValidatedCoordinate,
        ) -> Result<f64, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::RateLimited("quota".into()));
            }
            Ok(haversine_km(origin, destination) * 1.3)
        }
    }

    fn engine(travel: Arc<FakeTravel>) -> DistanceEngine {
        DistanceEngine::new(travel, &EngineConfig::default())
    }

    #[test]
    fn bangalore_to_mysore_is_about_128_km() {
        let km = straight_line_km(Some(BLR), Some(MYS), 4).unwrap();
        assert!((km - 128.0).abs() < 3.0, "got {km}");
    }

    #[test]
    fn invalid_side_yields_none() {
        assert_eq!(straight_line_km(Some(BLR), Some(LatLon::new(0.0, 0.0)), 4), None);
        assert_eq!(straight_line_km(Some(BLR), Some(LatLon::new(91.0, 0.0)), 4), None);
        assert_eq!(straight_line_km(None, Some(MYS), 4), None);
    }

    #[test]
    fn gps_jitter_maps_to_same_key() {
        let a = ValidatedCoordinate::new(12.971_601, 77.594_598).unwrap();
        let b = ValidatedCoordinate::new(12.971_598, 77.594_603).unwrap();
        let dest = MYS.validate().unwrap();
        assert_eq!(DistanceKey::new(a, dest, 4), DistanceKey::new(b, dest, 4));
    }

    #[tokio::test]
    async fn out_of_range_locale_skips_provider() {
        let travel = FakeTravel::ok();
        let engine = engine(travel.clone());
        let result = engine
            .travel_distance(&LocaleId::new("x"), Some(BLR), Some(LatLon::new(91.0, 0.0)))
            .await;
        assert_eq!(result, None);
        assert_eq!(travel.calls(), 0);
    }

    #[tokio::test]
    async fn travel_distance_is_cached() {
        let travel = FakeTravel::ok();
        let engine = engine(travel.clone());
        let id = LocaleId::new("mys");

        let first = engine.travel_distance(&id, Some(BLR), Some(MYS)).await.unwrap();
        let second = engine.travel_distance(&id, Some(BLR), Some(MYS)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(travel.calls(), 1);
        assert_eq!(engine.cached_len().await, 1);
    }

    #[tokio::test]
    async fn provider_failure_falls_back_without_caching() {
        let travel = FakeTravel::failing();
        let engine = engine(travel.clone());
        let id = LocaleId::new("mys");

        let m = engine.measure(&id, Some(BLR), Some(MYS)).await.unwrap();
        assert_eq!(m.source, DistanceSource::StraightLine);
        assert_eq!(Some(m.km), straight_line_km(Some(BLR), Some(MYS), 4));
        assert_eq!(engine.cached_len().await, 0);

        engine.measure(&id, Some(BLR), Some(MYS)).await;
        assert_eq!(travel.calls(), 2);
    }

    #[tokio::test]
    async fn relocation_beyond_threshold_invalidates_cache() {
        let travel = FakeTravel::ok();
        let engine = engine(travel.clone());
        engine
            .travel_distance(&LocaleId::new("mys"), Some(BLR), Some(MYS))
            .await;

        let nearby = ValidatedCoordinate::new(12.9730, 77.5950).unwrap();
        assert!(!engine.observe_user_position(nearby).await);
        assert_eq!(engine.cached_len().await, 1);

        let far = ValidatedCoordinate::new(13.05, 77.59).unwrap();
        assert!(engine.observe_user_position(far).await);
        assert_eq!(engine.cached_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_sized_and_spaced() {
        let travel = FakeTravel::ok();
        let engine = engine(travel.clone());
        let user = BLR.validate().unwrap();
        let targets: Vec<_> = (0..12)
            .map(|i| {
                (
                    LocaleId::new(format!("l{i}")),
                    LatLon::new(12.0 + f64::from(i) * 0.01, 76.5),
                )
            })
            .collect();

        let start = tokio::time::Instant::now();
        let mut sizes = Vec::new();
        let run = engine
            .travel_distances_in_batches(user, targets, &AbortSignal::new(), |batch| {
                sizes.push(batch.len());
            })
            .await;

        assert_eq!(run, BatchRun::Completed { batches: 3 });
        assert_eq!(sizes, vec![5, 5, 2]);
        assert_eq!(travel.calls(), 12);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_before_next_batch() {
        let travel = FakeTravel::ok();
        let engine = engine(travel.clone());
        let user = BLR.validate().unwrap();
        let targets: Vec<_> = (0..10)
            .map(|i| (LocaleId::new(format!("l{i}")), LatLon::new(12.5, 76.0 + f64::from(i) * 0.01)))
            .collect();
        let abort = AbortSignal::new();

        let run = engine
            .travel_distances_in_batches(user, targets, &abort, |_| abort.abort())
            .await;
        assert_eq!(run, BatchRun::Aborted { batches: 1 });
        assert_eq!(travel.calls(), 5);
    }

    proptest! {
        #[test]
        fn straight_line_is_symmetric_and_non_negative(
            lat1 in -89.0f64..89.0, lon1 in -179.0f64..179.0,
            lat2 in -89.0f64..89.0, lon2 in -179.0f64..179.0,
        ) {
            let a = Some(LatLon::new(lat1, lon1));
            let b = Some(LatLon::new(lat2, lon2));
            if let (Some(ab), Some(ba)) = (straight_line_km(a, b, 4), straight_line_km(b, a, 4)) {
                prop_assert!(ab >= 0.0);
                prop_assert!((ab - ba).abs() < 1e-9);
                prop_assert!(ab <= std::f64::consts::PI * EARTH_RADIUS_KM + 1e-6);
            }
        }
    }
}
