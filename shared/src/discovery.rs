//! The discovery screen's engine.
//!
//! Listens to list snapshots from the [`RequestCoordinator`] and to the user
//! position, and for each new list (or new position) runs one enrichment:
//!
//! 1. attach straight-line distances from stored coordinates and publish;
//! 2. resolve missing coordinates in batches, publishing after each batch;
//! 3. fetch travel distances in batches, folding each batch in and
//!    publishing a full re-sort.
//!
//! A newer enrichment supersedes an older one; the older one's results are
//! dropped. Views go out over a `watch` channel.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::bookmarks::{BookmarkError, BookmarkStore, SaveOutcome, ToggleOutcome};
use crate::capabilities::{
    resolve_user_location, DeviceLocation, KeyValueStore, LocationAccuracy,
};
use crate::config::{ConfigError, EngineConfig};
use crate::coordinator::{AbortSignal, FetchOutcome, ListSnapshot, QueryPhase, RequestCoordinator};
use crate::distance::{BatchRun, DistanceEngine};
use crate::filters::{FilterAction, FilterError, FilterState};
use crate::model::{DistanceSource, LatLon, Locale, LocaleId, RankedLocale, ValidatedCoordinate};
use crate::providers::{Geocoder, LocaleListProvider, PlacesSearch, TravelDistanceProvider};
use crate::resolver::{CoordinateCache, CoordinateResolver};
use crate::sorter::sort_locales;

const LOCATION_TIMEOUT: Duration = Duration::from_secs(10);

static SHARED: OnceLock<SharedCaches> = OnceLock::new();

/// Process-wide caches: created on first use, never torn down.
pub struct SharedCaches {
    pub coordinates: Arc<CoordinateCache>,
    pub distances: Arc<DistanceEngine>,
    pub bookmarks: Arc<BookmarkStore>,
}

impl SharedCaches {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        travel: Arc<dyn TravelDistanceProvider>,
        config: &EngineConfig,
    ) -> Result<Self, BookmarkError> {
        Ok(Self {
            coordinates: Arc::new(CoordinateCache::new(
                Arc::clone(&store),
                config.session_cache_capacity,
                config.coordinate_cache_ttl_ms,
            )),
            distances: Arc::new(DistanceEngine::new(travel, config)),
            bookmarks: Arc::new(BookmarkStore::new(store)?),
        })
    }

    /// Returns the process-wide instance, running `init` on first access only.
    pub fn global<E>(init: impl FnOnce() -> Result<Self, E>) -> Result<&'static Self, E> {
        if let Some(shared) = SHARED.get() {
            return Ok(shared);
        }
        let created = init()?;
        Ok(SHARED.get_or_init(|| created))
    }
}

/// Upstream collaborators of one engine.
pub struct DiscoveryDeps {
    pub list: Arc<dyn LocaleListProvider>,
    pub places: Arc<dyn PlacesSearch>,
    pub geocoder: Arc<dyn Geocoder>,
    pub location: Option<Arc<dyn DeviceLocation>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkNotice {
    Saved,
    AlreadySaved,
    Removed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryItem {
    pub id: LocaleId,
    pub name: String,
    pub description: Option<String>,
    pub country_code: Option<String>,
    pub spot_types: BTreeSet<String>,
    pub distance_km: Option<f64>,
    pub distance_text: Option<String>,
    pub distance_source: Option<DistanceSource>,
    pub distance_pending: bool,
    pub saved: bool,
}

impl DiscoveryItem {
    fn from_ranked(ranked: &RankedLocale, saved: bool) -> Self {
        let locale = &ranked.locale;
        Self {
            id: locale.id.clone(),
            name: locale.name.clone(),
            description: locale.description.clone(),
            country_code: locale.country_code.clone(),
            spot_types: locale.spot_types.clone(),
            distance_km: ranked.distance_km,
            distance_text: ranked.distance_text(),
            distance_source: ranked.distance_source,
            distance_pending: ranked.distance_pending,
            saved,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct DiscoveryView {
    pub items: Vec<DiscoveryItem>,
    pub phase: QueryPhase,
    pub page: u32,
    pub has_more: bool,
    /// Only set when a fetch for a non-empty search failed.
    pub error: Option<String>,
    pub notice: Option<BookmarkNotice>,
    pub search_query: String,
    pub filters: FilterState,
    pub location_known: bool,
    pub hidden_by_radius: usize,
}

#[derive(Default)]
struct RankedState {
    generation: u64,
    list_revision: u64,
    items: Vec<RankedLocale>,
    abort: Option<AbortSignal>,
    saved: HashSet<LocaleId>,
    notice: Option<BookmarkNotice>,
}

pub struct DiscoveryEngine {
    coordinator: Arc<RequestCoordinator>,
    resolver: Arc<CoordinateResolver>,
    distances: Arc<DistanceEngine>,
    bookmarks: Arc<BookmarkStore>,
    location: Option<Arc<dyn DeviceLocation>>,
    batch_size: usize,
    ranked: Mutex<RankedState>,
    user_tx: watch::Sender<Option<ValidatedCoordinate>>,
    view_tx: watch::Sender<DiscoveryView>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryEngine {
    pub fn new(
        config: &EngineConfig,
        deps: DiscoveryDeps,
        caches: &SharedCaches,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let resolver = CoordinateResolver::new(
            Arc::clone(&caches.coordinates),
            deps.places,
            deps.geocoder,
            config,
        );
        let (user_tx, _) = watch::channel(None);
        let (view_tx, _) = watch::channel(DiscoveryView::default());
        Ok(Arc::new(Self {
            coordinator: Arc::new(RequestCoordinator::new(deps.list, config)),
            resolver: Arc::new(resolver),
            distances: Arc::clone(&caches.distances),
            bookmarks: Arc::clone(&caches.bookmarks),
            location: deps.location,
            batch_size: config.travel_batch_size.max(1),
            ranked: Mutex::new(RankedState::default()),
            user_tx,
            view_tx,
            listener: Mutex::new(None),
        }))
    }

    pub fn subscribe(&self) -> watch::Receiver<DiscoveryView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> DiscoveryView {
        self.view_tx.borrow().clone()
    }

    pub fn coordinator(&self) -> &Arc<RequestCoordinator> {
        &self.coordinator
    }

    pub fn bookmarks(&self) -> &Arc<BookmarkStore> {
        &self.bookmarks
    }

    pub fn user_location(&self) -> Option<ValidatedCoordinate> {
        *self.user_tx.borrow()
    }

    fn lock_ranked(&self) -> MutexGuard<'_, RankedState> {
        self.ranked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip(self))]
    pub async fn mount(self: &Arc<Self>) -> FetchOutcome {
        {
            let handle = self.spawn_listener();
            let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = listener.replace(handle) {
                previous.abort();
            }
        }
        if !self.coordinator.snapshot().locales.is_empty() {
            // Enrichment of the retained list was cancelled by the last unmount.
            self.start_enrichment();
        }

        match self.bookmarks.saved_ids().await {
            Ok(saved) => self.lock_ranked().saved = saved,
            Err(e) => warn!(error = %e, "could not load saved locales"),
        }

        if self.location.is_some() {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.refresh_user_location().await });
        }

        self.coordinator.mount().await
    }

    #[instrument(skip(self))]
    pub async fn unmount(&self) {
        if let Some(handle) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        {
            let mut ranked = self.lock_ranked();
            ranked.generation += 1;
            if let Some(abort) = ranked.abort.take() {
                abort.abort();
            }
        }
        self.coordinator.unmount().await;
    }

    pub async fn search_text_changed(&self, text: impl Into<String>) {
        self.coordinator.search_text_changed(text).await;
    }

    pub async fn dispatch_filter(&self, action: FilterAction) -> Result<FetchOutcome, FilterError> {
        self.coordinator.dispatch_filter(action).await
    }

    pub async fn pull_to_refresh(&self) -> FetchOutcome {
        self.coordinator.pull_to_refresh().await
    }

    pub async fn load_more(&self) -> FetchOutcome {
        self.coordinator.load_more().await
    }

    pub async fn focus_regained(self: &Arc<Self>) -> FetchOutcome {
        if self.location.is_some() {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.refresh_user_location().await });
        }
        self.coordinator.focus_regained().await
    }

    /// Accepts a position fix. Invalid fixes are ignored.
    pub async fn set_user_location(&self, position: LatLon) {
        let coordinate = match position.validate() {
            Ok(coordinate) => coordinate,
            Err(e) => {
                warn!(error = %e, "ignoring invalid user position");
                return;
            }
        };
        self.distances.observe_user_position(coordinate).await;
        self.user_tx.send_if_modified(|current| {
            if *current == Some(coordinate) {
                return false;
            }
            *current = Some(coordinate);
            true
        });
    }

    /// Permission revoked or position lost: distances disappear and cached
    /// travel distances are dropped.
    pub async fn clear_user_location(&self) {
        if self.user_tx.send_if_modified(|current| current.take().is_some()) {
            self.distances.invalidate().await;
        }
    }

    pub async fn refresh_user_location(&self) {
        let Some(location) = &self.location else {
            return;
        };
        match resolve_user_location(location.as_ref(), LocationAccuracy::Balanced, LOCATION_TIMEOUT).await {
            Some(coordinate) => self.set_user_location(coordinate.into()).await,
            None => debug!("no user position available"),
        }
    }

    /// Saves or unsaves a locale from the current list. `None` when the id
    /// is not in the list.
    #[instrument(skip(self), fields(locale_id = %id))]
    pub async fn toggle_bookmark(
        &self,
        id: &LocaleId,
    ) -> Result<Option<ToggleOutcome>, BookmarkError> {
        let Some(locale) = self.find_locale(id) else {
            debug!("toggle for a locale not in the list");
            return Ok(None);
        };
        let result = self.bookmarks.toggle(&locale).await;
        let notice = match &result {
            Ok(ToggleOutcome::Saved) => Some(BookmarkNotice::Saved),
            Ok(ToggleOutcome::Removed) => Some(BookmarkNotice::Removed),
            Ok(ToggleOutcome::InFlight) => None,
            Err(_) => Some(BookmarkNotice::Failed),
        };
        self.record_bookmark_change(id, notice);
        result.map(Some)
    }

    /// Saves a locale from the current list. Saving twice surfaces a notice.
    #[instrument(skip(self), fields(locale_id = %id))]
    pub async fn save_bookmark(&self, id: &LocaleId) -> Result<Option<SaveOutcome>, BookmarkError> {
        let Some(locale) = self.find_locale(id) else {
            return Ok(None);
        };
        let result = self.bookmarks.save(&locale).await;
        let notice = match &result {
            Ok(SaveOutcome::Saved) => Some(BookmarkNotice::Saved),
            Ok(SaveOutcome::AlreadySaved) => Some(BookmarkNotice::AlreadySaved),
            Ok(SaveOutcome::InFlight) => None,
            Err(_) => Some(BookmarkNotice::Failed),
        };
        self.record_bookmark_change(id, notice);
        result.map(Some)
    }

    fn record_bookmark_change(&self, id: &LocaleId, notice: Option<BookmarkNotice>) {
        let Some(notice) = notice else {
            return;
        };
        {
            let mut ranked = self.lock_ranked();
            match notice {
                BookmarkNotice::Saved | BookmarkNotice::AlreadySaved => {
                    ranked.saved.insert(id.clone());
                }
                BookmarkNotice::Removed => {
                    ranked.saved.remove(id);
                }
                BookmarkNotice::Failed => {}
            }
            ranked.notice = Some(notice);
        }
        self.publish();
    }

    pub fn dismiss_notice(&self) {
        self.lock_ranked().notice = None;
        self.publish();
    }

    fn find_locale(&self, id: &LocaleId) -> Option<Locale> {
        self.coordinator
            .snapshot()
            .locales
            .into_iter()
            .find(|l| &l.id == id)
    }

    fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut snapshots = self.coordinator.subscribe();
        let mut user = self.user_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let location_changed = tokio::select! {
                    changed = snapshots.changed() => {
                        if changed.is_err() { break; }
                        false
                    }
                    changed = user.changed() => {
                        if changed.is_err() { break; }
                        true
                    }
                };
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                let revision = snapshots.borrow_and_update().list_revision;
                let _ = user.borrow_and_update();

                let stale = engine.lock_ranked().list_revision != revision;
                if location_changed || stale {
                    engine.start_enrichment();
                } else {
                    engine.publish();
                }
            }
        })
    }

    fn start_enrichment(self: &Arc<Self>) {
        let snapshot = self.coordinator.snapshot();
        let user = self.user_location();
        let abort = AbortSignal::new();
        let generation = {
            let mut ranked = self.lock_ranked();
            ranked.generation += 1;
            ranked.list_revision = snapshot.list_revision;
            if let Some(previous) = ranked.abort.replace(abort.clone()) {
                previous.abort();
            }
            ranked.generation
        };
        debug!(generation, count = snapshot.locales.len(), "starting enrichment");
        tokio::spawn(Arc::clone(self).enrich(generation, snapshot.locales, user, abort));
    }

    async fn enrich(
        self: Arc<Self>,
        generation: u64,
        locales: Vec<Locale>,
        user: Option<ValidatedCoordinate>,
        abort: AbortSignal,
    ) {
        let mut items: Vec<RankedLocale> = locales.into_iter().map(RankedLocale::new).collect();

        let Some(user) = user else {
            self.commit(generation, sort_locales(items, None));
            return;
        };
        let origin = Some(LatLon::from(user));

        for item in &mut items {
            item.distance_pending = true;
            self.attach_straight_line(item, origin);
        }
        items = sort_locales(items, Some(user));
        if !self.commit(generation, items.clone()) {
            return;
        }

        let missing: Vec<Locale> = items
            .iter()
            .filter(|i| i.coordinate.is_none())
            .map(|i| i.locale.clone())
            .collect();
        let resolver = &self.resolver;
        for chunk in missing.chunks(self.batch_size) {
            let resolved = join_all(chunk.iter().map(|locale| async move {
                (locale.id.clone(), resolver.resolve(locale).await.coordinate())
            }))
            .await;
            if abort.is_aborted() {
                return;
            }
            for (id, coordinate) in resolved {
                let Some(item) = items.iter_mut().find(|i| i.id() == &id) else {
                    continue;
                };
                match coordinate {
                    Some(coordinate) => {
                        item.coordinate = Some(coordinate);
                        self.attach_straight_line(item, origin);
                    }
                    None => item.distance_pending = false,
                }
            }
            items = sort_locales(items, Some(user));
            if !self.commit(generation, items.clone()) {
                return;
            }
        }

        let targets: Vec<(LocaleId, LatLon)> = items
            .iter()
            .filter_map(|i| i.coordinate.map(|c| (i.id().clone(), LatLon::from(c))))
            .collect();
        let run = self
            .distances
            .travel_distances_in_batches(user, targets, &abort, |batch| {
                for (id, measurement) in batch {
                    let Some(item) = items.iter_mut().find(|i| i.id() == &id) else {
                        continue;
                    };
                    item.distance_pending = false;
                    match measurement {
                        Some(m) => {
                            item.distance_km = Some(m.km);
                            item.distance_source = Some(m.source);
                        }
                        None => item.clear_distance(),
                    }
                }
                items = sort_locales(std::mem::take(&mut items), Some(user));
                self.commit(generation, items.clone());
            })
            .await;

        if let BatchRun::Aborted { batches } = run {
            debug!(generation, batches, "enrichment superseded");
            return;
        }
        for item in &mut items {
            item.distance_pending = false;
        }
        if self.commit(generation, items) {
            info!(generation, "enrichment complete");
        }
    }

    fn attach_straight_line(&self, item: &mut RankedLocale, origin: Option<LatLon>) {
        let destination = item.coordinate.map(LatLon::from);
        match self.distances.straight_line(origin, destination) {
            Some(km) => {
                item.distance_km = Some(km);
                item.distance_source = Some(DistanceSource::StraightLine);
            }
            None => item.clear_distance(),
        }
    }

    /// Stores `items` if `generation` is still current, then publishes.
    fn commit(&self, generation: u64, items: Vec<RankedLocale>) -> bool {
        {
            let mut ranked = self.lock_ranked();
            if ranked.generation != generation {
                return false;
            }
            ranked.items = items;
        }
        self.publish();
        true
    }

    fn publish(&self) {
        let ranked = self.lock_ranked();
        let snapshot = self.coordinator.snapshot();
        let user = self.user_location();
        let view = build_view(&ranked, snapshot, user);
        self.view_tx.send_replace(view);
    }
}

fn build_view(
    ranked: &RankedState,
    snapshot: ListSnapshot,
    user: Option<ValidatedCoordinate>,
) -> DiscoveryView {
    let radius = user.and(snapshot.filters.radius_km());
    let mut hidden_by_radius = 0;
    let items = ranked
        .items
        .iter()
        .filter(|item| match (radius, item.distance_km) {
            (Some(r), Some(d)) if d > r => {
                hidden_by_radius += 1;
                false
            }
            _ => true,
        })
        .map(|item| DiscoveryItem::from_ranked(item, ranked.saved.contains(item.id())))
        .collect();

    let searching = !snapshot.search_query.trim().is_empty();
    DiscoveryView {
        items,
        phase: snapshot.phase,
        page: snapshot.page,
        has_more: snapshot.has_more,
        error: snapshot.error.filter(|_| searching),
        notice: ranked.notice,
        search_query: snapshot.search_query,
        filters: snapshot.filters,
        location_known: user.is_some(),
        hidden_by_radius,
    }
}
