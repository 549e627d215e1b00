//! Fetch cycles for the locale list.
//!
//! Each cycle moves `Idle -> Debouncing -> InFlight -> {Settled | Aborted | Failed}`.
//! Free-text input is debounced; every other trigger fetches immediately and
//! a dispatched fetch clears a pending debounce timer. Pagination waits while
//! typed input is pending. Before dispatch the [`FetchKey`] is
//! compared with the last issued one so identical effective queries are
//! skipped unless forced.
//!
//! Only one cycle runs at a time. A user-initiated trigger with a new key
//! (search, filter change, forced refresh) aborts the running cycle and takes
//! its place; pagination and focus triggers arriving mid-flight are no-ops.
//! A continuation whose cycle was aborted, superseded or unmounted leaves the
//! state untouched.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::filters::{FetchKey, FilterAction, FilterError, FilterState};
use crate::model::{Locale, LocaleId, LocalePage};
use crate::providers::{LocaleListProvider, LocaleQuery, ProviderError};

/// Cooperative cancellation token shared by one fetch cycle.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Debug, Default)]
struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        if !self.inner.aborted.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Completes once [`abort`](Self::abort) has been called.
    pub async fn aborted(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryPhase {
    #[default]
    Idle,
    Debouncing,
    InFlight,
    Settled,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchTrigger {
    Mount,
    SearchInput,
    FilterChange,
    PullToRefresh,
    Pagination,
    FocusRegained,
}

impl FetchTrigger {
    fn supersedes_in_flight(self) -> bool {
        matches!(
            self,
            FetchTrigger::SearchInput | FetchTrigger::FilterChange | FetchTrigger::PullToRefresh
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Duplicate,
    Busy,
    Unmounted,
    NoMorePages,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Settled { count: usize },
    Skipped(SkipReason),
    Aborted,
    Failed(ProviderError),
}

/// Published after every state change.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct ListSnapshot {
    pub locales: Vec<Locale>,
    pub phase: QueryPhase,
    pub page: u32,
    pub has_more: bool,
    pub error: Option<String>,
    pub search_query: String,
    pub filters: FilterState,
    /// Bumped whenever `locales` changes.
    pub list_revision: u64,
}

#[derive(Debug, Clone, Copy)]
enum FetchIntent {
    Reset { force: bool },
    NextPage,
}

#[derive(Debug)]
struct ActiveCycle {
    id: u64,
    key: FetchKey,
    abort: AbortSignal,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    search_query: String,
    /// Search text of the last dispatched page-1 cycle. Differs from
    /// `search_query` while typed input is waiting on the debounce timer.
    committed_query: String,
    filters: FilterState,
    page: u32,
    has_more: bool,
    locales: Vec<Locale>,
    phase: QueryPhase,
    resting_phase: QueryPhase,
    error: Option<String>,
    last_key: Option<FetchKey>,
    active: Option<ActiveCycle>,
    cycle_seq: u64,
    list_revision: u64,
}

impl CoordinatorState {
    fn snapshot(&self) -> ListSnapshot {
        ListSnapshot {
            locales: self.locales.clone(),
            phase: self.phase,
            page: self.page,
            has_more: self.has_more,
            error: self.error.clone(),
            search_query: self.search_query.clone(),
            filters: self.filters.clone(),
            list_revision: self.list_revision,
        }
    }

    fn input_pending(&self) -> bool {
        self.search_query != self.committed_query
    }

    fn settle(&mut self, phase: QueryPhase) {
        self.resting_phase = phase;
        self.phase = if self.input_pending() {
            QueryPhase::Debouncing
        } else {
            phase
        };
    }

    fn replace_locales(&mut self, locales: Vec<Locale>) {
        self.locales = dedup_by_id(locales);
        self.list_revision += 1;
    }

    /// Merges a further page, keyed by id. Repeats update in place.
    fn merge_page(&mut self, locales: Vec<Locale>) {
        let mut index: HashMap<LocaleId, usize> = self
            .locales
            .iter()
            .enumerate()
            .map(|(i, l)| (l.id.clone(), i))
            .collect();
        for locale in locales {
            match index.get(&locale.id) {
                Some(&i) => self.locales[i] = locale,
                None => {
                    index.insert(locale.id.clone(), self.locales.len());
                    self.locales.push(locale);
                }
            }
        }
        self.list_revision += 1;
    }

    fn clear_locales(&mut self) {
        if !self.locales.is_empty() {
            self.locales.clear();
            self.list_revision += 1;
        }
        self.has_more = false;
    }
}

fn dedup_by_id(locales: Vec<Locale>) -> Vec<Locale> {
    let mut seen = std::collections::HashSet::new();
    locales
        .into_iter()
        .filter(|l| seen.insert(l.id.clone()))
        .collect()
}

pub struct RequestCoordinator {
    provider: Arc<dyn LocaleListProvider>,
    page_size: u32,
    include_inactive: bool,
    debounce: Duration,
    state: Mutex<CoordinatorState>,
    snapshot_tx: watch::Sender<ListSnapshot>,
    mounted: AtomicBool,
    debounce_generation: AtomicU64,
}

impl RequestCoordinator {
    pub fn new(provider: Arc<dyn LocaleListProvider>, config: &EngineConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(ListSnapshot::default());
        Self {
            provider,
            page_size: config.page_size,
            include_inactive: config.include_inactive,
            debounce: config.debounce(),
            state: Mutex::new(CoordinatorState::default()),
            snapshot_tx,
            mounted: AtomicBool::new(false),
            debounce_generation: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ListSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> ListSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    pub async fn filters(&self) -> FilterState {
        self.state.lock().await.filters.clone()
    }

    #[instrument(skip(self))]
    pub async fn mount(&self) -> FetchOutcome {
        self.mounted.store(true, Ordering::SeqCst);
        self.run_cycle(FetchTrigger::Mount, FetchIntent::Reset { force: false })
            .await
    }

    /// Discards pending timers and in-flight work. Late continuations are
    /// ignored.
    #[instrument(skip(self))]
    pub async fn unmount(&self) {
        self.mounted.store(false, Ordering::SeqCst);
        self.debounce_generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(active) = state.active.take() {
            active.abort.abort();
            state.last_key = None;
        }
        if matches!(state.phase, QueryPhase::Debouncing | QueryPhase::InFlight) {
            state.phase = state.resting_phase;
            self.publish(&state);
        }
    }

    /// Records the new text and (re)starts the debounce timer. The fetch runs
    /// on a spawned task once input pauses.
    pub async fn search_text_changed(self: &Arc<Self>, text: impl Into<String>) {
        let generation = self.debounce_generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.lock().await;
            state.search_query = text.into();
            state.phase = QueryPhase::Debouncing;
            self.publish(&state);
        }

        let this = Arc::clone(self);
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if this.debounce_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let outcome = this
                .run_cycle(FetchTrigger::SearchInput, FetchIntent::Reset { force: false })
                .await;
            debug!(?outcome, "debounced search settled");
        });
    }

    /// Applies a filter action and fetches page 1 for the new filters.
    /// A rejected action changes nothing and fetches nothing.
    #[instrument(skip(self))]
    pub async fn dispatch_filter(&self, action: FilterAction) -> Result<FetchOutcome, FilterError> {
        {
            let mut state = self.state.lock().await;
            let next = state.filters.apply(action)?;
            if next == state.filters {
                return Ok(FetchOutcome::Skipped(SkipReason::Duplicate));
            }
            state.filters = next;
            self.publish(&state);
        }
        Ok(self
            .run_cycle(FetchTrigger::FilterChange, FetchIntent::Reset { force: false })
            .await)
    }

    #[instrument(skip(self))]
    pub async fn pull_to_refresh(&self) -> FetchOutcome {
        self.run_cycle(FetchTrigger::PullToRefresh, FetchIntent::Reset { force: true })
            .await
    }

    #[instrument(skip(self))]
    pub async fn load_more(&self) -> FetchOutcome {
        self.run_cycle(FetchTrigger::Pagination, FetchIntent::NextPage)
            .await
    }

    #[instrument(skip(self))]
    pub async fn focus_regained(&self) -> FetchOutcome {
        self.run_cycle(FetchTrigger::FocusRegained, FetchIntent::Reset { force: false })
            .await
    }

    fn publish(&self, state: &CoordinatorState) {
        self.snapshot_tx.send_replace(state.snapshot());
    }

    async fn run_cycle(&self, trigger: FetchTrigger, intent: FetchIntent) -> FetchOutcome {
        if !self.is_mounted() {
            return FetchOutcome::Skipped(SkipReason::Unmounted);
        }
        let (cycle_id, query, abort, searching) = {
            let mut state = self.state.lock().await;

            let (page, force) = match intent {
                FetchIntent::Reset { force } => (1, force),
                FetchIntent::NextPage => {
                    if state.input_pending() {
                        debug!("search input pending, pagination ignored");
                        return FetchOutcome::Skipped(SkipReason::Busy);
                    }
                    if !state.has_more {
                        return FetchOutcome::Skipped(SkipReason::NoMorePages);
                    }
                    (state.page.saturating_add(1), false)
                }
            };
            let search_text = match intent {
                FetchIntent::Reset { .. } => state.search_query.clone(),
                FetchIntent::NextPage => state.committed_query.clone(),
            };
            let key = FetchKey::new(&search_text, &state.filters, page);

            if !force && state.last_key.as_ref() == Some(&key) {
                debug!(%key, ?trigger, "duplicate fetch skipped");
                if trigger == FetchTrigger::SearchInput && state.phase == QueryPhase::Debouncing {
                    state.phase = if state.active.is_some() {
                        QueryPhase::InFlight
                    } else {
                        state.resting_phase
                    };
                    self.publish(&state);
                }
                return FetchOutcome::Skipped(SkipReason::Duplicate);
            }

            if let Some(active) = &state.active {
                if !(trigger.supersedes_in_flight() && (force || active.key != key)) {
                    debug!(?trigger, "fetch already in flight, ignoring trigger");
                    return FetchOutcome::Skipped(SkipReason::Busy);
                }
                debug!(superseded = active.id, "aborting in-flight fetch");
                active.abort.abort();
            }

            if trigger != FetchTrigger::SearchInput {
                self.debounce_generation.fetch_add(1, Ordering::SeqCst);
            }
            state.cycle_seq += 1;
            let cycle_id = state.cycle_seq;
            let abort = AbortSignal::new();
            state.active = Some(ActiveCycle {
                id: cycle_id,
                key: key.clone(),
                abort: abort.clone(),
            });
            state.last_key = Some(key);
            state.committed_query = search_text;
            state.phase = QueryPhase::InFlight;
            state.error = None;
            self.publish(&state);

            let query = LocaleQuery {
                search_text: state.committed_query.trim().to_string(),
                country_code: state.filters.country_code.clone(),
                state_code: state.filters.state_code.clone(),
                spot_types: state.filters.spot_types.iter().cloned().collect(),
                page,
                page_size: self.page_size,
                include_inactive: self.include_inactive,
            };
            let searching = !query.search_text.is_empty();
            (cycle_id, query, abort, searching)
        };

        debug!(cycle_id, ?trigger, page = query.page, "fetch dispatched");
        let result = tokio::select! {
            result = self.provider.list(&query, &abort) => Some(result),
            () = abort.aborted() => None,
        };

        let mut state = self.state.lock().await;
        let still_current = state.active.as_ref().is_some_and(|a| a.id == cycle_id);
        if !still_current || abort.is_aborted() || !self.is_mounted() {
            debug!(cycle_id, "stale fetch result discarded");
            if still_current {
                state.active = None;
                state.last_key = None;
                state.phase = QueryPhase::Aborted;
                self.publish(&state);
            }
            return FetchOutcome::Aborted;
        }
        state.active = None;

        match result {
            Some(Ok(page)) => self.apply_page(&mut state, query.page, page, searching, intent),
            Some(Err(error)) => {
                warn!(cycle_id, error = %error, "locale fetch failed");
                state.last_key = None;
                if searching {
                    state.clear_locales();
                }
                state.error = Some(error.to_string());
                state.settle(QueryPhase::Failed);
                self.publish(&state);
                FetchOutcome::Failed(error)
            }
            None => FetchOutcome::Aborted,
        }
    }

    fn apply_page(
        &self,
        state: &mut CoordinatorState,
        page_number: u32,
        page: LocalePage,
        searching: bool,
        intent: FetchIntent,
    ) -> FetchOutcome {
        let count = page.locales.len();
        match intent {
            FetchIntent::NextPage => state.merge_page(page.locales),
            FetchIntent::Reset { .. } if count == 0 && !searching => {
                debug!("empty background refresh, keeping existing results");
            }
            FetchIntent::Reset { .. } => state.replace_locales(page.locales),
        }
        state.page = page_number;
        state.has_more = page.pagination.has_next;
        state.settle(QueryPhase::Settled);
        self.publish(state);
        info!(count, page = page_number, total = state.locales.len(), "fetch settled");
        FetchOutcome::Settled { count }
    }
}
