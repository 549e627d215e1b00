//! Locale discovery core: coordinate resolution, distance ranking and the
//! request lifecycle behind a searchable, filterable list of locales.
//!
//! Everything platform-specific (storage, HTTP, device location) comes in
//! through the traits in [`capabilities`]; the shell wires real
//! implementations, tests wire in-memory ones.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod bookmarks;
pub mod capabilities;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod distance;
pub mod filters;
pub mod model;
pub mod providers;
pub mod resolver;
pub mod sorter;

pub use bookmarks::{BookmarkError, BookmarkStore, SaveOutcome, ToggleOutcome, UnsaveOutcome};
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{
    AbortSignal, FetchOutcome, FetchTrigger, ListSnapshot, QueryPhase, RequestCoordinator,
    SkipReason,
};
pub use discovery::{
    BookmarkNotice, DiscoveryDeps, DiscoveryEngine, DiscoveryItem, DiscoveryView, SharedCaches,
};
pub use distance::{haversine_km, straight_line_km, BatchRun, DistanceEngine, Measurement};
pub use filters::{FetchKey, FilterAction, FilterError, FilterState};
pub use model::{
    format_distance_km, CoordinateError, DistanceSource, LatLon, Locale, LocaleId, LocalePage,
    Pagination, RankedLocale, UnixTimeMs, ValidatedCoordinate,
};
pub use providers::{
    Geocoder, LocaleListProvider, LocaleQuery, PlacesSearch, ProviderError,
    TravelDistanceProvider,
};
pub use resolver::{CoordinateCache, CoordinateResolver, ResolveOutcome, ResolveSource};
pub use sorter::sort_locales;
