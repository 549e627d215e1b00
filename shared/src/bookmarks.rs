//! Saved locales, persisted as a single JSON list.
//!
//! Every mutation is a full read-modify-write of that list under one write
//! lock. A second call for an id whose previous call has not completed is
//! rejected rather than queued.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{load_json_or_default, store_json, KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::model::{Locale, LocaleId, RankedLocale};
use crate::sorter::sort_locales;

pub const BOOKMARKS_KEY: &str = "saved_locales";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BookmarkError {
    #[error("bookmark storage error: {0}")]
    Storage(#[from] KvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    AlreadySaved,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsaveOutcome {
    Removed,
    NotSaved,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Saved,
    Removed,
    InFlight,
}

pub struct BookmarkStore {
    store: Arc<dyn KeyValueStore>,
    key: KvKey,
    write_lock: tokio::sync::Mutex<()>,
    in_flight: Mutex<HashSet<LocaleId>>,
}

/// Releases the per-id claim when the mutation finishes, however it ends.
struct InFlightClaim<'a> {
    set: &'a Mutex<HashSet<LocaleId>>,
    id: LocaleId,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl BookmarkStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Result<Self, BookmarkError> {
        Ok(Self {
            store,
            key: KvKey::new(KeyNamespace::UserData, BOOKMARKS_KEY)?,
            write_lock: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    fn claim(&self, id: &LocaleId) -> Option<InFlightClaim<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(id.clone()) {
            return None;
        }
        Some(InFlightClaim {
            set: &self.in_flight,
            id: id.clone(),
        })
    }

    async fn read(&self) -> Result<Vec<Locale>, BookmarkError> {
        Ok(load_json_or_default(self.store.as_ref(), &self.key).await?)
    }

    async fn write(&self, list: Vec<Locale>) -> Result<(), BookmarkError> {
        let list = normalize(list);
        store_json(self.store.as_ref(), &self.key, &list).await?;
        Ok(())
    }

    #[instrument(skip(self, locale), fields(locale_id = %locale.id))]
    pub async fn save(&self, locale: &Locale) -> Result<SaveOutcome, BookmarkError> {
        let Some(_claim) = self.claim(&locale.id) else {
            debug!("save already in flight");
            return Ok(SaveOutcome::InFlight);
        };
        let _write = self.write_lock.lock().await;

        let mut list = self.read().await?;
        if list.iter().any(|l| l.id == locale.id) {
            info!("locale already saved");
            return Ok(SaveOutcome::AlreadySaved);
        }
        list.push(locale.clone());
        self.write(list).await?;
        info!("locale saved");
        Ok(SaveOutcome::Saved)
    }

    #[instrument(skip(self), fields(locale_id = %id))]
    pub async fn unsave(&self, id: &LocaleId) -> Result<UnsaveOutcome, BookmarkError> {
        let Some(_claim) = self.claim(id) else {
            debug!("unsave already in flight");
            return Ok(UnsaveOutcome::InFlight);
        };
        let _write = self.write_lock.lock().await;

        let mut list = self.read().await?;
        let before = list.len();
        list.retain(|l| &l.id != id);
        if list.len() == before {
            return Ok(UnsaveOutcome::NotSaved);
        }
        self.write(list).await?;
        info!("locale removed from saved");
        Ok(UnsaveOutcome::Removed)
    }

    #[instrument(skip(self, locale), fields(locale_id = %locale.id))]
    pub async fn toggle(&self, locale: &Locale) -> Result<ToggleOutcome, BookmarkError> {
        let Some(_claim) = self.claim(&locale.id) else {
            return Ok(ToggleOutcome::InFlight);
        };
        let _write = self.write_lock.lock().await;

        let mut list = self.read().await?;
        let before = list.len();
        list.retain(|l| l.id != locale.id);
        let outcome = if list.len() == before {
            list.push(locale.clone());
            ToggleOutcome::Saved
        } else {
            ToggleOutcome::Removed
        };
        self.write(list).await?;
        Ok(outcome)
    }

    /// Read failures count as "not saved".
    pub async fn is_saved(&self, id: &LocaleId) -> bool {
        match self.read().await {
            Ok(list) => list.iter().any(|l| &l.id == id),
            Err(e) => {
                warn!(error = %e, "could not read saved locales");
                false
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<Locale>, BookmarkError> {
        Ok(normalize(self.read().await?))
    }

    pub async fn saved_ids(&self) -> Result<HashSet<LocaleId>, BookmarkError> {
        Ok(self.read().await?.into_iter().map(|l| l.id).collect())
    }
}

/// Collapses duplicates by id (last write wins) and orders newest first.
fn normalize(list: Vec<Locale>) -> Vec<Locale> {
    let collapsed: HashMap<LocaleId, Locale> = list.into_iter().map(|l| (l.id.clone(), l)).collect();
    let ranked = collapsed.into_values().map(RankedLocale::new).collect();
    sort_locales(ranked, None)
        .into_iter()
        .map(|r| r.locale)
        .collect()
}
