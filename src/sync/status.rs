//! Observable state published by the sync orchestrators.
//!
//! Presentation code holds a `watch::Receiver` of one of these snapshots and
//! re-renders whenever it changes:
//!
//! ```ignore
//! let mut rx = episodes.subscribe();
//! while rx.changed().await.is_ok() {
//!     let state = rx.borrow();
//!     match &state.status {
//!         LoadStatus::Loading => render_spinner(),
//!         LoadStatus::Loaded => render_list(&state.items),
//!         LoadStatus::Failed(e) => render_error(e),
//!         LoadStatus::Idle => {}
//!     }
//! }
//! ```

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::SyncError;

/// The load status of a collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoadStatus {
  /// Nothing requested yet
  #[default]
  Idle,
  /// A load is running
  Loading,
  /// Data is available (possibly served from cache)
  Loaded,
  /// The load failed and there is nothing to show
  Failed(SyncError),
}

impl LoadStatus {
  pub fn is_idle(&self) -> bool {
    matches!(self, LoadStatus::Idle)
  }

  pub fn is_loading(&self) -> bool {
    matches!(self, LoadStatus::Loading)
  }

  pub fn is_loaded(&self) -> bool {
    matches!(self, LoadStatus::Loaded)
  }

  pub fn is_failed(&self) -> bool {
    matches!(self, LoadStatus::Failed(_))
  }

  pub fn error(&self) -> Option<&SyncError> {
    match self {
      LoadStatus::Failed(e) => Some(e),
      _ => None,
    }
  }
}

/// Snapshot of a paginated, ordered collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionState<T> {
  pub status: LoadStatus,
  /// Ascending by id, no duplicates
  pub items: Vec<T>,
  /// A next-page load is running
  pub loading_more: bool,
  pub has_more: bool,
  pub current_page: u32,
  pub total_count: u32,
  pub last_fetched_at: Option<DateTime<Utc>>,
  /// Non-fatal error shown next to data that is still usable
  pub notice: Option<SyncError>,
}

impl<T> Default for CollectionState<T> {
  fn default() -> Self {
    Self {
      status: LoadStatus::Idle,
      items: Vec::new(),
      loading_more: false,
      has_more: false,
      current_page: 1,
      total_count: 0,
      last_fetched_at: None,
      notice: None,
    }
  }
}

/// Snapshot of an id-keyed entity set.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMapState<T> {
  pub status: LoadStatus,
  pub entities: BTreeMap<u32, T>,
  /// Ids with a fetch running
  pub loading: BTreeSet<u32>,
  pub notice: Option<SyncError>,
}

impl<T> Default for EntityMapState<T> {
  fn default() -> Self {
    Self {
      status: LoadStatus::Idle,
      entities: BTreeMap::new(),
      loading: BTreeSet::new(),
      notice: None,
    }
  }
}
