//! Episode collection sync.
//!
//! The episode list is paginated remotely and grows locally one page at a
//! time. A load decides between three paths:
//!
//! 1. Cache populated and fresh: publish it, no network
//! 2. Cache stale or empty: fetch page 1 and replace the collection with it
//! 3. Fetch failed but a cache exists: publish the stale cache with a notice
//!
//! Every page commit (rows plus pagination metadata) is a single storage
//! transaction made under the tracker lock, so a reset can never interleave
//! with a half-applied page.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{
  CacheSource, CacheStorage, Clock, Page, PaginationTracker, SingleFlight, StalenessPolicy,
  SyncMetadata, WriteBatch,
};
use crate::error::{Result, SyncError};
use crate::rickmorty::cache::SyncKey;
use crate::rickmorty::client::RemoteFetcher;
use crate::rickmorty::types::Episode;

use super::status::{CollectionState, LoadStatus};
use super::SyncOptions;

pub type EpisodesState = CollectionState<Episode>;

/// What a next-page request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLoad {
  /// The page was fetched and committed
  Committed { page: u32, count: usize },
  /// The remote has no further pages
  Exhausted,
  /// That page was already being fetched; nothing new was started
  AlreadyInFlight(u32),
  /// The collection was reset while the page was in flight
  Discarded(u32),
}

/// Keeps the cached episode collection in step with the remote one.
pub struct EpisodeSync<S, F> {
  inner: Arc<Inner<S, F>>,
}

impl<S, F> Clone for EpisodeSync<S, F> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

struct Inner<S, F> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  policy: StalenessPolicy,
  clock: Arc<dyn Clock>,
  state: watch::Sender<EpisodesState>,
  /// Serializes commits and resets
  tracker: Mutex<PaginationTracker>,
  /// Bumped by every reset; pages fetched under an older value are dropped
  generation: AtomicU64,
  flights: SingleFlight<(u64, u32), PageLoad>,
}

impl<S, F> EpisodeSync<S, F>
where
  S: CacheStorage + 'static,
  F: RemoteFetcher,
{
  /// Build the orchestrator and seed its state from whatever is persisted.
  ///
  /// Nothing is fetched here; the published status stays `Idle` until the
  /// first load.
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, options: SyncOptions) -> Result<Self> {
    let episodes = storage.fetch_all_sorted::<Episode>()?;
    let metadata = storage
      .get_metadata(&SyncKey::Episodes.metadata_key())?
      .unwrap_or_default();
    let tracker = PaginationTracker::from_metadata(options.page_size, &metadata);

    debug!(
      cached = episodes.len(),
      page = tracker.current_page(),
      "episode sync ready"
    );

    let initial = EpisodesState {
      items: episodes,
      has_more: tracker.has_more(),
      current_page: tracker.current_page(),
      total_count: tracker.remote_total_count(),
      last_fetched_at: metadata.last_fetched_at,
      ..EpisodesState::default()
    };
    let (state, _) = watch::channel(initial);

    Ok(Self {
      inner: Arc::new(Inner {
        storage,
        fetcher,
        policy: options.policy,
        clock: options.clock,
        state,
        tracker: Mutex::new(tracker),
        generation: AtomicU64::new(0),
        flights: SingleFlight::new(),
      }),
    })
  }

  /// Current snapshot.
  pub fn state(&self) -> EpisodesState {
    self.inner.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<EpisodesState> {
    self.inner.state.subscribe()
  }

  /// Load the collection, going to the network only when the cache is empty
  /// or stale (or always, with `force_refresh`).
  ///
  /// A recoverable failure with cached data on hand is not an error: the
  /// cache is published with a notice and `Offline` is returned.
  pub async fn load_collection(&self, force_refresh: bool) -> Result<CacheSource> {
    let inner = &self.inner;
    inner.publish(|s| s.status = LoadStatus::Loading);

    if force_refresh {
      info!("forced episode refresh, dropping cached episodes");
      if let Err(e) = inner.reset(LoadStatus::Loading).await {
        return Err(inner.fail(e));
      }
    }

    let (cached, metadata) = match inner.read_cache() {
      Ok(snapshot) => snapshot,
      Err(e) => return Err(inner.fail(e)),
    };

    let now = inner.clock.now();
    if !cached.is_empty() && !inner.policy.is_stale(metadata.last_fetched_at, now) {
      debug!(count = cached.len(), "serving fresh episodes from cache");
      inner.publish_cached(cached, metadata.last_fetched_at, None).await;
      return Ok(CacheSource::CacheFresh);
    }

    let generation = inner.generation.load(Ordering::SeqCst);
    match Arc::clone(inner).run_page(generation, 1, false).await {
      Ok(_) => Ok(CacheSource::Network),
      Err(e) if e.is_recoverable() && !cached.is_empty() => {
        warn!(error = %e, count = cached.len(), "episode refresh failed, serving stale cache");
        inner
          .publish_cached(cached, metadata.last_fetched_at, Some(e))
          .await;
        Ok(CacheSource::Offline)
      }
      Err(e) => Err(inner.fail(e)),
    }
  }

  /// Drop the cached collection and reload page 1 from the network.
  pub async fn force_refresh(&self) -> Result<CacheSource> {
    self.load_collection(true).await
  }

  /// Fetch and append the next page.
  ///
  /// Returns without a network call when the remote is exhausted or the same
  /// page is already being fetched. A network failure leaves the published
  /// collection and status as they were and sets the notice.
  pub async fn load_next_page(&self) -> Result<PageLoad> {
    let inner = &self.inner;
    let (generation, next) = {
      let tracker = inner.tracker.lock().await;
      let loaded = inner.state.borrow().items.len();
      (inner.generation.load(Ordering::SeqCst), tracker.next_page(loaded))
    };

    let Some(page) = next else {
      debug!("no more episode pages");
      return Ok(PageLoad::Exhausted);
    };
    if inner.flights.is_in_flight(&(generation, page)) {
      debug!(page, "episode page already loading");
      return Ok(PageLoad::AlreadyInFlight(page));
    }

    match Arc::clone(inner).run_page(generation, page, true).await {
      Ok(load) => Ok(load),
      Err(e) if e.is_recoverable() => {
        warn!(page, error = %e, "failed to load episode page");
        inner.publish(|s| s.notice = Some(e.clone()));
        Err(e)
      }
      Err(e) => Err(inner.fail(e)),
    }
  }

  /// Delete cached episodes and their bookkeeping; state returns to `Idle`.
  pub async fn clear(&self) -> Result<()> {
    self.inner.reset(LoadStatus::Idle).await?;
    info!("episode cache cleared");
    Ok(())
  }

  /// Whole days since the last successful fetch, if there was one.
  pub fn days_since_last_fetch(&self) -> Option<i64> {
    let last = self.inner.state.borrow().last_fetched_at?;
    Some((self.inner.clock.now() - last).num_days())
  }

  /// True once data exists and has aged past the max age.
  pub fn should_show_refresh_hint(&self) -> bool {
    let last = self.inner.state.borrow().last_fetched_at;
    last.is_some() && self.inner.policy.is_stale(last, self.inner.clock.now())
  }
}

impl<S, F> Inner<S, F>
where
  S: CacheStorage + 'static,
  F: RemoteFetcher,
{
  fn publish(&self, modify: impl FnOnce(&mut EpisodesState)) {
    self.state.send_modify(modify);
  }

  fn fail(&self, error: SyncError) -> SyncError {
    warn!(error = %error, "episode load failed");
    let status = LoadStatus::Failed(error.clone());
    self.publish(|s| s.status = status);
    error
  }

  fn read_cache(&self) -> Result<(Vec<Episode>, SyncMetadata)> {
    let episodes = self.storage.fetch_all_sorted::<Episode>()?;
    let metadata = self
      .storage
      .get_metadata(&SyncKey::Episodes.metadata_key())?
      .unwrap_or_default();
    Ok((episodes, metadata))
  }

  /// Publish persisted episodes as the loaded collection.
  async fn publish_cached(
    &self,
    episodes: Vec<Episode>,
    last_fetched_at: Option<DateTime<Utc>>,
    notice: Option<SyncError>,
  ) {
    let tracker = self.tracker.lock().await;
    self.publish(|s| {
      s.status = LoadStatus::Loaded;
      s.items = episodes;
      s.has_more = tracker.has_more();
      s.current_page = tracker.current_page();
      s.total_count = tracker.remote_total_count();
      s.last_fetched_at = last_fetched_at;
      s.notice = notice;
    });
  }

  async fn reset(&self, status: LoadStatus) -> Result<()> {
    let mut tracker = self.tracker.lock().await;
    self.generation.fetch_add(1, Ordering::SeqCst);

    let key = SyncKey::Episodes.metadata_key();
    self.storage.write_batch::<Episode>(WriteBatch::reset(&key))?;
    tracker.reset();

    self.publish(|s| {
      *s = EpisodesState {
        status,
        ..EpisodesState::default()
      }
    });
    Ok(())
  }

  /// Fetch `page` once per generation, however many callers ask for it.
  ///
  /// With `loading_more` the flight flags the published state while it runs.
  async fn run_page(
    self: Arc<Self>,
    generation: u64,
    page: u32,
    loading_more: bool,
  ) -> Result<PageLoad> {
    let this = Arc::clone(&self);
    self
      .flights
      .run((generation, page), move || {
        if loading_more {
          this.publish(|s| s.loading_more = true);
        }
        this.complete_page(generation, page)
      })
      .await
  }

  /// Flight body. Runs to the end even if every caller has gone away, so
  /// it settles the flags a caller would otherwise leave behind.
  async fn complete_page(self: Arc<Self>, generation: u64, page: u32) -> Result<PageLoad> {
    let result = self.fetch_and_commit(generation, page).await;
    self.publish(|s| {
      s.loading_more = false;
      if let Err(e) = &result {
        if s.status.is_loading() {
          s.status = if e.is_recoverable() && !s.items.is_empty() {
            LoadStatus::Loaded
          } else {
            LoadStatus::Failed(e.clone())
          };
          s.notice = Some(e.clone());
        }
      }
    });
    result
  }

  async fn fetch_and_commit(&self, generation: u64, page: u32) -> Result<PageLoad> {
    debug!(page, "fetching episode page");
    let Page { records, info } = self.fetcher.fetch_episode_page(page).await?;

    let mut tracker = self.tracker.lock().await;
    if self.generation.load(Ordering::SeqCst) != generation || !tracker.accepts(page) {
      debug!(page, "dropping episode page fetched before a reset");
      return Ok(PageLoad::Discarded(page));
    }

    let now = self.clock.now();
    let mut next = tracker.clone();
    next.apply(&info);

    // Page 1 starts the collection over: rows from an older listing go with it
    let mut batch = WriteBatch::upsert(&records)
      .with_metadata(SyncKey::Episodes.metadata_key(), next.to_metadata(now));
    if page == 1 {
      batch = batch.replacing();
    }
    self.storage.write_batch(batch)?;
    *tracker = next;

    let count = records.len();
    let (has_more, current_page, total_count) = (
      tracker.has_more(),
      tracker.current_page(),
      tracker.remote_total_count(),
    );
    self.publish(|s| {
      if page == 1 {
        s.items.clear();
      }
      merge_by_id(&mut s.items, records);
      s.status = LoadStatus::Loaded;
      s.has_more = has_more;
      s.current_page = current_page;
      s.total_count = total_count;
      s.last_fetched_at = Some(now);
      s.notice = None;
    });

    info!(page, count, total = total_count, has_more, "committed episode page");
    Ok(PageLoad::Committed { page, count })
  }
}

/// Insert or replace by id, keeping `items` ascending.
fn merge_by_id(items: &mut Vec<Episode>, incoming: Vec<Episode>) {
  for episode in incoming {
    match items.binary_search_by_key(&episode.id, |e| e.id) {
      Ok(i) => items[i] = episode,
      Err(i) => items.insert(i, episode),
    }
  }
}
