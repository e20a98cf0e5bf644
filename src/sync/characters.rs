//! Character sync: individually keyed entities fetched on demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::cache::{
  CacheSource, CacheStorage, Clock, SingleFlight, StalenessPolicy, SyncMetadata, WriteBatch,
};
use crate::error::{Result, SyncError};
use crate::rickmorty::cache::SyncKey;
use crate::rickmorty::client::RemoteFetcher;
use crate::rickmorty::types::Character;

use super::status::{EntityMapState, LoadStatus};
use super::SyncOptions;

pub type CharactersState = EntityMapState<Character>;

/// Per-id outcome of [`CharacterSync::load_entities`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchLoad {
  /// Fetched from the remote by this call
  pub fetched: Vec<u32>,
  /// Already held and fresh; not requested
  pub fresh: Vec<u32>,
  /// Being fetched by another caller; not requested again
  pub skipped: Vec<u32>,
  /// Served from the persisted cache after the remote failed or omitted them
  pub from_cache: Vec<u32>,
  /// Neither the remote nor the cache had them
  pub missing: Vec<u32>,
}

impl BatchLoad {
  /// Ids that ended up with usable data.
  pub fn available(&self) -> usize {
    self.fetched.len() + self.fresh.len() + self.from_cache.len()
  }
}

/// Keeps cached characters in step with the remote, one id at a time or in
/// batches.
pub struct CharacterSync<S, F> {
  inner: Arc<Inner<S, F>>,
}

impl<S, F> Clone for CharacterSync<S, F> {
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
  state: watch::Sender<CharactersState>,
  commit_lock: Mutex<()>,
  generation: AtomicU64,
  flights: SingleFlight<u32, Vec<Character>>,
}

impl<S, F> CharacterSync<S, F>
where
  S: CacheStorage + 'static,
  F: RemoteFetcher,
{
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, options: SyncOptions) -> Result<Self> {
    let characters = storage.fetch_all_sorted::<Character>()?;
    debug!(cached = characters.len(), "character sync ready");

    let initial = CharactersState {
      entities: characters.into_iter().map(|c| (c.id, c)).collect(),
      ..CharactersState::default()
    };
    let (state, _) = watch::channel(initial);

    Ok(Self {
      inner: Arc::new(Inner {
        storage,
        fetcher,
        policy: options.policy,
        clock: options.clock,
        state,
        commit_lock: Mutex::new(()),
        generation: AtomicU64::new(0),
        flights: SingleFlight::new(),
      }),
    })
  }

  pub fn state(&self) -> CharactersState {
    self.inner.state.borrow().clone()
  }

  pub fn subscribe(&self) -> watch::Receiver<CharactersState> {
    self.inner.state.subscribe()
  }

  pub fn character(&self, id: u32) -> Option<Character> {
    self.inner.state.borrow().entities.get(&id).cloned()
  }

  /// Held characters for `ids`, in the order given. Unknown ids are left out.
  pub fn characters_for(&self, ids: &[u32]) -> Vec<Character> {
    let state = self.inner.state.borrow();
    ids
      .iter()
      .filter_map(|id| state.entities.get(id).cloned())
      .collect()
  }

  pub fn is_loading(&self, id: u32) -> bool {
    self.inner.state.borrow().loading.contains(&id)
  }

  /// Make sure `id` is held, fetching it unless a fresh copy exists.
  ///
  /// Concurrent calls for the same id share one fetch. When the fetch fails
  /// the persisted copy, if any, is served instead.
  pub async fn load_entity(&self, id: u32) -> Result<CacheSource> {
    let inner = &self.inner;
    match inner.is_fresh(id) {
      Ok(true) => {
        debug!(id, "character is fresh");
        return Ok(CacheSource::CacheFresh);
      }
      Ok(false) => {}
      Err(e) => return Err(inner.fail(e)),
    }

    let generation = inner.generation.load(Ordering::SeqCst);
    let this = Arc::clone(inner);
    let result = inner
      .flights
      .run(id, move || {
        this.mark_loading(&[id]);
        this.fetch_one(generation, id)
      })
      .await;

    let error = match result {
      Ok(characters) if characters.iter().any(|c| c.id == id) => {
        inner.settle(None);
        return Ok(CacheSource::Network);
      }
      // Committed after a clear; nothing of it was kept
      Ok(_) => SyncError::NotFound(format!("character {}", id)),
      Err(e) if e.is_recoverable() => e,
      Err(e) => return Err(inner.fail(e)),
    };

    match inner.storage.fetch_by_id::<Character>(id) {
      Ok(Some(character)) => {
        warn!(id, error = %error, "character fetch failed, serving cached copy");
        inner.state.send_modify(|s| {
          s.entities.insert(id, character);
        });
        inner.settle(Some(error));
        Ok(CacheSource::Offline)
      }
      Ok(None) => Err(inner.fail(error)),
      Err(e) => Err(inner.fail(e)),
    }
  }

  /// Load several characters with at most one remote request.
  ///
  /// Duplicates are collapsed; ids already fresh or already being fetched
  /// are not requested. Ids the remote omits, or all of them when the
  /// request fails, fall back to persisted copies.
  pub async fn load_entities(&self, ids: &[u32]) -> Result<BatchLoad> {
    let inner = &self.inner;
    let mut outcome = BatchLoad::default();

    let mut wanted = Vec::new();
    for &id in ids {
      if wanted.contains(&id) || outcome.fresh.contains(&id) {
        continue;
      }
      match inner.is_fresh(id) {
        Ok(true) => outcome.fresh.push(id),
        Ok(false) => wanted.push(id),
        Err(e) => return Err(inner.fail(e)),
      }
    }

    if wanted.is_empty() {
      debug!(count = outcome.fresh.len(), "all requested characters are fresh");
      inner.settle(None);
      return Ok(outcome);
    }

    let generation = inner.generation.load(Ordering::SeqCst);
    let this = Arc::clone(inner);
    let batch = inner
      .flights
      .run_batch(wanted, move |claimed| {
        this.mark_loading(&claimed);
        Arc::clone(&this).fetch_many(generation, claimed)
      })
      .await;
    let batch = match batch {
      Ok(batch) => batch,
      Err(e) => return Err(inner.fail(e)),
    };

    outcome.skipped = batch.skipped;
    let Some(result) = batch.result else {
      debug!(skipped = ?outcome.skipped, "requested characters are already loading");
      return Ok(outcome);
    };

    let mut leftovers = Vec::new();
    let error = match result {
      Ok(characters) => {
        for id in batch.claimed {
          if characters.iter().any(|c| c.id == id) {
            outcome.fetched.push(id);
          } else {
            leftovers.push(id);
          }
        }
        None
      }
      Err(e) if e.is_recoverable() => {
        warn!(error = %e, count = batch.claimed.len(), "character batch failed");
        leftovers = batch.claimed;
        Some(e)
      }
      Err(e) => return Err(inner.fail(e)),
    };

    for id in leftovers {
      match inner.storage.fetch_by_id::<Character>(id) {
        Ok(Some(character)) => {
          inner.state.send_modify(|s| {
            s.entities.insert(id, character);
          });
          outcome.from_cache.push(id);
        }
        Ok(None) => outcome.missing.push(id),
        Err(e) => return Err(inner.fail(e)),
      }
    }

    match error {
      Some(e) if outcome.available() == 0 => Err(inner.fail(e)),
      error => {
        let notice = error.or_else(|| {
          (!outcome.missing.is_empty())
            .then(|| SyncError::NotFound(format!("characters {:?}", outcome.missing)))
        });
        inner.settle(notice);
        Ok(outcome)
      }
    }
  }

  /// Delete every cached character and its bookkeeping.
  pub async fn clear(&self) -> Result<()> {
    let inner = &self.inner;
    let _guard = inner.commit_lock.lock().await;
    inner.generation.fetch_add(1, Ordering::SeqCst);

    let prefix = SyncKey::Characters.metadata_key();
    inner
      .storage
      .write_batch::<Character>(WriteBatch::reset(&prefix))?;
    inner.state.send_modify(|s| *s = CharactersState::default());

    info!("character cache cleared");
    Ok(())
  }
}

impl<S, F> Inner<S, F>
where
  S: CacheStorage + 'static,
  F: RemoteFetcher,
{
  /// Held in memory and fetched within the max age.
  fn is_fresh(&self, id: u32) -> Result<bool> {
    let held = self.state.borrow().entities.contains_key(&id);
    if !held {
      return Ok(false);
    }
    let metadata = self
      .storage
      .get_metadata(&SyncKey::Character(id).metadata_key())?;
    let last_fetched_at = metadata.and_then(|m| m.last_fetched_at);
    Ok(!self.policy.is_stale(last_fetched_at, self.clock.now()))
  }

  fn mark_loading(&self, ids: &[u32]) {
    self.state.send_modify(|s| {
      s.loading.extend(ids.iter().copied());
      s.status = LoadStatus::Loading;
    });
  }

  /// Flight epilogue: runs whether or not anyone still awaits the flight.
  ///
  /// Clears the loading marks for `ids`, and when this was the last fetch
  /// running, moves `status` off `Loading`. Callers that are still around
  /// refine the status afterwards.
  fn finish(&self, ids: &[u32], result: &Result<Vec<Character>>) {
    self.state.send_modify(|s| {
      for id in ids {
        s.loading.remove(id);
      }
      if !s.loading.is_empty() || !s.status.is_loading() {
        return;
      }
      match result {
        Ok(_) => s.status = LoadStatus::Loaded,
        Err(e) => {
          let held = ids.iter().any(|id| s.entities.contains_key(id));
          s.status = if e.is_recoverable() && held {
            LoadStatus::Loaded
          } else {
            LoadStatus::Failed(e.clone())
          };
          s.notice = Some(e.clone());
        }
      }
    });
  }

  /// Back to `Loaded` unless other fetches are still running.
  fn settle(&self, notice: Option<SyncError>) {
    self.state.send_modify(|s| {
      if s.loading.is_empty() {
        s.status = LoadStatus::Loaded;
      }
      s.notice = notice;
    });
  }

  fn fail(&self, error: SyncError) -> SyncError {
    warn!(error = %error, "character load failed");
    let status = LoadStatus::Failed(error.clone());
    self.state.send_modify(|s| s.status = status);
    error
  }

  async fn fetch_one(self: Arc<Self>, generation: u64, id: u32) -> Result<Vec<Character>> {
    debug!(id, "fetching character");
    let result = match self.fetcher.fetch_character(id).await {
      Ok(character) => self.commit(generation, vec![character]).await,
      Err(e) => Err(e),
    };
    self.finish(&[id], &result);
    result
  }

  async fn fetch_many(self: Arc<Self>, generation: u64, ids: Vec<u32>) -> Result<Vec<Character>> {
    debug!(?ids, "fetching characters");
    let result = match self.fetcher.fetch_characters(&ids).await {
      Ok(characters) => self.commit(generation, characters).await,
      Err(e) => Err(e),
    };
    self.finish(&ids, &result);
    result
  }

  /// Persist rows and their fetch timestamps together, then publish.
  async fn commit(&self, generation: u64, characters: Vec<Character>) -> Result<Vec<Character>> {
    let _guard = self.commit_lock.lock().await;
    if self.generation.load(Ordering::SeqCst) != generation {
      debug!(count = characters.len(), "dropping characters fetched before a clear");
      return Ok(Vec::new());
    }

    let now = self.clock.now();
    let batch = characters
      .iter()
      .fold(WriteBatch::upsert(&characters), |batch, c| {
        batch.with_metadata(
          SyncKey::Character(c.id).metadata_key(),
          SyncMetadata::fetched_at(now),
        )
      });
    self.storage.write_batch(batch)?;

    self.state.send_modify(|s| {
      for character in &characters {
        s.entities.insert(character.id, character.clone());
      }
    });
    debug!(count = characters.len(), "committed characters");
    Ok(characters)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ManualClock, SqliteStorage};
  use crate::sync::testing::{manual_clock, options, FakeFetcher, FlakyStorage};
  use chrono::Duration;
  use std::time::Duration as StdDuration;

  type Characters = CharacterSync<SqliteStorage, FakeFetcher>;

  fn setup(known: u32) -> (Characters, Arc<FakeFetcher>, Arc<ManualClock>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new(0, 20).with_characters(known));
    let clock = manual_clock();
    let sync = CharacterSync::new(storage, fetcher.clone(), options(&clock)).unwrap();
    (sync, fetcher, clock)
  }

  #[tokio::test]
  async fn test_load_entity_fetches_then_serves_fresh() {
    let (sync, fetcher, _) = setup(10);

    assert_eq!(sync.load_entity(3).await.unwrap(), CacheSource::Network);
    assert_eq!(sync.load_entity(3).await.unwrap(), CacheSource::CacheFresh);

    assert_eq!(fetcher.character_calls(), vec![vec![3]]);
    let state = sync.state();
    assert!(state.status.is_loaded());
    assert!(state.loading.is_empty());
    assert_eq!(
      sync.character(3).and_then(|c| c.name),
      Some("Character 3".to_string())
    );
  }

  #[tokio::test]
  async fn test_stale_entity_is_refetched() {
    let (sync, fetcher, clock) = setup(10);
    sync.load_entity(3).await.unwrap();

    clock.advance(Duration::days(7));
    fetcher.set_revision(" (v2)");

    assert_eq!(sync.load_entity(3).await.unwrap(), CacheSource::Network);
    assert_eq!(
      sync.character(3).and_then(|c| c.name),
      Some("Character 3 (v2)".to_string())
    );
  }

  #[tokio::test]
  async fn test_stale_entity_served_offline() {
    let (sync, fetcher, clock) = setup(10);
    sync.load_entity(3).await.unwrap();

    clock.advance(Duration::days(8));
    fetcher.set_offline(true);

    assert_eq!(sync.load_entity(3).await.unwrap(), CacheSource::Offline);
    let state = sync.state();
    assert!(state.status.is_loaded());
    assert!(state.entities.contains_key(&3));
    assert!(matches!(state.notice, Some(SyncError::Network(_))));
  }

  #[tokio::test]
  async fn test_uncached_entity_offline_fails() {
    let (sync, fetcher, _) = setup(10);
    fetcher.set_offline(true);

    let err = sync.load_entity(3).await.unwrap_err();

    assert!(matches!(err, SyncError::Network(_)));
    assert_eq!(sync.state().status, LoadStatus::Failed(err));
    assert!(!sync.is_loading(3));
  }

  #[tokio::test]
  async fn test_unknown_entity_is_not_found() {
    let (sync, _, _) = setup(10);
    let err = sync.load_entity(99).await.unwrap_err();
    assert_eq!(err, SyncError::NotFound("character 99".into()));
  }

  #[tokio::test]
  async fn test_concurrent_load_entity_fetches_once() {
    let (sync, fetcher, _) = setup(10);
    fetcher.set_delay(StdDuration::from_millis(30));

    let (a, b, c) = tokio::join!(sync.load_entity(4), sync.load_entity(4), sync.load_entity(4));

    assert_eq!(a.unwrap(), CacheSource::Network);
    assert_eq!(b.unwrap(), CacheSource::Network);
    assert_eq!(c.unwrap(), CacheSource::Network);
    assert_eq!(fetcher.character_calls(), vec![vec![4]]);
  }

  #[tokio::test]
  async fn test_batch_dedups_and_skips_fresh() {
    let (sync, fetcher, _) = setup(10);
    sync.load_entity(1).await.unwrap();

    let outcome = sync.load_entities(&[1, 2, 2, 3, 1]).await.unwrap();

    assert_eq!(outcome.fresh, vec![1]);
    assert_eq!(outcome.fetched, vec![2, 3]);
    assert!(outcome.missing.is_empty());
    assert_eq!(fetcher.character_calls(), vec![vec![1], vec![2, 3]]);
    assert_eq!(sync.characters_for(&[3, 1, 2]).len(), 3);
  }

  #[tokio::test]
  async fn test_batch_of_fresh_ids_makes_no_request() {
    let (sync, fetcher, _) = setup(10);
    sync.load_entities(&[1, 2]).await.unwrap();

    let outcome = sync.load_entities(&[2, 1]).await.unwrap();

    assert_eq!(outcome.fresh, vec![2, 1]);
    assert_eq!(fetcher.character_calls().len(), 1);
  }

  #[tokio::test]
  async fn test_batch_skips_ids_in_flight() {
    let (sync, fetcher, _) = setup(10);
    fetcher.set_delay(StdDuration::from_millis(50));

    let single = {
      let sync = sync.clone();
      tokio::spawn(async move { sync.load_entity(2).await })
    };
    tokio::time::sleep(StdDuration::from_millis(10)).await;
    assert!(sync.is_loading(2));

    let outcome = sync.load_entities(&[1, 2, 3]).await.unwrap();

    assert_eq!(outcome.skipped, vec![2]);
    assert_eq!(outcome.fetched, vec![1, 3]);
    assert_eq!(single.await.unwrap().unwrap(), CacheSource::Network);

    let mut calls = fetcher.character_calls();
    calls.sort();
    assert_eq!(calls, vec![vec![1, 3], vec![2]]);
  }

  #[tokio::test]
  async fn test_batch_reports_ids_remote_omits() {
    let (sync, _, _) = setup(5);

    let outcome = sync.load_entities(&[4, 5, 99]).await.unwrap();

    assert_eq!(outcome.fetched, vec![4, 5]);
    assert_eq!(outcome.missing, vec![99]);
    let state = sync.state();
    assert!(state.status.is_loaded());
    assert!(matches!(state.notice, Some(SyncError::NotFound(_))));
  }

  #[tokio::test]
  async fn test_batch_of_one_unknown_id_is_missing() {
    let (sync, fetcher, _) = setup(10);

    let outcome = sync.load_entities(&[99]).await.unwrap();

    assert!(outcome.fetched.is_empty());
    assert_eq!(outcome.missing, vec![99]);
    assert_eq!(fetcher.character_calls(), vec![vec![99]]);
    let state = sync.state();
    assert!(state.status.is_loaded());
    assert!(matches!(state.notice, Some(SyncError::NotFound(_))));
  }

  #[tokio::test]
  async fn test_cancelled_batch_still_lands_and_releases_ids() {
    let (sync, fetcher, _) = setup(10);
    fetcher.set_delay(StdDuration::from_millis(50));

    let cancelled =
      tokio::time::timeout(StdDuration::from_millis(10), sync.load_entities(&[1, 2])).await;
    assert!(cancelled.is_err());
    assert!(sync.is_loading(1) && sync.is_loading(2));

    tokio::time::sleep(StdDuration::from_millis(100)).await;
    let state = sync.state();
    assert!(state.loading.is_empty());
    assert!(state.status.is_loaded());
    assert!(state.entities.contains_key(&1) && state.entities.contains_key(&2));

    fetcher.set_delay(StdDuration::ZERO);
    let outcome = sync.load_entities(&[1, 2, 3]).await.unwrap();
    assert_eq!(outcome.fresh, vec![1, 2]);
    assert!(outcome.skipped.is_empty());
    assert_eq!(outcome.fetched, vec![3]);
    assert_eq!(fetcher.character_calls(), vec![vec![1, 2], vec![3]]);
  }

  #[tokio::test]
  async fn test_cancelled_load_entity_does_not_stay_loading() {
    let (sync, fetcher, _) = setup(10);
    fetcher.set_offline(true);
    fetcher.set_delay(StdDuration::from_millis(50));

    let cancelled = tokio::time::timeout(StdDuration::from_millis(10), sync.load_entity(6)).await;
    assert!(cancelled.is_err());

    tokio::time::sleep(StdDuration::from_millis(100)).await;
    assert!(!sync.is_loading(6));
    assert!(sync.state().status.is_failed());

    fetcher.set_offline(false);
    fetcher.set_delay(StdDuration::ZERO);
    assert_eq!(sync.load_entity(6).await.unwrap(), CacheSource::Network);
  }

  #[tokio::test]
  async fn test_batch_offline_falls_back_to_cache() {
    let (sync, fetcher, clock) = setup(10);
    sync.load_entities(&[1, 2]).await.unwrap();

    clock.advance(Duration::days(8));
    fetcher.set_offline(true);
    let outcome = sync.load_entities(&[1, 2, 3]).await.unwrap();

    assert_eq!(outcome.from_cache, vec![1, 2]);
    assert_eq!(outcome.missing, vec![3]);
    let state = sync.state();
    assert!(state.status.is_loaded());
    assert!(matches!(state.notice, Some(SyncError::Network(_))));
  }

  #[tokio::test]
  async fn test_batch_offline_without_cache_fails() {
    let (sync, fetcher, _) = setup(10);
    fetcher.set_offline(true);

    let err = sync.load_entities(&[1, 2]).await.unwrap_err();

    assert!(matches!(err, SyncError::Network(_)));
    assert!(sync.state().status.is_failed());
  }

  #[tokio::test]
  async fn test_store_failure_fails_load() {
    let storage = Arc::new(FlakyStorage::new());
    let fetcher = Arc::new(FakeFetcher::new(0, 20));
    let clock = manual_clock();
    let sync = CharacterSync::new(storage.clone(), fetcher, options(&clock)).unwrap();
    storage.set_fail_writes(true);

    let err = sync.load_entity(1).await.unwrap_err();

    assert!(matches!(err, SyncError::Store(_)));
    assert!(sync.state().status.is_failed());
    assert!(sync.character(1).is_none());
  }

  #[tokio::test]
  async fn test_clear_removes_rows_and_timestamps() {
    let (sync, fetcher, _) = setup(10);
    sync.load_entities(&[1, 2]).await.unwrap();

    sync.clear().await.unwrap();

    let state = sync.state();
    assert!(state.status.is_idle());
    assert!(state.entities.is_empty());
    assert_eq!(
      sync.inner.storage.get_metadata("character:1").unwrap(),
      None
    );

    // Not fresh anymore, so it is fetched again
    assert_eq!(sync.load_entity(1).await.unwrap(), CacheSource::Network);
    assert_eq!(fetcher.character_calls().len(), 2);
  }

  #[tokio::test]
  async fn test_cached_characters_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let clock = manual_clock();

    {
      let storage = Arc::new(SqliteStorage::open(&path).unwrap());
      let fetcher = Arc::new(FakeFetcher::new(0, 20));
      let sync = CharacterSync::new(storage, fetcher, options(&clock)).unwrap();
      sync.load_entities(&[7, 8]).await.unwrap();
    }

    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let fetcher = Arc::new(FakeFetcher::new(0, 20));
    let sync = CharacterSync::new(storage, fetcher.clone(), options(&clock)).unwrap();

    assert!(sync.state().status.is_idle());
    assert_eq!(sync.state().entities.len(), 2);
    assert_eq!(sync.load_entity(7).await.unwrap(), CacheSource::CacheFresh);
    assert!(fetcher.character_calls().is_empty());
  }
}
