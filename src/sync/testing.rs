//! Scripted remote and storage doubles for orchestrator tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{
  CacheStorage, Cacheable, Clock, ManualClock, Page, PageInfo, SqliteStorage, SyncMetadata,
  WriteBatch,
};
use crate::error::{Result, SyncError};
use crate::rickmorty::client::RemoteFetcher;
use crate::rickmorty::types::{Character, CharacterStatus, Episode, Gender};

use super::SyncOptions;

pub fn t0() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2025, 6, 17, 12, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
  Arc::new(ManualClock::new(t0()))
}

pub fn options(clock: &Arc<ManualClock>) -> SyncOptions {
  SyncOptions::default().with_clock(clock.clone() as Arc<dyn Clock>)
}

pub fn episode(id: u32, revision: &str) -> Episode {
  Episode {
    id,
    name: Some(format!("Episode {}{}", id, revision)),
    air_date: Some("December 2, 2013".to_string()),
    episode_code: Some(format!("S01E{:02}", id)),
    character_refs: vec![
      "https://rickandmortyapi.com/api/character/1".to_string(),
      format!("https://rickandmortyapi.com/api/character/{}", id + 1),
    ],
    url: Some(format!("https://rickandmortyapi.com/api/episode/{}", id)),
    created: None,
  }
}

pub fn character(id: u32, revision: &str) -> Character {
  Character {
    id,
    name: Some(format!("Character {}{}", id, revision)),
    status: CharacterStatus::Alive,
    species: Some("Human".to_string()),
    kind: None,
    gender: Gender::Female,
    origin: None,
    location: None,
    image: None,
    episode_refs: Vec::new(),
    url: None,
    created: None,
  }
}

/// In-process stand-in for the remote API.
///
/// Serves `total_episodes` episodes in pages of `page_size`, and characters
/// with ids `1..=known_characters`. Every call is recorded.
pub struct FakeFetcher {
  total_episodes: u32,
  page_size: u32,
  known_characters: u32,
  offline: AtomicBool,
  delay_ms: AtomicU64,
  revision: Mutex<String>,
  episode_calls: Mutex<Vec<u32>>,
  character_calls: Mutex<Vec<Vec<u32>>>,
}

impl FakeFetcher {
  pub fn new(total_episodes: u32, page_size: u32) -> Self {
    Self {
      total_episodes,
      page_size,
      known_characters: 50,
      offline: AtomicBool::new(false),
      delay_ms: AtomicU64::new(0),
      revision: Mutex::new(String::new()),
      episode_calls: Mutex::new(Vec::new()),
      character_calls: Mutex::new(Vec::new()),
    }
  }

  pub fn with_characters(mut self, known: u32) -> Self {
    self.known_characters = known;
    self
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
  }

  /// Suffix appended to every name served from now on
  pub fn set_revision(&self, revision: &str) {
    *self.revision.lock().unwrap() = revision.to_string();
  }

  pub fn episode_calls(&self) -> Vec<u32> {
    self.episode_calls.lock().unwrap().clone()
  }

  pub fn character_calls(&self) -> Vec<Vec<u32>> {
    self.character_calls.lock().unwrap().clone()
  }

  async fn respond(&self) -> Result<String> {
    let delay = self.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(SyncError::Network("connection refused".into()));
    }
    Ok(self.revision.lock().unwrap().clone())
  }
}

#[async_trait]
impl RemoteFetcher for FakeFetcher {
  async fn fetch_episode_page(&self, page: u32) -> Result<Page<Episode>> {
    self.episode_calls.lock().unwrap().push(page);
    let revision = self.respond().await?;

    let total_pages = self.total_episodes.div_ceil(self.page_size);
    if page == 0 || page > total_pages {
      return Err(SyncError::NotFound(format!("episode page {}", page)));
    }

    let first = (page - 1) * self.page_size + 1;
    let last = (page * self.page_size).min(self.total_episodes);
    let has_next = page < total_pages;
    Ok(Page {
      records: (first..=last).map(|id| episode(id, &revision)).collect(),
      info: PageInfo {
        page,
        total_count: self.total_episodes,
        total_pages,
        has_next,
        next_page: has_next.then_some(page + 1),
      },
    })
  }

  async fn fetch_character(&self, id: u32) -> Result<Character> {
    self.character_calls.lock().unwrap().push(vec![id]);
    let revision = self.respond().await?;
    if id == 0 || id > self.known_characters {
      return Err(SyncError::NotFound(format!("character {}", id)));
    }
    Ok(character(id, &revision))
  }

  async fn fetch_characters(&self, ids: &[u32]) -> Result<Vec<Character>> {
    self.character_calls.lock().unwrap().push(ids.to_vec());
    let revision = self.respond().await?;
    Ok(
      ids
        .iter()
        .filter(|id| **id > 0 && **id <= self.known_characters)
        .map(|id| character(*id, &revision))
        .collect(),
    )
  }
}

/// SQLite storage whose writes can be made to fail on demand.
pub struct FlakyStorage {
  inner: SqliteStorage,
  fail_writes: AtomicBool,
}

impl FlakyStorage {
  pub fn new() -> Self {
    Self {
      inner: SqliteStorage::open_in_memory().unwrap(),
      fail_writes: AtomicBool::new(false),
    }
  }

  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }
}

impl CacheStorage for FlakyStorage {
  fn write_batch<T: Cacheable>(&self, batch: WriteBatch<'_, T>) -> Result<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(SyncError::Store("disk full".into()));
    }
    self.inner.write_batch(batch)
  }

  fn fetch_by_id<T: Cacheable>(&self, id: u32) -> Result<Option<T>> {
    self.inner.fetch_by_id(id)
  }

  fn fetch_all_sorted<T: Cacheable>(&self) -> Result<Vec<T>> {
    self.inner.fetch_all_sorted()
  }

  fn get_metadata(&self, key: &str) -> Result<Option<SyncMetadata>> {
    self.inner.get_metadata(key)
  }

  fn put_metadata(&self, key: &str, metadata: &SyncMetadata) -> Result<()> {
    self.inner.put_metadata(key, metadata)
  }
}
