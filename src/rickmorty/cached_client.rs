//! Cached Rick and Morty client: both orchestrators over one shared store.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::sync::{BatchLoad, CharacterSync, EpisodeSync, SyncOptions};

use super::client::{RemoteFetcher, RickAndMortyClient};
use super::types::{Character, Episode};

/// Rick and Morty client with transparent caching support.
///
/// Episodes and characters are synced independently but share one store
/// and one remote client.
pub struct CachedRickAndMorty<S = SqliteStorage, F = RickAndMortyClient> {
  pub episodes: EpisodeSync<S, F>,
  pub characters: CharacterSync<S, F>,
}

impl<S, F> Clone for CachedRickAndMorty<S, F> {
  fn clone(&self) -> Self {
    Self {
      episodes: self.episodes.clone(),
      characters: self.characters.clone(),
    }
  }
}

impl CachedRickAndMorty {
  /// Open the on-disk cache named by `config` and wire up the live API client.
  pub fn new(config: &Config) -> Result<Self> {
    let path = config.cache_path()?;
    let storage = Arc::new(SqliteStorage::open(&path)?);
    let client = Arc::new(RickAndMortyClient::new(&config.api)?);
    info!(cache = %path.display(), api = %client.base_url(), "opened rick and morty cache");

    Ok(Self::with_parts(
      storage,
      client,
      SyncOptions::from_config(config),
    )?)
  }
}

impl<S, F> CachedRickAndMorty<S, F>
where
  S: CacheStorage + 'static,
  F: RemoteFetcher,
{
  pub fn with_parts(
    storage: Arc<S>,
    fetcher: Arc<F>,
    options: SyncOptions,
  ) -> crate::error::Result<Self> {
    Ok(Self {
      episodes: EpisodeSync::new(storage.clone(), fetcher.clone(), options.clone())?,
      characters: CharacterSync::new(storage, fetcher, options)?,
    })
  }

  /// Load every character appearing in `episode`, in the episode's order.
  ///
  /// Characters that could not be loaded from the remote or the cache are
  /// left out; the returned [`BatchLoad`] says which.
  pub async fn load_episode_characters(
    &self,
    episode: &Episode,
  ) -> crate::error::Result<(Vec<Character>, BatchLoad)> {
    let ids = episode.character_ids();
    let outcome = self.characters.load_entities(&ids).await?;
    Ok((self.characters.characters_for(&ids), outcome))
  }

  /// Drop every cached episode and character.
  pub async fn clear(&self) -> crate::error::Result<()> {
    self.episodes.clear().await?;
    self.characters.clear().await
  }
}
