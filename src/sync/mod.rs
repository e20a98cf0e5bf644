//! Orchestrators that keep the local cache and the remote API in step.
//!
//! Each orchestrator owns one collection, publishes its state through a
//! `watch` channel and decides per load whether to serve the cache, go to
//! the network, or fall back to stale data when the network is unavailable.

pub mod characters;
pub mod episodes;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use crate::cache::pagination::DEFAULT_PAGE_SIZE;
use crate::cache::{Clock, StalenessPolicy, SystemClock};
use crate::config::Config;

pub use characters::{BatchLoad, CharacterSync, CharactersState};
pub use episodes::{EpisodeSync, EpisodesState, PageLoad};
pub use status::{CollectionState, EntityMapState, LoadStatus};

/// Knobs shared by every orchestrator.
#[derive(Clone)]
pub struct SyncOptions {
  pub policy: StalenessPolicy,
  /// Expected records per remote page, used when the remote gives no cursor
  pub page_size: u32,
  pub clock: Arc<dyn Clock>,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      policy: StalenessPolicy::default(),
      page_size: DEFAULT_PAGE_SIZE,
      clock: Arc::new(SystemClock),
    }
  }
}

impl SyncOptions {
  pub fn from_config(config: &Config) -> Self {
    Self {
      policy: StalenessPolicy::new(config.max_age()),
      page_size: config.cache.page_size,
      ..Self::default()
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }
}
