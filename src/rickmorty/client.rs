use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::Page;
use crate::config::ApiConfig;
use crate::error::{Result, SyncError};
use crate::rickmorty::api_types::{ApiCharacter, ApiCharacters, ApiEpisode, ApiPage};
use crate::rickmorty::types::{Character, Episode};

/// Read-only access to the remote API.
///
/// The sync engine only talks to the network through this trait, so tests
/// can script responses and count calls.
#[async_trait]
pub trait RemoteFetcher: Send + Sync + 'static {
  /// Fetch one page (1-based) of the episode collection
  async fn fetch_episode_page(&self, page: u32) -> Result<Page<Episode>>;

  /// Fetch a single character by id
  async fn fetch_character(&self, id: u32) -> Result<Character>;

  /// Fetch several characters in one request. Unknown ids are omitted from
  /// the answer rather than failing it.
  async fn fetch_characters(&self, ids: &[u32]) -> Result<Vec<Character>>;
}

/// Rick and Morty REST API client
#[derive(Clone)]
pub struct RickAndMortyClient {
  http: reqwest::Client,
  base_url: Url,
}

impl RickAndMortyClient {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    // Url::join replaces the last segment unless the base ends with '/'
    let mut base = config.base_url.trim_end_matches('/').to_string();
    base.push('/');
    let base_url = Url::parse(&base)
      .map_err(|e| SyncError::InvalidRequest(format!("bad base URL {}: {}", config.base_url, e)))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()?;

    Ok(Self { http, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| SyncError::InvalidRequest(format!("bad path {}: {}", path, e)))?;

    debug!(%url, "GET");
    let response = self.http.get(url.clone()).send().await?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
      return Err(SyncError::NotFound(what.to_string()));
    }
    if !status.is_success() {
      return Err(SyncError::Server {
        status: status.as_u16(),
        url: url.to_string(),
      });
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| SyncError::Decode(format!("{}: {}", what, e)))
  }
}

#[async_trait]
impl RemoteFetcher for RickAndMortyClient {
  async fn fetch_episode_page(&self, page: u32) -> Result<Page<Episode>> {
    if page == 0 {
      return Err(SyncError::InvalidRequest("page indexes start at 1".into()));
    }

    let response: ApiPage<ApiEpisode> = self
      .get_json(&format!("episode?page={}", page), &format!("episode page {}", page))
      .await?;

    Ok(Page {
      info: response.info.page_info(page),
      records: response.results.into_iter().map(Episode::from).collect(),
    })
  }

  async fn fetch_character(&self, id: u32) -> Result<Character> {
    let response: ApiCharacter = self
      .get_json(&format!("character/{}", id), &format!("character {}", id))
      .await?;
    Ok(response.into())
  }

  async fn fetch_characters(&self, ids: &[u32]) -> Result<Vec<Character>> {
    match ids {
      [] => Ok(Vec::new()),
      // A lone id answers with an object, and a 404 when unknown
      [id] => match self.fetch_character(*id).await {
        Ok(character) => Ok(vec![character]),
        Err(SyncError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
      },
      _ => {
        let list = ids
          .iter()
          .map(|id| id.to_string())
          .collect::<Vec<_>>()
          .join(",");
        let response: ApiCharacters = self
          .get_json(&format!("character/{}", list), &format!("characters {}", list))
          .await?;
        Ok(response.into())
      }
    }
  }
}
