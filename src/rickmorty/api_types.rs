//! Serde-deserializable types matching Rick and Morty API responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;

use crate::cache::PageInfo;

// ============================================================================
// Pagination envelope
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiInfo {
  pub count: u32,
  pub pages: u32,
  pub next: Option<String>,
  pub prev: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPage<T> {
  pub info: ApiInfo,
  #[serde(default = "Vec::new")]
  pub results: Vec<T>,
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiEpisode {
  pub id: u32,
  pub name: Option<String>,
  pub air_date: Option<String>,
  pub episode: Option<String>,
  #[serde(default)]
  pub characters: Vec<String>,
  pub url: Option<String>,
  pub created: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPlace {
  pub name: Option<String>,
  pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiCharacter {
  pub id: u32,
  pub name: Option<String>,
  pub status: Option<String>,
  pub species: Option<String>,
  #[serde(rename = "type")]
  pub kind: Option<String>,
  pub gender: Option<String>,
  pub origin: Option<ApiPlace>,
  pub location: Option<ApiPlace>,
  pub image: Option<String>,
  #[serde(default)]
  pub episode: Vec<String>,
  pub url: Option<String>,
  pub created: Option<String>,
}

/// The batch character endpoint answers with a bare object when asked for a
/// single id and with an array otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiCharacters {
  Many(Vec<ApiCharacter>),
  One(Box<ApiCharacter>),
}

// ============================================================================
// Conversions to domain types
// ============================================================================

use super::types::{Character, CharacterStatus, Episode, Gender, Place};

impl From<ApiEpisode> for Episode {
  fn from(ep: ApiEpisode) -> Self {
    Episode {
      id: ep.id,
      name: ep.name,
      air_date: ep.air_date,
      episode_code: ep.episode,
      character_refs: ep.characters,
      url: ep.url,
      created: ep.created,
    }
  }
}

impl ApiPlace {
  /// Both halves must be present for the place to count.
  fn into_place(self) -> Option<Place> {
    match (self.name, self.url) {
      (Some(name), Some(url)) => Some(Place { name, url }),
      _ => None,
    }
  }
}

impl From<ApiCharacter> for Character {
  fn from(c: ApiCharacter) -> Self {
    Character {
      id: c.id,
      name: c.name,
      status: CharacterStatus::parse(c.status.as_deref()),
      species: c.species,
      kind: c.kind,
      gender: Gender::parse(c.gender.as_deref()),
      origin: c.origin.and_then(ApiPlace::into_place),
      location: c.location.and_then(ApiPlace::into_place),
      image: c.image,
      episode_refs: c.episode,
      url: c.url,
      created: c.created,
    }
  }
}

impl From<ApiCharacters> for Vec<Character> {
  fn from(resp: ApiCharacters) -> Self {
    match resp {
      ApiCharacters::Many(list) => list.into_iter().map(Character::from).collect(),
      ApiCharacters::One(one) => vec![Character::from(*one)],
    }
  }
}

impl ApiInfo {
  /// Pagination facts for the page that was requested as `page`.
  pub fn page_info(&self, page: u32) -> PageInfo {
    PageInfo {
      page,
      total_count: self.count,
      total_pages: self.pages,
      has_next: self.next.is_some(),
      next_page: self.next.as_deref().and_then(page_from_cursor),
    }
  }
}

// ============================================================================
// Helpers
// ============================================================================

/// Extract the `page` query parameter from a "next" cursor URL.
///
/// A cursor that is present but carries no readable page number still means
/// "there is more"; callers fall back to deriving the index from counts.
pub fn page_from_cursor(cursor: &str) -> Option<u32> {
  let url = url::Url::parse(cursor).ok()?;
  url
    .query_pairs()
    .find(|(k, _)| k == "page")
    .and_then(|(_, v)| v.parse().ok())
}
