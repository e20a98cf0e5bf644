use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One episode of the show
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
  pub id: u32,
  pub name: Option<String>,
  /// As served by the API, e.g. "December 2, 2013"
  pub air_date: Option<String>,
  /// e.g. "S01E01"
  pub episode_code: Option<String>,
  #[serde(default)]
  pub character_refs: Vec<String>,
  pub url: Option<String>,
  pub created: Option<String>,
}

impl Episode {
  pub fn season_number(&self) -> u32 {
    parse_episode_code(self.episode_code.as_deref().unwrap_or_default()).0
  }

  pub fn episode_number(&self) -> u32 {
    parse_episode_code(self.episode_code.as_deref().unwrap_or_default()).1
  }

  /// "September 10, 2017" -> "10 September 2017". Unparseable dates are
  /// returned as-is.
  pub fn formatted_air_date(&self) -> Option<String> {
    self.air_date.as_deref().map(format_air_date)
  }

  /// Character ids referenced by this episode, in order.
  pub fn character_ids(&self) -> Vec<u32> {
    ids_from_refs(&self.character_refs)
  }
}

/// Parse "S{season}E{episode}" leniently.
///
/// Missing markers or non-numeric parts fall back to season 1 / episode 1.
pub fn parse_episode_code(code: &str) -> (u32, u32) {
  let upper = code.trim().to_uppercase();

  let season = upper
    .strip_prefix('S')
    .and_then(|rest| rest.find('E').map(|e| &rest[..e]))
    .and_then(|s| s.parse().ok())
    .unwrap_or(1);

  let episode = upper
    .find('E')
    .and_then(|e| upper[e + 1..].parse().ok())
    .unwrap_or(1);

  (season, episode)
}

fn format_air_date(raw: &str) -> String {
  match NaiveDate::parse_from_str(raw.trim(), "%B %d, %Y") {
    Ok(date) => date.format("%-d %B %Y").to_string(),
    Err(_) => raw.to_string(),
  }
}

/// Extract numeric ids from reference URLs such as
/// "https://rickandmortyapi.com/api/character/1". Bare numeric ids are
/// accepted too; anything else is skipped.
pub fn ids_from_refs(refs: &[String]) -> Vec<u32> {
  refs.iter().filter_map(|r| id_from_ref(r)).collect()
}

fn id_from_ref(reference: &str) -> Option<u32> {
  let reference = reference.trim();
  if let Ok(id) = reference.parse() {
    return Some(id);
  }
  let url = url::Url::parse(reference).ok()?;
  url
    .path_segments()?
    .filter(|segment| !segment.is_empty())
    .last()?
    .parse()
    .ok()
}

/// Episodes grouped by season, seasons ascending, episodes in input order.
pub fn group_by_season(episodes: &[Episode]) -> Vec<(u32, Vec<&Episode>)> {
  let mut seasons: BTreeMap<u32, Vec<&Episode>> = BTreeMap::new();
  for episode in episodes {
    seasons.entry(episode.season_number()).or_default().push(episode);
  }
  seasons.into_iter().collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CharacterStatus {
  Alive,
  Dead,
  #[default]
  #[serde(rename = "unknown")]
  Unknown,
}

impl CharacterStatus {
  /// Absent or unrecognized values map to `Unknown`.
  pub fn parse(raw: Option<&str>) -> Self {
    match raw.map(str::trim) {
      Some(s) if s.eq_ignore_ascii_case("alive") => Self::Alive,
      Some(s) if s.eq_ignore_ascii_case("dead") => Self::Dead,
      _ => Self::Unknown,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Alive => "Alive",
      Self::Dead => "Dead",
      Self::Unknown => "unknown",
    }
  }
}

impl fmt::Display for CharacterStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
  Female,
  Male,
  Genderless,
  #[default]
  #[serde(rename = "unknown")]
  Unknown,
}

impl Gender {
  pub fn parse(raw: Option<&str>) -> Self {
    match raw.map(str::trim) {
      Some(s) if s.eq_ignore_ascii_case("female") => Self::Female,
      Some(s) if s.eq_ignore_ascii_case("male") => Self::Male,
      Some(s) if s.eq_ignore_ascii_case("genderless") => Self::Genderless,
      _ => Self::Unknown,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Female => "Female",
      Self::Male => "Male",
      Self::Genderless => "Genderless",
      Self::Unknown => "unknown",
    }
  }
}

impl fmt::Display for Gender {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Named location reference (origin or last known location)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
  pub name: String,
  pub url: String,
}

/// Full character record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
  pub id: u32,
  pub name: Option<String>,
  #[serde(default)]
  pub status: CharacterStatus,
  pub species: Option<String>,
  /// Sub-species or variant; often empty
  #[serde(rename = "type")]
  pub kind: Option<String>,
  #[serde(default)]
  pub gender: Gender,
  pub origin: Option<Place>,
  pub location: Option<Place>,
  pub image: Option<String>,
  #[serde(default)]
  pub episode_refs: Vec<String>,
  pub url: Option<String>,
  pub created: Option<String>,
}

impl Character {
  /// The `type` field, with empty strings treated as absent.
  pub fn display_type(&self) -> Option<&str> {
    self.kind.as_deref().filter(|t| !t.trim().is_empty())
  }

  pub fn episode_ids(&self) -> Vec<u32> {
    ids_from_refs(&self.episode_refs)
  }

  /// Plain-text character sheet for sharing.
  pub fn export_text(&self) -> String {
    let mut text = String::from("RICK & MORTY CHARACTER\n");
    text.push_str("====================\n\n");

    text.push_str(&format!("Name: {}\n", self.name.as_deref().unwrap_or("Unknown")));
    text.push_str(&format!("Status: {}\n", self.status));
    text.push_str(&format!(
      "Species: {}\n",
      self.species.as_deref().unwrap_or("Unknown")
    ));

    if let Some(origin) = &self.origin {
      text.push_str(&format!("Origin: {}\n", origin.name));
    }

    let count = self.episode_refs.len();
    if count > 0 {
      let noun = if count == 1 { "episode" } else { "episodes" };
      text.push_str(&format!("Appears in {} {}\n", count, noun));
    }

    text
  }

  /// Suggested file name for [`Character::export_text`].
  pub fn export_file_name(&self) -> String {
    match self.name.as_deref().filter(|n| !n.is_empty()) {
      Some(name) => format!("{}.txt", name),
      None => format!("Character_{}.txt", self.id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn episode(id: u32, code: Option<&str>) -> Episode {
    Episode {
      id,
      name: Some(format!("Episode {}", id)),
      air_date: None,
      episode_code: code.map(String::from),
      character_refs: Vec::new(),
      url: None,
      created: None,
    }
  }

  fn rick() -> Character {
    Character {
      id: 1,
      name: Some("Rick Sanchez".into()),
      status: CharacterStatus::Alive,
      species: Some("Human".into()),
      kind: Some(String::new()),
      gender: Gender::Male,
      origin: Some(Place {
        name: "Earth (C-137)".into(),
        url: "https://rickandmortyapi.com/api/location/1".into(),
      }),
      location: None,
      image: None,
      episode_refs: vec![
        "https://rickandmortyapi.com/api/episode/1".into(),
        "https://rickandmortyapi.com/api/episode/2".into(),
      ],
      url: None,
      created: None,
    }
  }

  #[test]
  fn test_parse_episode_code() {
    assert_eq!(parse_episode_code("S01E01"), (1, 1));
    assert_eq!(parse_episode_code("S3E07"), (3, 7));
    assert_eq!(parse_episode_code("s04e10"), (4, 10));
    assert_eq!(parse_episode_code("foo"), (1, 1));
    assert_eq!(parse_episode_code(""), (1, 1));
    assert_eq!(parse_episode_code("SxxE05"), (1, 5));
    assert_eq!(parse_episode_code("S02"), (1, 1));
  }

  #[test]
  fn test_missing_code_defaults() {
    let ep = episode(1, None);
    assert_eq!((ep.season_number(), ep.episode_number()), (1, 1));
  }

  #[test]
  fn test_formatted_air_date() {
    let mut ep = episode(1, Some("S01E01"));
    ep.air_date = Some("December 2, 2013".into());
    assert_eq!(ep.formatted_air_date().as_deref(), Some("2 December 2013"));

    ep.air_date = Some("September 10, 2017".into());
    assert_eq!(ep.formatted_air_date().as_deref(), Some("10 September 2017"));

    ep.air_date = Some("sometime".into());
    assert_eq!(ep.formatted_air_date().as_deref(), Some("sometime"));

    ep.air_date = None;
    assert_eq!(ep.formatted_air_date(), None);
  }

  #[test]
  fn test_character_ids_from_urls() {
    let refs = vec![
      "https://rickandmortyapi.com/api/character/1".to_string(),
      "https://rickandmortyapi.com/api/character/38/".to_string(),
      "42".to_string(),
      "https://rickandmortyapi.com/api/character/abc".to_string(),
      "not a url".to_string(),
    ];
    assert_eq!(ids_from_refs(&refs), vec![1, 38, 42]);
  }

  #[test]
  fn test_group_by_season() {
    let episodes = vec![
      episode(1, Some("S01E01")),
      episode(12, Some("S02E01")),
      episode(2, Some("S01E02")),
      episode(99, None),
    ];
    let grouped = group_by_season(&episodes);
    let summary: Vec<(u32, Vec<u32>)> = grouped
      .iter()
      .map(|(season, eps)| (*season, eps.iter().map(|e| e.id).collect()))
      .collect();
    assert_eq!(summary, vec![(1, vec![1, 2, 99]), (2, vec![12])]);
  }

  #[test]
  fn test_status_and_gender_parse() {
    assert_eq!(CharacterStatus::parse(Some("Alive")), CharacterStatus::Alive);
    assert_eq!(CharacterStatus::parse(Some("dead")), CharacterStatus::Dead);
    assert_eq!(CharacterStatus::parse(Some("zombie")), CharacterStatus::Unknown);
    assert_eq!(CharacterStatus::parse(None), CharacterStatus::Unknown);
    assert_eq!(Gender::parse(Some("Genderless")), Gender::Genderless);
    assert_eq!(Gender::parse(Some("")), Gender::Unknown);
  }

  #[test]
  fn test_display_type_hides_empty() {
    let mut c = rick();
    assert_eq!(c.display_type(), None);
    c.kind = Some("Parasite".into());
    assert_eq!(c.display_type(), Some("Parasite"));
  }

  #[test]
  fn test_export_text() {
    let text = rick().export_text();
    assert_eq!(
      text,
      "RICK & MORTY CHARACTER\n\
       ====================\n\n\
       Name: Rick Sanchez\n\
       Status: Alive\n\
       Species: Human\n\
       Origin: Earth (C-137)\n\
       Appears in 2 episodes\n"
    );
  }

  #[test]
  fn test_export_text_singular_and_file_name() {
    let mut c = rick();
    c.episode_refs.truncate(1);
    assert!(c.export_text().ends_with("Appears in 1 episode\n"));
    assert_eq!(c.export_file_name(), "Rick Sanchez.txt");
    c.name = None;
    assert_eq!(c.export_file_name(), "Character_1.txt");
  }

  #[test]
  fn test_stored_form_roundtrip() {
    let c = rick();
    let json = serde_json::to_string(&c).unwrap();
    assert!(json.contains("\"type\":\"\""));
    let back: Character = serde_json::from_str(&json).unwrap();
    assert_eq!(back, c);
  }
}
