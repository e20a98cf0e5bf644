//! Caching implementations for Rick and Morty types.

use crate::cache::Cacheable;

use super::types::{Character, Episode};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Episode {
  fn cache_id(&self) -> u32 {
    self.id
  }

  fn entity_type() -> &'static str {
    "episode"
  }
}

impl Cacheable for Character {
  fn cache_id(&self) -> u32 {
    self.id
  }

  fn entity_type() -> &'static str {
    "character"
  }
}

// ============================================================================
// Metadata keys
// ============================================================================

/// Keys into the sync metadata area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncKey {
  /// The paginated episode collection
  Episodes,
  /// All per-character entries (used for resets)
  Characters,
  /// One character's fetch timestamp
  Character(u32),
}

impl SyncKey {
  pub fn metadata_key(&self) -> String {
    match self {
      Self::Episodes => "episodes".to_string(),
      Self::Characters => "character".to_string(),
      Self::Character(id) => format!("character:{}", id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_character_keys_share_reset_prefix() {
    let prefix = SyncKey::Characters.metadata_key();
    let key = SyncKey::Character(12).metadata_key();
    assert_eq!(key, "character:12");
    assert!(key.starts_with(&format!("{}:", prefix)));
    assert!(!SyncKey::Episodes.metadata_key().starts_with(&prefix));
  }
}
