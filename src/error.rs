//! Error types for the sync engine.

use thiserror::Error;

/// Coarse classification of a [`SyncError`].
///
/// Callers use this to tell "server unreachable" apart from "server reachable
/// but the payload broke the contract" apart from "local persistence failed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Network,
  Decode,
  Store,
}

/// Errors that can occur while fetching, decoding or persisting entities.
///
/// Cloneable so that every caller joined on a single in-flight fetch can
/// receive the same failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// Remote host unreachable, connection reset or timed out.
  #[error("network error: {0}")]
  Network(String),

  /// Remote answered with a non-success status.
  #[error("server returned {status} for {url}")]
  Server { status: u16, url: String },

  /// Remote has no record for the requested resource.
  #[error("{0} not found")]
  NotFound(String),

  /// The request could not be built (bad base URL, bad page index).
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// Payload did not match the expected shape.
  #[error("failed to decode response: {0}")]
  Decode(String),

  /// Local cache read or write failed.
  #[error("cache storage error: {0}")]
  Store(String),
}

impl SyncError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Network(_) | Self::Server { .. } | Self::NotFound(_) | Self::InvalidRequest(_) => {
        ErrorKind::Network
      }
      Self::Decode(_) => ErrorKind::Decode,
      Self::Store(_) => ErrorKind::Store,
    }
  }

  /// Whether the orchestrator may answer this failure with cached data.
  ///
  /// Store failures are never recoverable: serving memory that disagrees with
  /// disk would hide the failure.
  pub fn is_recoverable(&self) -> bool {
    self.kind() != ErrorKind::Store
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Store(e.to_string())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    if let Some(status) = e.status() {
      return Self::Server {
        status: status.as_u16(),
        url: e.url().map(|u| u.to_string()).unwrap_or_default(),
      };
    }
    if e.is_decode() {
      return Self::Decode(e.to_string());
    }
    if e.is_builder() {
      return Self::InvalidRequest(e.to_string());
    }
    Self::Network(e.to_string())
  }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_kind_mapping() {
    assert_eq!(SyncError::Network("timeout".into()).kind(), ErrorKind::Network);
    assert_eq!(
      SyncError::Server {
        status: 500,
        url: "https://example.test".into()
      }
      .kind(),
      ErrorKind::Network
    );
    assert_eq!(SyncError::NotFound("character 9".into()).kind(), ErrorKind::Network);
    assert_eq!(SyncError::Decode("eof".into()).kind(), ErrorKind::Decode);
    assert_eq!(SyncError::Store("disk full".into()).kind(), ErrorKind::Store);
  }

  #[test]
  fn test_store_errors_are_not_recoverable() {
    assert!(SyncError::Decode("bad".into()).is_recoverable());
    assert!(!SyncError::Store("locked".into()).is_recoverable());
  }

  #[test]
  fn test_display_messages() {
    let err = SyncError::Server {
      status: 503,
      url: "https://rickandmortyapi.com/api/episode?page=2".into(),
    };
    assert_eq!(
      err.to_string(),
      "server returned 503 for https://rickandmortyapi.com/api/episode?page=2"
    );
  }
}
