//! Page cursor bookkeeping for paginated remote collections.

use chrono::{DateTime, Utc};

use super::storage::SyncMetadata;

/// Records per page served by the remote API.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Pagination facts carried by one successful page response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
  /// 1-based index of the page this response carries
  pub page: u32,
  /// Total records in the remote collection
  pub total_count: u32,
  /// Total pages in the remote collection
  pub total_pages: u32,
  /// Whether the remote advertised a following page
  pub has_next: bool,
  /// Page index read from the remote's "next" cursor, if it had one
  pub next_page: Option<u32>,
}

/// One decoded page of records plus its pagination facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
  pub records: Vec<T>,
  pub info: PageInfo,
}

/// Next page index derived from how many records are already held.
///
/// Only meaningful when every committed page was full.
pub fn page_from_count(loaded_count: usize, page_size: u32) -> u32 {
  let page_size = page_size.max(1) as usize;
  (loaded_count / page_size) as u32 + 1
}

/// Tracks how far through a paginated remote collection we are.
///
/// `current_page` reads 1 before anything has been fetched; `has_fetched`
/// tells that state apart from "page 1 committed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationTracker {
  page_size: u32,
  last_page: Option<u32>,
  next_cursor: Option<u32>,
  has_more: bool,
  remote_total_count: u32,
}

impl Default for PaginationTracker {
  fn default() -> Self {
    Self::new(DEFAULT_PAGE_SIZE)
  }
}

impl PaginationTracker {
  pub fn new(page_size: u32) -> Self {
    Self {
      page_size: page_size.max(1),
      last_page: None,
      next_cursor: None,
      has_more: false,
      remote_total_count: 0,
    }
  }

  /// Rebuild from persisted metadata.
  ///
  /// Metadata written before any page committed restores to the initial state.
  pub fn from_metadata(page_size: u32, metadata: &SyncMetadata) -> Self {
    let mut tracker = Self::new(page_size);
    if let Some(page) = metadata.current_page {
      tracker.last_page = Some(page);
      tracker.next_cursor = metadata.next_page;
      tracker.has_more = metadata.has_more.unwrap_or(metadata.next_page.is_some());
      tracker.remote_total_count = metadata.remote_total_count.unwrap_or(0);
    }
    tracker
  }

  /// Metadata to persist alongside the page that was just committed.
  pub fn to_metadata(&self, fetched_at: DateTime<Utc>) -> SyncMetadata {
    SyncMetadata {
      last_fetched_at: Some(fetched_at),
      remote_total_count: Some(self.remote_total_count),
      current_page: self.last_page,
      has_more: Some(self.has_more),
      next_page: self.next_cursor,
    }
  }

  pub fn current_page(&self) -> u32 {
    self.last_page.unwrap_or(1)
  }

  pub fn has_fetched(&self) -> bool {
    self.last_page.is_some()
  }

  pub fn has_more(&self) -> bool {
    self.has_more
  }

  pub fn remote_total_count(&self) -> u32 {
    self.remote_total_count
  }

  pub fn page_size(&self) -> u32 {
    self.page_size
  }

  /// Whether `page` is the one page that may be committed next.
  ///
  /// Page 1 is always acceptable since committing it restarts the collection.
  pub fn accepts(&self, page: u32) -> bool {
    page == 1 || self.last_page.map(|last| last + 1) == Some(page)
  }

  /// Record a successful page response.
  pub fn apply(&mut self, info: &PageInfo) {
    self.last_page = Some(info.page);
    self.remote_total_count = info.total_count;
    self.has_more = info.has_next;
    self.next_cursor = info.next_page;
  }

  /// Forget everything; the next fetch is page 1.
  pub fn reset(&mut self) {
    *self = Self::new(self.page_size);
  }

  /// Index of the page to request next, or `None` when the remote is exhausted.
  ///
  /// The server cursor is authoritative. Without it the index is derived from
  /// `loaded_count`, which assumes every page so far was full.
  pub fn next_page(&self, loaded_count: usize) -> Option<u32> {
    if !self.has_fetched() {
      return Some(1);
    }
    if !self.has_more {
      return None;
    }
    Some(
      self
        .next_cursor
        .unwrap_or_else(|| page_from_count(loaded_count, self.page_size)),
    )
  }
}
