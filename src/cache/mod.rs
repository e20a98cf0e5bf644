//! Generic caching layer for data persistence and offline support.
//!
//! This module provides an API-agnostic caching mechanism that:
//! - Caches entities by stable integer id, one kind per collection
//! - Keeps sync bookkeeping in a separate key-value area
//! - Decides freshness with a fixed max-age policy
//! - Collapses duplicate concurrent fetches per key
//! - Tracks pagination progress across restarts

pub mod pagination;
pub mod policy;
pub mod single_flight;
pub mod storage;
mod traits;

pub use pagination::{Page, PageInfo, PaginationTracker};
pub use policy::{Clock, ManualClock, StalenessPolicy, SystemClock};
pub use single_flight::SingleFlight;
pub use storage::{CacheStorage, SqliteStorage, SyncMetadata, WriteBatch};
pub use traits::{CacheSource, Cacheable};
