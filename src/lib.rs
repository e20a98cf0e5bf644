//! Local cache and remote sync engine for the Rick and Morty API.
//!
//! Episodes are synced as one paginated collection, characters as
//! individually keyed entities. Both are persisted to SQLite, refreshed
//! after a fixed max age and served from the cache when the network is
//! unavailable.

pub mod cache;
pub mod config;
pub mod error;
pub mod rickmorty;
pub mod sync;
