//! Rick and Morty API: domain types, wire types, client and cached facade.

pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod types;

pub use cached_client::CachedRickAndMorty;
pub use client::{RemoteFetcher, RickAndMortyClient};
pub use types::{Character, Episode};
