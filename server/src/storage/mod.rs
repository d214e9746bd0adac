pub mod cache_store;
pub mod keys;

pub use cache_store::{CacheError, CacheStore, CachedResponse};
