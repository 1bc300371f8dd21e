//! Paged KV cache storage.
//!
//! One `CacheEngine` per attention layer owns the key and value slabs.
//! Page allocation and eviction live with the scheduler; this module only
//! stores tokens at the slots it is told to and reads pages back.

mod cache_engine;
pub mod config;
mod error;

pub use cache_engine::CacheEngine;
pub use config::CacheConfig;
pub use error::CacheError;

/// Physical page (block) identifier inside a layer's cache.
pub type BlockId = usize;
