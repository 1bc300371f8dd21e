//! Paged-KV-cache attention dispatch in the style of vLLM's FlashInfer
//! backend, built on candle.

pub mod kv_cache;
pub mod layers;

pub use kv_cache::{CacheConfig, CacheEngine, CacheError};
pub use layers::attention::{AttentionError, AttentionMetadata, AttentionType, FlashInferImpl};
