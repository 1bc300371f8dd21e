use candle_core::{DType, Device};

/// Geometry of one layer's paged KV cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_blocks: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub dtype: DType,
    pub device: Device,
}
