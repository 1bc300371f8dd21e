//! Backend contracts for the FlashInfer attention layer.
//!
//! `FlashInferBackend` answers the static questions the model runner asks a
//! backend (supported head sizes, cache shape, block operations).
//! `DenseVarlenKernel` is the pluggable dense variable-length kernel used
//! when no KV cache is attached.

use candle_core::{Result as CandleResult, Tensor};

use super::error::{AttentionError, Result};
use crate::kv_cache::{BlockId, CacheEngine};

const SUPPORTED_HEAD_SIZES: [usize; 3] = [64, 128, 256];

/// Dense attention over sequences packed back to back.
///
/// Sequence `i` owns query rows `cu_seqlens_q[i]..cu_seqlens_q[i + 1]` and key
/// rows `cu_seqlens_k[i]..cu_seqlens_k[i + 1]`. Queries are aligned to the end
/// of their keys when `causal` is set.
pub trait DenseVarlenKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Arguments
    /// * `q` - `[total_q, num_heads, head_dim]`
    /// * `k`, `v` - `[total_k, num_kv_heads, head_dim]`
    /// * `window_size` - `(left, right)`; `(-1, -1)` means unbounded
    /// * `alibi_slopes` - `[num_heads]`
    ///
    /// Returns `[total_q, num_heads, head_dim]`.
    #[allow(clippy::too_many_arguments)]
    fn compute(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cu_seqlens_q: &[u32],
        cu_seqlens_k: &[u32],
        max_seqlen_q: usize,
        max_seqlen_k: usize,
        softmax_scale: f32,
        causal: bool,
        window_size: (i32, i32),
        alibi_slopes: Option<&Tensor>,
    ) -> CandleResult<Tensor>;
}

/// Static description of the FlashInfer backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashInferBackend;

impl FlashInferBackend {
    pub const NAME: &'static str = "flashinfer";

    pub fn name() -> &'static str {
        Self::NAME
    }

    pub fn supported_head_sizes() -> &'static [usize] {
        &SUPPORTED_HEAD_SIZES
    }

    pub fn is_supported_head_size(head_size: usize) -> bool {
        SUPPORTED_HEAD_SIZES.contains(&head_size)
    }

    /// Combined KV cache shape:
    /// `(num_blocks, 2, block_size, num_kv_heads, head_size)`.
    ///
    /// `CacheEngine::from_combined` splits a tensor of this shape.
    pub fn kv_cache_shape(
        num_blocks: usize,
        block_size: usize,
        num_kv_heads: usize,
        head_size: usize,
    ) -> (usize, usize, usize, usize, usize) {
        (num_blocks, 2, block_size, num_kv_heads, head_size)
    }

    /// Swapping blocks between caches is not implemented for this backend.
    pub fn swap_blocks(
        _src: &CacheEngine,
        _dst: &mut CacheEngine,
        _src_to_dst: &[(BlockId, BlockId)],
    ) -> Result<()> {
        Err(AttentionError::unsupported("swap_blocks is not implemented for FlashInfer"))
    }

    /// Copying blocks within caches is not implemented for this backend.
    pub fn copy_blocks(_caches: &mut [CacheEngine], _src_to_dsts: &[(BlockId, BlockId)]) -> Result<()> {
        Err(AttentionError::unsupported("copy_blocks is not implemented for FlashInfer"))
    }
}
