//! FlashInfer attention layer.
//!
//! `FlashInferImpl::forward` routes each step to one of three paths:
//! - no KV cache attached (profiling): dense varlen attention over packed
//!   sequences, page index unused
//! - prefill with cache: paged prefill session
//! - decode with cache: paged decode session
//!
//! New keys and values are written to the cache before attention whenever a
//! cache is attached.
//!
//! # Module Structure
//! - `config`: Per-layer static configuration
//! - `metadata`: Per-step batch metadata, planning, broadcast form
//! - `page_index`: Ragged page table and its device residency
//! - `wrapper`: Kernel contract and two-phase sessions
//! - `tensor_bridge`: Shape and layout checks at the kernel boundary

pub mod config;
pub mod metadata;
pub mod page_index;
pub mod tensor_bridge;
pub mod wrapper;

pub use config::FlashInferConfig;
pub use metadata::{
    AttentionMetadata, AttentionMetadataBuilder, BatchShape, BroadcastMetadata, Stage,
};
pub use page_index::{DevicePageIndex, PageIndex, PageTable};
pub use wrapper::{
    KernelPlan, KernelSession, PagedKernel, PlanDescriptor, PlanGuard, PlanStage, PosEncoding,
    RunArgs, SessionState,
};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use super::backend::DenseVarlenKernel;
use super::error::{AttentionError, Result};
use super::naive::NaiveVarlenAttention;
use crate::kv_cache::CacheEngine;

/// Which attention a layer performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AttentionType {
    /// Causal self-attention over decoder tokens.
    #[default]
    Decoder,
    Encoder,
    EncoderOnly,
    EncoderDecoder,
}

/// Kernel path chosen for one forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardPath {
    DenseFallback,
    PagedPrefill,
    PagedDecode,
}

impl ForwardPath {
    pub fn select(stage: Stage, cache_attached: bool) -> Result<Self> {
        match (stage, cache_attached) {
            (Stage::Prefill, false) => Ok(Self::DenseFallback),
            (Stage::Prefill, true) => Ok(Self::PagedPrefill),
            (Stage::Decode, true) => Ok(Self::PagedDecode),
            (Stage::Decode, false) => Err(AttentionError::precondition(
                "decode requires an attached KV cache",
            )),
        }
    }
}

/// One attention layer backed by FlashInfer-style kernels.
pub struct FlashInferImpl {
    config: FlashInferConfig,
    scale: f32,
    dense_kernel: Box<dyn DenseVarlenKernel>,
}

impl FlashInferImpl {
    /// Layer using the reference dense kernel for the no-cache path.
    pub fn new(config: FlashInferConfig) -> Result<Self> {
        Self::with_dense_kernel(config, NaiveVarlenAttention::new())
    }

    pub fn with_dense_kernel(
        config: FlashInferConfig,
        dense_kernel: impl DenseVarlenKernel + 'static,
    ) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            num_heads = config.num_heads,
            num_kv_heads = config.num_kv_heads,
            head_size = config.head_size,
            dense_kernel = dense_kernel.name(),
            "flashinfer attention layer created"
        );
        Ok(Self {
            scale: config.softmax_scale(),
            config,
            dense_kernel: Box::new(dense_kernel),
        })
    }

    pub fn config(&self) -> &FlashInferConfig {
        &self.config
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn num_queries_per_kv(&self) -> usize {
        self.config.num_queries_per_kv()
    }

    fn hidden_size(&self) -> usize {
        self.config.num_heads * self.config.head_size
    }

    /// Attention forward for one layer.
    ///
    /// # Arguments
    /// * `query` - `[num_tokens, num_heads * head_size]`
    /// * `key`, `value` - `[num_tokens, num_kv_heads * head_size]`
    /// * `kv_cache` - `None` during profiling runs
    ///
    /// Returns `[num_tokens, num_heads * head_size]`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        kv_cache: Option<&mut CacheEngine>,
        metadata: &mut AttentionMetadata,
        attn_type: AttentionType,
    ) -> Result<Tensor> {
        if attn_type != AttentionType::Decoder {
            return Err(AttentionError::unsupported(format!(
                "{attn_type:?} attention is not implemented for FlashInferImpl; only decoder self-attention is"
            )));
        }

        let FlashInferConfig {
            num_heads,
            num_kv_heads,
            head_size,
            ..
        } = self.config;
        if metadata.num_qo_heads() != num_heads
            || metadata.num_kv_heads() != num_kv_heads
            || metadata.head_dim() != head_size
        {
            return Err(AttentionError::shape(format!(
                "metadata heads ({}, {}, {}) do not match layer ({num_heads}, {num_kv_heads}, {head_size})",
                metadata.num_qo_heads(),
                metadata.num_kv_heads(),
                metadata.head_dim()
            )));
        }

        let (num_tokens, hidden_size) = query.dims2()?;
        if hidden_size != self.hidden_size() || num_tokens != metadata.num_tokens() {
            return Err(AttentionError::shape(format!(
                "query [{num_tokens}, {hidden_size}] for {} tokens of hidden size {}",
                metadata.num_tokens(),
                self.hidden_size()
            )));
        }
        let query = query.reshape((num_tokens, num_heads, head_size))?;
        let key = key.reshape((num_tokens, num_kv_heads, head_size))?;
        let value = value.reshape((num_tokens, num_kv_heads, head_size))?;

        let path = ForwardPath::select(metadata.stage(), kv_cache.is_some())?;
        tracing::debug!(?path, num_tokens, "flashinfer forward");

        // write new K, V to the paged cache first
        let cache: Option<&CacheEngine> = match kv_cache {
            Some(cache) => {
                if metadata.slot_mapping().len() != num_tokens {
                    return Err(AttentionError::precondition(format!(
                        "KV cache attached but slot_mapping has {} entries for {num_tokens} tokens",
                        metadata.slot_mapping().len()
                    )));
                }
                tracing::trace!(
                    num_tokens,
                    num_slots = cache.num_slots(),
                    "writing kv to cache"
                );
                cache.write_batch(&key, &value, metadata.slot_mapping())?;
                Some(&*cache)
            }
            None => None,
        };

        let query = tensor_bridge::ensure_contiguous(&query)?;
        let alibi_slopes = self.alibi_slopes(query.device())?;

        let output = match (path, cache) {
            (ForwardPath::DenseFallback, _) => {
                self.dense_prefill(&query, &key, &value, metadata, alibi_slopes.as_ref())?
            }
            (ForwardPath::PagedPrefill | ForwardPath::PagedDecode, Some(cache)) => {
                let is_decode = path == ForwardPath::PagedDecode;
                tensor_bridge::verify_attention_shapes(
                    &query,
                    cache.k_cache(),
                    cache.v_cache(),
                    num_heads,
                    num_kv_heads,
                    head_size,
                    is_decode,
                )?;
                let args = RunArgs {
                    sm_scale: Some(self.scale),
                    logits_soft_cap: metadata.logits_soft_cap(),
                    causal: !is_decode,
                    alibi_slopes: alibi_slopes.as_ref(),
                };
                let mut guard = metadata.begin()?.ok_or_else(|| {
                    AttentionError::precondition(
                        "paged prefill needs page_indices, page_offsets and last_page_fill",
                    )
                })?;
                guard.compute(&query, cache, &args)?
            }
            (_, None) => {
                return Err(AttentionError::precondition(
                    "paged attention path without a KV cache",
                ))
            }
        };

        Ok(output.reshape((num_tokens, self.hidden_size()))?)
    }

    /// Dense causal attention over packed prefill sequences, no cache.
    fn dense_prefill(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        metadata: &AttentionMetadata,
        alibi_slopes: Option<&Tensor>,
    ) -> Result<Tensor> {
        if metadata.logits_soft_cap().is_some() {
            return Err(AttentionError::unsupported(
                "logits soft-cap is not supported without a KV cache",
            ));
        }
        let BatchShape::Prefill {
            seq_start_loc,
            max_prefill_seq_len,
            ..
        } = metadata.shape()
        else {
            return Err(AttentionError::precondition(
                "dense fallback is only valid for prefill batches",
            ));
        };
        Ok(self.dense_kernel.compute(
            query,
            &tensor_bridge::ensure_contiguous(key)?,
            &tensor_bridge::ensure_contiguous(value)?,
            seq_start_loc,
            seq_start_loc,
            *max_prefill_seq_len,
            *max_prefill_seq_len,
            self.scale,
            true,
            (-1, -1),
            alibi_slopes,
        )?)
    }

    fn alibi_slopes(&self, device: &Device) -> Result<Option<Tensor>> {
        self.config
            .alibi_slopes
            .as_ref()
            .map(|slopes| Tensor::from_vec(slopes.clone(), (slopes.len(),), device))
            .transpose()
            .map_err(AttentionError::from)
    }
}

impl std::fmt::Debug for FlashInferImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashInferImpl")
            .field("config", &self.config)
            .field("scale", &self.scale)
            .field("dense_kernel", &self.dense_kernel.name())
            .finish()
    }
}
