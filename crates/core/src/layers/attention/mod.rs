//! Attention dispatch for paged KV caches.
//!
//! This module provides:
//! - `FlashInferImpl`: per-layer attention routing between a dense no-cache
//!   path and paged prefill/decode kernel sessions
//! - `AttentionMetadata`: per-step batch description shared by all layers
//! - Reference kernels (`NaivePagedKernel`, `NaiveVarlenAttention`)
//! - Common attention operations (repeat_kv, causal_mask, soft-cap, ALiBi)
//!
//! # Example
//!
//! ```ignore
//! use vllm_flashinfer::layers::attention::{
//!     AttentionMetadata, AttentionType, FlashInferConfig, FlashInferImpl, KernelSession,
//!     NaivePagedKernel, PageIndex,
//! };
//!
//! let layer = FlashInferImpl::new(FlashInferConfig::new(32, 8, 128))?;
//! let pages = PageIndex::from_block_tables(&[&[2, 5], &[7]], &[19, 9], 16)?;
//! let mut metadata = AttentionMetadata::builder(32, 8, 128, 16)
//!     .decode_tokens(2)
//!     .page_table(pages)
//!     .slot_mapping(vec![82, 120])
//!     .decode_session(KernelSession::new(NaivePagedKernel::new()))
//!     .build()?;
//! let out = layer.forward(&q, &k, &v, Some(&mut cache), &mut metadata, AttentionType::Decoder)?;
//! ```

mod backend;
mod error;
pub mod flashinfer;
pub mod naive;
mod ops;

pub use backend::{DenseVarlenKernel, FlashInferBackend};
pub use error::{AttentionError, Result};
pub use ops::{alibi_bias, apply_soft_cap, causal_mask, repeat_kv};

pub use flashinfer::{
    AttentionMetadata, AttentionMetadataBuilder, AttentionType, BatchShape, BroadcastMetadata,
    DevicePageIndex, FlashInferConfig, FlashInferImpl, ForwardPath, KernelPlan, KernelSession,
    PageIndex, PageTable, PagedKernel, PlanDescriptor, PlanGuard, PlanStage, PosEncoding, RunArgs,
    SessionState, Stage,
};
pub use naive::{NaivePagedKernel, NaiveVarlenAttention};
