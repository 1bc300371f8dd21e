//! Error taxonomy for attention dispatch.

use thiserror::Error;

use crate::kv_cache::CacheError;

/// Errors raised by the FlashInfer attention layer.
///
/// None of these are retried here; retry policy belongs to the serving loop.
#[derive(Error, Debug)]
pub enum AttentionError {
    /// Static configuration this backend cannot run (unsupported head size,
    /// sliding window, non-unit KV scales). Fatal to the layer instance.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Attention mode this backend never implements.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Prefill and decode tokens in the same call (chunked prefill), or an
    /// empty batch. Indicates a scheduling bug upstream.
    #[error(
        "unsupported batch shape: {num_prefill_tokens} prefill and {num_decode_tokens} decode tokens; \
         exactly one must be nonzero"
    )]
    UnsupportedBatchShape {
        num_prefill_tokens: usize,
        num_decode_tokens: usize,
    },

    /// Kernel session or metadata used out of lifecycle order.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    /// Tensor shapes disagree with the configured head layout.
    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, AttentionError>;

impl AttentionError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation(message.into())
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionViolation(message.into())
    }

    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }

    /// True for errors that signal a bug in the caller (bad batch mix or
    /// lifecycle misuse) rather than an unsupported configuration. Callers
    /// should abort on these instead of degrading.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedBatchShape { .. } | Self::PreconditionViolation(_)
        )
    }
}
