//! Static per-layer configuration of the FlashInfer attention implementation.

use serde::{Deserialize, Serialize};

use crate::layers::attention::backend::FlashInferBackend;
use crate::layers::attention::error::{AttentionError, Result};

fn default_kv_cache_dtype() -> String {
    "auto".to_string()
}

fn unit_scale() -> f32 {
    1.0
}

/// Layer-level attention configuration.
///
/// Loadable from JSON; omitted optional fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashInferConfig {
    /// Number of query/output heads.
    pub num_heads: usize,
    pub head_size: usize,
    pub num_kv_heads: usize,
    /// Softmax scale; `None` means `1 / sqrt(head_size)`.
    #[serde(default)]
    pub scale: Option<f32>,
    /// One ALiBi slope per query head.
    #[serde(default)]
    pub alibi_slopes: Option<Vec<f32>>,
    #[serde(default)]
    pub sliding_window: Option<usize>,
    #[serde(default = "default_kv_cache_dtype")]
    pub kv_cache_dtype: String,
    #[serde(default = "unit_scale")]
    pub k_scale: f32,
    #[serde(default = "unit_scale")]
    pub v_scale: f32,
}

impl FlashInferConfig {
    pub fn new(num_heads: usize, num_kv_heads: usize, head_size: usize) -> Self {
        Self {
            num_heads,
            head_size,
            num_kv_heads,
            scale: None,
            alibi_slopes: None,
            sliding_window: None,
            kv_cache_dtype: default_kv_cache_dtype(),
            k_scale: 1.0,
            v_scale: 1.0,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_alibi_slopes(mut self, slopes: Vec<f32>) -> Self {
        self.alibi_slopes = Some(slopes);
        self
    }

    pub fn with_sliding_window(mut self, window: Option<usize>) -> Self {
        self.sliding_window = window;
        self
    }

    pub fn with_kv_cache_dtype(mut self, dtype: impl Into<String>) -> Self {
        self.kv_cache_dtype = dtype.into();
        self
    }

    pub fn with_kv_scales(mut self, k_scale: f32, v_scale: f32) -> Self {
        self.k_scale = k_scale;
        self.v_scale = v_scale;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| AttentionError::configuration(format!("invalid attention config: {e}")))
    }

    pub fn softmax_scale(&self) -> f32 {
        self.scale
            .unwrap_or_else(|| 1.0 / (self.head_size as f32).sqrt())
    }

    pub fn num_queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    pub fn validate(&self) -> Result<()> {
        if !FlashInferBackend::is_supported_head_size(self.head_size) {
            return Err(AttentionError::configuration(format!(
                "Only {:?} are supported for head_dim, received {}",
                FlashInferBackend::supported_head_sizes(),
                self.head_size
            )));
        }
        if self.num_heads == 0 || self.num_kv_heads == 0 {
            return Err(AttentionError::configuration(
                "num_heads and num_kv_heads must be positive",
            ));
        }
        if self.num_heads % self.num_kv_heads != 0 {
            return Err(AttentionError::configuration(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            )));
        }
        if self.sliding_window.is_some() {
            return Err(AttentionError::configuration(
                "Sliding window is not supported in FlashInfer.",
            ));
        }
        if self.k_scale != 1.0 || self.v_scale != 1.0 {
            return Err(AttentionError::configuration(format!(
                "k_scale/v_scale ({}, {}) other than 1.0 are not supported in FlashInfer.",
                self.k_scale, self.v_scale
            )));
        }
        if self.kv_cache_dtype != "auto" {
            return Err(AttentionError::configuration(format!(
                "quantized kv cache dtype {:?} is not supported in FlashInfer.",
                self.kv_cache_dtype
            )));
        }
        if let Some(scale) = self.scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(AttentionError::configuration(format!(
                    "softmax scale must be positive and finite, got {scale}"
                )));
            }
        }
        if let Some(slopes) = &self.alibi_slopes {
            if slopes.len() != self.num_heads {
                return Err(AttentionError::configuration(format!(
                    "{} alibi slopes for {} heads",
                    slopes.len(),
                    self.num_heads
                )));
            }
        }
        Ok(())
    }
}
