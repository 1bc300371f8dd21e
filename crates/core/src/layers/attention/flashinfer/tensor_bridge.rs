//! Tensor checks at the boundary between the dispatcher and the kernels.

use candle_core::Tensor;

use crate::layers::attention::error::{AttentionError, Result};

/// Kernels read raw strides as packed rows; hand them contiguous tensors.
pub fn ensure_contiguous(tensor: &Tensor) -> Result<Tensor> {
    if tensor.is_contiguous() {
        Ok(tensor.clone())
    } else {
        Ok(tensor.contiguous()?)
    }
}

/// Verify query `[tokens, num_qo_heads, head_dim]` against the NHD cache
/// slabs `[num_blocks, block_size, num_kv_heads, head_dim]`.
pub fn verify_attention_shapes(
    q: &Tensor,
    k_cache: &Tensor,
    v_cache: &Tensor,
    num_qo_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    is_decode: bool,
) -> Result<()> {
    let q_dims = q.dims();
    if q_dims.len() != 3 {
        return Err(AttentionError::shape(format!(
            "Q must be 3D, got {}D",
            q_dims.len()
        )));
    }
    if q_dims[1] != num_qo_heads {
        return Err(AttentionError::shape(format!(
            "Q num_heads mismatch: expected {}, got {}",
            num_qo_heads, q_dims[1]
        )));
    }
    if q_dims[2] != head_dim {
        return Err(AttentionError::shape(format!(
            "Q head_dim mismatch: expected {}, got {}",
            head_dim, q_dims[2]
        )));
    }

    for (name, dims) in [("K", k_cache.dims()), ("V", v_cache.dims())] {
        if dims.len() != 4 {
            return Err(AttentionError::shape(format!(
                "{name} cache must be 4D, got {}D",
                dims.len()
            )));
        }
        if dims[2] != num_kv_heads {
            return Err(AttentionError::shape(format!(
                "{name} cache num_kv_heads mismatch: expected {}, got {}",
                num_kv_heads, dims[2]
            )));
        }
        if dims[3] != head_dim {
            return Err(AttentionError::shape(format!(
                "{name} cache head_dim mismatch: expected {}, got {}",
                head_dim, dims[3]
            )));
        }
    }

    if is_decode && q_dims[0] == 0 {
        return Err(AttentionError::shape("Empty batch for decode attention"));
    }

    Ok(())
}
