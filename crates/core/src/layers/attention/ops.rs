//! Common attention operations shared by the reference kernels.

use candle_core::{DType, Device, Result, Tensor};

/// Repeat KV heads for Grouped Query Attention.
///
/// # Arguments
/// * `x` - Input tensor `[batch, num_kv_heads, seq_len, head_dim]`
/// * `num_kv_groups` - Number of times to repeat each KV head (num_heads / num_kv_heads)
///
/// # Returns
/// Tensor with shape `[batch, num_heads, seq_len, head_dim]`
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}

/// Additive causal mask `[q_len, kv_len]` for queries placed at absolute
/// positions `offset..offset + q_len`: query `i` sees keys `0..=offset + i`.
pub fn causal_mask(q_len: usize, kv_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..kv_len).map(move |j| {
                if j <= offset + i {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (q_len, kv_len), device)
}

/// Soft-cap logits: `cap * tanh(x / cap)`.
pub fn apply_soft_cap(scores: &Tensor, cap: f32) -> Result<Tensor> {
    let cap = cap as f64;
    (scores / cap)?.tanh()? * cap
}

/// ALiBi bias `[num_heads, q_len, kv_len]`: `slope_h * (j - (offset + i))`.
pub fn alibi_bias(slopes: &Tensor, q_len: usize, kv_len: usize, offset: usize) -> Result<Tensor> {
    let num_heads = slopes.dim(0)?;
    let distances: Vec<f32> = (0..q_len)
        .flat_map(|i| (0..kv_len).map(move |j| j as f32 - (offset + i) as f32))
        .collect();
    let distances = Tensor::from_vec(distances, (1, q_len, kv_len), slopes.device())?;
    slopes
        .to_dtype(DType::F32)?
        .reshape((num_heads, 1, 1))?
        .broadcast_mul(&distances)
}

/// Score modifiers for `attend`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttendParams<'a> {
    pub scale: f32,
    pub causal: bool,
    pub soft_cap: Option<f32>,
    pub alibi_slopes: Option<&'a Tensor>,
}

/// Attention for a single request.
///
/// `q` is `[1, num_heads, q_len, head_dim]`, `k`/`v` are
/// `[1, num_kv_heads, kv_len, head_dim]` with `kv_len >= q_len`. The queries
/// are the last `q_len` positions of the sequence. Math runs in F32.
///
/// Returns `[q_len, num_heads, head_dim]` in the dtype of `q`.
pub(crate) fn attend(q: &Tensor, k: Tensor, v: Tensor, params: &AttendParams<'_>) -> Result<Tensor> {
    let (_, num_heads, q_len, _) = q.dims4()?;
    let (_, num_kv_heads, kv_len, _) = k.dims4()?;
    if kv_len < q_len {
        candle_core::bail!("attend: kv_len {kv_len} shorter than q_len {q_len}");
    }
    let offset = kv_len - q_len;
    let out_dtype = q.dtype();
    let device = q.device();

    let q = q.to_dtype(DType::F32)?.contiguous()?;
    let k = repeat_kv(k.to_dtype(DType::F32)?, num_heads / num_kv_heads)?.contiguous()?;
    let v = repeat_kv(v.to_dtype(DType::F32)?, num_heads / num_kv_heads)?.contiguous()?;

    let mut scores = (q.matmul(&k.t()?)? * params.scale as f64)?;
    if let Some(cap) = params.soft_cap {
        scores = apply_soft_cap(&scores, cap)?;
    }
    if let Some(slopes) = params.alibi_slopes {
        let bias = alibi_bias(slopes, q_len, kv_len, offset)?.to_device(device)?;
        scores = scores.broadcast_add(&bias.unsqueeze(0)?)?;
    }
    if params.causal && q_len > 1 {
        let mask = causal_mask(q_len, kv_len, offset, device)?;
        scores = scores.broadcast_add(&mask)?;
    }

    let probs = candle_nn::ops::softmax_last_dim(&scores)?;
    probs
        .matmul(&v)?
        .squeeze(0)?
        .transpose(0, 1)?
        .contiguous()?
        .to_dtype(out_dtype)
}
