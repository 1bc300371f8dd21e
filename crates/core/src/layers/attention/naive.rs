//! Naive attention kernels using standard matrix operations.
//!
//! These are the reference implementations: they run on any device and back
//! both FlashInfer contracts (`PagedKernel` for prefill/decode against the
//! paged cache, `DenseVarlenKernel` for the no-cache path) without any native
//! library.

use candle_core::{Result as CandleResult, Tensor};

use super::backend::DenseVarlenKernel;
use super::error::{AttentionError, Result};
use super::flashinfer::{KernelPlan, PageIndex, PagedKernel, PlanStage, RunArgs};
use super::ops::{attend, AttendParams};
use crate::kv_cache::{BlockId, CacheEngine};

/// Host copy of what a plan scheduled.
#[derive(Debug, Clone)]
struct PlannedBatch {
    stage: PlanStage,
    pages: PageIndex,
    num_qo_heads: usize,
    head_dim: usize,
}

/// Paged prefill/decode by gathering each request's pages and running
/// per-request scaled dot-product attention.
#[derive(Debug, Default)]
pub struct NaivePagedKernel {
    planned: Option<PlannedBatch>,
}

impl NaivePagedKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_planned(&self) -> bool {
        self.planned.is_some()
    }
}

impl PagedKernel for NaivePagedKernel {
    fn name(&self) -> &'static str {
        "naive-paged"
    }

    fn begin_plan(&mut self, plan: &KernelPlan) -> Result<()> {
        if self.planned.is_some() {
            return Err(AttentionError::precondition(
                "naive-paged kernel already holds an active plan",
            ));
        }
        self.planned = Some(PlannedBatch {
            stage: plan.stage.clone(),
            pages: plan.pages.host().clone(),
            num_qo_heads: plan.num_qo_heads,
            head_dim: plan.head_dim,
        });
        Ok(())
    }

    fn end_plan(&mut self) {
        self.planned = None;
    }

    fn run(&mut self, query: &Tensor, cache: &CacheEngine, args: &RunArgs<'_>) -> Result<Tensor> {
        let planned = self
            .planned
            .as_ref()
            .ok_or_else(|| AttentionError::precondition("naive-paged kernel run without a plan"))?;
        let (num_tokens, num_heads, head_dim) = query.dims3()?;
        if num_heads != planned.num_qo_heads || head_dim != planned.head_dim {
            return Err(AttentionError::shape(format!(
                "query [{num_tokens}, {num_heads}, {head_dim}] does not match planned heads {} x {}",
                planned.num_qo_heads, planned.head_dim
            )));
        }

        let batch_size = planned.pages.batch_size();
        // (first query row, query rows) per request
        let segments: Vec<(usize, usize)> = match &planned.stage {
            PlanStage::Prefill { qo_indptr } => qo_indptr
                .windows(2)
                .map(|w| (w[0] as usize, (w[1] - w[0]) as usize))
                .collect(),
            PlanStage::Decode => (0..batch_size).map(|i| (i, 1)).collect(),
        };
        let covered = segments.last().map(|&(start, len)| start + len).unwrap_or(0);
        if covered > num_tokens {
            return Err(AttentionError::shape(format!(
                "plan covers {covered} query tokens but the batch has {num_tokens}"
            )));
        }

        let params = AttendParams {
            scale: args
                .sm_scale
                .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt()),
            causal: args.causal,
            soft_cap: args.logits_soft_cap,
            alibi_slopes: args.alibi_slopes,
        };

        let mut outputs = Vec::with_capacity(segments.len() + 1);
        for (request, &(start, len)) in segments.iter().enumerate() {
            if len == 0 {
                continue;
            }
            let kv_len = planned.pages.kv_len(request);
            if kv_len < len {
                return Err(AttentionError::shape(format!(
                    "request {request}: {len} query tokens but only {kv_len} cached tokens"
                )));
            }
            let block_ids: Vec<BlockId> = planned
                .pages
                .pages_for(request)
                .iter()
                .map(|&p| p as BlockId)
                .collect();
            let (k, v) = cache.read(&block_ids, kv_len)?;
            // [len, heads, dim] -> [1, heads, len, dim]
            let q = query.narrow(0, start, len)?.transpose(0, 1)?.unsqueeze(0)?;
            outputs.push(attend(&q, k, v, &params)?);
        }
        // rows past the plan are padding
        if covered < num_tokens {
            outputs.push(Tensor::zeros(
                (num_tokens - covered, num_heads, head_dim),
                query.dtype(),
                query.device(),
            )?);
        }
        if outputs.is_empty() {
            return Ok(query.zeros_like()?);
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }
}

/// Dense varlen attention, one sequence at a time.
///
/// Supports only unbounded windows; sliding windows are rejected upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveVarlenAttention;

impl NaiveVarlenAttention {
    pub fn new() -> Self {
        Self
    }
}

impl DenseVarlenKernel for NaiveVarlenAttention {
    fn name(&self) -> &'static str {
        "naive-varlen"
    }

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
    ) -> CandleResult<Tensor> {
        if window_size != (-1, -1) {
            candle_core::bail!("naive-varlen: window {window_size:?} is not supported");
        }
        if cu_seqlens_q.len() != cu_seqlens_k.len() || cu_seqlens_q.is_empty() {
            candle_core::bail!(
                "naive-varlen: cu_seqlens_q has {} entries, cu_seqlens_k has {}",
                cu_seqlens_q.len(),
                cu_seqlens_k.len()
            );
        }
        let (total_q, num_heads, head_dim) = q.dims3()?;
        let params = AttendParams {
            scale: softmax_scale,
            causal,
            soft_cap: None,
            alibi_slopes,
        };

        let mut outputs = Vec::with_capacity(cu_seqlens_q.len());
        for (q_range, k_range) in cu_seqlens_q.windows(2).zip(cu_seqlens_k.windows(2)) {
            if q_range[1] < q_range[0] || k_range[1] < k_range[0] {
                candle_core::bail!("naive-varlen: cumulative sequence lengths must be non-decreasing");
            }
            let (q_start, q_len) = (q_range[0] as usize, (q_range[1] - q_range[0]) as usize);
            let (k_start, k_len) = (k_range[0] as usize, (k_range[1] - k_range[0]) as usize);
            if q_len > max_seqlen_q || k_len > max_seqlen_k {
                candle_core::bail!(
                    "naive-varlen: sequence ({q_len}, {k_len}) exceeds max ({max_seqlen_q}, {max_seqlen_k})"
                );
            }
            if q_len == 0 {
                continue;
            }
            let q_i = q.narrow(0, q_start, q_len)?.transpose(0, 1)?.unsqueeze(0)?;
            let k_i = k.narrow(0, k_start, k_len)?.transpose(0, 1)?.unsqueeze(0)?;
            let v_i = v.narrow(0, k_start, k_len)?.transpose(0, 1)?.unsqueeze(0)?;
            outputs.push(attend(&q_i, k_i, v_i, &params)?);
        }

        let covered = *cu_seqlens_q.last().unwrap_or(&0) as usize;
        if covered < total_q {
            outputs.push(Tensor::zeros(
                (total_q - covered, num_heads, head_dim),
                q.dtype(),
                q.device(),
            )?);
        }
        if outputs.is_empty() {
            return q.zeros_like();
        }
        Tensor::cat(&outputs, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::CacheConfig;
    use crate::layers::attention::flashinfer::{DevicePageIndex, PosEncoding};
    use candle_core::{DType, Device};

    const HEADS: usize = 4;
    const KV_HEADS: usize = 2;
    const DIM: usize = 64;
    const PAGE: usize = 16;

    fn cache() -> CacheEngine {
        CacheEngine::new(&CacheConfig {
            block_size: PAGE,
            num_blocks: 8,
            num_kv_heads: KV_HEADS,
            head_dim: DIM,
            dtype: DType::F32,
            device: Device::Cpu,
        })
        .unwrap()
    }

    fn plan(stage: PlanStage, pages: PageIndex) -> KernelPlan {
        KernelPlan {
            stage,
            pages: DevicePageIndex::upload(&pages, &Device::Cpu).unwrap(),
            num_qo_heads: HEADS,
            num_kv_heads: KV_HEADS,
            head_dim: DIM,
            page_size: PAGE,
            data_type: DType::F32,
            pos_encoding: PosEncoding::None,
        }
    }

    fn run_args(causal: bool) -> RunArgs<'static> {
        RunArgs {
            sm_scale: None,
            logits_soft_cap: None,
            causal,
            alibi_slopes: None,
        }
    }

    fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
        assert_eq!(a.dims(), b.dims());
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        for (i, (x, y)) in a.iter().zip(&b).enumerate() {
            assert!((x - y).abs() < tol, "element {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_names() {
        assert_eq!(NaivePagedKernel::new().name(), "naive-paged");
        assert_eq!(NaiveVarlenAttention::new().name(), "naive-varlen");
    }

    #[test]
    fn test_paged_prefill_matches_dense() {
        let device = Device::Cpu;
        let mut cache = cache();
        // two requests: 5 tokens in page 1, 3 tokens in page 6
        let q = Tensor::randn(0f32, 1.0, (8, HEADS, DIM), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (8, KV_HEADS, DIM), &device).unwrap();
        let v = Tensor::randn(0f32, 1.0, (8, KV_HEADS, DIM), &device).unwrap();
        let slots: Vec<i64> = (16..21).chain(96..99).collect();
        cache.write_batch(&k, &v, &slots).unwrap();

        let pages = PageIndex::new(vec![1, 6], vec![0, 1, 2], vec![5, 3], PAGE).unwrap();
        let mut kernel = NaivePagedKernel::new();
        kernel
            .begin_plan(&plan(
                PlanStage::Prefill {
                    qo_indptr: vec![0, 5, 8],
                },
                pages,
            ))
            .unwrap();
        let paged = kernel.run(&q, &cache, &run_args(true)).unwrap();

        let cu = [0u32, 5, 8];
        let scale = 1.0 / (DIM as f32).sqrt();
        let dense = NaiveVarlenAttention
            .compute(&q, &k, &v, &cu, &cu, 5, 5, scale, true, (-1, -1), None)
            .unwrap();
        assert_close(&paged, &dense, 1e-5);
    }

    #[test]
    fn test_decode_single_cached_token_returns_its_value() {
        let device = Device::Cpu;
        let mut cache = cache();
        let k = Tensor::randn(0f32, 1.0, (1, KV_HEADS, DIM), &device).unwrap();
        let v = Tensor::randn(0f32, 1.0, (1, KV_HEADS, DIM), &device).unwrap();
        cache.write_batch(&k, &v, &[48]).unwrap();

        let mut kernel = NaivePagedKernel::new();
        let pages = PageIndex::new(vec![3], vec![0, 1], vec![1], PAGE).unwrap();
        kernel.begin_plan(&plan(PlanStage::Decode, pages)).unwrap();

        let q = Tensor::randn(0f32, 1.0, (1, HEADS, DIM), &device).unwrap();
        let out = kernel.run(&q, &cache, &run_args(false)).unwrap();

        // heads 0,1 read kv head 0; heads 2,3 read kv head 1
        let expected = v
            .squeeze(0)
            .unwrap()
            .unsqueeze(1)
            .unwrap()
            .repeat((1, 2, 1))
            .unwrap()
            .reshape((1, HEADS, DIM))
            .unwrap();
        assert_close(&out, &expected, 1e-5);
    }

    #[test]
    fn test_decode_pads_rows_past_batch() {
        let device = Device::Cpu;
        let cache = cache();
        let mut kernel = NaivePagedKernel::new();
        let pages = PageIndex::new(vec![0], vec![0, 1], vec![4], PAGE).unwrap();
        kernel.begin_plan(&plan(PlanStage::Decode, pages)).unwrap();

        let q = Tensor::ones((3, HEADS, DIM), DType::F32, &device).unwrap();
        let out = kernel.run(&q, &cache, &run_args(false)).unwrap();
        assert_eq!(out.dims(), &[3, HEADS, DIM]);
        let tail: f32 = out.narrow(0, 1, 2).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn test_run_requires_plan_and_rejects_second_plan() {
        let cache = cache();
        let mut kernel = NaivePagedKernel::new();
        let q = Tensor::zeros((1, HEADS, DIM), DType::F32, &Device::Cpu).unwrap();
        assert!(kernel.run(&q, &cache, &run_args(false)).is_err());

        let pages = PageIndex::new(vec![0], vec![0, 1], vec![1], PAGE).unwrap();
        kernel.begin_plan(&plan(PlanStage::Decode, pages.clone())).unwrap();
        assert!(kernel.is_planned());
        assert!(kernel.begin_plan(&plan(PlanStage::Decode, pages)).is_err());
        kernel.end_plan();
        assert!(!kernel.is_planned());
    }

    #[test]
    fn test_run_rejects_head_mismatch() {
        let cache = cache();
        let mut kernel = NaivePagedKernel::new();
        let pages = PageIndex::new(vec![0], vec![0, 1], vec![1], PAGE).unwrap();
        kernel.begin_plan(&plan(PlanStage::Decode, pages)).unwrap();
        let q = Tensor::zeros((1, HEADS * 2, DIM), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            kernel.run(&q, &cache, &run_args(false)),
            Err(AttentionError::Shape(_))
        ));
    }

    #[test]
    fn test_varlen_rejects_sliding_window() {
        let q = Tensor::zeros((2, HEADS, DIM), DType::F32, &Device::Cpu).unwrap();
        let k = Tensor::zeros((2, KV_HEADS, DIM), DType::F32, &Device::Cpu).unwrap();
        let cu = [0u32, 2];
        assert!(NaiveVarlenAttention
            .compute(&q, &k, &k, &cu, &cu, 2, 2, 1.0, true, (128, 0), None)
            .is_err());
    }

    #[test]
    fn test_varlen_sequences_are_independent() {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (6, HEADS, DIM), &device).unwrap();
        let k = Tensor::randn(0f32, 1.0, (6, KV_HEADS, DIM), &device).unwrap();
        let v = Tensor::randn(0f32, 1.0, (6, KV_HEADS, DIM), &device).unwrap();
        let cu = [0u32, 4, 6];
        let both = NaiveVarlenAttention
            .compute(&q, &k, &v, &cu, &cu, 4, 4, 0.125, true, (-1, -1), None)
            .unwrap();

        let second = NaiveVarlenAttention
            .compute(
                &q.narrow(0, 4, 2).unwrap(),
                &k.narrow(0, 4, 2).unwrap(),
                &v.narrow(0, 4, 2).unwrap(),
                &[0, 2],
                &[0, 2],
                2,
                2,
                0.125,
                true,
                (-1, -1),
                None,
            )
            .unwrap();
        assert_close(&both.narrow(0, 4, 2).unwrap(), &second, 1e-6);
    }
}
