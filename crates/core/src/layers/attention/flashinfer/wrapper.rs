//! Two-phase kernel sessions for FlashInfer batch prefill/decode.
//!
//! FlashInfer's paged handlers are stateful: a plan is built from the batch's
//! page table (`begin_plan`), consumed by kernel launches (`run`) and torn
//! down (`end_plan`). `KernelSession` owns one such kernel object and keeps
//! the ordering honest: at most one active plan, no `run` without a plan,
//! and teardown on every exit path when used through `PlanGuard`.

use std::fmt;

use candle_core::{DType, Tensor};

use super::page_index::{DevicePageIndex, PageIndex};
use crate::kv_cache::CacheEngine;
use crate::layers::attention::error::{AttentionError, Result};

/// Positional encoding applied inside the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PosEncoding {
    /// Positions were already encoded by the caller (rotary applied to q/k).
    #[default]
    None,
}

/// Per-stage scheduling input of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStage {
    /// Query tokens of request `i` are `qo_indptr[i]..qo_indptr[i + 1]`.
    Prefill { qo_indptr: Vec<u32> },
    /// One query token per request, in batch order.
    Decode,
}

/// Everything a paged kernel needs to schedule one batch.
#[derive(Debug, Clone)]
pub struct KernelPlan {
    pub stage: PlanStage,
    pub pages: DevicePageIndex,
    pub num_qo_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub page_size: usize,
    pub data_type: DType,
    pub pos_encoding: PosEncoding,
}

/// Host-side, comparable summary of a `KernelPlan`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDescriptor {
    pub stage: PlanStage,
    pub pages: PageIndex,
    pub num_qo_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub page_size: usize,
    pub data_type: DType,
    pub pos_encoding: PosEncoding,
}

impl KernelPlan {
    pub fn batch_size(&self) -> usize {
        self.pages.host().batch_size()
    }

    pub fn descriptor(&self) -> PlanDescriptor {
        PlanDescriptor {
            stage: self.stage.clone(),
            pages: self.pages.host().clone(),
            num_qo_heads: self.num_qo_heads,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            page_size: self.page_size,
            data_type: self.data_type,
            pos_encoding: self.pos_encoding,
        }
    }

    /// Check the plan is internally consistent before handing it to a kernel.
    pub fn validate(&self) -> Result<()> {
        if self.num_kv_heads == 0 || self.num_qo_heads % self.num_kv_heads != 0 {
            return Err(AttentionError::configuration(format!(
                "num_qo_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_qo_heads, self.num_kv_heads
            )));
        }
        if self.page_size != self.pages.host().page_size() {
            return Err(AttentionError::configuration(format!(
                "plan page_size {} does not match page index page_size {}",
                self.page_size,
                self.pages.host().page_size()
            )));
        }
        if let PlanStage::Prefill { qo_indptr } = &self.stage {
            let batch_size = self.batch_size();
            if qo_indptr.len() != batch_size + 1 {
                return Err(AttentionError::shape(format!(
                    "qo_indptr has {} entries for a batch of {batch_size}",
                    qo_indptr.len()
                )));
            }
            if qo_indptr.first() != Some(&0) || qo_indptr.windows(2).any(|w| w[0] > w[1]) {
                return Err(AttentionError::shape(
                    "qo_indptr must start at 0 and be non-decreasing",
                ));
            }
        }
        Ok(())
    }
}

/// Per-launch arguments of a planned kernel.
#[derive(Debug, Clone, Copy)]
pub struct RunArgs<'a> {
    /// Softmax scale; `None` means `1 / sqrt(head_dim)`.
    pub sm_scale: Option<f32>,
    /// Logits are clamped to `cap * tanh(x / cap)` when set.
    pub logits_soft_cap: Option<f32>,
    pub causal: bool,
    /// One slope per query head.
    pub alibi_slopes: Option<&'a Tensor>,
}

/// Stateful paged-attention kernel object (prefill or decode handler).
pub trait PagedKernel: Send {
    fn name(&self) -> &'static str;

    /// Build the kernel's internal per-request schedule.
    fn begin_plan(&mut self, plan: &KernelPlan) -> Result<()>;

    /// Release the schedule built by `begin_plan`.
    fn end_plan(&mut self);

    /// Launch attention for `query` `[tokens, num_qo_heads, head_dim]` against
    /// the paged cache. Returns `[tokens, num_qo_heads, head_dim]`.
    fn run(&mut self, query: &Tensor, cache: &CacheEngine, args: &RunArgs<'_>) -> Result<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Planned,
}

/// Owned handle to one paged kernel object and its current plan.
///
/// Holds live native state: it is neither `Clone` nor serializable and is
/// never part of broadcast metadata.
pub struct KernelSession {
    kernel: Box<dyn PagedKernel>,
    plan: Option<KernelPlan>,
    capture_buffers: Option<DevicePageIndex>,
}

impl KernelSession {
    pub fn new(kernel: impl PagedKernel + 'static) -> Self {
        Self {
            kernel: Box::new(kernel),
            plan: None,
            capture_buffers: None,
        }
    }

    /// Bind persistent page buffers for graph capture/replay. Capture-mode
    /// decode calls that carry no page arrays plan against these.
    pub fn with_capture_buffers(mut self, buffers: DevicePageIndex) -> Self {
        self.capture_buffers = Some(buffers);
        self
    }

    pub fn capture_buffers(&self) -> Option<&DevicePageIndex> {
        self.capture_buffers.as_ref()
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    pub fn state(&self) -> SessionState {
        if self.plan.is_some() {
            SessionState::Planned
        } else {
            SessionState::Idle
        }
    }

    pub fn plan(&self) -> Option<&KernelPlan> {
        self.plan.as_ref()
    }

    /// Plan the kernel for a new batch, tearing down any previous plan first.
    ///
    /// On failure the session is left `Idle`.
    pub fn begin(&mut self, plan: KernelPlan) -> Result<()> {
        self.end();
        plan.validate()?;
        self.kernel.begin_plan(&plan)?;
        self.plan = Some(plan);
        Ok(())
    }

    /// Release the current plan. No-op when already `Idle`.
    pub fn end(&mut self) {
        if self.plan.take().is_some() {
            self.kernel.end_plan();
        }
    }

    /// Run the planned kernel. Requires `Planned`.
    pub fn compute(
        &mut self,
        query: &Tensor,
        cache: &CacheEngine,
        args: &RunArgs<'_>,
    ) -> Result<Tensor> {
        if self.plan.is_none() {
            return Err(AttentionError::precondition(format!(
                "compute called on idle {} session; call begin first",
                self.kernel.name()
            )));
        }
        self.kernel.run(query, cache, args)
    }

    /// Plan the kernel and return a guard that ends the plan when dropped.
    pub fn scoped(&mut self, plan: KernelPlan) -> Result<PlanGuard<'_>> {
        self.begin(plan)?;
        Ok(PlanGuard { session: self })
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        self.end();
    }
}

impl fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelSession")
            .field("kernel", &self.kernel.name())
            .field("state", &self.state())
            .field("capture_buffers", &self.capture_buffers.is_some())
            .finish()
    }
}

/// A planned session; the plan is released when the guard goes out of scope.
pub struct PlanGuard<'a> {
    session: &'a mut KernelSession,
}

impl PlanGuard<'_> {
    pub fn plan(&self) -> &KernelPlan {
        // set by `scoped` and only cleared by this guard's drop
        match &self.session.plan {
            Some(plan) => plan,
            None => unreachable!("plan guard outlived its plan"),
        }
    }

    pub fn compute(
        &mut self,
        query: &Tensor,
        cache: &CacheEngine,
        args: &RunArgs<'_>,
    ) -> Result<Tensor> {
        self.session.compute(query, cache, args)
    }
}

impl Drop for PlanGuard<'_> {
    fn drop(&mut self) {
        self.session.end();
    }
}
