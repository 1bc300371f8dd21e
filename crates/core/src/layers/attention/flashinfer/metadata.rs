//! Per-step attention metadata for the FlashInfer dispatcher.
//!
//! Built once per forward step by the model runner and shared by every
//! attention layer of that step. A batch is either pure prefill or pure
//! decode; which one decides the kernel path and which `KernelSession` gets
//! planned.

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use super::page_index::{PageIndex, PageTable};
use super::wrapper::{KernelPlan, KernelSession, PlanGuard, PlanStage, PosEncoding};
use crate::layers::attention::backend::FlashInferBackend;
use crate::layers::attention::error::{AttentionError, Result};

/// Which phase a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Prefill,
    Decode,
}

impl Stage {
    /// Classify a batch by its token counts. Exactly one must be nonzero.
    pub fn classify(num_prefill_tokens: usize, num_decode_tokens: usize) -> Result<Self> {
        match (num_prefill_tokens, num_decode_tokens) {
            (p, 0) if p > 0 => Ok(Self::Prefill),
            (0, d) if d > 0 => Ok(Self::Decode),
            _ => Err(AttentionError::UnsupportedBatchShape {
                num_prefill_tokens,
                num_decode_tokens,
            }),
        }
    }
}

/// Token layout of a single-stage batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchShape {
    Prefill {
        num_prefills: usize,
        num_prefill_tokens: usize,
        max_prefill_seq_len: usize,
        /// Cumulative full sequence lengths `[num_prefills + 1]`.
        seq_start_loc: Vec<u32>,
        /// Cumulative query lengths `[num_prefills + 1]`.
        query_start_loc: Vec<u32>,
    },
    Decode {
        num_decode_tokens: usize,
    },
}

fn cumulative(lengths: &[usize]) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(lengths.len() + 1);
    out.push(0u32);
    let mut total = 0u32;
    for &len in lengths {
        total = u32::try_from(len)
            .ok()
            .and_then(|len| total.checked_add(len))
            .ok_or_else(|| {
                AttentionError::shape(format!("cumulative length overflows u32 at {len}"))
            })?;
        out.push(total);
    }
    Ok(out)
}

fn is_cumulative(offsets: &[u32], len: usize) -> bool {
    offsets.len() == len + 1
        && offsets.first() == Some(&0)
        && offsets.windows(2).all(|w| w[0] <= w[1])
}

impl BatchShape {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Prefill { .. } => Stage::Prefill,
            Self::Decode { .. } => Stage::Decode,
        }
    }

    pub fn num_prefill_tokens(&self) -> usize {
        match self {
            Self::Prefill {
                num_prefill_tokens, ..
            } => *num_prefill_tokens,
            Self::Decode { .. } => 0,
        }
    }

    pub fn num_decode_tokens(&self) -> usize {
        match self {
            Self::Prefill { .. } => 0,
            Self::Decode { num_decode_tokens } => *num_decode_tokens,
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.num_prefill_tokens() + self.num_decode_tokens()
    }

    /// Requests in the batch; one token per request when decoding.
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Prefill { num_prefills, .. } => *num_prefills,
            Self::Decode { num_decode_tokens } => *num_decode_tokens,
        }
    }

    /// Check a shape that did not come from the builder.
    fn validate(&self) -> Result<()> {
        Stage::classify(self.num_prefill_tokens(), self.num_decode_tokens())?;
        if let Self::Prefill {
            num_prefills,
            num_prefill_tokens,
            max_prefill_seq_len,
            seq_start_loc,
            query_start_loc,
        } = self
        {
            if !is_cumulative(seq_start_loc, *num_prefills)
                || !is_cumulative(query_start_loc, *num_prefills)
            {
                return Err(AttentionError::shape(format!(
                    "seq_start_loc and query_start_loc must be cumulative offsets over {num_prefills} prefills"
                )));
            }
            if query_start_loc.last().map(|&end| end as usize) != Some(*num_prefill_tokens) {
                return Err(AttentionError::shape(format!(
                    "query_start_loc ends at {:?}, expected {num_prefill_tokens}",
                    query_start_loc.last()
                )));
            }
            let longest = seq_start_loc.windows(2).map(|w| (w[1] - w[0]) as usize).max();
            if longest != Some(*max_prefill_seq_len) {
                return Err(AttentionError::shape(format!(
                    "max_prefill_seq_len {max_prefill_seq_len} does not match sequence lengths"
                )));
            }
        }
        Ok(())
    }
}

/// Attention metadata for one forward step.
#[derive(Debug)]
pub struct AttentionMetadata {
    shape: BatchShape,
    /// Flat cache slot per token; negative means padding (not written).
    slot_mapping: Vec<i64>,
    page_table: PageTable,
    num_qo_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    page_size: usize,
    data_type: DType,
    device: Device,
    logits_soft_cap: Option<f32>,
    use_cuda_graph: bool,
    prefill_session: Option<KernelSession>,
    decode_session: Option<KernelSession>,
}

/// Data-only parts of an `AttentionMetadata`, before validation.
struct MetadataParts {
    shape: BatchShape,
    slot_mapping: Vec<i64>,
    page_table: PageTable,
    num_qo_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    page_size: usize,
    data_type: DType,
    device: Device,
    logits_soft_cap: Option<f32>,
    use_cuda_graph: bool,
}

impl AttentionMetadata {
    pub fn builder(
        num_qo_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        page_size: usize,
    ) -> AttentionMetadataBuilder {
        AttentionMetadataBuilder::new(num_qo_heads, num_kv_heads, head_dim, page_size)
    }

    fn assemble(parts: MetadataParts) -> Result<Self> {
        if !FlashInferBackend::is_supported_head_size(parts.head_dim) {
            return Err(AttentionError::configuration(format!(
                "Only {:?} are supported for head_dim, received {}",
                FlashInferBackend::supported_head_sizes(),
                parts.head_dim
            )));
        }
        if parts.num_kv_heads == 0 || parts.num_qo_heads % parts.num_kv_heads != 0 {
            return Err(AttentionError::configuration(format!(
                "num_qo_heads ({}) must be a positive multiple of num_kv_heads ({})",
                parts.num_qo_heads, parts.num_kv_heads
            )));
        }
        if parts.page_size == 0 {
            return Err(AttentionError::configuration("page_size must be positive"));
        }
        if !parts.data_type.is_float() {
            return Err(AttentionError::configuration(format!(
                "attention data type must be floating point, got {}",
                parts.data_type.as_str()
            )));
        }
        if let Some(cap) = parts.logits_soft_cap {
            if !cap.is_finite() || cap <= 0.0 {
                return Err(AttentionError::configuration(format!(
                    "logits_soft_cap must be positive and finite, got {cap}"
                )));
            }
        }
        if let Some(pages) = parts.page_table.host() {
            if pages.page_size() != parts.page_size {
                return Err(AttentionError::configuration(format!(
                    "page index uses page_size {}, metadata uses {}",
                    pages.page_size(),
                    parts.page_size
                )));
            }
            if pages.batch_size() != parts.shape.batch_size() {
                return Err(AttentionError::shape(format!(
                    "page index covers {} requests, batch has {}",
                    pages.batch_size(),
                    parts.shape.batch_size()
                )));
            }
        }
        let num_tokens = parts.shape.num_tokens();
        if !parts.slot_mapping.is_empty() && parts.slot_mapping.len() != num_tokens {
            return Err(AttentionError::shape(format!(
                "slot_mapping has {} entries for {num_tokens} tokens",
                parts.slot_mapping.len()
            )));
        }

        Ok(Self {
            shape: parts.shape,
            slot_mapping: parts.slot_mapping,
            page_table: parts.page_table,
            num_qo_heads: parts.num_qo_heads,
            num_kv_heads: parts.num_kv_heads,
            head_dim: parts.head_dim,
            page_size: parts.page_size,
            data_type: parts.data_type,
            device: parts.device,
            logits_soft_cap: parts.logits_soft_cap,
            use_cuda_graph: parts.use_cuda_graph,
            prefill_session: None,
            decode_session: None,
        })
    }

    pub fn shape(&self) -> &BatchShape {
        &self.shape
    }

    pub fn stage(&self) -> Stage {
        self.shape.stage()
    }

    pub fn num_prefill_tokens(&self) -> usize {
        self.shape.num_prefill_tokens()
    }

    pub fn num_decode_tokens(&self) -> usize {
        self.shape.num_decode_tokens()
    }

    pub fn num_tokens(&self) -> usize {
        self.shape.num_tokens()
    }

    pub fn slot_mapping(&self) -> &[i64] {
        &self.slot_mapping
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn num_qo_heads(&self) -> usize {
        self.num_qo_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn data_type(&self) -> DType {
        self.data_type
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn logits_soft_cap(&self) -> Option<f32> {
        self.logits_soft_cap
    }

    pub fn use_cuda_graph(&self) -> bool {
        self.use_cuda_graph
    }

    pub fn prefill_session(&self) -> Option<&KernelSession> {
        self.prefill_session.as_ref()
    }

    pub fn decode_session(&self) -> Option<&KernelSession> {
        self.decode_session.as_ref()
    }

    pub fn with_prefill_session(mut self, session: KernelSession) -> Self {
        self.prefill_session = Some(session);
        self
    }

    pub fn with_decode_session(mut self, session: KernelSession) -> Self {
        self.decode_session = Some(session);
        self
    }

    /// Hand the sessions back for reuse on the next step.
    pub fn into_sessions(mut self) -> (Option<KernelSession>, Option<KernelSession>) {
        (self.prefill_session.take(), self.decode_session.take())
    }

    /// This metadata when the batch is prefill, else `None`.
    pub fn prefill_metadata(&self) -> Option<&Self> {
        (self.stage() == Stage::Prefill).then_some(self)
    }

    /// This metadata when the batch is decode, else `None`.
    pub fn decode_metadata(&self) -> Option<&Self> {
        (self.stage() == Stage::Decode).then_some(self)
    }

    /// Plan the session for this batch's stage.
    ///
    /// Prefill without page arrays (profiling) plans nothing and returns
    /// `None`. Decode without page arrays is only valid under graph capture,
    /// where the session's bound capture buffers are planned instead. The
    /// page index is made device resident at most once per step.
    pub fn begin(&mut self) -> Result<Option<PlanGuard<'_>>> {
        let Self {
            shape,
            page_table,
            num_qo_heads,
            num_kv_heads,
            head_dim,
            page_size,
            data_type,
            device,
            use_cuda_graph,
            prefill_session,
            decode_session,
            ..
        } = self;

        let (stage, session, pages) = match shape {
            BatchShape::Prefill {
                query_start_loc, ..
            } => {
                if page_table.is_uninitialized() {
                    tracing::debug!("prefill without page index, skipping plan");
                    return Ok(None);
                }
                let session = prefill_session.as_mut().ok_or_else(|| {
                    AttentionError::precondition("prefill batch has no prefill session attached")
                })?;
                let pages = page_table.ensure_device(device)?.clone();
                let stage = PlanStage::Prefill {
                    qo_indptr: query_start_loc.clone(),
                };
                (stage, session, pages)
            }
            BatchShape::Decode { .. } => {
                let session = decode_session.as_mut().ok_or_else(|| {
                    AttentionError::precondition("decode batch has no decode session attached")
                })?;
                let pages = if !page_table.is_uninitialized() {
                    page_table.ensure_device(device)?.clone()
                } else if *use_cuda_graph {
                    tracing::debug!("graph-captured decode, planning bound capture buffers");
                    session.capture_buffers().cloned().ok_or_else(|| {
                        AttentionError::precondition(
                            "graph-captured decode has no page index and no bound capture buffers",
                        )
                    })?
                } else {
                    return Err(AttentionError::precondition(
                        "decode requires page_indices, page_offsets and last_page_fill",
                    ));
                };
                (PlanStage::Decode, session, pages)
            }
        };

        let plan = KernelPlan {
            stage,
            pages,
            num_qo_heads: *num_qo_heads,
            num_kv_heads: *num_kv_heads,
            head_dim: *head_dim,
            page_size: *page_size,
            data_type: *data_type,
            // rotary is applied before attention
            pos_encoding: PosEncoding::None,
        };
        tracing::debug!(
            kernel = session.kernel_name(),
            batch_size = plan.batch_size(),
            total_pages = plan.pages.host().total_pages(),
            "planning attention kernel"
        );
        session.scoped(plan).map(Some)
    }

    /// Serializable copy for broadcast to other workers. Kernel sessions are
    /// process-local and never included.
    pub fn to_broadcast(&self) -> BroadcastMetadata {
        BroadcastMetadata {
            shape: self.shape.clone(),
            slot_mapping: self.slot_mapping.clone(),
            page_index: self.page_table.host().cloned(),
            num_qo_heads: self.num_qo_heads,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            page_size: self.page_size,
            data_type: self.data_type.as_str().to_string(),
            logits_soft_cap: self.logits_soft_cap,
            use_cuda_graph: self.use_cuda_graph,
        }
    }

    /// Rebuild from a broadcast copy. The receiver attaches its own sessions.
    pub fn from_broadcast(broadcast: BroadcastMetadata, device: &Device) -> Result<Self> {
        broadcast.shape.validate()?;
        if let Some(pages) = &broadcast.page_index {
            pages.validate()?;
        }
        Self::assemble(MetadataParts {
            data_type: broadcast.data_type.parse::<DType>().map_err(|e| {
                AttentionError::configuration(format!("broadcast data type: {e}"))
            })?,
            shape: broadcast.shape,
            slot_mapping: broadcast.slot_mapping,
            page_table: broadcast
                .page_index
                .map(PageTable::HostResident)
                .unwrap_or_default(),
            num_qo_heads: broadcast.num_qo_heads,
            num_kv_heads: broadcast.num_kv_heads,
            head_dim: broadcast.head_dim,
            page_size: broadcast.page_size,
            device: device.clone(),
            logits_soft_cap: broadcast.logits_soft_cap,
            use_cuda_graph: broadcast.use_cuda_graph,
        })
    }
}

/// Zero-copy-friendly view of `AttentionMetadata` without kernel sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMetadata {
    pub shape: BatchShape,
    pub slot_mapping: Vec<i64>,
    pub page_index: Option<PageIndex>,
    pub num_qo_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub page_size: usize,
    pub data_type: String,
    pub logits_soft_cap: Option<f32>,
    pub use_cuda_graph: bool,
}

impl BroadcastMetadata {
    /// `AttentionMetadata` fields left out of the broadcast.
    pub const SKIPPED_FIELDS: [&'static str; 2] = ["prefill_session", "decode_session"];

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AttentionError::configuration(format!("broadcast encode: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| AttentionError::configuration(format!("broadcast decode: {e}")))
    }
}

/// Builder for `AttentionMetadata`.
#[derive(Debug)]
pub struct AttentionMetadataBuilder {
    num_qo_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    page_size: usize,
    query_lens: Vec<usize>,
    seq_lens: Vec<usize>,
    num_decode_tokens: usize,
    slot_mapping: Vec<i64>,
    page_table: PageTable,
    data_type: DType,
    device: Device,
    logits_soft_cap: Option<f32>,
    use_cuda_graph: bool,
    prefill_session: Option<KernelSession>,
    decode_session: Option<KernelSession>,
}

impl AttentionMetadataBuilder {
    pub fn new(num_qo_heads: usize, num_kv_heads: usize, head_dim: usize, page_size: usize) -> Self {
        Self {
            num_qo_heads,
            num_kv_heads,
            head_dim,
            page_size,
            query_lens: Vec::new(),
            seq_lens: Vec::new(),
            num_decode_tokens: 0,
            slot_mapping: Vec::new(),
            page_table: PageTable::Uninitialized,
            data_type: DType::F16,
            device: Device::Cpu,
            logits_soft_cap: None,
            use_cuda_graph: false,
            prefill_session: None,
            decode_session: None,
        }
    }

    /// Prefill requests: new query tokens and full sequence length
    /// (cached prefix plus query) per request.
    pub fn prefill(mut self, query_lens: &[usize], seq_lens: &[usize]) -> Self {
        self.query_lens = query_lens.to_vec();
        self.seq_lens = seq_lens.to_vec();
        self
    }

    /// Prefill requests with no cached prefix.
    pub fn prefill_seq_lens(self, seq_lens: &[usize]) -> Self {
        self.prefill(seq_lens, seq_lens)
    }

    pub fn decode_tokens(mut self, num_decode_tokens: usize) -> Self {
        self.num_decode_tokens = num_decode_tokens;
        self
    }

    pub fn slot_mapping(mut self, slot_mapping: Vec<i64>) -> Self {
        self.slot_mapping = slot_mapping;
        self
    }

    pub fn page_table(mut self, page_table: impl Into<PageTable>) -> Self {
        self.page_table = page_table.into();
        self
    }

    pub fn data_type(mut self, data_type: DType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn device(mut self, device: &Device) -> Self {
        self.device = device.clone();
        self
    }

    pub fn logits_soft_cap(mut self, cap: Option<f32>) -> Self {
        self.logits_soft_cap = cap;
        self
    }

    pub fn use_cuda_graph(mut self, enabled: bool) -> Self {
        self.use_cuda_graph = enabled;
        self
    }

    pub fn prefill_session(mut self, session: KernelSession) -> Self {
        self.prefill_session = Some(session);
        self
    }

    pub fn decode_session(mut self, session: KernelSession) -> Self {
        self.decode_session = Some(session);
        self
    }

    pub fn build(self) -> Result<AttentionMetadata> {
        if self.query_lens.len() != self.seq_lens.len() {
            return Err(AttentionError::shape(format!(
                "{} query lengths for {} sequence lengths",
                self.query_lens.len(),
                self.seq_lens.len()
            )));
        }
        if let Some((i, (q, s))) = self
            .query_lens
            .iter()
            .zip(&self.seq_lens)
            .enumerate()
            .find(|(_, (q, s))| q > s)
        {
            return Err(AttentionError::shape(format!(
                "request {i}: {q} query tokens exceed sequence length {s}"
            )));
        }

        let num_prefill_tokens: usize = self.query_lens.iter().sum();
        let shape = match Stage::classify(num_prefill_tokens, self.num_decode_tokens)? {
            Stage::Prefill => BatchShape::Prefill {
                num_prefills: self.seq_lens.len(),
                num_prefill_tokens,
                max_prefill_seq_len: self.seq_lens.iter().copied().max().unwrap_or(0),
                seq_start_loc: cumulative(&self.seq_lens)?,
                query_start_loc: cumulative(&self.query_lens)?,
            },
            Stage::Decode => BatchShape::Decode {
                num_decode_tokens: self.num_decode_tokens,
            },
        };

        let mut metadata = AttentionMetadata::assemble(MetadataParts {
            shape,
            slot_mapping: self.slot_mapping,
            page_table: self.page_table,
            num_qo_heads: self.num_qo_heads,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            page_size: self.page_size,
            data_type: self.data_type,
            device: self.device,
            logits_soft_cap: self.logits_soft_cap,
            use_cuda_graph: self.use_cuda_graph,
        })?;
        metadata.prefill_session = self.prefill_session;
        metadata.decode_session = self.decode_session;
        Ok(metadata)
    }
}
