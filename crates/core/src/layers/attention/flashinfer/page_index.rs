//! Paged KV index: which cache pages belong to which request of a batch.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::kv_cache::BlockId;
use crate::layers::attention::error::{AttentionError, Result};

/// Ragged per-request page lists in CSR form.
///
/// For requests owning pages `[0, 5, 8]`, `[1, 6, 7]` and `[3, 4]`:
/// - `page_indices`: `[0, 5, 8, 1, 6, 7, 3, 4]`
/// - `page_offsets`: `[0, 3, 6, 8]`
///
/// `last_page_fill[i]` counts the valid tokens in request `i`'s last page and
/// is in `1..=page_size`: a completely full last page reports `page_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageIndex {
    page_indices: Vec<u32>,
    page_offsets: Vec<u32>,
    last_page_fill: Vec<u32>,
    page_size: usize,
}

impl PageIndex {
    pub fn new(
        page_indices: Vec<u32>,
        page_offsets: Vec<u32>,
        last_page_fill: Vec<u32>,
        page_size: usize,
    ) -> Result<Self> {
        let index = Self {
            page_indices,
            page_offsets,
            last_page_fill,
            page_size,
        };
        index.validate()?;
        Ok(index)
    }

    /// Build from per-request block tables and KV lengths (tokens in the
    /// cache, including the current step's tokens).
    pub fn from_block_tables(
        block_tables: &[&[BlockId]],
        kv_lengths: &[usize],
        page_size: usize,
    ) -> Result<Self> {
        if block_tables.len() != kv_lengths.len() {
            return Err(AttentionError::configuration(format!(
                "{} block tables for {} kv lengths",
                block_tables.len(),
                kv_lengths.len()
            )));
        }
        if page_size == 0 {
            return Err(AttentionError::configuration("page_size must be positive"));
        }

        let total_pages: usize = block_tables.iter().map(|t| t.len()).sum();
        let mut page_indices = Vec::with_capacity(total_pages);
        let mut page_offsets = Vec::with_capacity(block_tables.len() + 1);
        let mut last_page_fill = Vec::with_capacity(block_tables.len());
        page_offsets.push(0u32);

        for (request, (blocks, &kv_len)) in block_tables.iter().zip(kv_lengths).enumerate() {
            let needed = kv_len.div_ceil(page_size);
            if kv_len == 0 || needed != blocks.len() {
                return Err(AttentionError::configuration(format!(
                    "request {request}: {kv_len} tokens need {needed} pages of {page_size}, \
                     block table has {}",
                    blocks.len()
                )));
            }
            page_indices.extend(blocks.iter().map(|&b| b as u32));
            page_offsets.push(page_indices.len() as u32);
            // full last page reports page_size, never 0
            let fill = kv_len % page_size;
            last_page_fill.push((if fill == 0 { page_size } else { fill }) as u32);
        }

        Self::new(page_indices, page_offsets, last_page_fill, page_size)
    }

    /// Assemble a page table from optional arrays. All three absent means
    /// the page table is not initialized yet (profiling run).
    pub fn from_parts(
        page_indices: Option<Vec<u32>>,
        page_offsets: Option<Vec<u32>>,
        last_page_fill: Option<Vec<u32>>,
        page_size: usize,
    ) -> Result<PageTable> {
        match (page_indices, page_offsets, last_page_fill) {
            (None, None, None) => Ok(PageTable::Uninitialized),
            (Some(indices), Some(offsets), Some(fill)) => Ok(PageTable::HostResident(Self::new(
                indices, offsets, fill, page_size,
            )?)),
            _ => Err(AttentionError::configuration(
                "page_indices, page_offsets and last_page_fill must be provided together",
            )),
        }
    }

    /// Re-check the structural invariants. Deserialized indices bypass `new`.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(AttentionError::configuration("page_size must be positive"));
        }
        if self.page_offsets.first() != Some(&0) {
            return Err(AttentionError::configuration(
                "page_offsets must be non-empty and start at 0",
            ));
        }
        if self.page_offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(AttentionError::configuration(
                "page_offsets must be non-decreasing",
            ));
        }
        let last = *self.page_offsets.last().unwrap_or(&0) as usize;
        if last != self.page_indices.len() {
            return Err(AttentionError::configuration(format!(
                "page_offsets end at {last} but there are {} page indices",
                self.page_indices.len()
            )));
        }
        if self.last_page_fill.len() != self.batch_size() {
            return Err(AttentionError::configuration(format!(
                "last_page_fill has {} entries for a batch of {}",
                self.last_page_fill.len(),
                self.batch_size()
            )));
        }
        for request in 0..self.batch_size() {
            if self.pages_for(request).is_empty() {
                return Err(AttentionError::configuration(format!(
                    "request {request} owns no pages"
                )));
            }
            let fill = self.last_page_fill[request] as usize;
            if fill == 0 || fill > self.page_size {
                return Err(AttentionError::configuration(format!(
                    "request {request}: last page fill {fill} outside 1..={}",
                    self.page_size
                )));
            }
        }
        Ok(())
    }

    pub fn page_indices(&self) -> &[u32] {
        &self.page_indices
    }

    pub fn page_offsets(&self) -> &[u32] {
        &self.page_offsets
    }

    pub fn last_page_fill(&self) -> &[u32] {
        &self.last_page_fill
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn batch_size(&self) -> usize {
        self.page_offsets.len().saturating_sub(1)
    }

    pub fn total_pages(&self) -> usize {
        self.page_indices.len()
    }

    /// Pages owned by `request`, in sequence order.
    pub fn pages_for(&self, request: usize) -> &[u32] {
        let start = self.page_offsets[request] as usize;
        let end = self.page_offsets[request + 1] as usize;
        &self.page_indices[start..end]
    }

    /// Tokens stored for `request`.
    pub fn kv_len(&self, request: usize) -> usize {
        let pages = self.pages_for(request).len();
        pages.saturating_sub(1) * self.page_size + self.last_page_fill[request] as usize
    }
}

/// A `PageIndex` mirrored into device tensors (`U32`, 1-D).
#[derive(Debug, Clone)]
pub struct DevicePageIndex {
    host: PageIndex,
    indices: Tensor,
    indptr: Tensor,
    last_page_len: Tensor,
}

impl DevicePageIndex {
    pub fn upload(host: &PageIndex, device: &Device) -> Result<Self> {
        tracing::trace!(
            batch_size = host.batch_size(),
            total_pages = host.total_pages(),
            "uploading page index"
        );
        let to_device =
            |v: &[u32]| Tensor::from_vec(v.to_vec(), (v.len(),), device).map_err(AttentionError::from);
        Ok(Self {
            indices: to_device(host.page_indices())?,
            indptr: to_device(host.page_offsets())?,
            last_page_len: to_device(host.last_page_fill())?,
            host: host.clone(),
        })
    }

    pub fn host(&self) -> &PageIndex {
        &self.host
    }

    pub fn indices(&self) -> &Tensor {
        &self.indices
    }

    pub fn indptr(&self) -> &Tensor {
        &self.indptr
    }

    pub fn last_page_len(&self) -> &Tensor {
        &self.last_page_len
    }

    pub fn device(&self) -> &Device {
        self.indices.device()
    }
}

/// Where a batch's page index currently lives.
#[derive(Debug, Clone, Default)]
pub enum PageTable {
    /// No page arrays: profiling runs, or graph replay against bound buffers.
    #[default]
    Uninitialized,
    HostResident(PageIndex),
    DeviceResident(DevicePageIndex),
}

impl PageTable {
    pub fn is_uninitialized(&self) -> bool {
        matches!(self, Self::Uninitialized)
    }

    pub fn is_device_resident(&self) -> bool {
        matches!(self, Self::DeviceResident(_))
    }

    /// Host view of the index, for either residency.
    pub fn host(&self) -> Option<&PageIndex> {
        match self {
            Self::Uninitialized => None,
            Self::HostResident(index) => Some(index),
            Self::DeviceResident(index) => Some(index.host()),
        }
    }

    /// Make the index resident on `device`, uploading only when it is not
    /// already there.
    pub fn ensure_device(&mut self, device: &Device) -> Result<&DevicePageIndex> {
        let upload = match self {
            Self::Uninitialized => {
                return Err(AttentionError::precondition(
                    "page table is not initialized",
                ))
            }
            Self::HostResident(index) => DevicePageIndex::upload(index, device)?,
            Self::DeviceResident(index) if !index.device().same_device(device) => {
                DevicePageIndex::upload(index.host(), device)?
            }
            Self::DeviceResident(_) => return self.device_index(),
        };
        *self = Self::DeviceResident(upload);
        self.device_index()
    }

    fn device_index(&self) -> Result<&DevicePageIndex> {
        match self {
            Self::DeviceResident(index) => Ok(index),
            _ => Err(AttentionError::precondition(
                "page table is not device resident",
            )),
        }
    }
}

impl From<PageIndex> for PageTable {
    fn from(index: PageIndex) -> Self {
        Self::HostResident(index)
    }
}

impl From<DevicePageIndex> for PageTable {
    fn from(index: DevicePageIndex) -> Self {
        Self::DeviceResident(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_block_tables() {
        let tables: [&[BlockId]; 3] = [&[0, 5, 8], &[1, 6, 7], &[3, 4]];
        // 40 = 2*16 + 8, 33 = 2*16 + 1, 20 = 16 + 4
        let index = PageIndex::from_block_tables(&tables, &[40, 33, 20], 16).unwrap();

        assert_eq!(index.page_indices(), &[0, 5, 8, 1, 6, 7, 3, 4]);
        assert_eq!(index.page_offsets(), &[0, 3, 6, 8]);
        assert_eq!(index.last_page_fill(), &[8, 1, 4]);
        assert_eq!(index.batch_size(), 3);
        assert_eq!(index.total_pages(), 8);
        assert_eq!(index.kv_len(0), 40);
        assert_eq!(index.pages_for(2), &[3, 4]);
    }

    #[test]
    fn test_full_last_page_reports_page_size() {
        let tables: [&[BlockId]; 1] = [&[0, 1]];
        let index = PageIndex::from_block_tables(&tables, &[32], 16).unwrap();
        assert_eq!(index.last_page_fill(), &[16]);
        assert_eq!(index.kv_len(0), 32);
    }

    #[test]
    fn test_block_table_must_match_length() {
        let tables: [&[BlockId]; 1] = [&[0, 1, 2]];
        assert!(PageIndex::from_block_tables(&tables, &[17], 16).is_err());
        assert!(PageIndex::from_block_tables(&tables, &[49], 16).is_err());
        assert!(PageIndex::from_block_tables(&tables, &[0], 16).is_err());
    }

    #[test]
    fn test_new_rejects_broken_invariants() {
        let cases = [
            (vec![1, 2], vec![1, 2], vec![1], 16),
            (vec![1, 2], vec![0, 3], vec![1], 16),
            (vec![1, 2], vec![0, 2, 1], vec![1, 1], 16),
            (vec![1, 2], vec![0, 2], vec![1, 1], 16),
            (vec![1, 2], vec![0, 2], vec![0], 16),
            (vec![1, 2], vec![0, 2], vec![17], 16),
            (vec![1, 2], vec![0, 2, 2], vec![1, 1], 16),
            (vec![1], vec![0, 1], vec![1], 0),
            (vec![], vec![], vec![], 16),
        ];
        for (indices, offsets, fill, page_size) in cases {
            let err = PageIndex::new(indices.clone(), offsets.clone(), fill.clone(), page_size)
                .unwrap_err();
            assert!(
                matches!(err, AttentionError::Configuration(_)),
                "{indices:?} {offsets:?} {fill:?} accepted"
            );
        }
    }

    #[test]
    fn test_empty_batch_is_valid() {
        let index = PageIndex::new(vec![], vec![0], vec![], 16).unwrap();
        assert_eq!(index.batch_size(), 0);
        assert_eq!(index.total_pages(), 0);
    }

    #[test]
    fn test_from_parts_requires_all_or_none() {
        let table = PageIndex::from_parts(None, None, None, 16).unwrap();
        assert!(table.is_uninitialized());

        let table =
            PageIndex::from_parts(Some(vec![4]), Some(vec![0, 1]), Some(vec![3]), 16).unwrap();
        assert_eq!(table.host().unwrap().kv_len(0), 3);

        assert!(PageIndex::from_parts(Some(vec![4]), None, Some(vec![3]), 16).is_err());
        assert!(PageIndex::from_parts(None, Some(vec![0]), None, 16).is_err());
    }

    #[test]
    fn test_ensure_device_uploads_once() {
        let index = PageIndex::new(vec![2, 5, 7], vec![0, 2, 3], vec![3, 9], 16).unwrap();
        let mut table = PageTable::from(index.clone());
        assert!(!table.is_device_resident());

        let first_id = table.ensure_device(&Device::Cpu).unwrap().indices().id();
        assert!(table.is_device_resident());
        let second_id = table.ensure_device(&Device::Cpu).unwrap().indices().id();
        assert_eq!(first_id, second_id);

        let device = table.ensure_device(&Device::Cpu).unwrap();
        assert_eq!(device.host(), &index);
        assert_eq!(device.indptr().to_vec1::<u32>().unwrap(), vec![0, 2, 3]);
        assert_eq!(device.last_page_len().to_vec1::<u32>().unwrap(), vec![3, 9]);
    }

    #[test]
    fn test_ensure_device_on_uninitialized_fails() {
        let mut table = PageTable::Uninitialized;
        assert!(matches!(
            table.ensure_device(&Device::Cpu),
            Err(AttentionError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_serde_roundtrip_keeps_invariants_checkable() {
        let index = PageIndex::new(vec![2, 5, 7], vec![0, 2, 3], vec![3, 9], 16).unwrap();
        let json = serde_json::to_string(&index).unwrap();
        let back: PageIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, index);

        let tampered = json.replace("\"page_size\":16", "\"page_size\":8");
        let back: PageIndex = serde_json::from_str(&tampered).unwrap();
        assert!(back.validate().is_err());
    }
}
