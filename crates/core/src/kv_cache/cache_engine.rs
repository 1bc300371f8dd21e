use candle_core::{DType, Device, Tensor};

use super::config::CacheConfig;
use super::error::CacheError;
use super::BlockId;

/// Owns pre-allocated tensors for one layer's paged KV cache.
///
/// Cache layout: [num_blocks, block_size, num_kv_heads, head_dim]
/// This layout allows direct reshape to [total_slots, kv_heads, head_dim] for scatter/gather.
///
/// Writes go through a flat slot mapping (`slot = block_id * block_size + offset`);
/// reads are done by the attention kernels through a page index.
pub struct CacheEngine {
    k_cache: Tensor,
    v_cache: Tensor,
    num_blocks: usize,
    block_size: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl CacheEngine {
    /// Pre-allocate both slabs, filled with zeros.
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let shape = (
            config.num_blocks,
            config.block_size,
            config.num_kv_heads,
            config.head_dim,
        );
        let k_cache = Tensor::zeros(shape, config.dtype, &config.device)?;
        let v_cache = Tensor::zeros(shape, config.dtype, &config.device)?;

        Ok(Self {
            k_cache,
            v_cache,
            num_blocks: config.num_blocks,
            block_size: config.block_size,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
        })
    }

    /// Split a combined `[num_blocks, 2, block_size, num_kv_heads, head_dim]`
    /// cache tensor into its key (index 0) and value (index 1) slabs.
    ///
    /// Each slab is made contiguous, which copies unless the combined tensor
    /// holds a single block.
    pub fn from_combined(kv_cache: &Tensor) -> Result<Self, CacheError> {
        let (num_blocks, kv, block_size, num_kv_heads, head_dim) = kv_cache.dims5()?;
        if kv != 2 {
            return Err(CacheError::ShapeMismatch {
                expected: vec![num_blocks, 2, block_size, num_kv_heads, head_dim],
                actual: kv_cache.dims().to_vec(),
            });
        }

        let k_cache = kv_cache.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        let v_cache = kv_cache.narrow(1, 1, 1)?.squeeze(1)?.contiguous()?;

        Ok(Self {
            k_cache,
            v_cache,
            num_blocks,
            block_size,
            num_kv_heads,
            head_dim,
        })
    }

    /// Raw K cache tensor `[num_blocks, block_size, num_kv_heads, head_dim]`.
    pub fn k_cache(&self) -> &Tensor {
        &self.k_cache
    }

    /// Raw V cache tensor `[num_blocks, block_size, num_kv_heads, head_dim]`.
    pub fn v_cache(&self) -> &Tensor {
        &self.v_cache
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Total token slots across all blocks.
    pub fn num_slots(&self) -> usize {
        self.num_blocks * self.block_size
    }

    pub fn device(&self) -> &Device {
        self.k_cache.device()
    }

    pub fn dtype(&self) -> DType {
        self.k_cache.dtype()
    }

    /// Write K, V tokens in `[num_tokens, kv_heads, head_dim]` layout into
    /// their assigned slots.
    ///
    /// `slot_mapping[i]` is the flat slot of token `i`. Negative entries mark
    /// padding tokens, which are skipped.
    pub fn write_batch(
        &mut self,
        k: &Tensor,
        v: &Tensor,
        slot_mapping: &[i64],
    ) -> Result<(), CacheError> {
        let (num_tokens, _, _) = k.dims3()?;
        let expected = vec![num_tokens, self.num_kv_heads, self.head_dim];
        for t in [k, v] {
            if t.dims() != expected.as_slice() {
                return Err(CacheError::ShapeMismatch {
                    expected: expected.clone(),
                    actual: t.dims().to_vec(),
                });
            }
        }
        if slot_mapping.len() != num_tokens {
            return Err(CacheError::SlotMappingLength {
                slots: slot_mapping.len(),
                tokens: num_tokens,
            });
        }

        let capacity = self.num_slots();
        let mut rows = Vec::with_capacity(num_tokens);
        let mut slots = Vec::with_capacity(num_tokens);
        for (row, &slot) in slot_mapping.iter().enumerate() {
            if slot < 0 {
                continue;
            }
            if slot as usize >= capacity {
                return Err(CacheError::SlotOutOfRange { slot, capacity });
            }
            rows.push(row as u32);
            slots.push(slot as u32);
        }
        if slots.is_empty() {
            return Ok(());
        }

        let device = self.k_cache.device().clone();
        let (k_src, v_src) = if rows.len() == num_tokens {
            (k.clone(), v.clone())
        } else {
            let rows = Tensor::from_vec(rows, (slots.len(),), k.device())?;
            (k.index_select(&rows, 0)?, v.index_select(&rows, 0)?)
        };
        let k_src = k_src
            .to_device(&device)?
            .to_dtype(self.k_cache.dtype())?
            .contiguous()?;
        let v_src = v_src
            .to_device(&device)?
            .to_dtype(self.v_cache.dtype())?
            .contiguous()?;

        self.scatter_into_cache(&k_src, &v_src, slots)
    }

    /// Scatter `[n, kv_heads, head_dim]` rows into the flat slot view of both slabs.
    fn scatter_into_cache(
        &self,
        k_src: &Tensor,
        v_src: &Tensor,
        slots: Vec<u32>,
    ) -> Result<(), CacheError> {
        let n = slots.len();
        let device = self.k_cache.device();

        // reshape to [total_slots, kv_heads, head_dim] is a view (no copy)
        let flat_shape = (self.num_slots(), self.num_kv_heads, self.head_dim);
        let k_flat = self.k_cache.reshape(flat_shape)?;
        let v_flat = self.v_cache.reshape(flat_shape)?;

        let indices = Tensor::from_vec(slots, (n,), device)?
            .reshape((n, 1, 1))?
            .expand((n, self.num_kv_heads, self.head_dim))?
            .contiguous()?;

        k_flat.scatter_set(&indices, k_src, 0)?;
        v_flat.scatter_set(&indices, v_src, 0)?;

        Ok(())
    }

    /// Read K, V for all tokens of a request.
    ///
    /// block_ids: ordered physical block IDs owned by the request
    /// num_tokens: total valid tokens (to narrow partial last block)
    ///
    /// Returns (k, v) each with shape [1, num_kv_heads, num_tokens, head_dim].
    pub fn read(
        &self,
        block_ids: &[BlockId],
        num_tokens: usize,
    ) -> Result<(Tensor, Tensor), CacheError> {
        let num_blocks_used = block_ids.len();
        if let Some(&block_id) = block_ids.iter().find(|&&b| b >= self.num_blocks) {
            return Err(CacheError::BlockOutOfRange {
                block_id,
                num_blocks: self.num_blocks,
            });
        }
        let total_capacity = num_blocks_used * self.block_size;
        if num_tokens > total_capacity {
            return Err(CacheError::ReadPastBlocks {
                requested: num_tokens,
                num_blocks: num_blocks_used,
                block_size: self.block_size,
            });
        }

        let indices = Tensor::from_vec(
            block_ids.iter().map(|&b| b as u32).collect::<Vec<_>>(),
            (num_blocks_used,),
            self.k_cache.device(),
        )?;

        // index_select on dim 0: selects blocks
        let k_raw = self.k_cache.index_select(&indices, 0)?;
        let v_raw = self.v_cache.index_select(&indices, 0)?;

        let flat_shape = (total_capacity, self.num_kv_heads, self.head_dim);
        let k = k_raw.reshape(flat_shape)?.narrow(0, 0, num_tokens)?;
        let v = v_raw.reshape(flat_shape)?.narrow(0, 0, num_tokens)?;

        // [num_tokens, kv_heads, head_dim] -> [1, kv_heads, num_tokens, head_dim]
        let k = k.transpose(0, 1)?.contiguous()?.unsqueeze(0)?;
        let v = v.transpose(0, 1)?.contiguous()?.unsqueeze(0)?;

        Ok((k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    fn test_config(num_blocks: usize) -> CacheConfig {
        CacheConfig {
            block_size: 4,
            num_blocks,
            num_kv_heads: 2,
            head_dim: 8,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    fn token_rows(num_tokens: usize, base: f32) -> Tensor {
        let data: Vec<f32> = (0..num_tokens * 2 * 8).map(|i| base + i as f32).collect();
        Tensor::from_vec(data, (num_tokens, 2, 8), &Device::Cpu).unwrap()
    }

    #[test]
    fn new_allocates_correct_shape() {
        let engine = CacheEngine::new(&test_config(8)).unwrap();
        assert_eq!(engine.k_cache().dims(), &[8, 4, 2, 8]);
        assert_eq!(engine.v_cache().dims(), &[8, 4, 2, 8]);
        assert_eq!(engine.num_slots(), 32);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut engine = CacheEngine::new(&test_config(8)).unwrap();
        let k = token_rows(5, 0.0);
        let v = token_rows(5, 1000.0);
        // tokens 0..4 in block 2, token 4 in block 5
        let slots = [8, 9, 10, 11, 20];
        engine.write_batch(&k, &v, &slots).unwrap();

        let (k_out, v_out) = engine.read(&[2, 5], 5).unwrap();
        assert_eq!(k_out.dims(), &[1, 2, 5, 8]);

        let k_back = k_out.squeeze(0).unwrap().transpose(0, 1).unwrap();
        let expected: Vec<f32> = k.flatten_all().unwrap().to_vec1().unwrap();
        let actual: Vec<f32> = k_back.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(actual, expected);

        let v_back = v_out.squeeze(0).unwrap().transpose(0, 1).unwrap();
        let expected: Vec<f32> = v.flatten_all().unwrap().to_vec1().unwrap();
        let actual: Vec<f32> = v_back.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn write_skips_padding_slots() {
        let mut engine = CacheEngine::new(&test_config(2)).unwrap();
        let k = token_rows(3, 1.0);
        let v = token_rows(3, 1.0);
        engine.write_batch(&k, &v, &[0, -1, 1]).unwrap();

        let (k_out, _) = engine.read(&[0], 3).unwrap();
        let k_out = k_out.squeeze(0).unwrap().transpose(0, 1).unwrap();
        // slot 2 was never written
        let slot2: Vec<f32> = k_out.get(2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(slot2.iter().all(|&x| x == 0.0));
        // token 2 landed in slot 1
        let slot1: Vec<f32> = k_out.get(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let token2: Vec<f32> = k.get(2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(slot1, token2);
    }

    #[test]
    fn write_rejects_out_of_range_slot() {
        let mut engine = CacheEngine::new(&test_config(2)).unwrap();
        let k = token_rows(1, 0.0);
        let err = engine.write_batch(&k, &k, &[8]).unwrap_err();
        assert!(matches!(err, CacheError::SlotOutOfRange { slot: 8, capacity: 8 }));
    }

    #[test]
    fn write_rejects_slot_mapping_length_mismatch() {
        let mut engine = CacheEngine::new(&test_config(2)).unwrap();
        let k = token_rows(2, 0.0);
        let err = engine.write_batch(&k, &k, &[0]).unwrap_err();
        assert!(matches!(
            err,
            CacheError::SlotMappingLength {
                slots: 1,
                tokens: 2
            }
        ));
    }

    #[test]
    fn write_rejects_wrong_head_shape() {
        let mut engine = CacheEngine::new(&test_config(2)).unwrap();
        let k = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
        let err = engine.write_batch(&k, &k, &[0]).unwrap_err();
        assert!(matches!(err, CacheError::ShapeMismatch { .. }));
    }

    #[test]
    fn read_rejects_unknown_block() {
        let engine = CacheEngine::new(&test_config(2)).unwrap();
        let err = engine.read(&[0, 2], 5).unwrap_err();
        assert!(matches!(
            err,
            CacheError::BlockOutOfRange {
                block_id: 2,
                num_blocks: 2
            }
        ));
    }

    #[test]
    fn read_rejects_more_tokens_than_blocks_hold() {
        let engine = CacheEngine::new(&test_config(4)).unwrap();
        let err = engine.read(&[0], 5).unwrap_err();
        assert!(matches!(err, CacheError::ReadPastBlocks { .. }));
    }

    #[test]
    fn from_combined_splits_key_and_value() {
        // [num_blocks=2, 2, block_size=4, kv_heads=2, head_dim=8]
        let k = Tensor::ones((2, 1, 4, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let v = (Tensor::ones((2, 1, 4, 2, 8), DType::F32, &Device::Cpu).unwrap() * 2.0).unwrap();
        let combined = Tensor::cat(&[&k, &v], 1).unwrap();

        let engine = CacheEngine::from_combined(&combined).unwrap();
        assert_eq!(engine.k_cache().dims(), &[2, 4, 2, 8]);
        assert_eq!(engine.num_blocks(), 2);
        assert_eq!(engine.block_size(), 4);
        let v_sum: f32 = engine.v_cache().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(v_sum, 2.0 * (2 * 4 * 2 * 8) as f32);
    }

    #[test]
    fn from_combined_rejects_wrong_kv_dim() {
        let bad = Tensor::zeros((2, 3, 4, 2, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(CacheEngine::from_combined(&bad).is_err());
    }
}
