use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("slot {slot} is out of range for cache capacity {capacity}")]
    SlotOutOfRange { slot: i64, capacity: usize },

    #[error("block {block_id} is out of range for {num_blocks} cache blocks")]
    BlockOutOfRange { block_id: usize, num_blocks: usize },

    #[error("requested {requested} tokens from {num_blocks} blocks of size {block_size}")]
    ReadPastBlocks {
        requested: usize,
        num_blocks: usize,
        block_size: usize,
    },

    #[error("slot mapping has {slots} entries for {tokens} tokens")]
    SlotMappingLength { slots: usize, tokens: usize },

    #[error("cache shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_slot_out_of_range() {
        let e = CacheError::SlotOutOfRange {
            slot: 70,
            capacity: 64,
        };
        assert_eq!(
            e.to_string(),
            "slot 70 is out of range for cache capacity 64"
        );
    }

    #[test]
    fn error_display_block_out_of_range() {
        let e = CacheError::BlockOutOfRange {
            block_id: 9,
            num_blocks: 8,
        };
        assert_eq!(e.to_string(), "block 9 is out of range for 8 cache blocks");
    }

    #[test]
    fn error_display_slot_mapping_length() {
        let e = CacheError::SlotMappingLength { slots: 3, tokens: 4 };
        assert_eq!(e.to_string(), "slot mapping has 3 entries for 4 tokens");
    }
}
