pub mod attention;

pub use attention::{AttentionMetadata, FlashInferImpl};
