mod compression;
pub mod encoder;

pub use compression::{CompressionStats, SkipReason, ToonCompressor};
pub use encoder::encode;
