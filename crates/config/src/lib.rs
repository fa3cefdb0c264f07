pub type ColorIndexType = u32;
pub type UnitigIndexType = u32;

/// Maximum supported k-mer length with 2-bit packing into a `u64`.
pub const MAX_KMER_LENGTH: usize = 31;
pub const DEFAULT_KMER_LENGTH: usize = 31;

/// Number of independent hash functions tried before a unitig falls back
/// to the overflow table. Accessor byte values are `1..=MAX_COLOR_HASHES`,
/// with 0 reserved for the overflow path.
pub const MAX_COLOR_HASHES: usize = 31;

pub const COLOR_STRIPES_COUNT_LOG: usize = 8;
pub const COLOR_STRIPES_COUNT: usize = 1 << COLOR_STRIPES_COUNT_LOG;

/// Sequences shared and processed by the worker threads at the same time.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 10000;
pub const READ_CHUNKS_QUEUE_SIZE: usize = 8;

pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 1024 * 1024 * 4;

pub const COLORS_FILE_EXTENSION: &str = "bfg_colors";
