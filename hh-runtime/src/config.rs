//! Tunable constants and runtime configuration.

use {crate::heap::ChunkInfo, std::mem::size_of};

/// Alignment for chunks.
///
/// The address of every chunk is a multiple of this value,
/// and pool allocations are rounded up to a multiple of it.
pub const CHUNK_ALIGN: usize = 4096;

/// Minimum alignment for objects and frontiers.
pub const OBJECT_ALIGN: usize = 8;

/// Default allocable size for chunks.
///
/// Together with the chunk header this fills exactly one [`CHUNK_ALIGN`].
pub const DEFAULT_CHUNK_SIZE: usize = CHUNK_ALIGN - size_of::<ChunkInfo>();

/// Distance between `limit` and `limit_plus_slop`.
///
/// The mutator may overshoot `limit` by up to this many bytes
/// without checking, so every region handed to it must have them.
pub const HEAP_LIMIT_SLOP: usize = 512;

/// Configuration shared by all processors of a runtime.
#[derive(Clone, Debug)]
pub struct RuntimeConfig
{
    /// Number of processors (worker threads).
    pub processors: usize,

    /// Distance between `limit` and `limit_plus_slop`.
    pub limit_slop: usize,

    /// Smallest allocable size requested when extending a heap.
    pub min_chunk_size: usize,

    /// Bytes a thread may allocate before the local assurance check
    /// requests a collection.
    pub collection_threshold: usize,
}

impl Default for RuntimeConfig
{
    fn default() -> Self
    {
        Self{
            processors: 1,
            limit_slop: HEAP_LIMIT_SLOP,
            min_chunk_size: DEFAULT_CHUNK_SIZE,
            collection_threshold: 4 << 20,
        }
    }
}
