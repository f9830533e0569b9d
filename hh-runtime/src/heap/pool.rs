use {
    crate::config::CHUNK_ALIGN,
    std::{
        alloc::{Layout, alloc, dealloc},
        collections::BTreeMap,
        ptr::NonNull,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
    },
    thiserror::Error,
};

/// Source of raw memory blocks for chunks.
///
/// Pools are shared by all processors, so every method takes `&self`.
pub trait ChunkPool
{
    /// Allocate a block of at least `*size` bytes.
    ///
    /// On success `*size` is updated to the actual size of the block,
    /// which may be larger than requested.
    /// Returns [`None`] if the pool cannot satisfy the request.
    fn allocate(&self, size: &mut usize) -> Option<NonNull<u8>>;

    /// Return a block to the pool.
    ///
    /// # Safety
    ///
    /// The block must have been returned by [`allocate`][`Self::allocate`]
    /// on this pool, must not have been freed since,
    /// and must not be accessed afterwards.
    unsafe fn free(&self, block: NonNull<u8>);

    /// The size of a block, or zero if the pool does not know the block.
    fn size(&self, block: NonNull<u8>) -> usize;

    /// Find the block that contains the given address.
    fn find(&self, address: *const u8) -> Option<NonNull<u8>>;
}

/// Chunk pool handle shared between heaps and processors.
pub type SharedPool = Arc<dyn ChunkPool + Send + Sync>;

/// Returned when the chunk pool cannot satisfy an allocation.
///
/// This is never fatal by itself;
/// the caller is expected to collect or grow the heap and try again.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("Chunk pool cannot provide {requested} bytes")]
pub struct AllocError
{
    /// Number of bytes that were requested, including the chunk header.
    pub requested: usize,
}

/// Chunk pool backed by the global allocator.
///
/// Blocks are aligned to [`CHUNK_ALIGN`] and their sizes are rounded up
/// to the pool granule. Blocks still allocated when the pool is dropped
/// are released at that point.
pub struct SystemChunkPool
{
    /// Allocation granule; a multiple of [`CHUNK_ALIGN`].
    granule: usize,

    /// Maximum number of bytes allocated at once, if limited.
    capacity: Option<usize>,

    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner
{
    /// Size of each block, keyed by the address of the block.
    blocks: BTreeMap<usize, usize>,

    /// Sum of the sizes of all blocks.
    in_use: usize,
}

impl SystemChunkPool
{
    /// Create a pool without a capacity limit.
    pub fn new() -> Self
    {
        Self::with_capacity(None)
    }

    /// Create a pool that hands out at most `capacity` bytes at once.
    pub fn with_capacity(capacity: Option<usize>) -> Self
    {
        let granule = page_size().max(CHUNK_ALIGN)
            .next_multiple_of(CHUNK_ALIGN);
        Self{
            granule,
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a pool and wrap it in a shared handle.
    pub fn shared(capacity: Option<usize>) -> SharedPool
    {
        Arc::new(Self::with_capacity(capacity))
    }

    /// The size to which every request is rounded up.
    pub fn granule(&self) -> usize
    {
        self.granule
    }

    /// Number of bytes currently handed out.
    pub fn bytes_in_use(&self) -> usize
    {
        self.lock().in_use
    }

    /// Number of blocks currently handed out.
    pub fn blocks_in_use(&self) -> usize
    {
        self.lock().blocks.len()
    }

    fn lock(&self) -> MutexGuard<Inner>
    {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SystemChunkPool
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl ChunkPool for SystemChunkPool
{
    fn allocate(&self, size: &mut usize) -> Option<NonNull<u8>>
    {
        let rounded = (*size).max(1).checked_next_multiple_of(self.granule)?;
        let layout = Layout::from_size_align(rounded, CHUNK_ALIGN).ok()?;

        let mut inner = self.lock();

        let in_use = inner.in_use.checked_add(rounded)?;
        if self.capacity.is_some_and(|capacity| in_use > capacity) {
            return None;
        }

        // SAFETY: The layout has a non-zero size.
        let block = NonNull::new(unsafe { alloc(layout) })?;

        inner.blocks.insert(block.as_ptr() as usize, rounded);
        inner.in_use = in_use;

        *size = rounded;
        Some(block)
    }

    unsafe fn free(&self, block: NonNull<u8>)
    {
        let mut inner = self.lock();
        let size = inner.blocks.remove(&(block.as_ptr() as usize))
            .expect("Block was not allocated by this pool");
        inner.in_use -= size;

        // SAFETY: This matches the layout used by allocate.
        let layout = Layout::from_size_align_unchecked(size, CHUNK_ALIGN);
        dealloc(block.as_ptr(), layout);
    }

    fn size(&self, block: NonNull<u8>) -> usize
    {
        let inner = self.lock();
        inner.blocks.get(&(block.as_ptr() as usize)).copied().unwrap_or(0)
    }

    fn find(&self, address: *const u8) -> Option<NonNull<u8>>
    {
        let address = address as usize;
        let inner = self.lock();
        let (&start, &size) = inner.blocks.range(..= address).next_back()?;
        if address - start < size {
            NonNull::new(start as *mut u8)
        } else {
            None
        }
    }
}

impl Drop for SystemChunkPool
{
    fn drop(&mut self)
    {
        let inner = self.inner.get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (&start, &size) in &inner.blocks {
            // SAFETY: This matches the layout used by allocate.
            unsafe {
                let layout = Layout::from_size_align_unchecked(size, CHUNK_ALIGN);
                dealloc(start as *mut u8, layout);
            }
        }
    }
}

/// The page size of the operating system.
fn page_size() -> usize
{
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(CHUNK_ALIGN)
}
