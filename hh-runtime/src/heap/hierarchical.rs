use {
    super::{
        AllocError,
        ChunkPool,
        ChunkRef,
        Level,
        LevelList,
        SharedPool,
        allocate_chunk,
    },
    std::{
        fmt,
        marker::PhantomPinned,
        mem,
        pin::Pin,
        ptr::NonNull,
        sync::Arc,
    },
};

/// Per-thread heap organized by nesting depth.
///
/// A hierarchical heap owns the chunks of its level list
/// and returns them to its pool when dropped.
pub struct HierarchicalHeap
{
    /// Level heads record the address of their containing heap.
    _pinned: PhantomPinned,

    pool: SharedPool,

    /// Levels of the heap, highest first.
    level_list: LevelList,

    /// Current nesting depth of the thread that owns the heap.
    depth: Level,
}

impl HierarchicalHeap
{
    /// Create an empty heap that allocates chunks from the given pool.
    pub fn new(pool: SharedPool) -> Pin<Box<Self>>
    {
        Box::pin(Self{
            _pinned: PhantomPinned,
            pool,
            level_list: LevelList::new(),
            depth: 0,
        })
    }

    /// Reference to this heap, as recorded in its level heads.
    pub fn handle(&self) -> HeapRef
    {
        HeapRef{inner: NonNull::from(self)}
    }

    /// The pool that chunks of this heap come from.
    pub fn pool(&self) -> &SharedPool
    {
        &self.pool
    }

    /// The levels of this heap.
    pub fn level_list(&self) -> &LevelList
    {
        &self.level_list
    }

    /// Exclusive access to the levels of this heap.
    pub fn level_list_mut(self: Pin<&mut Self>) -> &mut LevelList
    {
        // SAFETY: The level list is not structurally pinned.
        unsafe { &mut self.get_unchecked_mut().level_list }
    }

    /// Current nesting depth.
    pub fn depth(&self) -> Level
    {
        self.depth
    }

    /// Change the current nesting depth.
    pub fn set_depth(self: Pin<&mut Self>, depth: Level)
    {
        // SAFETY: The depth is not structurally pinned.
        unsafe { self.get_unchecked_mut().depth = depth; }
    }

    /// The first chunk of the chain at the given level.
    pub fn chunk_list(&self, level: Level) -> Option<ChunkRef>
    {
        self.level_list.head_at(level)
    }

    /// The last chunk of the chain at the given level.
    pub fn last_chunk(&self, level: Level) -> Option<ChunkRef>
    {
        self.level_list.last_chunk(level)
    }

    /// Total number of bytes allocated in all chunks of the heap.
    pub fn bytes_used(&self) -> usize
    {
        self.level_list.heads()
            .flat_map(ChunkRef::chain)
            .map(ChunkRef::bytes_used)
            .sum()
    }

    /// Add a chunk with at least `bytes` allocable bytes at `level`.
    ///
    /// The chunk becomes the last chunk of the level,
    /// and the level is created if the heap did not have it.
    pub fn extend(self: Pin<&mut Self>, level: Level, bytes: usize)
        -> Result<ChunkRef, AllocError>
    {
        let handle = self.handle();

        // SAFETY: Nothing is moved out of the heap.
        let this = unsafe { self.get_unchecked_mut() };
        let pool: &dyn ChunkPool = &*this.pool;

        let allocation = match this.level_list.head_at(level) {
            Some(head) => allocate_chunk(pool, head, bytes)?,
            None =>
                this.level_list
                    .allocate_level_head(pool, bytes, level, handle)?,
        };

        log::trace!(
            "Extended heap {handle:?} at level {level} with chunk {:?}",
            allocation.chunk,
        );

        Ok(allocation.chunk)
    }

    /// Allocate a chunk dedicated to a single object of `bytes` bytes.
    ///
    /// Returns the address of the object.
    /// The chunk is marked as not containing multiple objects,
    /// so it is never resumed for further allocation.
    pub fn allocate_large(self: Pin<&mut Self>, level: Level, bytes: usize)
        -> Result<NonNull<u8>, AllocError>
    {
        let pool = self.pool.clone();
        let chunk = self.extend(level, bytes)?;
        let object = chunk.try_alloc(&*pool, bytes)
            .ok_or(AllocError{requested: bytes})?;
        chunk.set_might_contain_multiple_objects(false);
        Ok(object)
    }

    /// Free every level at or above `min_level`.
    pub fn free_levels(self: Pin<&mut Self>, min_level: Level)
    {
        // SAFETY: Nothing is moved out of the heap.
        let this = unsafe { self.get_unchecked_mut() };
        this.level_list.free_chunks(&*this.pool, min_level);
    }

    /// Take over all levels of another heap.
    ///
    /// The levels are merged into this heap
    /// and record this heap as their containing heap.
    /// Both heaps must use the same pool.
    pub fn absorb(self: Pin<&mut Self>, mut other: Pin<Box<Self>>)
    {
        debug_assert!(
            Arc::as_ptr(&self.pool) as *const u8
                == Arc::as_ptr(&other.pool) as *const u8,
            "Cannot absorb a heap from a different pool",
        );

        let mut levels = mem::take(other.as_mut().level_list_mut());
        levels.update_containing_heap(self.handle());
        self.level_list_mut().merge(levels);
    }
}

impl Drop for HierarchicalHeap
{
    fn drop(&mut self)
    {
        let Self{pool, level_list, ..} = self;
        level_list.free_chunks(&**pool, 0);
    }
}

/// Non-owning reference to a hierarchical heap.
///
/// Heap references are recorded in level heads
/// and compared to find the owner of an object.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct HeapRef
{
    inner: NonNull<HierarchicalHeap>,
}

// SAFETY: Heap references are only dereferenced
//         by whoever has exclusive access to the heap.
unsafe impl Send for HeapRef { }
unsafe impl Sync for HeapRef { }

impl HeapRef
{
    /// The address of the heap.
    pub fn as_ptr(self) -> *const HierarchicalHeap
    {
        self.inner.as_ptr()
    }

    /// Access the heap.
    ///
    /// # Safety
    ///
    /// The heap must still be alive and must not be mutated
    /// for as long as the returned reference is used.
    pub unsafe fn as_ref<'a>(self) -> &'a HierarchicalHeap
    {
        &*self.inner.as_ptr()
    }
}

impl fmt::Debug for HeapRef
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        fmt::Debug::fmt(&self.inner, f)
    }
}
