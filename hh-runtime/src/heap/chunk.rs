use {
    super::{ChunkPool, HeapRef},
    crate::config::OBJECT_ALIGN,
    std::{fmt, mem::size_of, ptr::{self, NonNull}},
};

/// Nesting depth of a level in the hierarchical heap.
pub type Level = u32;

/// Level reported for chunks and lists that have no level.
///
/// No level head ever carries this level.
pub const INVALID_LEVEL: Level = Level::MAX;

/// Data at the start of each chunk.
pub struct ChunkInfo
{
    /// Boundary between allocated and free bytes in this chunk.
    pub (super) frontier: NonNull<u8>,

    /// Next chunk in the chain of this level.
    next_chunk: Option<ChunkRef>,

    /// Whether the chunk may hold more than one object.
    ///
    /// Chunks dedicated to a single large object
    /// must not be resumed into for further allocation.
    might_contain_multiple_objects: bool,

    /// Level head or normal chunk.
    pub (super) kind: ChunkKind,
}

/// The two forms of a chunk header.
///
/// A chunk is a level head exactly when its kind is [`ChunkKind::Head`].
/// Demoting a level head to a normal chunk replaces the entire variant,
/// so there is never a header that is half head and half normal.
#[allow(missing_docs)]
pub enum ChunkKind
{
    Head(LevelHead),
    Normal{level_head: ChunkRef},
}

/// Metadata kept in the level head of each level.
pub struct LevelHead
{
    /// Level of the chain this chunk heads; never [`INVALID_LEVEL`].
    pub level: Level,

    /// Next level head in the level list, at a strictly lower level.
    pub next_head: Option<ChunkRef>,

    /// Last chunk in the chain of this level.
    pub last_chunk: ChunkRef,

    /// Hierarchical heap that owns this level.
    pub containing_heap: HeapRef,
}

/// Non-owning reference to a chunk.
///
/// The reference points at the chunk header,
/// which is also the address of the pool block.
/// References may dangle once the chunk is freed,
/// so most methods assume the chunk is live.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChunkRef
{
    inner: NonNull<ChunkInfo>,
}

// SAFETY: Chunks are only mutated by whoever has exclusive
//         access to the level list that reaches them.
unsafe impl Send for ChunkRef { }
unsafe impl Sync for ChunkRef { }

impl ChunkRef
{
    /// Turn a freshly allocated pool block into a chunk.
    ///
    /// # Safety
    ///
    /// The block must be live, aligned for [`ChunkInfo`],
    /// and larger than the chunk header.
    pub (super) unsafe fn init(block: NonNull<u8>, kind: ChunkKind) -> Self
    {
        let inner = block.cast::<ChunkInfo>();
        let frontier = NonNull::new_unchecked(
            block.as_ptr().add(size_of::<ChunkInfo>()),
        );
        let info = ChunkInfo{
            frontier,
            next_chunk: None,
            might_contain_multiple_objects: true,
            kind,
        };
        ptr::write(inner.as_ptr(), info);
        Self{inner}
    }

    /// Reinterpret the address of a pool block as a chunk.
    ///
    /// # Safety
    ///
    /// The block must hold an initialized chunk header.
    pub unsafe fn from_block(block: NonNull<u8>) -> Self
    {
        Self{inner: block.cast()}
    }

    /// The address of the pool block that makes up the chunk.
    pub fn block(self) -> NonNull<u8>
    {
        self.inner.cast()
    }

    /// Shared access to the header.
    pub (super) fn info<'a>(self) -> &'a ChunkInfo
    {
        // SAFETY: References to live chunks point at initialized headers.
        unsafe { &*self.inner.as_ptr() }
    }

    /// Exclusive access to the header.
    ///
    /// Callers hold exclusive access to the level list
    /// and must not keep the returned reference across other accesses.
    #[allow(clippy::mut_from_ref)]
    pub (super) fn info_mut<'a>(self) -> &'a mut ChunkInfo
    {
        // SAFETY: See the method documentation.
        unsafe { &mut *self.inner.as_ptr() }
    }

    /// The first allocable byte of the chunk.
    pub fn start(self) -> NonNull<u8>
    {
        // SAFETY: Every chunk is larger than its header.
        unsafe {
            NonNull::new_unchecked(
                self.block().as_ptr().add(size_of::<ChunkInfo>()),
            )
        }
    }

    /// The boundary between allocated and free bytes.
    pub fn frontier(self) -> NonNull<u8>
    {
        self.info().frontier
    }

    /// The end of the chunk, derived from the size of the pool block.
    pub fn limit(self, pool: &dyn ChunkPool) -> NonNull<u8>
    {
        let size = pool.size(self.block());
        debug_assert_ne!(size, 0, "Chunk {self:?} is not in the pool");
        // SAFETY: The pool block spans size bytes.
        unsafe { NonNull::new_unchecked(self.block().as_ptr().add(size)) }
    }

    /// Number of bytes between the frontier and the limit.
    pub fn bytes_free(self, pool: &dyn ChunkPool) -> usize
    {
        self.limit(pool).as_ptr() as usize - self.frontier().as_ptr() as usize
    }

    /// Number of bytes between the start and the frontier.
    pub fn bytes_used(self) -> usize
    {
        self.frontier().as_ptr() as usize - self.start().as_ptr() as usize
    }

    /// Record a new frontier for the chunk.
    ///
    /// In debug builds this checks that the frontier
    /// still lies within the pool block of this chunk.
    pub fn update_frontier(self, pool: &dyn ChunkPool, frontier: NonNull<u8>)
    {
        debug_assert_eq!(
            pool.find(frontier.as_ptr().wrapping_sub(1)),
            Some(self.block()),
            "Frontier {frontier:?} is outside chunk {self:?}",
        );
        debug_assert!(frontier >= self.start());
        self.info_mut().frontier = frontier;
    }

    /// Attempt to allocate memory for an object within the chunk.
    ///
    /// If there is insufficient room inside the chunk, returns [`None`].
    /// Otherwise the frontier is bumped and its old value returned.
    pub fn try_alloc(self, pool: &dyn ChunkPool, size: usize)
        -> Option<NonNull<u8>>
    {
        let size = size.checked_next_multiple_of(OBJECT_ALIGN)?;
        if size > self.bytes_free(pool) {
            return None;
        }

        let object = self.frontier();
        // SAFETY: We just checked that this is in bounds.
        let frontier = unsafe {
            NonNull::new_unchecked(object.as_ptr().add(size))
        };
        self.update_frontier(pool, frontier);

        Some(object)
    }

    /// The next chunk in the chain of this level.
    pub fn next_chunk(self) -> Option<ChunkRef>
    {
        self.info().next_chunk
    }

    /// Whether the chunk may hold more than one object.
    pub fn might_contain_multiple_objects(self) -> bool
    {
        self.info().might_contain_multiple_objects
    }

    /// Dedicate or undedicate the chunk to a single object.
    pub fn set_might_contain_multiple_objects(self, value: bool)
    {
        self.info_mut().might_contain_multiple_objects = value;
    }

    /// The header form of this chunk.
    pub fn kind<'a>(self) -> &'a ChunkKind
    {
        &self.info().kind
    }

    /// Level head metadata, if this chunk is a level head.
    pub fn as_level_head<'a>(self) -> Option<&'a LevelHead>
    {
        match &self.info().kind {
            ChunkKind::Head(head) => Some(head),
            ChunkKind::Normal{..} => None,
        }
    }

    /// Level head metadata, for chunks known to be level heads.
    pub (super) fn head_mut<'a>(self) -> &'a mut LevelHead
    {
        match &mut self.info_mut().kind {
            ChunkKind::Head(head) => head,
            ChunkKind::Normal{..} =>
                panic!("Chunk {self:?} is not a level head"),
        }
    }

    /// Level head metadata, for chunks known to be level heads.
    pub (super) fn head<'a>(self) -> &'a LevelHead
    {
        self.as_level_head()
            .unwrap_or_else(|| panic!("Chunk {self:?} is not a level head"))
    }

    /// Whether this chunk is a level head.
    pub fn is_level_head(self) -> bool
    {
        self.as_level_head().is_some()
    }

    /// The level of this chunk if it is a level head,
    /// or [`INVALID_LEVEL`] for a normal chunk.
    pub fn level(self) -> Level
    {
        self.as_level_head().map_or(INVALID_LEVEL, |head| head.level)
    }

    /// The level head of the chain this chunk belongs to.
    ///
    /// Follows back-references until a level head is reached.
    pub fn level_head(self) -> ChunkRef
    {
        let mut cursor = self;
        while let ChunkKind::Normal{level_head} = cursor.kind() {
            cursor = *level_head;
        }
        cursor
    }

    /// The hierarchical heap that owns the level of this chunk.
    pub fn containing_heap(self) -> HeapRef
    {
        self.level_head().head().containing_heap
    }

    /// Append a chunk to the chain of this level head.
    pub (super) fn push_chunk(self, chunk: ChunkRef)
    {
        // The last chunk may be this chunk, so finish with one
        // header before touching the other.
        let last_chunk = self.head().last_chunk;
        last_chunk.info_mut().next_chunk = Some(chunk);
        self.head_mut().last_chunk = chunk;
    }

    /// Append the chain of another level head to the chain of this one.
    ///
    /// The other level head is demoted to a normal chunk
    /// whose back-reference points at this level head.
    pub (super) fn append_chain(self, other: ChunkRef)
    {
        debug_assert_ne!(self, other);
        debug_assert!(self.head().last_chunk.next_chunk().is_none());

        let other_last = other.head().last_chunk;
        self.push_chunk(other);
        self.head_mut().last_chunk = other_last;

        other.info_mut().kind = ChunkKind::Normal{level_head: self};
    }

    /// Relabel the level of this level head.
    pub (super) fn set_level(self, level: Level)
    {
        debug_assert_ne!(level, INVALID_LEVEL);
        self.head_mut().level = level;
    }

    /// Link this level head to the next one.
    pub (super) fn set_next_head(self, next_head: Option<ChunkRef>)
    {
        self.head_mut().next_head = next_head;
    }

    /// Iterate over the chain starting at this chunk.
    pub fn chain(self) -> Chain
    {
        Chain{cursor: Some(self)}
    }
}

impl fmt::Debug for ChunkRef
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        fmt::Debug::fmt(&self.inner, f)
    }
}

/// Iterator over the chunks of a chain.
///
/// The next chunk is read only when it is requested,
/// so chunks appended while iterating are also produced.
pub struct Chain
{
    cursor: Option<ChunkRef>,
}

impl Iterator for Chain
{
    type Item = ChunkRef;

    fn next(&mut self) -> Option<Self::Item>
    {
        let chunk = self.cursor?;
        self.cursor = chunk.next_chunk();
        Some(chunk)
    }
}
