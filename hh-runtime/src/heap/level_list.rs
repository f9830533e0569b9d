use {
    super::{
        AllocError,
        ChunkInfo,
        ChunkKind,
        ChunkPool,
        ChunkRef,
        HeapRef,
        INVALID_LEVEL,
        Level,
        LevelHead,
    },
    smallvec::SmallVec,
    std::{cmp::Ordering, mem::size_of, ptr::NonNull},
    thiserror::Error,
};

/// Descending sequence of level heads, each heading a chain of chunks.
///
/// Level lists do not own a pool handle, so dropping a level list
/// does not free its chunks; use [`free_chunks`][`Self::free_chunks`].
/// None of the methods synchronize; the caller must have
/// exclusive access to every chunk reachable from the list.
#[derive(Debug, Default)]
pub struct LevelList
{
    first: Option<ChunkRef>,
}

/// Result of allocating a chunk.
#[derive(Clone, Copy, Debug)]
pub struct Allocation
{
    /// The new chunk, already linked into its level.
    pub chunk: ChunkRef,

    /// The end of the pool block, which may exceed the requested size.
    pub end: NonNull<u8>,
}

/// Arguments passed to an [`ObjectVisitor`] for each object.
#[derive(Clone, Copy, Debug)]
pub struct TraceArgs
{
    /// The heap on whose behalf the list is traversed.
    pub heap: HeapRef,

    /// Lowest level the visitor is concerned with.
    pub min_level: Level,

    /// Deepest level visited so far in this traversal.
    pub max_level: Level,

    /// Whether the object might be referenced from another heap.
    pub might_be_entangled: bool,
}

/// Walks a single object during garbage collection tracing.
pub trait ObjectVisitor
{
    /// Visit the object that begins at `object`.
    ///
    /// Returns the address just past the object.
    /// The visitor may allocate into `destination`,
    /// which is the level list being traversed.
    fn visit(
        &mut self,
        destination: &mut LevelList,
        object: NonNull<u8>,
        args: &TraceArgs,
    ) -> NonNull<u8>;
}

/// Returned by [`LevelList::check_invariants`].
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum InvariantViolation
{
    #[error("Chunk {0:?} is linked as a level head but is a normal chunk")]
    NotALevelHead(ChunkRef),

    #[error("Level {level} follows level {previous}")]
    LevelOrder{previous: Level, level: Level},

    #[error("Frontier of chunk {0:?} is outside the chunk")]
    FrontierOutsideChunk(ChunkRef),

    #[error("Chunk {0:?} is a level head in the middle of a chain")]
    UnexpectedLevelHead(ChunkRef),

    #[error("Chunk {chunk:?} resolves to level head {actual:?} \
             but is linked under {expected:?}")]
    WrongLevelHead{chunk: ChunkRef, expected: ChunkRef, actual: ChunkRef},

    #[error("Level head {head:?} caches {cached:?} as its last chunk \
             but the chain ends at {actual:?}")]
    StaleLastChunk{head: ChunkRef, cached: ChunkRef, actual: ChunkRef},
}

/// Allocate a chunk and append it to the chain of a level head.
///
/// `allocable_size` excludes the chunk header.
/// Appending uses the cached last chunk, so it takes constant time.
pub fn allocate_chunk(
    pool: &dyn ChunkPool,
    level_head: ChunkRef,
    allocable_size: usize,
) -> Result<Allocation, AllocError>
{
    debug_assert!(level_head.is_level_head());

    let (block, end) = allocate_block(pool, allocable_size)?;

    // SAFETY: The block is fresh and larger than the header.
    let chunk = unsafe { ChunkRef::init(block, ChunkKind::Normal{level_head}) };
    level_head.push_chunk(chunk);

    Ok(Allocation{chunk, end})
}

/// Obtain a block with room for the header and `allocable_size` bytes.
fn allocate_block(pool: &dyn ChunkPool, allocable_size: usize)
    -> Result<(NonNull<u8>, NonNull<u8>), AllocError>
{
    let requested = allocable_size.saturating_add(size_of::<ChunkInfo>());

    let mut size = requested;
    let block = pool.allocate(&mut size).ok_or(AllocError{requested})?;
    debug_assert!(size >= requested);

    // SAFETY: The pool block spans size bytes.
    let end = unsafe { NonNull::new_unchecked(block.as_ptr().add(size)) };

    Ok((block, end))
}

impl LevelList
{
    /// Create an empty level list.
    pub const fn new() -> Self
    {
        Self{first: None}
    }

    /// Whether the list has no levels.
    pub fn is_empty(&self) -> bool
    {
        self.first.is_none()
    }

    /// The level head at the highest level.
    pub fn first_head(&self) -> Option<ChunkRef>
    {
        self.first
    }

    /// The highest level in the list, or [`INVALID_LEVEL`] if it is empty.
    pub fn highest_level(&self) -> Level
    {
        self.first.map_or(INVALID_LEVEL, ChunkRef::level)
    }

    /// Iterate over the level heads, from highest to lowest level.
    pub fn heads(&self) -> Heads
    {
        Heads{cursor: self.first}
    }

    /// The levels in the list, from highest to lowest.
    pub fn levels(&self) -> SmallVec<[Level; 8]>
    {
        self.heads().map(ChunkRef::level).collect()
    }

    /// The level head at the given level.
    pub fn head_at(&self, level: Level) -> Option<ChunkRef>
    {
        self.heads()
            .take_while(|head| head.level() >= level)
            .find(|head| head.level() == level)
    }

    /// The last chunk of the chain at the given level.
    pub fn last_chunk(&self, level: Level) -> Option<ChunkRef>
    {
        self.head_at(level).map(|head| head.head().last_chunk)
    }

    /// Allocate a level head chunk and merge it into the list.
    ///
    /// If the list already has a chain at this level,
    /// the new chunk is appended to that chain instead,
    /// and does not remain a level head.
    pub fn allocate_level_head(
        &mut self,
        pool: &dyn ChunkPool,
        allocable_size: usize,
        level: Level,
        containing_heap: HeapRef,
    ) -> Result<Allocation, AllocError>
    {
        debug_assert_ne!(level, INVALID_LEVEL);

        let (block, end) = allocate_block(pool, allocable_size)?;

        // SAFETY: The block is fresh and larger than the header.
        let chunk = unsafe {
            let last_chunk = ChunkRef::from_block(block);
            let head = LevelHead{
                level,
                next_head: None,
                last_chunk,
                containing_heap,
            };
            ChunkRef::init(block, ChunkKind::Head(head))
        };

        self.merge(Self{first: Some(chunk)});

        Ok(Allocation{chunk, end})
    }

    /// Merge another level list into this one.
    ///
    /// Levels present in only one list are spliced in order.
    /// Where both lists have a level, the chain of the other list
    /// is appended to the chain of this list,
    /// and the other level head is demoted to a normal chunk.
    pub fn merge(&mut self, other: LevelList)
    {
        let mut cursor1 = self.first.take();
        let mut cursor2 = other.first;

        let mut first = None;
        let mut last: Option<ChunkRef> = None;
        let mut emit = |head: ChunkRef| {
            match last {
                Some(last) => last.set_next_head(Some(head)),
                None => first = Some(head),
            }
            last = Some(head);
        };

        while let (Some(head1), Some(head2)) = (cursor1, cursor2) {
            match head1.level().cmp(&head2.level()) {
                Ordering::Greater => {
                    cursor1 = head1.head().next_head;
                    emit(head1);
                },
                Ordering::Less => {
                    cursor2 = head2.head().next_head;
                    emit(head2);
                },
                Ordering::Equal => {
                    // Read the link before the head is demoted.
                    cursor2 = head2.head().next_head;
                    head1.append_chain(head2);
                    cursor1 = head1.head().next_head;
                    emit(head1);
                },
            }
        }

        // At most one of the cursors is left; it is already in order.
        let rest = cursor1.or(cursor2);
        match last {
            Some(last) => last.set_next_head(rest),
            None => first = rest,
        }

        self.first = first;
    }

    /// Move the chain at `level` down to `level - 1`.
    ///
    /// If the list has a chain at `level - 1`,
    /// the chain at `level` is appended to it.
    /// Otherwise the chain is relabeled and stays in place.
    /// Does nothing if the list has no chain at `level`.
    pub fn promote(&mut self, level: Level)
    {
        debug_assert_ne!(level, 0, "Cannot promote chunks below level 0");
        let Some(lower) = level.checked_sub(1) else { return };

        // Find the first head at or below the level.
        let mut previous = None;
        let mut cursor = self.first;
        while let Some(head) = cursor {
            if head.level() <= level {
                break;
            }
            previous = Some(head);
            cursor = head.head().next_head;
        }

        let Some(chain) = cursor else { return };
        if chain.level() < level {
            return;
        }

        // Unlink the chain.
        let next = chain.head().next_head;
        self.relink(previous, next);

        match next {
            Some(next) if next.level() == lower => {
                next.append_chain(chain);
            },
            _ => {
                chain.set_level(lower);
                chain.set_next_head(next);
                self.relink(previous, Some(chain));
            },
        }
    }

    /// Free every chain at or above `min_level`.
    ///
    /// Chains are unlinked from the front of the list
    /// and each of their chunks is returned to the pool.
    /// Lower levels are left untouched.
    pub fn free_chunks(&mut self, pool: &dyn ChunkPool, min_level: Level)
    {
        while let Some(head) = self.first {
            if head.level() < min_level {
                break;
            }

            self.first = head.head().next_head;

            let mut cursor = Some(head);
            while let Some(chunk) = cursor {
                cursor = chunk.next_chunk();
                // SAFETY: The chunk was allocated from this pool,
                //         and is no longer reachable from the list.
                unsafe { pool.free(chunk.block()); }
            }
        }
    }

    /// Visit every object in every chunk of the list.
    ///
    /// Objects are visited from the highest level to the lowest,
    /// and within a chain from the first chunk to the last.
    /// The visitor may allocate into this list; chunks appended
    /// to a chain that is being walked, and objects allocated
    /// below the frontier of the chunk being walked, are visited too.
    pub fn for_each_object<V>(
        &mut self,
        visitor: &mut V,
        heap: HeapRef,
        min_level: Level,
    )
        where V: ObjectVisitor + ?Sized
    {
        let mut args = TraceArgs{
            heap,
            min_level,
            max_level: 0,
            might_be_entangled: false,
        };

        let mut cursor = self.first;
        while let Some(head) = cursor {
            args.max_level = head.level();

            let mut chunk = Some(head);
            while let Some(current) = chunk {
                let mut object = current.start();
                // The frontier is read again after every visit,
                // because the visitor may allocate into this chunk.
                while object < current.frontier() {
                    object = visitor.visit(self, object, &args);
                }
                chunk = current.next_chunk();
            }

            cursor = head.head().next_head;
        }
    }

    /// Record `heap` as the owner of every level in the list.
    pub fn update_containing_heap(&mut self, heap: HeapRef)
    {
        for head in self.heads() {
            head.head_mut().containing_heap = heap;
        }
    }

    /// Check the invariants of the list and of every chain in it.
    pub fn check_invariants(&self, pool: &dyn ChunkPool)
        -> Result<(), InvariantViolation>
    {
        let mut previous = None;
        let mut cursor = self.first;
        while let Some(head) = cursor {
            let Some(metadata) = head.as_level_head()
                else { return Err(InvariantViolation::NotALevelHead(head)) };

            let level = metadata.level;
            if let Some(previous) = previous {
                if level >= previous {
                    return Err(InvariantViolation::LevelOrder{previous, level});
                }
            }
            previous = Some(level);

            let mut actual = head;
            for chunk in head.chain() {
                let frontier = chunk.frontier().as_ptr().wrapping_sub(1);
                if pool.find(frontier) != Some(chunk.block()) {
                    return Err(InvariantViolation::FrontierOutsideChunk(chunk));
                }

                if chunk != head && chunk.is_level_head() {
                    return Err(InvariantViolation::UnexpectedLevelHead(chunk));
                }

                let resolved = chunk.level_head();
                if resolved != head {
                    return Err(InvariantViolation::WrongLevelHead{
                        chunk,
                        expected: head,
                        actual: resolved,
                    });
                }

                actual = chunk;
            }

            if metadata.last_chunk != actual {
                return Err(InvariantViolation::StaleLastChunk{
                    head,
                    cached: metadata.last_chunk,
                    actual,
                });
            }

            cursor = metadata.next_head;
        }
        Ok(())
    }

    /// Panic if the invariants do not hold.
    ///
    /// Does nothing unless debug assertions are enabled.
    pub fn assert_invariants(&self, pool: &dyn ChunkPool)
    {
        if cfg!(debug_assertions) {
            if let Err(err) = self.check_invariants(pool) {
                panic!("Level list invariant violated: {err}");
            }
        }
    }

    /// Point the link before a position in the list at `head`.
    fn relink(&mut self, previous: Option<ChunkRef>, head: Option<ChunkRef>)
    {
        match previous {
            Some(previous) => previous.set_next_head(head),
            None => self.first = head,
        }
    }
}

/// Iterator over the level heads of a level list.
pub struct Heads
{
    cursor: Option<ChunkRef>,
}

impl Iterator for Heads
{
    type Item = ChunkRef;

    fn next(&mut self) -> Option<Self::Item>
    {
        let head = self.cursor?;
        self.cursor = head.head().next_head;
        Some(head)
    }
}

/// Find the level head of the chunk that contains `address`.
///
/// # Safety
///
/// Every block in the pool must be a live chunk.
pub unsafe fn level_head_of(pool: &dyn ChunkPool, address: *const u8)
    -> Option<ChunkRef>
{
    let block = pool.find(address)?;
    Some(ChunkRef::from_block(block).level_head())
}

/// Find the level of the object at `address`.
///
/// # Safety
///
/// Every block in the pool must be a live chunk.
pub unsafe fn level_of(pool: &dyn ChunkPool, address: *const u8)
    -> Option<Level>
{
    level_head_of(pool, address).map(ChunkRef::level)
}

/// Find the hierarchical heap that owns the object at `address`.
///
/// # Safety
///
/// Every block in the pool must be a live chunk.
pub unsafe fn containing_heap_of(pool: &dyn ChunkPool, address: *const u8)
    -> Option<HeapRef>
{
    level_head_of(pool, address).map(|head| head.head().containing_heap)
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        crate::heap::{HierarchicalHeap, SystemChunkPool},
        proptest::{self as p, proptest},
        std::{collections::BTreeSet, sync::Arc},
    };

    const SIZE: usize = 256;

    /// Build a level list with `extra` normal chunks under each level.
    fn build(
        pool: &dyn ChunkPool,
        heap: HeapRef,
        levels: &[(Level, usize)],
    ) -> LevelList
    {
        let mut list = LevelList::new();
        for &(level, extra) in levels {
            let head = list.allocate_level_head(pool, SIZE, level, heap)
                .unwrap().chunk;
            for _ in 0 .. extra {
                allocate_chunk(pool, head, SIZE).unwrap();
            }
        }
        list.assert_invariants(pool);
        list
    }

    fn chain_at(list: &LevelList, level: Level) -> Vec<ChunkRef>
    {
        list.head_at(level).map_or(Vec::new(), |head| head.chain().collect())
    }

    /// Write an object record that stores its own size.
    fn write_object(pool: &dyn ChunkPool, chunk: ChunkRef, size: usize)
        -> Option<NonNull<u8>>
    {
        let object = chunk.try_alloc(pool, size)?;
        unsafe { object.cast::<u64>().as_ptr().write(size as u64); }
        Some(object)
    }

    fn object_size(object: NonNull<u8>) -> usize
    {
        unsafe { object.cast::<u64>().as_ptr().read() as usize }
    }

    fn next_object(object: NonNull<u8>) -> NonNull<u8>
    {
        let size = object_size(object);
        unsafe { NonNull::new_unchecked(object.as_ptr().add(size)) }
    }

    #[test]
    fn allocate_chunk_updates_last_chunk()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let mut list = LevelList::new();

        let head = list.allocate_level_head(&*pool, SIZE, 0, heap.handle())
            .unwrap().chunk;
        assert_eq!(list.last_chunk(0), Some(head));

        for _ in 0 .. 4 {
            let allocation = allocate_chunk(&*pool, head, SIZE).unwrap();
            assert_eq!(list.last_chunk(0), Some(allocation.chunk));
            assert_eq!(allocation.chunk.level_head(), head);
            assert!(
                allocation.end.as_ptr() as usize
                    - allocation.chunk.start().as_ptr() as usize
                    >= SIZE
            );
            list.assert_invariants(&*pool);
        }

        assert_eq!(head.chain().count(), 5);
        list.free_chunks(&*pool, 0);
    }

    #[test]
    fn allocate_level_head_fails_when_pool_is_exhausted()
    {
        let pool = Arc::new(SystemChunkPool::with_capacity(Some(0)));
        let heap = HierarchicalHeap::new(pool.clone());
        let mut list = LevelList::new();

        let result = list.allocate_level_head(&*pool, SIZE, 0, heap.handle());
        assert_eq!(
            result.unwrap_err(),
            AllocError{requested: SIZE + size_of::<ChunkInfo>()},
        );
        assert!(list.is_empty());
        assert_eq!(list.highest_level(), INVALID_LEVEL);
    }

    #[test]
    fn merge_interleaves_levels_and_concatenates_ties()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let heap = heap.handle();

        let mut a = build(&*pool, heap, &[(5, 0), (3, 2), (1, 1)]);
        let b = build(&*pool, heap, &[(4, 1), (3, 1)]);

        let a3 = chain_at(&a, 3);
        let b3 = chain_at(&b, 3);
        let b_head3 = b.head_at(3).unwrap();

        a.merge(b);
        a.assert_invariants(&*pool);

        assert_eq!(a.levels().as_slice(), [5, 4, 3, 1]);

        let merged3 = chain_at(&a, 3);
        let expected: Vec<_> = a3.iter().chain(&b3).copied().collect();
        assert_eq!(merged3, expected);
        assert_eq!(a.last_chunk(3), b3.last().copied());

        assert!(!b_head3.is_level_head());
        assert_eq!(b_head3.level_head(), a3[0]);

        a.free_chunks(&*pool, 0);
        assert_eq!(pool.blocks_in_use(), 0);
    }

    #[test]
    fn merge_with_empty_list()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());

        let mut a = LevelList::new();
        a.merge(build(&*pool, heap.handle(), &[(2, 1), (0, 0)]));
        assert_eq!(a.levels().as_slice(), [2, 0]);

        a.merge(LevelList::new());
        assert_eq!(a.levels().as_slice(), [2, 0]);
        a.assert_invariants(&*pool);
    }

    #[test]
    fn promote_relabels_chain_in_place()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let mut list = build(&*pool, heap.handle(), &[(5, 0), (3, 1), (0, 0)]);
        let chain = chain_at(&list, 3);

        list.promote(3);
        list.assert_invariants(&*pool);

        assert_eq!(list.levels().as_slice(), [5, 2, 0]);
        assert_eq!(chain_at(&list, 2), chain);
    }

    #[test]
    fn promote_merges_into_adjacent_level()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let mut list = build(&*pool, heap.handle(), &[(3, 1), (2, 2)]);
        let chain3 = chain_at(&list, 3);
        let chain2 = chain_at(&list, 2);

        list.promote(3);
        list.assert_invariants(&*pool);

        assert_eq!(list.levels().as_slice(), [2]);
        let expected: Vec<_> = chain2.iter().chain(&chain3).copied().collect();
        assert_eq!(chain_at(&list, 2), expected);
    }

    #[test]
    fn promote_without_chain_at_level_is_noop()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());

        // Lowest level already at the target minus one.
        let mut list = build(&*pool, heap.handle(), &[(2, 1)]);
        let chain = chain_at(&list, 2);
        list.promote(3);
        assert_eq!(list.levels().as_slice(), [2]);
        assert_eq!(chain_at(&list, 2), chain);

        // Levels above the target are left alone too.
        let mut list = build(&*pool, heap.handle(), &[(6, 0), (4, 0)]);
        list.promote(5);
        assert_eq!(list.levels().as_slice(), [6, 4]);

        let mut list = LevelList::new();
        list.promote(1);
        assert!(list.is_empty());
    }

    #[test]
    fn promote_only_level()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let mut list = build(&*pool, heap.handle(), &[(2, 0)]);
        // A chain at exactly the promoted level is relabelled.
        list.promote(2);
        assert_eq!(list.levels().as_slice(), [1]);
        list.assert_invariants(&*pool);
    }

    #[test]
    fn free_chunks_removes_levels_at_or_above_threshold()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let mut list = build(&*pool, heap.handle(), &[(5, 2), (3, 1), (1, 1)]);
        let survivor = list.head_at(1).unwrap();
        assert_eq!(pool.blocks_in_use(), 7);

        list.free_chunks(&*pool, 3);

        assert_eq!(list.first_head(), Some(survivor));
        assert_eq!(list.levels().as_slice(), [1]);
        assert_eq!(pool.blocks_in_use(), 2);
        list.assert_invariants(&*pool);

        list.free_chunks(&*pool, 0);
        assert!(list.is_empty());
        assert_eq!(pool.blocks_in_use(), 0);
    }

    #[test]
    fn lookup_resolves_through_demoted_heads()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let mut a = build(&*pool, heap.handle(), &[(2, 1)]);
        let b = build(&*pool, heap.handle(), &[(3, 0), (2, 2)]);
        let b2_last = b.last_chunk(2).unwrap();

        a.merge(b);
        a.promote(3);

        let object = write_object(&*pool, b2_last, 16).unwrap();
        let head = unsafe { level_head_of(&*pool, object.as_ptr()) };
        assert_eq!(head, a.head_at(2));
        assert_eq!(unsafe { level_of(&*pool, object.as_ptr()) }, Some(2));
        assert_eq!(
            unsafe { containing_heap_of(&*pool, object.as_ptr()) },
            Some(heap.handle()),
        );
    }

    #[test]
    fn update_containing_heap_rewrites_every_head()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let old = HierarchicalHeap::new(pool.clone());
        let new = HierarchicalHeap::new(pool.clone());
        let mut list = build(&*pool, old.handle(), &[(4, 1), (1, 0)]);

        list.update_containing_heap(new.handle());

        for head in list.heads() {
            assert_eq!(head.containing_heap(), new.handle());
        }
    }

    #[test]
    fn check_invariants_reports_stale_last_chunk()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let list = build(&*pool, heap.handle(), &[(1, 2)]);
        let head = list.first_head().unwrap();
        let actual = list.last_chunk(1).unwrap();

        head.head_mut().last_chunk = head;

        assert_eq!(
            list.check_invariants(&*pool),
            Err(InvariantViolation::StaleLastChunk{head, cached: head, actual}),
        );
    }

    #[test]
    fn check_invariants_reports_level_order()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let list = build(&*pool, heap.handle(), &[(4, 0), (2, 0)]);
        list.head_at(2).unwrap().set_level(7);

        assert_eq!(
            list.check_invariants(&*pool),
            Err(InvariantViolation::LevelOrder{previous: 4, level: 7}),
        );
    }

    #[test]
    fn check_invariants_reports_normal_chunk_in_head_position()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let mut list = build(&*pool, heap.handle(), &[(1, 1)]);
        let normal = list.last_chunk(1).unwrap();

        list.first = Some(normal);

        assert_eq!(
            list.check_invariants(&*pool),
            Err(InvariantViolation::NotALevelHead(normal)),
        );
    }

    #[test]
    fn check_invariants_reports_frontier_outside_chunk()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let list = build(&*pool, heap.handle(), &[(1, 0)]);
        let head = list.first_head().unwrap();

        // The byte below the frontier now lies before the block.
        head.info_mut().frontier = head.block();

        assert_eq!(
            list.check_invariants(&*pool),
            Err(InvariantViolation::FrontierOutsideChunk(head)),
        );
    }

    #[test]
    fn check_invariants_reports_level_head_inside_chain()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let list = build(&*pool, heap.handle(), &[(1, 1)]);
        let normal = list.last_chunk(1).unwrap();

        normal.info_mut().kind = ChunkKind::Head(LevelHead{
            level: 1,
            next_head: None,
            last_chunk: normal,
            containing_heap: heap.handle(),
        });

        assert_eq!(
            list.check_invariants(&*pool),
            Err(InvariantViolation::UnexpectedLevelHead(normal)),
        );
    }

    #[test]
    fn check_invariants_reports_chunk_of_another_chain()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let list = build(&*pool, heap.handle(), &[(1, 1)]);
        let other = build(&*pool, heap.handle(), &[(2, 0)]);
        let head = list.first_head().unwrap();
        let foreign = other.first_head().unwrap();
        let normal = list.last_chunk(1).unwrap();

        normal.info_mut().kind = ChunkKind::Normal{level_head: foreign};

        assert_eq!(
            list.check_invariants(&*pool),
            Err(InvariantViolation::WrongLevelHead{
                chunk: normal,
                expected: head,
                actual: foreign,
            }),
        );
    }

    struct CountingVisitor
    {
        visited: Vec<usize>,
        max_levels: Vec<Level>,
    }

    impl ObjectVisitor for CountingVisitor
    {
        fn visit(
            &mut self,
            _destination: &mut LevelList,
            object: NonNull<u8>,
            args: &TraceArgs,
        ) -> NonNull<u8>
        {
            self.visited.push(object_size(object));
            self.max_levels.push(args.max_level);
            next_object(object)
        }
    }

    #[test]
    fn for_each_object_visits_every_object_in_order()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let mut list = build(&*pool, heap.handle(), &[(3, 1), (1, 0)]);

        let chain3 = chain_at(&list, 3);
        write_object(&*pool, chain3[0], 16).unwrap();
        write_object(&*pool, chain3[0], 24).unwrap();
        write_object(&*pool, chain3[1], 32).unwrap();
        write_object(&*pool, list.head_at(1).unwrap(), 40).unwrap();

        let mut visitor = CountingVisitor{visited: vec![], max_levels: vec![]};
        list.for_each_object(&mut visitor, heap.handle(), 0);

        assert_eq!(visitor.visited, [16, 24, 32, 40]);
        assert_eq!(visitor.max_levels, [3, 3, 3, 1]);
    }

    /// Copies every object it sees into the level-0 chain, once.
    struct CopyingVisitor<'a>
    {
        pool: &'a dyn ChunkPool,
        copies: usize,
        visits: usize,
    }

    impl<'a> ObjectVisitor for CopyingVisitor<'a>
    {
        fn visit(
            &mut self,
            destination: &mut LevelList,
            object: NonNull<u8>,
            args: &TraceArgs,
        ) -> NonNull<u8>
        {
            self.visits += 1;

            // Copies are marked by a size that is not a multiple of 16.
            let size = object_size(object);
            if size % 16 == 0 {
                let head = match destination.head_at(0) {
                    Some(head) => head,
                    None =>
                        destination
                            .allocate_level_head(self.pool, SIZE, 0, args.heap)
                            .unwrap().chunk,
                };
                let last = head.head().last_chunk;
                if write_object(self.pool, last, size + 8).is_none() {
                    let chunk = allocate_chunk(self.pool, head, SIZE)
                        .unwrap().chunk;
                    write_object(self.pool, chunk, size + 8).unwrap();
                }
                self.copies += 1;
            }

            next_object(object)
        }
    }

    #[test]
    fn for_each_object_visits_objects_allocated_during_traversal()
    {
        let pool = Arc::new(SystemChunkPool::new());
        let heap = HierarchicalHeap::new(pool.clone());
        let mut list = build(&*pool, heap.handle(), &[(2, 0)]);
        let head = list.first_head().unwrap();
        for _ in 0 .. 200 {
            write_object(&*pool, head.head().last_chunk, 32)
                .or_else(|| {
                    let chunk = allocate_chunk(&*pool, head, SIZE).ok()?.chunk;
                    write_object(&*pool, chunk, 32)
                })
                .unwrap();
        }

        let mut visitor = CopyingVisitor{pool: &*pool, copies: 0, visits: 0};
        list.for_each_object(&mut visitor, heap.handle(), 0);

        assert_eq!(visitor.copies, 200);
        assert_eq!(visitor.visits, 400);
        assert_eq!(list.levels().as_slice(), [2, 0]);
        list.assert_invariants(&*pool);
    }

    fn level_set() -> impl p::strategy::Strategy<Value = BTreeSet<Level>>
    {
        p::collection::btree_set(0 .. 12u32, 0 .. 8)
    }

    proptest!
    {
        #[test]
        fn merge_yields_descending_union(a in level_set(), b in level_set())
        {
            let pool = Arc::new(SystemChunkPool::new());
            let heap = HierarchicalHeap::new(pool.clone());

            let shape = |set: &BTreeSet<Level>| -> Vec<(Level, usize)> {
                set.iter().rev().map(|&level| (level, level as usize % 3))
                    .collect()
            };
            let mut list_a = build(&*pool, heap.handle(), &shape(&a));
            let list_b = build(&*pool, heap.handle(), &shape(&b));
            let chunks = pool.blocks_in_use();

            list_a.merge(list_b);
            list_a.assert_invariants(&*pool);

            let expected: Vec<Level> = (&a | &b).into_iter().rev().collect();
            assert_eq!(list_a.levels().to_vec(), expected);

            let linked: usize =
                list_a.heads().map(|head| head.chain().count()).sum();
            assert_eq!(linked, chunks);
        }

        #[test]
        fn promote_preserves_order(levels in level_set(), target in 1 .. 12u32)
        {
            let pool = Arc::new(SystemChunkPool::new());
            let heap = HierarchicalHeap::new(pool.clone());
            let shape: Vec<_> = levels.iter().rev().map(|&l| (l, 1)).collect();
            let mut list = build(&*pool, heap.handle(), &shape);

            list.promote(target);
            list.assert_invariants(&*pool);

            let mut expected = levels.clone();
            if expected.remove(&target) {
                expected.insert(target - 1);
            }
            let expected: Vec<Level> = expected.into_iter().rev().collect();
            assert_eq!(list.levels().to_vec(), expected);
        }

        #[test]
        fn free_chunks_keeps_levels_below_threshold(
            levels in level_set(),
            min_level in 0 .. 13u32,
        )
        {
            let pool = Arc::new(SystemChunkPool::new());
            let heap = HierarchicalHeap::new(pool.clone());
            let shape: Vec<_> = levels.iter().rev().map(|&l| (l, 2)).collect();
            let mut list = build(&*pool, heap.handle(), &shape);

            list.free_chunks(&*pool, min_level);
            list.assert_invariants(&*pool);

            let expected: Vec<Level> =
                levels.range(.. min_level).rev().copied().collect();
            assert_eq!(list.levels().to_vec(), expected);
            assert_eq!(pool.blocks_in_use(), expected.len() * 3);
        }
    }
}
