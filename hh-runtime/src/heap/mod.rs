//! Chunks, chunk pools, and level lists.
//!
//! # Design of the chunk system
//!
//! This section explains the important concepts within the chunk system.
//! The documentation on the individual items is intentionally left sparse;
//! refer to this section for all the important design information.
//!
//! ## Chunks
//!
//! A [chunk][`ChunkRef`] is a block of memory obtained from a [chunk pool].
//! Each chunk begins with a [chunk header][`ChunkInfo`],
//! which is followed immediately by allocable space.
//! Allocation proceeds by bumping the chunk's frontier until the limit.
//! The limit is not stored; it is derived from the pool's size of the block.
//!
//! ## Levels
//!
//! A level is a nesting depth in the hierarchical heap.
//! All chunks at one level of one heap form a singly linked chain.
//! The first chunk in the chain is the _level head_;
//! its header carries the level, a link to the next level head,
//! a cached reference to the last chunk of the chain,
//! and the [hierarchical heap][`HierarchicalHeap`] that owns the level.
//! Every other chunk in the chain carries a back-reference to its level head.
//! The two forms are the two variants of [`ChunkKind`].
//!
//! ## Level lists
//!
//! A [level list][`LevelList`] is a sequence of level heads
//! in strictly decreasing order of level.
//! Merging two level lists at the same level demotes
//! the absorbed level head to a normal chunk pointing at the survivor.
//! Because demotion only ever points at a head that is still valid,
//! walking back-references always ends at a level head.
//!
//! ## Ownership
//!
//! Chunk memory is owned by the pool, and reachable only through
//! the chains of level lists. Level heads, back-references,
//! and containing heaps are non-owning [`ChunkRef`] and [`HeapRef`] handles.
//! Chunks return to the pool only through [`LevelList::free_chunks`].
//!
//! [chunk pool]: `ChunkPool`

pub use self::{
    chunk::*,
    hierarchical::*,
    level_list::*,
    pool::*,
};

mod chunk;
mod hierarchical;
mod level_list;
mod pool;
