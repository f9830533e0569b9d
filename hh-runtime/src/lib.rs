//! Chunk allocator, level lists, and heap-context switching
//! for a hierarchical-heap garbage-collected runtime.
//!
//! The [`heap`] module carves pool memory into chunks
//! and organises them into per-depth level lists.
//! The [`processor`] module decides which chunk a worker
//! is currently allocating into, and moves that decision
//! safely between mutator threads, the global heap,
//! and the signal-handler thread.

#![warn(missing_docs)]

/// Log a diagnostic and abort the process.
///
/// Used for conditions after which the heap can no longer be trusted.
macro_rules! die
{
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        ::std::process::abort()
    }};
}

pub mod config;
pub mod heap;
pub mod processor;
pub mod trace;
