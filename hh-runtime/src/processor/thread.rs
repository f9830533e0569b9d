use {
    super::HeapMode,
    crate::heap::{ChunkRef, HierarchicalHeap, Level},
    std::{
        fmt,
        pin::Pin,
        sync::{
            Arc,
            Mutex,
            MutexGuard,
            PoisonError,
            atomic::{AtomicI32, Ordering::*},
        },
    },
};

/// Shared handle to a mutator thread.
pub type ThreadHandle = Arc<GcThread>;

/// Runtime record of a mutator thread.
pub struct GcThread
{
    /// Processor currently running the thread, or -1.
    current_proc_num: AtomicI32,

    state: Mutex<ThreadState>,
}

/// Bookkeeping of a thread, saved while the thread is not running.
#[derive(Default)]
pub struct ThreadState
{
    /// Bytes of the stack in use.
    pub stack_used: usize,

    /// Bytes reserved for the stack.
    pub stack_reserved: usize,

    /// Offset of the top exception handler frame.
    pub exn_stack: usize,

    /// Bytes that must be free when the thread resumes.
    pub bytes_needed: usize,

    /// Which heap the thread allocates into.
    pub heap_mode: HeapMode,

    /// Nesting depth; the level the thread allocates at.
    pub current_depth: Level,

    /// Chunk the thread allocates into.
    pub current_chunk: Option<ChunkRef>,

    /// Heap of the thread.
    pub heap: Option<Pin<Box<HierarchicalHeap>>>,

    /// Bytes allocated into the heap since it was last collected.
    pub bytes_allocated_since_last_collection: usize,

    /// Bytes that survived the last collection of the heap.
    pub bytes_survived_last_collection: usize,

    /// Shallowest depth a local collection may reach.
    pub min_local_collection_depth: Level,
}

impl GcThread
{
    /// Create a thread that is not running on any processor.
    pub fn new(state: ThreadState) -> ThreadHandle
    {
        Arc::new(Self{
            current_proc_num: AtomicI32::new(-1),
            state: Mutex::new(state),
        })
    }

    /// Lock the bookkeeping of the thread.
    ///
    /// Must not be held while calling into a collector
    /// or while locking the state of another thread
    /// that may lock this one.
    pub fn state(&self) -> MutexGuard<'_, ThreadState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Processor currently running the thread.
    pub fn current_proc_num(&self) -> Option<usize>
    {
        usize::try_from(self.current_proc_num.load(Acquire)).ok()
    }

    pub (super) fn set_current_proc_num(&self, processor: Option<usize>)
    {
        let value = processor.map_or(-1, |p| {
            let value = i32::try_from(p);
            debug_assert!(value.is_ok(), "Processor number {p} out of range");
            value.unwrap_or(i32::MAX)
        });
        self.current_proc_num.store(value, Release);
    }
}

impl fmt::Debug for GcThread
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        fmt::Pointer::fmt(&(self as *const Self), f)
    }
}
