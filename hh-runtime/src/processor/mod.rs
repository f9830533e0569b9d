//! Per-worker heap context.
//!
//! # Allocation registers
//!
//! Each [processor][`Processor`] runs at most one mutator thread at a time,
//! and allocates by bumping the frontier in its [registers][`Registers`].
//! The registers describe either the chunk of the running thread
//! (the _local_ heap) or the region of the global heap
//! that belongs to the processor (the _global_ heap).
//! The global region is kept in a slot guarded by a [spinlock][`SpinLock`],
//! because signal handling races with ordinary execution on it.
//!
//! Leaving the local heap writes the frontier back into the chunk header,
//! so that the level list reflects what was allocated.
//! Entering the local heap reads the frontier and limit from the chunk.
//! A frontier that is written back and read again is unchanged,
//! so a round trip through the global heap restores the registers exactly.
//!
//! # Atomic sections
//!
//! Runtime code that must not be interrupted by the collector
//! or by a thread switch runs in an atomic section,
//! tracked by the [atomic state][`AtomicState`] of the processor.
//! Signals that arrive inside an atomic section are left pending,
//! and are picked up when the nesting count drops back to one
//! on the way out of the runtime.
//!
//! # Collection
//!
//! The processor never collects by itself.
//! When an assurance cannot be met, it hands a [`CollectRequest`]
//! to the [`Collector`] supplied by the caller.

pub use self::{atomic_state::*, signal::*, spinlock::*, thread::*};

use {
    crate::{
        config::RuntimeConfig,
        heap::{AllocError, ChunkRef, HierarchicalHeap, SharedPool},
        trace::EventKind,
    },
    std::{pin::Pin, ptr::NonNull, sync::Arc},
};

mod atomic_state;
mod borrow;
mod signal;
mod spinlock;
mod switch;
mod thread;

#[cfg(test)]
mod testing;

/// Which allocation context owns the registers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HeapMode
{
    /// The chunk of the running thread.
    Local,

    /// The global heap region of the processor.
    #[default]
    Global,
}

/// Allocation registers of a processor.
///
/// Addresses are stored as integers;
/// a zero limit makes the next limit check fail.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Registers
{
    /// Next free byte.
    pub frontier: usize,

    /// Allocation beyond this address must check with the runtime.
    pub limit: usize,

    /// End of the region; `limit` plus the slop.
    pub limit_plus_slop: usize,
}

impl Registers
{
    /// Registers for a region ending at `limit_plus_slop`.
    pub fn new(frontier: usize, limit_plus_slop: usize, slop: usize) -> Self
    {
        let limit = limit_plus_slop.saturating_sub(slop);
        Self{frontier, limit, limit_plus_slop}
    }

    /// Bytes that can be allocated without checking with the runtime.
    pub fn bytes_free(&self) -> usize
    {
        self.limit.saturating_sub(self.frontier)
    }
}

/// What the collector is asked to achieve.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CollectRequest
{
    /// Bytes that must be free afterwards.
    pub bytes_needed: usize,

    /// Whether the stack of the current thread must be grown.
    pub grow_stack: bool,

    /// Whether to collect even if no threshold was reached.
    pub force: bool,
}

/// Garbage collector invoked by a processor.
pub trait Collector
{
    /// Collect on behalf of the processor.
    ///
    /// The collector may switch threads on the processor,
    /// which re-enters the switch protocol.
    fn collect(&mut self, processor: &mut Processor, request: CollectRequest)
        -> Result<(), AllocError>;
}

/// Heap context of one worker.
pub struct Processor
{
    number: usize,
    pool: SharedPool,
    table: Arc<ProcessorTable>,
    shared: Arc<ProcessorShared>,

    /// Allocation registers used by the mutator.
    pub registers: Registers,

    /// Stack bytes in use by the running thread.
    pub stack_used: usize,

    /// Exception stack offset of the running thread.
    pub exn_stack: usize,

    /// Which context the registers describe.
    mode: HeapMode,

    current: Option<ThreadHandle>,

    /// Thread interrupted by the signal handler.
    saved_thread: Option<ThreadHandle>,

    signal_handler_thread: Option<ThreadHandle>,

    /// Thread whose heap the signal handler borrows.
    saved_thread_during_signal_handler: Option<ThreadHandle>,

    /// Heap the signal handler gave up while borrowing.
    abandoned_heap: Option<Pin<Box<HierarchicalHeap>>>,

    am_in_signal_handler: bool,

    signals_pending: SignalSet,
}

impl Processor
{
    /// Create the context of processor `number`.
    ///
    /// # Panics
    ///
    /// Panics if the table has no processor with that number.
    pub fn new(table: &Arc<ProcessorTable>, number: usize, pool: SharedPool)
        -> Self
    {
        let shared = table.processor(number).clone();
        Self{
            number,
            pool,
            table: table.clone(),
            shared,
            registers: Registers::default(),
            stack_used: 0,
            exn_stack: 0,
            mode: HeapMode::Global,
            current: None,
            saved_thread: None,
            signal_handler_thread: None,
            saved_thread_during_signal_handler: None,
            abandoned_heap: None,
            am_in_signal_handler: false,
            signals_pending: SignalSet::EMPTY,
        }
    }

    /// Index of this processor in its table.
    pub fn number(&self) -> usize
    {
        self.number
    }

    /// Configuration shared by all processors.
    pub fn config(&self) -> &RuntimeConfig
    {
        self.table.config()
    }

    /// Pool that heap chunks come from.
    pub fn pool(&self) -> &SharedPool
    {
        &self.pool
    }

    /// Table of all processors.
    pub fn table(&self) -> &Arc<ProcessorTable>
    {
        &self.table
    }

    /// Part of this processor visible to other processors.
    pub fn shared(&self) -> &Arc<ProcessorShared>
    {
        &self.shared
    }

    /// Atomic section state of this processor.
    pub fn atomic_state(&self) -> &AtomicState
    {
        &self.shared.atomic_state
    }

    /// Which context the registers describe.
    pub fn mode(&self) -> HeapMode
    {
        self.mode
    }

    /// The running thread.
    pub fn current_thread(&self) -> Option<&ThreadHandle>
    {
        self.current.as_ref()
    }

    /// Create a thread record and note it in the trace.
    pub fn new_thread(&self, state: ThreadState) -> ThreadHandle
    {
        let thread = GcThread::new(state);
        self.trace(EventKind::ThreadCreated, Arc::as_ptr(&thread) as u64, 0);
        thread
    }

    /// Start running the first thread on an idle processor.
    pub fn install_thread(&mut self, thread: ThreadHandle)
    {
        debug_assert!(self.current.is_none(), "Processor is already running");
        debug_assert_eq!(self.mode, HeapMode::Global);
        self.attach(thread);
    }

    /// Hand the processor a region of the global heap.
    pub fn install_global_region(&mut self, frontier: usize, limit_plus_slop: usize)
    {
        let region = Registers::new(frontier, limit_plus_slop, self.config().limit_slop);
        *self.shared.global.lock(self.number) = region;
        if self.mode == HeapMode::Global {
            self.registers = region;
        }
    }

    /// Enter the runtime.
    ///
    /// Saves the stack bookkeeping of the running thread
    /// and begins an atomic section.
    pub fn enter(&mut self)
    {
        self.flush_stack();
        self.shared.atomic_state.begin();
    }

    /// Leave the runtime, ending the atomic section begun by [`enter`].
    ///
    /// If this ends the outermost atomic section while a signal is pending,
    /// the limit is cleared so that the next limit check
    /// brings the mutator back into the runtime.
    ///
    /// [`enter`]: `Self::enter`
    pub fn leave(&mut self)
    {
        if let SectionState::SignalPending{depth: 0} = self.shared.atomic_state.end() {
            self.registers.limit = 0;
        }
    }

    /// Load the registers from the chunk of the running thread.
    pub fn enter_local_heap(&mut self)
    {
        let chunk = self.current.as_ref()
            .and_then(|thread| thread.state().current_chunk);
        self.registers = match chunk {
            Some(chunk) => self.chunk_registers(chunk),
            None => Registers::default(),
        };
        self.mode = HeapMode::Local;
    }

    /// Write the frontier back into the chunk of the running thread.
    ///
    /// Bytes allocated since the registers were loaded
    /// are added to the allocation count of the thread.
    pub fn exit_local_heap(&mut self)
    {
        debug_assert_eq!(self.mode, HeapMode::Local);

        let Some(thread) = &self.current else { return };
        let mut state = thread.state();
        let Some(chunk) = state.current_chunk else { return };

        let old = chunk.frontier();
        let new = address_in(chunk, self.registers.frontier);
        debug_assert!(new >= old, "Frontier of {chunk:?} moved backwards");
        chunk.update_frontier(&*self.pool, new);

        state.bytes_allocated_since_last_collection +=
            new.as_ptr() as usize - old.as_ptr() as usize;
    }

    /// Make the running thread allocate into the global heap.
    pub fn enter_global_heap(&mut self)
    {
        let Some(thread) = self.current.clone() else { return };
        if thread.state().heap_mode == HeapMode::Global {
            return;
        }
        self.local_to_global();
        thread.state().heap_mode = HeapMode::Global;
    }

    /// Make the running thread allocate into its local heap again.
    pub fn exit_global_heap(&mut self)
    {
        let Some(thread) = self.current.clone() else { return };
        if thread.state().heap_mode == HeapMode::Local {
            return;
        }
        thread.state().heap_mode = HeapMode::Local;
        self.global_to_local();
    }

    /// Switch the registers from the local heap to the global region.
    fn local_to_global(&mut self)
    {
        debug_assert_eq!(self.mode, HeapMode::Local);
        self.exit_local_heap();

        let shared = self.shared.clone();
        let global = shared.global.lock(self.number);
        self.registers = *global;
        self.mode = HeapMode::Global;
    }

    /// Save the global region and load the registers from the local heap.
    fn global_to_local(&mut self)
    {
        debug_assert_eq!(self.mode, HeapMode::Global);

        let shared = self.shared.clone();
        let mut global = shared.global.lock(self.number);
        *global = self.registers;
        self.enter_local_heap();
    }

    /// Ensure the running thread may keep allocating into its local heap.
    ///
    /// Requests a collection if the thread allocated past the threshold
    /// or if `force` is set. Then ensures the current chunk has
    /// `bytes_needed` free bytes, extending the heap if it does not.
    /// If the heap cannot be extended, collects and tries once more.
    pub fn ensure_local_assurances(
        &mut self,
        collector: &mut dyn Collector,
        bytes_needed: usize,
        force: bool,
    ) -> Result<(), AllocError>
    {
        let Some(thread) = self.current.clone() else { return Ok(()) };
        let request = CollectRequest{bytes_needed, grow_stack: false, force};

        let allocated = thread.state().bytes_allocated_since_last_collection;
        if force || allocated >= self.config().collection_threshold {
            self.perform_gc(collector, request)?;
        }

        if self.has_room(&thread, bytes_needed) {
            return Ok(());
        }

        if let Err(err) = self.extend_current(&thread, bytes_needed) {
            log::debug!(
                "Processor {} could not extend heap: {err}; collecting",
                self.number,
            );
            self.perform_gc(collector, request)?;
            if !self.has_room(&thread, bytes_needed) {
                self.extend_current(&thread, bytes_needed)?;
            }
        }

        Ok(())
    }

    /// Ensure the running thread may keep allocating into the global heap.
    ///
    /// Collects with stack growth if the stack outgrew its reservation,
    /// and collects if fewer than `bytes_needed` bytes are free.
    pub fn ensure_global(
        &mut self,
        collector: &mut dyn Collector,
        bytes_needed: usize,
    ) -> Result<(), AllocError>
    {
        let stack_exhausted = self.current.as_ref().is_some_and(|thread| {
            let state = thread.state();
            state.stack_used > state.stack_reserved
        });
        if stack_exhausted {
            let request = CollectRequest{bytes_needed, grow_stack: true, force: false};
            self.perform_gc(collector, request)?;
        }

        if self.registers.bytes_free() < bytes_needed {
            let request = CollectRequest{bytes_needed, grow_stack: false, force: false};
            self.perform_gc(collector, request)?;
            if self.registers.bytes_free() < bytes_needed {
                return Err(AllocError{requested: bytes_needed});
            }
        }

        Ok(())
    }

    /// Re-establish the assurances for the running thread,
    /// using the bytes it asked for when it was last suspended.
    fn ensure_assurances(&mut self, collector: &mut dyn Collector)
        -> Result<(), AllocError>
    {
        let Some(thread) = self.current.clone() else { return Ok(()) };
        let (mode, bytes_needed) = {
            let state = thread.state();
            (state.heap_mode, state.bytes_needed)
        };
        match mode {
            HeapMode::Local => self.ensure_local_assurances(collector, bytes_needed, false),
            HeapMode::Global => self.ensure_global(collector, bytes_needed),
        }
    }

    /// Run the collector, noting the collection in the trace.
    pub fn perform_gc(&mut self, collector: &mut dyn Collector, request: CollectRequest)
        -> Result<(), AllocError>
    {
        log::debug!("Processor {} collecting: {request:?}", self.number);
        self.trace(EventKind::GcEnter, request.bytes_needed as u64, 0);

        let result = collector.collect(self, request);

        if result.is_ok() {
            if let Some(thread) = &self.current {
                thread.state().bytes_allocated_since_last_collection = 0;
            }
        }

        self.trace(EventKind::GcLeave, request.bytes_needed as u64, result.is_ok() as u64);
        result
    }

    /// Whether the registers hold the chunk of `thread`
    /// with at least `bytes_needed` bytes free.
    fn has_room(&self, thread: &GcThread, bytes_needed: usize) -> bool
    {
        self.mode == HeapMode::Local
            && thread.state().current_chunk.is_some()
            && self.registers.bytes_free() >= bytes_needed
    }

    /// Give `thread` a fresh chunk with `bytes_needed` free bytes
    /// at its current depth, and load it into the registers.
    fn extend_current(&mut self, thread: &GcThread, bytes_needed: usize)
        -> Result<(), AllocError>
    {
        if self.mode == HeapMode::Local {
            self.exit_local_heap();
        }

        {
            let size = self.chunk_request(bytes_needed);
            let mut state = thread.state();
            let depth = state.current_depth;
            let heap = state.heap
                .get_or_insert_with(|| HierarchicalHeap::new(self.pool.clone()));
            let chunk = heap.as_mut().extend(depth, size)?;
            state.current_chunk = Some(chunk);
        }

        self.enter_local_heap();
        Ok(())
    }

    /// Allocable size to request for a chunk that must hold `bytes`
    /// in addition to the limit slop.
    fn chunk_request(&self, bytes: usize) -> usize
    {
        let config = self.config();
        bytes.saturating_add(config.limit_slop).max(config.min_chunk_size)
    }

    fn chunk_registers(&self, chunk: ChunkRef) -> Registers
    {
        Registers::new(
            chunk.frontier().as_ptr() as usize,
            chunk.limit(&*self.pool).as_ptr() as usize,
            self.config().limit_slop,
        )
    }

    /// Save the stack bookkeeping of the running thread.
    fn flush_stack(&mut self)
    {
        if let Some(thread) = &self.current {
            let mut state = thread.state();
            state.stack_used = self.stack_used;
            state.exn_stack = self.exn_stack;
        }
    }

    fn trace(&self, kind: EventKind, arg1: u64, arg2: u64)
    {
        if let Some(trace) = self.table.trace() {
            trace.record(kind, Arc::as_ptr(&self.shared) as usize, arg1, arg2);
        }
    }
}

/// Pointer into `chunk` at integer address `address`.
fn address_in(chunk: ChunkRef, address: usize) -> NonNull<u8>
{
    let start = chunk.start();
    debug_assert!(address >= start.as_ptr() as usize);
    let offset = address - start.as_ptr() as usize;
    // SAFETY: The registers only ever hold addresses within the chunk.
    unsafe { NonNull::new_unchecked(start.as_ptr().add(offset)) }
}
