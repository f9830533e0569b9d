//! Lending the heap of an interrupted thread to the signal handler.
//!
//! The interrupted thread stays where it is;
//! the signal handler thread takes over its depth, chunk, heap,
//! and allocation counters, and gives them back when done.
//! The heap of the handler thread itself is parked in the processor
//! for the duration of the borrow.

use {
    super::{Collector, HeapMode, Processor, ThreadHandle},
    crate::heap::AllocError,
    std::{mem, sync::Arc},
};

impl Processor
{
    /// Let the running signal handler thread allocate into the heap of `target`.
    ///
    /// The heap context of `target` is moved into the handler thread
    /// and cleared on `target`. The registers are loaded from it,
    /// and the bytes needed by the handler are ensured.
    pub fn enter_heap_of_thread(
        &mut self,
        collector: &mut dyn Collector,
        target: &ThreadHandle,
    ) -> Result<(), AllocError>
    {
        self.enter();

        let Some(handler) = self.current.clone()
            else { die!("Processor {} borrows a heap without a thread", self.number) };

        log::debug!(
            "Processor {} lending heap of {target:?} to {handler:?}",
            self.number,
        );
        debug_assert!(!Arc::ptr_eq(&handler, target));
        debug_assert_eq!(target.current_proc_num(), None);
        debug_assert!(self.saved_thread_during_signal_handler.is_none());

        self.park_registers();

        {
            let mut borrower = handler.state();
            let mut lender = target.state();
            debug_assert_eq!(borrower.current_depth, 0);

            borrower.current_depth = mem::take(&mut lender.current_depth);
            borrower.current_chunk = lender.current_chunk.take();
            self.abandoned_heap = mem::replace(&mut borrower.heap, lender.heap.take());
            borrower.bytes_allocated_since_last_collection =
                mem::take(&mut lender.bytes_allocated_since_last_collection);
            borrower.bytes_survived_last_collection =
                mem::take(&mut lender.bytes_survived_last_collection);
            borrower.min_local_collection_depth = lender.min_local_collection_depth;
            borrower.heap_mode = HeapMode::Local;
        }

        self.enter_local_heap();
        self.saved_thread_during_signal_handler = Some(target.clone());

        let bytes_needed = handler.state().bytes_needed;
        let result = self.ensure_local_assurances(collector, bytes_needed, false);
        self.leave();
        result
    }

    /// Give the borrowed heap context back to `target`.
    ///
    /// The handler thread gets its own heap back at depth 0,
    /// resuming into the last chunk of that heap.
    /// If that chunk is dedicated to a single object,
    /// the heap is extended first; failing to do so is fatal.
    pub fn leave_heap_of_thread(
        &mut self,
        collector: &mut dyn Collector,
        target: &ThreadHandle,
    ) -> Result<(), AllocError>
    {
        self.enter();

        let Some(handler) = self.current.clone()
            else { die!("Processor {} returns a heap without a thread", self.number) };

        log::debug!(
            "Processor {} returning heap of {target:?} from {handler:?}",
            self.number,
        );
        debug_assert_eq!(target.current_proc_num(), None);
        debug_assert!(
            self.saved_thread_during_signal_handler.as_ref()
                .is_some_and(|saved| Arc::ptr_eq(saved, target)),
            "Heap of {target:?} was not lent",
        );

        self.park_registers();

        {
            let mut borrower = handler.state();
            let mut lender = target.state();

            lender.current_depth = mem::take(&mut borrower.current_depth);
            lender.current_chunk = borrower.current_chunk.take();
            lender.heap = mem::replace(&mut borrower.heap, self.abandoned_heap.take());
            lender.bytes_allocated_since_last_collection =
                mem::take(&mut borrower.bytes_allocated_since_last_collection);
            lender.bytes_survived_last_collection =
                mem::take(&mut borrower.bytes_survived_last_collection);
            lender.min_local_collection_depth = borrower.min_local_collection_depth;
            borrower.heap_mode = HeapMode::Local;

            if let Some(heap) = borrower.heap.as_mut() {
                debug_assert_eq!(heap.depth(), 0);
                let resumable = heap.last_chunk(0)
                    .filter(|chunk| chunk.might_contain_multiple_objects());
                let chunk = match resumable {
                    Some(chunk) => chunk,
                    None => {
                        let size = self.config().limit_slop
                            .max(self.config().min_chunk_size);
                        match heap.as_mut().extend(0, size) {
                            Ok(chunk) => chunk,
                            Err(err) => die!(
                                "Ran out of space for hierarchical heap: {err}"
                            ),
                        }
                    },
                };
                borrower.current_chunk = Some(chunk);
            }
        }

        self.enter_local_heap();
        self.saved_thread_during_signal_handler = None;

        let bytes_needed = handler.state().bytes_needed;
        let result = self.ensure_local_assurances(collector, bytes_needed, false);
        self.leave();
        result
    }

    /// Thread whose heap the signal handler is borrowing.
    pub fn saved_thread_during_signal_handler(&self) -> Option<&ThreadHandle>
    {
        self.saved_thread_during_signal_handler.as_ref()
    }

    /// Put the registers somewhere safe before they are reloaded.
    ///
    /// Local registers go back into the current chunk,
    /// global registers into the shared slot of this processor.
    fn park_registers(&mut self)
    {
        match self.mode {
            HeapMode::Local => self.exit_local_heap(),
            HeapMode::Global => {
                let shared = self.shared.clone();
                *shared.global.lock(self.number) = self.registers;
            },
        }
    }
}
