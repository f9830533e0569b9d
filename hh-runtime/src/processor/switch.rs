use {
    super::{Collector, HeapMode, Processor, ThreadHandle},
    crate::heap::AllocError,
};

impl Processor
{
    /// Make `to` the running thread of this processor.
    ///
    /// Must be called inside an atomic section,
    /// which this ends on the way out.
    /// The outgoing thread remembers `ensure_bytes_free`,
    /// and has that many bytes ensured when it is resumed.
    /// If a signal is pending when the switch completes,
    /// the signal handler thread runs instead of `to`.
    ///
    /// Collections needed to re-establish the assurances
    /// of the incoming thread are requested from `collector`,
    /// which may switch threads itself.
    pub fn switch_to_thread(
        &mut self,
        collector: &mut dyn Collector,
        to: ThreadHandle,
        ensure_bytes_free: usize,
    ) -> Result<(), AllocError>
    {
        log::debug!(
            "Processor {} switching from {:?} to {to:?}, \
             ensuring {ensure_bytes_free} bytes",
            self.number,
            self.current,
        );
        debug_assert_ne!(
            self.shared.atomic_state.count(), 0,
            "Thread switch outside an atomic section",
        );

        self.enter();

        if let Some(current) = &self.current {
            current.state().bytes_needed = ensure_bytes_free;
        }
        self.retarget(to);

        self.shared.atomic_state.end();
        self.switch_to_signal_handler_if_pending();

        let result = self.ensure_assurances(collector);
        self.leave();
        result
    }

    /// Replace the running thread, moving the registers
    /// through the global heap if either thread is local.
    pub (super) fn retarget(&mut self, to: ThreadHandle)
    {
        if self.mode == HeapMode::Local {
            self.local_to_global();
        }

        if let Some(previous) = self.current.take() {
            previous.set_current_proc_num(None);
        }

        self.attach(to);
    }

    /// Make `thread` the running thread of an idle processor.
    pub (super) fn attach(&mut self, thread: ThreadHandle)
    {
        debug_assert!(self.current.is_none());
        debug_assert_eq!(
            thread.current_proc_num(), None,
            "Thread {thread:?} is running on another processor",
        );

        let mode = {
            let state = thread.state();
            self.stack_used = state.stack_used;
            self.exn_stack = state.exn_stack;
            state.heap_mode
        };

        thread.set_current_proc_num(Some(self.number));
        self.current = Some(thread);

        if mode == HeapMode::Local {
            self.global_to_local();
        }
    }
}
