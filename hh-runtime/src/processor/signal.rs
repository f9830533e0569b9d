use {
    super::{AtomicState, Processor, Registers, SectionState, SpinLock, ThreadHandle},
    crate::{config::RuntimeConfig, trace::{EventKind, TraceBuffer}},
    scope_exit::guard,
    std::{
        hint,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::*},
        },
    },
};

/// Termination status of a processor that has terminated.
const TERMINATED: u32 = 0;

/// Termination status of a running processor no one is signaling.
const RUNNING: u32 = 1;

/// Set of signal numbers.
///
/// Signal numbers 1 through 64 are represented,
/// which covers every signal up to `SIGRTMAX` on Linux.
/// Signal `n` is stored in bit `n - 1`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SignalSet(u64);

impl SignalSet
{
    /// The set without signals.
    pub const EMPTY: Self = Self(0);

    /// Highest signal number the set can hold.
    pub const MAX_SIGNAL: i32 = 64;

    fn bit(signum: i32) -> u64
    {
        u32::try_from(signum).ok()
            .and_then(|signum| signum.checked_sub(1))
            .and_then(|shift| 1u64.checked_shl(shift))
            .unwrap_or(0)
    }

    /// Add a signal to the set.
    pub fn insert(&mut self, signum: i32)
    {
        debug_assert!(
            (1 ..= Self::MAX_SIGNAL).contains(&signum),
            "Signal {signum} cannot be represented",
        );
        self.0 |= Self::bit(signum);
    }

    /// Remove a signal from the set.
    pub fn remove(&mut self, signum: i32)
    {
        self.0 &= !Self::bit(signum);
    }

    /// Whether the signal is in the set.
    pub fn contains(self, signum: i32) -> bool
    {
        self.0 & Self::bit(signum) != 0
    }

    /// Whether the set has no signals.
    pub fn is_empty(self) -> bool
    {
        self.0 == 0
    }

    /// Number of signals in the set.
    pub fn len(self) -> usize
    {
        self.0.count_ones() as usize
    }

    /// The signals in the set, in ascending order.
    pub fn iter(self) -> impl Iterator<Item = i32>
    {
        (1 ..= Self::MAX_SIGNAL).filter(move |&signum| self.contains(signum))
    }
}

/// Part of a processor that other processors may touch.
pub struct ProcessorShared
{
    number: usize,

    /// Global heap region of the processor,
    /// while the registers describe the local heap.
    pub global: SpinLock<Registers>,

    /// Atomic section state of the processor.
    pub atomic_state: AtomicState,

    /// Zero once terminated, one while running,
    /// and one more for each relay in flight to this processor.
    termination_status: AtomicU32,

    /// Signals delivered to the processor but not yet handled.
    mailbox: AtomicU64,
}

impl ProcessorShared
{
    fn new(number: usize) -> Self
    {
        Self{
            number,
            global: SpinLock::new(Registers::default()),
            atomic_state: AtomicState::new(),
            termination_status: AtomicU32::new(RUNNING),
            mailbox: AtomicU64::new(0),
        }
    }

    /// Index of the processor in its table.
    pub fn number(&self) -> usize
    {
        self.number
    }

    /// Whether the processor has terminated.
    pub fn is_terminated(&self) -> bool
    {
        self.termination_status.load(Acquire) == TERMINATED
    }

    /// Deliver a signal to the processor.
    ///
    /// The signal is handled by the next call to
    /// [`Processor::poll_signals`] on the processor.
    pub fn post(&self, signum: i32)
    {
        self.mailbox.fetch_or(SignalSet::bit(signum), AcqRel);
    }

    fn take_mail(&self) -> SignalSet
    {
        SignalSet(self.mailbox.swap(0, AcqRel))
    }
}

/// The processors of a runtime, and the state they share.
pub struct ProcessorTable
{
    config: RuntimeConfig,
    processors: Vec<Arc<ProcessorShared>>,
    termination_requested: AtomicBool,
    trace: Option<Arc<TraceBuffer>>,
}

impl ProcessorTable
{
    /// Create a table with as many processors as configured.
    pub fn new(config: RuntimeConfig, trace: Option<Arc<TraceBuffer>>)
        -> Arc<Self>
    {
        let processors = (0 .. config.processors)
            .map(|number| Arc::new(ProcessorShared::new(number)))
            .collect();
        Arc::new(Self{
            config,
            processors,
            termination_requested: AtomicBool::new(false),
            trace,
        })
    }

    /// Configuration shared by all processors.
    pub fn config(&self) -> &RuntimeConfig
    {
        &self.config
    }

    /// Trace that processors record events into, if any.
    pub fn trace(&self) -> Option<&TraceBuffer>
    {
        self.trace.as_deref()
    }

    /// Number of processors in the table.
    pub fn processor_count(&self) -> usize
    {
        self.processors.len()
    }

    /// Shared part of processor `number`.
    ///
    /// # Panics
    ///
    /// Panics if there is no such processor.
    pub fn processor(&self, number: usize) -> &Arc<ProcessorShared>
    {
        &self.processors[number]
    }

    /// Ask every processor to stop; relaying stops right away.
    pub fn request_termination(&self)
    {
        if !self.termination_requested.swap(true, AcqRel) {
            self.record(EventKind::HaltReq, 0);
        }
    }

    /// Whether termination was requested.
    pub fn termination_requested(&self) -> bool
    {
        self.termination_requested.load(Acquire)
    }

    /// Mark processor `number` as terminated.
    ///
    /// Waits for relays in flight to the processor to finish,
    /// after which no further relays to it are attempted.
    pub fn terminate(&self, number: usize)
    {
        let status = &self.processor(number).termination_status;
        self.record(EventKind::HaltWait, number as u64);

        loop {
            match status.compare_exchange_weak(RUNNING, TERMINATED, AcqRel, Acquire) {
                Ok(_) | Err(TERMINATED) => break,
                Err(_) => hint::spin_loop(),
            }
        }

        self.record(EventKind::HaltExit, number as u64);
    }

    /// Deliver a signal from processor `from` to processor `to`.
    ///
    /// The relay is abandoned if the target has terminated
    /// or termination was requested; it never blocks.
    /// Returns whether the signal was delivered.
    pub fn relay_signal_to(&self, from: usize, to: usize, signum: i32) -> bool
    {
        if from == to {
            return false;
        }

        let target = self.processor(to);
        let status = &target.termination_status;

        // Keep the target from terminating while delivering.
        let mut current = status.load(Acquire);
        let mut success = false;
        while current > TERMINATED && !self.termination_requested() {
            match status.compare_exchange_weak(current, current + 1, AcqRel, Acquire) {
                Ok(_) => { success = true; break; },
                Err(actual) => current = actual,
            }
        }

        if !success {
            log::warn!(
                "Processor {from} abandoned relay of signal {signum} \
                 to processor {to}",
            );
            return false;
        }

        let _release = guard(|| { status.fetch_sub(1, AcqRel); });
        debug_assert!(status.load(Acquire) > RUNNING);
        log::trace!("Processor {from} relays signal {signum} to processor {to}");
        target.post(signum);
        true
    }

    fn record(&self, kind: EventKind, arg1: u64)
    {
        if let Some(trace) = &self.trace {
            trace.record(kind, self as *const Self as usize, arg1, 0);
        }
    }
}

impl Processor
{
    /// Install the thread that runs signal handlers.
    pub fn set_signal_handler_thread(&mut self, thread: ThreadHandle)
    {
        self.signal_handler_thread = Some(thread);
    }

    /// Signals received and not yet taken by the signal handler.
    pub fn signals_pending(&self) -> SignalSet
    {
        self.signals_pending
    }

    /// Take the signals received so far, for the signal handler.
    pub fn take_pending_signals(&mut self) -> SignalSet
    {
        std::mem::take(&mut self.signals_pending)
    }

    /// Whether the signal handler thread is running.
    pub fn am_in_signal_handler(&self) -> bool
    {
        self.am_in_signal_handler
    }

    /// React to the arrival of a signal.
    ///
    /// Outside atomic sections the limit is cleared,
    /// so that the mutator enters the runtime at its next limit check.
    /// An alarm received by any processor but the first is relayed to it;
    /// the first processor relays it to all others as `SIGUSR1`.
    pub fn handle_signal(&mut self, signum: i32)
    {
        log::trace!("Processor {} received signal {signum}", self.number);

        if self.shared.atomic_state.count() == 0 {
            self.registers.limit = 0;
        }
        self.shared.atomic_state.mark_signal_pending();
        self.signals_pending.insert(signum);

        if signum == libc::SIGALRM {
            let table = self.table.clone();
            if self.number != 0 {
                table.relay_signal_to(self.number, 0, libc::SIGALRM);
            } else {
                for target in 1 .. table.processor_count() {
                    if table.termination_requested() {
                        break;
                    }
                    table.relay_signal_to(0, target, libc::SIGUSR1);
                }
            }
        }
    }

    /// Handle the signals delivered to this processor since the last poll.
    ///
    /// Returns how many signals were handled.
    pub fn poll_signals(&mut self) -> usize
    {
        let mail = self.shared.take_mail();
        for signum in mail.iter() {
            self.handle_signal(signum);
        }
        mail.len()
    }

    /// Prepare to run the signal handler thread.
    ///
    /// Must be called with a signal pending and an atomic nesting count
    /// of one. Remembers the running thread so the handler can resume it,
    /// and sets the count to two; leaving the runtime brings it to one,
    /// so the handler runs atomically.
    pub fn start_signal_handler(&mut self)
    {
        log::trace!("Processor {} starting signal handler", self.number);
        debug_assert_eq!(self.shared.atomic_state.count(), 1);
        debug_assert!(self.shared.atomic_state.is_signal_pending());
        debug_assert!(self.saved_thread.is_none());

        self.shared.atomic_state.clear_signal_pending();
        self.am_in_signal_handler = true;
        self.saved_thread = self.current.clone();
        self.shared.atomic_state.set_count(2);
    }

    /// Note that the signal handler thread is done.
    ///
    /// The handler then switches to the thread it interrupted,
    /// which ends its atomic section.
    pub fn finish_signal_handler(&mut self)
    {
        log::trace!("Processor {} finishing signal handler", self.number);
        debug_assert_eq!(self.shared.atomic_state.count(), 1);
        self.am_in_signal_handler = false;
    }

    /// Take the thread interrupted by the signal handler.
    pub fn take_saved_thread(&mut self) -> Option<ThreadHandle>
    {
        self.saved_thread.take()
    }

    /// Run the signal handler thread instead of the current thread
    /// if a signal is pending and only the caller's atomic section is open.
    ///
    /// Returns whether the handler thread is now running.
    pub (super) fn switch_to_signal_handler_if_pending(&mut self) -> bool
    {
        if self.shared.atomic_state.get() != (SectionState::SignalPending{depth: 1}) {
            return false;
        }
        let Some(handler) = self.signal_handler_thread.clone() else { return false };

        self.start_signal_handler();
        self.retarget(handler);
        true
    }
}
