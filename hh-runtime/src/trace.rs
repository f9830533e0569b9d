//! Runtime event traces.
//!
//! Processors record events into a shared [`TraceBuffer`],
//! which can be dumped in a compact binary format:
//! a header holding [`TRACE_CURRENT_VERSION`],
//! followed by one record per event.
//! All fields are little-endian 64-bit integers;
//! a record holds the kind, the seconds and nanoseconds
//! since the buffer was created, the address argument,
//! and the two integer arguments.

use std::{
    io::{self, Write},
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Version written in the header of every trace dump.
pub const TRACE_CURRENT_VERSION: u64 = 0x20170419;

/// What happened.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u64)]
pub enum EventKind
{
    Nil           = 0,
    ThreadCreated = 1,
    GcEnter       = 2,
    GcLeave       = 3,
    HaltReq       = 4,
    HaltWait      = 5,
    HaltExit      = 6,
}

/// An event found in a trace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Event
{
    /// The kind of event.
    pub kind: EventKind,

    /// Time since the trace buffer was created.
    pub ts: Duration,

    /// Address of the structure the event is relative to.
    pub argptr: usize,

    /// First argument, used in some events and not in others.
    pub arg1: u64,

    /// Second argument, used in some events and not in others.
    pub arg2: u64,
}

/// Collects events from all processors.
pub struct TraceBuffer
{
    start: Instant,
    events: Mutex<Vec<Event>>,
}

impl TraceBuffer
{
    /// Create an empty trace buffer.
    pub fn new() -> Self
    {
        Self{start: Instant::now(), events: Mutex::new(Vec::new())}
    }

    /// Record an event that happens now.
    pub fn record(&self, kind: EventKind, argptr: usize, arg1: u64, arg2: u64)
    {
        let event = Event{kind, ts: self.start.elapsed(), argptr, arg1, arg2};
        self.events.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    /// Copy of the events recorded so far, in order.
    pub fn events(&self) -> Vec<Event>
    {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Write the header and all events recorded so far.
    pub fn write_to<W>(&self, mut writer: W) -> io::Result<()>
        where W: Write
    {
        writer.write_all(&TRACE_CURRENT_VERSION.to_le_bytes())?;
        for event in self.events() {
            let fields = [
                event.kind as u64,
                event.ts.as_secs(),
                u64::from(event.ts.subsec_nanos()),
                event.argptr as u64,
                event.arg1,
                event.arg2,
            ];
            for field in fields {
                writer.write_all(&field.to_le_bytes())?;
            }
        }
        writer.flush()
    }
}

impl Default for TraceBuffer
{
    fn default() -> Self
    {
        Self::new()
    }
}
