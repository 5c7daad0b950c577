//! Scripted register-block and interrupt-line fakes for unit tests.
//!
//! [`MockTimer`] emulates the Kona block's observable behavior: match bits
//! are write-one-to-clear, the two sync fields follow writes (immediately,
//! after a configurable number of status polls, or never), and the counter
//! words can be scripted to replay rollover and tearing sequences.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use interrupts::{EoiBehaviour, InterruptHandler, InterruptLine, InterruptNumber};
use time::TickHandler;

use crate::registers::{STCS_COMPARE_ENABLE_SHIFT, STCS_COMPARE_ENABLE_SYNC_SHIFT, STCS_MATCH_MASK};
use crate::{TimerMmio, MAX_NUM_CHANNELS};

const ENABLE_MASK: u32 = 0xf << STCS_COMPARE_ENABLE_SHIFT;
const ENABLE_SYNC_MASK: u32 = 0xf << STCS_COMPARE_ENABLE_SYNC_SHIFT;

pub(crate) struct MockTimer {
    status: Cell<u32>,
    status_reads: Cell<usize>,
    status_writes: RefCell<Vec<u32>>,
    compare: [Cell<u32>; MAX_NUM_CHANNELS],
    lo_script: RefCell<VecDeque<u32>>,
    lo_last: Cell<u32>,
    hi_script: RefCell<VecDeque<u32>>,
    hi_last: Cell<u32>,
    hi_reads: Cell<usize>,
    /// When true, sync bits never change: both handshake waits time out.
    sync_stuck: Cell<bool>,
    /// How many status polls a sync change stays invisible for; 0 latches
    /// at write time.
    latch_after: Cell<usize>,
    /// At most one sync change in flight: (polls remaining, bits to set,
    /// bits to clear).
    pending_latch: Cell<Option<(usize, u32, u32)>>,
}

impl MockTimer {
    pub(crate) fn new() -> MockTimer {
        MockTimer::with_counter(0, 0)
    }

    pub(crate) fn with_counter(lo: u32, hi: u32) -> MockTimer {
        MockTimer {
            status: Cell::new(0),
            status_reads: Cell::new(0),
            status_writes: RefCell::new(Vec::new()),
            compare: [Cell::new(0), Cell::new(0), Cell::new(0), Cell::new(0)],
            lo_script: RefCell::new(VecDeque::new()),
            lo_last: Cell::new(lo),
            hi_script: RefCell::new(VecDeque::new()),
            hi_last: Cell::new(hi),
            hi_reads: Cell::new(0),
            sync_stuck: Cell::new(false),
            latch_after: Cell::new(0),
            pending_latch: Cell::new(None),
        }
    }

    /// Values returned by successive low-word reads; the last one repeats.
    pub(crate) fn script_lo(&self, values: &[u32]) {
        self.lo_script.borrow_mut().extend(values);
    }

    /// Values returned by successive high-word reads; the last one repeats.
    pub(crate) fn script_hi(&self, values: &[u32]) {
        self.hi_script.borrow_mut().extend(values);
    }

    /// Overwrites the raw status register, sync bits included.
    pub(crate) fn force_status(&self, value: u32) {
        self.status.set(value);
    }

    /// Marks `channel`'s compare as matched (interrupt pending).
    pub(crate) fn force_match_pending(&self, channel: usize) {
        self.status.set(self.status.get() | (1 << channel));
    }

    pub(crate) fn force_compare(&self, channel: usize, value: u32) {
        self.compare[channel].set(value);
    }

    pub(crate) fn set_sync_stuck(&self, stuck: bool) {
        self.sync_stuck.set(stuck);
    }

    pub(crate) fn set_latch_after(&self, polls: usize) {
        self.latch_after.set(polls);
    }

    pub(crate) fn raw_status(&self) -> u32 {
        self.status.get()
    }

    pub(crate) fn compare_value(&self, channel: usize) -> u32 {
        self.compare[channel].get()
    }

    pub(crate) fn last_status_write(&self) -> Option<u32> {
        self.status_writes.borrow().last().copied()
    }

    pub(crate) fn status_reads(&self) -> usize {
        self.status_reads.get()
    }

    pub(crate) fn hi_reads(&self) -> usize {
        self.hi_reads.get()
    }

    fn latch(&self, set: u32, clear: u32) {
        if self.sync_stuck.get() {
            return;
        }
        let delay = self.latch_after.get();
        if delay == 0 {
            self.status.set((self.status.get() & !clear) | set);
        } else {
            self.pending_latch.set(Some((delay, set, clear)));
        }
    }
}

impl TimerMmio for MockTimer {
    fn read_status(&self) -> u32 {
        self.status_reads.set(self.status_reads.get() + 1);
        if let Some((remaining, set, clear)) = self.pending_latch.get() {
            if remaining == 0 {
                self.status.set((self.status.get() & !clear) | set);
                self.pending_latch.set(None);
            } else {
                self.pending_latch.set(Some((remaining - 1, set, clear)));
            }
        }
        self.status.get()
    }

    fn write_status(&mut self, value: u32) {
        self.status_writes.borrow_mut().push(value);
        let old = self.status.get();
        // Match bits acknowledge on writing one; enable bits store as
        // written; sync bits are hardware-owned and ignore the write.
        let matches = (old & STCS_MATCH_MASK) & !(value & STCS_MATCH_MASK);
        let enables = value & ENABLE_MASK;
        self.status
            .set(matches | enables | (old & !(STCS_MATCH_MASK | ENABLE_MASK)));
        // The enable-sync field follows the enable field.
        let enable_sync = (enables >> STCS_COMPARE_ENABLE_SHIFT) << STCS_COMPARE_ENABLE_SYNC_SHIFT;
        self.latch(enable_sync, ENABLE_SYNC_MASK);
    }

    fn read_counter_lo(&self) -> u32 {
        if let Some(value) = self.lo_script.borrow_mut().pop_front() {
            self.lo_last.set(value);
        }
        self.lo_last.get()
    }

    fn read_counter_hi(&self) -> u32 {
        self.hi_reads.set(self.hi_reads.get() + 1);
        if let Some(value) = self.hi_script.borrow_mut().pop_front() {
            self.hi_last.set(value);
        }
        self.hi_last.get()
    }

    fn read_compare(&self, channel: usize) -> u32 {
        self.compare[channel].get()
    }

    fn write_compare(&mut self, channel: usize, value: u32) {
        self.compare[channel].set(value);
        self.latch(1 << (12 + channel as u32), 0);
    }
}

/// A shared record of interrupt-line operations, for asserting on ordering
/// across several lines (e.g. reverse-order unwind).
#[derive(Clone, Default)]
pub(crate) struct OperationLog {
    entries: Arc<Mutex<Vec<(InterruptNumber, &'static str)>>>,
}

impl OperationLog {
    pub(crate) fn entries(&self) -> Vec<(InterruptNumber, &'static str)> {
        self.entries.lock().unwrap().clone()
    }

    fn push(&self, number: InterruptNumber, operation: &'static str) {
        self.entries.lock().unwrap().push((number, operation));
    }
}

/// A fake interrupt line. Clones share state, so a test can keep a handle
/// to a line it handed to the driver and fire it later.
#[derive(Clone)]
pub(crate) struct FakeLine {
    inner: Arc<FakeLineInner>,
}

struct FakeLineInner {
    number: InterruptNumber,
    fail_bind: bool,
    handler: Mutex<Option<InterruptHandler>>,
    enabled: AtomicBool,
    log: OperationLog,
}

impl FakeLine {
    pub(crate) fn new(number: InterruptNumber) -> FakeLine {
        FakeLine::build(number, false, OperationLog::default())
    }

    pub(crate) fn with_log(number: InterruptNumber, log: &OperationLog) -> FakeLine {
        FakeLine::build(number, false, log.clone())
    }

    pub(crate) fn failing_bind(number: InterruptNumber, log: &OperationLog) -> FakeLine {
        FakeLine::build(number, true, log.clone())
    }

    fn build(number: InterruptNumber, fail_bind: bool, log: OperationLog) -> FakeLine {
        FakeLine {
            inner: Arc::new(FakeLineInner {
                number,
                fail_bind,
                handler: Mutex::new(None),
                enabled: AtomicBool::new(false),
                log,
            }),
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.inner.handler.lock().unwrap().is_some()
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Asserts the line: runs the bound handler, if any.
    pub(crate) fn fire(&self) -> Option<EoiBehaviour> {
        let guard = self.inner.handler.lock().unwrap();
        guard.as_ref().map(|handler| handler())
    }
}

impl InterruptLine for FakeLine {
    fn number(&self) -> InterruptNumber {
        self.inner.number
    }

    fn bind(&self, handler: InterruptHandler) -> Result<(), &'static str> {
        if self.inner.fail_bind {
            self.inner.log.push(self.inner.number, "bind-failed");
            return Err("simulated bind failure");
        }
        let mut guard = self.inner.handler.lock().unwrap();
        if guard.is_some() {
            return Err("interrupt line already bound");
        }
        self.inner.log.push(self.inner.number, "bind");
        *guard = Some(handler);
        Ok(())
    }

    fn unbind(&self) {
        self.inner.log.push(self.inner.number, "unbind");
        *self.inner.handler.lock().unwrap() = None;
    }

    fn enable(&self) {
        self.inner.log.push(self.inner.number, "enable");
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.inner.log.push(self.inner.number, "disable");
        self.inner.enabled.store(false, Ordering::SeqCst);
    }
}

/// A tick consumer that counts its invocations.
pub(crate) struct CountingHandler {
    ticks: AtomicUsize,
}

impl CountingHandler {
    pub(crate) fn new() -> CountingHandler {
        CountingHandler {
            ticks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }
}

impl TickHandler for CountingHandler {
    fn handle_tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }
}
