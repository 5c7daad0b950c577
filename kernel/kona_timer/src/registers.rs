//! The Kona timer register block and the low-level hardware protocols:
//! bounded handshake waits and the anti-tearing counter read.
//!
//! Register block layout, at byte offsets from the instance base:
//!
//! | Offset      | Register                                        |
//! |-------------|-------------------------------------------------|
//! | 0x00        | STCS status/control                             |
//! | 0x04        | STCLO counter low word (read-only)              |
//! | 0x08        | STCHI counter high word (read-only)             |
//! | 0x0C + 4×ch | STCM0..3 per-channel compare                    |
//!
//! STCS carries four bit fields, one bit per channel in each: timer match
//! (bit `0+ch`, write-one-to-clear), compare enable (bit `4+ch`), compare
//! enable sync (bit `8+ch`, read-only), and compare value sync (bit
//! `12+ch`, read-only). The two sync fields report when the hardware has
//! latched a new enable state or compare value; software polls them after
//! every write, since a compare programmed on unlatched state can fire
//! immediately on stale data.

use log::error;
use volatile::{ReadOnly, Volatile};

use crate::MAX_NUM_CHANNELS;

pub(crate) const STCS_TIMER_MATCH_SHIFT: u32 = 0;
pub(crate) const STCS_COMPARE_ENABLE_SHIFT: u32 = 4;
pub(crate) const STCS_COMPARE_ENABLE_SYNC_SHIFT: u32 = 8;
pub(crate) const STCS_COMPARE_VALUE_SYNC_SHIFT: u32 = 12;

/// All four channels' match bits. Match bits are write-one-to-clear, so a
/// status value written back without masking these would acknowledge other
/// channels' pending matches.
pub(crate) const STCS_MATCH_MASK: u32 = 0xf << STCS_TIMER_MATCH_SHIFT;

pub(crate) fn match_bit(channel: usize) -> u32 {
    1 << (STCS_TIMER_MATCH_SHIFT + channel as u32)
}

pub(crate) fn compare_enable_bit(channel: usize) -> u32 {
    1 << (STCS_COMPARE_ENABLE_SHIFT + channel as u32)
}

/// Poll budget for the two sync waits. No delay between polls: the
/// register read itself is an uncached bus access and paces the loop.
const SYNC_LOOP_LIMIT: u32 = 1000;

/// Retry budget for the anti-tearing counter read.
const COUNTER_READ_ATTEMPTS: u32 = 3;

/// Raw access to one timer instance's register block.
///
/// [`TimerRegisters`] is the hardware implementation; tests substitute
/// scripted fakes to simulate counter rollover and sync latching.
pub trait TimerMmio: Send {
    fn read_status(&self) -> u32;
    fn write_status(&mut self, value: u32);
    fn read_counter_lo(&self) -> u32;
    fn read_counter_hi(&self) -> u32;
    /// `channel` must be below [`MAX_NUM_CHANNELS`].
    fn read_compare(&self, channel: usize) -> u32;
    /// `channel` must be below [`MAX_NUM_CHANNELS`].
    fn write_compare(&mut self, channel: usize, value: u32);
}

impl<T: TimerMmio> TimerMmio for &'static mut T {
    fn read_status(&self) -> u32 {
        (**self).read_status()
    }
    fn write_status(&mut self, value: u32) {
        (**self).write_status(value)
    }
    fn read_counter_lo(&self) -> u32 {
        (**self).read_counter_lo()
    }
    fn read_counter_hi(&self) -> u32 {
        (**self).read_counter_hi()
    }
    fn read_compare(&self, channel: usize) -> u32 {
        (**self).read_compare(channel)
    }
    fn write_compare(&mut self, channel: usize, value: u32) {
        (**self).write_compare(channel, value)
    }
}

/// The memory-mapped register block of one Kona timer instance.
#[repr(C)]
pub struct TimerRegisters {
    /// STCS status/control register, at offset 0x00.
    status: Volatile<u32>,
    /// STCLO free-running counter low word, at offset 0x04.
    counter_lo: ReadOnly<u32>,
    /// STCHI free-running counter high word, at offset 0x08.
    counter_hi: ReadOnly<u32>,
    /// STCM0..3 per-channel compare registers, at offset 0x0C + 4×channel.
    compare: [Volatile<u32>; MAX_NUM_CHANNELS],
}
const _: () = assert!(core::mem::size_of::<TimerRegisters>() == 0x1c);

impl TimerRegisters {
    /// Interprets `base` as a Kona timer register block.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of a live Kona timer register
    /// block, mapped uncacheable as device memory, and the returned
    /// reference must be the only access path to it.
    pub unsafe fn from_base(base: usize) -> &'static mut TimerRegisters {
        &mut *(base as *mut TimerRegisters)
    }
}

impl TimerMmio for TimerRegisters {
    fn read_status(&self) -> u32 {
        self.status.read()
    }
    fn write_status(&mut self, value: u32) {
        self.status.write(value)
    }
    fn read_counter_lo(&self) -> u32 {
        self.counter_lo.read()
    }
    fn read_counter_hi(&self) -> u32 {
        self.counter_hi.read()
    }
    fn read_compare(&self, channel: usize) -> u32 {
        self.compare[channel].read()
    }
    fn write_compare(&mut self, channel: usize, value: u32) {
        self.compare[channel].write(value)
    }
}

/// Waits for the hardware to latch a newly written compare value.
///
/// Best effort: on timeout this logs and returns, and the caller proceeds.
/// The sync can legitimately resolve within microseconds, so this stays a
/// tight bounded poll rather than a timer-based wait.
pub(crate) fn wait_for_compare_value_sync<T: TimerMmio + ?Sized>(regs: &T, channel: usize) {
    let bit = 1 << (STCS_COMPARE_VALUE_SYNC_SHIFT + channel as u32);
    for _ in 0..SYNC_LOOP_LIMIT {
        if regs.read_status() & bit != 0 {
            return;
        }
    }
    error!("kona-timer: compare value sync timed out");
}

/// Waits for the compare-enable state to be latched as `target`.
///
/// Best effort, like [`wait_for_compare_value_sync`]. Used with `false` to
/// confirm a disable and with `true` to confirm an enable.
pub(crate) fn wait_for_compare_enable_sync<T: TimerMmio + ?Sized>(
    regs: &T,
    channel: usize,
    target: bool,
) {
    let shift = STCS_COMPARE_ENABLE_SYNC_SHIFT + channel as u32;
    for _ in 0..SYNC_LOOP_LIMIT {
        if (regs.read_status() >> shift) & 1 == target as u32 {
            return;
        }
    }
    error!("kona-timer: compare enable sync timed out");
}

/// Reads the 64-bit free-running counter from its two 32-bit halves.
///
/// The counter cannot be paused for reading, so the high word is read
/// before and after the low word; a mismatch means it rolled over mid-read
/// and the sample is torn. Retries up to 3 times, then fails: callers
/// compute future deadlines from this value, so a torn read must never be
/// returned.
pub fn read_counter<T: TimerMmio + ?Sized>(regs: &T) -> Result<u64, &'static str> {
    for _ in 0..COUNTER_READ_ATTEMPTS {
        let msw = regs.read_counter_hi();
        let lsw = regs.read_counter_lo();
        if msw == regs.read_counter_hi() {
            return Ok(((msw as u64) << 32) | lsw as u64);
        }
    }
    error!("kona-timer: getting counter failed, timer will be impacted");
    Err("timed out reading the free-running counter")
}
