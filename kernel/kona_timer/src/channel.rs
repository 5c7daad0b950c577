//! Compare-match channels and the arm/disarm protocol.
//!
//! A channel is one of the four compare units of a timer instance. Its
//! interrupt line and identity are fixed at probe time; what churns at
//! runtime is the clock-event binding (the attached tick consumer), which
//! per-CPU lifecycle hooks attach and detach as CPUs come and go.

use alloc::boxed::Box;

use crossbeam_utils::atomic::AtomicCell;
use interrupts::InterruptLine;
use static_assertions::const_assert;
use sync_irq::IrqSafeRwLock;
use time::{ClockEventProperties, TickHandler};

use crate::registers::{
    self, compare_enable_bit, match_bit, wait_for_compare_enable_sync,
    wait_for_compare_value_sync, STCS_MATCH_MASK,
};
use crate::{KonaTimer, TimerId, TimerMmio};

/// Dispatch state of one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// No deadline pending.
    Idle,
    /// A compare deadline is programmed and its interrupt may fire.
    Armed,
    /// The interrupt has asserted and the dispatcher is servicing it.
    Firing,
}

const_assert!(AtomicCell::<ChannelState>::is_lock_free());

/// A clock-event consumer attached to a channel, together with the
/// configuration it was registered with.
pub struct ClockEventBinding {
    pub properties: ClockEventProperties,
    pub handler: Box<dyn TickHandler>,
}

/// One compare-match channel of a timer instance.
pub struct Channel {
    index: usize,
    /// Identity of the owning instance; resolved back through the registry,
    /// never used to keep the instance alive.
    timer_id: TimerId,
    irq: Box<dyn InterruptLine>,
    state: AtomicCell<ChannelState>,
    clockevent: IrqSafeRwLock<Option<ClockEventBinding>>,
}

impl Channel {
    pub(crate) fn new(index: usize, timer_id: TimerId, irq: Box<dyn InterruptLine>) -> Channel {
        Channel {
            index,
            timer_id,
            irq,
            state: AtomicCell::new(ChannelState::Idle),
            clockevent: IrqSafeRwLock::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    pub fn irq(&self) -> &dyn InterruptLine {
        &*self.irq
    }

    pub fn state(&self) -> ChannelState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state);
    }

    /// Whether a clock-event consumer is currently attached.
    pub fn has_clockevent(&self) -> bool {
        self.clockevent.read().is_some()
    }

    /// The configuration of the attached consumer, if any.
    pub fn clockevent_properties(&self) -> Option<ClockEventProperties> {
        self.clockevent.read().as_ref().map(|binding| binding.properties)
    }

    pub(crate) fn attach_clockevent(&self, binding: ClockEventBinding) {
        let mut guard = self.clockevent.write();
        if guard.is_some() {
            log::warn!(
                "kona-timer: channel {} already has a clock-event consumer, replacing it",
                self.index
            );
        }
        *guard = Some(binding);
    }

    pub(crate) fn detach_clockevent(&self) {
        *self.clockevent.write() = None;
    }

    pub(crate) fn with_tick_handler(&self, f: impl FnOnce(&dyn TickHandler)) {
        if let Some(binding) = self.clockevent.read().as_ref() {
            f(&*binding.handler);
        }
    }
}

impl<B: TimerMmio> KonaTimer<B> {
    /// Disables `channel`'s compare and acknowledges its match condition,
    /// then waits for the disable to be latched by the hardware.
    ///
    /// The match bits in the status register are write-one-to-clear and are
    /// shared with the other three channels, so the read value is masked to
    /// avoid acknowledging a neighbour's pending match.
    pub fn disable_and_clear(&self, channel: usize) {
        let mut regs = self.regs.lock();
        let status = regs.read_status();
        let status = (status & !STCS_MATCH_MASK) | match_bit(channel);
        let status = status & !compare_enable_bit(channel);
        regs.write_status(status);
        wait_for_compare_enable_sync(&*regs, channel, false);
    }

    /// Programs `channel` to fire `delta_ticks` from now.
    ///
    /// The deadline is current-counter-plus-delta: time spent between the
    /// counter read and the compare write is not compensated, so each
    /// rearm carries a small additive skew. Fails only if the current
    /// counter value cannot be read, in which case nothing is armed.
    pub fn set_next_event(&self, channel_index: usize, delta_ticks: u32) -> Result<(), &'static str> {
        let channel = self
            .channel(channel_index)
            .ok_or("no such timer channel")?;
        // A channel nobody listens to must never fire.
        if !channel.has_clockevent() {
            return Err("channel has no clock-event consumer");
        }

        let mut regs = self.regs.lock();
        let counter = registers::read_counter(&*regs)?;

        regs.write_compare(channel_index, (counter as u32).wrapping_add(delta_ticks));
        wait_for_compare_value_sync(&*regs, channel_index);

        let status = regs.read_status();
        let status = (status & !STCS_MATCH_MASK)
            | match_bit(channel_index)
            | compare_enable_bit(channel_index);
        regs.write_status(status);
        wait_for_compare_enable_sync(&*regs, channel_index, true);
        drop(regs);

        channel.set_state(ChannelState::Armed);
        Ok(())
    }

    /// Stops any pending deadline on `channel` and returns it to `Idle`.
    ///
    /// Used for explicit shutdown and for resume-from-idle; both must leave
    /// the channel in a known disabled state. Safe to call on a channel
    /// that is already disabled.
    pub fn shutdown(&self, channel_index: usize) {
        self.disable_and_clear(channel_index);
        if let Some(channel) = self.channel(channel_index) {
            channel.set_state(ChannelState::Idle);
        }
    }
}
