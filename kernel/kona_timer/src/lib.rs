//! Driver for the Broadcom Kona general-purpose timer block.
//!
//! Each timer instance owns a free-running 64-bit counter and four
//! compare-match channels, each channel with its own interrupt line. An
//! instance serves one of two roles: as a *free-running source* it backs
//! the system-wide monotonic clock (registered with the `time` crate), and
//! as an *event multiplexer* its channels deliver one-shot tick events,
//! one channel per CPU for the designated local timer.
//!
//! There are two such timers on Kona SoCs (AON and Peripheral), plus a
//! possible core timer variant, for a ceiling of three concurrently active
//! instances.
//!
//! Arming a channel follows the hardware's handshake protocol: compare
//! values and compare-enable bits are latched asynchronously by the timer,
//! and the status register carries a sync bit per channel that software
//! must poll before relying on the new state. All multi-access register
//! sequences run under a per-instance interrupt-safe lock, since the
//! status register is shared by all four channels.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod channel;
pub mod percpu;
pub mod registers;

#[cfg(test)]
pub(crate) mod mock;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use interrupts::{EoiBehaviour, InterruptHandler, InterruptLine};
use log::{debug, error, info, warn};
use sync_irq::{IrqSafeMutex, IrqSafeRwLock};
use time::{ClockSource, Instant, Period};

pub use channel::{Channel, ChannelState, ClockEventBinding};
pub use percpu::{LocalTimerHooks, TickHandlerFactory};
pub use registers::{read_counter, TimerMmio, TimerRegisters};

/// There are 2 timers for Kona (AON and Peripheral), plus Core for the
/// BCM23550, adding up to a potential total of 3.
pub const MAX_NUM_TIMERS: usize = 3;

/// Each timer has 4 compare channels, each with its own IRQ.
pub const MAX_NUM_CHANNELS: usize = 4;

/// The smallest deadline a channel can reliably latch, in counter ticks.
pub const MIN_EVENT_DELTA_TICKS: u32 = 6;

/// The largest programmable deadline, bounded by the 32-bit compare
/// registers.
pub const MAX_EVENT_DELTA_TICKS: u32 = 0xffff_ffff;

/// The identity of a timer instance: its creation-order slot in the
/// [`TimerRegistry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerId(usize);

impl TimerId {
    pub fn value(self) -> usize {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role a timer instance plays in the system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerRole {
    /// The instance backs the monotonic time base with its free-running
    /// counter; its channels stay unused.
    FreeRunningSource,
    /// The instance's channels are exposed as one-shot clock-event sources.
    EventMultiplexer,
}

/// Device geometry for one timer instance, as handed over by the platform
/// after firmware/device-tree parsing.
pub struct TimerGeometry<B: TimerMmio> {
    pub name: &'static str,
    /// Access to the instance's memory-mapped register block.
    pub regs: B,
    /// Tick rate of the free-running counter, in Hz. Zero means the
    /// platform could not determine a rate and fails the probe.
    pub rate_hz: u32,
    /// One interrupt line per channel; the channel count is taken from the
    /// number of lines, capped at [`MAX_NUM_CHANNELS`].
    pub irqs: Vec<Box<dyn InterruptLine>>,
    pub role: TimerRole,
}

/// One Kona timer instance: a register block, a tick rate, and up to four
/// compare channels.
pub struct KonaTimer<B: TimerMmio> {
    id: TimerId,
    name: &'static str,
    rate_hz: u32,
    role: TimerRole,
    /// Guards every multi-access register sequence. The status register is
    /// shared by all four channels, so the lock is per-instance, not
    /// per-channel, and must be interrupt-safe: the dispatcher takes it
    /// from interrupt context.
    regs: IrqSafeMutex<B>,
    channels: [Option<Channel>; MAX_NUM_CHANNELS],
    num_channels: usize,
}

impl<B: TimerMmio> KonaTimer<B> {
    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    pub fn role(&self) -> TimerRole {
        self.role
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)?.as_ref()
    }

    /// Reads the 64-bit free-running counter.
    pub fn read_counter(&self) -> Result<u64, &'static str> {
        registers::read_counter(&*self.regs.lock())
    }
}

/// The process-wide table of active timer instances.
///
/// Explicitly owned: callers share it as a [`SharedRegistry`] and pass it
/// to every operation that needs cross-instance lookup (interrupt dispatch
/// resolves a channel back to its owning instance through here).
pub struct TimerRegistry<B: TimerMmio> {
    timers: [Option<KonaTimer<B>>; MAX_NUM_TIMERS],
    num_timers: usize,
    local_timer: Option<TimerId>,
}

impl<B: TimerMmio> TimerRegistry<B> {
    pub const fn new() -> TimerRegistry<B> {
        TimerRegistry {
            timers: [None, None, None],
            num_timers: 0,
            local_timer: None,
        }
    }

    pub fn num_timers(&self) -> usize {
        self.num_timers
    }

    pub fn is_full(&self) -> bool {
        self.num_timers >= MAX_NUM_TIMERS
    }

    pub fn timer(&self, id: TimerId) -> Option<&KonaTimer<B>> {
        self.timers.get(id.0)?.as_ref()
    }

    /// The instance designated as the per-CPU local timer, if any.
    pub fn local_timer(&self) -> Option<TimerId> {
        self.local_timer
    }
}

impl<B: TimerMmio> Default for TimerRegistry<B> {
    fn default() -> TimerRegistry<B> {
        TimerRegistry::new()
    }
}

/// How the registry is shared between probe (process context) and the
/// interrupt dispatcher.
pub type SharedRegistry<B> = Arc<IrqSafeRwLock<TimerRegistry<B>>>;

/// Creates an empty shared registry.
pub fn new_shared_registry<B: TimerMmio>() -> SharedRegistry<B> {
    Arc::new(IrqSafeRwLock::new(TimerRegistry::new()))
}

/// Creates a timer instance from `geometry` and registers it.
///
/// Validation happens before any side effect, so a failed probe leaves the
/// registry exactly as it was. For an event multiplexer, every channel is
/// brought to a known disabled state and its interrupt line bound to the
/// dispatcher; a bind failure unwinds all previously bound lines in
/// reverse order and fails the whole probe. The first multiplexer probed
/// becomes the designated local timer; the platform then installs the
/// per-CPU lifecycle hooks via [`LocalTimerHooks::install`].
pub fn probe_timer<B: TimerMmio + 'static>(
    registry: &SharedRegistry<B>,
    geometry: TimerGeometry<B>,
) -> Result<TimerId, &'static str> {
    let TimerGeometry {
        name,
        regs,
        rate_hz,
        mut irqs,
        role,
    } = geometry;

    let mut registry_guard = registry.write();
    if registry_guard.is_full() {
        error!(
            "kona-timer: exceeded maximum number of timers ({})",
            MAX_NUM_TIMERS
        );
        return Err("exceeded maximum number of timers");
    }
    if rate_hz == 0 {
        error!("kona-timer: unable to determine tick rate for {}", name);
        return Err("unable to determine tick rate");
    }
    if irqs.is_empty() {
        error!("kona-timer: no interrupts provided for {}", name);
        return Err("no interrupts provided");
    }
    if irqs.len() > MAX_NUM_CHANNELS {
        warn!(
            "kona-timer: too many interrupts provided, capping out at {}",
            MAX_NUM_CHANNELS
        );
        irqs.truncate(MAX_NUM_CHANNELS);
    }

    let id = TimerId(registry_guard.num_timers);
    let num_channels = irqs.len();
    debug!(
        "kona-timer: initializing timer {} ({}), {} channels",
        id, name, num_channels
    );

    let mut channels: [Option<Channel>; MAX_NUM_CHANNELS] = [None, None, None, None];
    for (index, irq) in irqs.into_iter().enumerate() {
        channels[index] = Some(Channel::new(index, id, irq));
    }

    let timer = KonaTimer {
        id,
        name,
        rate_hz,
        role,
        regs: IrqSafeMutex::new(regs),
        channels,
        num_channels,
    };

    match role {
        TimerRole::FreeRunningSource => {
            register_free_running_source(registry, id, name, rate_hz)?;
        }
        TimerRole::EventMultiplexer => {
            for (index, channel) in timer.channels.iter().flatten().enumerate() {
                // Start from a known disabled state before the line can fire.
                timer.disable_and_clear(index);
                let dispatcher = channel_dispatcher(registry.clone(), id, index);
                if let Err(e) = channel.irq().bind(dispatcher) {
                    error!(
                        "kona-timer: binding the interrupt of channel {} failed: {}",
                        index, e
                    );
                    for bound in timer.channels[..index].iter().flatten().rev() {
                        bound.irq().unbind();
                    }
                    return Err("binding a channel interrupt failed");
                }
            }
            if registry_guard.local_timer.is_none() {
                info!("kona-timer: timer {} ({}) is the designated local timer", id, name);
                registry_guard.local_timer = Some(id);
            }
        }
    }

    registry_guard.timers[id.0] = Some(timer);
    registry_guard.num_timers += 1;
    Ok(id)
}

/// Registers the instance's free-running counter as the system-wide
/// monotonic clock source.
///
/// If the anti-tearing counter read ever fails, the read callback falls
/// back to the last successfully observed value so the time base never
/// moves backwards on a transient hardware fault.
fn register_free_running_source<B: TimerMmio + 'static>(
    registry: &SharedRegistry<B>,
    id: TimerId,
    name: &'static str,
    rate_hz: u32,
) -> Result<(), &'static str> {
    let reader_registry = registry.clone();
    let last_good = AtomicU64::new(0);
    let read = Box::new(move || {
        let guard = reader_registry.read();
        let ticks = guard
            .timer(id)
            .and_then(|timer| timer.read_counter().ok());
        match ticks {
            Some(ticks) => {
                last_good.store(ticks, Ordering::Relaxed);
                Instant::new(ticks)
            }
            None => Instant::new(last_good.load(Ordering::Relaxed)),
        }
    });
    time::register_clock_source(ClockSource::new(name, Period::from_hz(rate_hz), read))
}

/// Builds the interrupt handler bound to one channel's line.
fn channel_dispatcher<B: TimerMmio + 'static>(
    registry: SharedRegistry<B>,
    timer: TimerId,
    channel: usize,
) -> InterruptHandler {
    Box::new(move || handle_channel_interrupt(&registry.read(), timer, channel))
}

/// Services a compare-match interrupt for one channel.
///
/// The compare condition is disabled and acknowledged first, then the
/// attached tick consumer (if any) is invoked exactly once; the consumer
/// typically re-arms the channel before this returns. Unresolvable context
/// is logged and the interrupt reported handled anyway, since leaving it
/// unacknowledged would storm.
pub fn handle_channel_interrupt<B: TimerMmio>(
    registry: &TimerRegistry<B>,
    timer_id: TimerId,
    channel_index: usize,
) -> EoiBehaviour {
    let Some(timer) = registry.timer(timer_id) else {
        error!("kona-timer: interrupt for unknown timer {}", timer_id);
        return EoiBehaviour::HandlerDidNotSendEoi;
    };
    let Some(channel) = timer.channel(channel_index) else {
        error!(
            "kona-timer: interrupt for unknown channel {} of timer {}",
            channel_index, timer_id
        );
        return EoiBehaviour::HandlerDidNotSendEoi;
    };

    channel.set_state(ChannelState::Firing);
    timer.disable_and_clear(channel_index);
    channel.set_state(ChannelState::Idle);
    // With no consumer attached the event is dropped after clearing.
    channel.with_tick_handler(|handler| handler.handle_tick());
    EoiBehaviour::HandlerDidNotSendEoi
}
