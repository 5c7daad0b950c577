//! Time-keeping contracts: the system-wide monotonic clock source and the
//! clock-event consumer interface.
//!
//! A hardware timer driver with a free-running counter registers itself
//! here via [`register_clock_source`]; everything else reads the time base
//! through [`now`] / [`monotonic_time`]. Timer drivers that multiplex
//! compare channels into per-CPU tick events accept a [`TickHandler`] from
//! the tick layer and call it back on every expired deadline.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use core::time::Duration;
use cpu::CpuId;
use spin::Once;

/// A point on the monotonic time base, measured in ticks of the registered
/// clock source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    pub const fn new(ticks: u64) -> Instant {
        Instant(ticks)
    }

    pub const fn ticks(self) -> u64 {
        self.0
    }
}

const FEMTOSECONDS_PER_SECOND: u64 = 1_000_000_000_000_000;
const FEMTOSECONDS_PER_NANOSECOND: u64 = 1_000_000;

/// The length of one clock-source tick, in femtoseconds.
///
/// Femtosecond granularity keeps the conversion exact for every rate the
/// hardware can actually run at (32 kHz crystals up to GHz counters).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Period {
    femtoseconds: u64,
}

impl Period {
    pub const fn new(femtoseconds: u64) -> Period {
        Period { femtoseconds }
    }

    /// The period of a counter running at `rate_hz`. `rate_hz` must be
    /// non-zero; timer drivers validate their tick rate at probe time.
    pub const fn from_hz(rate_hz: u32) -> Period {
        Period {
            femtoseconds: FEMTOSECONDS_PER_SECOND / rate_hz as u64,
        }
    }

    pub const fn femtoseconds(self) -> u64 {
        self.femtoseconds
    }

    /// The wall-clock duration covered by `ticks` of this period.
    pub fn duration_of(self, ticks: u64) -> Duration {
        let nanos =
            ticks as u128 * self.femtoseconds as u128 / FEMTOSECONDS_PER_NANOSECOND as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// A monotonic clock source: a free-running hardware counter plus the scale
/// factor needed to convert its ticks to wall-clock units.
pub struct ClockSource {
    name: &'static str,
    period: Period,
    read: Box<dyn Fn() -> Instant + Send + Sync>,
}

impl ClockSource {
    pub fn new(
        name: &'static str,
        period: Period,
        read: Box<dyn Fn() -> Instant + Send + Sync>,
    ) -> ClockSource {
        ClockSource { name, period, read }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn period(&self) -> Period {
        self.period
    }

    pub fn now(&self) -> Instant {
        (self.read)()
    }
}

static CLOCK_SOURCE: Once<ClockSource> = Once::new();

/// Registers `source` as the system-wide monotonic time base.
///
/// The first registration wins; a later one is rejected and the original
/// source stays in place.
pub fn register_clock_source(source: ClockSource) -> Result<(), &'static str> {
    let mut registered = false;
    let current = CLOCK_SOURCE.call_once(|| {
        registered = true;
        source
    });
    if registered {
        log::info!(
            "time: registered clock source {:?}, period {} fs",
            current.name(),
            current.period().femtoseconds(),
        );
        Ok(())
    } else {
        Err("a clock source is already registered")
    }
}

/// The current instant of the registered clock source, or `None` if no
/// source has been registered yet.
///
/// This is a single indirect call over the raw counter read, cheap enough
/// to serve as the scheduler clock.
pub fn now() -> Option<Instant> {
    CLOCK_SOURCE.get().map(ClockSource::now)
}

/// The tick period of the registered clock source.
pub fn period() -> Option<Period> {
    CLOCK_SOURCE.get().map(ClockSource::period)
}

/// Monotonic time since the clock source started counting.
pub fn monotonic_time() -> Option<Duration> {
    let source = CLOCK_SOURCE.get()?;
    Some(source.period().duration_of(source.now().ticks()))
}

/// The event-firing modes a clock-event channel can be asked to operate in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventMode {
    /// Each programmed deadline fires exactly once; the consumer re-arms
    /// from its tick callback.
    OneShot,
}

/// Configuration a tick consumer supplies when it attaches to a
/// clock-event channel.
#[derive(Clone, Copy, Debug)]
pub struct ClockEventProperties {
    pub name: &'static str,
    pub mode: EventMode,
    /// Tick rate of the underlying counter, in Hz.
    pub rate_hz: u32,
    /// Smallest deadline the channel can reliably latch, in ticks.
    pub min_delta_ticks: u32,
    /// Largest programmable deadline, in ticks.
    pub max_delta_ticks: u32,
    /// The CPU this channel delivers events to.
    pub cpu: CpuId,
}

/// A consumer of expired clock-event deadlines.
///
/// Invoked synchronously from the timer's interrupt handler; the
/// implementation typically schedules the next deadline before returning.
pub trait TickHandler: Send + Sync {
    fn handle_tick(&self);
}

impl<T: TickHandler + ?Sized> TickHandler for alloc::sync::Arc<T> {
    fn handle_tick(&self) {
        (**self).handle_tick()
    }
}
