//! Per-CPU lifecycle control for the designated local timer.
//!
//! Each CPU needs an independent one-shot deadline timer for its local
//! scheduler tick; the four channels of one timer instance map 1:1 onto up
//! to four CPUs. When a CPU comes online its channel gets a fresh
//! clock-event consumer and an enabled interrupt line; when it goes
//! offline the channel is shut down and the consumer detached. The channel
//! itself persists across these transitions.

use alloc::boxed::Box;
use alloc::sync::Arc;

use cpu::CpuId;
use log::{debug, error, warn};
use time::{ClockEventProperties, EventMode, TickHandler};

use crate::channel::{Channel, ClockEventBinding};
use crate::{
    KonaTimer, SharedRegistry, TimerMmio, TimerRegistry, MAX_EVENT_DELTA_TICKS,
    MIN_EVENT_DELTA_TICKS,
};

/// Produces the tick consumer for a CPU that is coming online. Supplied by
/// the tick layer when the hooks are created.
pub type TickHandlerFactory = Box<dyn Fn(CpuId) -> Box<dyn TickHandler> + Send + Sync>;

/// The CPU-hotplug entry points for the designated local timer.
pub struct LocalTimerHooks<B: TimerMmio> {
    registry: SharedRegistry<B>,
    make_handler: TickHandlerFactory,
}

impl<B: TimerMmio + 'static> LocalTimerHooks<B> {
    pub fn new(registry: SharedRegistry<B>, make_handler: TickHandlerFactory) -> LocalTimerHooks<B> {
        LocalTimerHooks {
            registry,
            make_handler,
        }
    }

    /// CPU-online entry point: arms `channel[cpu]` of the local timer with
    /// a fresh one-shot clock-event consumer and unmasks its interrupt.
    pub fn cpu_starting(&self, cpu: CpuId) {
        let guard = self.registry.read();
        let Some((timer, channel)) = local_timer_channel(&guard, cpu) else {
            return;
        };

        let properties = ClockEventProperties {
            name: "system timer",
            mode: EventMode::OneShot,
            rate_hz: timer.rate_hz(),
            min_delta_ticks: MIN_EVENT_DELTA_TICKS,
            max_delta_ticks: MAX_EVENT_DELTA_TICKS,
            cpu,
        };
        channel.attach_clockevent(ClockEventBinding {
            properties,
            handler: (self.make_handler)(cpu),
        });
        channel.irq().enable();
        debug!(
            "kona-timer: cpu {} local tick on timer {} channel {}",
            cpu,
            timer.id(),
            channel.index()
        );
    }

    /// CPU-offline entry point: stops the CPU's channel, masks its
    /// interrupt, and detaches the consumer.
    pub fn cpu_dying(&self, cpu: CpuId) {
        let guard = self.registry.read();
        let Some((timer, channel)) = local_timer_channel(&guard, cpu) else {
            return;
        };

        timer.shutdown(channel.index());
        channel.irq().disable();
        channel.detach_clockevent();
        debug!("kona-timer: cpu {} local tick stopped", cpu);
    }

    /// Registers both entry points with the CPU-hotplug notification
    /// point, once for the lifetime of the local timer.
    pub fn install(self) -> Result<(), &'static str> {
        let hooks = Arc::new(self);
        let starting = hooks.clone();
        let dying = hooks;
        cpu::register_hotplug_handlers(
            Box::new(move |cpu| starting.cpu_starting(cpu)),
            Box::new(move |cpu| dying.cpu_dying(cpu)),
        )
    }
}

/// Resolves the designated local timer and the channel serving `cpu`.
fn local_timer_channel<'a, B: TimerMmio>(
    registry: &'a TimerRegistry<B>,
    cpu: CpuId,
) -> Option<(&'a KonaTimer<B>, &'a Channel)> {
    let Some(id) = registry.local_timer() else {
        warn!("kona-timer: no designated local timer for cpu {}", cpu);
        return None;
    };
    let Some(timer) = registry.timer(id) else {
        error!("kona-timer: designated local timer {} is not registered", id);
        return None;
    };
    let Some(channel) = timer.channel(cpu.value() as usize) else {
        error!(
            "kona-timer: timer {} has no channel for cpu {}",
            timer.id(),
            cpu
        );
        return None;
    };
    Some((timer, channel))
}
