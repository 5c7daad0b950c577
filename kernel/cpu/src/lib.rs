//! CPU (core) identity and the CPU-hotplug notification points.
//!
//! Platform bringup code invokes [`notify_cpu_starting`] early on a CPU
//! that is coming online and [`notify_cpu_dying`] on one that is going
//! offline. Subsystems that keep per-CPU hardware state (e.g. a per-CPU
//! tick timer) register their lifecycle entry points once via
//! [`register_hotplug_handlers`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use derive_more::{Display, From, Into};
use log::{error, trace};
use spin::Once;

/// A unique identifier for a CPU (core) in an SMP system.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
pub struct CpuId(u32);

impl CpuId {
    pub fn value(self) -> u32 {
        self.0
    }
}

/// A hotplug lifecycle entry point: invoked with the id of the CPU that is
/// coming online or going offline.
pub type HotplugHandler = Box<dyn Fn(CpuId) + Send + Sync>;

struct HotplugHandlers {
    starting: HotplugHandler,
    dying: HotplugHandler,
}

static HOTPLUG_HANDLERS: Once<HotplugHandlers> = Once::new();

/// Registers the pair of per-CPU lifecycle entry points.
///
/// Only one registration is accepted for the lifetime of the system;
/// a second attempt returns an error and leaves the first registration
/// in place.
pub fn register_hotplug_handlers(
    starting: HotplugHandler,
    dying: HotplugHandler,
) -> Result<(), &'static str> {
    let mut registered = false;
    HOTPLUG_HANDLERS.call_once(|| {
        registered = true;
        HotplugHandlers { starting, dying }
    });
    if registered {
        Ok(())
    } else {
        error!("cpu: hotplug handlers already registered");
        Err("cpu hotplug handlers already registered")
    }
}

/// Invoked by platform bringup on a CPU that is coming online.
pub fn notify_cpu_starting(cpu: CpuId) {
    trace!("cpu {}: starting", cpu);
    if let Some(handlers) = HOTPLUG_HANDLERS.get() {
        (handlers.starting)(cpu);
    }
}

/// Invoked by platform teardown on a CPU that is going offline.
pub fn notify_cpu_dying(cpu: CpuId) {
    trace!("cpu {}: dying", cpu);
    if let Some(handlers) = HOTPLUG_HANDLERS.get() {
        (handlers.dying)(cpu);
    }
}
