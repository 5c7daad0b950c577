//! Synchronization primitives that are safe to use in interrupt handlers.
//!
//! A regular spinlock shared between process context and an interrupt
//! handler can deadlock: if the interrupt preempts a lock holder on the same
//! CPU, the handler spins forever on a lock that can never be released.
//! The locks in this crate disable local interrupts for as long as a guard
//! is held, so a holder cannot be preempted by a handler that takes the
//! same lock.
//!
//! On hosted targets (unit tests) interrupt masking is a no-op and these
//! are plain spinlocks.

#![cfg_attr(not(test), no_std)]

use core::ops::{Deref, DerefMut};

/// A guard representing the interrupt state saved by [`hold_interrupts`].
///
/// When dropped, restores the interrupt flag to what it was when the guard
/// was created. Interrupts that were already disabled stay disabled.
pub struct HeldInterrupts {
    were_enabled: bool,
}

impl Drop for HeldInterrupts {
    fn drop(&mut self) {
        if self.were_enabled {
            unsafe { arch::enable_interrupts() };
        }
    }
}

/// Disables local interrupts and returns a guard that restores the previous
/// interrupt state when dropped.
pub fn hold_interrupts() -> HeldInterrupts {
    let were_enabled = arch::interrupts_enabled();
    unsafe { arch::disable_interrupts() };
    HeldInterrupts { were_enabled }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    use core::arch::asm;

    const IF_BIT: u64 = 1 << 9;

    pub(crate) fn interrupts_enabled() -> bool {
        let rflags: u64;
        unsafe { asm!("pushfq; pop {}", out(reg) rflags) };
        rflags & IF_BIT != 0
    }

    pub(crate) unsafe fn disable_interrupts() {
        asm!("cli", options(nomem, nostack));
    }

    pub(crate) unsafe fn enable_interrupts() {
        asm!("sti", options(nomem, nostack));
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod arch {
    use core::arch::asm;

    /// The IRQ mask bit (`I`) in the DAIF register.
    const DAIF_I_BIT: u64 = 1 << 7;

    pub(crate) fn interrupts_enabled() -> bool {
        let daif: u64;
        unsafe { asm!("mrs {}, DAIF", out(reg) daif, options(nomem, nostack)) };
        daif & DAIF_I_BIT == 0
    }

    pub(crate) unsafe fn disable_interrupts() {
        asm!("msr DAIFSet, #2", options(nomem, nostack));
    }

    pub(crate) unsafe fn enable_interrupts() {
        asm!("msr DAIFClr, #2", options(nomem, nostack));
    }
}

// Hosted targets have no interrupt flag to mask; the locks degrade to plain
// spinlocks, which is what unit tests exercise.
#[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_os = "none")))]
mod arch {
    pub(crate) fn interrupts_enabled() -> bool {
        false
    }

    pub(crate) unsafe fn disable_interrupts() {}

    pub(crate) unsafe fn enable_interrupts() {}
}

/// A spinlock whose guard also holds local interrupts disabled.
pub struct IrqSafeMutex<T: ?Sized> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSafeMutex<T> {
    pub const fn new(value: T) -> IrqSafeMutex<T> {
        IrqSafeMutex {
            inner: spin::Mutex::new(value),
        }
    }
}

impl<T: ?Sized> IrqSafeMutex<T> {
    /// Disables local interrupts, then acquires the lock, spinning until it
    /// is available. Interrupts are re-enabled between acquisition attempts
    /// so pending interrupts are not starved while another CPU holds the
    /// lock.
    pub fn lock(&self) -> IrqSafeMutexGuard<T> {
        loop {
            let held = hold_interrupts();
            if let Some(guard) = self.inner.try_lock() {
                return IrqSafeMutexGuard { guard, _held: held };
            }
            drop(held);
            while self.inner.is_locked() {
                core::hint::spin_loop();
            }
        }
    }

    pub fn try_lock(&self) -> Option<IrqSafeMutexGuard<T>> {
        let held = hold_interrupts();
        self.inner.try_lock().map(|guard| IrqSafeMutexGuard { guard, _held: held })
    }
}

/// Guard for [`IrqSafeMutex`]. Local interrupts stay disabled until this is
/// dropped.
pub struct IrqSafeMutexGuard<'a, T: ?Sized> {
    // Field order matters: the spinlock must be released before `_held`
    // restores the interrupt flag.
    guard: spin::MutexGuard<'a, T>,
    _held: HeldInterrupts,
}

impl<T: ?Sized> Deref for IrqSafeMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for IrqSafeMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// A reader-writer spinlock whose guards also hold local interrupts
/// disabled.
pub struct IrqSafeRwLock<T: ?Sized> {
    inner: spin::RwLock<T>,
}

impl<T> IrqSafeRwLock<T> {
    pub const fn new(value: T) -> IrqSafeRwLock<T> {
        IrqSafeRwLock {
            inner: spin::RwLock::new(value),
        }
    }
}

impl<T: ?Sized> IrqSafeRwLock<T> {
    pub fn read(&self) -> IrqSafeRwLockReadGuard<T> {
        loop {
            let held = hold_interrupts();
            if let Some(guard) = self.inner.try_read() {
                return IrqSafeRwLockReadGuard { guard, _held: held };
            }
            drop(held);
            core::hint::spin_loop();
        }
    }

    pub fn write(&self) -> IrqSafeRwLockWriteGuard<T> {
        loop {
            let held = hold_interrupts();
            if let Some(guard) = self.inner.try_write() {
                return IrqSafeRwLockWriteGuard { guard, _held: held };
            }
            drop(held);
            core::hint::spin_loop();
        }
    }
}

pub struct IrqSafeRwLockReadGuard<'a, T: ?Sized> {
    guard: spin::RwLockReadGuard<'a, T>,
    _held: HeldInterrupts,
}

impl<T: ?Sized> Deref for IrqSafeRwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct IrqSafeRwLockWriteGuard<'a, T: ?Sized> {
    guard: spin::RwLockWriteGuard<'a, T>,
    _held: HeldInterrupts,
}

impl<T: ?Sized> Deref for IrqSafeRwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for IrqSafeRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
