//! The interrupt-line abstraction consumed by interrupt-driven drivers.
//!
//! The platform's interrupt-controller driver hands out one
//! [`InterruptLine`] handle per IRQ. A driver binds a handler to the line,
//! enables it, and the platform invokes the handler whenever the line
//! asserts. This crate defines only the contract; delivery (controller
//! programming, vector tables, EOI) belongs to the platform.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;

/// A hardware interrupt number, as routed by the platform's interrupt
/// controller.
pub type InterruptNumber = u32;

/// Whether a handler issued an end-of-interrupt itself, or left it to the
/// platform's dispatch path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EoiBehaviour {
    HandlerDidNotSendEoi,
    HandlerSentEoi,
}

/// A handler bound to one interrupt line.
///
/// Runs in interrupt context: it must not block and may only take
/// interrupt-safe locks.
pub type InterruptHandler = Box<dyn Fn() -> EoiBehaviour + Send + Sync>;

/// One interrupt line, as provided by the platform.
///
/// Handles use interior mutability: enabling, disabling, and binding all
/// take `&self` so that shared references to a line can be kept by both the
/// driver and the platform's dispatch path.
pub trait InterruptLine: Send + Sync {
    /// The line's interrupt number.
    fn number(&self) -> InterruptNumber;

    /// Binds `handler` to this line.
    ///
    /// A line carries at most one handler; binding an already-bound line
    /// fails and leaves the existing handler in place.
    fn bind(&self, handler: InterruptHandler) -> Result<(), &'static str>;

    /// Removes the bound handler, if any. The line should be disabled
    /// first; an unbound line that asserts is the platform's spurious-
    /// interrupt problem.
    fn unbind(&self);

    /// Unmasks the line at the interrupt controller.
    fn enable(&self);

    /// Masks the line at the interrupt controller.
    fn disable(&self);
}
