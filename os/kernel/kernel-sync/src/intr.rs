//! Interrupt-enable state, modeled as a disable depth.
//!
//! Translation-cache updates must not be interrupted mid read-modify-write on
//! the current core. [`IntrGuard`] expresses that window: creating one raises
//! the disable depth, dropping it lowers the depth again. Interrupts count as
//! enabled only at depth zero, so guards nest correctly.
//!
//! This state is per-core on real hardware; here a single atomic stands in
//! for the current core, which keeps the contract observable under tests.

use core::sync::atomic::{AtomicUsize, Ordering};

static DISABLE_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Whether interrupts are currently enabled (disable depth zero).
#[inline]
#[must_use]
pub fn enabled() -> bool {
    DISABLE_DEPTH.load(Ordering::Acquire) == 0
}

/// RAII guard over one level of interrupt disabling.
///
/// ```rust
/// use kernel_sync::intr::{self, IntrGuard};
///
/// assert!(intr::enabled());
/// {
///     let _g = IntrGuard::disable();
///     assert!(!intr::enabled());
/// }
/// assert!(intr::enabled());
/// ```
pub struct IntrGuard {
    _private: (),
}

impl IntrGuard {
    /// Raise the disable depth by one level.
    #[inline]
    #[must_use]
    pub fn disable() -> Self {
        DISABLE_DEPTH.fetch_add(1, Ordering::AcqRel);
        Self { _private: () }
    }
}

impl Drop for IntrGuard {
    /// Lower the disable depth by the one level this guard holds.
    fn drop(&mut self) {
        let prev = DISABLE_DEPTH.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "interrupt disable depth underflow");
    }
}
