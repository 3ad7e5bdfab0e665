//! # Kernel synchronization primitives
//!
//! A spin lock for short, bounded critical sections and an RAII guard over
//! the per-core interrupt-enable state.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod intr;
mod spin_lock;

pub use intr::IntrGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
