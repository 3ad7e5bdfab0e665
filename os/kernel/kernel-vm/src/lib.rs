//! # Virtual Memory Core
//!
//! A minimal virtual-memory subsystem for a single-address-space-per-process
//! kernel: a physical frame allocator, per-process address spaces with two
//! loadable segments plus a fixed stack, and the translation-miss fault
//! handler that installs mappings on demand.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Fault Handler ([`fault`])            │
//! │   classify address → resident frame → cache install  │
//! └───────────────┬─────────────────────┬────────────────┘
//!                 │                     │
//! ┌───────────────▼───────────┐ ┌───────▼────────────────┐
//! │ Address Space             │ │ Translation Cache      │
//! │ ([`address_space`])       │ │ ([`tlb`])              │
//! │  segments, frame tables,  │ │  fixed slots, full     │
//! │  load lifecycle           │ │  flush per switch      │
//! └───────────────┬───────────┘ └────────────────────────┘
//!                 │
//! ┌───────────────▼──────────────────────────────────────┐
//! │ Frame Allocator ([`frame_map`])                      │
//! │   descriptor per frame, first-fit runs, one lock     │
//! └───────────────┬──────────────────────────────────────┘
//!                 │
//! ┌───────────────▼──────────────────────────────────────┐
//! │ Physical Memory ([`ram`])                            │
//! │   boot-time probe, page-granular byte access         │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Every mapped page is physically resident once loading finishes; faults
//! only look up frames populated by [`AddressSpace::prepare_load`] and never
//! allocate. The design is single-core with respect to cache coherency: the
//! whole cache is flushed on every context switch and a cross-core
//! invalidation request is fatal.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod address_space;
pub mod fault;
pub mod frame_map;
pub mod layout;
pub mod ram;
pub mod tlb;

pub use address_space::{AddressSpace, Permissions, Segment};
pub use fault::{FaultKind, handle_fault};
pub use frame_map::FrameAllocator;
pub use ram::{PhysicalExtent, PhysicalMemory};
pub use tlb::TranslationCache;

/// Outcome taxonomy of the whole subsystem.
///
/// [`VmError::InvariantViolation`] is fatal: it means the allocator or loader
/// contract was broken and safe continuation is impossible. It is reported as
/// a value so the contract stays observable; the process layer must halt on
/// it. Everything else is recoverable by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Physical frames (or descriptor space) are exhausted. The caller
    /// unwinds and destroys any partially built address space.
    #[error("out of physical memory")]
    OutOfMemory,

    /// A third loadable segment was requested; existing state is unchanged.
    #[error("no segment slot available")]
    TooManySegments,

    /// Access outside every mapped region; the process layer decides whether
    /// this terminates the faulting process.
    #[error("address outside every mapped region")]
    BadAddress,

    /// Write to the finalized code segment; signals a user-program bug.
    #[error("write to read-only page")]
    ReadOnlyPage,

    /// Malformed request, e.g. a free of an address the allocator never
    /// managed.
    #[error("invalid argument")]
    InvalidArgument,

    /// Fatal: malformed address-space state, allocator misuse, or an
    /// unsupported cross-core operation.
    #[error("kernel invariant violated: {0}")]
    InvariantViolation(&'static str),
}
