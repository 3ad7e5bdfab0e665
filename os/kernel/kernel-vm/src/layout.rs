//! # Memory Layout
//!
//! Fixed geometry of the user address range. The stack always occupies the
//! same band directly below the top of user space and is fully resident.

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualPage};

/// Exclusive top of the user-mode address range.
///
/// Doubles as the initial stack pointer handed to a new process.
pub const USER_SPACE_TOP: u64 = 0x8000_0000;

/// Pages in the fixed user stack (48 KiB), always resident.
pub const STACK_PAGES: usize = 12;

/// Translation cache capacity.
pub const TLB_SLOTS: usize = 64;

/// Loadable segments per address space. A fixed capacity of this model, not
/// a tunable.
pub const MAX_SEGMENTS: usize = 2;

/// Top-of-stack address (exclusive); the stack grows down from here.
#[inline]
#[must_use]
pub const fn stack_top() -> VirtualAddress {
    VirtualAddress::new(USER_SPACE_TOP)
}

/// First page of the stack band.
#[inline]
#[must_use]
pub const fn stack_base() -> VirtualPage {
    VirtualPage::containing(VirtualAddress::new(
        USER_SPACE_TOP - STACK_PAGES as u64 * PAGE_SIZE,
    ))
}

const _: () = {
    assert!(USER_SPACE_TOP % PAGE_SIZE == 0);
    assert!(STACK_PAGES as u64 * PAGE_SIZE < USER_SPACE_TOP);
    assert!(TLB_SLOTS > 0);
};
