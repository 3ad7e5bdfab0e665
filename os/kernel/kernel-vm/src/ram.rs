//! Physical memory backing and the boot-time probe.
//!
//! [`PhysicalMemory`] owns the machine's RAM as a page-granular byte store
//! and plays the role of the boot probe: [`PhysicalMemory::probe`] reports
//! the usable extent the frame allocator takes over. All page access is
//! bounds-checked; handing in a frame outside the store is a caller bug.

use alloc::boxed::Box;
use alloc::vec;
use core::ops::Range;

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

/// Usable physical extent `[first_free, top)` reported by the probe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PhysicalExtent {
    /// First usable address.
    pub first_free: PhysicalAddress,
    /// Exclusive top of usable memory.
    pub top: PhysicalAddress,
}

impl PhysicalExtent {
    /// Usable length in bytes.
    #[inline]
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.top.as_u64() - self.first_free.as_u64()
    }
}

/// The machine's physical memory.
pub struct PhysicalMemory {
    bytes: Box<[u8]>,
}

impl PhysicalMemory {
    /// A zeroed store of `total_pages` whole pages.
    #[must_use]
    pub fn new(total_pages: usize) -> Self {
        Self {
            bytes: vec![0_u8; total_pages * PAGE_SIZE as usize].into_boxed_slice(),
        }
    }

    /// The usable extent, as the boot-time probe would report it.
    #[must_use]
    pub fn probe(&self) -> PhysicalExtent {
        PhysicalExtent {
            first_free: PhysicalAddress::new(0),
            top: PhysicalAddress::new(self.bytes.len() as u64),
        }
    }

    fn byte_range(&self, frame: PhysicalPage) -> Range<usize> {
        let start = frame.base().as_u64();
        assert!(
            start + PAGE_SIZE <= self.bytes.len() as u64,
            "frame {frame} outside physical memory"
        );
        let start = start as usize;
        start..start + PAGE_SIZE as usize
    }

    /// The bytes of one frame.
    #[must_use]
    pub fn page(&self, frame: PhysicalPage) -> &[u8] {
        &self.bytes[self.byte_range(frame)]
    }

    /// The bytes of one frame, writable.
    pub fn page_mut(&mut self, frame: PhysicalPage) -> &mut [u8] {
        let range = self.byte_range(frame);
        &mut self.bytes[range]
    }

    /// Zero-fill one frame.
    pub fn zero_page(&mut self, frame: PhysicalPage) {
        self.page_mut(frame).fill(0);
    }

    /// Copy the contents of frame `src` into frame `dst`.
    pub fn copy_page(&mut self, src: PhysicalPage, dst: PhysicalPage) {
        if src == dst {
            return;
        }
        let from = self.byte_range(src);
        let to = self.byte_range(dst);
        self.bytes.copy_within(from, to.start);
    }
}
