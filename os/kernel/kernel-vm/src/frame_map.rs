//! Physical frame accounting.
//!
//! The allocator runs in two phases. Before [`FrameAllocator::bootstrap`]
//! there is no bookkeeping at all: allocations bump a watermark over the raw
//! extent and are never reclaimed. `bootstrap` then carves the descriptor map
//! itself off the front of the remaining extent and switches to managed
//! operation: one descriptor per frame, contiguous runs found first-fit,
//! frees validated against the recorded run length.
//!
//! A single lock serializes every allocate/free across all threads. Both
//! operations have bounded latency (one linear scan worst case); allocation
//! happens only at boot and load time, so the scan cost is acceptable.

use alloc::vec;
use alloc::vec::Vec;

use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};
use kernel_sync::SpinLock;

use crate::VmError;
use crate::ram::PhysicalExtent;

/// Allocation state of one managed frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FrameState {
    Free,
    /// Base of an allocated run, recording the run's exact length.
    RunStart(usize),
    /// Interior member of a run.
    RunBody,
}

/// Descriptor map over the managed region.
struct FrameMap {
    /// First managed frame; everything below it is outside the map.
    base: PhysicalPage,
    frames: Vec<FrameState>,
}

impl FrameMap {
    /// Frame index of `addr`, if it lies in the managed region.
    fn index_of(&self, addr: PhysicalAddress) -> Option<usize> {
        let base = self.base.base().as_u64();
        if addr.as_u64() < base {
            return None;
        }
        let index = ((addr.as_u64() - base) / PAGE_SIZE) as usize;
        (index < self.frames.len()).then_some(index)
    }

    /// First-fit scan for `npages` consecutive free frames; marks the run and
    /// returns its base.
    fn take_run(&mut self, npages: usize) -> Option<PhysicalAddress> {
        let limit = self.frames.len().checked_sub(npages - 1)?;
        for start in 0..limit {
            if self.frames[start..start + npages]
                .iter()
                .all(|state| *state == FrameState::Free)
            {
                self.frames[start] = FrameState::RunStart(npages);
                for state in &mut self.frames[start + 1..start + npages] {
                    *state = FrameState::RunBody;
                }
                return Some(self.base.add_pages(start as u64).base());
            }
        }
        None
    }

    /// Release the run starting at frame `start`.
    ///
    /// The caller must hand back the exact base it was given; anything else
    /// is detected before any descriptor changes.
    fn release_run(&mut self, start: usize) -> Result<(), VmError> {
        let len = match self.frames[start] {
            FrameState::RunStart(len) => len,
            FrameState::Free => {
                return Err(VmError::InvariantViolation("free of an unallocated frame"));
            }
            FrameState::RunBody => {
                return Err(VmError::InvariantViolation("free of a run interior"));
            }
        };
        if start + len > self.frames.len()
            || self.frames[start + 1..start + len]
                .iter()
                .any(|state| *state != FrameState::RunBody)
        {
            return Err(VmError::InvariantViolation("frame map corrupted"));
        }
        for state in &mut self.frames[start..start + len] {
            *state = FrameState::Free;
        }
        Ok(())
    }
}

struct Inner {
    /// Bump cursor for allocations made before the map exists.
    watermark: PhysicalAddress,
    top: PhysicalAddress,
    map: Option<FrameMap>,
}

/// Physical frame allocator.
///
/// Explicitly constructed by the boot sequence and passed by reference into
/// every address-space operation; there is no ambient global instance.
pub struct FrameAllocator {
    inner: SpinLock<Inner>,
}

impl FrameAllocator {
    /// Take over the probed extent. Not ready yet: allocations bump the
    /// watermark until [`bootstrap`](Self::bootstrap) runs.
    #[must_use]
    pub const fn new(extent: PhysicalExtent) -> Self {
        Self {
            inner: SpinLock::new(Inner {
                watermark: extent.first_free,
                top: extent.top,
                map: None,
            }),
        }
    }

    /// Build the descriptor map and switch to managed operation.
    ///
    /// The map's own storage is carved off the front of the unmanaged extent
    /// (estimated frame count × descriptor size, rounded up to a page
    /// boundary); the managed region starts after the carve. Everything
    /// handed out before this point lies below the managed region and is
    /// permanently leaked. A second call is a no-op.
    pub fn bootstrap(&self) {
        let mut inner = self.inner.lock();
        if inner.map.is_some() {
            return;
        }

        let lo = inner.watermark.as_u64();
        let hi = inner.top.as_u64();
        let estimated_frames = (hi - lo) / PAGE_SIZE;
        let map_bytes =
            (estimated_frames * size_of::<FrameState>() as u64).next_multiple_of(PAGE_SIZE);
        let base = lo + map_bytes;
        let frame_count = hi.saturating_sub(base) / PAGE_SIZE;

        inner.map = Some(FrameMap {
            base: PhysicalPage::from_aligned(PhysicalAddress::new(base)),
            frames: vec![FrameState::Free; frame_count as usize],
        });
        log::debug!("frame map ready: {frame_count} frames managed from 0x{base:08X}");
    }

    /// Allocate `npages` contiguous frames; lowest free address wins.
    ///
    /// Before bootstrap this bumps the watermark (never reclaimed); after,
    /// it first-fit scans the descriptor map.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] on exhaustion,
    /// [`VmError::InvalidArgument`] for a zero-length request.
    pub fn allocate(&self, npages: usize) -> Result<PhysicalAddress, VmError> {
        if npages == 0 {
            return Err(VmError::InvalidArgument);
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match &mut inner.map {
            Some(map) => map.take_run(npages).ok_or(VmError::OutOfMemory),
            None => {
                let addr = inner.watermark;
                let next = addr.as_u64() + npages as u64 * PAGE_SIZE;
                if next > inner.top.as_u64() {
                    return Err(VmError::OutOfMemory);
                }
                inner.watermark = PhysicalAddress::new(next);
                Ok(addr)
            }
        }
    }

    /// Free the run whose base is `addr`.
    ///
    /// # Errors
    /// [`VmError::InvalidArgument`] if `addr` is unaligned or outside the
    /// managed region (watermark allocations are never reclaimed);
    /// [`VmError::InvariantViolation`] for a double free or a free of a
    /// non-base address. A rejected call leaves the map unchanged.
    pub fn free(&self, addr: PhysicalAddress) -> Result<(), VmError> {
        if !addr.is_page_aligned() {
            return Err(VmError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        let map = inner.map.as_mut().ok_or(VmError::InvalidArgument)?;
        let start = map.index_of(addr).ok_or(VmError::InvalidArgument)?;
        map.release_run(start)
    }

    /// Whether [`bootstrap`](Self::bootstrap) has run.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.lock().map.is_some()
    }

    /// Number of managed frames (zero before bootstrap).
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.inner.lock().map.as_ref().map_or(0, |m| m.frames.len())
    }

    /// Number of currently free managed frames.
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.inner.lock().map.as_ref().map_or(0, |m| {
            m.frames
                .iter()
                .filter(|state| **state == FrameState::Free)
                .count()
        })
    }

    /// First managed frame, once bootstrapped.
    #[must_use]
    pub fn managed_base(&self) -> Option<PhysicalPage> {
        self.inner.lock().map.as_ref().map(|m| m.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::PhysicalMemory;

    /// Allocator over `total_pages` of RAM, bootstrapped. One page goes to
    /// the descriptor carve, so `total_pages - 1` frames end up managed.
    fn boot(total_pages: usize) -> FrameAllocator {
        let ram = PhysicalMemory::new(total_pages);
        let alloc = FrameAllocator::new(ram.probe());
        alloc.bootstrap();
        alloc
    }

    fn frame(alloc: &FrameAllocator, index: u64) -> PhysicalAddress {
        alloc.managed_base().unwrap().add_pages(index).base()
    }

    #[test]
    fn first_fit_reuses_lowest_address() {
        let alloc = boot(9);
        assert_eq!(alloc.frame_count(), 8);

        let a = alloc.allocate(3).unwrap();
        assert_eq!(a, frame(&alloc, 0));
        let b = alloc.allocate(2).unwrap();
        assert_eq!(b, frame(&alloc, 3));

        alloc.free(a).unwrap();
        let c = alloc.allocate(3).unwrap();
        assert_eq!(c, frame(&alloc, 0));
    }

    #[test]
    fn allocate_then_free_restores_the_map() {
        let alloc = boot(9);
        let before = alloc.free_frames();

        let run = alloc.allocate(4).unwrap();
        assert_eq!(alloc.free_frames(), before - 4);
        alloc.free(run).unwrap();
        assert_eq!(alloc.free_frames(), before);

        // the same run is handed out again
        assert_eq!(alloc.allocate(4).unwrap(), run);
    }

    #[test]
    fn runs_are_disjoint_and_freeable_in_any_order() {
        let alloc = boot(9);
        let a = alloc.allocate(3).unwrap();
        let b = alloc.allocate(2).unwrap();
        assert!(b.as_u64() >= a.as_u64() + 3 * PAGE_SIZE);

        alloc.free(b).unwrap();
        alloc.free(a).unwrap();
        assert_eq!(alloc.free_frames(), alloc.frame_count());

        let alloc = boot(9);
        let a = alloc.allocate(3).unwrap();
        let b = alloc.allocate(2).unwrap();
        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
        assert_eq!(alloc.free_frames(), alloc.frame_count());
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let alloc = boot(9);
        assert_eq!(alloc.allocate(9), Err(VmError::OutOfMemory));
        let _ = alloc.allocate(8).unwrap();
        assert_eq!(alloc.allocate(1), Err(VmError::OutOfMemory));
    }

    #[test]
    fn misuse_is_detected_not_absorbed() {
        let alloc = boot(9);
        let a = alloc.allocate(3).unwrap();
        let free_before = alloc.free_frames();

        // interior of the run
        assert!(matches!(
            alloc.free(a + PAGE_SIZE),
            Err(VmError::InvariantViolation(_))
        ));
        // untouched by the rejected call
        assert_eq!(alloc.free_frames(), free_before);

        alloc.free(a).unwrap();
        // second free of the same base
        assert!(matches!(
            alloc.free(a),
            Err(VmError::InvariantViolation(_))
        ));

        // never-managed addresses
        assert_eq!(
            alloc.free(PhysicalAddress::new(0)),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            alloc.free(frame(&alloc, 0) + 1),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn watermark_allocations_sit_below_the_managed_region() {
        let ram = PhysicalMemory::new(9);
        let alloc = FrameAllocator::new(ram.probe());
        assert!(!alloc.is_ready());

        let early = alloc.allocate(2).unwrap();
        alloc.bootstrap();
        assert!(alloc.is_ready());

        let base = alloc.managed_base().unwrap().base();
        assert!(early.as_u64() < base.as_u64());
        // leaked for good: the managed path refuses to take it back
        assert_eq!(alloc.free(early), Err(VmError::InvalidArgument));

        // managed allocations never overlap the early ones
        let managed = alloc.allocate(1).unwrap();
        assert!(managed.as_u64() >= base.as_u64());
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let alloc = boot(9);
        let count = alloc.frame_count();
        let a = alloc.allocate(2).unwrap();
        alloc.bootstrap();
        assert_eq!(alloc.frame_count(), count);
        alloc.free(a).unwrap();
    }

    #[test]
    fn zero_length_requests_are_rejected() {
        let alloc = boot(9);
        assert_eq!(alloc.allocate(0), Err(VmError::InvalidArgument));
    }
}
