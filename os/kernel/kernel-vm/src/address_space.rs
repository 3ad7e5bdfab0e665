//! Per-process address space.
//!
//! An address space holds up to [`MAX_SEGMENTS`] loadable segments (code
//! first, then data) plus the fixed stack band, each backed page-for-page by
//! a frame table. The loader drives the lifecycle: define the segments,
//! [`AddressSpace::prepare_load`] to make every page resident and zeroed,
//! load the image, [`AddressSpace::complete_load`] to finalize — after which
//! the code segment is write-protected, lazily, at fault time.
//!
//! No internal lock: at most one mutator is active per address space. The
//! narrow window where a fork populates the child overlaps no other use,
//! since the child is not yet runnable.

use alloc::vec::Vec;

use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualPage, pages_spanned};

use crate::VmError;
use crate::frame_map::FrameAllocator;
use crate::layout::{MAX_SEGMENTS, STACK_PAGES, stack_top};
use crate::ram::PhysicalMemory;
use crate::tlb::TranslationCache;

/// Slot index of the code segment (the only one whose protection is ever
/// enforced).
pub const CODE_SEGMENT: usize = 0;

/// Read/write/execute triple recorded at segment definition.
///
/// Recorded for every segment but consulted for none: the only enforcement
/// this model performs is the code segment's write protection after load
/// completes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    #[must_use]
    pub const fn new(read: bool, write: bool, execute: bool) -> Self {
        Self {
            read,
            write,
            execute,
        }
    }
}

/// One contiguous virtual region, backed page-for-page by frames.
#[derive(Copy, Clone, Debug)]
pub struct Segment {
    base: VirtualPage,
    pages: usize,
    perms: Permissions,
}

impl Segment {
    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualPage {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    #[inline]
    #[must_use]
    pub const fn perms(&self) -> Permissions {
        self.perms
    }

    /// Whether `page` lies inside this segment.
    #[must_use]
    pub fn contains(&self, page: VirtualPage) -> bool {
        let number = page.number();
        let base = self.base.number();
        number >= base && number < base + self.pages as u64
    }

    /// Page index of `page` within the segment; caller ensures containment.
    #[must_use]
    pub fn page_index(&self, page: VirtualPage) -> usize {
        debug_assert!(self.contains(page));
        (page.number() - self.base.number()) as usize
    }
}

/// Per-process address-space descriptor.
pub struct AddressSpace {
    segments: [Option<Segment>; MAX_SEGMENTS],
    segment_frames: [Vec<PhysicalPage>; MAX_SEGMENTS],
    stack_frames: Vec<PhysicalPage>,
    load_complete: bool,
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace {
    /// An empty space: no segments, nothing resident, load not complete.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segments: [None; MAX_SEGMENTS],
            segment_frames: [const { Vec::new() }; MAX_SEGMENTS],
            stack_frames: Vec::new(),
            load_complete: false,
        }
    }

    /// Register the next loadable segment.
    ///
    /// Any sub-page offset of `vaddr` is absorbed into the size, the base is
    /// aligned down and the size rounded up to whole pages. The first call
    /// defines the code segment, the second the data segment.
    ///
    /// # Errors
    /// [`VmError::TooManySegments`] on a third call; the existing segments
    /// are untouched.
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        size: u64,
        perms: Permissions,
    ) -> Result<(), VmError> {
        let size = size + vaddr.offset_in_page();
        let segment = Segment {
            base: vaddr.page(),
            pages: pages_spanned(size) as usize,
            perms,
        };

        let slot = self
            .segments
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(VmError::TooManySegments)?;
        *slot = Some(segment);
        Ok(())
    }

    /// Make every page of every region resident and zero-filled.
    ///
    /// Frames are taken one page at a time, so the regions need not be
    /// physically contiguous.
    ///
    /// # Errors
    /// [`VmError::InvariantViolation`] if any frame table is already
    /// populated (this runs once per space). [`VmError::OutOfMemory`] is
    /// returned at the first failed allocation; the partially populated
    /// space remains safe to [`destroy`](Self::destroy).
    pub fn prepare_load(
        &mut self,
        alloc: &FrameAllocator,
        ram: &mut PhysicalMemory,
    ) -> Result<(), VmError> {
        if !self.stack_frames.is_empty() || self.segment_frames.iter().any(|t| !t.is_empty()) {
            return Err(VmError::InvariantViolation("load preparation re-entered"));
        }

        for index in 0..MAX_SEGMENTS {
            let pages = self.segments[index].map_or(0, |s| s.pages);
            for _ in 0..pages {
                let frame = alloc.allocate(1)?.page();
                ram.zero_page(frame);
                self.segment_frames[index].push(frame);
            }
        }
        for _ in 0..STACK_PAGES {
            let frame = alloc.allocate(1)?.page();
            ram.zero_page(frame);
            self.stack_frames.push(frame);
        }
        Ok(())
    }

    /// Mark the program image fully resident and flush the translation
    /// cache, so future faults see the code segment write-protected.
    pub fn complete_load(&mut self, cache: &mut TranslationCache) {
        self.load_complete = true;
        cache.invalidate_all();
    }

    /// Initial stack pointer for a new thread of this space.
    ///
    /// # Errors
    /// [`VmError::InvariantViolation`] if the stack is not resident yet.
    pub fn stack_pointer(&self) -> Result<VirtualAddress, VmError> {
        if self.stack_frames.len() != STACK_PAGES {
            return Err(VmError::InvariantViolation("stack not resident"));
        }
        Ok(stack_top())
    }

    /// An independent copy: same geometry, permissions and load flag, every
    /// resident page duplicated onto freshly allocated frames.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if frames run out midway; every frame the
    /// copy had already taken is released again and the source is left
    /// unmodified.
    pub fn duplicate(
        &self,
        alloc: &FrameAllocator,
        ram: &mut PhysicalMemory,
    ) -> Result<Self, VmError> {
        let mut new = Self::new();
        new.segments = self.segments;
        new.load_complete = self.load_complete;

        if let Err(err) = self.copy_pages_into(&mut new, alloc, ram) {
            new.destroy(alloc)?;
            return Err(err);
        }
        Ok(new)
    }

    fn copy_pages_into(
        &self,
        new: &mut Self,
        alloc: &FrameAllocator,
        ram: &mut PhysicalMemory,
    ) -> Result<(), VmError> {
        for index in 0..MAX_SEGMENTS {
            for &src in &self.segment_frames[index] {
                let dst = alloc.allocate(1)?.page();
                ram.copy_page(src, dst);
                new.segment_frames[index].push(dst);
            }
        }
        for &src in &self.stack_frames {
            let dst = alloc.allocate(1)?.page();
            ram.copy_page(src, dst);
            new.stack_frames.push(dst);
        }
        Ok(())
    }

    /// Tear the space down, returning every resident frame to the allocator.
    ///
    /// Tolerates partial population: each region releases exactly what its
    /// table holds.
    ///
    /// # Errors
    /// [`VmError::InvariantViolation`] only if the frame map no longer
    /// recognizes a frame this table recorded — a corruption, fatal.
    pub fn destroy(mut self, alloc: &FrameAllocator) -> Result<(), VmError> {
        for table in &mut self.segment_frames {
            for frame in table.drain(..) {
                alloc.free(frame.base())?;
            }
        }
        for frame in self.stack_frames.drain(..) {
            alloc.free(frame.base())?;
        }
        Ok(())
    }

    /// Make this the current space: invalidate every translation-cache
    /// entry. Entries carry no process tag, so this must run on every
    /// context switch.
    pub fn activate(&self, cache: &mut TranslationCache) {
        cache.invalidate_all();
    }

    #[inline]
    #[must_use]
    pub const fn load_complete(&self) -> bool {
        self.load_complete
    }

    /// The segment in `slot`, if defined.
    #[must_use]
    pub fn segment(&self, slot: usize) -> Option<&Segment> {
        self.segments.get(slot)?.as_ref()
    }

    /// Resident frame for page `page_index` of segment `slot`.
    #[must_use]
    pub fn segment_frame(&self, slot: usize, page_index: usize) -> Option<PhysicalPage> {
        self.segment_frames.get(slot)?.get(page_index).copied()
    }

    /// Resident frame for page `page_index` of the stack band (counted up
    /// from the stack base).
    #[must_use]
    pub fn stack_frame(&self, page_index: usize) -> Option<PhysicalPage> {
        self.stack_frames.get(page_index).copied()
    }

    /// Every currently resident frame, across all three regions.
    pub fn resident_frames(&self) -> impl Iterator<Item = PhysicalPage> + '_ {
        self.segment_frames
            .iter()
            .flatten()
            .chain(self.stack_frames.iter())
            .copied()
    }
}
