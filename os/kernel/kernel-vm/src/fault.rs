//! Translation-miss fault handling.
//!
//! [`handle_fault`] is the single synchronous path invoked on every cache
//! miss. It is one-shot: classify the faulting address, read the resident
//! frame from the owning region's table, install the mapping, return. It
//! never allocates — every mapped page became resident during load
//! preparation — and keeps no state across calls; a later re-miss (say,
//! after eviction) simply re-enters the same path.

use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualPage};

use crate::VmError;
use crate::address_space::{AddressSpace, CODE_SEGMENT};
use crate::layout::{MAX_SEGMENTS, stack_base, stack_top};
use crate::tlb::TranslationCache;

/// What the hardware reported about the faulting access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// Write through an entry installed without the dirty bit.
    WriteToReadOnly,
}

/// Resolve a fault at `addr` for the current address space and install the
/// mapping into the translation cache.
///
/// # Errors
/// - [`VmError::ReadOnlyPage`] — write to the finalized code segment; the
///   one legitimate outcome of a [`FaultKind::WriteToReadOnly`] fault.
/// - [`VmError::BadAddress`] — no current space (very early boot), or the
///   address lies outside every mapped region.
/// - [`VmError::InvariantViolation`] — fatal: malformed segment geometry, a
///   fault on a page that was never made resident, or a write-protection
///   fault anywhere but the finished code segment.
pub fn handle_fault(
    space: Option<&AddressSpace>,
    cache: &mut TranslationCache,
    kind: FaultKind,
    addr: VirtualAddress,
) -> Result<(), VmError> {
    let vpage = addr.page();
    log::trace!("fault: {kind:?} at {addr}");

    if kind == FaultKind::WriteToReadOnly {
        // Expected exactly when the finished code segment turned its pages
        // clean; anything else means an entry was installed wrong.
        return match space {
            Some(space) if space.load_complete() && in_code_segment(space, vpage) => {
                Err(VmError::ReadOnlyPage)
            }
            _ => Err(VmError::InvariantViolation(
                "write-protection fault outside the finished code segment",
            )),
        };
    }

    let Some(space) = space else {
        // Early boot, before any process exists. Reporting instead of
        // retrying keeps the kernel out of an infinite faulting loop.
        return Err(VmError::BadAddress);
    };

    validate_geometry(space)?;

    let (frame, in_code) = resident_frame(space, vpage)?;
    let dirty = !(in_code && space.load_complete());
    cache.insert(vpage, frame, dirty);
    log::trace!("map {vpage} -> {frame} (dirty: {dirty})");
    Ok(())
}

fn in_code_segment(space: &AddressSpace, vpage: VirtualPage) -> bool {
    space
        .segment(CODE_SEGMENT)
        .is_some_and(|seg| seg.contains(vpage))
}

/// A faulting process must have a fully set-up space. Holes here mean the
/// loader contract was broken, which no user program can recover from.
fn validate_geometry(space: &AddressSpace) -> Result<(), VmError> {
    for slot in 0..MAX_SEGMENTS {
        let Some(seg) = space.segment(slot) else {
            return Err(VmError::InvariantViolation("segment not defined"));
        };
        if seg.base().base().as_u64() == 0 || seg.pages() == 0 {
            return Err(VmError::InvariantViolation("malformed segment geometry"));
        }
        if !seg.base().base().is_page_aligned() {
            return Err(VmError::InvariantViolation("segment base unaligned"));
        }
    }
    Ok(())
}

/// Classify `vpage` into one region and read its resident frame.
/// Returns the frame and whether the page belongs to the code segment.
fn resident_frame(
    space: &AddressSpace,
    vpage: VirtualPage,
) -> Result<(PhysicalPage, bool), VmError> {
    for slot in 0..MAX_SEGMENTS {
        if let Some(seg) = space.segment(slot) {
            if seg.contains(vpage) {
                let frame = space
                    .segment_frame(slot, seg.page_index(vpage))
                    .ok_or(VmError::InvariantViolation(
                        "fault on a page that is not resident",
                    ))?;
                return Ok((frame, slot == CODE_SEGMENT));
            }
        }
    }

    if vpage >= stack_base() && vpage.base() < stack_top() {
        let index = (vpage.number() - stack_base().number()) as usize;
        let frame = space
            .stack_frame(index)
            .ok_or(VmError::InvariantViolation(
                "fault on a page that is not resident",
            ))?;
        return Ok((frame, false));
    }

    // Unmapped gap, e.g. between the data segment top and the stack base.
    Err(VmError::BadAddress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_without_a_space_is_a_bad_address() {
        let mut cache = TranslationCache::new();
        assert_eq!(
            handle_fault(None, &mut cache, FaultKind::Read, VirtualAddress::new(0x1000)),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn stray_write_protection_fault_is_fatal() {
        let mut cache = TranslationCache::new();
        // no space at all
        assert!(matches!(
            handle_fault(
                None,
                &mut cache,
                FaultKind::WriteToReadOnly,
                VirtualAddress::new(0x1000)
            ),
            Err(VmError::InvariantViolation(_))
        ));

        // a space that never finished loading
        let space = AddressSpace::new();
        assert!(matches!(
            handle_fault(
                Some(&space),
                &mut cache,
                FaultKind::WriteToReadOnly,
                VirtualAddress::new(0x1000)
            ),
            Err(VmError::InvariantViolation(_))
        ));
    }

    #[test]
    fn half_defined_space_is_fatal() {
        let mut cache = TranslationCache::new();
        let mut space = AddressSpace::new();
        space
            .define_region(
                VirtualAddress::new(0x0040_0000),
                0x1000,
                crate::Permissions::default(),
            )
            .unwrap();

        assert!(matches!(
            handle_fault(
                Some(&space),
                &mut cache,
                FaultKind::Read,
                VirtualAddress::new(0x0040_0000)
            ),
            Err(VmError::InvariantViolation(_))
        ));
    }
}
