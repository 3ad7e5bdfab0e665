//! Translation cache: the hardware lookup structure mapping recently used
//! virtual pages to frames.
//!
//! Entries carry no process tag, so a context switch must invalidate the
//! whole cache. Updates are read-modify-write sequences; each one runs under
//! an [`IntrGuard`] so it cannot be interrupted on the current core. That is
//! the full extent of the coherency story: there is no cross-core
//! invalidation, and a shootdown request is fatal.

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage};
use kernel_sync::IntrGuard;

use crate::VmError;
use crate::layout::TLB_SLOTS;

#[derive(Copy, Clone)]
struct Slot {
    vpage: VirtualPage,
    frame: PhysicalPage,
    valid: bool,
    dirty: bool,
}

const INVALID: Slot = Slot {
    vpage: VirtualPage::containing(VirtualAddress::new(0)),
    frame: PhysicalPage::containing(PhysicalAddress::new(0)),
    valid: false,
    dirty: false,
};

/// Fixed-capacity translation cache.
pub struct TranslationCache {
    slots: [Slot; TLB_SLOTS],
    /// Replacement state; stands in for the hardware's random register.
    random_state: u64,
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationCache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [INVALID; TLB_SLOTS],
            random_state: 0x2545_F491_4F6C_DD1D,
        }
    }

    /// Install `vpage → frame`.
    ///
    /// Takes the first invalid slot; with every slot valid, overwrites a
    /// pseudo-random one.
    pub fn insert(&mut self, vpage: VirtualPage, frame: PhysicalPage, dirty: bool) {
        let _intr = IntrGuard::disable();

        let index = match self.slots.iter().position(|slot| !slot.valid) {
            Some(free) => free,
            None => self.random_index(),
        };
        self.slots[index] = Slot {
            vpage,
            frame,
            valid: true,
            dirty,
        };
    }

    /// xorshift step over the replacement state.
    fn random_index(&mut self) -> usize {
        let mut x = self.random_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.random_state = x;
        (x % TLB_SLOTS as u64) as usize
    }

    /// Invalidate every entry.
    pub fn invalidate_all(&mut self) {
        let _intr = IntrGuard::disable();
        for slot in &mut self.slots {
            slot.valid = false;
        }
    }

    /// Most recently installed valid entry for `vpage`: `(frame, dirty)`.
    #[must_use]
    pub fn lookup(&self, vpage: VirtualPage) -> Option<(PhysicalPage, bool)> {
        self.slots
            .iter()
            .rev()
            .find(|slot| slot.valid && slot.vpage == vpage)
            .map(|slot| (slot.frame, slot.dirty))
    }

    /// Number of valid entries.
    #[must_use]
    pub fn valid_entries(&self) -> usize {
        self.slots.iter().filter(|slot| slot.valid).count()
    }

    /// Cross-core invalidation request. Unsupported on this single-core
    /// design: always fatal.
    ///
    /// # Errors
    /// Always [`VmError::InvariantViolation`].
    pub fn shootdown(&mut self) -> Result<(), VmError> {
        Err(VmError::InvariantViolation(
            "cross-core translation-cache shootdown is not supported",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpage(n: u64) -> VirtualPage {
        VirtualPage::containing(VirtualAddress::new(n * 0x1000))
    }

    fn frame(n: u64) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(n * 0x1000))
    }

    #[test]
    fn insert_and_lookup() {
        let mut cache = TranslationCache::new();
        assert_eq!(cache.valid_entries(), 0);

        cache.insert(vpage(1), frame(7), true);
        cache.insert(vpage(2), frame(8), false);

        assert_eq!(cache.lookup(vpage(1)), Some((frame(7), true)));
        assert_eq!(cache.lookup(vpage(2)), Some((frame(8), false)));
        assert_eq!(cache.lookup(vpage(3)), None);
        assert_eq!(cache.valid_entries(), 2);
    }

    #[test]
    fn full_cache_overwrites_instead_of_growing() {
        let mut cache = TranslationCache::new();
        for n in 0..TLB_SLOTS as u64 {
            cache.insert(vpage(n), frame(n), true);
        }
        assert_eq!(cache.valid_entries(), TLB_SLOTS);

        // one more: some victim is replaced, capacity holds
        cache.insert(vpage(999), frame(999), true);
        assert_eq!(cache.valid_entries(), TLB_SLOTS);
        assert_eq!(cache.lookup(vpage(999)), Some((frame(999), true)));
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let mut cache = TranslationCache::new();
        cache.insert(vpage(1), frame(1), true);
        cache.insert(vpage(2), frame(2), true);

        cache.invalidate_all();
        assert_eq!(cache.valid_entries(), 0);
        assert_eq!(cache.lookup(vpage(1)), None);
    }

    #[test]
    fn shootdown_is_fatal() {
        let mut cache = TranslationCache::new();
        assert!(matches!(
            cache.shootdown(),
            Err(VmError::InvariantViolation(_))
        ));
    }
}
