//! Single-owner token for a project's build loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const UNOWNED: u64 = 0;

/// Identifies one acquisition; stale tokens stop matching once the slot is
/// released or force-released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerToken(u64);

#[derive(Debug, Default)]
pub struct OwnershipSlot {
    current: AtomicU64,
    next_generation: AtomicU64,
}

impl OwnershipSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take ownership, or `None` if a loop already owns the project.
    pub fn try_acquire(self: &Arc<Self>) -> Option<OwnershipGuard> {
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.current
            .compare_exchange(UNOWNED, generation, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| OwnershipGuard {
                slot: Arc::clone(self),
                token: OwnerToken(generation),
            })
    }

    pub fn is_owned(&self) -> bool {
        self.current.load(Ordering::Acquire) != UNOWNED
    }

    pub fn is_current(&self, token: OwnerToken) -> bool {
        self.current.load(Ordering::Acquire) == token.0
    }

    /// Release whatever holds the slot; the holder's guard becomes inert.
    pub fn force_release(&self) -> bool {
        self.current.swap(UNOWNED, Ordering::AcqRel) != UNOWNED
    }

    /// Release if `token` is still the owner.
    pub fn release(&self, token: OwnerToken) {
        let _ = self.current.compare_exchange(
            token.0,
            UNOWNED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Releases ownership on drop unless it was force-released first.
#[derive(Debug)]
pub struct OwnershipGuard {
    slot: Arc<OwnershipSlot>,
    token: OwnerToken,
}

impl OwnershipGuard {
    pub fn token(&self) -> OwnerToken {
        self.token
    }

    pub fn is_active(&self) -> bool {
        self.slot.is_current(self.token)
    }
}

impl Drop for OwnershipGuard {
    fn drop(&mut self) {
        self.slot.release(self.token);
    }
}
