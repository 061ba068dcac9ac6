//! Distributed shared/exclusive locking over a remote 64-bit word.
//!
//! There is no central arbiter: mutual exclusion is realized purely through
//! remote atomics on the target's lock word, polled with cooperative
//! progress draining between attempts. The word encodes 0 for unlocked,
//! [`LOCK_EXCLUSIVE`] for an exclusive holder, and otherwise the count of
//! concurrent shared holders.
//!
//! The `try_*` primitives perform exactly one acquisition attempt; the
//! `acquire_*` wrappers spin over them, draining fabric progress between
//! attempts. Spinning without draining progress stalls forever under the
//! single-threaded cooperative progress model.

use crate::error::Result;
use crate::transport::{AtomicOp, Fabric};
use crate::Rank;

/// Lock word value when no lock is held.
pub const LOCK_UNLOCKED: u64 = 0;

/// Lock word value of an exclusive holder.
///
/// Shared holders count upward from zero, so this sentinel must stay above
/// any possible concurrent shared-holder count. Holders are bounded by the
/// group size; 2^32 leaves that bound far behind.
pub const LOCK_EXCLUSIVE: u64 = 1 << 32;

/// Lock level requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared access; concurrent with other shared holders.
    Shared,
    /// Exclusive access.
    Exclusive,
}

/// One currently-held lock on a remote peer.
///
/// At most one record exists per target per process; created on successful
/// acquisition and destroyed on the matching unlock.
#[derive(Debug)]
pub struct LockRecord {
    /// Rank the lock is held on.
    pub target: Rank,
    /// Requested lock level.
    pub kind: LockKind,
    /// True when the lock was taken under NOCHECK and no remote word was
    /// touched.
    pub nocheck: bool,
}

/// One exclusive-acquisition attempt: CAS the word from unlocked to the
/// exclusive sentinel. Returns true when the lock was obtained.
pub fn try_acquire_exclusive<F: Fabric>(fabric: &F, target: Rank, addr: u64) -> Result<bool> {
    let prior = fabric.compare_and_swap(target, addr, LOCK_UNLOCKED, LOCK_EXCLUSIVE)?;
    Ok(prior == LOCK_UNLOCKED)
}

/// One shared-acquisition attempt: increment the holder count, undoing the
/// increment immediately if an exclusive holder was present.
pub fn try_acquire_shared<F: Fabric>(fabric: &F, target: Rank, addr: u64) -> Result<bool> {
    let prior = fabric.fetch_and_op(target, addr, AtomicOp::Add, 1)?;
    assert!((prior as i64) >= 0);
    if prior >= LOCK_EXCLUSIVE {
        // The increment landed on an exclusively-held word and is invalid.
        fabric.post_op(target, addr, AtomicOp::Add, (-1i64) as u64)?;
        Ok(false)
    } else {
        Ok(true)
    }
}

/// Acquire an exclusive lock, spinning until the CAS succeeds.
pub fn acquire_exclusive<F: Fabric>(fabric: &F, target: Rank, addr: u64) -> Result<()> {
    loop {
        if try_acquire_exclusive(fabric, target, addr)? {
            return Ok(());
        }
        fabric.progress();
    }
}

/// Acquire a shared lock, spinning until no exclusive holder is observed.
pub fn acquire_shared<F: Fabric>(fabric: &F, target: Rank, addr: u64) -> Result<()> {
    loop {
        if try_acquire_shared(fabric, target, addr)? {
            return Ok(());
        }
        fabric.progress();
    }
}

/// Release an exclusive lock by subtracting the sentinel.
///
/// No concurrent shared attempt can leave a residue on an exclusively-held
/// word (the attempt undoes its own increment), so the subtraction restores
/// the word to unlocked.
pub fn release_exclusive<F: Fabric>(fabric: &F, target: Rank, addr: u64) -> Result<()> {
    fabric.post_op(
        target,
        addr,
        AtomicOp::Add,
        (LOCK_EXCLUSIVE as i64).wrapping_neg() as u64,
    )
}

/// Release a shared lock by decrementing the holder count.
pub fn release_shared<F: Fabric>(fabric: &F, target: Rank, addr: u64) -> Result<()> {
    fabric.post_op(target, addr, AtomicOp::Add, (-1i64) as u64)
}

/// Release an exclusive lock with a completion fence and a verified swap.
///
/// Used for the accumulate/state lock: all operations issued under the lock
/// are fenced before the word is reset, and the prior value is checked to
/// have been the exclusive sentinel.
pub fn release_exclusive_checked<F: Fabric>(fabric: &F, target: Rank, addr: u64) -> Result<()> {
    fabric.fence()?;
    let prior = fabric.fetch_and_op(target, addr, AtomicOp::Swap, LOCK_UNLOCKED)?;
    assert_eq!(prior, LOCK_EXCLUSIVE, "state lock released while not held");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeFabric;
    use crate::transport::FlushScope;

    const ADDR: u64 = 0x1000;

    #[test]
    fn test_exclusive_roundtrip() {
        let fabric = FakeFabric::new();
        acquire_exclusive(&fabric, 1, ADDR).unwrap();
        assert_eq!(fabric.word(1, ADDR), LOCK_EXCLUSIVE);

        release_exclusive(&fabric, 1, ADDR).unwrap();
        assert_eq!(fabric.word(1, ADDR), LOCK_UNLOCKED);
    }

    #[test]
    fn test_exclusive_blocks_exclusive() {
        let fabric = FakeFabric::new();
        assert!(try_acquire_exclusive(&fabric, 0, ADDR).unwrap());
        assert!(!try_acquire_exclusive(&fabric, 0, ADDR).unwrap());
        assert_eq!(fabric.word(0, ADDR), LOCK_EXCLUSIVE);
    }

    #[test]
    fn test_shared_counts_holders() {
        let fabric = FakeFabric::new();
        assert!(try_acquire_shared(&fabric, 2, ADDR).unwrap());
        assert!(try_acquire_shared(&fabric, 2, ADDR).unwrap());
        assert_eq!(fabric.word(2, ADDR), 2);

        release_shared(&fabric, 2, ADDR).unwrap();
        release_shared(&fabric, 2, ADDR).unwrap();
        assert_eq!(fabric.word(2, ADDR), LOCK_UNLOCKED);
    }

    #[test]
    fn test_shared_undoes_increment_under_exclusive() {
        let fabric = FakeFabric::new();
        assert!(try_acquire_exclusive(&fabric, 0, ADDR).unwrap());

        // The failed attempt must leave no residue on the word.
        assert!(!try_acquire_shared(&fabric, 0, ADDR).unwrap());
        assert_eq!(fabric.word(0, ADDR), LOCK_EXCLUSIVE);
    }

    #[test]
    fn test_exclusive_blocks_shared() {
        let fabric = FakeFabric::new();
        assert!(try_acquire_shared(&fabric, 0, ADDR).unwrap());
        assert!(!try_acquire_exclusive(&fabric, 0, ADDR).unwrap());
        assert_eq!(fabric.word(0, ADDR), 1);
    }

    #[test]
    fn test_checked_release_fences_first() {
        let fabric = FakeFabric::new();
        acquire_exclusive(&fabric, 3, ADDR).unwrap();
        release_exclusive_checked(&fabric, 3, ADDR).unwrap();
        assert_eq!(fabric.word(3, ADDR), LOCK_UNLOCKED);

        // The fence must be observed strictly before the word reset.
        let fence_at = fabric.position_of_fence().unwrap();
        let reset_at = fabric.position_of_swap(3, ADDR).unwrap();
        assert!(fence_at < reset_at);
    }

    #[test]
    fn test_transport_error_leaves_word_untouched() {
        let fabric = FakeFabric::new();
        fabric.fail_after(0);
        assert!(try_acquire_exclusive(&fabric, 0, ADDR).is_err());
        assert_eq!(fabric.word(0, ADDR), LOCK_UNLOCKED);
        // A flush afterwards still works; the failure was a one-shot.
        fabric.flush(FlushScope::Worker).unwrap();
    }
}
