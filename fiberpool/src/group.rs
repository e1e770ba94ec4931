//! Completion counters for batches of jobs.

use std::cell::Cell;

use crate::queue::JobId;

const MAGIC: u32 = 0x4642_5250;

/// Counter used to signal when a group of jobs is done.
///
/// A group is allocated by the caller — on the stack, inside an object,
/// wherever — and handed by reference to the enqueue functions. It tracks
/// the number of outstanding jobs attributed to it and remembers the single
/// job currently awaiting it, if any. Awaiting with a threshold of zero is a
/// full join; a non-zero threshold resumes the waiter as soon as at most
/// that many jobs remain outstanding, which is how a producer keeps a
/// pipeline full without overflowing it.
///
/// A group must outlive every job attributed to it; the enqueue functions
/// are `unsafe` for this reason. Reusing a group after a wait has returned
/// is fine, the counter restores itself.
pub struct Group {
    /// The one job parked on this group, if any.
    pub(crate) job: Cell<Option<JobId>>,
    pub(crate) count: Cell<u32>,
    pub(crate) magic: Cell<u32>,
}

impl Group {
    /// Create a group tracking zero outstanding jobs.
    ///
    /// The counter starts at 1, not 0: `wait()` decrements and re-increments
    /// it around the possible suspension unconditionally, so the bias both
    /// spares it a special case on the first call and makes it safe to await
    /// a group that never had jobs enqueued.
    pub fn new() -> Self {
        Group {
            job: Cell::new(None),
            count: Cell::new(1),
            magic: Cell::new(MAGIC),
        }
    }

    pub(crate) fn assert_valid(&self) {
        assert!(
            self.magic.get() == MAGIC,
            "group is corrupt or was never initialized",
        );
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Group").finish_non_exhaustive()
    }
}

// SAFETY: the fields are only ever read or written while the owning
// scheduler's lock is held, which is what makes the `Cell`s safe to share
// between the waiting thread and the workers.
unsafe impl Send for Group {}
unsafe impl Sync for Group {}
