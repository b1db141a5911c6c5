// Per-processor PRCU state.
//
// One record per possible processor, cache-line padded so reader-side
// traffic on one processor does not bounce a neighbour's line. A record is
// written only from its own processor while pinned (readers, the
// context-switch hook, the poll handler) but is read remotely by the
// grace-period scan, so every field shared that way is atomic.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize};
use spin::Mutex;
use static_assertions::const_assert;

use crate::cblist::CbList;

/// Stamp records pre-allocated per processor at init.
const STAMP_POOL_PREFILL: usize = 16;

/// Pads and aligns its contents to a cache line.
#[repr(align(64))]
pub(crate) struct CachePadded<T>(pub T);

const_assert!(core::mem::align_of::<CachePadded<PrcuLocal>>() >= 64);

/// Per-processor PRCU record.
pub(crate) struct PrcuLocal {
    /// Reader nesting depth of the task context running here. Mutated only
    /// from this processor with preemption disabled.
    pub locked: AtomicU32,
    /// Set when a reader has touched this processor since the last context
    /// switch; cleared when the processor declares a quiescent state.
    pub online: AtomicBool,
    /// Largest global grace-period version this processor has acknowledged.
    /// Only grows.
    pub version: AtomicU64,
    /// Largest callback version for which every eligible local callback has
    /// been dispatched.
    pub cb_version: AtomicU64,
    /// Lock-free mirror of `cblist.len()` for the tick-path pending check.
    pub cb_len: AtomicUsize,
    /// Pending callbacks with their version stamps. The lock stands in for
    /// the "own processor, interrupts disabled" exclusion of the enqueue
    /// and dispatch paths.
    pub cblist: Mutex<CbList>,
}

impl PrcuLocal {
    pub fn new() -> Self {
        Self {
            locked: AtomicU32::new(0),
            online: AtomicBool::new(false),
            version: AtomicU64::new(0),
            cb_version: AtomicU64::new(0),
            cb_len: AtomicUsize::new(0),
            cblist: Mutex::new(CbList::with_pool(STAMP_POOL_PREFILL)),
        }
    }
}
