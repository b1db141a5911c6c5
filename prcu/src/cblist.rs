// Per-processor callback list.
//
// Two parallel singly-linked FIFOs: one of callback records, one of
// version-stamp records. Each enqueue appends one of each; each dequeue
// removes the head of each, so the lists always have equal length and the
// stamps are non-decreasing along the list (the local grace-period version
// a stamp is taken from only grows).
//
// Stamp records are recycled through a per-list free pool so the enqueue
// path, which runs with interrupts disabled, does not normally allocate.

use alloc::boxed::Box;
use core::ptr;

/// A deferred callback. The box is supplied by the caller of
/// [`Prcu::call`](crate::Prcu::call); PRCU owns it from enqueue until
/// dispatch, at which point invocation consumes it.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// List entry payload. `Barrier` is the reserved sentinel enqueued by the
/// barrier cross-call; it is dispatched internally and never surfaces to
/// callers.
pub(crate) enum CallbackKind {
    Func(Callback),
    Barrier,
}

/// Callback record: payload plus next-link.
struct CallbackHead {
    func: CallbackKind,
    next: *mut CallbackHead,
}

/// Version-stamp record. Pool-managed; exclusively owned by the list.
struct VersionHead {
    version: u64,
    next: *mut VersionHead,
}

/// Stamp records kept on the free pool beyond this point are returned to
/// the allocator instead.
const STAMP_POOL_MAX: usize = 64;

pub(crate) struct CbList {
    head: *mut CallbackHead,
    tail: *mut CallbackHead,
    version_head: *mut VersionHead,
    version_tail: *mut VersionHead,
    len: usize,
    /// Free pool of stamp records.
    free: *mut VersionHead,
    free_len: usize,
}

// Safety: all nodes are uniquely owned heap allocations reachable only
// through this list, and the callback payloads are Send.
unsafe impl Send for CbList {}

impl CbList {
    /// Create an empty list with `pool` pre-allocated stamp records.
    pub fn with_pool(pool: usize) -> Self {
        let mut list = Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            version_head: ptr::null_mut(),
            version_tail: ptr::null_mut(),
            len: 0,
            free: ptr::null_mut(),
            free_len: 0,
        };
        for _ in 0..pool {
            let vhp = Box::into_raw(Box::new(VersionHead {
                version: 0,
                next: ptr::null_mut(),
            }));
            list.push_free(vhp);
        }
        list
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Version stamp of the oldest callback, if any.
    pub fn first_version(&self) -> Option<u64> {
        if self.version_head.is_null() {
            debug_assert!(self.head.is_null());
            debug_assert_eq!(self.len, 0);
            return None;
        }
        // Safety: a non-null version head is a live node owned by the list.
        Some(unsafe { (*self.version_head).version })
    }

    /// Append a callback stamped with `version` to the tail.
    pub fn enqueue(&mut self, func: CallbackKind, version: u64) {
        let rhp = Box::into_raw(Box::new(CallbackHead {
            func,
            next: ptr::null_mut(),
        }));
        let vhp = self.take_free();
        // Safety: `vhp` is uniquely owned here, either fresh or popped off
        // the free pool.
        unsafe {
            (*vhp).version = version;
            (*vhp).next = ptr::null_mut();
        }

        if self.tail.is_null() {
            debug_assert!(self.head.is_null() && self.version_head.is_null());
            self.head = rhp;
            self.version_head = vhp;
        } else {
            // Safety: non-null tails are the live last nodes of each list.
            unsafe {
                debug_assert!((*self.version_tail).version <= version);
                (*self.tail).next = rhp;
                (*self.version_tail).next = vhp;
            }
        }
        self.tail = rhp;
        self.version_tail = vhp;
        self.len += 1;
    }

    /// Remove and return the oldest callback and its version stamp.
    ///
    /// Returns `None` on an empty list; asking is not an error, but an
    /// empty callback list with a non-empty stamp list (or vice versa) is.
    pub fn dequeue(&mut self) -> Option<(CallbackKind, u64)> {
        let rhp = self.head;
        if rhp.is_null() {
            debug_assert!(self.version_head.is_null());
            debug_assert_eq!(self.len, 0);
            return None;
        }
        let vhp = self.version_head;
        debug_assert!(!vhp.is_null());

        // Safety: both heads are live nodes owned by the list.
        unsafe {
            self.head = (*rhp).next;
            self.version_head = (*vhp).next;
        }
        self.len -= 1;
        if self.head.is_null() {
            debug_assert!(self.version_head.is_null());
            debug_assert_eq!(self.len, 0);
            self.tail = ptr::null_mut();
            self.version_tail = ptr::null_mut();
        }

        // Safety: both nodes are now unlinked and uniquely owned.
        let node = unsafe { Box::from_raw(rhp) };
        let version = unsafe { (*vhp).version };
        self.release_stamp(vhp);
        Some((node.func, version))
    }

    /// Pop a stamp record off the free pool, falling back to the allocator
    /// when the pool is dry.
    fn take_free(&mut self) -> *mut VersionHead {
        if self.free.is_null() {
            log::warn!("prcu: version stamp pool exhausted, allocating");
            return Box::into_raw(Box::new(VersionHead {
                version: 0,
                next: ptr::null_mut(),
            }));
        }
        let vhp = self.free;
        // Safety: a non-null free head is a live pooled node.
        self.free = unsafe { (*vhp).next };
        self.free_len -= 1;
        vhp
    }

    fn push_free(&mut self, vhp: *mut VersionHead) {
        // Safety: caller passes a uniquely-owned unlinked node.
        unsafe {
            (*vhp).next = self.free;
        }
        self.free = vhp;
        self.free_len += 1;
    }

    /// Return a dequeued stamp record to the pool, or to the allocator if
    /// the pool is full.
    fn release_stamp(&mut self, vhp: *mut VersionHead) {
        if self.free_len < STAMP_POOL_MAX {
            self.push_free(vhp);
        } else {
            // Safety: the node is unlinked and uniquely owned.
            drop(unsafe { Box::from_raw(vhp) });
        }
    }

    #[cfg(all(test, feature = "std"))]
    fn pooled_stamps(&self) -> usize {
        self.free_len
    }
}

impl Drop for CbList {
    fn drop(&mut self) {
        // Drop undispatched callbacks without invoking them.
        while self.dequeue().is_some() {}
        while !self.free.is_null() {
            let vhp = self.free;
            // Safety: pooled nodes are uniquely owned by the list.
            unsafe {
                self.free = (*vhp).next;
                drop(Box::from_raw(vhp));
            }
        }
        self.free_len = 0;
    }
}
