// RCU-protected pointer cell.
//
// The safe-Rust face of the primitive: readers get a borrow valid for the
// life of their guard without taking any lock, updaters copy-modify-publish
// and hand the displaced value to the callback machinery for reclamation
// after a grace period.

use alloc::boxed::Box;
use core::marker::PhantomData;
use core::ops::Deref;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::grace::Prcu;

/// A value protected by PRCU grace periods.
///
/// Reads are wait-free brackets around a pointer load; updates replace the
/// pointer and defer freeing the old value until every reader that could
/// have seen it has finished.
pub struct PrcuCell<T: Send + Sync + 'static> {
    prcu: &'static Prcu,
    data: AtomicPtr<T>,
    _marker: PhantomData<T>,
}

/// Moves a raw pointer into a reclamation callback. The pointee was
/// unlinked by the publishing swap, so ownership is unique.
struct SendPtr<T>(*mut T);
unsafe impl<T: Send> Send for SendPtr<T> {}

impl<T: Send + Sync + 'static> PrcuCell<T> {
    pub fn new(prcu: &'static Prcu, value: T) -> Self {
        Self {
            prcu,
            data: AtomicPtr::new(Box::into_raw(Box::new(value))),
            _marker: PhantomData,
        }
    }

    /// Read the current value inside a read-side critical section.
    pub fn read(&self) -> CellReadGuard<'_, T> {
        self.prcu.read_lock();
        let ptr = self.data.load(Ordering::Acquire);
        CellReadGuard {
            // Safety: the pointer was published by new() or an update and
            // is only reclaimed after a grace period; this read section
            // holds such a period open.
            inner: unsafe { &*ptr },
            prcu: self.prcu,
            _not_send: PhantomData,
        }
    }

    /// Publish `f(current)` and defer reclaiming the displaced value.
    ///
    /// Concurrent updaters race on publication; the last swap wins and
    /// every displaced value is reclaimed through its own callback.
    pub fn update<F: FnOnce(&T) -> T>(&self, f: F) {
        let old = self.data.load(Ordering::Acquire);
        // Safety: `old` is the currently published value; it cannot be
        // reclaimed before the swap below unlinks it.
        let new = Box::into_raw(Box::new(f(unsafe { &*old })));
        let prev = SendPtr(self.data.swap(new, Ordering::AcqRel));
        self.prcu.call(Box::new(move || {
            // Safety: unlinked by the swap and a full grace period has
            // elapsed, so no reader still holds a borrow.
            let prev = prev;
            drop(unsafe { Box::from_raw(prev.0) });
        }));
    }

    /// Publish `value`, deferring reclamation of the old one.
    pub fn replace(&self, value: T) {
        self.update(move |_| value);
    }
}

impl<T: Send + Sync + 'static> Drop for PrcuCell<T> {
    fn drop(&mut self) {
        let ptr = *self.data.get_mut();
        // Readers may still be inside sections that loaded the final
        // value; wait them out rather than queueing a callback the caller
        // could never flush.
        self.prcu.synchronize();
        // Safety: the cell is gone, the grace period has elapsed.
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// Borrow of a [`PrcuCell`] value, held inside a read-side critical
/// section. Not `Send`; see [`crate::ReadGuard`].
pub struct CellReadGuard<'a, T> {
    inner: &'a T,
    prcu: &'a Prcu,
    _not_send: PhantomData<*mut ()>,
}

impl<T> Deref for CellReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner
    }
}

impl<T> Drop for CellReadGuard<'_, T> {
    fn drop(&mut self) {
        self.prcu.read_unlock();
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::sim::harness;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct Tracked {
        drops: Arc<AtomicUsize>,
        value: u32,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn read_sees_latest_published_value() {
        let (_host, prcu) = harness(1);
        let cell = PrcuCell::new(prcu, 41u32);
        assert_eq!(*cell.read(), 41);
        cell.replace(42);
        assert_eq!(*cell.read(), 42);
        cell.update(|v| v + 1);
        assert_eq!(*cell.read(), 43);
    }

    #[test]
    fn displaced_value_reclaimed_after_grace_period() {
        let (_host, prcu) = harness(1);
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = PrcuCell::new(
            prcu,
            Tracked {
                drops: Arc::clone(&drops),
                value: 1,
            },
        );
        cell.replace(Tracked {
            drops: Arc::clone(&drops),
            value: 2,
        });
        assert_eq!(cell.read().value, 2);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        prcu.synchronize();
        prcu.check_callbacks();
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(cell);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
