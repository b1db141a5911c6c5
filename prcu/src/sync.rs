// Sleep-free wait primitives used by the grace-period engine.
//
// Writers wait for migrated readers and barriers wait for their sentinel
// callbacks without a scheduler dependency: waiters spin on their predicate
// with a CPU relaxation hint, and wakers bump an event sequence so a waiter
// can tell a wakeup happened even if the predicate is briefly contended.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A predicate wait queue.
///
/// `wait_until` returns once the predicate holds; `wake_all` nudges every
/// waiter to re-evaluate. The predicate must become true through shared
/// memory writes performed before the wake.
pub(crate) struct WaitQueue {
    event_seq: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            event_seq: AtomicU64::new(0),
        }
    }

    /// Spin until `cond` returns true.
    pub fn wait_until<F: Fn() -> bool>(&self, cond: F) {
        loop {
            let seq = self.event_seq.load(Ordering::Acquire);
            if cond() {
                return;
            }
            // Wait for a wakeup or for the predicate to flip under us.
            while self.event_seq.load(Ordering::Acquire) == seq {
                if cond() {
                    return;
                }
                core::hint::spin_loop();
            }
        }
    }

    /// Wake every waiter so it re-checks its predicate.
    pub fn wake_all(&self) {
        self.event_seq.fetch_add(1, Ordering::Release);
    }
}

/// A one-shot completion, reusable after `reinit`.
pub(crate) struct Completion {
    done: AtomicBool,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Arm the completion for a new round. The caller must guarantee no
    /// waiter from a previous round is still blocked (the barrier mutex
    /// provides this).
    pub fn reinit(&self) {
        self.done.store(false, Ordering::SeqCst);
    }

    pub fn complete(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Spin until `complete` is called.
    pub fn wait(&self) {
        while !self.done.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn completion_round_trip() {
        let c = Completion::new();
        assert!(!c.is_complete());
        c.complete();
        assert!(c.is_complete());
        c.wait();
        c.reinit();
        assert!(!c.is_complete());
    }

    #[test]
    fn wait_until_sees_remote_store() {
        let wq = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicUsize::new(0));

        let waker = {
            let wq = Arc::clone(&wq);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                flag.store(1, Ordering::SeqCst);
                wq.wake_all();
            })
        };

        wq.wait_until(|| flag.load(Ordering::SeqCst) == 1);
        assert_eq!(flag.load(Ordering::SeqCst), 1);
        waker.join().unwrap();
    }

    #[test]
    fn wait_until_immediate_predicate() {
        let wq = WaitQueue::new();
        wq.wait_until(|| true);
    }
}
