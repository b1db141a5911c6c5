// Simulated host for tests and benchmarks.
//
// Models an SMP machine with std threads: each test thread binds itself to
// a processor id, cross-processor calls run inline (every shared field the
// handlers touch is atomic, so the executing thread does not matter for
// correctness), and deferred dispatch runs immediately through the
// registered hook, like a softirq taken as soon as it is raised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::vec::Vec;

use crate::grace::{DispatchHook, Prcu};
use crate::host::Host;

/// An in-process model of the host kernel.
pub struct SimHost {
    cpus: usize,
    online: Vec<AtomicBool>,
    /// Which processor each test thread is "running" on. Unbound threads
    /// run on processor 0.
    bindings: Mutex<HashMap<ThreadId, usize>>,
    hook: OnceLock<DispatchHook>,
    /// Deferred requests raised before a hook was registered, kept so
    /// tests can drive dispatch by hand.
    deferred: Vec<AtomicBool>,
    ipis: AtomicUsize,
    defers: AtomicUsize,
}

impl SimHost {
    pub fn new(cpus: usize) -> Self {
        assert!(cpus > 0, "a host has at least one processor");
        Self {
            cpus,
            online: (0..cpus).map(|_| AtomicBool::new(true)).collect(),
            bindings: Mutex::new(HashMap::new()),
            hook: OnceLock::new(),
            deferred: (0..cpus).map(|_| AtomicBool::new(false)).collect(),
            ipis: AtomicUsize::new(0),
            defers: AtomicUsize::new(0),
        }
    }

    /// Leak a host so it can back a `Prcu` domain, which borrows it for
    /// `'static`.
    pub fn leaked(cpus: usize) -> &'static SimHost {
        Box::leak(Box::new(Self::new(cpus)))
    }

    /// Run the calling thread on processor `cpu` from now on.
    pub fn bind(&self, cpu: usize) {
        assert!(cpu < self.cpus);
        self.bindings
            .lock()
            .unwrap()
            .insert(thread::current().id(), cpu);
    }

    /// Flip a processor's hotplug state.
    pub fn set_online(&self, cpu: usize, online: bool) {
        self.online[cpu].store(online, Ordering::SeqCst);
    }

    /// Cross-processor calls issued so far.
    pub fn ipis_sent(&self) -> usize {
        self.ipis.load(Ordering::SeqCst)
    }

    /// Deferred-dispatch requests raised so far.
    pub fn defers_raised(&self) -> usize {
        self.defers.load(Ordering::SeqCst)
    }

    /// Consume a deferred request recorded before hook registration.
    pub fn take_deferred(&self, cpu: usize) -> bool {
        self.deferred[cpu].swap(false, Ordering::SeqCst)
    }
}

impl Host for SimHost {
    fn nr_cpus(&self) -> usize {
        self.cpus
    }

    fn pin(&self) -> usize {
        *self
            .bindings
            .lock()
            .unwrap()
            .get(&thread::current().id())
            .unwrap_or(&0)
    }

    fn unpin(&self) {}

    fn push_off(&self) -> bool {
        false
    }

    fn pop_off(&self, _was_enabled: bool) {}

    fn cpu_online(&self, cpu: usize) -> bool {
        self.online[cpu].load(Ordering::SeqCst)
    }

    fn smp_call(&self, cpu: usize, call: &(dyn Fn() + Sync)) {
        assert!(cpu < self.cpus);
        self.ipis.fetch_add(1, Ordering::SeqCst);
        call();
    }

    fn register_dispatch(&self, hook: DispatchHook) {
        let _ = self.hook.set(hook);
    }

    fn defer(&self, cpu: usize) {
        self.defers.fetch_add(1, Ordering::SeqCst);
        match self.hook.get() {
            Some(hook) => hook.run(cpu),
            None => self.deferred[cpu].store(true, Ordering::SeqCst),
        }
    }
}

/// Build a leaked host/domain pair with the dispatch hook registered: the
/// standard fixture for integration tests.
pub fn harness(cpus: usize) -> (&'static SimHost, &'static Prcu) {
    let host = SimHost::leaked(cpus);
    let prcu: &'static Prcu = Box::leak(Box::new(Prcu::new(host)));
    prcu.register();
    (host, prcu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_threads_run_on_cpu_zero() {
        let host = SimHost::new(2);
        assert_eq!(host.pin(), 0);
        host.bind(1);
        assert_eq!(host.pin(), 1);
    }

    #[test]
    fn bindings_are_per_thread() {
        let host = SimHost::leaked(2);
        host.bind(1);
        let other = thread::spawn(move || host.pin()).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(host.pin(), 1);
    }

    #[test]
    fn defer_without_hook_is_recorded() {
        let host = SimHost::new(1);
        host.defer(0);
        assert_eq!(host.defers_raised(), 1);
        assert!(host.take_deferred(0));
        assert!(!host.take_deferred(0));
    }

    #[test]
    fn smp_call_runs_inline() {
        let host = SimHost::new(2);
        let hit = AtomicUsize::new(0);
        host.smp_call(1, &|| {
            hit.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(host.ipis_sent(), 1);
    }
}
