// Grace-period engine, reader fast path, callback dispatch and barrier.
//
// PRCU's consensus protocol: readers bump a per-processor nesting count and
// mark their processor online; writers allocate a new global grace-period
// version, walk every processor to force it through a quiescent state, wait
// for readers that were migrated off their processor mid-critical-section,
// then publish the callback version that makes older callbacks eligible for
// dispatch. Context switches convert in-flight local reader counts into a
// global counter so a migrated reader can still be waited for.

use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering, compiler_fence, fence};
use spin::Mutex;

use crate::cblist::{Callback, CallbackKind};
use crate::host::Host;
use crate::percpu::{CachePadded, PrcuLocal};
use crate::sync::{Completion, WaitQueue};

/// A PRCU domain: the global grace-period state plus one record per
/// possible processor.
///
/// Most systems use the process-global instance behind [`crate::init`]; the
/// struct form exists so tests and embedded hosts can run isolated domains.
pub struct Prcu {
    host: &'static dyn Host,
    /// Global grace-period version. Bumped once per writer.
    global_version: AtomicU64,
    /// Callback-readiness version. Trails `global_version`; a callback
    /// stamped `v` may be invoked once this exceeds `v`.
    cb_version: AtomicU64,
    /// Reader depths migrated off their processor by a context switch.
    active_ctr: AtomicI64,
    /// Serializes writers from the scan onwards.
    writer_mtx: Mutex<()>,
    /// Serializes barrier operations.
    barrier_mtx: Mutex<()>,
    /// Sentinel callbacks still outstanding for the current barrier.
    barrier_cpu_count: AtomicUsize,
    /// Writers wait here for `active_ctr` to drain.
    wait_q: WaitQueue,
    barrier_completion: Completion,
    locals: Vec<CachePadded<PrcuLocal>>,
}

impl Prcu {
    /// Build a PRCU domain for every possible processor of `host`.
    pub fn new(host: &'static dyn Host) -> Self {
        let cpus = host.nr_cpus();
        let mut locals = Vec::with_capacity(cpus);
        for _ in 0..cpus {
            locals.push(CachePadded(PrcuLocal::new()));
        }
        log::info!("prcu: initialized for {cpus} processors");
        Self {
            host,
            global_version: AtomicU64::new(0),
            cb_version: AtomicU64::new(0),
            active_ctr: AtomicI64::new(0),
            writer_mtx: Mutex::new(()),
            barrier_mtx: Mutex::new(()),
            barrier_cpu_count: AtomicUsize::new(0),
            wait_q: WaitQueue::new(),
            barrier_completion: Completion::new(),
            locals,
        }
    }

    /// Hand the host the deferred-dispatch hook. Call once after the domain
    /// reaches its final address.
    pub fn register(&'static self) {
        self.host.register_dispatch(DispatchHook { prcu: self });
    }

    fn local(&self, cpu: usize) -> &PrcuLocal {
        &self.locals[cpu].0
    }

    // ------------------------------------------------------------------
    // Reader fast path
    // ------------------------------------------------------------------

    /// Mark the beginning of a read-side critical section.
    ///
    /// Never blocks and takes no global atomic on the common path; safe
    /// from interrupt context. Critical sections nest.
    pub fn read_lock(&self) {
        let cpu = self.host.pin();
        let local = self.local(cpu);
        if !local.online.load(Ordering::SeqCst) {
            local.online.store(true, Ordering::SeqCst);
            // Pairs with the global-version bump in synchronize(): the
            // writer's scan sees this processor online, or this reader
            // sees the new version when it reports.
            fence(Ordering::SeqCst);
        }
        local.locked.fetch_add(1, Ordering::SeqCst);
        self.host.unpin();
    }

    /// Mark the end of a read-side critical section.
    ///
    /// The outermost unlock on the home processor publishes a quiescent
    /// state; an unlock after a migration retires the global active count
    /// instead and wakes any waiting writer.
    pub fn read_unlock(&self) {
        // Keep the critical section above the exit protocol.
        compiler_fence(Ordering::SeqCst);
        let cpu = self.host.pin();
        let local = self.local(cpu);
        let locked = local.locked.load(Ordering::SeqCst);
        if locked > 0 {
            local.locked.store(locked - 1, Ordering::SeqCst);
            if locked == 1 {
                self.report(local);
            }
            self.host.unpin();
        } else {
            // Our count was moved into active_ctr by a context switch.
            self.host.unpin();
            let prev = self.active_ctr.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(prev > 0, "read_unlock without matching read_lock");
            if prev <= 0 {
                log::error!("prcu: active reader counter underflow");
            } else if prev == 1 {
                self.wait_q.wake_all();
            }
        }
    }

    /// Enter a read-side critical section for the lifetime of the guard.
    pub fn read(&self) -> ReadGuard<'_> {
        self.read_lock();
        ReadGuard {
            prcu: self,
            _not_send: PhantomData,
        }
    }

    /// Advance `local`'s acknowledged version to the current global one.
    /// Racing advancers are harmless; the version only grows.
    fn report(&self, local: &PrcuLocal) {
        let global = self.global_version.load(Ordering::SeqCst);
        if global > local.version.load(Ordering::SeqCst) {
            local.version.fetch_max(global, Ordering::SeqCst);
        }
    }

    // ------------------------------------------------------------------
    // Grace-period engine
    // ------------------------------------------------------------------

    /// Wait until every reader that entered its critical section before
    /// this call has finished, then publish the callback version.
    ///
    /// Blocks; must not be called from interrupt context, with interrupts
    /// disabled, or from within a read-side critical section.
    pub fn synchronize(&self) {
        // Take the new version before the mutex so concurrent writers get
        // distinct versions and their scans overlap.
        let version = self.global_version.fetch_add(1, Ordering::SeqCst) + 1;
        let _writer = self.writer_mtx.lock();
        log::trace!("prcu: grace period {version} begin");

        let cpu = self.host.pin();
        self.local(cpu).version.fetch_max(version, Ordering::SeqCst);
        self.host.unpin();

        // Cross-call straggling processors so they refresh their
        // acknowledged version.
        let mut polled: Vec<usize> = Vec::new();
        for target in 0..self.locals.len() {
            let local = self.local(target);
            // A processor that has context-switched (or never ran a
            // reader) has already quiesced; anything it owed us is in
            // active_ctr.
            if !local.online.load(Ordering::SeqCst) {
                continue;
            }
            if local.version.load(Ordering::SeqCst) < version {
                let call = move || self.poll_handler(target);
                self.host.smp_call(target, &call);
                polled.push(target);
            }
        }

        // Wait for polled processors to commit. A spin, not a sleep: the
        // remote side is either the cheap handler store or a reader about
        // to report on unlock.
        for target in polled {
            let local = self.local(target);
            while local.version.load(Ordering::Acquire) < version {
                core::hint::spin_loop();
            }
        }

        // Wait for migrated readers to finish.
        if self.active_ctr.load(Ordering::SeqCst) > 0 {
            self.wait_q
                .wait_until(|| self.active_ctr.load(Ordering::SeqCst) == 0);
        }

        // Publish: callbacks stamped below `version` are now invocable.
        // fetch_max keeps the published version monotonic even if writers
        // reach this point out of version order.
        self.cb_version.fetch_max(version, Ordering::SeqCst);
        log::trace!("prcu: grace period {version} end");
    }

    /// Runs on the target processor. Reads and writes only that
    /// processor's own record; the `locked` check is only meaningful
    /// there.
    fn poll_handler(&self, cpu: usize) {
        let local = self.local(cpu);
        // If a reader is running here its unlock will report instead.
        if local.locked.load(Ordering::SeqCst) == 0 {
            local
                .version
                .fetch_max(self.global_version.load(Ordering::SeqCst), Ordering::SeqCst);
        }
    }

    /// Called by the host scheduler just before the current task leaves
    /// this processor.
    ///
    /// Any in-flight reader depth moves into the global active counter so
    /// writers can still observe its completion, and the processor drops
    /// offline so the scan need not cross-call it.
    pub fn note_context_switch(&self) {
        let cpu = self.host.pin();
        let local = self.local(cpu);
        let locked = local.locked.load(Ordering::SeqCst);
        if locked > 0 {
            self.active_ctr.fetch_add(i64::from(locked), Ordering::SeqCst);
            local.locked.store(0, Ordering::SeqCst);
        }
        local.online.store(false, Ordering::SeqCst);
        self.report(local);
        self.host.unpin();
    }

    // ------------------------------------------------------------------
    // Callback enqueue and dispatch
    // ------------------------------------------------------------------

    /// Queue `func` on the current processor for invocation after a grace
    /// period. Safe from interrupt context; never blocks.
    pub fn call(&self, func: Callback) {
        let cpu = self.host.pin();
        self.enqueue_on(cpu, CallbackKind::Func(func));
        self.host.unpin();
    }

    /// Stamp the entry with `cpu`'s local version and append it to `cpu`'s
    /// list. The stamp never exceeds the global version, so the next
    /// completed grace period makes the entry eligible.
    fn enqueue_on(&self, cpu: usize, kind: CallbackKind) {
        let local = self.local(cpu);
        let irq = self.host.push_off();
        let version = local.version.load(Ordering::SeqCst);
        let mut list = local.cblist.lock();
        list.enqueue(kind, version);
        local.cb_len.store(list.len(), Ordering::SeqCst);
        drop(list);
        self.host.pop_off(irq);
    }

    /// Whether the current processor has callbacks ready to dispatch.
    pub fn pending(&self) -> bool {
        let cpu = self.host.pin();
        let ready = self.pending_on(cpu);
        self.host.unpin();
        ready
    }

    fn pending_on(&self, cpu: usize) -> bool {
        let local = self.local(cpu);
        local.cb_version.load(Ordering::SeqCst) < self.cb_version.load(Ordering::SeqCst)
            && local.cb_len.load(Ordering::SeqCst) != 0
    }

    /// Tick entry: if this processor has ready callbacks, ask the host to
    /// run deferred dispatch here. Called from the periodic tick; never
    /// blocks.
    pub fn check_callbacks(&self) {
        let cpu = self.host.pin();
        if self.pending_on(cpu) && self.host.cpu_online(cpu) {
            self.host.defer(cpu);
        }
        self.host.unpin();
    }

    /// Deferred-dispatch entry for hosts that drive dispatch themselves
    /// instead of going through [`Host::register_dispatch`].
    pub fn process_callbacks(&self) {
        let cpu = self.host.pin();
        self.do_process(cpu);
        self.host.unpin();
    }

    /// Dispatch every callback on `cpu` whose stamp is older than the
    /// published callback version at entry. Snapshotting before the drain
    /// bounds the work to the callbacks observable at the start.
    fn do_process(&self, cpu: usize) {
        if !self.host.cpu_online(cpu) {
            return;
        }
        let cb_version = self.cb_version.load(Ordering::SeqCst);
        let local = self.local(cpu);

        let irq = self.host.push_off();
        let mut list = local.cblist.lock();
        let mut ready: Vec<CallbackKind> = Vec::new();
        loop {
            match list.first_version() {
                Some(stamp) if stamp < cb_version => {
                    if let Some((kind, _)) = list.dequeue() {
                        ready.push(kind);
                    }
                }
                _ => break,
            }
        }
        local.cb_len.store(list.len(), Ordering::SeqCst);
        // Record how far this processor has dispatched. fetch_max because
        // dispatch rounds with different snapshots may race.
        local.cb_version.fetch_max(cb_version, Ordering::SeqCst);
        drop(list);
        self.host.pop_off(irq);

        // Invoke outside the list lock so a callback may re-enter call().
        for kind in ready {
            match kind {
                CallbackKind::Func(func) => func(),
                CallbackKind::Barrier => self.barrier_callback(),
            }
        }
    }

    // ------------------------------------------------------------------
    // Barrier
    // ------------------------------------------------------------------

    /// Wait for every previously queued callback, on every processor, to
    /// have been invoked.
    ///
    /// Blocks; same context rules as [`synchronize`](Prcu::synchronize).
    pub fn barrier(&self) {
        let _barrier = self.barrier_mtx.lock();

        // Count from one so a sentinel firing early cannot complete the
        // barrier before every processor is registered.
        self.barrier_completion.reinit();
        self.barrier_cpu_count.store(1, Ordering::SeqCst);

        // Register a sentinel behind each online processor's pending
        // callbacks. The cross-call completes before returning, so every
        // increment happens before the initial count is removed below.
        // Offline processors get no sentinel; their dispatcher would never
        // run it.
        for cpu in 0..self.locals.len() {
            if !self.host.cpu_online(cpu) {
                continue;
            }
            let call = move || self.barrier_func(cpu);
            self.host.smp_call(cpu, &call);
        }

        if self.barrier_cpu_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.barrier_completion.complete();
        }

        if !self.barrier_completion.is_complete() {
            // Drive the sentinels home ourselves: advance the callback
            // version past every stamp taken above, then kick dispatch
            // wherever ready callbacks remain. The barrier must not depend
            // on an unrelated writer making progress.
            self.synchronize();
            for cpu in 0..self.locals.len() {
                if self.pending_on(cpu) {
                    self.host.defer(cpu);
                }
            }
        }

        self.barrier_completion.wait();
    }

    /// Cross-called on each processor by `barrier`.
    fn barrier_func(&self, cpu: usize) {
        self.barrier_cpu_count.fetch_add(1, Ordering::SeqCst);
        self.enqueue_on(cpu, CallbackKind::Barrier);
    }

    /// Sentinel dispatch: the last one completes the barrier.
    fn barrier_callback(&self) {
        if self.barrier_cpu_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.barrier_completion.complete();
        }
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Current global grace-period version.
    pub fn gp_version(&self) -> u64 {
        self.global_version.load(Ordering::SeqCst)
    }

    /// Published callback-readiness version. Never exceeds
    /// [`gp_version`](Prcu::gp_version).
    pub fn cb_version(&self) -> u64 {
        self.cb_version.load(Ordering::SeqCst)
    }

    /// Readers currently migrated off their processor.
    pub fn active_readers(&self) -> i64 {
        self.active_ctr.load(Ordering::SeqCst)
    }
}

/// RAII bracket for a read-side critical section.
///
/// Not `Send`: the section must end from the task context that opened it
/// (the context-switch hook, not a guard move, is how sections cross
/// processors).
pub struct ReadGuard<'a> {
    prcu: &'a Prcu,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.prcu.read_unlock();
    }
}

/// Deferred-dispatch hook handed to [`Host::register_dispatch`] at init.
///
/// The host invokes [`run`](DispatchHook::run) from its deferred-work
/// context to service a [`Host::defer`] request.
#[derive(Clone, Copy)]
pub struct DispatchHook {
    prcu: &'static Prcu,
}

impl DispatchHook {
    /// Dispatch ready callbacks on `cpu`.
    pub fn run(&self, cpu: usize) {
        self.prcu.do_process(cpu);
    }
}
