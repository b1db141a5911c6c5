// Host kernel services consumed by PRCU.
//
// PRCU owns the grace-period protocol but not the machinery underneath it:
// processor enumeration, preemption and interrupt control, cross-processor
// calls and deferred-work scheduling all belong to the host kernel. This
// trait is that boundary. A bare-metal kernel implements it over its SMP
// layer; the `sim` module implements it over std threads for testing.

use crate::grace::DispatchHook;

/// Services PRCU requires from the host kernel.
///
/// Implementations must be usable from any processor concurrently. Per-CPU
/// contracts are noted on each method.
pub trait Host: Sync {
    /// Number of possible processors. Processor ids are `0..nr_cpus()` and
    /// stable for the lifetime of the system; a processor going offline
    /// keeps its id.
    fn nr_cpus(&self) -> usize;

    /// Disable preemption and return the id of the current processor.
    ///
    /// Until the matching [`unpin`](Host::unpin), the caller will not be
    /// migrated, so references into this processor's state stay valid.
    /// Pinning nests.
    fn pin(&self) -> usize;

    /// Re-enable preemption after [`pin`](Host::pin).
    fn unpin(&self);

    /// Disable interrupts on the current processor, returning whether they
    /// were previously enabled.
    fn push_off(&self) -> bool;

    /// Restore the interrupt state saved by [`push_off`](Host::push_off).
    fn pop_off(&self, was_enabled: bool);

    /// Whether `cpu` is currently online. Offline processors are skipped by
    /// the callback dispatcher; their per-CPU records persist.
    fn cpu_online(&self, cpu: usize) -> bool;

    /// Run `call` on processor `cpu` and return once it has completed.
    ///
    /// The callable is borrowed, so the host cannot queue it past the call;
    /// hosts that route through an IPI must wait for the handler to finish
    /// before returning.
    fn smp_call(&self, cpu: usize, call: &(dyn Fn() + Sync));

    /// Register the callback-dispatch hook, once, at init time.
    ///
    /// The host must arrange for `hook.run(cpu)` to execute soon after
    /// [`defer`](Host::defer) is raised for `cpu`, from a context that may
    /// take spinlocks and invoke callbacks (a softirq or worker, not the
    /// tick itself).
    fn register_dispatch(&self, hook: DispatchHook);

    /// Request deferred callback dispatch on `cpu`.
    ///
    /// Called from the tick path; must not block. The host services the
    /// request by running the hook passed to
    /// [`register_dispatch`](Host::register_dispatch).
    fn defer(&self, cpu: usize);
}
