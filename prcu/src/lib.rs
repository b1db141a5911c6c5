//! # PRCU - Percpu Read-Copy Update
//!
//! A read-mostly synchronization primitive with an RCU-style grace-period
//! contract: a writer can wait until every reader that began its critical
//! section before a chosen instant has finished, and can defer cleanup
//! callbacks until that condition holds. The protocol reaches consensus by
//! piggybacking on context switches, so readers stay essentially free while
//! writer latency stays bounded.
//!
//! Readers bracket their critical sections with [`Prcu::read_lock`] /
//! [`Prcu::read_unlock`] (or the [`Prcu::read`] guard), touching only their
//! own processor's state. Writers call [`Prcu::synchronize`] to wait out a
//! grace period, or [`Prcu::call`] to defer work past one;
//! [`Prcu::barrier`] drains every outstanding callback. The host kernel
//! supplies processor control through the [`Host`] trait and feeds the
//! protocol from its scheduler ([`Prcu::note_context_switch`]) and tick
//! ([`Prcu::check_callbacks`]).
//!
//! # Usage
//!
//! ```rust
//! use prcu::sim::harness;
//!
//! let (host, prcu) = harness(2);
//! host.bind(0);
//!
//! prcu.read_lock();
//! // ... read shared data ...
//! prcu.read_unlock();
//!
//! prcu.synchronize(); // every reader that started earlier has finished
//! assert!(prcu.cb_version() <= prcu.gp_version());
//! ```
//!
//! Kernel builds disable the default `std` feature and implement [`Host`]
//! over their SMP layer; everything else is `no_std + alloc`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod cblist;
mod cell;
mod grace;
mod host;
mod percpu;
#[cfg(feature = "std")]
pub mod sim;
mod sync;

pub use cblist::Callback;
pub use cell::{CellReadGuard, PrcuCell};
pub use grace::{DispatchHook, Prcu, ReadGuard};
pub use host::Host;

use spin::Once;

// ============================================================================
// Process-global instance
// ============================================================================

static PRCU: Once<Prcu> = Once::new();

/// Initialize the process-global PRCU domain. Called once at system start;
/// later calls are no-ops.
pub fn init(host: &'static dyn Host) {
    let prcu = PRCU.call_once(|| Prcu::new(host));
    prcu.register();
}

fn global() -> &'static Prcu {
    PRCU.get()
        .expect("prcu::init() must be called before using the global instance")
}

/// [`Prcu::read_lock`] on the global instance.
pub fn read_lock() {
    global().read_lock()
}

/// [`Prcu::read_unlock`] on the global instance.
pub fn read_unlock() {
    global().read_unlock()
}

/// [`Prcu::read`] on the global instance.
pub fn read() -> ReadGuard<'static> {
    global().read()
}

/// [`Prcu::synchronize`] on the global instance.
pub fn synchronize() {
    global().synchronize()
}

/// [`Prcu::call`] on the global instance.
pub fn call(func: Callback) {
    global().call(func)
}

/// [`Prcu::barrier`] on the global instance.
pub fn barrier() {
    global().barrier()
}

/// [`Prcu::note_context_switch`] on the global instance.
pub fn note_context_switch() {
    global().note_context_switch()
}

/// [`Prcu::check_callbacks`] on the global instance.
pub fn check_callbacks() {
    global().check_callbacks()
}

/// [`Prcu::process_callbacks`] on the global instance.
pub fn process_callbacks() {
    global().process_callbacks()
}

/// Current global grace-period version, for diagnostics.
pub fn gp_version() -> u64 {
    global().gp_version()
}

/// Current published callback version, for diagnostics.
pub fn cb_version() -> u64 {
    global().cb_version()
}
