//! Callback stamping, tick-driven dispatch, and the barrier.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use prcu::Prcu;
use prcu::sim::{SimHost, harness};

fn counting_callback(hits: &Arc<AtomicUsize>) -> prcu::Callback {
    let hits = Arc::clone(hits);
    Box::new(move || {
        hits.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn callbacks_wait_for_a_newer_callback_version() {
    let (host, prcu) = harness(1);
    host.bind(0);

    // One grace period: the local version is now 1 and so is the
    // published callback version.
    prcu.synchronize();

    let hits = Arc::new(AtomicUsize::new(0));
    prcu.call(counting_callback(&hits));
    prcu.call(counting_callback(&hits));

    // Stamped 1, published version 1: not ready (strict inequality).
    assert!(prcu.pending());
    prcu.check_callbacks();
    assert_eq!(host.defers_raised(), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // The dispatch round recorded how far it looked, so the tick stays
    // quiet until a writer moves the published version.
    assert!(!prcu.pending());
    prcu.check_callbacks();
    assert_eq!(host.defers_raised(), 1);

    prcu.synchronize();
    assert!(prcu.pending());
    prcu.check_callbacks();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(!prcu.pending());
}

#[test]
fn dispatch_skips_offline_processor() {
    let (host, prcu) = harness(1);
    host.bind(0);

    let hits = Arc::new(AtomicUsize::new(0));
    prcu.call(counting_callback(&hits));
    prcu.synchronize();

    host.set_online(0, false);
    prcu.process_callbacks();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    // The tick path also declines to kick an offline processor.
    prcu.check_callbacks();
    assert_eq!(host.defers_raised(), 0);

    host.set_online(0, true);
    prcu.process_callbacks();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn callback_may_requeue_from_dispatch() {
    let (host, prcu) = harness(1);
    host.bind(0);

    let hits = Arc::new(AtomicUsize::new(0));
    let inner_hits = Arc::clone(&hits);
    prcu.call(Box::new(move || {
        let hits = Arc::clone(&inner_hits);
        prcu.call(Box::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }));

    prcu.synchronize();
    prcu.process_callbacks();
    // The requeued callback is stamped with the current version and must
    // wait for the next grace period.
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    prcu.synchronize();
    prcu.process_callbacks();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn barrier_drains_every_processor() {
    let (host, prcu) = harness(2);
    host.bind(0);

    let hits = Arc::new(AtomicUsize::new(0));
    prcu.call(counting_callback(&hits));
    {
        let hits = Arc::clone(&hits);
        thread::spawn(move || {
            host.bind(1);
            prcu.call(counting_callback(&hits));
        })
        .join()
        .unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    prcu.barrier();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(!prcu.pending());
    // One sentinel cross-call per processor.
    assert!(host.ipis_sent() >= 2);
}

#[test]
fn barrier_makes_progress_without_a_writer() {
    let (host, prcu) = harness(2);
    host.bind(0);

    let hits = Arc::new(AtomicUsize::new(0));
    prcu.call(counting_callback(&hits));

    // Nobody calls synchronize(); the barrier must advance the callback
    // version itself rather than hang.
    prcu.barrier();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(prcu.gp_version() >= 1);
}

#[test]
fn barrier_skips_offline_processor() {
    let (host, prcu) = harness(2);
    host.bind(0);
    host.set_online(1, false);

    let hits = Arc::new(AtomicUsize::new(0));
    prcu.call(counting_callback(&hits));

    prcu.barrier();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn barrier_with_nothing_pending_returns() {
    let (host, prcu) = harness(2);
    host.bind(0);
    prcu.barrier();
    prcu.barrier();
    assert!(!prcu.pending());
}

#[test]
fn callbacks_fire_in_enqueue_order() {
    let (host, prcu) = harness(1);
    host.bind(0);

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    for tag in 0..3u32 {
        let order = Arc::clone(&order);
        prcu.call(Box::new(move || {
            order.lock().unwrap().push(tag);
        }));
    }

    prcu.synchronize();
    prcu.process_callbacks();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn cell_reclaims_through_the_dispatcher() {
    struct Node {
        value: u64,
        drops: Arc<AtomicUsize>,
    }
    impl Drop for Node {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (host, prcu) = harness(1);
    host.bind(0);
    let drops = Arc::new(AtomicUsize::new(0));

    let cell = prcu::PrcuCell::new(
        prcu,
        Node {
            value: 1,
            drops: Arc::clone(&drops),
        },
    );
    cell.update(|old| Node {
        value: old.value + 1,
        drops: Arc::clone(&drops),
    });
    assert_eq!(cell.read().value, 2);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    // A grace period plus a tick reclaims the displaced node.
    prcu.synchronize();
    prcu.check_callbacks();
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    drop(cell);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

#[test]
fn instances_are_independent() {
    let (host_a, a) = harness(1);
    let (host_b, b) = harness(1);
    host_a.bind(0);
    host_b.bind(0);

    a.synchronize();
    a.synchronize();
    b.synchronize();

    assert_eq!(a.gp_version(), 2);
    assert_eq!(b.gp_version(), 1);
}

#[test]
fn manual_dispatch_without_registered_hook() {
    // A host that never registers the hook records the kick and the
    // owning processor drives dispatch itself.
    let host = SimHost::leaked(1);
    let prcu: &'static Prcu = Box::leak(Box::new(Prcu::new(host)));

    let hits = Arc::new(AtomicUsize::new(0));
    prcu.call(counting_callback(&hits));
    prcu.synchronize();

    prcu.check_callbacks();
    assert!(host.take_deferred(0));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    prcu.process_callbacks();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
