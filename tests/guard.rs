mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use baton::{guard::LifetimeGuard, runtimes::event_loop::EventLoop, Executor};
use common::init_test_logging;

#[test]
fn teardown_waits_for_sleeping_holders() {
    init_test_logging();
    const HOLDERS: u64 = 6;
    let guard = LifetimeGuard::new(AtomicUsize::new(0));

    let start = Instant::now();
    let workers: Vec<_> = (1..=HOLDERS)
        .map(|i| {
            let reference = guard.make_reference();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(15 * i));
                reference.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    drop(guard);
    assert!(start.elapsed() >= Duration::from_millis(15 * HOLDERS));

    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn guarded_event_loop_outlives_its_runners() {
    init_test_logging();
    let guard = LifetimeGuard::new(EventLoop::new());
    let ran = Arc::new(AtomicUsize::new(0));

    let runners: Vec<_> = (0..3)
        .map(|_| {
            let event_loop = guard.make_reference();
            thread::spawn(move || {
                while event_loop.alive() {
                    event_loop.run_for(Duration::from_millis(5));
                }
                // Expired, but the loop itself is still valid.
                event_loop.poll();
            })
        })
        .collect();

    for _ in 0..50 {
        let ran = ran.clone();
        guard.post(Box::new(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }
    while guard.pending() > 0 {
        thread::yield_now();
    }

    drop(guard);
    assert_eq!(ran.load(Ordering::SeqCst), 50);
    for runner in runners {
        runner.join().unwrap();
    }
}

#[test]
fn holders_can_wait_for_expiry_instead_of_polling() {
    init_test_logging();
    let guard = LifetimeGuard::new(());
    let expired = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let reference = guard.make_reference();
            let expired = expired.clone();
            thread::spawn(move || {
                reference.wait_for_expiry();
                expired.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    assert_eq!(expired.load(Ordering::SeqCst), 0);
    assert_eq!(guard.references(), 4);

    drop(guard);
    assert_eq!(expired.load(Ordering::SeqCst), 4);
    for waiter in waiters {
        waiter.join().unwrap();
    }
}
