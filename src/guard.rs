//! Lifetime guards: owners whose destruction waits for their borrowers.
//!
//! A [`LifetimeGuard<T>`] owns a `T` and hands out [`Reference<T>`]s to it.
//! Dropping the guard announces the end of the object's life to every
//! reference, then blocks the dropping thread until the last reference has
//! been released. That pins the end of the object's life to the scope that
//! owns the guard: the scope cannot end while anyone still touches it, and
//! holders get an explicit "no longer alive" signal instead of extending the
//! object's life themselves.
//!
//! The object and the bookkeeping live in one shared heap allocation, which is
//! what lets references move to other threads; it costs the same as an `Arc`.
//! What the guard adds is the teardown rendezvous, not a cheaper allocation.
//! The object itself may be dropped on the thread of the last holder, just
//! after that holder releases its reference.
//!
//! References can only be made from the guard itself, never from another
//! reference, so once teardown has started the set of holders can only shrink.
//!
//! ```
//! use baton::guard::LifetimeGuard;
//! use std::thread;
//!
//! let guard = LifetimeGuard::new(String::from("shared"));
//! let reference = guard.make_reference();
//!
//! let worker = thread::spawn(move || {
//!     reference.wait_for_expiry();
//!     assert_eq!(reference.len(), 6);
//! });
//!
//! drop(guard); // returns only after `worker` has dropped its reference
//! worker.join().unwrap();
//! ```
//!
//! A reference that is never released keeps teardown blocked forever. Holders
//! must be able to let go in bounded time; the guard does not time out.

use std::{
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

pub struct LifetimeGuard<T> {
    shared: Arc<Shared<T>>,
}

/// A vote against the destruction of a guarded object.
///
/// Not clonable: every reference is accounted for by exactly one call to
/// [`LifetimeGuard::make_reference`].
#[must_use]
pub struct Reference<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    object: T,
    references: AtomicUsize,
    alive: AtomicBool,
    // Only the teardown drain and expiry waiters block on these.
    lock: Mutex<()>,
    changed: Condvar,
}

impl<T> LifetimeGuard<T> {
    pub fn new(object: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                object,
                references: AtomicUsize::new(0),
                alive: AtomicBool::new(true),
                lock: Mutex::new(()),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn make_reference(&self) -> Reference<T> {
        self.shared.references.fetch_add(1, Ordering::Relaxed);
        Reference {
            shared: self.shared.clone(),
        }
    }

    /// Number of references not yet released.
    pub fn references(&self) -> usize {
        self.shared.references.load(Ordering::Acquire)
    }

    pub fn get(&self) -> &T {
        &self.shared.object
    }
}

impl<T> Deref for LifetimeGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T> Drop for LifetimeGuard<T> {
    fn drop(&mut self) {
        let shared = &*self.shared;
        shared.alive.store(false, Ordering::Release);

        let mut lock = shared.lock.lock();
        shared.changed.notify_all();

        let outstanding = shared.references.load(Ordering::Acquire);
        if outstanding > 0 {
            debug!(outstanding, "lifetime guard waiting for references to drain");
        }
        while shared.references.load(Ordering::Acquire) > 0 {
            shared.changed.wait(&mut lock);
        }
        trace!("lifetime guard released");
    }
}

impl<T: fmt::Debug> fmt::Debug for LifetimeGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeGuard")
            .field("object", &self.shared.object)
            .field("references", &self.references())
            .finish()
    }
}

impl<T> Reference<T> {
    /// True until the guard starts tearing down.
    pub fn alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until the guard starts tearing down.
    pub fn wait_for_expiry(&self) {
        let mut lock = self.shared.lock.lock();
        while self.alive() {
            self.shared.changed.wait(&mut lock);
        }
    }

    /// Like [`wait_for_expiry`](Self::wait_for_expiry), giving up after
    /// `timeout`. Returns whether the guard has expired.
    pub fn wait_for_expiry_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lock = self.shared.lock.lock();
        while self.alive() {
            if self.shared.changed.wait_until(&mut lock, deadline).timed_out() {
                return !self.alive();
            }
        }
        true
    }

    /// The guarded object. Still valid after expiry: the guard waits for this
    /// reference before letting the object go.
    pub fn get(&self) -> &T {
        &self.shared.object
    }
}

impl<T> Deref for Reference<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T> Drop for Reference<T> {
    fn drop(&mut self) {
        if self.shared.references.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Taking the lock orders this wake-up after the drain's check.
            let _lock = self.shared.lock.lock();
            self.shared.changed.notify_all();
        }
    }
}

impl<T> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("alive", &self.alive())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn references_are_counted() {
        let guard = LifetimeGuard::new(5);
        assert_eq!(guard.references(), 0);

        let a = guard.make_reference();
        let b = guard.make_reference();
        assert_eq!(guard.references(), 2);
        assert_eq!(*a + *b, 10);

        drop(a);
        assert_eq!(guard.references(), 1);
        drop(b);
        assert_eq!(guard.references(), 0);
    }

    #[test]
    fn reference_survives_a_move() {
        let guard = LifetimeGuard::new(());
        let reference = guard.make_reference();
        let moved = Some(reference);
        assert_eq!(guard.references(), 1);
        drop(moved);
        assert_eq!(guard.references(), 0);
    }

    #[test]
    fn teardown_without_references_does_not_block() {
        let start = Instant::now();
        drop(LifetimeGuard::new(vec![1, 2, 3]));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn expiry_is_observed_by_waiters() {
        let guard = LifetimeGuard::new(());
        let reference = guard.make_reference();
        assert!(reference.alive());
        assert!(!reference.wait_for_expiry_timeout(Duration::from_millis(10)));

        let waiter = thread::spawn(move || {
            reference.wait_for_expiry();
            assert!(!reference.alive());
        });
        drop(guard);
        waiter.join().unwrap();
    }

    #[test]
    fn teardown_blocks_until_last_release() {
        const HOLDERS: usize = 4;
        let released = Arc::new(AtomicUsize::new(0));
        let guard = LifetimeGuard::new(());

        let workers: Vec<_> = (0..HOLDERS)
            .map(|i| {
                let reference = guard.make_reference();
                let released = released.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20 * (i as u64 + 1)));
                    released.fetch_add(1, Ordering::SeqCst);
                    drop(reference);
                })
            })
            .collect();

        drop(guard);
        assert_eq!(released.load(Ordering::SeqCst), HOLDERS);

        for worker in workers {
            worker.join().unwrap();
        }
    }
}
