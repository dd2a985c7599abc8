//! A plain queue of posted callbacks, run by whichever threads call into it.
//!
//! [`EventLoop`] does nothing on its own. Callbacks posted to it are run by
//! [`poll`](EventLoop::poll) and friends, on the calling thread; several
//! threads may run the same loop at once. That makes scheduling explicit,
//! which is mostly useful in tests.
//!
//! ```
//! use baton::{runtimes::event_loop::EventLoop, Executor};
//! use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
//!
//! let event_loop = EventLoop::new();
//! let hits = Arc::new(AtomicUsize::new(0));
//! for _ in 0..3 {
//!     let hits = hits.clone();
//!     event_loop.post(Box::new(move || {
//!         hits.fetch_add(1, Ordering::SeqCst);
//!     }));
//! }
//! assert_eq!(hits.load(Ordering::SeqCst), 0);
//! assert_eq!(event_loop.poll(), 3);
//! assert_eq!(hits.load(Ordering::SeqCst), 3);
//! ```

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::{Callback, Executor};

/// Cheap to clone; clones share the same queue.
#[derive(Clone, Default)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Callback>>,
    posted: Condvar,
    stopped: AtomicBool,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs ready callbacks, including ones they post, until the queue is
    /// empty or the loop is stopped. Never blocks. Returns how many ran.
    pub fn poll(&self) -> usize {
        let mut ran = 0;
        while self.poll_one() {
            ran += 1;
        }
        ran
    }

    /// Runs at most one ready callback.
    pub fn poll_one(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let callback = self.shared.queue.lock().pop_front();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Runs callbacks as they are posted, until `duration` has passed or the
    /// loop is stopped. Returns how many ran.
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut ran = 0;
        loop {
            if self.is_stopped() {
                break;
            }
            let mut queue = self.shared.queue.lock();
            let Some(callback) = queue.pop_front() else {
                if self.shared.posted.wait_until(&mut queue, deadline).timed_out() {
                    break;
                }
                continue;
            };
            drop(queue);
            callback();
            ran += 1;
        }
        trace!(ran, "event loop run finished");
        ran
    }

    /// Makes every running and future `poll`/`run_for` return. Callbacks
    /// already queued stay queued; callbacks posted from now on are dropped.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let _queue = self.shared.queue.lock();
        self.shared.posted.notify_all();
    }

    /// Undoes [`stop`](Self::stop).
    pub fn restart(&self) {
        self.shared.stopped.store(false, Ordering::Release);
    }

    /// Number of queued callbacks.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Executor for EventLoop {
    fn post(&self, callback: Callback) {
        if self.is_stopped() {
            trace!("event loop stopped, dropping callback");
            return;
        }
        self.shared.queue.lock().push_back(callback);
        self.shared.posted.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
