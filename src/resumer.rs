//! One-shot resumption slots.
//!
//! A [`SingleShotResumer<T>`] holds at most one [`Continuation<T>`]. A
//! suspended computation registers itself (directly with
//! [`set`](SingleShotResumer::set), or by awaiting
//! [`suspend`](SingleShotResumer::suspend)), and exactly one call to
//! [`resume`](SingleShotResumer::resume), from any thread, wakes it with a
//! value.
//!
//! Registering twice or resuming an empty slot is a bug in the surrounding
//! protocol, and panics.
//!
//! ```
//! use baton::resumer::SingleShotResumer;
//! use futures::executor::block_on;
//! use std::{sync::Arc, thread};
//!
//! let resumer = Arc::new(SingleShotResumer::<u32>::new());
//! let waiting = resumer.suspend();
//!
//! let completer = {
//!     let resumer = resumer.clone();
//!     thread::spawn(move || resumer.resume(42))
//! };
//!
//! assert_eq!(block_on(waiting), Ok(42));
//! completer.join().unwrap();
//! ```

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use futures::{channel::oneshot, FutureExt};
use parking_lot::Mutex;
use thiserror::Error;

use crate::callable::Continuation;

pub struct SingleShotResumer<T> {
    slot: Arc<Slot<T>>,
}

/// Observes a [`SingleShotResumer`] without keeping it alive.
pub struct WeakResumer<T> {
    slot: Weak<Slot<T>>,
}

struct Slot<T> {
    continuation: Mutex<Option<Continuation<T>>>,
}

/// Future returned by [`SingleShotResumer::suspend`].
#[must_use = "futures do nothing unless polled"]
pub struct Resumption<T> {
    rx: oneshot::Receiver<T>,
}

/// The resumer was dropped, or its continuation discarded, before anyone
/// resumed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("resumer dropped before it was resumed")]
pub struct Abandoned;

impl<T: Send + 'static> SingleShotResumer<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                continuation: Mutex::new(None),
            }),
        }
    }

    /// Registers the continuation to run on [`resume`](Self::resume).
    ///
    /// # Panics
    ///
    /// If a continuation is already registered.
    pub fn set(&self, continuation: Continuation<T>) {
        let mut slot = self.slot.continuation.lock();
        assert!(slot.is_none(), "resumer already has a registered continuation");
        *slot = Some(continuation);
    }

    /// Registers the calling computation and returns a future that completes
    /// on [`resume`](Self::resume).
    ///
    /// # Panics
    ///
    /// If a continuation is already registered.
    pub fn suspend(&self) -> Resumption<T> {
        let (tx, rx) = oneshot::channel();
        self.set(Continuation::new(move |value| {
            let _ = tx.send(value);
        }));
        Resumption { rx }
    }

    pub fn is_set(&self) -> bool {
        self.slot.continuation.lock().is_some()
    }

    /// Wakes the registered computation with `value` and empties the slot.
    ///
    /// # Panics
    ///
    /// If nothing is registered, including when this resumer was already
    /// resumed.
    pub fn resume(&self, value: T) {
        self.try_resume(value)
            .ok()
            .expect("resumer has no registered continuation")
    }

    /// Like [`resume`](Self::resume), but hands `value` back if nothing is
    /// registered.
    pub fn try_resume(&self, value: T) -> Result<(), T> {
        self.slot.try_resume(value)
    }

    pub fn weak_reference(&self) -> WeakResumer<T> {
        WeakResumer {
            slot: Arc::downgrade(&self.slot),
        }
    }
}

impl<T: Send + 'static> Default for SingleShotResumer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SingleShotResumer<T> {
    fn drop(&mut self) {
        self.slot.continuation.lock().take();
    }
}

impl<T> Slot<T> {
    fn try_resume(&self, value: T) -> Result<(), T> {
        // Taken under the lock, called outside of it.
        let continuation = self.continuation.lock().take();
        match continuation {
            Some(continuation) => {
                continuation.call(value);
                Ok(())
            }
            None => Err(value),
        }
    }
}

impl<T> Clone for WeakResumer<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> WeakResumer<T> {
    /// Whether the resumer still exists and is waiting to be resumed.
    pub fn is_pending(&self) -> bool {
        self.slot
            .upgrade()
            .is_some_and(|slot| slot.continuation.lock().is_some())
    }

    /// Resumes if the resumer still exists and is pending. Returns whether it
    /// did.
    pub fn resume(&self, value: T) -> bool {
        match self.slot.upgrade() {
            Some(slot) => slot.try_resume(value).is_ok(),
            None => false,
        }
    }
}

impl<T> Future for Resumption<T> {
    type Output = Result<T, Abandoned>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map_err(|oneshot::Canceled| Abandoned)
    }
}
