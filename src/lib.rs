//! Primitives for handing single values between independently scheduled
//! asynchronous computations, and for bounding an object's lifetime by the
//! release of every cross-thread reference to it.
//!
//! The crate is not an executor. It is the glue that sits on top of one:
//! anything that can *post a callback to run later* implements [Executor], and
//! every primitive here is built so that resuming a suspended computation goes
//! back through that executor instead of running on the stack of whoever
//! completed it.
//!
//! There are four pieces:
//!
//! - [`LifetimeGuard`](guard::LifetimeGuard) -- hands out
//!   [`Reference`](guard::Reference)s and blocks its own destruction until all
//!   of them are released.
//! - [`Sender`](channel::Sender) and [`Receiver`](channel::Receiver) -- a
//!   single-producer, single-consumer hand-off over a shared mailbox. Values
//!   sent while nobody waits are queued, first-in, first-out.
//! - [`TaskHandle`](task::TaskHandle) -- a suspended computation behind a mutex,
//!   either *detached* (keeps itself alive until finished) or *retained* (lives
//!   only as long as someone outside holds it). A finished task keeps the
//!   value its future produced.
//! - [`SingleShotResumer`](resumer::SingleShotResumer) -- a slot that wakes one
//!   suspended computation, exactly once, from any thread.
//!
//! All of them store their wake-ups as [`Continuation`](callable::Continuation)s:
//! move-only, type-erased callables.
//!
//! # Tasks and executors
//!
//! A [`TaskHandle`](task::TaskHandle) starts suspended. Resuming it polls the
//! wrapped future once; whenever the future is woken, the task posts another
//! resume through its executor.
//!
//! ```
//! use baton::{channel::channel, runtimes::event_loop::EventLoop, task::TaskHandle};
//!
//! let event_loop = EventLoop::new();
//! let (sender, mut receiver) = channel::<i64>();
//!
//! let task = TaskHandle::retained(event_loop.clone(), async move {
//!     assert_eq!(receiver.recv().await, Ok(7));
//! });
//! task.schedule();
//! event_loop.poll();
//! assert!(!task.is_done());
//!
//! assert!(sender.send(7));
//! event_loop.poll();
//! assert!(task.is_done());
//! ```
//!
//! # Failure as data
//!
//! Nothing here propagates panics across a suspension point; a panic escaping
//! a task aborts the process. Errors travel through channels as values, for
//! example a `Result<T, E>` payload that the receiving side checks on every
//! resume. The same mechanism expresses cancellation: the sender delivers a
//! sentinel instead of data.
//!
//! ```
//! use baton::channel::channel;
//! use futures::executor::block_on;
//!
//! #[derive(Debug, PartialEq)]
//! struct Interrupted;
//!
//! let (sender, mut receiver) = channel::<Result<i64, Interrupted>>();
//! sender.send(Ok(1));
//! sender.send(Err(Interrupted));
//!
//! block_on(async {
//!     assert_eq!(receiver.recv().await, Ok(Ok(1)));
//!     assert_eq!(receiver.recv().await, Ok(Err(Interrupted)));
//! });
//! ```

pub mod callable;
pub mod channel;
pub mod guard;
pub mod resumer;
pub mod runtimes;
pub mod task;

use std::sync::Arc;

/// A unit of work posted to an [Executor].
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// The only thing this crate needs from a runtime.
///
/// `post` must not run the callback on the caller's stack; it schedules it to
/// run later, on whichever thread the executor picks.
pub trait Executor: Send + Sync + 'static {
    fn post(&self, callback: Callback);

    /// Whether the executor has been told to stop. A stopped executor will
    /// never run another callback, so suspending on it is pointless.
    fn is_stopped(&self) -> bool {
        false
    }
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn post(&self, callback: Callback) {
        (**self).post(callback)
    }

    fn is_stopped(&self) -> bool {
        (**self).is_stopped()
    }
}
