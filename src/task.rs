//! Shared cooperative tasks.
//!
//! A [`TaskHandle`] wraps a suspended computation, a boxed `Future`, behind a
//! mutex. Resuming the task polls the future once. Only one thread polls at a
//! time; a resume that arrives while another is running either waits for it
//! ([`resume`](TaskHandle::resume)) or gives up ([`try_resume`](TaskHandle::try_resume)).
//! Resuming a finished task does nothing and reports `false`.
//!
//! Tasks start suspended. When the future is woken, the task posts a resume
//! through its [Executor], so the future never runs on the stack of whoever
//! woke it.
//!
//! # Ownership
//!
//! The ownership mode is picked at creation:
//!
//! - [`TaskHandle::detached`] tasks own themselves. They stay alive until the
//!   future completes, whether or not anyone keeps a handle.
//! - [`TaskHandle::retained`] tasks live only as long as some [`TaskHandle`]
//!   exists. The task itself keeps only a weak reference to itself, so once the
//!   last handle is dropped the future is dropped with it, and pending wake-ups
//!   resume nothing.
//!
//! ```
//! use baton::{resumer::SingleShotResumer, runtimes::event_loop::EventLoop, task::TaskHandle};
//! use std::sync::Arc;
//!
//! let event_loop = EventLoop::new();
//! let resumer = Arc::new(SingleShotResumer::<&str>::new());
//!
//! let task = {
//!     let resumer = resumer.clone();
//!     TaskHandle::detached(event_loop.clone(), async move {
//!         assert_eq!(resumer.suspend().await, Ok("go"));
//!     })
//! };
//! let observer = task.downgrade();
//! drop(task);
//!
//! assert!(observer.resume());
//! resumer.resume("go");
//! event_loop.poll();
//! assert!(observer.upgrade().is_none());
//! ```
//!
//! # Results and self-references
//!
//! A task's future may produce a value. Once the task has finished, the value
//! is kept in the task and can be read through any handle with
//! [`result`](TaskHandle::result) or moved out with
//! [`take_result`](TaskHandle::take_result).
//!
//! A future that needs to reach its own task, for example to schedule itself
//! or to hand a [`WeakTaskHandle`] to someone who will resume it, is built with
//! [`TaskHandle::detached_cyclic`] or [`TaskHandle::retained_cyclic`]. The
//! handle it receives is weak; upgrading it only while polling keeps a
//! retained task from owning itself.
//!
//! ```
//! use baton::{runtimes::event_loop::EventLoop, task::TaskHandle};
//!
//! let event_loop = EventLoop::new();
//! let task = TaskHandle::retained_cyclic(event_loop.clone(), |this| async move {
//!     this.upgrade().map(|task| task.id())
//! });
//! task.schedule();
//! event_loop.poll();
//! assert_eq!(task.take_result(), Some(Some(task.id())));
//! assert_eq!(task.take_result(), None);
//! ```
//!
//! # Panics
//!
//! A panic escaping the future is not propagated to whoever resumed the task.
//! It is logged and the process is aborted.

use std::{
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    process,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
};

use futures::task::{waker, ArcWake};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::Executor;

type BoxTask<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Detached,
    Retained,
}

/// A strong reference to a task producing `T`. Clones share the same task.
pub struct TaskHandle<T = ()> {
    task: Arc<Task<T>>,
}

/// A reference to a task that does not keep it alive.
pub struct WeakTaskHandle<T = ()> {
    task: Weak<Task<T>>,
}

struct Task<T> {
    id: u64,
    ownership: Ownership,
    executor: Arc<dyn Executor>,
    stage: Mutex<Stage<T>>,
    /// Back-reference handed to wakers.
    this: Weak<Task<T>>,
    /// Strong self-reference of a detached task, released on completion.
    anchor: Mutex<Option<Arc<Task<T>>>>,
}

enum Stage<T> {
    Running(BoxTask<T>),
    /// `None` once the result has been taken.
    Finished(Option<T>),
}

struct TaskWaker<T> {
    task: Weak<Task<T>>,
    executor: Arc<dyn Executor>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// A task that keeps itself alive until `future` completes.
    pub fn detached<E, F>(executor: E, future: F) -> Self
    where
        E: Executor,
        F: Future<Output = T> + Send + 'static,
    {
        Self::new(Ownership::Detached, Arc::new(executor), |_| Box::pin(future))
    }

    /// A task that lives only as long as its handles.
    pub fn retained<E, F>(executor: E, future: F) -> Self
    where
        E: Executor,
        F: Future<Output = T> + Send + 'static,
    {
        Self::new(Ownership::Retained, Arc::new(executor), |_| Box::pin(future))
    }

    /// Like [`detached`](Self::detached), with the future built from a weak
    /// handle to its own task. The handle cannot be upgraded until `make`
    /// has returned.
    pub fn detached_cyclic<E, F, Fut>(executor: E, make: F) -> Self
    where
        E: Executor,
        F: FnOnce(WeakTaskHandle<T>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::new(Ownership::Detached, Arc::new(executor), |this| {
            Box::pin(make(this))
        })
    }

    /// Like [`retained`](Self::retained), with the future built from a weak
    /// handle to its own task.
    pub fn retained_cyclic<E, F, Fut>(executor: E, make: F) -> Self
    where
        E: Executor,
        F: FnOnce(WeakTaskHandle<T>) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::new(Ownership::Retained, Arc::new(executor), |this| {
            Box::pin(make(this))
        })
    }

    fn new(
        ownership: Ownership,
        executor: Arc<dyn Executor>,
        make: impl FnOnce(WeakTaskHandle<T>) -> BoxTask<T>,
    ) -> Self {
        let task = Arc::new_cyclic(|this: &Weak<Task<T>>| Task {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            ownership,
            executor,
            stage: Mutex::new(Stage::Running(make(WeakTaskHandle { task: this.clone() }))),
            this: this.clone(),
            anchor: Mutex::new(None),
        });
        if ownership == Ownership::Detached {
            *task.anchor.lock() = Some(task.clone());
        }
        debug!(task = task.id, ?ownership, "task created");
        Self { task }
    }

    /// Polls the task once, waiting for any resume already in progress on
    /// another thread. Returns `false` if the task has finished.
    pub fn resume(&self) -> bool {
        let mut stage = self.task.stage.lock();
        let (resumed, finished) = self.task.poll(&mut stage);
        drop(stage);
        drop(finished);
        resumed
    }

    /// Polls the task once unless another thread is already doing so. Returns
    /// `false` if the task was busy or has finished.
    pub fn try_resume(&self) -> bool {
        let Some(mut stage) = self.task.stage.try_lock() else {
            trace!(task = self.task.id, "task busy, skipping resume");
            return false;
        };
        let (resumed, finished) = self.task.poll(&mut stage);
        drop(stage);
        drop(finished);
        resumed
    }

    /// Must not be called from inside the task's own future.
    pub fn is_done(&self) -> bool {
        matches!(*self.task.stage.lock(), Stage::Finished(_))
    }

    /// Moves the value out of a finished task. `None` while the task is
    /// running, and after the value has been taken once.
    pub fn take_result(&self) -> Option<T> {
        match &mut *self.task.stage.lock() {
            Stage::Finished(result) => result.take(),
            Stage::Running(_) => None,
        }
    }

    /// A copy of the value of a finished task, leaving it in place.
    pub fn result(&self) -> Option<T>
    where
        T: Clone,
    {
        match &*self.task.stage.lock() {
            Stage::Finished(result) => result.clone(),
            Stage::Running(_) => None,
        }
    }

    /// Posts a resume of this task to its executor.
    pub fn schedule(&self) {
        self.task.schedule();
    }

    pub fn downgrade(&self) -> WeakTaskHandle<T> {
        WeakTaskHandle {
            task: Arc::downgrade(&self.task),
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.task.ownership
    }

    pub fn id(&self) -> u64 {
        self.task.id
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.task.id)
            .field("ownership", &self.task.ownership)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> WeakTaskHandle<T> {
    pub fn upgrade(&self) -> Option<TaskHandle<T>> {
        self.task.upgrade().map(|task| TaskHandle { task })
    }

    /// Resumes the task if it still exists. See [`TaskHandle::resume`].
    pub fn resume(&self) -> bool {
        self.upgrade().is_some_and(|task| task.resume())
    }

    /// See [`TaskHandle::try_resume`].
    pub fn try_resume(&self) -> bool {
        self.upgrade().is_some_and(|task| task.try_resume())
    }
}

impl<T> Clone for WeakTaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
        }
    }
}

impl<T> fmt::Debug for WeakTaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTaskHandle").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Task<T> {
    /// Polls with the stage mutex held. Returns whether the future was
    /// polled, and the released self-reference if it just finished; the caller
    /// drops that after unlocking.
    fn poll(&self, stage: &mut Stage<T>) -> (bool, Option<Arc<Task<T>>>) {
        let Stage::Running(future) = stage else {
            return (false, None);
        };

        let waker = waker(Arc::new(TaskWaker {
            task: self.this.clone(),
            executor: self.executor.clone(),
        }));
        let mut cx = Context::from_waker(&waker);

        trace!(task = self.id, "resuming task");
        let poll = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        match poll {
            Ok(Poll::Pending) => (true, None),
            Ok(Poll::Ready(value)) => {
                *stage = Stage::Finished(Some(value));
                debug!(task = self.id, "task finished");
                (true, self.anchor.lock().take())
            }
            Err(_) => {
                error!(task = self.id, "task panicked, aborting");
                process::abort();
            }
        }
    }

    fn schedule(&self) {
        post_resume(&*self.executor, self.this.clone());
    }
}

fn post_resume<T: Send + 'static>(executor: &dyn Executor, task: Weak<Task<T>>) {
    // Wakers fire while a dropped task tears down its future.
    if task.strong_count() == 0 {
        trace!("task gone, dropping resume");
        return;
    }
    if executor.is_stopped() {
        trace!("executor stopped, dropping resume");
        return;
    }
    executor.post(Box::new(move || {
        if let Some(task) = task.upgrade() {
            TaskHandle { task }.resume();
        }
    }));
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Stage::Running(_) = self.stage.get_mut() {
            debug!(task = self.id, "task dropped before completion");
        } else {
            trace!(task = self.id, "task dropped");
        }
    }
}

impl<T: Send + 'static> ArcWake for TaskWaker<T> {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        post_resume(&*arc_self.executor, arc_self.task.clone());
    }
}

/// Suspends the current computation once and has `executor` wake it again.
///
/// Completes immediately, without suspending, if the executor is stopped.
pub fn reschedule<E: Executor>(executor: E) -> Reschedule<E> {
    Reschedule {
        executor,
        posted: false,
    }
}

/// Future returned by [reschedule].
#[must_use = "futures do nothing unless polled"]
pub struct Reschedule<E> {
    executor: E,
    posted: bool,
}

impl<E: Executor + Unpin> Future for Reschedule<E> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.posted || self.executor.is_stopped() {
            return Poll::Ready(());
        }
        self.posted = true;
        let waker = cx.waker().clone();
        self.executor.post(Box::new(move || waker.wake()));
        Poll::Pending
    }
}
