//! Single-value hand-off between one producing and one consuming computation.
//!
//! A [`Sender<T>`] and its [`Receiver<T>`] share a mailbox. Sending is never
//! blocking: if the receiver is suspended waiting for a value, the value goes
//! straight to its continuation; otherwise it is queued. Receiving drains the
//! queue first-in, first-out, and only suspends when the queue is empty and the
//! sender is still around.
//!
//! ```
//! use baton::channel::channel;
//! use futures::executor::block_on;
//!
//! let (sender, mut receiver) = channel::<(i32, &str)>();
//! assert!(sender.send((1, "one")));
//! assert!(sender.send((2, "two")));
//! drop(sender);
//!
//! block_on(async {
//!     assert_eq!(receiver.recv().await, Ok((1, "one")));
//!     assert_eq!(receiver.recv().await, Ok((2, "two")));
//!     assert!(receiver.recv().await.is_err());
//! });
//! ```
//!
//! # Disappearing endpoints
//!
//! Either side may go away at any time, and the other side finds out instead
//! of hanging:
//!
//! - Once the receiver is dropped, [`Sender::send`] returns `false` and the
//!   value is discarded.
//! - Once the sender is dropped, a receiver drains what was already queued and
//!   then gets [`RecvError::Disconnected`]. A receiver that was suspended at
//!   that moment is woken with the same error.
//!
//! # Replacing the receiver
//!
//! A mailbox has one current receiver. Making a new one, with
//! [`Sender::make_receiver`] or [`Receiver::attach`], supersedes the previous
//! receiver: whatever it was waiting for is cancelled, and from then on it only
//! ever gets [`RecvError::Superseded`]. Values already queued stay queued for
//! the new receiver.
//!
//! # Backpressure
//!
//! There is none. Values sent while nobody is receiving accumulate without
//! bound; protocols that need flow control have to limit sends themselves.

use std::{
    collections::VecDeque,
    error, fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use futures::{channel::oneshot, ready, FutureExt, Stream};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::callable::Continuation;

/// Creates a sender and its receiver.
pub fn channel<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    let sender = Sender::new();
    let receiver = sender.make_receiver();
    (sender, receiver)
}

pub struct Sender<T> {
    mailbox: Arc<Mailbox<T>>,
}

pub struct Receiver<T> {
    mailbox: Arc<Mailbox<T>>,
    generation: u64,
    // Continuation side of a registration that has not completed yet. Kept
    // here, not in the `Recv` future, so dropping that future loses no value.
    waiting: Option<oneshot::Receiver<T>>,
}

/// A non-owning handle to a mailbox, for attaching receivers later.
pub struct MailboxHandle<T> {
    mailbox: Weak<Mailbox<T>>,
}

struct Mailbox<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    queue: VecDeque<T>,
    pending: Option<Continuation<T>>,
    sender_alive: bool,
    receiver: Endpoint,
    generations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    /// No receiver made yet; sends are buffered for it.
    Unclaimed,
    Active(u64),
    Gone,
}

/// Outcome of [`Receiver::suspend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    /// A queued value was available and the continuation has been called
    /// with it.
    Resumed,
    /// The continuation is installed and the next send will call it.
    Pending,
    /// No value is queued and the sender is gone. The continuation was dropped.
    Disconnected,
    /// A newer receiver owns the mailbox. The continuation was dropped.
    Superseded,
    /// This receiver has a [`recv`](Receiver::recv) in flight that owns the
    /// registration. The continuation was dropped.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    #[error("sender is gone and no values are queued")]
    Disconnected,
    #[error("receiver was superseded by a newer receiver on the same mailbox")]
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    #[error("no value is queued")]
    Empty,
    #[error("sender is gone and no values are queued")]
    Disconnected,
    #[error("receiver was superseded by a newer receiver on the same mailbox")]
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("mailbox has already been released")]
    MailboxGone,
}

/// The receiver is gone. Carries the value that could not be sent.
#[derive(PartialEq, Eq)]
pub struct SendError<T>(pub T);

/// Future returned by [`Receiver::recv`].
#[must_use = "futures do nothing unless polled"]
pub struct Recv<'a, T> {
    receiver: &'a mut Receiver<T>,
}

impl<T: Send + 'static> Sender<T> {
    pub fn new() -> Self {
        Self {
            mailbox: Arc::new(Mailbox {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    pending: None,
                    sender_alive: true,
                    receiver: Endpoint::Unclaimed,
                    generations: 0,
                }),
            }),
        }
    }

    /// Hands `value` to the receiver, or queues it if the receiver is not
    /// waiting. Returns `false`, dropping the value, if the receiver is gone.
    pub fn send(&self, value: T) -> bool {
        self.try_send(value).is_ok()
    }

    /// Like [`send`](Self::send), but gives the value back on failure.
    pub fn try_send(&self, value: T) -> Result<(), SendError<T>> {
        let mut state = self.mailbox.state.lock();
        if state.receiver == Endpoint::Gone {
            trace!("send rejected, receiver is gone");
            return Err(SendError(value));
        }
        let Some(continuation) = state.pending.take() else {
            state.queue.push_back(value);
            return Ok(());
        };
        drop(state);
        continuation.call(value);
        Ok(())
    }

    pub fn has_receiver(&self) -> bool {
        self.mailbox.state.lock().receiver != Endpoint::Gone
    }

    /// Makes a receiver for this sender's mailbox, superseding the current one.
    pub fn make_receiver(&self) -> Receiver<T> {
        Receiver::claim(self.mailbox.clone())
    }

    pub fn mailbox(&self) -> MailboxHandle<T> {
        MailboxHandle {
            mailbox: Arc::downgrade(&self.mailbox),
        }
    }
}

impl<T: Send + 'static> Default for Sender<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut state = self.mailbox.state.lock();
        state.sender_alive = false;
        let pending = state.pending.take();
        drop(state);
        if pending.is_some() {
            debug!("sender dropped while receiver was waiting");
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.mailbox.state.lock();
        f.debug_struct("Sender")
            .field("queued", &state.queue.len())
            .field("receiver", &state.receiver)
            .finish()
    }
}

impl<T: Send + 'static> Receiver<T> {
    pub fn from_sender(sender: &Sender<T>) -> Self {
        sender.make_receiver()
    }

    /// Attaches a receiver to the mailbox behind `handle`, superseding the
    /// current receiver. Fails if the mailbox no longer exists.
    pub fn attach(handle: &MailboxHandle<T>) -> Result<Self, AttachError> {
        let mailbox = handle.mailbox.upgrade().ok_or(AttachError::MailboxGone)?;
        Ok(Self::claim(mailbox))
    }

    fn claim(mailbox: Arc<Mailbox<T>>) -> Self {
        let mut state = mailbox.state.lock();
        state.generations += 1;
        let generation = state.generations;
        if let Endpoint::Active(previous) = state.receiver {
            debug!(previous, generation, "receiver superseded");
        }
        state.receiver = Endpoint::Active(generation);
        let abandoned = state.pending.take();
        drop(state);
        drop(abandoned);

        Self {
            mailbox,
            generation,
            waiting: None,
        }
    }

    /// Whether the sender still exists.
    pub fn has_sender(&self) -> bool {
        self.mailbox.state.lock().sender_alive
    }

    /// Whether this receiver still owns its mailbox.
    pub fn is_current(&self) -> bool {
        self.mailbox.state.lock().receiver == Endpoint::Active(self.generation)
    }

    /// Registers `continuation` for the next value.
    ///
    /// If a value is already queued, the oldest one is popped and the
    /// continuation is called with it before returning. Otherwise, as long as
    /// the sender exists, the continuation is stored and called by the next
    /// send, replacing any continuation registered earlier.
    ///
    /// A stored continuation runs on the thread that sends, inside
    /// [`Sender::send`]. Build it with [`Continuation::dispatch`] to have it
    /// posted to an executor instead.
    ///
    /// Returns [`Suspend::Busy`] while an unfinished [`recv`](Self::recv) or
    /// [`poll_recv`](Self::poll_recv) on this receiver is registered.
    pub fn suspend(&self, continuation: Continuation<T>) -> Suspend {
        if self.waiting.is_some() {
            trace!(generation = self.generation, "suspend rejected, recv in flight");
            return Suspend::Busy;
        }
        self.register(continuation)
    }

    fn register(&self, continuation: Continuation<T>) -> Suspend {
        let mut state = self.mailbox.state.lock();
        if state.receiver != Endpoint::Active(self.generation) {
            return Suspend::Superseded;
        }
        if let Some(value) = state.queue.pop_front() {
            drop(state);
            continuation.call(value);
            return Suspend::Resumed;
        }
        if state.sender_alive {
            state.pending = Some(continuation);
            return Suspend::Pending;
        }
        Suspend::Disconnected
    }

    /// Waits for the next value.
    pub fn recv(&mut self) -> Recv<'_, T> {
        Recv { receiver: self }
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Result<T, RecvError>> {
        loop {
            if let Some(waiting) = self.waiting.as_mut() {
                let outcome = ready!(waiting.poll_unpin(cx));
                self.waiting = None;
                return Poll::Ready(outcome.map_err(|oneshot::Canceled| self.disconnect_reason()));
            }

            let (tx, rx) = oneshot::channel();
            let continuation = Continuation::new(move |value| {
                let _ = tx.send(value);
            });
            match self.register(continuation) {
                Suspend::Resumed | Suspend::Pending => self.waiting = Some(rx),
                Suspend::Disconnected => return Poll::Ready(Err(RecvError::Disconnected)),
                Suspend::Superseded => return Poll::Ready(Err(RecvError::Superseded)),
                Suspend::Busy => unreachable!("register never reports a busy receiver"),
            }
        }
    }

    /// Takes the next value if one is available right now.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        if let Some(waiting) = self.waiting.as_mut() {
            return match waiting.try_recv() {
                Ok(Some(value)) => {
                    self.waiting = None;
                    Ok(value)
                }
                Ok(None) => Err(TryRecvError::Empty),
                Err(oneshot::Canceled) => {
                    self.waiting = None;
                    Err(match self.disconnect_reason() {
                        RecvError::Disconnected => TryRecvError::Disconnected,
                        RecvError::Superseded => TryRecvError::Superseded,
                    })
                }
            };
        }

        let mut state = self.mailbox.state.lock();
        if state.receiver != Endpoint::Active(self.generation) {
            return Err(TryRecvError::Superseded);
        }
        match state.queue.pop_front() {
            Some(value) => Ok(value),
            None if state.sender_alive => Err(TryRecvError::Empty),
            None => Err(TryRecvError::Disconnected),
        }
    }

    fn disconnect_reason(&self) -> RecvError {
        if self.is_current() {
            RecvError::Disconnected
        } else {
            RecvError::Superseded
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut state = self.mailbox.state.lock();
        if state.receiver == Endpoint::Active(self.generation) {
            state.receiver = Endpoint::Gone;
            let pending = state.pending.take();
            drop(state);
            drop(pending);
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("generation", &self.generation)
            .field("waiting", &self.waiting.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Stream for Receiver<T> {
    type Item = T;

    /// Ends once the sender is gone and the queue is drained, or once this
    /// receiver has been superseded.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().poll_recv(cx).map(Result::ok)
    }
}

impl<T: Send + 'static> Future for Recv<'_, T> {
    type Output = Result<T, RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver.poll_recv(cx)
    }
}

impl<T: Send + 'static> MailboxHandle<T> {
    /// Same as [`Receiver::attach`].
    pub fn attach(&self) -> Result<Receiver<T>, AttachError> {
        Receiver::attach(self)
    }
}

impl<T> Clone for MailboxHandle<T> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<T> fmt::Debug for MailboxHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailboxHandle")
            .field("released", &(self.mailbox.strong_count() == 0))
            .finish()
    }
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SendError").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("receiver is gone")
    }
}

impl<T> error::Error for SendError<T> {}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use futures::{executor::block_on, StreamExt};

    use super::*;

    fn recorder<T: Send + 'static>() -> (Continuation<T>, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel();
        (Continuation::new(move |value| tx.send(value).unwrap()), rx)
    }

    #[test]
    fn queued_values_resume_immediately() {
        let (sender, receiver) = channel();
        assert!(sender.send(1));
        let (continuation, values) = recorder();
        assert_eq!(receiver.suspend(continuation), Suspend::Resumed);
        assert_eq!(values.try_recv(), Ok(1));
    }

    #[test]
    fn pending_continuation_is_completed_by_next_send() {
        let (sender, receiver) = channel();
        let (continuation, values) = recorder();
        assert_eq!(receiver.suspend(continuation), Suspend::Pending);
        assert!(values.try_recv().is_err());

        assert!(sender.send("late"));
        assert_eq!(values.try_recv(), Ok("late"));

        // Consumed: the next send is queued again.
        assert!(sender.send("queued"));
        let (continuation, values) = recorder();
        assert_eq!(receiver.suspend(continuation), Suspend::Resumed);
        assert_eq!(values.try_recv(), Ok("queued"));
    }

    #[test]
    fn suspend_without_sender_or_values_is_disconnected() {
        let (sender, receiver) = channel::<u8>();
        drop(sender);
        let (continuation, _values) = recorder();
        assert_eq!(receiver.suspend(continuation), Suspend::Disconnected);
        assert!(!receiver.has_sender());
    }

    #[test]
    fn fresh_sender_buffers_until_a_receiver_is_dropped() {
        let sender = Sender::new();
        assert!(sender.has_receiver());
        assert!(sender.send(1));

        let mut receiver = sender.make_receiver();
        assert_eq!(receiver.try_recv(), Ok(1));
        drop(receiver);

        assert!(!sender.has_receiver());
        assert_eq!(sender.try_send(2), Err(SendError(2)));
    }

    #[test]
    fn try_recv_reports_each_state() {
        let (sender, mut receiver) = channel();
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));
        sender.send('a');
        drop(sender);
        assert_eq!(receiver.try_recv(), Ok('a'));
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn try_recv_picks_up_a_value_delivered_to_an_interrupted_recv() {
        let (sender, mut receiver) = channel();
        {
            let mut recv = receiver.recv();
            let waker = futures::task::noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert!(Pin::new(&mut recv).poll(&mut cx).is_pending());
        }
        sender.send(3);
        assert_eq!(receiver.try_recv(), Ok(3));
    }

    #[test]
    fn new_receiver_supersedes_the_old_one() {
        let sender = Sender::new();
        let mut old = sender.make_receiver();
        sender.send(1);

        let mut new = Receiver::from_sender(&sender);
        assert!(!old.is_current());
        assert!(new.is_current());
        assert_eq!(old.try_recv(), Err(TryRecvError::Superseded));
        assert_eq!(new.try_recv(), Ok(1));

        // Dropping the superseded receiver leaves the mailbox alone.
        drop(old);
        assert!(sender.has_receiver());
        drop(new);
        assert!(!sender.has_receiver());
    }

    #[test]
    fn superseding_cancels_a_suspended_receiver() {
        let sender = Sender::<i32>::new();
        let mut old = sender.make_receiver();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(old.poll_recv(&mut cx).is_pending());

        let _new = sender.make_receiver();
        assert_eq!(old.poll_recv(&mut cx), Poll::Ready(Err(RecvError::Superseded)));
    }

    #[test]
    fn attach_fails_once_the_mailbox_is_released() {
        let (sender, receiver) = channel::<()>();
        let handle = sender.mailbox();
        assert!(handle.attach().is_ok());

        drop(sender);
        drop(receiver);
        assert_eq!(Receiver::attach(&handle).unwrap_err(), AttachError::MailboxGone);
    }

    #[test]
    fn suspend_leaves_an_in_flight_recv_alone() {
        let (sender, mut receiver) = channel();
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(receiver.poll_recv(&mut cx).is_pending());

        let (continuation, values) = recorder();
        assert_eq!(receiver.suspend(continuation), Suspend::Busy);
        assert!(receiver.has_sender());
        assert!(receiver.poll_recv(&mut cx).is_pending());

        sender.send(5);
        assert_eq!(receiver.poll_recv(&mut cx), Poll::Ready(Ok(5)));
        assert!(values.try_recv().is_err());

        // Finished: raw continuations are accepted again.
        let (continuation, values) = recorder();
        assert_eq!(receiver.suspend(continuation), Suspend::Pending);
        sender.send(6);
        assert_eq!(values.try_recv(), Ok(6));
    }

    #[test]
    fn dispatched_continuation_runs_on_the_executor_not_the_sender() {
        let event_loop = crate::runtimes::event_loop::EventLoop::new();
        let (sender, receiver) = channel();
        let (tx, values) = mpsc::channel();
        let continuation = Continuation::dispatch(event_loop.clone(), move |value| {
            tx.send(value).unwrap()
        });
        assert_eq!(receiver.suspend(continuation), Suspend::Pending);

        sender.send('x');
        assert!(values.try_recv().is_err());
        assert_eq!(event_loop.poll(), 1);
        assert_eq!(values.try_recv(), Ok('x'));
    }

    #[test]
    fn attach_revives_a_mailbox_whose_receiver_was_dropped() {
        let (sender, receiver) = channel();
        let handle = sender.mailbox();
        drop(receiver);
        assert!(!sender.has_receiver());
        assert!(!sender.send(1));

        let mut receiver = Receiver::attach(&handle).unwrap();
        assert!(receiver.is_current());
        assert!(sender.has_receiver());
        assert!(sender.send(2));
        assert_eq!(receiver.try_recv(), Ok(2));
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn stream_ends_when_sender_is_gone() {
        let (sender, receiver) = channel();
        for i in 0..4 {
            sender.send(i);
        }
        drop(sender);
        assert_eq!(block_on(receiver.collect::<Vec<_>>()), vec![0, 1, 2, 3]);
    }
}
