//! Move-only continuations.
//!
//! A [`Continuation<T>`] is "resume that computation with this `T`", stored
//! without knowing what the computation is. It can be moved around and called
//! once; it cannot be cloned, so a stored wake-up is never delivered twice.
//! Hand-offs carrying several values use a tuple for `T`.

use std::fmt;

use crate::Executor;

trait Callable<T>: Send {
    fn call(self: Box<Self>, value: T);
}

impl<T, F: FnOnce(T) + Send + 'static> Callable<T> for F {
    fn call(self: Box<Self>, value: T) {
        self(value)
    }
}

#[must_use]
pub struct Continuation<T> {
    f: Box<dyn Callable<T>>,
}

impl<T: 'static> Continuation<T> {
    pub fn new(f: impl FnOnce(T) + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    /// A continuation that does not run `f` itself, but posts it to `executor`.
    /// The caller of [`call`](Self::call) returns before `f` starts.
    pub fn dispatch<E>(executor: E, f: impl FnOnce(T) + Send + 'static) -> Self
    where
        E: Executor,
        T: Send,
    {
        Self::new(move |value| executor.post(Box::new(move || f(value))))
    }

    /// Adapts a continuation over `T` into one over `U`.
    pub fn map<U: 'static>(self, g: impl FnOnce(U) -> T + Send + 'static) -> Continuation<U> {
        Continuation::new(move |value| self.call(g(value)))
    }
}

impl<T> Continuation<T> {
    pub fn call(self, value: T) {
        self.f.call(value)
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation").finish_non_exhaustive()
    }
}
