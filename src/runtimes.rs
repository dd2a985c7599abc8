//! [Executor] implementations for popular runtimes, and a minimal one of our
//! own.

pub mod event_loop;

#[cfg(feature = "runtime-tokio")]
pub mod tokio {
    use futures::Future;

    use crate::{task::TaskHandle, Callback, Executor};

    impl Executor for tokio::runtime::Handle {
        fn post(&self, callback: Callback) {
            drop(self.spawn(async move { callback() }))
        }
    }

    /// Starts `future` as a detached task on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// If called outside of a Tokio runtime.
    pub fn spawn<F>(future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let task = TaskHandle::detached(tokio::runtime::Handle::current(), future);
        task.schedule();
        task
    }
}

pub mod spawn {
    use futures::task::{Spawn, SpawnExt};
    use tracing::warn;

    use crate::{Callback, Executor};

    /// Runs posted callbacks as tiny futures on any [`futures::task::Spawn`].
    #[derive(Debug, Clone)]
    pub struct SpawnExecutor<S>(pub S);

    impl<S: Spawn + Send + Sync + 'static> Executor for SpawnExecutor<S> {
        fn post(&self, callback: Callback) {
            if let Err(err) = self.0.spawn(async move { callback() }) {
                warn!(%err, "spawner rejected callback");
            }
        }

        fn is_stopped(&self) -> bool {
            self.0.status().is_err()
        }
    }

    #[cfg(test)]
    mod tests {
        use futures::{
            executor::ThreadPool,
            future::FutureObj,
            task::{Spawn, SpawnError},
        };

        use super::*;

        struct ShutDown;

        impl Spawn for ShutDown {
            fn spawn_obj(&self, _future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
                Err(SpawnError::shutdown())
            }

            fn status(&self) -> Result<(), SpawnError> {
                Err(SpawnError::shutdown())
            }
        }

        #[test]
        fn shut_down_spawner_reports_stopped_and_drops_posts() {
            let executor = SpawnExecutor(ShutDown);
            assert!(executor.is_stopped());
            executor.post(Box::new(|| unreachable!("posted to a shut down spawner")));
        }

        #[test]
        fn thread_pool_runs_posted_callbacks() {
            let executor = SpawnExecutor(ThreadPool::new().unwrap());
            assert!(!executor.is_stopped());
            let (tx, rx) = std::sync::mpsc::channel();
            executor.post(Box::new(move || tx.send(7).unwrap()));
            assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)), Ok(7));
        }
    }
}
