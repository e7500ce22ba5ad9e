//! Bounded-concurrency task queue.
//!
//! A connection owns two of these: a write queue with concurrency 1, which keeps queued
//! frames in submission order on the wire, and a read queue that bounds how many
//! `on_message` calls run at once. Workers are tokio tasks spawned on demand on the runtime the
//! queue was created in; a worker keeps draining the queue and exits when it finds it empty.

use std::{collections::VecDeque, panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use tokio::runtime::Handle;

struct State {
    tasks: VecDeque<BoxFuture<'static, ()>>,
    running: usize,
}

struct Inner {
    max_concurrency: usize,
    runtime: Handle,
    state: Mutex<State>,
}

/// FIFO queue of futures run by at most `max_concurrency` workers.
///
/// Tasks can be pushed from any thread, inside a runtime or not.
#[derive(Clone)]
pub struct WorkerQueue {
    inner: Arc<Inner>,
}

impl WorkerQueue {
    /// Creates a queue running at most `max_concurrency` tasks at a time (minimum 1) on the
    /// current runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new(max_concurrency: usize) -> Self {
        Self::with_handle(max_concurrency, Handle::current())
    }

    /// Creates a queue whose workers run on `runtime`.
    pub fn with_handle(max_concurrency: usize, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrency: max_concurrency.max(1),
                runtime,
                state: Mutex::new(State {
                    tasks: VecDeque::new(),
                    running: 0,
                }),
            }),
        }
    }

    /// Appends a task. Never runs it on the caller's stack.
    pub fn push<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let spawn = {
            let mut state = self.inner.state.lock();
            state.tasks.push_back(task.boxed());
            if state.running < self.inner.max_concurrency {
                state.running += 1;
                true
            } else {
                false
            }
        };

        if spawn {
            self.inner.runtime.spawn(Arc::clone(&self.inner).work());
        }
    }

    /// Number of tasks waiting for a worker.
    pub fn len(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if nothing is queued or running.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.tasks.is_empty() && state.running == 0
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }
}

impl std::fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkerQueue")
            .field("max_concurrency", &self.inner.max_concurrency)
            .field("queued", &state.tasks.len())
            .field("running", &state.running)
            .finish()
    }
}

impl Inner {
    async fn work(self: Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock();
                match state.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        state.running -= 1;
                        return;
                    }
                }
            };

            if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                tracing::warn!("worker queue task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    async fn wait_idle(queue: &WorkerQueue) {
        for _ in 0..500 {
            if queue.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("queue did not drain: {queue:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_worker_is_fifo() {
        let queue = WorkerQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let order = Arc::clone(&order);
            queue.push(async move {
                if i % 7 == 0 {
                    tokio::task::yield_now().await;
                }
                order.lock().push(i);
            });
        }

        wait_idle(&queue).await;
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let queue = WorkerQueue::new(3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..30 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            queue.push(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        wait_idle(&queue).await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_push_does_not_run_inline() {
        let queue = WorkerQueue::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            queue.push(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(queue.len(), 1);

        wait_idle(&queue).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_push_from_plain_thread() {
        let queue = WorkerQueue::new(1);
        let ran = Arc::new(AtomicUsize::new(0));

        let pusher = {
            let queue = queue.clone();
            let ran = Arc::clone(&ran);
            std::thread::spawn(move || {
                for _ in 0..10 {
                    let ran = Arc::clone(&ran);
                    queue.push(async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
        };
        pusher.join().unwrap();

        wait_idle(&queue).await;
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_queue_on_explicit_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let queue = WorkerQueue::with_handle(2, runtime.handle().clone());
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            queue.push(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        runtime.block_on(wait_idle(&queue));
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    fn explode() {
        panic!("boom");
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_stall_queue() {
        let queue = WorkerQueue::new(1);
        let ran = Arc::new(AtomicUsize::new(0));

        queue.push(async { explode() });
        {
            let ran = Arc::clone(&ran);
            queue.push(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        wait_idle(&queue).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
