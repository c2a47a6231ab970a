//! Named-group job queue executing at most one job per group at a time.
//!
//! A group is *draining* while it has an entry in the group map: the first enqueue creates the
//! entry and spawns a worker, later enqueues only append. The worker pops jobs in FIFO order
//! and removes the entry once the queue is empty, returning the group to idle.

use std::{
    any::Any,
    collections::{HashMap, VecDeque, hash_map::Entry},
    error::Error,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use futures::{FutureExt, future::BoxFuture};
use tokio::{
    runtime::Handle,
    sync::{Notify, oneshot},
};
use tracing::{debug, error};

/// Outcome delivered for every enqueued job.
pub type JobOutcome<T, E> = Result<T, JobError<E>>;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Reason a job did not produce a value.
#[derive(Debug)]
pub enum JobError<E> {
    /// The operation returned an error; forwarded untouched.
    Failed(E),
    /// The operation panicked. Only this job is affected.
    Panicked { group: String, message: String },
    /// The worker went away before delivering an outcome (runtime shutdown).
    Canceled { group: String },
}

impl<E> JobError<E> {
    /// The operation's own error, if that is why the job failed.
    pub fn into_failure(self) -> Option<E> {
        match self {
            JobError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for JobError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Failed(err) => write!(f, "job failed: {err}"),
            JobError::Panicked { group, message } => {
                write!(f, "job in group `{group}` panicked: {message}")
            }
            JobError::Canceled { group } => {
                write!(f, "job in group `{group}` was canceled before completion")
            }
        }
    }
}

impl<E: Error + 'static> Error for JobError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            JobError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Future resolving to the outcome of an enqueued job.
///
/// Dropping the handle does not cancel the job; it still runs in order.
pub struct JobHandle<T, E> {
    group: Arc<str>,
    rx: oneshot::Receiver<JobOutcome<T, E>>,
}

impl<T, E> JobHandle<T, E> {
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl<T, E> Future for JobHandle<T, E> {
    type Output = JobOutcome<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(JobError::Canceled {
                    group: this.group.to_string(),
                })
            })
        })
    }
}

/// Cheaply cloneable handle to the dispatcher.
#[derive(Clone)]
pub struct AsyncDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    groups: Mutex<HashMap<String, VecDeque<Job>>>,
    runtime: Handle,
    idle: Notify,
}

impl AsyncDispatcher {
    /// Create a dispatcher whose workers run on `runtime`.
    ///
    /// Enqueueing does not require being inside the runtime, so threads that own game logic
    /// can submit work directly.
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                groups: Mutex::new(HashMap::new()),
                runtime,
                idle: Notify::new(),
            }),
        }
    }

    /// Create a dispatcher bound to the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Queue `operation` under `group` and return a handle resolving to its outcome.
    pub fn enqueue<T, E, F, Fut>(&self, group: &str, operation: F) -> JobHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue_with_callback(group, operation, move |outcome| {
            // The caller may have dropped the handle; the job still counts as done.
            let _ = tx.send(outcome);
        });
        JobHandle {
            group: Arc::from(group),
            rx,
        }
    }

    /// Queue `operation` under `group`; `callback` receives the outcome exactly once.
    ///
    /// The callback runs on the group worker. Callers that must observe results on their own
    /// serialized context should forward the outcome from the callback, e.g. through a channel.
    pub fn enqueue_with_callback<T, E, F, Fut, C>(&self, group: &str, operation: F, callback: C)
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: FnOnce(JobOutcome<T, E>) + Send + 'static,
    {
        let group_name = group.to_owned();
        let job: Job = Box::new(move || {
            async move {
                let outcome = match AssertUnwindSafe(async move { operation().await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(JobError::Failed(err)),
                    Err(panic) => Err(JobError::Panicked {
                        group: group_name,
                        message: panic_message(panic.as_ref()),
                    }),
                };
                callback(outcome);
            }
            .boxed()
        });

        DispatcherInner::push(&self.inner, group, job);
    }

    /// Whether `group` currently has a worker draining its queue.
    pub fn is_draining(&self, group: &str) -> bool {
        self.inner.groups().contains_key(group)
    }

    /// Number of jobs of `group` waiting behind the one currently running.
    pub fn pending(&self, group: &str) -> usize {
        self.inner.groups().get(group).map_or(0, VecDeque::len)
    }

    /// Names of the groups currently draining.
    pub fn active_groups(&self) -> Vec<String> {
        self.inner.groups().keys().cloned().collect()
    }

    /// Wait until every group has drained.
    ///
    /// Jobs enqueued while waiting are waited for as well.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.groups().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl DispatcherInner {
    // Jobs never run under this lock, so a poisoned map is still consistent.
    fn groups(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Job>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(inner: &Arc<Self>, group: &str, job: Job) {
        let start_worker = match inner.groups().entry(group.to_owned()) {
            Entry::Occupied(mut queue) => {
                queue.get_mut().push_back(job);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::from([job]));
                true
            }
        };

        if start_worker {
            let worker = Arc::clone(inner);
            let group = group.to_owned();
            inner.runtime.spawn(async move { worker.drain(group).await });
        }
    }

    async fn drain(self: Arc<Self>, group: String) {
        debug!(group = %group, "dispatcher group draining");

        loop {
            let next = {
                let mut groups = self.groups();
                match groups.get_mut(&group).map(VecDeque::pop_front) {
                    Some(Some(job)) => Some(job),
                    _ => {
                        groups.remove(&group);
                        None
                    }
                }
            };
            let Some(job) = next else {
                break;
            };

            // Operation panics are turned into outcomes inside the job; this catches a
            // panicking callback so the rest of the group still runs.
            if let Err(panic) = AssertUnwindSafe(job()).catch_unwind().await {
                error!(
                    group = %group,
                    panic = %panic_message(panic.as_ref()),
                    "dispatcher job callback panicked"
                );
            }
        }

        debug!(group = %group, "dispatcher group idle");
        if self.groups().is_empty() {
            self.idle.notify_waiters();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::{sync::mpsc, time::timeout};

    use super::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_group_runs_in_fifo_order() {
        init_tracing();
        let dispatcher = AsyncDispatcher::current();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..5u64)
            .map(|index| {
                let order = Arc::clone(&order);
                dispatcher.enqueue("save", move || async move {
                    // Earlier jobs take longer; FIFO must still hold.
                    tokio::time::sleep(Duration::from_millis(25 - index * 5)).await;
                    order.lock().unwrap().push(index);
                    Ok::<_, String>(index)
                })
            })
            .collect();

        for (expected, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), expected as u64);
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_job_per_group_in_flight() {
        let dispatcher = AsyncDispatcher::current();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (in_flight, peak) = (Arc::clone(&in_flight), Arc::clone(&peak));
                dispatcher.enqueue("exclusive", move || async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_groups_run_concurrently() {
        let dispatcher = AsyncDispatcher::current();
        let (tx, rx) = oneshot::channel::<()>();

        // The first group can only finish once the second one has run.
        let waiting = dispatcher.enqueue("a", move || async move {
            rx.await.map_err(|_| "sender dropped".to_owned())
        });
        let signalling = dispatcher.enqueue("b", move || async move {
            tx.send(()).map_err(|_| "receiver dropped".to_owned())
        });

        let both = async { (waiting.await, signalling.await) };
        let (waiting, signalling) = timeout(Duration::from_secs(5), both)
            .await
            .expect("groups blocked each other");
        waiting.unwrap();
        signalling.unwrap();
    }

    #[tokio::test]
    async fn failures_are_forwarded_and_group_keeps_draining() {
        let dispatcher = AsyncDispatcher::current();

        let failing = dispatcher.enqueue("g", || async { Err::<u32, _>("boom".to_owned()) });
        let next = dispatcher.enqueue("g", || async { Ok::<_, String>(7) });

        match failing.await {
            Err(JobError::Failed(message)) => assert_eq!(message, "boom"),
            other => panic!("expected forwarded failure, got {other:?}"),
        }
        assert_eq!(next.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn panicking_job_is_isolated() {
        init_tracing();
        let dispatcher = AsyncDispatcher::current();

        let panicking = dispatcher.enqueue("g", || async {
            if true {
                panic!("corrupted entity");
            }
            Ok::<u32, String>(0)
        });
        let next = dispatcher.enqueue("g", || async { Ok::<_, String>(1) });

        match panicking.await {
            Err(JobError::Panicked { group, message }) => {
                assert_eq!(group, "g");
                assert_eq!(message, "corrupted entity");
            }
            other => panic!("expected panic outcome, got {other:?}"),
        }
        assert_eq!(next.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stall_group() {
        let dispatcher = AsyncDispatcher::current();

        dispatcher.enqueue_with_callback(
            "g",
            || async { Ok::<_, String>(()) },
            |_| panic!("callback exploded"),
        );
        let next = dispatcher.enqueue("g", || async { Ok::<_, String>("still running") });

        assert_eq!(next.await.unwrap(), "still running");
    }

    #[tokio::test]
    async fn callbacks_can_hand_results_back_to_a_serial_context() {
        let dispatcher = AsyncDispatcher::current();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for index in 0..3 {
            let tx = tx.clone();
            dispatcher.enqueue_with_callback(
                "db",
                move || async move { Ok::<_, String>(index * 10) },
                move |outcome| {
                    let _ = tx.send(outcome);
                },
            );
        }
        drop(tx);

        let mut received = Vec::new();
        while let Some(outcome) = rx.recv().await {
            received.push(outcome.unwrap());
        }
        assert_eq!(received, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn group_is_torn_down_once_drained() {
        let dispatcher = AsyncDispatcher::current();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = dispatcher.enqueue("g", move || async move {
            release_rx.await.map_err(|_| "dropped".to_owned())
        });
        let second = dispatcher.enqueue("g", || async { Ok::<_, String>(()) });

        assert!(dispatcher.is_draining("g"));
        assert_eq!(dispatcher.active_groups(), vec!["g".to_owned()]);

        release_tx.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        dispatcher.wait_idle().await;

        assert!(!dispatcher.is_draining("g"));
        assert_eq!(dispatcher.pending("g"), 0);
    }

    #[test]
    fn enqueue_works_from_threads_outside_the_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let dispatcher = AsyncDispatcher::new(runtime.handle().clone());
        let (tx, rx) = std::sync::mpsc::channel();

        let game_thread = std::thread::spawn({
            let dispatcher = dispatcher.clone();
            move || {
                dispatcher.enqueue_with_callback(
                    "logic",
                    || async { Ok::<_, String>("saved") },
                    move |outcome| {
                        let _ = tx.send(outcome);
                    },
                );
            }
        });
        game_thread.join().unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.unwrap(), "saved");
        runtime.block_on(dispatcher.wait_idle());
    }
}
