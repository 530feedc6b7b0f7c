//! # Bounded Request Queue
//!
//! Admission control for every backend call the dashboard issues. Browsers cap
//! the number of connections per origin, and the backend degrades when a dozen
//! views refresh at once, so all views funnel their calls through one queue.
//!
//! ## Behaviour:
//!
//! - **FIFO admission**: submissions are appended to a waiting list and
//!   dispatched in order. There is no priority and no coalescing by id; two
//!   submissions with the same id are two independent entries.
//! - **Bounded backlog**: when the waiting list already holds `max_queue_size`
//!   entries, the submission resolves immediately to [`QueueError::QueueFull`]
//!   and its task is never invoked. This is a backpressure signal for the
//!   caller, the queue does not retry on its own.
//! - **Bounded concurrency**: at most `max_concurrent` tasks are in flight.
//!   The in-flight counter is incremented before the task is spawned and
//!   decremented exactly once when the timeout race settles.
//! - **Per-request timeout**: each task runs on its own tokio task and is raced
//!   against `request_timeout`. A timeout only abandons the wait; the task keeps
//!   running in the background and its late result is discarded.
//! - **Throttled dispatch**: after a completion the dispatch loop waits
//!   `dispatch_delay` before pulling the next entry.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Errors produced by the queue itself, as opposed to errors of the submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The waiting list was at capacity; the task was never invoked.
    #[error("request queue is full ({limit} waiting), try again shortly")]
    QueueFull {
        /// The configured `max_queue_size`.
        limit: usize,
    },

    /// The task did not settle within the per-request timeout.
    #[error("request {id} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// The id the request was submitted under.
        id: String,
        /// The configured per-request timeout.
        timeout: Duration,
    },

    /// The request was still waiting when [`RequestQueue::clear`] ran.
    #[error("request queue cleared")]
    Cleared,

    /// The task panicked while running.
    #[error("request {id} panicked")]
    TaskPanicked {
        /// The id the request was submitted under.
        id: String,
    },

    /// The queue went away before the request settled.
    #[error("request queue dropped the request before it settled")]
    Dropped,
}

/// Fixed configuration of a [`RequestQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestQueueConfig {
    /// Maximum number of tasks running at the same time.
    pub max_concurrent: usize,
    /// Maximum number of tasks waiting for a slot.
    pub max_queue_size: usize,
    /// How long a caller waits for a dispatched task before giving up.
    pub request_timeout: Duration,
    /// Pause between a completion and the next dispatch attempt.
    pub dispatch_delay: Duration,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 10,
            request_timeout: Duration::from_secs(30),
            dispatch_delay: Duration::from_millis(100),
        }
    }
}

/// Point-in-time view of the queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// Entries waiting for a slot.
    pub waiting: usize,
    /// Tasks currently running.
    pub in_flight: usize,
    /// Configured concurrency limit.
    pub max_concurrent: usize,
    /// Configured backlog limit.
    pub max_queue_size: usize,
}

/// A type-erased entry of the waiting list. It either runs, or is rejected
/// without ever invoking its task.
trait QueuedJob: Send {
    fn run(self: Box<Self>, id: String, timeout: Duration) -> BoxFuture<'static, ()>;
    fn reject(self: Box<Self>, error: QueueError);
}

struct TaskJob<F, T, E> {
    task: F,
    done: oneshot::Sender<Result<T, E>>,
}

impl<F, Fut, T, E> QueuedJob for TaskJob<F, T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<QueueError> + Send + 'static,
{
    fn run(self: Box<Self>, id: String, timeout: Duration) -> BoxFuture<'static, ()> {
        let TaskJob { task, done } = *self;
        Box::pin(async move {
            // Spawned separately so that a timeout drops only the JoinHandle, not the task.
            let running = tokio::spawn(task());
            let outcome = match tokio::time::timeout(timeout, running).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => {
                    tracing::error!(request_id = %id, error = %join_error, "Queued request panicked");
                    Err(QueueError::TaskPanicked { id }.into())
                }
                Err(_) => {
                    tracing::warn!(
                        request_id = %id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Queued request timed out; abandoning wait"
                    );
                    Err(QueueError::Timeout { id, timeout }.into())
                }
            };
            // The caller may have dropped its handle.
            let _ = done.send(outcome);
        })
    }

    fn reject(self: Box<Self>, error: QueueError) {
        let _ = self.done.send(Err(error.into()));
    }
}

struct QueuedRequest {
    id: String,
    job: Box<dyn QueuedJob>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<QueuedRequest>,
    in_flight: usize,
}

struct QueueInner {
    config: RequestQueueConfig,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        // The state is a counter and a list; a panic elsewhere cannot leave it half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pulls entries off the head of the waiting list until every slot is taken.
    fn dispatch(queue: &Arc<QueueInner>) {
        loop {
            let next = {
                let mut state = queue.lock_state();
                if state.in_flight >= queue.config.max_concurrent {
                    return;
                }
                let Some(request) = state.waiting.pop_front() else {
                    return;
                };
                state.in_flight += 1;
                request
            };

            let QueuedRequest { id, job, enqueued_at } = next;
            tracing::debug!(
                request_id = %id,
                waited_ms = enqueued_at.elapsed().as_millis() as u64,
                "Dispatching queued request"
            );

            let timeout = queue.config.request_timeout;
            let owner = Arc::clone(queue);
            tokio::spawn(async move {
                job.run(id, timeout).await;
                owner.complete();
                tokio::time::sleep(owner.config.dispatch_delay).await;
                QueueInner::dispatch(&owner);
            });
        }
    }

    fn complete(&self) {
        let mut state = self.lock_state();
        debug_assert!(state.in_flight > 0, "in-flight counter underflow");
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// # Request Queue
///
/// A cloneable handle to a bounded FIFO queue of asynchronous tasks. Clones
/// share the same waiting list and counters.
///
/// ```no_run
/// use lib_fxdash::core::{QueueError, RequestQueue, RequestQueueConfig};
///
/// # async fn example() -> Result<(), QueueError> {
/// let queue = RequestQueue::new(RequestQueueConfig::default());
/// let answer: u32 = queue.submit(None, || async { Ok::<_, QueueError>(42) }).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    /// Creates a queue. A `max_concurrent` of zero would never dispatch
    /// anything and is raised to one.
    pub fn new(mut config: RequestQueueConfig) -> Self {
        if config.max_concurrent == 0 {
            tracing::warn!("Request queue configured with max_concurrent = 0; using 1");
            config.max_concurrent = 1;
        }
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// The configuration the queue was built with.
    pub fn config(&self) -> &RequestQueueConfig {
        &self.inner.config
    }

    /// Submits a task.
    ///
    /// Admission happens synchronously: by the time this returns the task is
    /// either dispatched, waiting, or rejected. The returned handle resolves
    /// to the task's result, or to a [`QueueError`] converted into `E`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, Fut, T, E>(&self, id: Option<&str>, task: F) -> RequestHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<QueueError> + Send + 'static,
    {
        let id = id.map_or_else(|| Uuid::new_v4().to_string(), str::to_owned);
        let (done, receiver) = oneshot::channel();

        {
            let mut state = self.inner.lock_state();
            let limit = self.inner.config.max_queue_size;
            if state.waiting.len() >= limit {
                tracing::warn!(request_id = %id, limit, "Request queue full; rejecting submission");
                return RequestHandle {
                    id,
                    state: HandleState::Settled(Some(QueueError::QueueFull { limit }.into())),
                };
            }
            state.waiting.push_back(QueuedRequest {
                id: id.clone(),
                job: Box::new(TaskJob { task, done }),
                enqueued_at: Instant::now(),
            });
            tracing::trace!(request_id = %id, waiting = state.waiting.len(), "Request enqueued");
        }

        QueueInner::dispatch(&self.inner);

        RequestHandle {
            id,
            state: HandleState::Waiting(receiver),
        }
    }

    /// Rejects every entry that has not been dispatched yet with
    /// [`QueueError::Cleared`]. In-flight tasks are left alone.
    ///
    /// Returns the number of rejected entries.
    pub fn clear(&self) -> usize {
        let drained: Vec<QueuedRequest> = self.inner.lock_state().waiting.drain(..).collect();
        let cleared = drained.len();
        for request in drained {
            tracing::debug!(request_id = %request.id, "Rejecting waiting request on clear");
            request.job.reject(QueueError::Cleared);
        }
        if cleared > 0 {
            tracing::info!(cleared, "Request queue cleared");
        }
        cleared
    }

    /// Current counters.
    pub fn status(&self) -> QueueStatus {
        let state = self.inner.lock_state();
        QueueStatus {
            waiting: state.waiting.len(),
            in_flight: state.in_flight,
            max_concurrent: self.inner.config.max_concurrent,
            max_queue_size: self.inner.config.max_queue_size,
        }
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

enum HandleState<T, E> {
    Settled(Option<E>),
    Waiting(oneshot::Receiver<Result<T, E>>),
}

/// The pending result of a [`RequestQueue::submit`] call.
///
/// Dropping the handle does not remove the entry from the queue; the task
/// still runs when its turn comes and its result is discarded.
#[must_use = "a request handle does nothing unless awaited"]
pub struct RequestHandle<T, E> {
    id: String,
    state: HandleState<T, E>,
}

impl<T, E> RequestHandle<T, E> {
    /// The id the request was submitted under (generated when none was given).
    pub fn id(&self) -> &str {
        &self.id
    }
}

// No field is structurally pinned; the receiver is polled through `Pin::new`.
impl<T, E> Unpin for RequestHandle<T, E> {}

impl<T, E> Future for RequestHandle<T, E>
where
    E: From<QueueError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Settled(error) => {
                Poll::Ready(Err(error.take().unwrap_or_else(|| QueueError::Dropped.into())))
            }
            HandleState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
                Poll::Ready(Err(_)) => Poll::Ready(Err(QueueError::Dropped.into())),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<T, E> fmt::Debug for RequestHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            HandleState::Settled(_) => "settled",
            HandleState::Waiting(_) => "waiting",
        };
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("state", &state)
            .finish()
    }
}
