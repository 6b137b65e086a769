// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{self, Poll};

use futures::FutureExt;
use futures::channel::oneshot;

use crate::error::StreamTaskError;
use crate::spawner::Spawner;
use crate::{CancellationToken, ERR_POISONED_LOCK};

// Activation word of a stream node, exactly one transition out of QUEUED wins:
// the executor moving to RUNNING or a cancellation callback moving to CANCELLED.
const QUEUED: u8 = 1;
const RUNNING: u8 = 0;
const CANCELLED: u8 = 2;

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A serial executor: queued closures run first-in-first-out, one at a time.
///
/// For every queued closure the stream guarantees that closures begin executing in the order
/// queued, that closure `N + 1` does not begin until closure `N` has fully completed
/// (including, for async closures, the future it returned), and that the future returned at
/// enqueue time settles with the closure's result. A panicking closure fails only its own
/// result; nothing downstream is skipped.
///
/// Closures execute on the stream's [`Spawner`], never on the enqueuing thread.
///
/// # Example
///
/// ```rust
/// use turnstile::{Spawner, TaskStream};
///
/// # #[tokio::main]
/// # async fn main() {
/// let stream = TaskStream::new(Spawner::Tokio);
///
/// let first = stream.queue(|| 1);
/// let second = stream.queue(|| 2);
///
/// assert_eq!(first.await, Ok(1));
/// assert_eq!(second.await, Ok(2));
/// # }
/// ```
#[derive(Debug)]
pub struct TaskStream {
    spawner: Spawner,

    // Most recently enqueued node; a fresh node is chained onto whatever was here. The
    // terminal sentinel stands in for "the stream is idle".
    tail: Mutex<Arc<StreamNode>>,

    pending: Arc<AtomicUsize>,
}

struct StreamNode {
    activation: AtomicU8,
    job: Mutex<Option<Job>>,
    next: Mutex<NextSlot>,

    // Keeps the enqueue-time cancellation registration alive until the node completes.
    registration: Mutex<Option<crate::Registration>>,
}

impl std::fmt::Debug for StreamNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamNode")
            .field("activation", &self.activation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum NextSlot {
    Unset,
    Chained(Arc<StreamNode>),
    Finished,
}

impl StreamNode {
    fn queued(job: Job) -> Arc<Self> {
        Arc::new(Self {
            activation: AtomicU8::new(QUEUED),
            job: Mutex::new(Some(job)),
            next: Mutex::new(NextSlot::Unset),
            registration: Mutex::new(None),
        })
    }

    /// The terminal sentinel: already finished, schedules its successor immediately.
    fn finished() -> Arc<Self> {
        Arc::new(Self {
            activation: AtomicU8::new(RUNNING),
            job: Mutex::new(None),
            next: Mutex::new(NextSlot::Finished),
            registration: Mutex::new(None),
        })
    }
}

impl TaskStream {
    /// Creates an idle stream that executes its closures on `spawner`.
    #[must_use]
    pub fn new(spawner: Spawner) -> Self {
        Self {
            spawner,
            tail: Mutex::new(StreamNode::finished()),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many queued closures have not yet completed.
    #[must_use]
    pub fn pending_actions(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queues a synchronous closure; the returned future settles with its result.
    pub fn queue<F, R>(&self, f: F) -> QueuedTask<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.queue_with_token(f, &CancellationToken::none())
    }

    /// Queues a synchronous closure that may be cancelled while it is still waiting.
    ///
    /// A token firing before the closure begins executing settles the future with
    /// [`StreamTaskError::Cancelled`] and the closure never runs; once execution has begun
    /// the token no longer aborts it.
    pub fn queue_with_token<F, R>(&self, f: F, token: &CancellationToken) -> QueuedTask<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.queue_async_with_token(move || std::future::ready(f()), token)
    }

    /// Queues an async closure; the next closure starts only after the returned future has
    /// fully completed.
    pub fn queue_async<F, Fut, R>(&self, f: F) -> QueuedTask<R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        self.queue_async_with_token(f, &CancellationToken::none())
    }

    /// Queues an async closure that may be cancelled while it is still waiting; see
    /// [`queue_with_token`][Self::queue_with_token].
    pub fn queue_async_with_token<F, Fut, R>(
        &self,
        f: F,
        token: &CancellationToken,
    ) -> QueuedTask<R>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let result_tx = Arc::new(Mutex::new(Some(result_tx)));

        let job_tx = Arc::clone(&result_tx);
        let job: Job = Box::new(move || {
            Box::pin(async move {
                // A panic in the closure (or the future it returned) fails this node's
                // result only; the chain continues.
                let outcome = AssertUnwindSafe(async move { f().await }).catch_unwind().await;

                let result = match outcome {
                    Ok(value) => Ok(value),
                    Err(_panic) => {
                        tracing::error!("queued stream closure panicked");
                        Err(StreamTaskError::Panicked)
                    }
                };

                if let Some(tx) = job_tx.lock().expect(ERR_POISONED_LOCK).take() {
                    _ = tx.send(result);
                }
            })
        });

        let node = StreamNode::queued(job);

        if token.can_be_cancelled() {
            let cancel_node = Arc::downgrade(&node);
            let cancel_tx = Arc::clone(&result_tx);
            let registration = token.register(move || {
                // Cancellation only wins before activation; the executor moving the node to
                // RUNNING first makes this a no-op.
                if let Some(node) = cancel_node.upgrade()
                    && node
                        .activation
                        .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    && let Some(tx) = cancel_tx.lock().expect(ERR_POISONED_LOCK).take()
                {
                    _ = tx.send(Err(StreamTaskError::Cancelled));
                }
            });

            *node.registration.lock().expect(ERR_POISONED_LOCK) = Some(registration);
        }

        self.push(Arc::clone(&node));

        QueuedTask {
            receiver: result_rx,
        }
    }

    /// A future that completes once the stream has drained past this point: every closure
    /// queued before the call has fully completed.
    pub fn completion(&self) -> Completion {
        Completion {
            probe: self.queue(|| ()),
        }
    }

    /// Rewinds the stream to a fresh terminal sentinel, so further enqueues begin a new
    /// serial run. Closures already chained continue to completion unaffected, and the
    /// pending-action counter keeps counting them.
    pub fn reset(&self) {
        let mut tail = self.tail.lock().expect(ERR_POISONED_LOCK);
        *tail = StreamNode::finished();
    }

    fn push(&self, node: Arc<StreamNode>) {
        self.pending.fetch_add(1, Ordering::AcqRel);

        let previous = {
            let mut tail = self.tail.lock().expect(ERR_POISONED_LOCK);
            std::mem::replace(&mut *tail, Arc::clone(&node))
        };

        // Tell the previous tail "your next is this". A tail that already finished
        // schedules the new node immediately; otherwise it is scheduled at completion.
        let run_now = {
            let mut slot = previous.next.lock().expect(ERR_POISONED_LOCK);
            match &*slot {
                NextSlot::Finished => true,
                NextSlot::Unset => {
                    *slot = NextSlot::Chained(Arc::clone(&node));
                    false
                }
                NextSlot::Chained(_) => {
                    unreachable!("a stream node can have at most one successor")
                }
            }
        };

        if run_now {
            self.spawner
                .spawn(execute(node, self.spawner.clone(), Arc::clone(&self.pending)));
        }
    }
}

/// Runs one node, then signals its successor. The completion signal is carried by a scope
/// guard so the chain survives a panic inside the executor and an executor that drops the
/// work item mid-poll during shutdown.
fn execute(
    node: Arc<StreamNode>,
    spawner: Spawner,
    pending: Arc<AtomicUsize>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let completion_node = Arc::clone(&node);
        let _complete = scopeguard::guard((spawner, pending), move |(spawner, pending)| {
            *completion_node
                .registration
                .lock()
                .expect(ERR_POISONED_LOCK) = None;

            let successor = {
                let mut slot = completion_node.next.lock().expect(ERR_POISONED_LOCK);
                match std::mem::replace(&mut *slot, NextSlot::Finished) {
                    NextSlot::Chained(next) => Some(next),
                    _ => None,
                }
            };

            pending.fetch_sub(1, Ordering::AcqRel);

            if let Some(next) = successor {
                let next_spawner = spawner.clone();
                spawner.spawn(execute(next, next_spawner, pending));
            }
        });

        // Activation: confirm the node was not cancelled while queued.
        if node
            .activation
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let job = node.job.lock().expect(ERR_POISONED_LOCK).take();
            if let Some(job) = job {
                job().await;
            }
        }
    })
}

/// Future returned by the queue operations; settles with the closure's result.
///
/// Dropping this future does not remove the closure from the stream; it merely discards the
/// result. The chain is self-contained, so closures already queued complete even if the
/// stream itself is dropped; only an executor that discards the work item outright (runtime
/// shutdown) settles the future with [`StreamTaskError::Cancelled`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct QueuedTask<R> {
    receiver: oneshot::Receiver<Result<R, StreamTaskError>>,
}

impl<R> Future for QueuedTask<R> {
    type Output = Result<R, StreamTaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        match self.receiver.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(StreamTaskError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`TaskStream::completion`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct Completion {
    probe: QueuedTask<()>,
}

impl Future for Completion {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        match self.probe.poll_unpin(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::CancellationSource;

    assert_impl_all!(TaskStream: Send, Sync);
    assert_impl_all!(QueuedTask<u32>: Send);

    #[tokio::test]
    async fn results_come_back_in_enqueue_order() {
        let stream = TaskStream::new(Spawner::Tokio);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for index in 0..8_u32 {
            let order = Arc::clone(&order);
            tasks.push(stream.queue(move || {
                order.lock().unwrap().push(index);
                index
            }));
        }

        for (index, queued) in tasks.into_iter().enumerate() {
            assert_eq!(queued.await, Ok(u32::try_from(index).unwrap()));
        }

        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn next_closure_waits_for_the_inner_future() {
        let stream = TaskStream::new(Spawner::Tokio);
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let slow_stamps = Arc::clone(&stamps);
        let slow = stream.queue_async(move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            slow_stamps.lock().unwrap().push(Instant::now());
        });

        let fast_stamps = Arc::clone(&stamps);
        let fast = stream.queue(move || {
            fast_stamps.lock().unwrap().push(Instant::now());
        });

        let started = Instant::now();
        slow.await.unwrap();
        fast.await.unwrap();

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[0] <= stamps[1]);
        assert!(stamps[1] - started >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn a_panicking_closure_does_not_skip_downstream_work() {
        let stream = TaskStream::new(Spawner::Tokio);

        let doomed = stream.queue(|| panic!("deliberate test panic"));
        let survivor = stream.queue(|| "still running");

        assert_eq!(doomed.await, Err(StreamTaskError::Panicked));
        assert_eq!(survivor.await, Ok("still running"));
    }

    #[tokio::test]
    async fn cancellation_only_applies_before_execution_starts() {
        let stream = TaskStream::new(Spawner::Tokio);
        let source = CancellationSource::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Blocks the stream so the cancellable closure stays queued.
        let blocker = stream.queue_async(move || async move {
            _ = release_rx.await;
        });

        let doomed = stream.queue_with_token(|| "never runs", &source.token());
        let survivor = stream.queue(|| "still running");

        source.cancel();
        assert_eq!(doomed.await, Err(StreamTaskError::Cancelled));

        _ = release_tx.send(());
        blocker.await.unwrap();
        assert_eq!(survivor.await, Ok("still running"));
    }

    #[tokio::test]
    async fn cancellation_after_start_is_a_no_op() {
        let stream = TaskStream::new(Spawner::Tokio);
        let source = CancellationSource::new();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let running = stream.queue_async_with_token(
            move || async move {
                _ = started_tx.send(());
                _ = release_rx.await;
                "completed"
            },
            &source.token(),
        );

        started_rx.await.unwrap();
        source.cancel();
        _ = release_tx.send(());

        assert_eq!(running.await, Ok("completed"));
    }

    #[tokio::test]
    async fn completion_waits_for_everything_queued_before_it() {
        let stream = TaskStream::new(Spawner::Tokio);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            drop(stream.queue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        stream.completion().await;

        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(stream.pending_actions(), 0);
    }

    #[tokio::test]
    async fn reset_starts_a_new_serial_run() {
        let stream = TaskStream::new(Spawner::Tokio);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = stream.queue_async(move || async move {
            _ = release_rx.await;
        });

        stream.reset();

        // The new run proceeds even though the old run's blocker is still executing.
        let fresh = stream.queue(|| "new run");
        assert_eq!(fresh.await, Ok("new run"));

        _ = release_tx.send(());
        blocker.await.unwrap();
    }

    #[tokio::test]
    async fn pending_actions_counts_queued_work() {
        let stream = TaskStream::new(Spawner::Tokio);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = stream.queue_async(move || async move {
            _ = release_rx.await;
        });
        let queued = stream.queue(|| ());

        assert_eq!(stream.pending_actions(), 2);

        _ = release_tx.send(());
        blocker.await.unwrap();
        queued.await.unwrap();

        assert_eq!(stream.pending_actions(), 0);
    }

    #[tokio::test]
    async fn queued_work_survives_dropping_the_stream() {
        let stream = TaskStream::new(Spawner::Tokio);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = stream.queue_async(move || async move {
            _ = release_rx.await;
        });
        let chained = stream.queue(|| "still delivered");

        // The chain is self-contained; dropping the stream abandons nothing.
        drop(stream);
        _ = release_tx.send(());

        blocker.await.unwrap();
        assert_eq!(chained.await, Ok("still delivered"));
    }
}
