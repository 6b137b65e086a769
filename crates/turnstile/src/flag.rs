// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{self, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::channel::oneshot;

use crate::spawner::Spawner;
use crate::{ERR_POISONED_LOCK, timer};

// Pump states. FLAGGED and RERUN absorb further sets, which is what coalesces bursts
// into single runs.
const IDLE: u8 = 0;
const FLAGGED: u8 = 1;
const RUNNING: u8 = 2;
const RERUN: u8 = 3;

type Callback = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A coalesced, self-rearming callback driver.
///
/// [`set`][Self::set] requests that the async callback run; any number of sets while a run
/// is pending or in flight collapse into a single follow-up run. The callback itself runs on
/// the flag's [`Spawner`], never on the setting thread.
///
/// An optional batching delay holds a freshly flagged run back for a window in which
/// further sets keep coalescing, useful when sets arrive in bursts and one run can absorb
/// them all.
#[derive(Debug)]
pub struct TaskFlag {
    inner: Arc<FlagInner>,
}

struct FlagInner {
    state: AtomicU8,
    callback: Callback,
    spawner: Spawner,
    delay: Option<Duration>,
    wait_queue: Mutex<Vec<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for FlagInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlagInner")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl TaskFlag {
    /// Creates a flag that dispatches `callback` on `spawner`.
    pub fn new<F, Fut>(spawner: Spawner, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::build(spawner, None, callback)
    }

    /// Creates a flag whose runs are held back by `delay` so bursts of sets batch into one
    /// run.
    pub fn with_delay<F, Fut>(spawner: Spawner, delay: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::build(spawner, Some(delay), callback)
    }

    fn build<F, Fut>(spawner: Spawner, delay: Option<Duration>, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(FlagInner {
                state: AtomicU8::new(IDLE),
                callback: Box::new(move || Box::pin(callback())),
                spawner,
                delay,
                wait_queue: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Requests a callback run.
    ///
    /// From idle this dispatches the processor; while a run is pending or executing it marks
    /// the flag for exactly one follow-up run, no matter how many times it is called.
    pub fn set(&self) {
        let mut current = self.inner.state.load(Ordering::Acquire);

        loop {
            let (next, dispatch) = match current {
                IDLE => (FLAGGED, true),
                FLAGGED | RERUN => return,
                RUNNING => (RERUN, false),
                _ => unreachable!("corrupt task flag state"),
            };

            match self.inner.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if dispatch {
                        let inner = Arc::clone(&self.inner);
                        self.inner.spawner.spawn(run_processor(inner));
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Requests a run and returns a future that completes after one full execution that
    /// started after this call.
    ///
    /// If the flag is dropped before that run happens, the future completes anyway rather
    /// than suspending forever.
    pub fn set_and_wait(&self) -> SetAndWait {
        let (tx, rx) = oneshot::channel();

        self.inner
            .wait_queue
            .lock()
            .expect(ERR_POISONED_LOCK)
            .push(tx);
        self.set();

        SetAndWait { receiver: rx }
    }
}

async fn run_processor(inner: Arc<FlagInner>) {
    loop {
        if let Some(delay) = inner.delay {
            // Batching window; sets arriving here find FLAGGED and coalesce.
            timer::sleep(delay).await;
        }

        let activated = inner
            .state
            .compare_exchange(FLAGGED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug_assert!(activated, "processor dispatched without a flagged state");

        // Waiters captured at run start are exactly those whose set_and_wait preceded
        // this run.
        let waiters = std::mem::take(&mut *inner.wait_queue.lock().expect(ERR_POISONED_LOCK));

        let outcome = AssertUnwindSafe((inner.callback)()).catch_unwind().await;
        if outcome.is_err() {
            tracing::error!("task flag callback panicked");
        }

        for waiter in waiters {
            _ = waiter.send(());
        }

        match inner
            .state
            .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return,
            Err(_rerun) => {
                // A set arrived during the run; rearm and go again.
                inner.state.store(FLAGGED, Ordering::Release);
            }
        }
    }
}

/// Future returned by [`TaskFlag::set_and_wait`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct SetAndWait {
    receiver: oneshot::Receiver<()>,
}

impl Future for SetAndWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        match self.receiver.poll_unpin(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}
