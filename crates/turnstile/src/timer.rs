// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use futures::task::AtomicWaker;

use crate::ERR_POISONED_LOCK;

/// Arms a one-shot deadline that invokes `action` once `timeout` elapses.
///
/// The deadline is carried by a dedicated background thread parked on a condition variable.
/// Dropping the returned handle disarms the deadline; a disarmed deadline never invokes the
/// action. The action runs on the timer thread, so it must be short and must not block.
pub(crate) fn arm<F>(timeout: Duration, action: F) -> DeadlineHandle
where
    F: FnOnce() + Send + 'static,
{
    let shared = Arc::new((Mutex::new(false), Condvar::new()));
    let thread_shared = Arc::clone(&shared);

    thread::spawn(move || {
        let (disarmed, signal) = &*thread_shared;

        let mut disarmed = disarmed.lock().expect(ERR_POISONED_LOCK);
        let mut remaining = timeout;

        loop {
            if *disarmed {
                return;
            }

            let started = std::time::Instant::now();
            let (guard, wait) = signal
                .wait_timeout(disarmed, remaining)
                .expect(ERR_POISONED_LOCK);
            disarmed = guard;

            if wait.timed_out() {
                break;
            }

            // Spurious or disarm wakeup; recompute how long is left before going back to sleep.
            remaining = remaining.saturating_sub(started.elapsed());
        }

        if !*disarmed {
            drop(disarmed);
            action();
        }
    });

    DeadlineHandle { shared }
}

/// Disarms the associated deadline when dropped.
#[derive(Debug)]
pub(crate) struct DeadlineHandle {
    shared: Arc<(Mutex<bool>, Condvar)>,
}

impl Drop for DeadlineHandle {
    fn drop(&mut self) {
        let (disarmed, signal) = &*self.shared;
        *disarmed.lock().expect(ERR_POISONED_LOCK) = true;
        signal.notify_one();
    }
}

/// Suspends the calling task for `timeout`.
///
/// This is the minimal async sleep the batching paths need; it is not a general timer wheel.
pub(crate) async fn sleep(timeout: Duration) {
    let fired = Arc::new(AtomicBool::new(false));
    let waker = Arc::new(AtomicWaker::new());

    let timer_fired = Arc::clone(&fired);
    let timer_waker = Arc::clone(&waker);
    let handle = arm(timeout, move || {
        timer_fired.store(true, Ordering::Release);
        timer_waker.wake();
    });

    std::future::poll_fn(move |cx| {
        // Keep the deadline armed for as long as the future is alive.
        let _armed = &handle;

        if fired.load(Ordering::Acquire) {
            return std::task::Poll::Ready(());
        }

        waker.register(cx.waker());

        if fired.load(Ordering::Acquire) {
            std::task::Poll::Ready(())
        } else {
            std::task::Poll::Pending
        }
    })
    .await;
}
