// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{self, Poll};
use std::time::Duration;

use crate::drain::{Drain, DrainLatch};
use crate::error::{AcquireError, AcquireResult};
use crate::waiter::{Entry, Lease, WaitState, WaiterPool};
use crate::{CancellationSource, CancellationToken, ERR_POISONED_LOCK, Registration};

/// A bounded counting semaphore whose acquire suspends instead of blocking.
///
/// [`take`][Self::take] yields a [`SemaphoreGuard`] that returns the unit when dropped.
/// Suspended takers form a first-in-first-out queue; a released unit is handed directly to
/// the oldest live waiter, and the synchronous fast path is only taken when nobody is
/// queued, so late arrivals cannot barge past waiters.
///
/// With `max_count == 1` the semaphore behaves as a mutex.
#[derive(Debug)]
pub struct Semaphore {
    inner: Mutex<Inner>,
    pool: WaiterPool,
    drain: DrainLatch,
}

#[derive(Debug)]
struct Inner {
    current: usize,
    max: usize,
    closed: bool,
    queue: VecDeque<Entry>,
}

impl Inner {
    /// Discards cancelled and recycled entries from the head of the queue so the fast-path
    /// "anyone waiting?" check does not observe ghosts.
    fn prune_dead(&mut self) {
        while let Some(front) = self.queue.front() {
            if front.is_live() {
                break;
            }
            self.queue.pop_front();
        }
    }

    fn can_take(&mut self) -> bool {
        self.prune_dead();
        !self.closed && self.queue.is_empty() && self.current < self.max
    }
}

impl Semaphore {
    /// Creates a semaphore admitting up to `max_count` concurrent holders.
    ///
    /// # Panics
    ///
    /// Panics if `max_count` is zero.
    #[must_use]
    pub fn new(max_count: usize) -> Self {
        assert!(max_count >= 1, "a semaphore requires max_count >= 1");

        Self {
            inner: Mutex::new(Inner {
                current: 0,
                max: max_count,
                closed: false,
                queue: VecDeque::new(),
            }),
            pool: WaiterPool::new(),
            drain: DrainLatch::new(),
        }
    }

    /// The configured limit.
    #[must_use]
    pub fn max_count(&self) -> usize {
        self.inner.lock().expect(ERR_POISONED_LOCK).max
    }

    /// How many units are currently held.
    #[must_use]
    pub fn current_count(&self) -> usize {
        self.inner.lock().expect(ERR_POISONED_LOCK).current
    }

    /// Whether [`close`][Self::close] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect(ERR_POISONED_LOCK).closed
    }

    /// Takes a unit, suspending while the semaphore is full or a waiter is queued ahead.
    pub fn take(&self, token: &CancellationToken) -> Take<'_> {
        Take {
            semaphore: self,
            token: token.clone(),
            stage: TakeStage::Init,
        }
    }

    /// Takes a unit if one is immediately available and nobody is queued.
    pub fn try_take(&self) -> Option<SemaphoreGuard<'_>> {
        let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);

        if inner.can_take() {
            inner.current += 1;
            Some(SemaphoreGuard { semaphore: self })
        } else {
            None
        }
    }

    /// Blocks the calling thread for up to `timeout` waiting for a unit.
    ///
    /// This is the synchronous entry point for callers that are not suspending; it is built
    /// from the suspending path plus a linked deadline source. Returns `None` on timeout or
    /// if the semaphore closes while waiting.
    pub fn try_take_for(&self, timeout: Duration) -> Option<SemaphoreGuard<'_>> {
        if let Some(guard) = self.try_take() {
            return Some(guard);
        }

        let source = CancellationSource::new();
        source.cancel_after(timeout);

        futures::executor::block_on(self.take(&source.token())).ok()
    }

    /// Adjusts the limit at runtime.
    ///
    /// Raising the limit hands the new units to queued waiters. Lowering it is advisory:
    /// live guards are never revoked; new takes are simply gated by the new limit until
    /// releases bring the held count below it.
    ///
    /// # Panics
    ///
    /// Panics if `max_count` is zero.
    pub fn set_max_count(&self, max_count: usize) {
        assert!(max_count >= 1, "a semaphore requires max_count >= 1");

        let woken = {
            let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);
            inner.max = max_count;

            let mut woken = Vec::new();
            while !inner.closed && inner.current < inner.max {
                let Some(entry) = inner.queue.pop_front() else {
                    break;
                };

                if entry.grant_quietly() {
                    inner.current += 1;
                    woken.push(entry);
                }
            }

            woken
        };

        for entry in woken {
            entry.wake();
        }
    }

    /// Closes the semaphore: pending takes fault with [`AcquireError::Closed`], new takes
    /// fail, and the returned drain future completes once every held unit is released.
    /// Idempotent; a second call returns the same drain.
    pub fn close(&self) -> Drain<'_> {
        let (faulted, drained) = {
            let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);

            if inner.closed {
                (Vec::new(), false)
            } else {
                inner.closed = true;
                let faulted: Vec<Entry> = inner.queue.drain(..).collect();
                let drained = inner.current == 0;
                (faulted, drained)
            }
        };

        if !faulted.is_empty() {
            tracing::debug!(waiters = faulted.len(), "semaphore closed with pending takes");
        }

        for entry in faulted {
            entry.fault_closed();
        }

        if drained {
            self.drain.complete();
        }

        self.drain.wait()
    }

    /// Returns one unit: hands it to the oldest live waiter, or decrements the held count.
    fn release_unit(&self) {
        let (granted, drained) = {
            let mut inner = self.inner.lock().expect(ERR_POISONED_LOCK);

            let mut granted = None;
            while let Some(entry) = inner.queue.pop_front() {
                if entry.grant_quietly() {
                    granted = Some(entry);
                    break;
                }
            }

            if granted.is_some() {
                // Ownership transfer: the unit moves to the waiter, the held count is
                // unchanged.
                (granted, false)
            } else {
                assert!(inner.current > 0, "semaphore released more units than taken");
                inner.current -= 1;
                (None, inner.closed && inner.current == 0)
            }
        };

        if let Some(entry) = granted {
            entry.wake();
        }

        if drained {
            self.drain.complete();
        }
    }
}

/// Scoped release handle returned by the take operations; dropping it returns the unit.
///
/// Leaking the guard (`std::mem::forget`) leaves the unit held forever; the semaphore does
/// not attempt to recover it.
#[derive(Debug)]
#[must_use = "dropping the guard immediately returns the unit"]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.release_unit();
    }
}

#[derive(Debug)]
enum TakeStage {
    Init,
    Waiting {
        lease: Lease,
        _registration: Registration,
    },
    Done,
}

/// Future returned by [`Semaphore::take`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct Take<'a> {
    semaphore: &'a Semaphore,
    token: CancellationToken,
    stage: TakeStage,
}

impl<'a> Future for Take<'a> {
    type Output = AcquireResult<SemaphoreGuard<'a>>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match &this.stage {
                TakeStage::Init => {
                    if this.token.is_cancelled() {
                        this.stage = TakeStage::Done;
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }

                    let lease = {
                        let mut inner = this.semaphore.inner.lock().expect(ERR_POISONED_LOCK);

                        if inner.closed {
                            this.stage = TakeStage::Done;
                            return Poll::Ready(Err(AcquireError::Closed));
                        }

                        if inner.can_take() {
                            inner.current += 1;
                            this.stage = TakeStage::Done;
                            return Poll::Ready(Ok(SemaphoreGuard {
                                semaphore: this.semaphore,
                            }));
                        }

                        let lease = this.semaphore.pool.lease();
                        lease.register(cx.waker());
                        inner.queue.push_back(lease.entry());
                        lease
                    };

                    let entry = lease.entry();
                    let registration = this.token.register(move || {
                        entry.cancel();
                    });

                    this.stage = TakeStage::Waiting {
                        lease,
                        _registration: registration,
                    };
                    // Fall through to observe a token that fired during registration.
                }
                TakeStage::Waiting { lease, .. } => match lease.state() {
                    WaitState::Pending => {
                        lease.register(cx.waker());

                        if lease.state() == WaitState::Pending {
                            return Poll::Pending;
                        }
                    }
                    WaitState::Granted => {
                        this.settle();
                        return Poll::Ready(Ok(SemaphoreGuard {
                            semaphore: this.semaphore,
                        }));
                    }
                    WaitState::Cancelled => {
                        this.settle();
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }
                    WaitState::Closed => {
                        this.settle();
                        return Poll::Ready(Err(AcquireError::Closed));
                    }
                    WaitState::Idle => unreachable!("leased waiter observed as idle"),
                },
                TakeStage::Done => panic!("future polled after completion"),
            }
        }
    }
}

impl Take<'_> {
    fn settle(&mut self) {
        if let TakeStage::Waiting { lease, .. } =
            std::mem::replace(&mut self.stage, TakeStage::Done)
        {
            if lease.state() != WaitState::Granted {
                let mut inner = self.semaphore.inner.lock().expect(ERR_POISONED_LOCK);
                inner.queue.retain(|entry| !lease.owns(entry));
            }

            self.semaphore.pool.recycle(lease);
        }
    }
}

impl Drop for Take<'_> {
    fn drop(&mut self) {
        if let TakeStage::Waiting { lease, .. } =
            std::mem::replace(&mut self.stage, TakeStage::Done)
        {
            if lease.transition(WaitState::Pending, WaitState::Cancelled) {
                let mut inner = self.semaphore.inner.lock().expect(ERR_POISONED_LOCK);
                inner.queue.retain(|entry| !lease.owns(entry));
            } else if lease.state() == WaitState::Granted {
                // The unit was handed to us but never observed; pass it on.
                self.semaphore.release_unit();
            }

            self.semaphore.pool.recycle(lease);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::task::Context;

    use futures::FutureExt;
    use futures::task::noop_waker_ref;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Semaphore: Send, Sync);
    assert_impl_all!(SemaphoreGuard<'static>: Send);

    fn token() -> CancellationToken {
        CancellationToken::none()
    }

    #[test]
    fn take_and_release_round_trip() {
        let semaphore = Semaphore::new(2);

        let guard = semaphore.try_take().unwrap();
        assert_eq!(semaphore.current_count(), 1);

        drop(guard);
        assert_eq!(semaphore.current_count(), 0);
    }

    #[test]
    fn released_units_go_to_waiters_in_fifo_order() {
        let semaphore = Semaphore::new(1);
        let cx = &mut Context::from_waker(noop_waker_ref());

        let first = semaphore.try_take().unwrap();

        let mut second = Box::pin(semaphore.take(&token()));
        let mut third = Box::pin(semaphore.take(&token()));
        assert!(second.poll_unpin(cx).is_pending());
        assert!(third.poll_unpin(cx).is_pending());

        drop(first);

        let second_guard = match second.poll_unpin(cx) {
            Poll::Ready(Ok(guard)) => guard,
            other => panic!("second waiter should hold the unit, got {other:?}"),
        };
        assert!(third.poll_unpin(cx).is_pending());

        drop(second_guard);
        assert!(matches!(third.poll_unpin(cx), Poll::Ready(Ok(_))));
    }

    #[test]
    fn fast_path_does_not_barge_past_waiters() {
        let semaphore = Semaphore::new(1);
        let cx = &mut Context::from_waker(noop_waker_ref());

        let held = semaphore.try_take().unwrap();
        let mut waiting = Box::pin(semaphore.take(&token()));
        assert!(waiting.poll_unpin(cx).is_pending());

        drop(held);

        // The released unit already belongs to the queued waiter.
        assert!(semaphore.try_take().is_none());
        assert!(matches!(waiting.poll_unpin(cx), Poll::Ready(Ok(_))));
    }

    #[test]
    fn cancelled_take_leaves_the_queue() {
        let semaphore = Semaphore::new(1);
        let source = CancellationSource::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let held = semaphore.try_take().unwrap();
        let mut waiting = Box::pin(semaphore.take(&source.token()));
        assert!(waiting.poll_unpin(cx).is_pending());

        source.cancel();
        assert!(matches!(
            waiting.poll_unpin(cx),
            Poll::Ready(Err(AcquireError::Cancelled))
        ));

        drop(held);
        assert!(semaphore.try_take().is_some());
    }

    #[test]
    fn raising_the_limit_releases_waiters() {
        let semaphore = Semaphore::new(1);
        let cx = &mut Context::from_waker(noop_waker_ref());

        let _held = semaphore.try_take().unwrap();
        let mut waiting = Box::pin(semaphore.take(&token()));
        assert!(waiting.poll_unpin(cx).is_pending());

        semaphore.set_max_count(2);

        assert!(matches!(waiting.poll_unpin(cx), Poll::Ready(Ok(_))));
        assert_eq!(semaphore.max_count(), 2);
    }

    #[test]
    fn lowering_the_limit_never_revokes_live_guards() {
        let semaphore = Semaphore::new(2);

        let first = semaphore.try_take().unwrap();
        let _second = semaphore.try_take().unwrap();

        semaphore.set_max_count(1);
        assert_eq!(semaphore.current_count(), 2);

        // New takes are gated by the new limit until releases catch up.
        assert!(semaphore.try_take().is_none());
        drop(first);
        assert!(semaphore.try_take().is_none());
    }

    #[test]
    fn close_faults_waiters_and_drains_after_last_release() {
        let semaphore = Semaphore::new(1);
        let cx = &mut Context::from_waker(noop_waker_ref());

        let held = semaphore.try_take().unwrap();
        let mut waiting = Box::pin(semaphore.take(&token()));
        assert!(waiting.poll_unpin(cx).is_pending());

        let mut drain = Box::pin(semaphore.close());
        assert!(matches!(
            waiting.poll_unpin(cx),
            Poll::Ready(Err(AcquireError::Closed))
        ));
        assert!(drain.poll_unpin(cx).is_pending());

        drop(held);
        assert_eq!(drain.poll_unpin(cx), Poll::Ready(()));

        assert!(semaphore.try_take().is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let semaphore = Semaphore::new(1);
        let cx = &mut Context::from_waker(noop_waker_ref());

        let mut first = Box::pin(semaphore.close());
        let mut second = Box::pin(semaphore.close());

        assert_eq!(first.poll_unpin(cx), Poll::Ready(()));
        assert_eq!(second.poll_unpin(cx), Poll::Ready(()));
    }

    #[test]
    fn try_take_for_times_out() {
        let semaphore = Semaphore::new(1);

        let _held = semaphore.try_take().unwrap();
        let started = std::time::Instant::now();

        assert!(
            semaphore
                .try_take_for(Duration::from_millis(30))
                .is_none()
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn try_take_for_succeeds_when_free() {
        let semaphore = Semaphore::new(1);

        let guard = semaphore.try_take_for(Duration::from_millis(30));
        assert!(guard.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_holders_never_exceed_the_limit() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let semaphore = Arc::new(Semaphore::new(3));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..24 {
            let semaphore = Arc::clone(&semaphore);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);

            tasks.push(tokio::spawn(async move {
                let _guard = semaphore.take(&CancellationToken::none()).await.unwrap();

                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(semaphore.current_count(), 0);
    }
}
