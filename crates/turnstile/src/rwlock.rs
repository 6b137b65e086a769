// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::task::{self, Poll};

use crate::drain::{Drain, DrainLatch};
use crate::error::{AcquireError, AcquireResult};
use crate::waiter::{Entry, Lease, WaitState, WaiterPool};
use crate::{CancellationToken, ERR_POISONED_LOCK, Registration};

/// A shared/exclusive lock whose acquires suspend instead of blocking.
///
/// Any number of readers may hold the lock together; a writer holds it alone. Queued writers
/// form a first-in-first-out queue; queued readers form a cohort that is promoted in a
/// single step when the lock becomes readable.
///
/// # Fairness
///
/// In the default fair mode, a reader arriving while any writer is queued must queue behind
/// it, so writers cannot be starved by a continuous stream of readers. The
/// [`new_unfair`][Self::new_unfair] variant lets readers join an ongoing read even past
/// queued writers, trading potential writer starvation for lower reader tail latency.
///
/// # State encoding
///
/// A signed word carries the mode: `N > 0` means `N` readers hold the lock, `0` means idle,
/// `-1` means one writer holds it exclusively.
#[derive(Debug)]
pub struct RwLock {
    state: AtomicI64,
    queues: Mutex<Queues>,

    // Mirror of the writer queue length, maintained under the queue lock, so the lock-free
    // reader join can consult fairness without taking the lock.
    queued_writers: AtomicUsize,

    fair: bool,
    closed: AtomicBool,
    pool: WaiterPool,
    drain: DrainLatch,
}

#[derive(Debug)]
struct Queues {
    writers: VecDeque<Entry>,
    readers: Vec<Entry>,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    /// Creates a fair lock: queued writers gate new readers.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fairness(true)
    }

    /// Creates an unfair lock: readers may join an ongoing read past queued writers.
    /// Sustained reading can starve writers; prefer [`new`][Self::new] unless reader
    /// latency dominates.
    #[must_use]
    pub fn new_unfair() -> Self {
        Self::with_fairness(false)
    }

    fn with_fairness(fair: bool) -> Self {
        Self {
            state: AtomicI64::new(0),
            queues: Mutex::new(Queues {
                writers: VecDeque::new(),
                readers: Vec::new(),
            }),
            queued_writers: AtomicUsize::new(0),
            fair,
            closed: AtomicBool::new(false),
            pool: WaiterPool::new(),
            drain: DrainLatch::new(),
        }
    }

    /// How many readers currently hold the lock.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        let current = self.state.load(Ordering::Acquire);
        usize::try_from(current.max(0)).expect("clamped to non-negative")
    }

    /// Whether a writer currently holds the lock.
    #[must_use]
    pub fn is_write_held(&self) -> bool {
        self.state.load(Ordering::Acquire) == -1
    }

    /// Whether [`close`][Self::close] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Acquires the lock in shared mode.
    pub fn read(&self, token: &CancellationToken) -> LockRead<'_> {
        LockRead {
            lock: self,
            token: token.clone(),
            stage: Stage::Init,
        }
    }

    /// Acquires the lock in exclusive mode. Writers are served first-in-first-out.
    pub fn write(&self, token: &CancellationToken) -> LockWrite<'_> {
        LockWrite {
            lock: self,
            token: token.clone(),
            stage: Stage::Init,
        }
    }

    /// Closes the lock: pending acquires fault with [`AcquireError::Closed`], new acquires
    /// fail, and the returned drain future completes once the last guard is released.
    /// Idempotent.
    pub fn close(&self) -> Drain<'_> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let faulted = {
                let mut queues = self.queues.lock().expect(ERR_POISONED_LOCK);
                let mut faulted: Vec<Entry> = queues.writers.drain(..).collect();
                faulted.extend(queues.readers.drain(..));
                self.queued_writers.store(0, Ordering::Release);
                faulted
            };

            tracing::debug!(waiters = faulted.len(), "read/write lock closed");

            for entry in faulted {
                entry.fault_closed();
            }

            if self.state.load(Ordering::Acquire) == 0 {
                self.drain.complete();
            }
        }

        self.drain.wait()
    }

    fn release_read(&self) {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= 1, "read release without a read hold");

        if previous == 1 {
            self.rebalance();
        }
    }

    fn release_write(&self) {
        let (wakes, drained) = {
            let mut queues = self.queues.lock().expect(ERR_POISONED_LOCK);
            debug_assert!(
                self.state.load(Ordering::Acquire) == -1,
                "write release without a write hold"
            );

            // Hand the exclusive hold straight to the next live writer; the state word
            // never visits idle in that case.
            let mut handed = None;
            loop {
                self.prune_writers(&mut queues);
                let Some(entry) = queues.writers.pop_front() else {
                    break;
                };
                self.queued_writers.store(queues.writers.len(), Ordering::Release);

                if entry.grant_quietly() {
                    handed = Some(entry);
                    break;
                }
            }

            if let Some(entry) = handed {
                (vec![entry], false)
            } else {
                self.state.store(0, Ordering::Release);
                let wakes = self.promote_readers_locked(&mut queues);
                let drained = wakes.is_empty() && self.closed.load(Ordering::SeqCst);
                (wakes, drained)
            }
        };

        for entry in wakes {
            entry.wake();
        }

        if drained {
            self.drain.complete();
        }
    }

    /// Re-evaluates who may run after the lock went idle or a queued waiter went away.
    fn rebalance(&self) {
        let (wakes, drained) = {
            let mut queues = self.queues.lock().expect(ERR_POISONED_LOCK);
            let current = self.state.load(Ordering::Acquire);

            let wakes = if current == 0 {
                self.promote_locked(&mut queues)
            } else if current > 0 {
                // Readers hold the lock; if no live writer is queued any more, the queued
                // readers may join the running cohort.
                self.prune_writers(&mut queues);
                if queues.writers.is_empty() {
                    self.promote_readers_locked(&mut queues)
                } else {
                    Vec::new()
                }
            } else {
                Vec::new()
            };

            let drained = self.closed.load(Ordering::SeqCst)
                && self.state.load(Ordering::Acquire) == 0;
            (wakes, drained)
        };

        for entry in wakes {
            entry.wake();
        }

        if drained {
            self.drain.complete();
        }
    }

    /// Promotion from idle: writers first, then the whole reader cohort. Caller holds the
    /// queue lock and the state word is `0`.
    fn promote_locked(&self, queues: &mut Queues) -> Vec<Entry> {
        loop {
            self.prune_writers(queues);
            let Some(entry) = queues.writers.pop_front() else {
                break;
            };
            self.queued_writers.store(queues.writers.len(), Ordering::Release);

            // Publish the exclusive hold before waking; revert if the waiter was
            // cancelled between the liveness check and the grant.
            self.state.store(-1, Ordering::Release);
            if entry.grant_quietly() {
                return vec![entry];
            }
            self.state.store(0, Ordering::Release);
        }

        self.promote_readers_locked(queues)
    }

    /// Adopts every queued live reader as the running cohort. Caller holds the queue lock
    /// and the state word is non-negative.
    fn promote_readers_locked(&self, queues: &mut Queues) -> Vec<Entry> {
        let mut woken = Vec::new();

        for entry in queues.readers.drain(..) {
            // Count the share before granting so a granted reader that releases
            // immediately never drives the state word negative.
            self.state.fetch_add(1, Ordering::AcqRel);
            if entry.grant_quietly() {
                woken.push(entry);
            } else {
                self.state.fetch_sub(1, Ordering::AcqRel);
            }
        }

        if woken.len() > 1 {
            tracing::debug!(readers = woken.len(), "promoted reader cohort");
        }

        woken
    }

    fn prune_writers(&self, queues: &mut Queues) {
        while let Some(front) = queues.writers.front() {
            if front.is_live() {
                break;
            }
            queues.writers.pop_front();
        }

        self.queued_writers.store(queues.writers.len(), Ordering::Release);
    }
}

/// Shared-mode guard returned by [`RwLock::read`]; dropping it releases the read share.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the read share"]
pub struct ReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive-mode guard returned by [`RwLock::write`]; dropping it releases the lock.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the lock"]
pub struct WriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[derive(Debug)]
enum Stage {
    Init,
    Waiting {
        lease: Lease,
        _registration: Registration,
    },
    Done,
}

/// Future returned by [`RwLock::read`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct LockRead<'a> {
    lock: &'a RwLock,
    token: CancellationToken,
    stage: Stage,
}

impl<'a> Future for LockRead<'a> {
    type Output = AcquireResult<ReadGuard<'a>>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match &this.stage {
                Stage::Init => {
                    if this.token.is_cancelled() {
                        this.stage = Stage::Done;
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }

                    if this.lock.is_closed() {
                        this.stage = Stage::Done;
                        return Poll::Ready(Err(AcquireError::Closed));
                    }

                    // Lock-free join of an ongoing read.
                    let mut current = this.lock.state.load(Ordering::Acquire);
                    while current > 0
                        && (!this.lock.fair
                            || this.lock.queued_writers.load(Ordering::Acquire) == 0)
                    {
                        match this.lock.state.compare_exchange_weak(
                            current,
                            current + 1,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                this.stage = Stage::Done;
                                return Poll::Ready(Ok(ReadGuard { lock: this.lock }));
                            }
                            Err(observed) => current = observed,
                        }
                    }

                    let lease = {
                        let mut queues = this.lock.queues.lock().expect(ERR_POISONED_LOCK);

                        if this.lock.is_closed() {
                            this.stage = Stage::Done;
                            return Poll::Ready(Err(AcquireError::Closed));
                        }

                        this.lock.prune_writers(&mut queues);
                        let writers_queued = !queues.writers.is_empty();
                        let current = this.lock.state.load(Ordering::Acquire);

                        if current >= 0 && (!this.lock.fair || !writers_queued) {
                            // Writers cannot start while we hold the queue lock, so the
                            // non-negative state word cannot turn exclusive under us.
                            this.lock.state.fetch_add(1, Ordering::AcqRel);
                            this.stage = Stage::Done;
                            return Poll::Ready(Ok(ReadGuard { lock: this.lock }));
                        }

                        let lease = this.lock.pool.lease();
                        lease.register(cx.waker());
                        queues.readers.push(lease.entry());
                        lease
                    };

                    let entry = lease.entry();
                    let registration = this.token.register(move || {
                        entry.cancel();
                    });

                    this.stage = Stage::Waiting {
                        lease,
                        _registration: registration,
                    };
                }
                Stage::Waiting { lease, .. } => match lease.state() {
                    WaitState::Pending => {
                        lease.register(cx.waker());

                        if lease.state() == WaitState::Pending {
                            return Poll::Pending;
                        }
                    }
                    WaitState::Granted => {
                        this.settle(false);
                        return Poll::Ready(Ok(ReadGuard { lock: this.lock }));
                    }
                    WaitState::Cancelled => {
                        this.settle(true);
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }
                    WaitState::Closed => {
                        this.settle(false);
                        return Poll::Ready(Err(AcquireError::Closed));
                    }
                    WaitState::Idle => unreachable!("leased waiter observed as idle"),
                },
                Stage::Done => panic!("future polled after completion"),
            }
        }
    }
}

impl LockRead<'_> {
    fn settle(&mut self, rebalance: bool) {
        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.state() != WaitState::Granted {
                let mut queues = self.lock.queues.lock().expect(ERR_POISONED_LOCK);
                queues.readers.retain(|entry| !lease.owns(entry));
            }

            self.lock.pool.recycle(lease);
        }

        if rebalance {
            self.lock.rebalance();
        }
    }
}

impl Drop for LockRead<'_> {
    fn drop(&mut self) {
        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.transition(WaitState::Pending, WaitState::Cancelled) {
                {
                    let mut queues = self.lock.queues.lock().expect(ERR_POISONED_LOCK);
                    queues.readers.retain(|entry| !lease.owns(entry));
                }
                self.lock.pool.recycle(lease);
                self.lock.rebalance();
            } else {
                if lease.state() == WaitState::Granted {
                    // The share was handed to us but never observed; give it back.
                    self.lock.release_read();
                }
                self.lock.pool.recycle(lease);
            }
        }
    }
}

/// Future returned by [`RwLock::write`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct LockWrite<'a> {
    lock: &'a RwLock,
    token: CancellationToken,
    stage: Stage,
}

impl<'a> Future for LockWrite<'a> {
    type Output = AcquireResult<WriteGuard<'a>>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match &this.stage {
                Stage::Init => {
                    if this.token.is_cancelled() {
                        this.stage = Stage::Done;
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }

                    if this.lock.is_closed() {
                        this.stage = Stage::Done;
                        return Poll::Ready(Err(AcquireError::Closed));
                    }

                    let lease = {
                        let mut queues = this.lock.queues.lock().expect(ERR_POISONED_LOCK);

                        if this.lock.is_closed() {
                            this.stage = Stage::Done;
                            return Poll::Ready(Err(AcquireError::Closed));
                        }

                        this.lock.prune_writers(&mut queues);

                        if this.lock.state.load(Ordering::Acquire) == 0
                            && queues.writers.is_empty()
                        {
                            // Reader joins require a positive word and writer starts hold
                            // the queue lock, so idle is stable here.
                            this.lock.state.store(-1, Ordering::Release);
                            this.stage = Stage::Done;
                            return Poll::Ready(Ok(WriteGuard { lock: this.lock }));
                        }

                        let lease = this.lock.pool.lease();
                        lease.register(cx.waker());
                        queues.writers.push_back(lease.entry());
                        this.lock
                            .queued_writers
                            .store(queues.writers.len(), Ordering::Release);
                        lease
                    };

                    let entry = lease.entry();
                    let registration = this.token.register(move || {
                        entry.cancel();
                    });

                    this.stage = Stage::Waiting {
                        lease,
                        _registration: registration,
                    };
                }
                Stage::Waiting { lease, .. } => match lease.state() {
                    WaitState::Pending => {
                        lease.register(cx.waker());

                        if lease.state() == WaitState::Pending {
                            return Poll::Pending;
                        }
                    }
                    WaitState::Granted => {
                        this.settle(false);
                        return Poll::Ready(Ok(WriteGuard { lock: this.lock }));
                    }
                    WaitState::Cancelled => {
                        this.settle(true);
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }
                    WaitState::Closed => {
                        this.settle(false);
                        return Poll::Ready(Err(AcquireError::Closed));
                    }
                    WaitState::Idle => unreachable!("leased waiter observed as idle"),
                },
                Stage::Done => panic!("future polled after completion"),
            }
        }
    }
}

impl LockWrite<'_> {
    fn settle(&mut self, rebalance: bool) {
        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.state() != WaitState::Granted {
                let mut queues = self.lock.queues.lock().expect(ERR_POISONED_LOCK);
                queues.writers.retain(|entry| !lease.owns(entry));
                self.lock
                    .queued_writers
                    .store(queues.writers.len(), Ordering::Release);
            }

            self.lock.pool.recycle(lease);
        }

        if rebalance {
            self.lock.rebalance();
        }
    }
}

impl Drop for LockWrite<'_> {
    fn drop(&mut self) {
        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.transition(WaitState::Pending, WaitState::Cancelled) {
                {
                    let mut queues = self.lock.queues.lock().expect(ERR_POISONED_LOCK);
                    queues.writers.retain(|entry| !lease.owns(entry));
                    self.lock
                        .queued_writers
                        .store(queues.writers.len(), Ordering::Release);
                }
                self.lock.pool.recycle(lease);
                self.lock.rebalance();
            } else {
                if lease.state() == WaitState::Granted {
                    self.lock.release_write();
                }
                self.lock.pool.recycle(lease);
            }
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
    use crate::CancellationSource;

    assert_impl_all!(RwLock: Send, Sync);
    assert_impl_all!(ReadGuard<'static>: Send);
    assert_impl_all!(WriteGuard<'static>: Send);

    fn token() -> CancellationToken {
        CancellationToken::none()
    }

    fn read_now<'a>(lock: &'a RwLock) -> ReadGuard<'a> {
        let cx = &mut Context::from_waker(noop_waker_ref());
        match Box::pin(lock.read(&token())).poll_unpin(cx) {
            Poll::Ready(Ok(guard)) => guard,
            other => panic!("expected immediate read grant, got {other:?}"),
        }
    }

    fn write_now<'a>(lock: &'a RwLock) -> WriteGuard<'a> {
        let cx = &mut Context::from_waker(noop_waker_ref());
        match Box::pin(lock.write(&token())).poll_unpin(cx) {
            Poll::Ready(Ok(guard)) => guard,
            other => panic!("expected immediate write grant, got {other:?}"),
        }
    }

    #[test]
    fn readers_share_writers_exclude() {
        let lock = RwLock::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let first = read_now(&lock);
        let second = read_now(&lock);
        assert_eq!(lock.reader_count(), 2);

        let mut writer = Box::pin(lock.write(&token()));
        assert!(writer.poll_unpin(cx).is_pending());

        drop(first);
        assert!(writer.poll_unpin(cx).is_pending());

        drop(second);
        assert!(matches!(writer.poll_unpin(cx), Poll::Ready(Ok(_))));
        assert!(lock.is_write_held());
    }

    #[test]
    fn writer_handoff_skips_idle() {
        let lock = RwLock::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let first = write_now(&lock);
        let mut second = Box::pin(lock.write(&token()));
        assert!(second.poll_unpin(cx).is_pending());

        drop(first);

        assert!(lock.is_write_held());
        assert!(matches!(second.poll_unpin(cx), Poll::Ready(Ok(_))));
    }

    #[test]
    fn fair_mode_serves_writer_before_new_readers_then_promotes_cohort() {
        let lock = RwLock::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let readers: Vec<_> = (0..3).map(|_| read_now(&lock)).collect();

        let mut writer = Box::pin(lock.write(&token()));
        assert!(writer.poll_unpin(cx).is_pending());

        let mut late_a = Box::pin(lock.read(&token()));
        let mut late_b = Box::pin(lock.read(&token()));
        assert!(late_a.poll_unpin(cx).is_pending());
        assert!(late_b.poll_unpin(cx).is_pending());

        for reader in readers {
            drop(reader);
        }

        // The queued writer runs first.
        let write_guard = match writer.poll_unpin(cx) {
            Poll::Ready(Ok(guard)) => guard,
            other => panic!("writer should run before late readers, got {other:?}"),
        };
        assert!(late_a.poll_unpin(cx).is_pending());
        assert!(late_b.poll_unpin(cx).is_pending());

        drop(write_guard);

        // Both late readers resume together as one cohort.
        assert!(matches!(late_a.poll_unpin(cx), Poll::Ready(Ok(_))));
        assert!(matches!(late_b.poll_unpin(cx), Poll::Ready(Ok(_))));
        assert_eq!(lock.reader_count(), 2);
    }

    #[test]
    fn unfair_readers_join_past_queued_writers() {
        let lock = RwLock::new_unfair();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let _reader = read_now(&lock);
        let mut writer = Box::pin(lock.write(&token()));
        assert!(writer.poll_unpin(cx).is_pending());

        // In unfair mode the late reader barges past the queued writer.
        let _late = read_now(&lock);
        assert_eq!(lock.reader_count(), 2);
    }

    #[test]
    fn fair_readers_queue_behind_writers() {
        let lock = RwLock::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let _reader = read_now(&lock);
        let mut writer = Box::pin(lock.write(&token()));
        assert!(writer.poll_unpin(cx).is_pending());

        let mut late = Box::pin(lock.read(&token()));
        assert!(late.poll_unpin(cx).is_pending());
    }

    #[test]
    fn cancelled_writer_unblocks_queued_readers() {
        let lock = RwLock::new();
        let source = CancellationSource::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let _reader = read_now(&lock);

        let mut writer = Box::pin(lock.write(&source.token()));
        assert!(writer.poll_unpin(cx).is_pending());

        let mut late = Box::pin(lock.read(&token()));
        assert!(late.poll_unpin(cx).is_pending());

        source.cancel();
        assert!(matches!(
            writer.poll_unpin(cx),
            Poll::Ready(Err(AcquireError::Cancelled))
        ));

        // With the only writer gone, the queued reader joins the ongoing read.
        assert!(matches!(late.poll_unpin(cx), Poll::Ready(Ok(_))));
        assert_eq!(lock.reader_count(), 2);
    }

    #[test]
    fn cancelled_reader_releases_nothing() {
        let lock = RwLock::new();
        let source = CancellationSource::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let writer = write_now(&lock);

        let mut reader = Box::pin(lock.read(&source.token()));
        assert!(reader.poll_unpin(cx).is_pending());

        source.cancel();
        assert!(matches!(
            reader.poll_unpin(cx),
            Poll::Ready(Err(AcquireError::Cancelled))
        ));

        drop(writer);
        assert_eq!(lock.reader_count(), 0);
        assert!(!lock.is_write_held());
    }

    #[test]
    fn close_faults_waiters_and_drains_after_release() {
        let lock = RwLock::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let guard = write_now(&lock);
        let mut reader = Box::pin(lock.read(&token()));
        assert!(reader.poll_unpin(cx).is_pending());

        let mut drain = Box::pin(lock.close());
        assert!(matches!(
            reader.poll_unpin(cx),
            Poll::Ready(Err(AcquireError::Closed))
        ));
        assert!(drain.poll_unpin(cx).is_pending());

        drop(guard);
        assert_eq!(drain.poll_unpin(cx), Poll::Ready(()));

        let mut late = Box::pin(lock.read(&token()));
        assert!(matches!(
            late.poll_unpin(cx),
            Poll::Ready(Err(AcquireError::Closed))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writers_are_exclusive_under_contention() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let lock = Arc::new(RwLock::new());
        let in_critical = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for index in 0..16 {
            let lock = Arc::clone(&lock);
            let in_critical = Arc::clone(&in_critical);

            tasks.push(tokio::spawn(async move {
                if index % 4 == 0 {
                    let _guard = lock.write(&CancellationToken::none()).await.unwrap();
                    assert_eq!(in_critical.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::task::yield_now().await;
                    assert_eq!(in_critical.fetch_sub(1, Ordering::SeqCst), 1);
                } else {
                    let _guard = lock.read(&CancellationToken::none()).await.unwrap();
                    in_critical.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_critical.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(lock.reader_count(), 0);
        assert!(!lock.is_write_held());
    }
}
