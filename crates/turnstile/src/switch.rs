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

/// Which of the two mutually exclusive groups an acquire joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The left group; holders are counted positively.
    Left,
    /// The right group; holders are counted negatively.
    Right,
}

impl Side {
    /// The other group.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }

    fn sign(self) -> i64 {
        match self {
            Self::Left => 1,
            Self::Right => -1,
        }
    }
}

/// A bi-directional shared lock: two groups exclude each other but run concurrently within
/// a group.
///
/// Any number of left holders may run together, as may any number of right holders, but the
/// groups never overlap. When the last holder on one side releases, the entire waiting set
/// of the other side is promoted in a single step.
///
/// In the default fair mode, a waiter on the opposite side gates new same-side acquires, so
/// neither group can starve the other; the [`new_unfair`][Self::new_unfair] variant lets an
/// active group keep admitting members past opposite waiters.
#[derive(Debug)]
pub struct SwitchLock {
    // Positive = left holders, negative = right holders, zero = idle.
    state: AtomicI64,
    queues: Mutex<SideQueues>,

    // Mirrors of the waiting-set sizes, maintained under the queue lock, for the lock-free
    // same-side join.
    queued_left: AtomicUsize,
    queued_right: AtomicUsize,

    fair: bool,
    closed: AtomicBool,
    pool: WaiterPool,
    drain: DrainLatch,
}

#[derive(Debug)]
struct SideQueues {
    left: VecDeque<Entry>,
    right: VecDeque<Entry>,
}

impl SideQueues {
    fn side_mut(&mut self, side: Side) -> &mut VecDeque<Entry> {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

impl Default for SwitchLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchLock {
    /// Creates a fair switch lock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_fairness(true)
    }

    /// Creates an unfair switch lock; an active group admits members past opposite waiters.
    #[must_use]
    pub fn new_unfair() -> Self {
        Self::with_fairness(false)
    }

    fn with_fairness(fair: bool) -> Self {
        Self {
            state: AtomicI64::new(0),
            queues: Mutex::new(SideQueues {
                left: VecDeque::new(),
                right: VecDeque::new(),
            }),
            queued_left: AtomicUsize::new(0),
            queued_right: AtomicUsize::new(0),
            fair,
            closed: AtomicBool::new(false),
            pool: WaiterPool::new(),
            drain: DrainLatch::new(),
        }
    }

    /// How many holders the given side currently has.
    #[must_use]
    pub fn holders(&self, side: Side) -> usize {
        let current = self.state.load(Ordering::Acquire);
        let held = match side {
            Side::Left => current.max(0),
            Side::Right => (-current).max(0),
        };

        usize::try_from(held).expect("clamped to non-negative")
    }

    /// Whether [`close`][Self::close] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Joins `side`, suspending while the opposite side holds the lock (or, in fair mode,
    /// while the opposite side has waiters).
    pub fn lock(&self, side: Side, token: &CancellationToken) -> LockSide<'_> {
        LockSide {
            lock: self,
            side,
            token: token.clone(),
            stage: Stage::Init,
        }
    }

    /// Shorthand for [`lock(Side::Left, ..)`][Self::lock].
    pub fn lock_left(&self, token: &CancellationToken) -> LockSide<'_> {
        self.lock(Side::Left, token)
    }

    /// Shorthand for [`lock(Side::Right, ..)`][Self::lock].
    pub fn lock_right(&self, token: &CancellationToken) -> LockSide<'_> {
        self.lock(Side::Right, token)
    }

    /// Closes the lock: pending acquires fault with [`AcquireError::Closed`], new acquires
    /// fail, and the returned drain future completes once the last holder releases.
    /// Idempotent.
    pub fn close(&self) -> Drain<'_> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let faulted = {
                let mut queues = self.queues.lock().expect(ERR_POISONED_LOCK);
                let mut faulted: Vec<Entry> = queues.left.drain(..).collect();
                faulted.extend(queues.right.drain(..));
                self.queued_left.store(0, Ordering::Release);
                self.queued_right.store(0, Ordering::Release);
                faulted
            };

            tracing::debug!(waiters = faulted.len(), "switch lock closed");

            for entry in faulted {
                entry.fault_closed();
            }

            if self.state.load(Ordering::Acquire) == 0 {
                self.drain.complete();
            }
        }

        self.drain.wait()
    }

    fn queued_mirror(&self, side: Side) -> &AtomicUsize {
        match side {
            Side::Left => &self.queued_left,
            Side::Right => &self.queued_right,
        }
    }

    fn release(&self, side: Side) {
        let previous = self.state.fetch_sub(side.sign(), Ordering::AcqRel);
        debug_assert!(
            previous.signum() == side.sign().signum(),
            "side release without a matching hold"
        );

        if previous == side.sign() {
            // Last holder on this side; the opposite side's waiting set is first in line.
            self.rebalance(side.opposite());
        }
    }

    /// Re-evaluates who may run, preferring `preferred` when the lock is idle.
    fn rebalance(&self, preferred: Side) {
        let (wakes, drained) = {
            let mut queues = self.queues.lock().expect(ERR_POISONED_LOCK);
            let current = self.state.load(Ordering::Acquire);

            let wakes = if current == 0 {
                let mut wakes = self.promote_side_locked(&mut queues, preferred);
                if wakes.is_empty() {
                    wakes = self.promote_side_locked(&mut queues, preferred.opposite());
                }
                wakes
            } else {
                // One side is running; if the opposite waiting set has emptied out, queued
                // same-side waiters may join the running cohort.
                let running = if current > 0 { Side::Left } else { Side::Right };
                self.prune_side(&mut queues, running.opposite());

                if queues.side_mut(running.opposite()).is_empty() {
                    self.promote_side_locked(&mut queues, running)
                } else {
                    Vec::new()
                }
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

    /// Promotes the entire waiting set of `side` into the running state. Caller holds the
    /// queue lock and the state word is zero or already carries `side`'s sign.
    fn promote_side_locked(&self, queues: &mut SideQueues, side: Side) -> Vec<Entry> {
        let sign = side.sign();
        let mut woken = Vec::new();

        let waiting = queues.side_mut(side);
        for entry in waiting.drain(..) {
            // Count the occupancy before granting so a holder that releases immediately
            // cannot cross zero while the promotion is still in flight.
            self.state.fetch_add(sign, Ordering::AcqRel);
            if entry.grant_quietly() {
                woken.push(entry);
            } else {
                self.state.fetch_sub(sign, Ordering::AcqRel);
            }
        }

        self.queued_mirror(side).store(0, Ordering::Release);

        if woken.len() > 1 {
            tracing::debug!(side = ?side, holders = woken.len(), "promoted switch cohort");
        }

        woken
    }

    fn prune_side(&self, queues: &mut SideQueues, side: Side) {
        let waiting = queues.side_mut(side);
        waiting.retain(Entry::is_live);
        self.queued_mirror(side).store(waiting.len(), Ordering::Release);
    }
}

/// Guard returned by the acquire operations; dropping it releases one hold on its side.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the hold"]
pub struct SwitchGuard<'a> {
    lock: &'a SwitchLock,
    side: Side,
}

impl SwitchGuard<'_> {
    /// Which side this guard holds.
    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.side);
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

/// Future returned by [`SwitchLock::lock`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct LockSide<'a> {
    lock: &'a SwitchLock,
    side: Side,
    token: CancellationToken,
    stage: Stage,
}

impl<'a> Future for LockSide<'a> {
    type Output = AcquireResult<SwitchGuard<'a>>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let side = this.side;
        let sign = side.sign();

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

                    // Lock-free join while this side is already running.
                    let mut current = this.lock.state.load(Ordering::Acquire);
                    while current.signum() == sign.signum()
                        && current != 0
                        && (!this.lock.fair
                            || this
                                .lock
                                .queued_mirror(side.opposite())
                                .load(Ordering::Acquire)
                                == 0)
                    {
                        match this.lock.state.compare_exchange_weak(
                            current,
                            current + sign,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                this.stage = Stage::Done;
                                return Poll::Ready(Ok(SwitchGuard {
                                    lock: this.lock,
                                    side,
                                }));
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

                        this.lock.prune_side(&mut queues, side.opposite());
                        let opposite_waiting = !queues.side_mut(side.opposite()).is_empty();
                        let current = this.lock.state.load(Ordering::Acquire);

                        let may_join = if current == 0 {
                            !opposite_waiting
                        } else {
                            current.signum() == sign.signum()
                                && (!this.lock.fair || !opposite_waiting)
                        };

                        if may_join {
                            // Opposite-side starts cross zero only under this lock, so the
                            // word cannot flip sign under us.
                            this.lock.state.fetch_add(sign, Ordering::AcqRel);
                            this.stage = Stage::Done;
                            return Poll::Ready(Ok(SwitchGuard {
                                lock: this.lock,
                                side,
                            }));
                        }

                        let lease = this.lock.pool.lease();
                        lease.register(cx.waker());
                        queues.side_mut(side).push_back(lease.entry());
                        let waiting = queues.side_mut(side).len();
                        this.lock.queued_mirror(side).store(waiting, Ordering::Release);
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
                        return Poll::Ready(Ok(SwitchGuard {
                            lock: this.lock,
                            side,
                        }));
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

impl LockSide<'_> {
    fn settle(&mut self, rebalance: bool) {
        let side = self.side;

        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.state() != WaitState::Granted {
                let mut queues = self.lock.queues.lock().expect(ERR_POISONED_LOCK);
                let waiting = queues.side_mut(side);
                waiting.retain(|entry| !lease.owns(entry));
                let remaining = waiting.len();
                self.lock.queued_mirror(side).store(remaining, Ordering::Release);
            }

            self.lock.pool.recycle(lease);
        }

        if rebalance {
            // The cancelled waiter may have been the last thing gating the other side.
            self.lock.rebalance(side.opposite());
        }
    }
}

impl Drop for LockSide<'_> {
    fn drop(&mut self) {
        let side = self.side;

        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.transition(WaitState::Pending, WaitState::Cancelled) {
                {
                    let mut queues = self.lock.queues.lock().expect(ERR_POISONED_LOCK);
                    let waiting = queues.side_mut(side);
                    waiting.retain(|entry| !lease.owns(entry));
                    let remaining = waiting.len();
                    self.lock.queued_mirror(side).store(remaining, Ordering::Release);
                }
                self.lock.pool.recycle(lease);
                self.lock.rebalance(side.opposite());
            } else {
                if lease.state() == WaitState::Granted {
                    self.lock.release(side);
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

    assert_impl_all!(SwitchLock: Send, Sync);
    assert_impl_all!(SwitchGuard<'static>: Send);

    fn token() -> CancellationToken {
        CancellationToken::none()
    }

    fn lock_now<'a>(lock: &'a SwitchLock, side: Side) -> SwitchGuard<'a> {
        let cx = &mut Context::from_waker(noop_waker_ref());
        match Box::pin(lock.lock(side, &token())).poll_unpin(cx) {
            Poll::Ready(Ok(guard)) => guard,
            other => panic!("expected immediate {side:?} grant, got {other:?}"),
        }
    }

    #[test]
    fn same_side_runs_concurrently() {
        let lock = SwitchLock::new();

        let first = lock_now(&lock, Side::Left);
        let second = lock_now(&lock, Side::Left);

        assert_eq!(lock.holders(Side::Left), 2);
        assert_eq!(lock.holders(Side::Right), 0);

        drop(first);
        drop(second);
        assert_eq!(lock.holders(Side::Left), 0);
    }

    #[test]
    fn opposite_sides_exclude_each_other() {
        let lock = SwitchLock::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let left = lock_now(&lock, Side::Left);

        let mut right = Box::pin(lock.lock_right(&token()));
        assert!(right.poll_unpin(cx).is_pending());

        drop(left);

        let guard = match right.poll_unpin(cx) {
            Poll::Ready(Ok(guard)) => guard,
            other => panic!("right should run once left releases, got {other:?}"),
        };
        assert_eq!(guard.side(), Side::Right);
        assert_eq!(lock.holders(Side::Right), 1);
    }

    #[test]
    fn last_release_promotes_the_whole_opposite_set() {
        let lock = SwitchLock::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let left_a = lock_now(&lock, Side::Left);
        let left_b = lock_now(&lock, Side::Left);

        let mut right_a = Box::pin(lock.lock_right(&token()));
        let mut right_b = Box::pin(lock.lock_right(&token()));
        assert!(right_a.poll_unpin(cx).is_pending());
        assert!(right_b.poll_unpin(cx).is_pending());

        drop(left_a);
        assert!(right_a.poll_unpin(cx).is_pending());

        drop(left_b);

        assert!(matches!(right_a.poll_unpin(cx), Poll::Ready(Ok(_))));
        assert!(matches!(right_b.poll_unpin(cx), Poll::Ready(Ok(_))));
        assert_eq!(lock.holders(Side::Right), 2);
    }

    #[test]
    fn fair_mode_gates_joins_while_opposite_waits() {
        let lock = SwitchLock::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let _left = lock_now(&lock, Side::Left);

        let mut right = Box::pin(lock.lock_right(&token()));
        assert!(right.poll_unpin(cx).is_pending());

        // A new left must queue behind the waiting right in fair mode.
        let mut late_left = Box::pin(lock.lock_left(&token()));
        assert!(late_left.poll_unpin(cx).is_pending());
    }

    #[test]
    fn unfair_mode_admits_joins_past_opposite_waiters() {
        let lock = SwitchLock::new_unfair();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let _left = lock_now(&lock, Side::Left);

        let mut right = Box::pin(lock.lock_right(&token()));
        assert!(right.poll_unpin(cx).is_pending());

        let _late_left = lock_now(&lock, Side::Left);
        assert_eq!(lock.holders(Side::Left), 2);
    }

    #[test]
    fn cancelling_the_last_holdup_frees_the_gated_side() {
        let lock = SwitchLock::new();
        let source = CancellationSource::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let _left = lock_now(&lock, Side::Left);

        let mut right = Box::pin(lock.lock_right(&source.token()));
        assert!(right.poll_unpin(cx).is_pending());

        let mut late_left = Box::pin(lock.lock_left(&token()));
        assert!(late_left.poll_unpin(cx).is_pending());

        source.cancel();
        assert!(matches!(
            right.poll_unpin(cx),
            Poll::Ready(Err(AcquireError::Cancelled))
        ));

        // The queued left joins the running left cohort now that the right is gone.
        assert!(matches!(late_left.poll_unpin(cx), Poll::Ready(Ok(_))));
        assert_eq!(lock.holders(Side::Left), 2);
    }

    #[test]
    fn close_faults_waiters_and_drains() {
        let lock = SwitchLock::new();
        let cx = &mut Context::from_waker(noop_waker_ref());

        let left = lock_now(&lock, Side::Left);
        let mut right = Box::pin(lock.lock_right(&token()));
        assert!(right.poll_unpin(cx).is_pending());

        let mut drain = Box::pin(lock.close());
        assert!(matches!(
            right.poll_unpin(cx),
            Poll::Ready(Err(AcquireError::Closed))
        ));
        assert!(drain.poll_unpin(cx).is_pending());

        drop(left);
        assert_eq!(drain.poll_unpin(cx), Poll::Ready(()));

        let mut late = Box::pin(lock.lock_left(&token()));
        assert!(matches!(
            late.poll_unpin(cx),
            Poll::Ready(Err(AcquireError::Closed))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn groups_never_overlap_under_contention() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicI64, Ordering};

        let lock = Arc::new(SwitchLock::new());
        let occupancy = Arc::new(AtomicI64::new(0));

        let mut tasks = Vec::new();
        for index in 0..16 {
            let lock = Arc::clone(&lock);
            let occupancy = Arc::clone(&occupancy);

            tasks.push(tokio::spawn(async move {
                let side = if index % 2 == 0 {
                    Side::Left
                } else {
                    Side::Right
                };
                let sign = match side {
                    Side::Left => 1,
                    Side::Right => -1,
                };

                let _guard = lock.lock(side, &CancellationToken::none()).await.unwrap();

                let observed = occupancy.fetch_add(sign, Ordering::SeqCst);
                assert!(
                    observed.signum() == 0 || observed.signum() == sign,
                    "both sides held the lock at once"
                );
                tokio::task::yield_now().await;
                occupancy.fetch_sub(sign, Ordering::SeqCst);
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(lock.holders(Side::Left), 0);
        assert_eq!(lock.holders(Side::Right), 0);
    }
}
