// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{self, Poll, Waker};

use crate::ERR_POISONED_LOCK;

/// One-shot latch that completes a close's drain future once the last holder releases.
#[derive(Debug)]
pub(crate) struct DrainLatch {
    state: Mutex<LatchState>,
}

#[derive(Debug)]
enum LatchState {
    Pending(Vec<Waker>),
    Complete,
}

impl DrainLatch {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Pending(Vec::new())),
        }
    }

    /// Completes the latch, waking every drain future. Idempotent.
    pub(crate) fn complete(&self) {
        let wakers = {
            let mut state = self.state.lock().expect(ERR_POISONED_LOCK);
            match std::mem::replace(&mut *state, LatchState::Complete) {
                LatchState::Pending(wakers) => wakers,
                LatchState::Complete => Vec::new(),
            }
        };

        // Wakeups happen outside the lock so resumed tasks can immediately poll.
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn wait(&self) -> Drain<'_> {
        Drain { latch: self }
    }
}

/// Completes once the primitive that produced it has fully drained.
///
/// Returned by the `close` operations; see the individual primitives for what "drained"
/// means for each.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct Drain<'a> {
    latch: &'a DrainLatch,
}

impl Future for Drain<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let mut state = self.latch.state.lock().expect(ERR_POISONED_LOCK);

        match &mut *state {
            LatchState::Pending(wakers) => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            LatchState::Complete => Poll::Ready(()),
        }
    }
}
