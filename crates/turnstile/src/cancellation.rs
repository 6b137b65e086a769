// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cooperative cancellation for the acquire operations in this crate.
//!
//! A [`CancellationSource`] owns the right to cancel; the [`CancellationToken`]s it hands out
//! are the observing side that acquire operations accept. Tokens are cheap to clone and carry
//! callback registration, a `cancelled()` future, and adapters for racing an arbitrary future
//! against cancellation or a timeout.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{self, Poll};
use std::time::Duration;

use futures::future::Either;
use futures::task::AtomicWaker;

use crate::timer::DeadlineHandle;
use crate::{ERR_POISONED_LOCK, timer};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Registry {
    next_key: u64,
    callbacks: Vec<(u64, Callback)>,
}

struct CancelShared {
    cancelled: AtomicBool,
    registry: Mutex<Registry>,
}

impl CancelShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            registry: Mutex::new(Registry::default()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let callbacks = {
            let mut registry = self.registry.lock().expect(ERR_POISONED_LOCK);
            std::mem::take(&mut registry.callbacks)
        };

        // Callbacks run outside the registry lock so they may themselves register, detach
        // or inspect tokens without deadlocking.
        for (_key, callback) in callbacks {
            callback();
        }
    }
}

/// Owns the right to cancel; hands out [`CancellationToken`]s to the waiting side.
///
/// Dropping the source does not cancel outstanding tokens; it only disarms any pending
/// [`cancel_after`][Self::cancel_after] deadline and detaches from a linked parent.
pub struct CancellationSource {
    shared: Arc<CancelShared>,
    deadline: Mutex<Option<DeadlineHandle>>,

    // Keeps a linked source subscribed to its parent for as long as the source lives.
    _parent: Option<Registration>,
}

impl std::fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    /// Creates an independent source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: CancelShared::new(),
            deadline: Mutex::new(None),
            _parent: None,
        }
    }

    /// Creates a source that cancels itself when `parent` fires, in addition to direct
    /// [`cancel`][Self::cancel] calls.
    ///
    /// The link is severed when the returned source is dropped.
    #[must_use]
    pub fn linked_to(parent: &CancellationToken) -> Self {
        let shared = CancelShared::new();

        let linked = Arc::downgrade(&shared);
        let registration = parent.register(move || {
            if let Some(shared) = linked.upgrade() {
                shared.cancel();
            }
        });

        Self {
            shared,
            deadline: Mutex::new(None),
            _parent: Some(registration),
        }
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    /// Whether [`cancel`][Self::cancel] has been called (directly, via a deadline, or via a
    /// linked parent).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Cancels all tokens observing this source. Idempotent.
    ///
    /// Registered callbacks run synchronously on the calling thread, outside any internal
    /// lock. Callbacks registered after this call run inline at registration time.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Arranges for [`cancel`][Self::cancel] to be called once `timeout` elapses.
    ///
    /// Calling again re-arms the deadline; dropping the source disarms it.
    pub fn cancel_after(&self, timeout: Duration) {
        let shared = Arc::downgrade(&self.shared);
        let handle = timer::arm(timeout, move || {
            if let Some(shared) = shared.upgrade() {
                shared.cancel();
            }
        });

        *self.deadline.lock().expect(ERR_POISONED_LOCK) = Some(handle);
    }
}

/// The observing side of a [`CancellationSource`].
///
/// Every suspend-capable operation in this crate accepts a token. A token constructed with
/// [`CancellationToken::none`] can never fire and lets callers opt out without a separate
/// code path.
#[derive(Clone, Default)]
pub struct CancellationToken {
    shared: Option<Arc<CancelShared>>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("can_be_cancelled", &self.can_be_cancelled())
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    /// A token that can never fire.
    #[must_use]
    pub fn none() -> Self {
        Self { shared: None }
    }

    /// Whether the token could ever fire. `false` only for [`none`][Self::none] tokens.
    #[must_use]
    pub fn can_be_cancelled(&self) -> bool {
        self.shared.is_some()
    }

    /// Whether the owning source has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.cancelled.load(Ordering::SeqCst))
    }

    /// Registers a callback invoked when the token fires.
    ///
    /// If the token has already fired the callback runs inline before this returns. Dropping
    /// the returned [`Registration`] detaches the callback.
    pub fn register<F>(&self, callback: F) -> Registration
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(shared) = &self.shared else {
            return Registration {
                shared: Weak::new(),
                key: 0,
            };
        };

        {
            let mut registry = shared.registry.lock().expect(ERR_POISONED_LOCK);

            // Checked under the lock: `cancel` sets the flag before draining the registry,
            // so either we observe the flag here or the drain observes our callback.
            if !shared.cancelled.load(Ordering::SeqCst) {
                let key = registry.next_key;
                registry.next_key = registry.next_key.wrapping_add(1);
                registry.callbacks.push((key, Box::new(callback)));

                return Registration {
                    shared: Arc::downgrade(shared),
                    key,
                };
            }
        }

        callback();

        Registration {
            shared: Weak::new(),
            key: 0,
        }
    }

    /// A future that completes once the token fires.
    ///
    /// For a [`none`][Self::none] token the future never completes.
    #[must_use]
    pub fn cancelled(&self) -> Cancelled<'_> {
        Cancelled {
            token: self,
            waker: Arc::new(AtomicWaker::new()),
            registration: None,
        }
    }

    /// Awaits `fut`, abandoning it if the token fires first.
    ///
    /// Returns `Some(output)` when the future completes, `None` when cancellation wins the
    /// race. The abandoned future is dropped, which unwinds any waiters it held. A token that
    /// cannot fire awaits the future directly with no wrapping.
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        if !self.can_be_cancelled() {
            return Some(fut.await);
        }

        let cancelled = self.cancelled();
        let fut = std::pin::pin!(fut);
        let cancelled = std::pin::pin!(cancelled);

        match futures::future::select(fut, cancelled).await {
            Either::Left((output, _)) => Some(output),
            Either::Right(((), _)) => None,
        }
    }
}

/// Awaits `fut` for at most `timeout`, also honoring `token`.
///
/// Returns `None` on timeout or cancellation. The deadline is carried by a linked source that
/// is disposed as soon as the call settles.
pub async fn run_with_timeout<F>(
    fut: F,
    timeout: Duration,
    token: &CancellationToken,
) -> Option<F::Output>
where
    F: Future,
{
    let source = CancellationSource::linked_to(token);
    source.cancel_after(timeout);

    source.token().run_until_cancelled(fut).await
}

/// Detaches its callback from the token when dropped.
///
/// A registration whose callback already ran (or that was produced by a token that cannot
/// fire) detaches nothing.
#[derive(Debug)]
pub struct Registration {
    shared: Weak<CancelShared>,
    key: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut registry = shared.registry.lock().expect(ERR_POISONED_LOCK);
            let key = self.key;
            registry.callbacks.retain(|(candidate, _)| *candidate != key);
        }
    }
}

/// Future returned by [`CancellationToken::cancelled`].
#[derive(Debug)]
pub struct Cancelled<'a> {
    token: &'a CancellationToken,
    waker: Arc<AtomicWaker>,
    registration: Option<Registration>,
}

impl Future for Cancelled<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }

        if !self.token.can_be_cancelled() {
            return Poll::Pending;
        }

        self.waker.register(cx.waker());

        if self.registration.is_none() {
            let waker = Arc::clone(&self.waker);
            self.registration = Some(self.token.register(move || waker.wake()));
        }

        if self.token.is_cancelled() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::task::Context;

    use futures::FutureExt;
    use futures::task::noop_waker_ref;

    use super::*;

    #[test]
    fn none_token_cannot_fire() {
        let token = CancellationToken::none();

        assert!(!token.can_be_cancelled());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_idempotent_and_observable() {
        let source = CancellationSource::new();
        let token = source.token();

        assert!(!token.is_cancelled());

        source.cancel();
        source.cancel();

        assert!(token.is_cancelled());
        assert!(source.is_cancelled());
    }

    #[test]
    fn callbacks_run_once_on_cancel() {
        let source = CancellationSource::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&fired);
        let _registration = source.token().register(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel();
        source.cancel();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_after_cancel_runs_inline() {
        let source = CancellationSource::new();
        source.cancel();

        let fired = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&fired);
        let _registration = source.token().register(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_registration_detaches() {
        let source = CancellationSource::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&fired);
        let registration = source.token().register(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        drop(registration);

        source.cancel();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn linked_source_follows_parent() {
        let parent = CancellationSource::new();
        let child = CancellationSource::linked_to(&parent.token());

        assert!(!child.is_cancelled());

        parent.cancel();

        assert!(child.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = CancellationSource::new();
        let child = CancellationSource::linked_to(&parent.token());

        child.cancel();

        assert!(!parent.is_cancelled());
    }

    #[test]
    fn cancelled_future_completes_on_cancel() {
        let source = CancellationSource::new();
        let token = source.token();
        let mut cancelled = Box::pin(token.cancelled());

        let cx = &mut Context::from_waker(noop_waker_ref());
        assert_eq!(cancelled.poll_unpin(cx), Poll::Pending);

        source.cancel();

        assert_eq!(cancelled.poll_unpin(cx), Poll::Ready(()));
    }

    #[test]
    fn cancel_after_fires() {
        let source = CancellationSource::new();
        source.cancel_after(Duration::from_millis(20));

        futures::executor::block_on(source.token().cancelled());

        assert!(source.is_cancelled());
    }

    #[tokio::test]
    async fn run_until_cancelled_returns_value() {
        let source = CancellationSource::new();

        let output = source.token().run_until_cancelled(async { 42 }).await;

        assert_eq!(output, Some(42));
    }

    #[tokio::test]
    async fn run_until_cancelled_yields_to_cancellation() {
        let source = CancellationSource::new();
        let token = source.token();

        source.cancel();

        let output = token
            .run_until_cancelled(futures::future::pending::<()>())
            .await;

        assert_eq!(output, None);
    }

    #[tokio::test]
    async fn run_with_timeout_expires() {
        let output = run_with_timeout(
            futures::future::pending::<()>(),
            Duration::from_millis(20),
            &CancellationToken::none(),
        )
        .await;

        assert_eq!(output, None);
    }
}
