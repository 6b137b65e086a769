// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A specialized `Result` for acquire operations on the synchronization primitives.
pub type AcquireResult<T> = std::result::Result<T, AcquireError>;

/// Why an acquire operation did not produce the resource.
///
/// Every failure here is explicit and recoverable: the caller can abandon the attempt
/// (`Cancelled`) or stop using the primitive (`Closed`). No failure tears down unrelated work.
///
/// Programmer errors (releasing something that is not held, driving a recycled pooled waiter)
/// are not represented here - they panic, because they denote bugs rather than outcomes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AcquireError {
    /// The primitive was closed before or while the caller was waiting.
    #[error("the synchronization primitive has been closed")]
    Closed,

    /// The caller's cancellation token fired before the resource was granted.
    ///
    /// A token that fires strictly after the grant has no effect; the resource is owned
    /// and must be released through its guard.
    #[error("the wait was cancelled before the resource was granted")]
    Cancelled,
}

/// Why a closure queued on a [`TaskStream`][crate::TaskStream] did not produce its result.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamTaskError {
    /// The closure's cancellation token fired before the closure began executing.
    ///
    /// Once execution starts the token no longer aborts the closure.
    #[error("the queued closure was cancelled before it began executing")]
    Cancelled,

    /// The closure (or the future it returned) panicked.
    ///
    /// The panic is contained: subsequent closures on the stream run normally.
    #[error("the queued closure panicked")]
    Panicked,
}
