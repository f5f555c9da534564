// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Defines traits for retry policies and some common implementations.
//!
//! The engine automatically retries provider calls when they fail with
//! transient errors. Probes are read-only and always safe to retry. Mutating
//! calls are retried too: a mutation that failed with a transient error did
//! not take effect, or, if it did, the next attempt reports a conflict that
//! the executor handles.
//!
//! # Example
//! ```
//! # use wif_provisioner::retry_policy::*;
//! use std::time::Duration;
//! let policy = TransientErrors
//!     .with_attempt_limit(5)
//!     .with_time_limit(Duration::from_secs(300));
//! ```

use crate::error::{Error, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

pub use google_cloud_gax::retry_state::RetryState;

/// The default number of attempts for each resource operation.
pub const DEFAULT_ATTEMPT_LIMIT: u32 = 5;

/// What the retry loop does after a failed attempt.
#[derive(Debug)]
pub enum RetryResult {
    /// Stop, the error is not worth retrying.
    Permanent(Error),
    /// Stop, the error is retryable but the policy limits were reached.
    Exhausted(Error),
    /// Make another attempt.
    Continue(Error),
}

/// Determines how errors are handled in the retry loop.
///
/// Implementations of this trait determine if errors are retryable, and for
/// how long the retry loop may continue.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Query the retry policy after an error.
    ///
    /// # Parameters
    /// * `state` - the start time of the loop and the number of attempts so
    ///   far, including the attempt that just failed.
    /// * `error` - the error returned by the last attempt.
    fn on_error(&self, state: &RetryState, error: Error) -> RetryResult;

    /// The remaining time in the retry policy.
    ///
    /// For policies based on time, this returns the remaining time in the
    /// policy. For policies that are not time based this returns `None`.
    fn remaining_time(&self, _state: &RetryState) -> Option<Duration> {
        None
    }
}

/// Extension trait for [`RetryPolicy`].
pub trait RetryPolicyExt: RetryPolicy + Sized {
    /// Decorate a [`RetryPolicy`] to limit the number of attempts.
    fn with_attempt_limit(self, maximum_attempts: u32) -> LimitedAttemptCount<Self> {
        LimitedAttemptCount::custom(self, maximum_attempts)
    }

    /// Decorate a [`RetryPolicy`] to limit the total elapsed time in the loop.
    fn with_time_limit(self, maximum_duration: Duration) -> LimitedElapsedTime<Self> {
        LimitedElapsedTime::custom(self, maximum_duration)
    }
}

impl<T: RetryPolicy> RetryPolicyExt for T {}

impl<T: RetryPolicy + ?Sized> RetryPolicy for Arc<T> {
    fn on_error(&self, state: &RetryState, error: Error) -> RetryResult {
        self.as_ref().on_error(state, error)
    }

    fn remaining_time(&self, state: &RetryState) -> Option<Duration> {
        self.as_ref().remaining_time(state)
    }
}

/// A retry policy that continues on transient errors.
///
/// `NotFound` is also retryable: a mutating call that references a resource
/// created moments ago can fail until the provider converges. Probes never
/// see these errors, they normalize `NotFound` into an absent resource.
///
/// This policy should be decorated to limit the number of attempts or the
/// duration of the retry loop.
#[derive(Clone, Debug)]
pub struct TransientErrors;

impl RetryPolicy for TransientErrors {
    fn on_error(&self, _state: &RetryState, error: Error) -> RetryResult {
        match error.kind() {
            ErrorKind::Transient | ErrorKind::NotFound => RetryResult::Continue(error),
            _ => RetryResult::Permanent(error),
        }
    }
}

/// A retry policy decorator that limits the number of attempts.
///
/// Once the loop has made `maximum_attempts` attempts this policy turns
/// retryable errors into [RetryResult::Exhausted]. Permanent errors are
/// reported unchanged.
///
/// # Parameters
/// * `P` - the inner retry policy, defaults to [TransientErrors].
#[derive(Clone, Debug)]
pub struct LimitedAttemptCount<P = TransientErrors>
where
    P: RetryPolicy,
{
    inner: P,
    maximum_attempts: u32,
}

impl LimitedAttemptCount {
    /// Creates a new instance, with the default inner policy.
    ///
    /// # Example
    /// ```
    /// # use wif_provisioner::retry_policy::*;
    /// let policy = LimitedAttemptCount::new(5);
    /// assert_eq!(policy.maximum_attempts(), 5);
    /// ```
    pub fn new(maximum_attempts: u32) -> Self {
        Self::custom(TransientErrors, maximum_attempts)
    }
}

impl<P> LimitedAttemptCount<P>
where
    P: RetryPolicy,
{
    /// Creates a new instance with a custom inner policy.
    pub fn custom(inner: P, maximum_attempts: u32) -> Self {
        Self {
            inner,
            maximum_attempts,
        }
    }

    /// The maximum number of attempts, including the first one.
    pub fn maximum_attempts(&self) -> u32 {
        self.maximum_attempts
    }
}

impl Default for LimitedAttemptCount {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPT_LIMIT)
    }
}

impl<P> RetryPolicy for LimitedAttemptCount<P>
where
    P: RetryPolicy,
{
    fn on_error(&self, state: &RetryState, error: Error) -> RetryResult {
        match self.inner.on_error(state, error) {
            RetryResult::Continue(e) if state.attempt_count >= self.maximum_attempts => {
                RetryResult::Exhausted(e)
            }
            flow => flow,
        }
    }

    fn remaining_time(&self, state: &RetryState) -> Option<Duration> {
        self.inner.remaining_time(state)
    }
}

/// A retry policy decorator that limits the elapsed time in the loop.
///
/// Once the loop exceeds its duration limit this policy turns retryable
/// errors into [RetryResult::Exhausted].
///
/// # Parameters
/// * `P` - the inner retry policy, defaults to [TransientErrors].
#[derive(Clone, Debug)]
pub struct LimitedElapsedTime<P = TransientErrors>
where
    P: RetryPolicy,
{
    inner: P,
    maximum_duration: Duration,
}

impl LimitedElapsedTime {
    /// Creates a new instance, with the default inner policy.
    pub fn new(maximum_duration: Duration) -> Self {
        Self::custom(TransientErrors, maximum_duration)
    }
}

impl<P> LimitedElapsedTime<P>
where
    P: RetryPolicy,
{
    /// Creates a new instance with a custom inner policy.
    pub fn custom(inner: P, maximum_duration: Duration) -> Self {
        Self {
            inner,
            maximum_duration,
        }
    }

    fn on_error_now(
        &self,
        now: std::time::Instant,
        state: &RetryState,
        error: Error,
    ) -> RetryResult {
        let expired = now.saturating_duration_since(state.start) >= self.maximum_duration;
        match self.inner.on_error(state, error) {
            RetryResult::Continue(e) if expired => RetryResult::Exhausted(e),
            flow => flow,
        }
    }

    fn remaining_time_now(&self, now: std::time::Instant, state: &RetryState) -> Option<Duration> {
        let deadline = state.start + self.maximum_duration;
        let remaining = deadline.saturating_duration_since(now);
        match self.inner.remaining_time(state) {
            Some(inner) => Some(std::cmp::min(remaining, inner)),
            None => Some(remaining),
        }
    }
}

impl<P> RetryPolicy for LimitedElapsedTime<P>
where
    P: RetryPolicy,
{
    fn on_error(&self, state: &RetryState, error: Error) -> RetryResult {
        self.on_error_now(std::time::Instant::now(), state, error)
    }

    fn remaining_time(&self, state: &RetryState) -> Option<Duration> {
        self.remaining_time_now(std::time::Instant::now(), state)
    }
}
