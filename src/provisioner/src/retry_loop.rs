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

use crate::Result;
use crate::error::Error;
use crate::retry_policy::{RetryPolicy, RetryResult, RetryState};
use google_cloud_gax::backoff_policy::BackoffPolicy;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs the retry loop for a given function.
///
/// This function calls `inner` as long as (1) the retry policy has not
/// expired, (2) `inner` has not returned a successful result or a permanent
/// error, and (3) the cancellation token has not fired.
///
/// In between calls the function waits the amount of time prescribed by the
/// backoff policy. The wait does not block any other task, and it is cut short
/// if the token is cancelled. A cancelled loop never starts a new attempt, but
/// an attempt already in progress always runs to completion.
///
/// The `on_retry` callback is called before sleeping, with the attempt count,
/// the error, and the delay.
pub async fn retry_loop<F, Fut, T, OnRetry>(
    mut inner: F,
    retry_policy: &dyn RetryPolicy,
    backoff_policy: &dyn BackoffPolicy,
    cancel: &CancellationToken,
    mut on_retry: OnRetry,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    OnRetry: FnMut(u32, &Error, Duration),
{
    let start = tokio::time::Instant::now().into_std();
    let mut attempt_count = 0_u32;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(
                "the session was cancelled before the attempt started",
            ));
        }
        attempt_count = attempt_count.saturating_add(1);
        let error = match inner().await {
            Ok(r) => return Ok(r),
            Err(e) => e,
        };
        let state = RetryState::new(true)
            .set_start(start)
            .set_attempt_count(attempt_count);
        let error = match retry_policy.on_error(&state, error) {
            RetryResult::Permanent(e) => return Err(e),
            RetryResult::Exhausted(e) => return Err(Error::exhausted(e)),
            RetryResult::Continue(e) => e,
        };
        let delay = backoff_policy.on_failure(&state);
        if retry_policy
            .remaining_time(&state)
            .is_some_and(|remaining| remaining < delay)
        {
            return Err(Error::exhausted(error));
        }
        on_retry(attempt_count, &error, delay);
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(error)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
