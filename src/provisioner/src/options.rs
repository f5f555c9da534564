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

//! Options shared by the components of a provisioning session.

use crate::retry_policy::{LimitedAttemptCount, RetryPolicy};
use google_cloud_gax::backoff_policy::BackoffPolicy;
use google_cloud_gax::exponential_backoff::ExponentialBackoff;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The default number of concurrent provider calls.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Controls retries, concurrency, and cancellation for provider calls.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    retry_policy: Arc<dyn RetryPolicy>,
    backoff_policy: Arc<dyn BackoffPolicy>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The retry policy for probes and mutations.
    pub fn retry_policy(&self) -> &dyn RetryPolicy {
        self.retry_policy.as_ref()
    }

    pub fn set_retry_policy<P: RetryPolicy + 'static>(mut self, v: P) -> Self {
        self.retry_policy = Arc::new(v);
        self
    }

    /// The backoff policy between attempts.
    pub fn backoff_policy(&self) -> &dyn BackoffPolicy {
        self.backoff_policy.as_ref()
    }

    pub fn set_backoff_policy<P: BackoffPolicy + 'static>(mut self, v: P) -> Self {
        self.backoff_policy = Arc::new(v);
        self
    }

    /// The maximum number of provider calls in flight. Always at least 1.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn set_concurrency(mut self, v: usize) -> Self {
        self.concurrency = v.max(1);
        self
    }

    /// The token used to cancel the session.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_cancellation_token(mut self, v: CancellationToken) -> Self {
        self.cancel = v;
        self
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry_policy: Arc::new(LimitedAttemptCount::default()),
            backoff_policy: Arc::new(ExponentialBackoff::default()),
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry_policy::DEFAULT_ATTEMPT_LIMIT;

    #[test]
    fn defaults() {
        let options = SessionOptions::new();
        assert_eq!(options.concurrency(), DEFAULT_CONCURRENCY);
        assert!(!options.cancellation_token().is_cancelled());
        let fmt = format!("{:?}", options.retry_policy());
        assert!(fmt.contains(&DEFAULT_ATTEMPT_LIMIT.to_string()), "{fmt}");
    }

    #[test]
    fn concurrency_is_at_least_one() {
        let options = SessionOptions::new().set_concurrency(0);
        assert_eq!(options.concurrency(), 1);
    }

    #[test]
    fn cancellation_is_shared() {
        let token = CancellationToken::new();
        let options = SessionOptions::new().set_cancellation_token(token.clone());
        token.cancel();
        assert!(options.cancellation_token().is_cancelled());
    }
}
