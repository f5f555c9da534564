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

//! Queries the current state of the declared resources.
//!
//! Probes are read-only. They run concurrently, bounded by the session
//! concurrency limit, and do not depend on the order of the resources.

use crate::Result;
use crate::config::Project;
use crate::options::SessionOptions;
use crate::provider::ResourceProvider;
use crate::resource::{ResourceSpec, ResourceState};
use crate::retry_loop::retry_loop;
use futures::StreamExt;

/// Fetches the current state of one resource.
///
/// A resource that does not exist is a normal outcome, reported as
/// [ResourceState::absent]. Every other failure is returned unchanged.
pub async fn probe(
    provider: &dyn ResourceProvider,
    project: &Project,
    spec: &ResourceSpec,
) -> Result<ResourceState> {
    match provider.get_resource(project, spec).await {
        Ok(observed) => Ok(ResourceState::present(observed)),
        Err(e) if e.is_not_found() => Ok(ResourceState::absent()),
        Err(e) => Err(e),
    }
}

/// Fetches the current state of one resource, retrying transient errors.
///
/// Each attempt queries the provider again, the state is never cached across
/// attempts.
#[tracing::instrument(level = "debug", skip_all, fields(identifier = %spec.identifier, kind = %spec.kind))]
pub async fn probe_with_retry(
    provider: &dyn ResourceProvider,
    project: &Project,
    spec: &ResourceSpec,
    options: &SessionOptions,
) -> Result<ResourceState> {
    let state = retry_loop(
        move || probe(provider, project, spec),
        options.retry_policy(),
        options.backoff_policy(),
        options.cancellation_token(),
        |attempt, error, delay| {
            tracing::warn!(attempt, ?delay, "probe failed, retrying: {error}");
        },
    )
    .await?;
    tracing::debug!(exists = state.exists, "probe complete");
    Ok(state)
}

/// Probes all the resources, returning the results in the same order as
/// `specs`.
pub async fn probe_all(
    provider: &dyn ResourceProvider,
    project: &Project,
    specs: &[ResourceSpec],
    options: &SessionOptions,
) -> Vec<Result<ResourceState>> {
    futures::stream::iter(specs)
        .map(|spec| probe_with_retry(provider, project, spec, options))
        .buffered(options.concurrency())
        .collect()
        .await
}
