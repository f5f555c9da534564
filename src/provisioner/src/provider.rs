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

//! The interface to the cloud resource management API.

use crate::Result;
use crate::config::Project;
use crate::resource::{Observed, ResourceSpec};
use std::sync::Arc;

/// The operations the engine needs from the cloud provider.
///
/// Implementations translate each call into the provider wire protocol, and
/// normalize every failure into an [Error][crate::error::Error]. They must
/// never panic on provider input.
///
/// All the calls return the resource as observed after the call completes,
/// using the attribute names of [ResourceSpec::attributes].
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ResourceProvider: Send + Sync + std::fmt::Debug {
    /// Fetches the current state of a resource.
    ///
    /// Returns an error of kind
    /// [NotFound][crate::error::ErrorKind::NotFound] if the resource does not
    /// exist.
    async fn get_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed>;

    /// Creates a resource with the declared attributes.
    async fn create_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed>;

    /// Changes the mutable attributes of an existing resource.
    async fn update_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed>;

    /// Grants a role to the declared members of an
    /// [IamBinding][crate::resource::ResourceKind::IamBinding].
    ///
    /// Implementations perform a single read-modify-write of the policy. If
    /// the policy changed concurrently they return a transient error, and the
    /// engine retries the call.
    async fn bind_policy(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed>;
}

#[async_trait::async_trait]
impl<T: ResourceProvider + ?Sized> ResourceProvider for Arc<T> {
    async fn get_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        self.as_ref().get_resource(project, spec).await
    }

    async fn create_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        self.as_ref().create_resource(project, spec).await
    }

    async fn update_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        self.as_ref().update_resource(project, spec).await
    }

    async fn bind_policy(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        self.as_ref().bind_policy(project, spec).await
    }
}
