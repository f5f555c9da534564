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

//! Cloud Storage buckets and their IAM policies.
//!
//! Buckets are managed with the [StorageControl] client. Bucket policies use
//! a read-modify-write cycle, the policy `etag` rejects the write if the
//! policy changed in between.

use crate::http::code_from_http_status;
use crate::iam::{declared_members, observe_members};
use crate::rest::required;
use google_cloud_iam_v1::model::{Binding, GetPolicyOptions, Policy};
use google_cloud_storage::client::StorageControl;
use google_cloud_storage::model::Bucket;
use google_cloud_storage::model::bucket::iam_config::UniformBucketLevelAccess;
use google_cloud_storage::model::bucket::Versioning;
use google_cloud_wkt::FieldMask;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use wif_provisioner::Result;
use wif_provisioner::config::Project;
use wif_provisioner::error::{Code, Error, Status};
use wif_provisioner::resource::{Attributes, Observed, ResourceSpec};

// Maps the mutable bucket attributes to their update mask paths. The
// location of a bucket cannot change.
const UPDATE_MASK: [(&str, &str); 3] = [
    ("storage_class", "storage_class"),
    ("versioning", "versioning"),
    ("uniform_access", "iam_config.uniform_bucket_level_access"),
];

/// The Cloud Storage calls used by [Buckets].
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait BucketControl: Send + Sync + std::fmt::Debug {
    /// Fetches a bucket, `name` is `projects/_/buckets/{bucket_id}`.
    async fn get_bucket(&self, name: &str) -> google_cloud_gax::Result<Bucket>;

    async fn create_bucket(
        &self,
        bucket_id: &str,
        bucket: Bucket,
    ) -> google_cloud_gax::Result<Bucket>;

    /// Updates the fields named in `paths`.
    ///
    /// The update fails if the bucket changed since `bucket` was read.
    async fn update_bucket(
        &self,
        bucket: Bucket,
        paths: Vec<String>,
    ) -> google_cloud_gax::Result<Bucket>;

    async fn get_iam_policy(&self, resource: &str) -> google_cloud_gax::Result<Policy>;

    async fn set_iam_policy(
        &self,
        resource: &str,
        policy: Policy,
    ) -> google_cloud_gax::Result<Policy>;
}

#[async_trait::async_trait]
impl BucketControl for StorageControl {
    async fn get_bucket(&self, name: &str) -> google_cloud_gax::Result<Bucket> {
        self.get_bucket().set_name(name).send().await
    }

    async fn create_bucket(
        &self,
        bucket_id: &str,
        bucket: Bucket,
    ) -> google_cloud_gax::Result<Bucket> {
        self.create_bucket()
            .set_parent("projects/_")
            .set_bucket_id(bucket_id)
            .set_bucket(bucket)
            .send()
            .await
    }

    async fn update_bucket(
        &self,
        bucket: Bucket,
        paths: Vec<String>,
    ) -> google_cloud_gax::Result<Bucket> {
        let metageneration = bucket.metageneration;
        self.update_bucket()
            .set_bucket(bucket)
            .set_if_metageneration_match(metageneration)
            .set_update_mask(FieldMask::default().set_paths(paths))
            .send()
            .await
    }

    async fn get_iam_policy(&self, resource: &str) -> google_cloud_gax::Result<Policy> {
        self.get_iam_policy()
            .set_resource(resource)
            .set_options(GetPolicyOptions::new().set_requested_policy_version(3))
            .send()
            .await
    }

    async fn set_iam_policy(
        &self,
        resource: &str,
        policy: Policy,
    ) -> google_cloud_gax::Result<Policy> {
        self.set_iam_policy()
            .set_resource(resource)
            .set_policy(policy)
            .send()
            .await
    }
}

/// Manages buckets and bucket IAM bindings.
#[derive(Clone, Debug)]
pub struct Buckets {
    client: Arc<dyn BucketControl>,
}

impl Buckets {
    pub fn new(client: impl BucketControl + 'static) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    pub async fn get(&self, spec: &ResourceSpec) -> Result<Observed> {
        let bucket = self
            .client
            .get_bucket(&bucket_name(&spec.identifier))
            .await
            .map_err(map_error)?;
        observe(spec, &bucket)
    }

    pub async fn create(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        let bucket = Bucket::new()
            .set_project(format!("projects/{}", project.project_id))
            .set_location(required(spec, "location")?);
        let bucket = self
            .client
            .create_bucket(&spec.identifier, apply(spec, bucket))
            .await
            .map_err(map_error)?;
        observe(spec, &bucket)
    }

    pub async fn update(&self, spec: &ResourceSpec) -> Result<Observed> {
        let current = self
            .client
            .get_bucket(&bucket_name(&spec.identifier))
            .await
            .map_err(map_error)?;
        let paths: Vec<String> = UPDATE_MASK
            .iter()
            .filter(|(attribute, _)| spec.attributes.contains_key(*attribute))
            .map(|(_, path)| path.to_string())
            .collect();
        if paths.is_empty() {
            return observe(spec, &current);
        }
        let bucket = self
            .client
            .update_bucket(apply(spec, current), paths)
            .await
            .map_err(map_conflict)?;
        observe(spec, &bucket)
    }

    pub async fn get_binding(&self, spec: &ResourceSpec) -> Result<Observed> {
        let resource = bucket_name(required(spec, "target")?);
        let role = required(spec, "role")?;
        let declared = declared_members(spec)?;
        let policy = self
            .client
            .get_iam_policy(&resource)
            .await
            .map_err(map_error)?;
        let raw = serde_json::to_value(&policy).map_err(Error::io)?;
        observe_members(spec, role, &declared, &granted(&policy, role), raw)
    }

    pub async fn grant(&self, spec: &ResourceSpec) -> Result<Observed> {
        let resource = bucket_name(required(spec, "target")?);
        let role = required(spec, "role")?;
        let declared = declared_members(spec)?;
        let mut policy = self
            .client
            .get_iam_policy(&resource)
            .await
            .map_err(map_error)?;
        if !grant(&mut policy, role, &declared) {
            tracing::debug!("{} already grants {role} to all its members", spec.identifier);
            let raw = serde_json::to_value(&policy).map_err(Error::io)?;
            return Ok(Observed::new(spec.attributes.clone()).set_raw(raw));
        }
        if policy.bindings.iter().any(|b| b.condition.is_some()) {
            policy.version = 3;
        }
        let policy = self
            .client
            .set_iam_policy(&resource, policy)
            .await
            .map_err(map_conflict)?;
        let raw = serde_json::to_value(&policy).map_err(Error::io)?;
        Ok(Observed::new(spec.attributes.clone()).set_raw(raw))
    }
}

fn bucket_name(bucket_id: &str) -> String {
    format!("projects/_/buckets/{bucket_id}")
}

/// Sets the declared mutable attributes on `bucket`.
fn apply(spec: &ResourceSpec, mut bucket: Bucket) -> Bucket {
    if let Some(class) = spec.attribute_str("storage_class") {
        bucket = bucket.set_storage_class(class);
    }
    if let Some(enabled) = spec.attributes.get("versioning").and_then(Value::as_bool) {
        bucket = bucket.set_versioning(Versioning::new().set_enabled(enabled));
    }
    if let Some(enabled) = spec.attributes.get("uniform_access").and_then(Value::as_bool) {
        let config = bucket
            .iam_config
            .take()
            .unwrap_or_default()
            .set_uniform_bucket_level_access(UniformBucketLevelAccess::new().set_enabled(enabled));
        bucket = bucket.set_iam_config(config);
    }
    bucket
}

fn observe(spec: &ResourceSpec, bucket: &Bucket) -> Result<Observed> {
    let mut attributes = Attributes::new();
    // The service reports locations in uppercase.
    let location = match spec.attribute_str("location") {
        Some(declared) if declared.eq_ignore_ascii_case(&bucket.location) => declared,
        _ => bucket.location.as_str(),
    };
    attributes.insert("location".to_string(), Value::from(location));
    if !bucket.storage_class.is_empty() {
        attributes.insert(
            "storage_class".to_string(),
            Value::from(bucket.storage_class.as_str()),
        );
    }
    let versioning = bucket.versioning.as_ref().is_some_and(|v| v.enabled);
    attributes.insert("versioning".to_string(), Value::Bool(versioning));
    let uniform_access = bucket
        .iam_config
        .as_ref()
        .and_then(|c| c.uniform_bucket_level_access.as_ref())
        .is_some_and(|u| u.enabled);
    attributes.insert("uniform_access".to_string(), Value::Bool(uniform_access));
    let raw = serde_json::to_value(bucket).map_err(Error::io)?;
    Ok(Observed::new(attributes).set_raw(raw))
}

/// The members granted `role` without a condition.
fn granted<'a>(policy: &'a Policy, role: &str) -> BTreeSet<&'a str> {
    policy
        .bindings
        .iter()
        .filter(|b| b.role == role && b.condition.is_none())
        .flat_map(|b| b.members.iter().map(String::as_str))
        .collect()
}

/// Grants `role` to `members`, returns true if the policy changed.
fn grant(policy: &mut Policy, role: &str, members: &[String]) -> bool {
    let existing = granted(policy, role);
    let missing: BTreeSet<String> = members
        .iter()
        .filter(|m| !existing.contains(m.as_str()))
        .cloned()
        .collect();
    if missing.is_empty() {
        return false;
    }
    match policy
        .bindings
        .iter_mut()
        .find(|b| b.role == role && b.condition.is_none())
    {
        Some(binding) => binding.members.extend(missing),
        None => policy
            .bindings
            .push(Binding::new().set_role(role).set_members(missing)),
    }
    true
}

fn map_error(e: google_cloud_gax::error::Error) -> Error {
    if let Some(status) = e.status() {
        return Error::service(status.clone());
    }
    if let Some(code) = e.http_status_code() {
        return Error::service(
            Status::default()
                .set_code(code_from_http_status(code))
                .set_message(e.to_string()),
        );
    }
    if e.is_timeout() {
        return Error::timeout(e);
    }
    if e.is_authentication() {
        return Error::authentication(e);
    }
    Error::io(e)
}

// A stale `etag` or metageneration fails the precondition. The next attempt
// reads the resource again, so the failure is retryable.
fn map_conflict(e: google_cloud_gax::error::Error) -> Error {
    let error = map_error(e);
    match error.status() {
        Some(s) if s.code == Code::FailedPrecondition => {
            Error::service(s.clone().set_code(Code::Aborted))
        }
        _ => error,
    }
}
