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

//! Keyless authentication from GitHub Actions to Google Cloud.
//!
//! The [github_actions] blueprint declares the resources needed by an
//! infrastructure-as-code pipeline running in GitHub Actions:
//!
//! * a service account impersonated by the pipeline,
//! * a bucket to store the remote state,
//! * a workload identity pool and an OIDC provider trusting the GitHub token
//!   issuer, restricted to a single repository,
//! * the IAM bindings granting the service account access to the project and
//!   the bucket, and allowing the repository to impersonate it.

use crate::Result;
use crate::config::{ConfigError, Configuration, Project};
use crate::resource::{ResourceKind, ResourceSpec};
use serde_json::json;

/// The issuer of the GitHub Actions OIDC tokens.
pub const GITHUB_ISSUER: &str = "https://token.actions.githubusercontent.com";

/// Target kinds for [IamBinding][ResourceKind::IamBinding] resources.
pub mod target {
    pub const PROJECT: &str = "project";
    pub const BUCKET: &str = "bucket";
    pub const SERVICE_ACCOUNT: &str = "service_account";
}

/// Overrides the resource names and roles used by [github_actions].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct BlueprintOptions {
    pub service_account_id: String,
    pub service_account_display_name: String,
    /// Defaults to `<project id>-tfstate`.
    pub bucket_name: Option<String>,
    pub bucket_location: String,
    pub pool_id: String,
    pub provider_id: String,
    /// The roles granted to the service account on the project.
    pub project_roles: Vec<String>,
}

impl BlueprintOptions {
    pub fn set_service_account_id<T: Into<String>>(mut self, v: T) -> Self {
        self.service_account_id = v.into();
        self
    }

    pub fn set_bucket_name<T: Into<String>>(mut self, v: T) -> Self {
        self.bucket_name = Some(v.into());
        self
    }

    pub fn set_bucket_location<T: Into<String>>(mut self, v: T) -> Self {
        self.bucket_location = v.into();
        self
    }

    pub fn set_pool_id<T: Into<String>>(mut self, v: T) -> Self {
        self.pool_id = v.into();
        self
    }

    pub fn set_provider_id<T: Into<String>>(mut self, v: T) -> Self {
        self.provider_id = v.into();
        self
    }

    pub fn set_project_roles<I, V>(mut self, v: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.project_roles = v.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for BlueprintOptions {
    fn default() -> Self {
        Self {
            service_account_id: "github-actions-terraform".to_string(),
            service_account_display_name: "GitHub Actions Terraform".to_string(),
            bucket_name: None,
            bucket_location: "US".to_string(),
            pool_id: "github-pool".to_string(),
            provider_id: "github-provider".to_string(),
            project_roles: vec!["roles/editor".to_string()],
        }
    }
}

/// Declares the GitHub Actions federation resources for `project`.
///
/// The project must include its number and the repository.
///
/// # Example
/// ```
/// # use wif_provisioner::blueprint::{BlueprintOptions, github_actions};
/// # use wif_provisioner::config::Project;
/// let project = Project::new("my-project")
///     .set_project_number("123456")
///     .set_repository("my-org/my-repo");
/// let config = github_actions(project, BlueprintOptions::default())?;
/// assert!(config.resource("github-provider").is_some());
/// # Ok::<(), wif_provisioner::error::Error>(())
/// ```
pub fn github_actions(project: Project, options: BlueprintOptions) -> Result<Configuration> {
    let number = project
        .project_number
        .clone()
        .ok_or(ConfigError::MissingProjectField("number"))?;
    let repository = project
        .repository
        .clone()
        .ok_or(ConfigError::MissingProjectField("repository"))?;
    let sa = &options.service_account_id;
    let email = format!("{sa}@{}.iam.gserviceaccount.com", project.project_id);
    let bucket = options
        .bucket_name
        .clone()
        .unwrap_or_else(|| format!("{}-tfstate", project.project_id));
    let principal_set = format!(
        "principalSet://iam.googleapis.com/projects/{number}/locations/global/workloadIdentityPools/{}/attribute.repository/{repository}",
        options.pool_id
    );

    let mut resources = vec![
        ResourceSpec::new(ResourceKind::ServiceAccount, sa)
            .set_attribute("display_name", options.service_account_display_name.as_str()),
        ResourceSpec::new(ResourceKind::StorageBucket, bucket.as_str())
            .set_attribute("location", options.bucket_location.as_str())
            .set_attribute("versioning", true),
        ResourceSpec::new(ResourceKind::IdentityPool, options.pool_id.as_str())
            .set_attribute("display_name", "GitHub Actions Pool"),
        ResourceSpec::new(ResourceKind::OidcProvider, options.provider_id.as_str())
            .set_attribute("pool", options.pool_id.as_str())
            .set_attribute("display_name", "GitHub Provider")
            .set_attribute("issuer_uri", GITHUB_ISSUER)
            .set_attribute(
                "attribute_mapping",
                json!({
                    "google.subject": "assertion.sub",
                    "attribute.actor": "assertion.actor",
                    "attribute.repository": "assertion.repository",
                    "attribute.repository_owner": "assertion.repository_owner",
                }),
            )
            .set_attribute(
                "attribute_condition",
                format!("assertion.repository == '{repository}'"),
            )
            .set_depends_on([options.pool_id.as_str()]),
    ];
    resources.extend(options.project_roles.iter().map(|role| {
        binding(format!("{sa}-{}", role_suffix(role)), target::PROJECT, &project.project_id)
            .set_attribute("role", role.as_str())
            .set_attribute("members", json!([format!("serviceAccount:{email}")]))
            .set_depends_on([sa.as_str()])
    }));
    resources.push(
        binding(format!("{bucket}-object-admin"), target::BUCKET, &bucket)
            .set_attribute("role", "roles/storage.objectAdmin")
            .set_attribute("members", json!([format!("serviceAccount:{email}")]))
            .set_depends_on([sa.as_str(), bucket.as_str()]),
    );
    resources.push(
        binding(format!("{sa}-workload-identity-user"), target::SERVICE_ACCOUNT, &email)
            .set_attribute("role", "roles/iam.workloadIdentityUser")
            .set_attribute("members", json!([principal_set]))
            .set_depends_on([sa.as_str(), options.provider_id.as_str()]),
    );

    let config = Configuration {
        project,
        resources,
    };
    config.validate()?;
    Ok(config)
}

fn binding(identifier: String, target_kind: &str, target: &str) -> ResourceSpec {
    ResourceSpec::new(ResourceKind::IamBinding, identifier)
        .set_attribute("target_kind", target_kind)
        .set_attribute("target", target)
}

// `roles/iam.workloadIdentityUser` -> `iam-workloadidentityuser`
fn role_suffix(role: &str) -> String {
    role.trim_start_matches("roles/")
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}
