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

//! Implements [ResourceProvider] using the Google Cloud REST APIs.
//!
//! Service accounts and workload identity federation use the IAM API, and
//! project policies use the Cloud Resource Manager API. Buckets and their
//! policies are delegated to [Buckets].

use crate::http::HttpClient;
use crate::iam::{Policy, declared_members, observe_members};
use crate::storage::{BucketControl, Buckets};
use google_cloud_auth::credentials::Credentials;
use reqwest::Method;
use serde_json::{Map, Value, json};
use wif_provisioner::Result;
use wif_provisioner::blueprint::target;
use wif_provisioner::config::Project;
use wif_provisioner::error::Error;
use wif_provisioner::provider::ResourceProvider;
use wif_provisioner::resource::{Attributes, Observed, ResourceKind, ResourceSpec};

/// The service endpoints used by [RestProvider].
#[derive(Clone, Debug, PartialEq)]
pub struct Endpoints {
    pub iam: String,
    pub resource_manager: String,
}

impl Endpoints {
    /// Sends all the requests to a single endpoint, useful in tests.
    pub fn all<T: Into<String>>(v: T) -> Self {
        let v = v.into();
        Self {
            iam: v.clone(),
            resource_manager: v,
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            iam: "https://iam.googleapis.com".to_string(),
            resource_manager: "https://cloudresourcemanager.googleapis.com".to_string(),
        }
    }
}

// Maps resource attributes to (possibly nested) fields in the REST resources.
type FieldMap = &'static [(&'static str, &'static str)];

const SERVICE_ACCOUNT_FIELDS: FieldMap = &[
    ("display_name", "displayName"),
    ("description", "description"),
];

const POOL_FIELDS: FieldMap = &[
    ("display_name", "displayName"),
    ("description", "description"),
    ("disabled", "disabled"),
];

const PROVIDER_FIELDS: FieldMap = &[
    ("display_name", "displayName"),
    ("description", "description"),
    ("disabled", "disabled"),
    ("issuer_uri", "oidc.issuerUri"),
    ("allowed_audiences", "oidc.allowedAudiences"),
    ("attribute_mapping", "attributeMapping"),
    ("attribute_condition", "attributeCondition"),
];

/// A [ResourceProvider] for Google Cloud.
#[derive(Clone, Debug)]
pub struct RestProvider {
    client: HttpClient,
    endpoints: Endpoints,
    buckets: Buckets,
}

impl RestProvider {
    pub fn new(cred: Credentials, storage: impl BucketControl + 'static) -> Self {
        Self {
            client: HttpClient::new(cred),
            endpoints: Endpoints::default(),
            buckets: Buckets::new(storage),
        }
    }

    pub fn with_endpoints(mut self, v: Endpoints) -> Self {
        self.endpoints = v;
        self
    }

    async fn call(&self, method: Method, url: String, body: Option<&Value>) -> Result<Value> {
        tracing::debug!("{method} {url}");
        self.client
            .execute(self.client.builder(method, url), body)
            .await
    }

    fn service_accounts(&self, project: &Project) -> String {
        format!(
            "{}/v1/projects/{}/serviceAccounts",
            self.endpoints.iam, project.project_id
        )
    }

    fn service_account(&self, project: &Project, spec: &ResourceSpec) -> String {
        let email = spec
            .attribute_str("email")
            .map(str::to_string)
            .unwrap_or_else(|| service_account_email(project, &spec.identifier));
        format!("{}/{email}", self.service_accounts(project))
    }

    fn pools(&self, project: &Project) -> String {
        format!(
            "{}/v1/projects/{}/locations/global/workloadIdentityPools",
            self.endpoints.iam, project.project_id
        )
    }

    fn pool(&self, project: &Project, spec: &ResourceSpec) -> String {
        format!("{}/{}", self.pools(project), spec.identifier)
    }

    fn providers(&self, project: &Project, spec: &ResourceSpec) -> Result<String> {
        let pool = required(spec, "pool")?;
        Ok(format!("{}/{pool}/providers", self.pools(project)))
    }

    fn provider(&self, project: &Project, spec: &ResourceSpec) -> Result<String> {
        Ok(format!(
            "{}/{}",
            self.providers(project, spec)?,
            spec.identifier
        ))
    }

    async fn get_service_account(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        let response = self
            .call(Method::GET, self.service_account(project, spec), None)
            .await?;
        Ok(observe(&response, SERVICE_ACCOUNT_FIELDS, ["email"]))
    }

    async fn create_service_account(
        &self,
        project: &Project,
        spec: &ResourceSpec,
    ) -> Result<Observed> {
        let body = json!({
            "accountId": spec.identifier,
            "serviceAccount": to_body(spec, SERVICE_ACCOUNT_FIELDS, &[]),
        });
        let response = self
            .call(Method::POST, self.service_accounts(project), Some(&body))
            .await?;
        Ok(observe(&response, SERVICE_ACCOUNT_FIELDS, ["email"]))
    }

    async fn update_service_account(
        &self,
        project: &Project,
        spec: &ResourceSpec,
    ) -> Result<Observed> {
        let (fields, mask) = mutable_fields(spec, SERVICE_ACCOUNT_FIELDS);
        let body = json!({
            "serviceAccount": to_body(spec, fields.as_slice(), &[]),
            "updateMask": mask,
        });
        let response = self
            .call(Method::PATCH, self.service_account(project, spec), Some(&body))
            .await?;
        Ok(observe(&response, SERVICE_ACCOUNT_FIELDS, ["email"]))
    }

    async fn get_pool(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        let response = self.call(Method::GET, self.pool(project, spec), None).await?;
        check_not_deleted(&response, spec)?;
        let mut observed = observe(&response, POOL_FIELDS, []);
        default_false(&mut observed, "disabled");
        Ok(observed)
    }

    async fn create_pool(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        let body = to_body(spec, POOL_FIELDS, &[]);
        let builder = self
            .client
            .builder(Method::POST, self.pools(project))
            .query(&[("workloadIdentityPoolId", spec.identifier.as_str())]);
        let operation = self.client.execute(builder, Some(&body)).await?;
        Ok(Observed::new(spec.attributes.clone()).set_raw(operation))
    }

    async fn update_pool(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        let (fields, mask) = mutable_fields(spec, POOL_FIELDS);
        let body = to_body(spec, fields.as_slice(), &[]);
        let builder = self
            .client
            .builder(Method::PATCH, self.pool(project, spec))
            .query(&[("updateMask", mask.as_str())]);
        let operation = self.client.execute(builder, Some(&body)).await?;
        Ok(Observed::new(spec.attributes.clone()).set_raw(operation))
    }

    async fn get_provider(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        let response = self
            .call(Method::GET, self.provider(project, spec)?, None)
            .await?;
        check_not_deleted(&response, spec)?;
        let mut observed = observe(&response, PROVIDER_FIELDS, ["name"]);
        default_false(&mut observed, "disabled");
        if let Some(pool) = spec.attributes.get("pool") {
            observed.attributes.insert("pool".to_string(), pool.clone());
        }
        Ok(observed)
    }

    async fn create_provider(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        let body = to_body(spec, PROVIDER_FIELDS, &[]);
        let builder = self
            .client
            .builder(Method::POST, self.providers(project, spec)?)
            .query(&[("workloadIdentityPoolProviderId", spec.identifier.as_str())]);
        let operation = self.client.execute(builder, Some(&body)).await?;
        Ok(provider_observed(project, spec, operation))
    }

    async fn update_provider(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        let (fields, mask) = mutable_fields(spec, PROVIDER_FIELDS);
        let body = to_body(spec, fields.as_slice(), &[]);
        let builder = self
            .client
            .builder(Method::PATCH, self.provider(project, spec)?)
            .query(&[("updateMask", mask.as_str())]);
        let operation = self.client.execute(builder, Some(&body)).await?;
        Ok(provider_observed(project, spec, operation))
    }

    fn policy_target(&self, project: &Project, spec: &ResourceSpec) -> Result<PolicyTarget> {
        let resource = required(spec, "target")?;
        let target = match required(spec, "target_kind")? {
            target::PROJECT => {
                let base = format!(
                    "{}/v1/projects/{resource}",
                    self.endpoints.resource_manager
                );
                PolicyTarget {
                    get: format!("{base}:getIamPolicy"),
                    set: format!("{base}:setIamPolicy"),
                    get_body: Some(json!({"options": {"requestedPolicyVersion": 3}})),
                }
            }
            target::SERVICE_ACCOUNT => {
                let base = format!("{}/{resource}", self.service_accounts(project));
                PolicyTarget {
                    get: format!("{base}:getIamPolicy?options.requestedPolicyVersion=3"),
                    set: format!("{base}:setIamPolicy"),
                    get_body: None,
                }
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported target_kind `{other}` for {}, expected one of {:?}",
                    spec.identifier,
                    [target::PROJECT, target::SERVICE_ACCOUNT, target::BUCKET]
                )));
            }
        };
        Ok(target)
    }

    async fn get_policy(&self, target: &PolicyTarget) -> Result<(Value, Policy)> {
        let response = self
            .call(Method::POST, target.get.clone(), target.get_body.as_ref())
            .await?;
        let policy = serde_json::from_value(response.clone()).map_err(Error::io)?;
        Ok((response, policy))
    }

    async fn set_policy(&self, target: &PolicyTarget, policy: &Policy) -> Result<Value> {
        let policy = serde_json::to_value(policy).map_err(Error::io)?;
        let body = json!({"policy": policy});
        self.call(Method::POST, target.set.clone(), Some(&body)).await
    }

    async fn get_binding(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        if is_bucket_binding(spec) {
            return self.buckets.get_binding(spec).await;
        }
        let target = self.policy_target(project, spec)?;
        let role = required(spec, "role")?;
        let declared = declared_members(spec)?;
        let (raw, policy) = self.get_policy(&target).await?;
        observe_members(spec, role, &declared, &policy.members(role), raw)
    }

    async fn grant(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        if is_bucket_binding(spec) {
            return self.buckets.grant(spec).await;
        }
        let target = self.policy_target(project, spec)?;
        let role = required(spec, "role")?;
        let declared = declared_members(spec)?;
        let (raw, mut policy) = self.get_policy(&target).await?;
        if !policy.grant(role, declared.iter().map(String::as_str)) {
            tracing::debug!("{} already grants {role} to all its members", spec.identifier);
            return Ok(Observed::new(spec.attributes.clone()).set_raw(raw));
        }
        if policy.bindings.iter().any(|b| b.condition.is_some()) {
            policy.version = Some(3);
        }
        let response = self.set_policy(&target, &policy).await?;
        Ok(Observed::new(spec.attributes.clone()).set_raw(response))
    }
}

#[async_trait::async_trait]
impl ResourceProvider for RestProvider {
    async fn get_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        match spec.kind {
            ResourceKind::ServiceAccount => self.get_service_account(project, spec).await,
            ResourceKind::IdentityPool => self.get_pool(project, spec).await,
            ResourceKind::OidcProvider => self.get_provider(project, spec).await,
            ResourceKind::StorageBucket => self.buckets.get(spec).await,
            ResourceKind::IamBinding => self.get_binding(project, spec).await,
        }
    }

    async fn create_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        match spec.kind {
            ResourceKind::ServiceAccount => self.create_service_account(project, spec).await,
            ResourceKind::IdentityPool => self.create_pool(project, spec).await,
            ResourceKind::OidcProvider => self.create_provider(project, spec).await,
            ResourceKind::StorageBucket => self.buckets.create(project, spec).await,
            ResourceKind::IamBinding => self.grant(project, spec).await,
        }
    }

    async fn update_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        match spec.kind {
            ResourceKind::ServiceAccount => self.update_service_account(project, spec).await,
            ResourceKind::IdentityPool => self.update_pool(project, spec).await,
            ResourceKind::OidcProvider => self.update_provider(project, spec).await,
            ResourceKind::StorageBucket => self.buckets.update(spec).await,
            ResourceKind::IamBinding => self.grant(project, spec).await,
        }
    }

    async fn bind_policy(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        if spec.kind != ResourceKind::IamBinding {
            return Err(Error::invalid_argument(format!(
                "cannot bind a policy for {}, it is a {}",
                spec.identifier, spec.kind
            )));
        }
        self.grant(project, spec).await
    }
}

#[derive(Debug)]
struct PolicyTarget {
    get: String,
    set: String,
    get_body: Option<Value>,
}

fn is_bucket_binding(spec: &ResourceSpec) -> bool {
    spec.attribute_str("target_kind") == Some(target::BUCKET)
}

fn service_account_email(project: &Project, account_id: &str) -> String {
    format!("{account_id}@{}.iam.gserviceaccount.com", project.project_id)
}

pub fn required<'a>(spec: &'a ResourceSpec, key: &str) -> Result<&'a str> {
    spec.attribute_str(key).ok_or_else(|| {
        Error::invalid_argument(format!(
            "{} is missing the `{key}` attribute",
            spec.identifier
        ))
    })
}

/// The fields of `fields` declared in `spec` and not immutable, plus the
/// matching update mask.
fn mutable_fields(
    spec: &ResourceSpec,
    fields: FieldMap,
) -> (Vec<(&'static str, &'static str)>, String) {
    let immutable = spec.kind.immutable_attributes();
    let fields: Vec<_> = fields
        .iter()
        .filter(|(a, _)| spec.attributes.contains_key(*a) && !immutable.contains(a))
        .copied()
        .collect();
    let mask = fields
        .iter()
        .map(|(_, f)| *f)
        .collect::<Vec<_>>()
        .join(",");
    (fields, mask)
}

/// Builds a REST resource from the declared attributes.
fn to_body(
    spec: &ResourceSpec,
    fields: &[(&'static str, &'static str)],
    extra: &[(&str, &str)],
) -> Value {
    let mut body = Map::new();
    for (key, value) in extra {
        body.insert(key.to_string(), Value::from(*value));
    }
    for (attribute, path) in fields {
        if let Some(value) = spec.attributes.get(*attribute) {
            set_path(&mut body, path, value.clone());
        }
    }
    Value::Object(body)
}

/// Extracts the attributes from a REST resource.
fn observe<const N: usize>(
    response: &Value,
    fields: FieldMap,
    outputs: [&'static str; N],
) -> Observed {
    let mut attributes = Attributes::new();
    let all = fields.iter().copied().chain(outputs.map(|o| (o, o)));
    for (attribute, path) in all {
        if let Some(value) = get_path(response, path) {
            attributes.insert(attribute.to_string(), value.clone());
        }
    }
    Observed::new(attributes).set_raw(response.clone())
}

fn default_false(observed: &mut Observed, attribute: &str) {
    observed
        .attributes
        .entry(attribute.to_string())
        .or_insert(Value::Bool(false));
}

fn provider_observed(project: &Project, spec: &ResourceSpec, operation: Value) -> Observed {
    // Operation names are `<provider name>/operations/<id>`.
    let name = operation
        .get("name")
        .and_then(Value::as_str)
        .and_then(|n| n.split_once("/operations/"))
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| {
            format!(
                "projects/{}/locations/global/workloadIdentityPools/{}/providers/{}",
                project
                    .project_number
                    .as_deref()
                    .unwrap_or(&project.project_id),
                spec.attribute_str("pool").unwrap_or_default(),
                spec.identifier
            )
        });
    let mut attributes = spec.attributes.clone();
    attributes.insert("name".to_string(), Value::String(name));
    Observed::new(attributes).set_raw(operation)
}

// Deleted pools and providers are kept for 30 days, and their ids cannot be
// reused until they are purged.
fn check_not_deleted(response: &Value, spec: &ResourceSpec) -> Result<()> {
    if response.get("state").and_then(Value::as_str) == Some("DELETED") {
        return Err(Error::conflict(format!(
            "{} `{}` is soft-deleted, undelete it or choose a different identifier",
            spec.kind, spec.identifier
        )));
    }
    Ok(())
}

fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

fn set_path(object: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            object.insert(path.to_string(), value);
        }
        Some((head, tail)) => {
            let child = object
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                set_path(child, tail, value);
            }
        }
    }
}
