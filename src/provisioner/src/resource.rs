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

//! Declared and observed resources.
//!
//! A [ResourceSpec] describes one resource the session should converge to. A
//! [ResourceState] captures what the provider reported for that resource at
//! probe time. The [ResourceKind] determines how the two are compared.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The attributes of a resource, keyed by attribute name.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// The kinds of resources managed by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A service account impersonated by the federated workload.
    ServiceAccount,
    /// A workload identity pool.
    IdentityPool,
    /// An OIDC provider in a workload identity pool.
    OidcProvider,
    /// A Cloud Storage bucket, typically holding the remote IaC state.
    StorageBucket,
    /// A role granted to a set of members on a project, service account, or
    /// bucket.
    IamBinding,
}

/// Describes a caller-facing value produced by a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecretSpec {
    /// The name of the secret in the session output.
    pub name: &'static str,
    /// The observed attribute holding the value.
    pub attribute: &'static str,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAccount => "service_account",
            Self::IdentityPool => "identity_pool",
            Self::OidcProvider => "oidc_provider",
            Self::StorageBucket => "storage_bucket",
            Self::IamBinding => "iam_binding",
        }
    }

    /// The attributes every spec of this kind must declare.
    pub fn required_attributes(&self) -> &'static [&'static str] {
        match self {
            Self::ServiceAccount | Self::IdentityPool => &[],
            Self::OidcProvider => &["pool", "issuer_uri"],
            Self::StorageBucket => &["location"],
            Self::IamBinding => &["target_kind", "target", "role", "members"],
        }
    }

    /// The attributes the provider refuses to change after creation.
    ///
    /// A difference in any of these requires a manual recreation of the
    /// resource.
    pub fn immutable_attributes(&self) -> &'static [&'static str] {
        match self {
            Self::ServiceAccount | Self::IdentityPool => &[],
            Self::OidcProvider => &["pool", "issuer_uri"],
            Self::StorageBucket => &["location"],
            Self::IamBinding => &["target_kind", "target", "role"],
        }
    }

    /// The attributes holding unordered collections.
    pub fn set_valued_attributes(&self) -> &'static [&'static str] {
        match self {
            Self::OidcProvider => &["allowed_audiences"],
            Self::IamBinding => &["members"],
            Self::ServiceAccount | Self::IdentityPool | Self::StorageBucket => &[],
        }
    }

    /// The caller-facing value yielded by this kind, if any.
    pub fn secret(&self) -> Option<SecretSpec> {
        match self {
            Self::ServiceAccount => Some(SecretSpec {
                name: "service_account_email",
                attribute: "email",
            }),
            Self::OidcProvider => Some(SecretSpec {
                name: "workload_identity_provider",
                attribute: "name",
            }),
            Self::IdentityPool | Self::StorageBucket | Self::IamBinding => None,
        }
    }

    /// Extracts the caller-facing values from the observed attributes.
    pub fn produced_secrets(&self, attributes: &Attributes) -> BTreeMap<String, String> {
        self.secret()
            .into_iter()
            .filter_map(|s| {
                attributes
                    .get(s.attribute)
                    .and_then(|v| v.as_str())
                    .map(|v| (s.name.to_string(), v.to_string()))
            })
            .collect()
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The declarative description of one target resource.
///
/// # Example
/// ```
/// # use wif_provisioner::resource::*;
/// let provider = ResourceSpec::new(ResourceKind::OidcProvider, "github-provider")
///     .set_attribute("pool", "github-pool")
///     .set_attribute("issuer_uri", "https://token.actions.githubusercontent.com")
///     .set_depends_on(["github-pool"]);
/// assert!(provider.depends_on.contains("github-pool"));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    /// Unique within the configuration.
    pub identifier: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
}

impl ResourceSpec {
    pub fn new<T: Into<String>>(kind: ResourceKind, identifier: T) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            attributes: Attributes::new(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Sets one attribute.
    pub fn set_attribute<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Replaces the explicit dependencies.
    pub fn set_depends_on<I, V>(mut self, v: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.depends_on = v.into_iter().map(Into::into).collect();
        self
    }

    /// Returns a string attribute, if present and a string.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// The observed state of a resource at probe time.
///
/// Captured fresh on each probe, never cached across retries.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ResourceState {
    pub exists: bool,
    /// Present only if the resource exists.
    pub attributes: Option<Attributes>,
    /// The provider payload, retained for diagnostics.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub raw: serde_json::Value,
}

impl ResourceState {
    /// The state of a resource that does not exist.
    pub fn absent() -> Self {
        Self::default()
    }

    /// The state of an existing resource.
    pub fn present(observed: Observed) -> Self {
        Self {
            exists: true,
            attributes: Some(observed.attributes),
            raw: observed.raw,
        }
    }
}

/// A resource as returned by the provider.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct Observed {
    /// The attributes, using the same names as [ResourceSpec::attributes].
    /// Providers may include additional attributes, such as `email` or `name`.
    pub attributes: Attributes,
    /// The provider payload.
    pub raw: serde_json::Value,
}

impl Observed {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            raw: serde_json::Value::Null,
        }
    }

    /// Sets the provider payload.
    pub fn set_raw<T: Into<serde_json::Value>>(mut self, v: T) -> Self {
        self.raw = v.into();
        self
    }
}
