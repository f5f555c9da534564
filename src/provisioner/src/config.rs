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

//! The declared configuration for a provisioning session.
//!
//! A [Configuration] is built once per session and never changes while the
//! session runs. It is passed by reference to every component.

use crate::Result;
use crate::error::Error;
use crate::resource::{ResourceKind, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// The problems detected while loading or validating a [Configuration].
///
/// These are always returned wrapped in an [Error] with
/// [ErrorKind::Configuration][crate::error::ErrorKind::Configuration].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("the project id is empty")]
    EmptyProjectId,
    #[error("the resource at position {0} has an empty identifier")]
    EmptyIdentifier(usize),
    #[error("the identifier `{0}` is declared more than once")]
    DuplicateIdentifier(String),
    #[error("`{identifier}` depends on `{dependency}`, which is not declared")]
    UnknownDependency {
        identifier: String,
        dependency: String,
    },
    #[error("`{0}` depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle between [{}]", .0.join(", "))]
    DependencyCycle(Vec<String>),
    #[error("`{identifier}` is a {kind} and requires the `{attribute}` attribute")]
    MissingAttribute {
        identifier: String,
        kind: ResourceKind,
        attribute: &'static str,
    },
    #[error("the configuration requires the {0} of the project")]
    MissingProjectField(&'static str),
    #[error("cannot parse the configuration: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("cannot read the configuration file: {0}")]
    Io(#[source] std::io::Error),
}

impl From<ConfigError> for Error {
    fn from(value: ConfigError) -> Self {
        Error::configuration(value)
    }
}

/// The cloud project receiving the resources.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Project {
    /// The project id, e.g. `my-project`.
    pub project_id: String,
    /// The project number. Workload identity pool principals are named using
    /// the number, not the id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_number: Option<String>,
    /// The repository allowed to impersonate the service account, in
    /// `owner/name` format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl Project {
    pub fn new<T: Into<String>>(project_id: T) -> Self {
        Self {
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    /// Sets the project number.
    pub fn set_project_number<T: Into<String>>(mut self, v: T) -> Self {
        self.project_number = Some(v.into());
        self
    }

    /// Sets the repository.
    pub fn set_repository<T: Into<String>>(mut self, v: T) -> Self {
        self.repository = Some(v.into());
        self
    }
}

/// The desired state of a cloud project.
///
/// # Example
/// ```
/// # use wif_provisioner::config::Configuration;
/// let config = Configuration::from_json(r#"{
///     "project": {"project_id": "my-project"},
///     "resources": [
///         {"kind": "identity_pool", "identifier": "pool1"},
///         {"kind": "oidc_provider", "identifier": "prov1", "depends_on": ["pool1"],
///          "attributes": {"pool": "pool1", "issuer_uri": "https://issuer.example.com"}}
///     ]
/// }"#)?;
/// assert_eq!(config.resources.len(), 2);
/// # Ok::<(), wif_provisioner::error::Error>(())
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Configuration {
    pub project: Project,
    /// The resources in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

impl Configuration {
    pub fn new(project: Project) -> Self {
        Self {
            project,
            resources: Vec::new(),
        }
    }

    /// Appends a resource.
    pub fn push(mut self, spec: ResourceSpec) -> Self {
        self.resources.push(spec);
        self
    }

    /// Parses a configuration from its JSON representation.
    ///
    /// The result is not validated, use [Configuration::validate].
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e).into())
    }

    /// Loads a configuration from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json(&contents)
    }

    /// Finds a resource by identifier.
    pub fn resource(&self, identifier: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.identifier == identifier)
    }

    /// Verifies the configuration is well-formed.
    ///
    /// Dependency cycles are detected later, when the resources are ordered.
    pub fn validate(&self) -> Result<()> {
        if self.project.project_id.is_empty() {
            return Err(ConfigError::EmptyProjectId.into());
        }
        let mut identifiers = BTreeSet::new();
        for (index, spec) in self.resources.iter().enumerate() {
            if spec.identifier.is_empty() {
                return Err(ConfigError::EmptyIdentifier(index).into());
            }
            if !identifiers.insert(spec.identifier.as_str()) {
                return Err(ConfigError::DuplicateIdentifier(spec.identifier.clone()).into());
            }
            if let Some(attribute) = spec
                .kind
                .required_attributes()
                .iter()
                .copied()
                .find(|a| !spec.attributes.contains_key(*a))
            {
                return Err(ConfigError::MissingAttribute {
                    identifier: spec.identifier.clone(),
                    kind: spec.kind,
                    attribute,
                }
                .into());
            }
        }
        for spec in &self.resources {
            if spec.depends_on.contains(&spec.identifier) {
                return Err(ConfigError::SelfDependency(spec.identifier.clone()).into());
            }
            if let Some(dependency) = spec
                .depends_on
                .iter()
                .find(|d| !identifiers.contains(d.as_str()))
            {
                return Err(ConfigError::UnknownDependency {
                    identifier: spec.identifier.clone(),
                    dependency: dependency.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::io::Write;

    fn sample() -> Configuration {
        Configuration::new(Project::new("my-project"))
            .push(ResourceSpec::new(ResourceKind::ServiceAccount, "sa1"))
            .push(ResourceSpec::new(ResourceKind::IdentityPool, "pool1"))
            .push(
                ResourceSpec::new(ResourceKind::OidcProvider, "prov1")
                    .set_attribute("pool", "pool1")
                    .set_attribute("issuer_uri", "https://issuer.example.com")
                    .set_depends_on(["pool1"]),
            )
    }

    fn source_of(error: &Error) -> Option<&ConfigError> {
        std::error::Error::source(error).and_then(|e| e.downcast_ref::<ConfigError>())
    }

    #[test]
    fn valid() -> anyhow::Result<()> {
        sample().validate()?;
        Configuration::new(Project::new("empty")).validate()?;
        Ok(())
    }

    #[test]
    fn empty_project_id() {
        let err = Configuration::new(Project::new("")).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(
            matches!(source_of(&err), Some(ConfigError::EmptyProjectId)),
            "{err:?}"
        );
    }

    #[test]
    fn empty_identifier() {
        let config = sample().push(ResourceSpec::new(ResourceKind::IdentityPool, ""));
        let err = config.validate().unwrap_err();
        assert!(
            matches!(source_of(&err), Some(ConfigError::EmptyIdentifier(3))),
            "{err:?}"
        );
    }

    #[test]
    fn duplicate_identifier() {
        // Identifiers are unique across kinds.
        let config = sample().push(ResourceSpec::new(ResourceKind::ServiceAccount, "pool1"));
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(
            matches!(source_of(&err), Some(ConfigError::DuplicateIdentifier(id)) if id == "pool1"),
            "{err:?}"
        );
    }

    #[test]
    fn unknown_dependency() {
        let config = sample().push(
            ResourceSpec::new(ResourceKind::IdentityPool, "pool2").set_depends_on(["missing"]),
        );
        let err = config.validate().unwrap_err();
        assert!(
            matches!(source_of(&err), Some(ConfigError::UnknownDependency { identifier, dependency }) if identifier == "pool2" && dependency == "missing"),
            "{err:?}"
        );
    }

    #[test]
    fn self_dependency() {
        let config = sample().push(
            ResourceSpec::new(ResourceKind::IdentityPool, "pool2").set_depends_on(["pool2"]),
        );
        let err = config.validate().unwrap_err();
        assert!(
            matches!(source_of(&err), Some(ConfigError::SelfDependency(id)) if id == "pool2"),
            "{err:?}"
        );
    }

    #[test]
    fn missing_attribute() {
        let config = sample().push(ResourceSpec::new(ResourceKind::StorageBucket, "bucket"));
        let err = config.validate().unwrap_err();
        assert!(
            matches!(
                source_of(&err),
                Some(ConfigError::MissingAttribute {
                    attribute: "location",
                    ..
                })
            ),
            "{err:?}"
        );
        assert!(err.to_string().contains("location"), "{err}");
    }

    #[test]
    fn from_json() -> anyhow::Result<()> {
        let json = json!({
            "project": {"project_id": "my-project", "project_number": "123456"},
            "resources": [
                {"kind": "service_account", "identifier": "sa1",
                 "attributes": {"display_name": "CI"}},
            ]
        });
        let config = Configuration::from_json(&json.to_string())?;
        assert_eq!(config.project.project_number.as_deref(), Some("123456"));
        assert_eq!(config.project.repository, None);
        assert_eq!(
            config
                .resource("sa1")
                .and_then(|r| r.attribute_str("display_name")),
            Some("CI")
        );
        Ok(())
    }

    #[test]
    fn from_json_error() {
        let err = Configuration::from_json("{").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(source_of(&err), Some(ConfigError::Parse(_))), "{err:?}");
    }

    #[test]
    fn from_path() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(serde_json::to_string(&sample())?.as_bytes())?;
        let got = Configuration::from_path(file.path())?;
        assert_eq!(got, sample());

        let err = Configuration::from_path("/does/not/exist.json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(source_of(&err), Some(ConfigError::Io(_))), "{err:?}");
        Ok(())
    }
}
