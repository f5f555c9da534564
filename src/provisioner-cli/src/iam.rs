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

//! The subset of the IAM policy format used by the provisioner.
//!
//! Projects and service accounts use the same JSON policy format. Fields not
//! listed here are preserved across a read-modify-write cycle. The helpers at
//! the end are shared with the bucket policies in [crate::storage].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use wif_provisioner::Result;
use wif_provisioner::error::{Code, Error, Status};
use wif_provisioner::resource::{Observed, ResourceSpec};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Policy {
    /// The members granted `role` without a condition.
    pub fn members(&self, role: &str) -> BTreeSet<&str> {
        self.unconditional(role)
            .flat_map(|b| b.members.iter().map(String::as_str))
            .collect()
    }

    /// Grants `role` to `members`, returns true if the policy changed.
    ///
    /// Conditional bindings for the same role are left untouched.
    pub fn grant<'a, I>(&mut self, role: &str, members: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let existing = self.members(role);
        let missing: Vec<String> = members
            .into_iter()
            .filter(|m| !existing.contains(m))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if missing.is_empty() {
            return false;
        }
        match self
            .bindings
            .iter_mut()
            .find(|b| b.role == role && b.condition.is_none())
        {
            Some(binding) => binding.members.extend(missing),
            None => self.bindings.push(Binding {
                role: role.to_string(),
                members: missing,
                ..Default::default()
            }),
        }
        true
    }

    fn unconditional<'a>(&'a self, role: &str) -> impl Iterator<Item = &'a Binding> {
        self.bindings
            .iter()
            .filter(move |b| b.role == role && b.condition.is_none())
    }
}

/// The principals declared by an IAM binding.
pub fn declared_members(spec: &ResourceSpec) -> Result<Vec<String>> {
    spec.attributes
        .get("members")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|m| m.as_str().map(str::to_string))
                .collect()
        })
        .ok_or_else(|| {
            Error::invalid_argument(format!(
                "the `members` of {} should be a list of principals",
                spec.identifier
            ))
        })
}

/// Reports the declared members already granted `role`.
///
/// A binding without any granted member does not exist yet.
pub fn observe_members(
    spec: &ResourceSpec,
    role: &str,
    declared: &[String],
    granted: &BTreeSet<&str>,
    raw: Value,
) -> Result<Observed> {
    let present: Vec<&str> = declared
        .iter()
        .map(String::as_str)
        .filter(|m| granted.contains(m))
        .collect();
    if present.is_empty() {
        return Err(Error::service(
            Status::default().set_code(Code::NotFound).set_message(format!(
                "none of the members of {} are granted {role}",
                spec.identifier
            )),
        ));
    }
    let mut attributes = spec.attributes.clone();
    attributes.insert("members".to_string(), json!(present));
    Ok(Observed::new(attributes).set_raw(raw))
}
