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

//! Decides what to do with each declared resource.
//!
//! The reconciler compares the declared attributes of a resource with the
//! attributes observed by the probe. It performs no I/O, the same inputs always
//! produce the same action.

use crate::resource::{Attributes, ResourceKind, ResourceSpec, ResourceState};
use serde::Serialize;

/// The reason attached to a [Action::Skip] for immutable attributes.
pub const MANUAL_RECREATION_REQUIRED: &str = "manual recreation required";

/// The action to apply to a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    /// The resource does not exist.
    Create,
    /// The resource exists and some mutable attributes differ.
    Update,
    /// The resource exists and cannot be changed in place, or was not
    /// processed.
    Skip,
    /// The resource exists with the declared attributes.
    NoOp,
}

impl Action {
    /// Returns true if the action calls a mutating provider operation.
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Create | Self::Update)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Skip => "Skip",
            Self::NoOp => "NoOp",
        };
        f.write_str(name)
    }
}

/// The output of the reconciler for one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct ReconciliationAction {
    pub action: Action,
    /// A summary of the attribute differences that justify the action.
    pub reason: String,
}

impl ReconciliationAction {
    pub fn new<T: Into<String>>(action: Action, reason: T) -> Self {
        Self {
            action,
            reason: reason.into(),
        }
    }
}

/// Computes the action needed to converge `state` to `spec`.
///
/// Only the declared attributes are compared. Attributes populated by the
/// provider, such as the email of a service account, are ignored.
///
/// # Example
/// ```
/// # use wif_provisioner::reconcile::{Action, reconcile};
/// # use wif_provisioner::resource::{ResourceKind, ResourceSpec, ResourceState};
/// let spec = ResourceSpec::new(ResourceKind::IdentityPool, "pool1");
/// assert_eq!(reconcile(&spec, &ResourceState::absent()).action, Action::Create);
/// ```
pub fn reconcile(spec: &ResourceSpec, state: &ResourceState) -> ReconciliationAction {
    if !state.exists {
        return ReconciliationAction::new(Action::Create, "the resource does not exist");
    }
    let empty = Attributes::new();
    let observed = state.attributes.as_ref().unwrap_or(&empty);
    let diffs = diff(spec, observed);
    if diffs.is_empty() {
        return ReconciliationAction::new(Action::NoOp, "the declared attributes match");
    }
    let immutable = spec.kind.immutable_attributes();
    let (frozen, mutable): (Vec<_>, Vec<_>) = diffs
        .into_iter()
        .partition(|d| immutable.contains(&d.name));
    if !frozen.is_empty() {
        return ReconciliationAction::new(
            Action::Skip,
            format!(
                "{MANUAL_RECREATION_REQUIRED}: immutable attributes differ: {}",
                summary(&frozen)
            ),
        );
    }
    ReconciliationAction::new(Action::Update, summary(&mutable))
}

#[derive(Debug)]
struct AttributeDiff<'a> {
    name: &'a str,
    declared: &'a serde_json::Value,
    observed: Option<&'a serde_json::Value>,
}

fn diff<'a>(spec: &'a ResourceSpec, observed: &'a Attributes) -> Vec<AttributeDiff<'a>> {
    spec.attributes
        .iter()
        .filter_map(|(name, declared)| {
            let actual = observed.get(name);
            match actual {
                Some(v) if attribute_eq(spec.kind, name, declared, v) => None,
                _ => Some(AttributeDiff {
                    name,
                    declared,
                    observed: actual,
                }),
            }
        })
        .collect()
}

fn attribute_eq(
    kind: ResourceKind,
    name: &str,
    declared: &serde_json::Value,
    observed: &serde_json::Value,
) -> bool {
    if !kind.set_valued_attributes().contains(&name) {
        return declared == observed;
    }
    match (declared.as_array(), observed.as_array()) {
        (Some(d), Some(o)) => d.iter().all(|v| o.contains(v)) && o.iter().all(|v| d.contains(v)),
        _ => declared == observed,
    }
}

fn summary(diffs: &[AttributeDiff<'_>]) -> String {
    diffs
        .iter()
        .map(|d| match d.observed {
            None => format!("{}: missing, declared {}", d.name, d.declared),
            Some(o) => format!("{}: observed {o}, declared {}", d.name, d.declared),
        })
        .collect::<Vec<_>>()
        .join("; ")
}
