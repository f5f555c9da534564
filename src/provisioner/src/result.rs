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

//! The terminal record of each resource in a session.

use crate::error::{Error, ErrorKind};
use crate::reconcile::Action;
use crate::resource::{ResourceKind, ResourceSpec};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// The reason attached to resources skipped because a dependency failed.
pub const DEPENDENCY_FAILED: &str = "dependency failed";

/// How the processing of a resource ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

/// The terminal record of one resource.
#[derive(Debug, Serialize)]
#[non_exhaustive]
pub struct ProvisioningResult {
    pub identifier: String,
    pub kind: ResourceKind,
    pub action: Action,
    pub outcome: Outcome,
    /// Present if and only if the outcome is [Outcome::Failed].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    /// Why a skipped resource was skipped.
    ///
    /// `None` for resources that were already converged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_cause: Option<ErrorKind>,
    pub reason: String,
    /// The caller-facing values yielded by the resource.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub produced_secrets: BTreeMap<String, String>,
}

impl ProvisioningResult {
    /// A mutation that completed.
    pub fn succeeded(
        spec: &ResourceSpec,
        action: Action,
        produced_secrets: BTreeMap<String, String>,
    ) -> Self {
        Self {
            produced_secrets,
            ..Self::new(spec, action, Outcome::Succeeded, "applied")
        }
    }

    /// A resource whose probe or mutation failed.
    pub fn failed(spec: &ResourceSpec, action: Action, error: Error) -> Self {
        let reason = error.to_string();
        Self {
            error: Some(error),
            ..Self::new(spec, action, Outcome::Failed, reason)
        }
    }

    /// A resource that did not need any change.
    pub fn converged<T: Into<String>>(
        spec: &ResourceSpec,
        reason: T,
        produced_secrets: BTreeMap<String, String>,
    ) -> Self {
        Self {
            produced_secrets,
            ..Self::new(spec, Action::NoOp, Outcome::Skipped, reason)
        }
    }

    /// A resource that was not processed.
    pub fn skipped<T: Into<String>>(
        spec: &ResourceSpec,
        action: Action,
        cause: ErrorKind,
        reason: T,
    ) -> Self {
        Self {
            skip_cause: Some(cause),
            ..Self::new(spec, action, Outcome::Skipped, reason)
        }
    }

    fn new<T: Into<String>>(
        spec: &ResourceSpec,
        action: Action,
        outcome: Outcome,
        reason: T,
    ) -> Self {
        Self {
            identifier: spec.identifier.clone(),
            kind: spec.kind,
            action,
            outcome,
            error: None,
            skip_cause: None,
            reason: reason.into(),
            produced_secrets: BTreeMap::new(),
        }
    }

    /// The classification of the failure or skip, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(Error::kind).or(self.skip_cause)
    }

    /// Returns true if the resources depending on this one must be skipped.
    ///
    /// Resources skipped because they cannot be changed in place still exist,
    /// so they do not block their dependents.
    pub fn blocks_dependents(&self) -> bool {
        match self.outcome {
            Outcome::Failed => true,
            Outcome::Succeeded => false,
            Outcome::Skipped => matches!(
                self.skip_cause,
                Some(
                    ErrorKind::DependencyFailed
                        | ErrorKind::Cancelled
                        | ErrorKind::Configuration
                )
            ),
        }
    }
}

/// The append-only list of results, shared by all the workers in a session.
#[derive(Debug, Default)]
pub struct ResultLog {
    results: Mutex<Vec<ProvisioningResult>>,
}

impl ResultLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a result.
    pub fn push(&self, result: ProvisioningResult) {
        let mut guard = self.results.lock().expect("result log mutex is poisoned");
        guard.push(result);
    }

    /// Returns the first dependency of `spec` that blocks it, if any.
    ///
    /// The returned kind is the skip cause for `spec`: a dependency that
    /// stopped because the session was cancelled propagates the
    /// cancellation, anything else is a dependency failure.
    pub fn blocking_dependency(&self, spec: &ResourceSpec) -> Option<(String, ErrorKind)> {
        let guard = self.results.lock().expect("result log mutex is poisoned");
        spec.depends_on.iter().find_map(|d| {
            let blocking = guard
                .iter()
                .find(|r| &r.identifier == d && r.blocks_dependents())?;
            let cause = match blocking.error_kind() {
                Some(ErrorKind::Cancelled) => ErrorKind::Cancelled,
                _ => ErrorKind::DependencyFailed,
            };
            Some((d.clone(), cause))
        })
    }

    /// Consumes the log, returning the results in the order they were
    /// recorded.
    pub fn into_inner(self) -> Vec<ProvisioningResult> {
        self.results
            .into_inner()
            .expect("result log mutex is poisoned")
    }
}
