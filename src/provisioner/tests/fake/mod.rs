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

//! An in-memory cloud project, used to drive complete sessions.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;
use wif_provisioner::Result;
use wif_provisioner::config::Project;
use wif_provisioner::error::{Code, Error, Status};
use wif_provisioner::provider::ResourceProvider;
use wif_provisioner::resource::{Attributes, Observed, ResourceKind, ResourceSpec};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Get(String),
    Start(String),
    Finish(String),
}

#[derive(Debug, Default)]
pub struct FakeProvider {
    resources: Mutex<BTreeMap<String, Attributes>>,
    events: Mutex<Vec<Event>>,
    failures: Mutex<HashMap<String, VecDeque<Code>>>,
    rendezvous: Option<(Vec<String>, Arc<Barrier>)>,
    cancel_after: Option<(String, CancellationToken)>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource to the project, as if created out of band.
    pub fn with_existing(self, spec: &ResourceSpec, project: &Project) -> Self {
        let attributes = observed_attributes(project, spec);
        self.insert(&spec.identifier, attributes);
        self
    }

    /// Adds a resource with explicit attributes.
    pub fn with_attributes(self, identifier: &str, attributes: Attributes) -> Self {
        self.insert(identifier, attributes);
        self
    }

    /// Mutations of `identifier` fail with these codes, in order.
    pub fn with_failures<I>(self, identifier: &str, codes: I) -> Self
    where
        I: IntoIterator<Item = Code>,
    {
        self.failures
            .lock()
            .expect("failures are poisoned")
            .insert(identifier.to_string(), codes.into_iter().collect());
        self
    }

    /// Mutations of the given resources wait until all of them are in flight.
    pub fn with_rendezvous(mut self, identifiers: &[&str]) -> Self {
        let barrier = Arc::new(Barrier::new(identifiers.len()));
        self.rendezvous = Some((identifiers.iter().map(|s| s.to_string()).collect(), barrier));
        self
    }

    /// Cancels `token` once the mutation of `identifier` completes.
    pub fn with_cancel_after(mut self, identifier: &str, token: CancellationToken) -> Self {
        self.cancel_after = Some((identifier.to_string(), token));
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events are poisoned").clone()
    }

    /// The identifiers of all the mutating calls, in the order they started.
    pub fn mutations(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Start(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn attributes(&self, identifier: &str) -> Option<Attributes> {
        self.resources
            .lock()
            .expect("resources are poisoned")
            .get(identifier)
            .cloned()
    }

    fn insert(&self, identifier: &str, attributes: Attributes) {
        self.resources
            .lock()
            .expect("resources are poisoned")
            .insert(identifier.to_string(), attributes);
    }

    fn record(&self, event: Event) {
        self.events.lock().expect("events are poisoned").push(event);
    }

    async fn mutate(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        let id = spec.identifier.clone();
        self.record(Event::Start(id.clone()));
        if let Some((ids, barrier)) = &self.rendezvous {
            if ids.contains(&id) {
                tokio::time::timeout(Duration::from_secs(5), barrier.wait())
                    .await
                    .map_err(Error::timeout)?;
            }
        }
        let failure = self
            .failures
            .lock()
            .expect("failures are poisoned")
            .get_mut(&id)
            .and_then(|q| q.pop_front());
        if let Some(code) = failure {
            self.record(Event::Finish(id));
            return Err(Error::service(
                Status::default()
                    .set_code(code)
                    .set_message(format!("injected failure for {}", spec.identifier)),
            ));
        }
        let attributes = observed_attributes(project, spec);
        self.insert(&id, attributes.clone());
        self.record(Event::Finish(id.clone()));
        if let Some((target, token)) = &self.cancel_after {
            if *target == id {
                token.cancel();
            }
        }
        Ok(Observed::new(attributes))
    }
}

#[async_trait::async_trait]
impl ResourceProvider for FakeProvider {
    async fn get_resource(&self, _project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        self.record(Event::Get(spec.identifier.clone()));
        match self.attributes(&spec.identifier) {
            Some(attributes) => Ok(Observed::new(attributes)),
            None => Err(Error::service(
                Status::default()
                    .set_code(Code::NotFound)
                    .set_message(format!("{} not found", spec.identifier)),
            )),
        }
    }

    async fn create_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        self.mutate(project, spec).await
    }

    async fn update_resource(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        self.mutate(project, spec).await
    }

    async fn bind_policy(&self, project: &Project, spec: &ResourceSpec) -> Result<Observed> {
        self.mutate(project, spec).await
    }
}

/// The declared attributes plus the attributes the cloud provider populates.
pub fn observed_attributes(project: &Project, spec: &ResourceSpec) -> Attributes {
    let mut attributes = spec.attributes.clone();
    match spec.kind {
        ResourceKind::ServiceAccount => {
            attributes.insert(
                "email".to_string(),
                format!(
                    "{}@{}.iam.gserviceaccount.com",
                    spec.identifier, project.project_id
                )
                .into(),
            );
        }
        ResourceKind::OidcProvider => {
            attributes.insert(
                "name".to_string(),
                format!(
                    "projects/{}/locations/global/workloadIdentityPools/{}/providers/{}",
                    project.project_number.as_deref().unwrap_or("0"),
                    spec.attribute_str("pool").unwrap_or_default(),
                    spec.identifier
                )
                .into(),
            );
        }
        _ => {}
    }
    attributes
}
