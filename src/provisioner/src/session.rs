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

//! Orchestrates a complete provisioning run.
//!
//! A [Session] probes every declared resource, reconciles the observed state
//! with the declared state, orders the resources by their dependencies, and
//! executes the resulting actions. The [SessionReport] always lists one result
//! per declared resource, even if the session is aborted.

use crate::Result;
use crate::config::Configuration;
use crate::error::{Error, ErrorKind};
use crate::executor::{CANCELLED, Executor};
use crate::options::SessionOptions;
use crate::order::{layers, order};
use crate::probe::probe_all;
use crate::provider::ResourceProvider;
use crate::reconcile::{Action, ReconciliationAction, reconcile};
use crate::resource::{ResourceKind, ResourceSpec, ResourceState};
use crate::result::{DEPENDENCY_FAILED, Outcome, ProvisioningResult, ResultLog};
use crate::retry_policy::RetryPolicy;
use futures::StreamExt;
use google_cloud_gax::backoff_policy::BackoffPolicy;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The states of a provisioning session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Initialized,
    Probing,
    Reconciling,
    Ordering,
    Executing,
    /// All resources reached a terminal outcome and none failed.
    Completed,
    /// One or more resources failed, no fatal error occurred.
    CompletedWithFailures,
    /// The configuration is invalid, or the session was cancelled.
    Aborted,
}

impl SessionState {
    /// Returns true for the states that end a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithFailures | Self::Aborted
        )
    }
}

/// How much of the configuration was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Applied {
    /// No resource was created or updated, and some resources are not in the
    /// declared state.
    Nothing,
    /// Some resources were changed, and some are not in the declared state.
    Partial,
    /// Every resource is in the declared state.
    Full,
}

/// Builds a [Session].
#[derive(Debug)]
pub struct SessionBuilder {
    provider: Arc<dyn ResourceProvider>,
    options: SessionOptions,
}

impl SessionBuilder {
    /// Sets the retry policy for probes and mutations.
    pub fn with_retry_policy<P: RetryPolicy + 'static>(mut self, v: P) -> Self {
        self.options = self.options.set_retry_policy(v);
        self
    }

    /// Sets the backoff policy between attempts.
    pub fn with_backoff_policy<P: BackoffPolicy + 'static>(mut self, v: P) -> Self {
        self.options = self.options.set_backoff_policy(v);
        self
    }

    /// Sets the maximum number of concurrent provider calls.
    pub fn with_concurrency(mut self, v: usize) -> Self {
        self.options = self.options.set_concurrency(v);
        self
    }

    /// Sets the token used to cancel the session.
    pub fn with_cancellation_token(mut self, v: CancellationToken) -> Self {
        self.options = self.options.set_cancellation_token(v);
        self
    }

    pub fn build(self) -> Session {
        Session {
            provider: self.provider,
            options: self.options,
        }
    }
}

/// A provisioning session.
///
/// # Example
/// ```no_run
/// # use wif_provisioner::config::Configuration;
/// # use wif_provisioner::provider::ResourceProvider;
/// # use wif_provisioner::session::{Session, SessionState};
/// # async fn sample(provider: impl ResourceProvider + 'static, config: Configuration) {
/// let session = Session::builder(provider).with_concurrency(8).build();
/// let report = session.run(&config).await;
/// if report.state != SessionState::Completed {
///     eprintln!("{:?}", report.summary());
/// }
/// # }
/// ```
#[derive(Debug)]
pub struct Session {
    provider: Arc<dyn ResourceProvider>,
    options: SessionOptions,
}

impl Session {
    pub fn builder<P: ResourceProvider + 'static>(provider: P) -> SessionBuilder {
        SessionBuilder {
            provider: Arc::new(provider),
            options: SessionOptions::default(),
        }
    }

    /// Converges the project to `config`.
    pub async fn run(&self, config: &Configuration) -> SessionReport {
        let mut tracker = StateTracker::default();
        if let Err(e) = config.validate() {
            return abort(tracker, config, ErrorKind::Configuration, e);
        }

        tracker.transition(SessionState::Probing);
        let probes = probe_all(
            self.provider.as_ref(),
            &config.project,
            &config.resources,
            &self.options,
        )
        .await;
        if self.cancelled() {
            return abort(
                tracker,
                config,
                ErrorKind::Cancelled,
                Error::cancelled(CANCELLED),
            );
        }

        tracker.transition(SessionState::Reconciling);
        let mut plans: HashMap<&str, Plan> = config
            .resources
            .iter()
            .zip(probes)
            .map(|(spec, probe)| {
                let plan = match probe {
                    Ok(state) => Plan::Ready(reconcile(spec, &state), state),
                    Err(e) => Plan::ProbeFailed(e),
                };
                (spec.identifier.as_str(), plan)
            })
            .collect();

        tracker.transition(SessionState::Ordering);
        let layers = match layers(&config.resources) {
            Ok(l) => l,
            Err(e) => return abort(tracker, config, ErrorKind::Configuration, e),
        };

        tracker.transition(SessionState::Executing);
        let log = ResultLog::new();
        for layer in layers {
            let work: Vec<_> = layer
                .into_iter()
                .filter_map(|spec| {
                    plans
                        .remove(spec.identifier.as_str())
                        .map(|plan| (spec, plan))
                })
                .collect();
            futures::stream::iter(work)
                .map(|(spec, plan)| self.process(config, spec, plan, &log))
                .buffer_unordered(self.options.concurrency())
                .collect::<Vec<()>>()
                .await;
        }

        let results = log.into_inner();
        let (state, error) = if self.cancelled() {
            (SessionState::Aborted, Some(Error::cancelled(CANCELLED)))
        } else if results.iter().any(|r| r.outcome == Outcome::Failed) {
            (SessionState::CompletedWithFailures, None)
        } else {
            (SessionState::Completed, None)
        };
        tracker.transition(state);
        SessionReport {
            state,
            results,
            error,
        }
    }

    /// Computes the actions [run][Session::run] would apply, without applying
    /// them.
    ///
    /// The actions are returned in dependency order.
    pub async fn plan(&self, config: &Configuration) -> Result<Vec<PlannedAction>> {
        config.validate()?;
        let sorted = order(&config.resources)?;
        let probes = probe_all(
            self.provider.as_ref(),
            &config.project,
            &config.resources,
            &self.options,
        )
        .await;
        let mut actions: HashMap<&str, ReconciliationAction> = HashMap::new();
        for (spec, probe) in config.resources.iter().zip(probes) {
            actions.insert(spec.identifier.as_str(), reconcile(spec, &probe?));
        }
        Ok(sorted
            .into_iter()
            .filter_map(|spec| {
                actions
                    .remove(spec.identifier.as_str())
                    .map(|action| PlannedAction {
                        identifier: spec.identifier.clone(),
                        kind: spec.kind,
                        action,
                    })
            })
            .collect())
    }

    async fn process(
        &self,
        config: &Configuration,
        spec: &ResourceSpec,
        plan: Plan,
        log: &ResultLog,
    ) {
        let result = match plan {
            Plan::ProbeFailed(e) => {
                tracing::error!(identifier = %spec.identifier, "probe failed: {e}");
                ProvisioningResult::failed(spec, Action::Skip, e)
            }
            Plan::Ready(action, state) => {
                if let Some((dependency, cause)) = log.blocking_dependency(spec) {
                    let reason = match cause {
                        ErrorKind::Cancelled => CANCELLED,
                        _ => DEPENDENCY_FAILED,
                    };
                    tracing::warn!(
                        identifier = %spec.identifier,
                        %dependency,
                        "skipping resource, {reason}"
                    );
                    ProvisioningResult::skipped(
                        spec,
                        action.action,
                        cause,
                        format!("{reason}: `{dependency}`"),
                    )
                } else {
                    Executor::new(self.provider.as_ref(), &self.options)
                        .execute(&config.project, spec, &action, &state)
                        .await
                }
            }
        };
        log.push(result);
    }

    fn cancelled(&self) -> bool {
        self.options.cancellation_token().is_cancelled()
    }
}

enum Plan {
    Ready(ReconciliationAction, ResourceState),
    ProbeFailed(Error),
}

#[derive(Debug, Default)]
struct StateTracker {
    state: Option<SessionState>,
}

impl StateTracker {
    fn transition(&mut self, next: SessionState) {
        let from = self.state.unwrap_or(SessionState::Initialized);
        tracing::info!(?from, to = ?next, "session state transition");
        self.state = Some(next);
    }
}

fn abort(
    mut tracker: StateTracker,
    config: &Configuration,
    cause: ErrorKind,
    error: Error,
) -> SessionReport {
    tracing::error!("session aborted: {error}");
    tracker.transition(SessionState::Aborted);
    let reason = error.to_string();
    let results = config
        .resources
        .iter()
        .map(|spec| ProvisioningResult::skipped(spec, Action::Skip, cause, reason.clone()))
        .collect();
    SessionReport {
        state: SessionState::Aborted,
        results,
        error: Some(error),
    }
}

/// An action computed by [Session::plan].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[non_exhaustive]
pub struct PlannedAction {
    pub identifier: String,
    pub kind: ResourceKind,
    #[serde(flatten)]
    pub action: ReconciliationAction,
}

/// The outcome of a [Session::run].
#[derive(Debug, Serialize)]
#[non_exhaustive]
pub struct SessionReport {
    /// The terminal state of the session.
    pub state: SessionState,
    /// One result per declared resource, in the order they were recorded.
    pub results: Vec<ProvisioningResult>,
    /// The error that aborted the session, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl SessionReport {
    /// The result for a given resource.
    pub fn result(&self, identifier: &str) -> Option<&ProvisioningResult> {
        self.results.iter().find(|r| r.identifier == identifier)
    }

    /// All the caller-facing values, keyed by `<identifier>.<secret name>`.
    pub fn produced_secrets(&self) -> BTreeMap<String, String> {
        self.results
            .iter()
            .flat_map(|r| {
                r.produced_secrets
                    .iter()
                    .map(move |(k, v)| (format!("{}.{k}", r.identifier), v.clone()))
            })
            .collect()
    }

    /// Classifies how much of the configuration was applied.
    pub fn applied(&self) -> Applied {
        let converged = |r: &ProvisioningResult| {
            r.outcome == Outcome::Succeeded
                || (r.outcome == Outcome::Skipped && r.action == Action::NoOp)
        };
        if self.results.iter().all(converged) {
            return Applied::Full;
        }
        if self.results.iter().any(|r| r.outcome == Outcome::Succeeded) {
            return Applied::Partial;
        }
        Applied::Nothing
    }

    /// Aggregate counts for the session.
    pub fn summary(&self) -> Summary {
        let count = |o: Outcome| self.results.iter().filter(|r| r.outcome == o).count();
        Summary {
            state: self.state,
            applied: self.applied(),
            succeeded: count(Outcome::Succeeded),
            failed: count(Outcome::Failed),
            skipped: count(Outcome::Skipped),
            unchanged: self
                .results
                .iter()
                .filter(|r| r.action == Action::NoOp)
                .count(),
            produced_secrets: self.produced_secrets(),
        }
    }
}

/// The machine-readable summary of a session.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[non_exhaustive]
pub struct Summary {
    pub state: SessionState,
    pub applied: Applied,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// The number of resources already in the declared state.
    pub unchanged: usize,
    pub produced_secrets: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Project;
    use crate::error::{Code, Status};
    use crate::provider::MockResourceProvider;
    use crate::resource::{Attributes, Observed};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn not_found() -> Error {
        Error::service(Status::default().set_code(Code::NotFound))
    }

    fn config() -> Configuration {
        Configuration::new(Project::new("my-project"))
            .push(ResourceSpec::new(ResourceKind::ServiceAccount, "sa1"))
            .push(ResourceSpec::new(ResourceKind::IdentityPool, "pool1").set_depends_on(["sa1"]))
    }

    fn email() -> Observed {
        Observed::new(Attributes::from([(
            "email".to_string(),
            json!("sa1@my-project.iam.gserviceaccount.com"),
        )]))
    }

    #[tokio::test]
    async fn fresh() {
        let mut mock = MockResourceProvider::new();
        mock.expect_get_resource()
            .times(2)
            .returning(|_, _| Err(not_found()));
        mock.expect_create_resource()
            .times(2)
            .returning(|_, spec| match spec.kind {
                ResourceKind::ServiceAccount => Ok(email()),
                _ => Ok(Observed::default()),
            });
        let report = Session::builder(mock).build().run(&config()).await;
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.applied(), Applied::Full);
        let ids: Vec<_> = report.results.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["sa1", "pool1"]);
        assert_eq!(
            report.produced_secrets(),
            BTreeMap::from([(
                "sa1.service_account_email".to_string(),
                "sa1@my-project.iam.gserviceaccount.com".to_string()
            )])
        );
        let summary = report.summary();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.unchanged, 0);
    }

    #[tokio::test]
    async fn invalid_configuration() {
        let mock = MockResourceProvider::new();
        let config = config().push(ResourceSpec::new(ResourceKind::StorageBucket, "bucket"));
        let report = Session::builder(mock).build().run(&config).await;
        assert_eq!(report.state, SessionState::Aborted);
        assert_eq!(
            report.error.as_ref().map(Error::kind),
            Some(ErrorKind::Configuration)
        );
        assert_eq!(report.results.len(), 3);
        for r in &report.results {
            assert_eq!(r.outcome, Outcome::Skipped, "{r:?}");
            assert_eq!(r.skip_cause, Some(ErrorKind::Configuration), "{r:?}");
        }
        assert_eq!(report.applied(), Applied::Nothing);
    }

    #[tokio::test]
    async fn probe_failure_fails_resource_and_skips_dependents() {
        let mut mock = MockResourceProvider::new();
        mock.expect_get_resource().times(2).returning(|_, spec| {
            match spec.kind {
                ResourceKind::ServiceAccount => Err(Error::service(
                    Status::default().set_code(Code::PermissionDenied),
                )),
                _ => Err(not_found()),
            }
        });
        let report = Session::builder(mock).build().run(&config()).await;
        assert_eq!(report.state, SessionState::CompletedWithFailures);
        let sa = report.result("sa1").expect("sa1 has a result");
        assert_eq!(sa.outcome, Outcome::Failed);
        assert_eq!(sa.error_kind(), Some(ErrorKind::Permission));
        let pool = report.result("pool1").expect("pool1 has a result");
        assert_eq!(pool.outcome, Outcome::Skipped);
        assert_eq!(pool.skip_cause, Some(ErrorKind::DependencyFailed));
        assert!(pool.reason.starts_with(DEPENDENCY_FAILED), "{pool:?}");
        assert_eq!(report.applied(), Applied::Nothing);
    }

    #[tokio::test]
    async fn partial() {
        let mut mock = MockResourceProvider::new();
        mock.expect_get_resource()
            .times(3)
            .returning(|_, _| Err(not_found()));
        mock.expect_create_resource()
            .times(2)
            .returning(|_, spec| match spec.identifier.as_str() {
                "sa1" => Ok(email()),
                _ => Err(Error::service(
                    Status::default().set_code(Code::InvalidArgument),
                )),
            });
        let config = config().push(
            ResourceSpec::new(ResourceKind::IdentityPool, "pool2").set_depends_on(["pool1"]),
        );
        let report = Session::builder(mock).build().run(&config).await;
        assert_eq!(report.state, SessionState::CompletedWithFailures);
        assert_eq!(report.applied(), Applied::Partial);
        let summary = report.summary();
        assert_eq!(
            (summary.succeeded, summary.failed, summary.skipped),
            (1, 1, 1)
        );
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let mut mock = MockResourceProvider::new();
        mock.expect_get_resource().never();
        let token = CancellationToken::new();
        token.cancel();
        let report = Session::builder(mock)
            .with_cancellation_token(token)
            .build()
            .run(&config())
            .await;
        assert_eq!(report.state, SessionState::Aborted);
        assert_eq!(report.results.len(), 2);
        for r in &report.results {
            assert_eq!(r.skip_cause, Some(ErrorKind::Cancelled), "{r:?}");
        }
    }

    #[tokio::test]
    async fn plan() -> anyhow::Result<()> {
        let mut mock = MockResourceProvider::new();
        mock.expect_get_resource()
            .times(2)
            .returning(|_, spec| match spec.kind {
                ResourceKind::ServiceAccount => Ok(email()),
                _ => Err(not_found()),
            });
        mock.expect_create_resource().never();
        let config = Configuration::new(Project::new("my-project"))
            .push(ResourceSpec::new(ResourceKind::IdentityPool, "pool1").set_depends_on(["sa1"]))
            .push(ResourceSpec::new(ResourceKind::ServiceAccount, "sa1"));
        let got = Session::builder(mock).build().plan(&config).await?;
        let got: Vec<_> = got
            .iter()
            .map(|p| (p.identifier.as_str(), p.action.action))
            .collect();
        assert_eq!(got, vec![("sa1", Action::NoOp), ("pool1", Action::Create)]);
        Ok(())
    }

    #[tokio::test]
    async fn plan_rejects_cycles() {
        let mut mock = MockResourceProvider::new();
        mock.expect_get_resource().never();
        let config = Configuration::new(Project::new("my-project"))
            .push(ResourceSpec::new(ResourceKind::IdentityPool, "a").set_depends_on(["b"]))
            .push(ResourceSpec::new(ResourceKind::IdentityPool, "b").set_depends_on(["a"]));
        let err = Session::builder(mock).build().plan(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration, "{err:?}");
    }

    #[test]
    fn summary_serialize() -> anyhow::Result<()> {
        let spec = ResourceSpec::new(ResourceKind::ServiceAccount, "sa1");
        let report = SessionReport {
            state: SessionState::Completed,
            results: vec![ProvisioningResult::converged(
                &spec,
                "match",
                BTreeMap::from([("service_account_email".to_string(), "e".to_string())]),
            )],
            error: None,
        };
        let got = serde_json::to_value(report.summary())?;
        assert_eq!(
            got,
            json!({
                "state": "Completed",
                "applied": "Full",
                "succeeded": 0,
                "failed": 0,
                "skipped": 1,
                "unchanged": 1,
                "produced_secrets": {"sa1.service_account_email": "e"},
            })
        );
        Ok(())
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Aborted.is_terminal());
        assert!(!SessionState::Executing.is_terminal());
    }
}
