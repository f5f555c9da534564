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

//! Applies one reconciliation action through the provider.

use crate::Result;
use crate::config::Project;
use crate::error::ErrorKind;
use crate::options::SessionOptions;
use crate::provider::ResourceProvider;
use crate::reconcile::{Action, ReconciliationAction};
use crate::resource::{Observed, ResourceKind, ResourceSpec, ResourceState};
use crate::result::ProvisioningResult;
use crate::retry_loop::retry_loop;

/// The reason attached to mutations that were not dispatched because the
/// session was cancelled.
pub const CANCELLED: &str = "the session was cancelled";

/// Applies reconciliation actions, retrying transient errors.
///
/// The executor never returns an error: every failure is classified and
/// recorded in the [ProvisioningResult].
#[derive(Debug)]
pub struct Executor<'a> {
    provider: &'a dyn ResourceProvider,
    options: &'a SessionOptions,
}

impl<'a> Executor<'a> {
    pub fn new(provider: &'a dyn ResourceProvider, options: &'a SessionOptions) -> Self {
        Self { provider, options }
    }

    /// Applies `action` to the resource described by `spec`.
    ///
    /// `state` is the state observed by the probe. It is only used to report
    /// the caller-facing values of resources that need no change.
    #[tracing::instrument(skip_all, fields(identifier = %spec.identifier, kind = %spec.kind, action = %action.action))]
    pub async fn execute(
        &self,
        project: &Project,
        spec: &ResourceSpec,
        action: &ReconciliationAction,
        state: &ResourceState,
    ) -> ProvisioningResult {
        match action.action {
            Action::NoOp => {
                let secrets = state
                    .attributes
                    .as_ref()
                    .map(|a| spec.kind.produced_secrets(a))
                    .unwrap_or_default();
                tracing::debug!("no changes needed");
                return ProvisioningResult::converged(spec, action.reason.clone(), secrets);
            }
            Action::Skip => {
                tracing::warn!(reason = %action.reason, "skipping resource");
                return ProvisioningResult::skipped(
                    spec,
                    Action::Skip,
                    ErrorKind::Conflict,
                    action.reason.clone(),
                );
            }
            Action::Create | Action::Update => {}
        }
        if self.options.cancellation_token().is_cancelled() {
            return ProvisioningResult::skipped(
                spec,
                action.action,
                ErrorKind::Cancelled,
                CANCELLED,
            );
        }
        match self.mutate(project, spec, action.action).await {
            Ok(observed) => {
                tracing::info!("resource applied");
                let secrets = spec.kind.produced_secrets(&observed.attributes);
                ProvisioningResult::succeeded(spec, action.action, secrets)
            }
            Err(e) if action.action == Action::Create && e.kind() == ErrorKind::Conflict => {
                tracing::warn!("resource created concurrently by another writer: {e}");
                ProvisioningResult::skipped(
                    spec,
                    action.action,
                    ErrorKind::Conflict,
                    format!("the resource already exists: {e}"),
                )
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => {
                tracing::warn!("retry abandoned: {e}");
                ProvisioningResult::skipped(spec, action.action, ErrorKind::Cancelled, CANCELLED)
            }
            Err(e) => {
                tracing::error!("resource failed: {e}");
                ProvisioningResult::failed(spec, action.action, e)
            }
        }
    }

    async fn mutate(
        &self,
        project: &Project,
        spec: &ResourceSpec,
        action: Action,
    ) -> Result<Observed> {
        let provider = self.provider;
        retry_loop(
            move || async move {
                match (spec.kind, action) {
                    (ResourceKind::IamBinding, _) => provider.bind_policy(project, spec).await,
                    (_, Action::Update) => provider.update_resource(project, spec).await,
                    _ => provider.create_resource(project, spec).await,
                }
            },
            self.options.retry_policy(),
            self.options.backoff_policy(),
            self.options.cancellation_token(),
            |attempt, error, delay| {
                tracing::warn!(attempt, ?delay, "provider call failed, retrying: {error}");
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Code, Error, Status, StatusDetails};
    use crate::provider::MockResourceProvider;
    use crate::reconcile::MANUAL_RECREATION_REQUIRED;
    use crate::resource::Attributes;
    use crate::result::Outcome;
    use google_cloud_rpc::model::ErrorInfo;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn project() -> Project {
        Project::new("my-project")
    }

    fn status(code: Code) -> Error {
        Error::service(Status::default().set_code(code).set_message("test"))
    }

    fn service_account() -> ResourceSpec {
        ResourceSpec::new(ResourceKind::ServiceAccount, "sa1")
    }

    fn email() -> Observed {
        Observed::new(Attributes::from([(
            "email".to_string(),
            json!("sa1@my-project.iam.gserviceaccount.com"),
        )]))
    }

    fn action(action: Action) -> ReconciliationAction {
        ReconciliationAction::new(action, "test")
    }

    #[tokio::test]
    async fn create() {
        let mut mock = MockResourceProvider::new();
        mock.expect_create_resource()
            .times(1)
            .returning(|_, _| Ok(email()));
        let options = SessionOptions::new();
        let executor = Executor::new(&mock, &options);
        let got = executor
            .execute(
                &project(),
                &service_account(),
                &action(Action::Create),
                &ResourceState::absent(),
            )
            .await;
        assert_eq!(got.outcome, Outcome::Succeeded, "{got:?}");
        assert_eq!(got.action, Action::Create);
        assert_eq!(
            got.produced_secrets.get("service_account_email").map(String::as_str),
            Some("sa1@my-project.iam.gserviceaccount.com")
        );
    }

    #[tokio::test]
    async fn update() {
        let mut mock = MockResourceProvider::new();
        mock.expect_update_resource()
            .times(1)
            .returning(|_, _| Ok(Observed::default()));
        let options = SessionOptions::new();
        let spec = ResourceSpec::new(ResourceKind::StorageBucket, "bucket")
            .set_attribute("location", "US");
        let got = Executor::new(&mock, &options)
            .execute(&project(), &spec, &action(Action::Update), &ResourceState::absent())
            .await;
        assert_eq!(got.outcome, Outcome::Succeeded, "{got:?}");
        assert!(got.produced_secrets.is_empty());
    }

    #[tokio::test]
    async fn bindings_use_bind_policy() {
        let mut mock = MockResourceProvider::new();
        mock.expect_bind_policy()
            .times(2)
            .returning(|_, _| Ok(Observed::default()));
        let options = SessionOptions::new();
        let spec = ResourceSpec::new(ResourceKind::IamBinding, "bind1");
        let executor = Executor::new(&mock, &options);
        for a in [Action::Create, Action::Update] {
            let got = executor
                .execute(&project(), &spec, &action(a), &ResourceState::absent())
                .await;
            assert_eq!(got.outcome, Outcome::Succeeded, "{got:?}");
        }
    }

    #[tokio::test]
    async fn noop_reports_observed_secrets() {
        let mock = MockResourceProvider::new();
        let options = SessionOptions::new();
        let got = Executor::new(&mock, &options)
            .execute(
                &project(),
                &service_account(),
                &action(Action::NoOp),
                &ResourceState::present(email()),
            )
            .await;
        assert_eq!(got.outcome, Outcome::Skipped, "{got:?}");
        assert_eq!(got.action, Action::NoOp);
        assert!(got.skip_cause.is_none(), "{got:?}");
        assert!(got.produced_secrets.contains_key("service_account_email"));
    }

    #[tokio::test]
    async fn skip_makes_no_calls() {
        let mock = MockResourceProvider::new();
        let options = SessionOptions::new();
        let got = Executor::new(&mock, &options)
            .execute(
                &project(),
                &service_account(),
                &ReconciliationAction::new(Action::Skip, MANUAL_RECREATION_REQUIRED),
                &ResourceState::present(email()),
            )
            .await;
        assert_eq!(got.outcome, Outcome::Skipped, "{got:?}");
        assert_eq!(got.skip_cause, Some(ErrorKind::Conflict));
        assert_eq!(got.reason, MANUAL_RECREATION_REQUIRED);
        assert!(got.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors() {
        let mut mock = MockResourceProvider::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_create_resource()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(status(Code::Unavailable)));
        mock.expect_create_resource()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(email()));
        let options = SessionOptions::new();
        let got = Executor::new(&mock, &options)
            .execute(
                &project(),
                &service_account(),
                &action(Action::Create),
                &ResourceState::absent(),
            )
            .await;
        assert_eq!(got.outcome, Outcome::Succeeded, "{got:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_after_five_attempts() {
        let mut mock = MockResourceProvider::new();
        mock.expect_create_resource()
            .times(5)
            .returning(|_, _| Err(status(Code::ResourceExhausted)));
        let options = SessionOptions::new();
        let got = Executor::new(&mock, &options)
            .execute(
                &project(),
                &service_account(),
                &action(Action::Create),
                &ResourceState::absent(),
            )
            .await;
        assert_eq!(got.outcome, Outcome::Failed, "{got:?}");
        assert_eq!(got.error_kind(), Some(ErrorKind::ExhaustedRetries));
        let status = got.error.as_ref().and_then(|e| e.status());
        assert_eq!(status.map(|s| s.code), Some(Code::ResourceExhausted));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        for (code, kind) in [
            (Code::PermissionDenied, ErrorKind::Permission),
            (Code::InvalidArgument, ErrorKind::InvalidArgument),
        ] {
            let mut mock = MockResourceProvider::new();
            mock.expect_create_resource()
                .times(1)
                .returning(move |_, _| Err(status(code)));
            let options = SessionOptions::new();
            let got = Executor::new(&mock, &options)
                .execute(
                    &project(),
                    &service_account(),
                    &action(Action::Create),
                    &ResourceState::absent(),
                )
                .await;
            assert_eq!(got.outcome, Outcome::Failed, "{got:?}");
            assert_eq!(got.error_kind(), Some(kind), "{got:?}");
        }
    }

    #[tokio::test]
    async fn quota_is_not_retried() {
        let mut mock = MockResourceProvider::new();
        mock.expect_create_resource().times(1).returning(|_, _| {
            Err(Error::service(
                Status::default()
                    .set_code(Code::ResourceExhausted)
                    .set_details([StatusDetails::ErrorInfo(
                        ErrorInfo::new().set_reason("RESOURCE_QUOTA_EXCEEDED"),
                    )]),
            ))
        });
        let options = SessionOptions::new();
        let got = Executor::new(&mock, &options)
            .execute(
                &project(),
                &service_account(),
                &action(Action::Create),
                &ResourceState::absent(),
            )
            .await;
        assert_eq!(got.error_kind(), Some(ErrorKind::QuotaExceeded), "{got:?}");
    }

    #[tokio::test]
    async fn already_exists_on_create_is_a_conflict() {
        let mut mock = MockResourceProvider::new();
        mock.expect_create_resource()
            .times(1)
            .returning(|_, _| Err(status(Code::AlreadyExists)));
        let options = SessionOptions::new();
        let got = Executor::new(&mock, &options)
            .execute(
                &project(),
                &service_account(),
                &action(Action::Create),
                &ResourceState::absent(),
            )
            .await;
        assert_eq!(got.outcome, Outcome::Skipped, "{got:?}");
        assert_eq!(got.skip_cause, Some(ErrorKind::Conflict));
        assert!(!got.blocks_dependents());
    }

    #[tokio::test]
    async fn cancelled_before_dispatch() {
        let mock = MockResourceProvider::new();
        let token = CancellationToken::new();
        token.cancel();
        let options = SessionOptions::new().set_cancellation_token(token);
        let got = Executor::new(&mock, &options)
            .execute(
                &project(),
                &service_account(),
                &action(Action::Create),
                &ResourceState::absent(),
            )
            .await;
        assert_eq!(got.outcome, Outcome::Skipped, "{got:?}");
        assert_eq!(got.skip_cause, Some(ErrorKind::Cancelled));
        assert!(got.blocks_dependents());
    }
}
