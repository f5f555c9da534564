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

//! Provisions keyless GitHub Actions access to a Google Cloud project.

mod args;
mod http;
mod iam;
mod output;
mod rest;
mod storage;

use args::{Args, Format};
use clap::Parser;
use google_cloud_auth::credentials::Builder as CredentialsBuilder;
use google_cloud_gax::exponential_backoff::ExponentialBackoffBuilder;
use google_cloud_gax::retry_policy::NeverRetry;
use google_cloud_storage::client::StorageControl;
use rest::RestProvider;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use wif_provisioner::error::ErrorKind;
use wif_provisioner::retry_policy::LimitedAttemptCount;
use wif_provisioner::session::{PlannedAction, Session, SessionState};

const DESCRIPTION: &str = concat!(
    "This program creates the Google Cloud resources needed by a GitHub Actions",
    " workflow to authenticate without service account keys: a service account,",
    " a bucket for the infrastructure-as-code state, a workload identity pool and",
    " OIDC provider, and the IAM bindings between them.",
    " The program is idempotent, running it again only changes what drifted."
);

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    enable_tracing(&args);
    match run(args).await {
        Ok(state) => exit_code(state),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<SessionState> {
    args.validate()?;
    tracing::info!("Configuration: {args:?}");
    let config = args.configuration()?;

    let credentials = CredentialsBuilder::default().build()?;
    // The session retries every provider call, the client must not retry them
    // again.
    let storage = StorageControl::builder()
        .with_credentials(credentials.clone())
        .with_retry_policy(NeverRetry)
        .build()
        .await?;
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_delay(args.initial_backoff)
        .with_maximum_delay(args.maximum_backoff)
        .build()?;
    let cancel = CancellationToken::new();
    let session = Session::builder(RestProvider::new(credentials, storage))
        .with_retry_policy(LimitedAttemptCount::new(args.max_attempts))
        .with_backoff_policy(backoff)
        .with_concurrency(args.concurrency)
        .with_cancellation_token(cancel.clone())
        .build();

    if args.plan {
        return print_plan(session.plan(&config).await, args.format);
    }

    let _watcher = tokio::spawn(cancel_on_interrupt(cancel));
    let report = session.run(&config).await;
    print!("{}", output::report(&report, args.format)?);
    Ok(report.state)
}

/// Prints the planned actions.
///
/// An invalid configuration aborts the plan the same way it aborts a session.
fn print_plan(
    actions: wif_provisioner::Result<Vec<PlannedAction>>,
    format: Format,
) -> anyhow::Result<SessionState> {
    match actions {
        Ok(actions) => {
            print!("{}", output::plan(&actions, format)?);
            Ok(SessionState::Completed)
        }
        Err(e) if e.kind() == ErrorKind::Configuration => {
            tracing::error!("invalid configuration: {e}");
            Ok(SessionState::Aborted)
        }
        Err(e) => Err(e.into()),
    }
}

async fn cancel_on_interrupt(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::warn!("interrupted, waiting for in-flight operations to finish");
            cancel.cancel();
        }
        Err(e) => tracing::error!("cannot listen for interrupts: {e}"),
    }
}

fn exit_code(state: SessionState) -> ExitCode {
    match state {
        SessionState::CompletedWithFailures => ExitCode::from(2),
        SessionState::Aborted => ExitCode::from(3),
        _ => ExitCode::SUCCESS,
    }
}

fn enable_tracing(args: &Args) {
    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let subscriber = tracing_subscriber::fmt()
        .with_level(true)
        .with_target(args.verbose)
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting global subscriber succeeds");
}
