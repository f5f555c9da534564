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

use anyhow::bail;
use clap::{Parser, ValueEnum};
use humantime::parse_duration;
use std::path::PathBuf;
use std::time::Duration;
use wif_provisioner::blueprint::{BlueprintOptions, github_actions};
use wif_provisioner::config::{Configuration, Project};

/// Command-line options for `wif-provision`.
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = super::DESCRIPTION)]
pub struct Args {
    /// The id of the Google Cloud project, e.g. `my-project`.
    #[arg(long, conflicts_with = "config")]
    pub project_id: Option<String>,

    /// The number of the Google Cloud project, e.g. `123456789012`.
    ///
    /// Workload identity principals are named using the project number.
    #[arg(long, conflicts_with = "config")]
    pub project_number: Option<String>,

    /// The GitHub repository allowed to impersonate the service account, in
    /// `owner/name` format.
    #[arg(long, conflicts_with = "config")]
    pub repository: Option<String>,

    /// Load the full configuration from a JSON file instead of using the
    /// GitHub Actions blueprint.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the planned actions without changing anything.
    #[arg(long, default_value_t = false)]
    pub plan: bool,

    /// The maximum number of provider calls in flight, for both probes and
    /// mutations.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// The maximum number of attempts for each provider call, for both probes
    /// and mutations.
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    /// The delay before the first retry.
    #[arg(long, value_parser = parse_duration, default_value = "1s")]
    pub initial_backoff: Duration,

    /// The maximum delay between retries.
    #[arg(long, value_parser = parse_duration, default_value = "60s")]
    pub maximum_backoff: Duration,

    /// The format of the summary printed on completion.
    #[arg(long, value_enum, default_value_t = Format::Text)]
    pub format: Format,

    /// Log debug messages.
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

impl Args {
    /// Validates the arguments after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            bail!("invalid concurrency, should be > 0")
        }
        if self.max_attempts == 0 {
            bail!("invalid number of attempts, should be > 0")
        }
        if self.initial_backoff.is_zero() || self.initial_backoff > self.maximum_backoff {
            bail!(
                "invalid backoff range [{:?}, {:?}], the initial backoff should be > 0 and not exceed the maximum",
                self.initial_backoff,
                self.maximum_backoff
            )
        }
        if self.config.is_some() {
            return Ok(());
        }
        for (flag, value) in [
            ("--project-id", &self.project_id),
            ("--project-number", &self.project_number),
            ("--repository", &self.repository),
        ] {
            if value.as_deref().is_none_or(str::is_empty) {
                bail!("missing {flag}, required unless --config is used")
            }
        }
        if self
            .repository
            .as_deref()
            .is_some_and(|r| r.split('/').filter(|s| !s.is_empty()).count() != 2)
        {
            bail!("invalid --repository, should be in `owner/name` format")
        }
        Ok(())
    }

    /// Builds the declared configuration, from the file or the blueprint.
    pub fn configuration(&self) -> anyhow::Result<Configuration> {
        if let Some(path) = &self.config {
            return Ok(Configuration::from_path(path)?);
        }
        let mut project = Project::new(self.project_id.clone().unwrap_or_default());
        if let Some(number) = &self.project_number {
            project = project.set_project_number(number);
        }
        if let Some(repository) = &self.repository {
            project = project.set_repository(repository);
        }
        Ok(github_actions(project, BlueprintOptions::default())?)
    }
}
