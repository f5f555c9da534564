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

//! An idempotent provisioning engine for workload identity federation.
//!
//! The engine reconciles a declared [Configuration][config::Configuration]
//! against the actual state of a cloud project. Each session probes every
//! declared resource, decides whether to create, update, skip, or leave it
//! alone, sorts the resources by their dependencies, and applies the changes
//! with retries for transient errors.
//!
//! Running a session twice in a row is safe: resources that already exist
//! with the declared attributes are never re-created or re-applied.
//!
//! # Example
//! ```no_run
//! # use wif_provisioner::blueprint::{BlueprintOptions, github_actions};
//! # use wif_provisioner::config::Project;
//! # use wif_provisioner::provider::ResourceProvider;
//! # use wif_provisioner::session::Session;
//! # async fn sample(provider: impl ResourceProvider + 'static) -> anyhow::Result<()> {
//! let project = Project::new("my-project")
//!     .set_project_number("123456")
//!     .set_repository("my-org/my-repo");
//! let config = github_actions(project, BlueprintOptions::default())?;
//! let report = Session::builder(provider).build().run(&config).await;
//! for (name, value) in report.produced_secrets() {
//!     println!("{name}={value}");
//! }
//! # Ok(()) }
//! ```

/// An alias of [std::result::Result] where the error is always
/// [Error][crate::error::Error].
pub type Result<T> = std::result::Result<T, crate::error::Error>;

pub mod blueprint;
pub mod config;
pub mod error;
pub mod executor;
pub mod options;
pub mod order;
pub mod probe;
pub mod provider;
pub mod reconcile;
pub mod resource;
pub mod result;
pub mod retry_loop;
pub mod retry_policy;
pub mod session;
