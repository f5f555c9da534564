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

use crate::args::Format;
use serde_json::json;
use std::fmt::Write;
use wif_provisioner::session::{PlannedAction, SessionReport};

/// Formats the outcome of a session.
///
/// The JSON format includes the summary and every result, the text format is
/// meant for humans.
pub fn report(report: &SessionReport, format: Format) -> anyhow::Result<String> {
    if format == Format::Json {
        let value = json!({
            "summary": report.summary(),
            "results": report.results,
            "error": report.error,
        });
        return Ok(serde_json::to_string_pretty(&value)?);
    }

    let summary = report.summary();
    let mut out = String::new();
    writeln!(
        out,
        "{:<48} {:<16} {:<8} {:<10} DETAILS",
        "RESOURCE", "KIND", "ACTION", "OUTCOME"
    )?;
    for r in &report.results {
        let details = match &r.error {
            Some(e) => e.to_string(),
            None => r.reason.clone(),
        };
        writeln!(
            out,
            "{:<48} {:<16} {:<8} {:<10} {details}",
            r.identifier,
            r.kind.as_str(),
            r.action.to_string(),
            format!("{:?}", r.outcome)
        )?;
    }
    writeln!(out)?;
    writeln!(
        out,
        "session {:?}, applied: {:?}, succeeded: {}, failed: {}, skipped: {}, unchanged: {}",
        summary.state,
        summary.applied,
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.unchanged
    )?;
    if let Some(e) = &report.error {
        writeln!(out, "error: {e}")?;
    }
    if !summary.produced_secrets.is_empty() {
        writeln!(out)?;
        for (name, value) in &summary.produced_secrets {
            writeln!(out, "{name} = {value}")?;
        }
    }
    Ok(out)
}

/// Formats the actions computed in `--plan` mode.
pub fn plan(actions: &[PlannedAction], format: Format) -> anyhow::Result<String> {
    if format == Format::Json {
        return Ok(serde_json::to_string_pretty(actions)?);
    }
    let mut out = String::new();
    for a in actions {
        writeln!(
            out,
            "{:<8} {:<16} {:<48} {}",
            a.action.action.to_string(),
            a.identifier,
            a.kind.as_str(),
            a.action.reason
        )?;
    }
    let changes = actions.iter().filter(|a| a.action.action.is_mutation()).count();
    writeln!(out, "{changes} of {} resources would change", actions.len())?;
    Ok(out)
}
