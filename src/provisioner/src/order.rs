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

//! Sorts resources so each one comes after its dependencies.
//!
//! Both functions use Kahn's algorithm. Resources that are ready at the same
//! time keep their declaration order, so the output is reproducible.

use crate::Result;
use crate::config::ConfigError;
use crate::resource::ResourceSpec;
use std::collections::{BTreeSet, HashMap};

/// Returns the resources in dependency order.
///
/// Fails with a [Configuration][crate::error::ErrorKind::Configuration] error
/// if the dependencies contain a cycle or name an undeclared resource.
///
/// # Example
/// ```
/// # use wif_provisioner::order::order;
/// # use wif_provisioner::resource::{ResourceKind, ResourceSpec};
/// let specs = vec![
///     ResourceSpec::new(ResourceKind::IamBinding, "bind").set_depends_on(["sa"]),
///     ResourceSpec::new(ResourceKind::ServiceAccount, "sa"),
/// ];
/// let sorted = order(&specs)?;
/// let ids: Vec<_> = sorted.iter().map(|s| s.identifier.as_str()).collect();
/// assert_eq!(ids, vec!["sa", "bind"]);
/// # Ok::<(), wif_provisioner::error::Error>(())
/// ```
pub fn order(specs: &[ResourceSpec]) -> Result<Vec<&ResourceSpec>> {
    let mut graph = Graph::new(specs)?;
    let mut sorted = Vec::with_capacity(specs.len());
    let mut ready: BTreeSet<usize> = graph.roots().collect();
    while let Some(index) = ready.pop_first() {
        sorted.push(&specs[index]);
        ready.extend(graph.release(index));
    }
    graph.check_complete(specs)?;
    Ok(sorted)
}

/// Returns the resources grouped in topological layers.
///
/// The resources in a layer have no dependencies among them, and depend only
/// on resources in earlier layers. Within a layer the resources keep their
/// declaration order.
pub fn layers(specs: &[ResourceSpec]) -> Result<Vec<Vec<&ResourceSpec>>> {
    let mut graph = Graph::new(specs)?;
    let mut layers = Vec::new();
    let mut current: BTreeSet<usize> = graph.roots().collect();
    while !current.is_empty() {
        let mut next = BTreeSet::new();
        for index in current.iter() {
            next.extend(graph.release(*index));
        }
        layers.push(current.into_iter().map(|i| &specs[i]).collect());
        current = next;
    }
    graph.check_complete(specs)?;
    Ok(layers)
}

/// The dependency graph, using declaration positions as node ids.
struct Graph {
    in_degree: Vec<usize>,
    dependents: Vec<Vec<usize>>,
}

impl Graph {
    fn new(specs: &[ResourceSpec]) -> Result<Self> {
        let positions: HashMap<&str, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.identifier.as_str(), i))
            .collect();
        let mut in_degree = vec![0_usize; specs.len()];
        let mut dependents = vec![Vec::new(); specs.len()];
        for (index, spec) in specs.iter().enumerate() {
            for dependency in &spec.depends_on {
                let Some(&from) = positions.get(dependency.as_str()) else {
                    return Err(ConfigError::UnknownDependency {
                        identifier: spec.identifier.clone(),
                        dependency: dependency.clone(),
                    }
                    .into());
                };
                dependents[from].push(index);
                in_degree[index] += 1;
            }
        }
        Ok(Self {
            in_degree,
            dependents,
        })
    }

    fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        self.in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
    }

    /// Removes the edges out of `index`, returns the nodes that become ready.
    fn release(&mut self, index: usize) -> Vec<usize> {
        let mut ready = Vec::new();
        for &dependent in &self.dependents[index] {
            self.in_degree[dependent] -= 1;
            if self.in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
        ready
    }

    /// Fails if some nodes were never released.
    ///
    /// Only the nodes on a cycle are reported, the nodes downstream of a
    /// cycle are blocked by it but are not part of it.
    fn check_complete(&self, specs: &[ResourceSpec]) -> Result<()> {
        if self.in_degree.iter().all(|d| *d == 0) {
            return Ok(());
        }
        let cycle: Vec<String> = self
            .in_degree
            .iter()
            .enumerate()
            .filter(|(i, d)| **d > 0 && self.reaches(*i, *i))
            .map(|(i, _)| specs[i].identifier.clone())
            .collect();
        Err(ConfigError::DependencyCycle(cycle).into())
    }

    /// Returns true if there is a non-empty path from `from` to `to`.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut visited = vec![false; self.dependents.len()];
        let mut pending = self.dependents[from].clone();
        while let Some(index) = pending.pop() {
            if index == to {
                return true;
            }
            if !std::mem::replace(&mut visited[index], true) {
                pending.extend_from_slice(&self.dependents[index]);
            }
        }
        false
    }
}
