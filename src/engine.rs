//! Local apply engine: walks the plan one resource at a time, resolving
//! intrinsics against the attributes already recorded in state.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::backend::{ApplyBackend, ApplyReport, Failure, Skipped};
use crate::error::{Error, Result};
use crate::graph::{LogicalId, ResourceGraph, ResourceSpec};
use crate::intrinsics::{self, Lookup, PseudoParameters};
use crate::plan::{declared_state, Action, Change, Plan};
use crate::provider::{Attributes, ProvisionError, ResourceProvider};
use crate::state::{ResourceState, StateStore};

struct Recorded<'a> {
    resources: &'a BTreeMap<LogicalId, ResourceState>,
    pseudo: &'a PseudoParameters,
}

impl Lookup for Recorded<'_> {
    fn attribute(&self, id: &str, attribute: &str) -> Option<String> {
        self.resources.get(id)?.attributes.get(attribute).cloned()
    }

    fn pseudo(&self, name: &str) -> Option<String> {
        self.pseudo.get(name)
    }
}

pub struct Engine<P, S> {
    provider: P,
    state: S,
    pseudo: PseudoParameters,
}

impl<P: ResourceProvider, S: StateStore> Engine<P, S> {
    pub fn new(provider: P, state: S, pseudo: PseudoParameters) -> Self {
        Self { provider, state, pseudo }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn into_state(self) -> S {
        self.state
    }

    pub fn plan(&self, graph: &ResourceGraph) -> Result<Plan> {
        Plan::compute(graph, &self.state)
    }

    /// Output values resolvable from what is recorded. Outputs whose
    /// resources are missing are left out.
    pub fn outputs(&self, graph: &ResourceGraph) -> Result<BTreeMap<String, String>> {
        let recorded = self.state.all()?;
        let lookup = Recorded {
            resources: &recorded,
            pseudo: &self.pseudo,
        };
        let mut out = BTreeMap::new();
        for (name, output) in graph.outputs() {
            match intrinsics::resolve(&output.value, &lookup) {
                Ok(serde_json::Value::String(s)) => {
                    out.insert(name.clone(), s);
                }
                Ok(other) => {
                    out.insert(name.clone(), other.to_string());
                }
                Err(e) => debug!(output = %name, error = %e, "output not resolvable yet"),
            }
        }
        Ok(out)
    }

    /// Apply `graph`. A failed resource blocks everything that depends on it;
    /// independent resources still go ahead. Deletions only run when nothing
    /// failed.
    pub async fn apply_graph(&mut self, graph: &ResourceGraph) -> Result<ApplyReport> {
        graph.validate()?;
        let plan = self.plan(graph)?;
        let mut recorded = self.state.all()?;
        let mut report = ApplyReport::default();
        let mut failed: BTreeSet<LogicalId> = BTreeSet::new();

        for change in plan.changes {
            match change.action {
                Action::NoOp => report.unchanged.push(change.id),
                Action::Delete => {
                    if !failed.is_empty() {
                        report.skipped.push(Skipped {
                            id: change.id,
                            reason: "deletion held back after an earlier failure".into(),
                        });
                        continue;
                    }
                    self.delete_one(change, &mut recorded, &mut report).await?;
                }
                Action::Create | Action::Update | Action::Replace => {
                    let Some(spec) = graph.get(change.id.as_str()) else { continue };
                    if let Some(blocker) = graph
                        .dependencies(spec.id.as_str())?
                        .into_iter()
                        .find(|d| failed.contains(d))
                    {
                        warn!(id = %spec.id, blocked_by = %blocker, "skipping resource");
                        failed.insert(spec.id.clone());
                        report.skipped.push(Skipped {
                            id: spec.id.clone(),
                            reason: ProvisionError::Blocked(blocker).to_string(),
                        });
                        continue;
                    }
                    match self.provision(spec, change.action, &mut recorded).await {
                        Ok(attributes) => {
                            let state = ResourceState {
                                attributes,
                                ..declared_state(spec)
                            };
                            self.state.write(&spec.id, state.clone())?;
                            recorded.insert(spec.id.clone(), state);
                            info!(
                                id = %spec.id,
                                kind = %spec.kind,
                                action = %change.action,
                                "applied"
                            );
                            report.applied.push(change);
                        }
                        Err(e) => {
                            warn!(id = %spec.id, kind = %spec.kind, error = %e, "failed");
                            failed.insert(spec.id.clone());
                            report.failed.push(Failure {
                                id: spec.id.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        report.outputs = self.outputs(graph)?;
        Ok(report)
    }

    /// Provision one resource. A replacement that fails after the old
    /// resource is gone leaves no state behind for it.
    async fn provision(
        &mut self,
        spec: &ResourceSpec,
        action: Action,
        recorded: &mut BTreeMap<LogicalId, ResourceState>,
    ) -> Result<Attributes> {
        let wrap = |source: ProvisionError| Error::Provision {
            id: spec.id.clone(),
            source,
        };
        let lookup = Recorded {
            resources: recorded,
            pseudo: &self.pseudo,
        };
        let properties =
            intrinsics::resolve(&spec.properties, &lookup).map_err(|e| wrap(e.into()))?;
        debug!(id = %spec.id, action = %action, "provisioning");
        let previous = recorded.get(spec.id.as_str()).cloned();
        let attributes = match (action, previous) {
            (Action::Update, Some(previous)) => {
                self.provider
                    .update(&spec.id, spec.kind, &properties, &previous.attributes)
                    .await
            }
            (Action::Replace, Some(previous)) => {
                self.provider
                    .delete(&spec.id, previous.kind, &previous.attributes)
                    .await
                    .map_err(wrap)?;
                self.state.remove(spec.id.as_str())?;
                recorded.remove(spec.id.as_str());
                self.provider.create(&spec.id, spec.kind, &properties).await
            }
            _ => self.provider.create(&spec.id, spec.kind, &properties).await,
        };
        attributes.map_err(wrap)
    }

    async fn delete_one(
        &mut self,
        change: Change,
        recorded: &mut BTreeMap<LogicalId, ResourceState>,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let Some(state) = recorded.get(change.id.as_str()).cloned() else {
            return Ok(());
        };
        let dependent = recorded
            .iter()
            .find(|(id, s)| **id != change.id && s.depends_on.contains(&change.id))
            .map(|(id, _)| id.clone());
        if let Some(dependent) = dependent {
            report.skipped.push(Skipped {
                id: change.id,
                reason: format!("{dependent} still depends on it"),
            });
            return Ok(());
        }
        match self.provider.delete(&change.id, state.kind, &state.attributes).await {
            Ok(()) => {
                self.state.remove(change.id.as_str())?;
                recorded.remove(change.id.as_str());
                info!(id = %change.id, kind = %state.kind, "deleted");
                report.applied.push(change);
            }
            Err(e) => {
                warn!(id = %change.id, error = %e, "delete failed");
                report.failed.push(Failure {
                    id: change.id,
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Delete everything recorded, dependents first. A resource whose
    /// dependent could not be deleted is kept.
    pub async fn destroy_all(&mut self) -> Result<ApplyReport> {
        let plan = Plan::teardown(&self.state)?;
        let mut recorded = self.state.all()?;
        let mut report = ApplyReport::default();
        for change in plan.changes {
            self.delete_one(change, &mut recorded, &mut report).await?;
        }
        Ok(report)
    }
}

#[async_trait]
impl<P: ResourceProvider, S: StateStore> ApplyBackend for Engine<P, S> {
    async fn apply(&mut self, graph: &ResourceGraph) -> Result<ApplyReport> {
        self.apply_graph(graph).await
    }

    async fn destroy(&mut self, _graph: &ResourceGraph) -> Result<ApplyReport> {
        self.destroy_all().await
    }
}
