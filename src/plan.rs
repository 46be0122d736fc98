//! Desired graph vs. recorded state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::error::Result;
use crate::graph::{topological_sort, LogicalId, ResourceGraph, ResourceKind, ResourceSpec};
use crate::state::{ResourceState, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    /// Delete, then create under the same id.
    Replace,
    Delete,
    NoOp,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Replace => "replace",
            Action::Delete => "delete",
            Action::NoOp => "no-op",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub id: LogicalId,
    pub kind: ResourceKind,
    pub action: Action,
}

/// Changes in execution order: creates and updates in dependency order,
/// then deletes in reverse dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub changes: Vec<Change>,
}

/// The state recorded for a freshly applied `spec`.
pub fn declared_state(spec: &ResourceSpec) -> ResourceState {
    ResourceState {
        kind: spec.kind,
        declared: spec.properties.clone(),
        depends_on: spec
            .dependencies()
            .into_iter()
            .filter_map(|d| LogicalId::new(d).ok())
            .collect(),
        attributes: BTreeMap::new(),
    }
}

fn action_for(spec: &ResourceSpec, recorded: Option<&ResourceState>) -> Action {
    let Some(recorded) = recorded else {
        return Action::Create;
    };
    if recorded.kind != spec.kind {
        return Action::Replace;
    }
    let desired = declared_state(spec);
    if recorded.declared == desired.declared && recorded.depends_on == desired.depends_on {
        return Action::NoOp;
    }
    let renamed = spec
        .kind
        .replacement_properties()
        .iter()
        .any(|key| recorded.declared.get(*key) != desired.declared.get(*key));
    if spec.kind.replaces_on_change() || renamed {
        Action::Replace
    } else {
        Action::Update
    }
}

/// Carry upstream changes to dependents. A replaced resource comes back with
/// new attributes, so everything referencing it is re-sent; kinds that are
/// never updated in place are replaced when anything they depend on changed.
fn propagate(spec: &ResourceSpec, action: Action, planned: &BTreeMap<LogicalId, Action>) -> Action {
    if matches!(action, Action::Create | Action::Replace) {
        return action;
    }
    let upstream: Vec<Action> = spec
        .dependencies()
        .into_iter()
        .filter_map(|d| planned.get(d.as_str()).copied())
        .collect();
    let upstream_changed = upstream
        .iter()
        .any(|a| matches!(a, Action::Update | Action::Replace));
    if spec.kind.replaces_on_change() && upstream_changed {
        Action::Replace
    } else if upstream.contains(&Action::Replace) {
        Action::Update
    } else {
        action
    }
}

impl Plan {
    pub fn compute(graph: &ResourceGraph, state: &impl StateStore) -> Result<Self> {
        let recorded = state.all()?;
        let mut changes = vec![];
        let mut planned: BTreeMap<LogicalId, Action> = BTreeMap::new();
        for id in graph.topological_order()? {
            let Some(spec) = graph.get(id.as_str()) else { continue };
            let action = propagate(spec, action_for(spec, recorded.get(id.as_str())), &planned);
            planned.insert(id.clone(), action);
            changes.push(Change {
                action,
                kind: spec.kind,
                id,
            });
        }
        changes.extend(deletions(graph, &recorded));
        Ok(Self { changes })
    }

    /// Every recorded resource, deleted dependents first.
    pub fn teardown(state: &impl StateStore) -> Result<Self> {
        let recorded = state.all()?;
        Ok(Self {
            changes: deletions(&ResourceGraph::new(), &recorded),
        })
    }

    pub fn get(&self, id: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.id.as_str() == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.changes.iter().position(|c| c.id.as_str() == id)
    }

    pub fn count(&self, action: Action) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action != Action::NoOp)
    }
}

fn deletions(graph: &ResourceGraph, recorded: &BTreeMap<LogicalId, ResourceState>) -> Vec<Change> {
    let orphans: BTreeMap<LogicalId, BTreeSet<LogicalId>> = recorded
        .iter()
        .filter(|(id, _)| !graph.contains(id.as_str()))
        .map(|(id, s)| (id.clone(), s.depends_on.iter().cloned().collect()))
        .collect();
    // state written by this crate is acyclic; fall back to id order if not
    let order = topological_sort(&orphans).unwrap_or_else(|_| orphans.keys().cloned().collect());
    order
        .into_iter()
        .rev()
        .filter_map(|id| {
            let kind = recorded.get(&id)?.kind;
            Some(Change {
                id,
                kind,
                action: Action::Delete,
            })
        })
        .collect()
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in &self.changes {
            let marker = match change.action {
                Action::Create => "+",
                Action::Update => "~",
                Action::Replace => "-/+",
                Action::Delete => "-",
                Action::NoOp => " ",
            };
            writeln!(f, "{marker:>3} {} ({}) {}", change.id, change.kind, change.action)?;
        }
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete",
            self.count(Action::Create),
            self.count(Action::Update),
            self.count(Action::Replace),
            self.count(Action::Delete)
        )
    }
}
