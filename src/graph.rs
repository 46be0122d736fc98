//! The resource graph: specs keyed by logical id, plus dependency edges.
//!
//! An edge `a -> b` means `a` must exist before `b`. Edges come from two
//! places: intrinsic references inside `b`'s properties, and `b`'s explicit
//! `depends_on` set.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::intrinsics;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("invalid logical id {0:?}: must be 1-255 characters of [A-Za-z0-9]")]
    InvalidLogicalId(String),
    #[error("duplicate resource '{0}'")]
    Duplicate(LogicalId),
    #[error("'{from}' references unknown resource '{to}'")]
    UnknownReference { from: String, to: String },
    #[error("dependency cycle between {0:?}")]
    Cycle(Vec<LogicalId>),
    #[error("unknown resource type '{0}'")]
    UnknownResourceType(String),
}

/// Template-level resource name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalId(String);

impl LogicalId {
    pub fn new(id: impl Into<String>) -> Result<Self, GraphError> {
        let id = id.into();
        if id.is_empty() || id.len() > 255 || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(GraphError::InvalidLogicalId(id));
        }
        Ok(Self(id))
    }

    /// For ids fixed at compile time.
    pub(crate) fn known(id: &'static str) -> Self {
        debug_assert!(Self::new(id).is_ok(), "{id} is not a valid logical id");
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for LogicalId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for LogicalId {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<LogicalId> for String {
    fn from(value: LogicalId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum ResourceKind {
    Role,
    RolePolicy,
    SecurityGroup,
    Function,
    Permission,
    RestApi,
    ApiResource,
    Method,
    /// Provisioned on its own by the API Gateway control plane
    /// (PutIntegration); CloudFormation nests it inside the method.
    Integration,
    Deployment,
    Stage,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 11] = [
        ResourceKind::Role,
        ResourceKind::RolePolicy,
        ResourceKind::SecurityGroup,
        ResourceKind::Function,
        ResourceKind::Permission,
        ResourceKind::RestApi,
        ResourceKind::ApiResource,
        ResourceKind::Method,
        ResourceKind::Integration,
        ResourceKind::Deployment,
        ResourceKind::Stage,
    ];

    pub fn type_name(&self) -> &'static str {
        match self {
            ResourceKind::Role => "AWS::IAM::Role",
            ResourceKind::RolePolicy => "AWS::IAM::RolePolicy",
            ResourceKind::SecurityGroup => "AWS::EC2::SecurityGroup",
            ResourceKind::Function => "AWS::Lambda::Function",
            ResourceKind::Permission => "AWS::Lambda::Permission",
            ResourceKind::RestApi => "AWS::ApiGateway::RestApi",
            ResourceKind::ApiResource => "AWS::ApiGateway::Resource",
            ResourceKind::Method => "AWS::ApiGateway::Method",
            ResourceKind::Integration => "AWS::ApiGateway::Integration",
            ResourceKind::Deployment => "AWS::ApiGateway::Deployment",
            ResourceKind::Stage => "AWS::ApiGateway::Stage",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.type_name() == name)
    }

    /// Kinds that are never updated in place.
    pub fn replaces_on_change(&self) -> bool {
        matches!(self, ResourceKind::Deployment)
    }

    /// Properties that name or anchor the physical resource; changing one
    /// creates a new resource with new attributes.
    pub fn replacement_properties(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Role => &["RoleName", "Path"],
            ResourceKind::SecurityGroup => &["GroupName", "GroupDescription", "VpcId"],
            ResourceKind::Function => &["FunctionName", "PackageType"],
            ResourceKind::Permission => &["FunctionName", "Action", "Principal", "SourceArn"],
            ResourceKind::ApiResource => &["RestApiId", "ParentId", "PathPart"],
            ResourceKind::Method => &["RestApiId", "ResourceId", "HttpMethod"],
            ResourceKind::Integration => &["RestApiId", "ResourceId", "HttpMethod"],
            ResourceKind::Stage => &["RestApiId", "StageName"],
            ResourceKind::RolePolicy | ResourceKind::RestApi | ResourceKind::Deployment => &[],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_type_name(&value).ok_or(GraphError::UnknownResourceType(value))
    }
}

impl From<ResourceKind> for &'static str {
    fn from(value: ResourceKind) -> Self {
        value.type_name()
    }
}

/// Desired state of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub id: LogicalId,
    pub kind: ResourceKind,
    pub properties: Value,
    pub depends_on: BTreeSet<LogicalId>,
}

impl ResourceSpec {
    pub fn new(id: LogicalId, kind: ResourceKind, properties: Value) -> Self {
        Self {
            id,
            kind,
            properties,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn depends_on(mut self, id: &LogicalId) -> Self {
        self.depends_on.insert(id.clone());
        self
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Logical ids referenced by intrinsics in the properties.
    pub fn references(&self) -> BTreeSet<String> {
        intrinsics::collect_references(&self.properties)
    }

    /// Implicit and explicit dependencies together.
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps = self.references();
        deps.extend(self.depends_on.iter().map(|d| d.to_string()));
        deps
    }
}

/// A named value projected out of the graph once it is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub description: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    resources: BTreeMap<LogicalId, ResourceSpec>,
    outputs: BTreeMap<String, Output>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: ResourceSpec) -> Result<(), GraphError> {
        if self.resources.contains_key(&spec.id) {
            return Err(GraphError::Duplicate(spec.id));
        }
        self.resources.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn add_output(&mut self, name: impl Into<String>, output: Output) {
        self.outputs.insert(name.into(), output);
    }

    /// Remove a resource along with every explicit edge pointing at it.
    /// Intrinsic references to it are left alone; `validate` reports them.
    pub fn remove(&mut self, id: &str) -> Option<ResourceSpec> {
        let removed = self.resources.remove(id)?;
        for spec in self.resources.values_mut() {
            spec.depends_on.remove(id);
        }
        Some(removed)
    }

    /// Drop the explicit `depends_on` edge from `dependency` to `dependent`.
    pub fn remove_edge(&mut self, dependency: &str, dependent: &str) -> bool {
        self.resources
            .get_mut(dependent)
            .is_some_and(|spec| spec.depends_on.remove(dependency))
    }

    pub fn get(&self, id: &str) -> Option<&ResourceSpec> {
        self.resources.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ResourceSpec> {
        self.resources.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.resources.values()
    }

    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceSpec> {
        self.resources.values().filter(move |r| r.kind == kind)
    }

    pub fn outputs(&self) -> &BTreeMap<String, Output> {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Direct dependencies of `id`, checked against the graph.
    pub fn dependencies(&self, id: &str) -> Result<BTreeSet<LogicalId>, GraphError> {
        let Some(spec) = self.resources.get(id) else {
            return Ok(BTreeSet::new());
        };
        spec.dependencies()
            .into_iter()
            .map(|dep| match self.resources.get_key_value(dep.as_str()) {
                Some((key, _)) => Ok(key.clone()),
                None => Err(GraphError::UnknownReference {
                    from: id.to_string(),
                    to: dep,
                }),
            })
            .collect()
    }

    /// Every `(before, after)` pair.
    pub fn edges(&self) -> Result<Vec<(LogicalId, LogicalId)>, GraphError> {
        let mut edges = vec![];
        for id in self.resources.keys() {
            for dep in self.dependencies(id.as_str())? {
                edges.push((dep, id.clone()));
            }
        }
        Ok(edges)
    }

    /// True when `dependency` must exist before `dependent`, directly or through
    /// other resources.
    pub fn depends_transitively(&self, dependent: &str, dependency: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![dependent.to_string()];
        while let Some(current) = stack.pop() {
            let Some(spec) = self.resources.get(current.as_str()) else {
                continue;
            };
            for dep in spec.dependencies() {
                if dep == dependency {
                    return true;
                }
                if seen.insert(dep.clone()) {
                    stack.push(dep);
                }
            }
        }
        false
    }

    /// References resolve, outputs point at real resources, no cycles.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.topological_order()?;
        for (name, output) in &self.outputs {
            for id in intrinsics::collect_references(&output.value) {
                if !self.resources.contains_key(id.as_str()) {
                    return Err(GraphError::UnknownReference {
                        from: format!("output {name}"),
                        to: id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Deterministic creation order: dependencies first, ties broken by logical id.
    pub fn topological_order(&self) -> Result<Vec<LogicalId>, GraphError> {
        let mut deps = BTreeMap::new();
        for id in self.resources.keys() {
            deps.insert(id.clone(), self.dependencies(id.as_str())?);
        }
        topological_sort(&deps).map_err(GraphError::Cycle)
    }
}

/// Kahn's algorithm over `node -> dependencies`. Dependencies missing from the
/// map are ignored. On a cycle, returns the nodes that could not be ordered.
pub(crate) fn topological_sort(
    deps: &BTreeMap<LogicalId, BTreeSet<LogicalId>>,
) -> Result<Vec<LogicalId>, Vec<LogicalId>> {
    let mut remaining: BTreeMap<&LogicalId, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&LogicalId, Vec<&LogicalId>> = BTreeMap::new();
    for (id, ds) in deps {
        let present: Vec<&LogicalId> = ds.iter().filter(|d| deps.contains_key(*d)).collect();
        remaining.insert(id, present.len());
        for d in present {
            dependents.entry(d).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<&LogicalId> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(deps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.clone());
        for dependent in dependents.get(next).into_iter().flatten() {
            if let Some(n) = remaining.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() == deps.len() {
        Ok(order)
    } else {
        let placed: BTreeSet<&LogicalId> = order.iter().collect();
        Err(deps.keys().filter(|id| !placed.contains(id)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::intrinsics::{get_att, reference};

    fn id(s: &str) -> LogicalId {
        LogicalId::new(s).unwrap()
    }

    fn chain() -> ResourceGraph {
        let mut g = ResourceGraph::new();
        g.add(ResourceSpec::new(id("Role"), ResourceKind::Role, json!({}))).unwrap();
        g.add(ResourceSpec::new(
            id("Fn"),
            ResourceKind::Function,
            json!({ "Role": get_att(&id("Role"), "Arn") }),
        ))
        .unwrap();
        g.add(ResourceSpec::new(
            id("Grant"),
            ResourceKind::Permission,
            json!({ "FunctionName": reference(&id("Fn")) }),
        ))
        .unwrap();
        g
    }

    #[test]
    fn logical_ids_are_alphanumeric() {
        assert!(LogicalId::new("RagApi1").is_ok());
        assert!(LogicalId::new("rag_api").is_err());
        assert!(LogicalId::new("").is_err());
        assert!(LogicalId::new("a".repeat(256)).is_err());
    }

    #[test]
    fn kinds_round_trip_through_type_names() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_type_name(kind.type_name()), Some(kind));
        }
        assert_eq!(ResourceKind::from_type_name("AWS::S3::Bucket"), None);
    }

    #[test]
    fn orders_dependencies_first() {
        let g = chain();
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec![id("Role"), id("Fn"), id("Grant")]);
        assert!(g.depends_transitively("Grant", "Role"));
        assert!(!g.depends_transitively("Role", "Grant"));
    }

    #[test]
    fn rejects_duplicates_unknown_references_and_cycles() {
        let mut g = chain();
        assert_eq!(
            g.add(ResourceSpec::new(id("Fn"), ResourceKind::Function, json!({}))),
            Err(GraphError::Duplicate(id("Fn")))
        );

        let dangling = json!({ "DeploymentId": reference(&id("Gone")) });
        g.add(ResourceSpec::new(id("Stage"), ResourceKind::Stage, dangling))
            .unwrap();
        assert!(matches!(g.validate(), Err(GraphError::UnknownReference { .. })));

        let mut g = chain();
        let role = g.remove("Role").unwrap();
        g.add(role.depends_on(&id("Grant"))).unwrap();
        match g.topological_order() {
            Err(GraphError::Cycle(ids)) => assert_eq!(ids, vec![id("Fn"), id("Grant"), id("Role")]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn removing_a_resource_drops_explicit_edges_to_it() {
        let mut g = chain();
        let deployment = ResourceSpec::new(id("Deployment"), ResourceKind::Deployment, json!({}));
        g.add(deployment.depends_on(&id("Grant"))).unwrap();
        g.remove("Grant");
        assert!(g.get("Deployment").unwrap().depends_on.is_empty());
        g.validate().unwrap();
    }
}
