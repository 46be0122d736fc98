//! Per-resource provisioning seam used by the local engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tracing::trace;

use crate::graph::{LogicalId, ResourceKind};
use crate::intrinsics::ResolveError;
use crate::regions;

/// Provider-reported attributes, keyed by attribute name. `Ref` is the value
/// of `{"Ref": id}`.
pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error("missing required property '{0}'")]
    MissingProperty(&'static str),
    #[error("failed to resolve properties: {0}")]
    Resolve(#[from] ResolveError),
    #[error("blocked by failed dependency '{0}'")]
    Blocked(LogicalId),
}

/// Creates, updates and deletes single resources. Properties arrive fully
/// resolved.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn create(
        &self,
        id: &LogicalId,
        kind: ResourceKind,
        properties: &Value,
    ) -> Result<Attributes, ProvisionError>;

    async fn update(
        &self,
        id: &LogicalId,
        kind: ResourceKind,
        properties: &Value,
        current: &Attributes,
    ) -> Result<Attributes, ProvisionError>;

    async fn delete(
        &self,
        id: &LogicalId,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> Result<(), ProvisionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    pub operation: Operation,
    pub id: LogicalId,
    pub kind: ResourceKind,
    /// Resolved properties; `Null` for deletes.
    pub properties: Value,
}

/// In-process stand-in for the cloud. Attributes are derived from the
/// logical id so repeated runs agree, and chosen ids can be made to fail.
#[derive(Debug)]
pub struct SimulatedProvider {
    region: String,
    account_id: String,
    failing: Mutex<BTreeSet<(String, Operation)>>,
    calls: Mutex<Vec<ProviderCall>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn require<'a>(properties: &'a Value, key: &'static str) -> Result<&'a str, ProvisionError> {
    properties
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(ProvisionError::MissingProperty(key))
}

impl SimulatedProvider {
    pub fn new(region: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account_id: account_id.into(),
            failing: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(vec![]),
        }
    }

    /// Make every operation on `id` fail.
    pub fn fail_on(&self, id: &str) {
        for operation in [Operation::Create, Operation::Update, Operation::Delete] {
            self.fail_on_operation(id, operation);
        }
    }

    pub fn fail_on_operation(&self, id: &str, operation: Operation) {
        lock(&self.failing).insert((id.to_string(), operation));
    }

    pub fn recover(&self, id: &str) {
        lock(&self.failing).retain(|(failing, _)| failing != id);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    fn record(
        &self,
        operation: Operation,
        id: &LogicalId,
        kind: ResourceKind,
        properties: Value,
    ) -> Result<(), ProvisionError> {
        trace!(?operation, %id, %kind, "simulated provider call");
        lock(&self.calls).push(ProviderCall {
            operation,
            id: id.clone(),
            kind,
            properties,
        });
        if lock(&self.failing).contains(&(id.to_string(), operation)) {
            return Err(ProvisionError::Rejected(format!("simulated failure for {id}")));
        }
        Ok(())
    }

    fn token(&self, id: &LogicalId, width: usize) -> String {
        let seed = format!("{}/{}/{}", self.account_id, self.region, id);
        let hash = adler::adler32_slice(seed.as_bytes());
        let mut token = format!("{hash:08x}{:08x}", hash.rotate_left(13));
        token.truncate(width);
        token
    }

    fn attributes(
        &self,
        id: &LogicalId,
        kind: ResourceKind,
        properties: &Value,
    ) -> Result<Attributes, ProvisionError> {
        let partition = regions::partition(&self.region);
        let (region, account) = (&self.region, &self.account_id);
        let mut attrs = Attributes::new();
        let mut set = |k: &str, v: String| {
            attrs.insert(k.to_string(), v);
        };
        match kind {
            ResourceKind::Role => {
                let name = require(properties, "RoleName")?;
                set("Ref", name.to_string());
                set("Arn", format!("arn:{partition}:iam::{account}:role/{name}"));
                set("RoleId", format!("AROA{}", self.token(id, 16).to_uppercase()));
            }
            ResourceKind::RolePolicy => {
                require(properties, "RoleName")?;
                set("Ref", require(properties, "PolicyName")?.to_string());
            }
            ResourceKind::SecurityGroup => {
                require(properties, "VpcId")?;
                let group = format!("sg-{}", self.token(id, 16));
                set("Ref", group.clone());
                set("GroupId", group);
            }
            ResourceKind::Function => {
                let role = require(properties, "Role")?;
                if !role.starts_with("arn:") {
                    return Err(ProvisionError::Rejected(format!("Role {role:?} is not an ARN")));
                }
                let image = properties.pointer("/Code/ImageUri").and_then(Value::as_str);
                if image.map_or(true, str::is_empty) {
                    return Err(ProvisionError::MissingProperty("Code.ImageUri"));
                }
                let name = require(properties, "FunctionName")?;
                set("Ref", name.to_string());
                let arn = format!("arn:{partition}:lambda:{region}:{account}:function:{name}");
                set("Arn", arn);
            }
            ResourceKind::Permission => {
                require(properties, "FunctionName")?;
                require(properties, "Principal")?;
                set("Ref", format!("{id}-{}", self.token(id, 12)));
            }
            ResourceKind::RestApi => {
                require(properties, "Name")?;
                set("Ref", self.token(id, 10));
                set("RootResourceId", self.token(id, 16)[6..].to_string());
            }
            ResourceKind::ApiResource | ResourceKind::Method | ResourceKind::Deployment => {
                require(properties, "RestApiId")?;
                set("Ref", self.token(id, 6));
            }
            ResourceKind::Integration => {
                require(properties, "Uri")?;
                set("Ref", self.token(id, 6));
            }
            ResourceKind::Stage => {
                require(properties, "DeploymentId")?;
                set("Ref", require(properties, "StageName")?.to_string());
            }
        }
        Ok(attrs)
    }
}

#[async_trait]
impl ResourceProvider for SimulatedProvider {
    async fn create(
        &self,
        id: &LogicalId,
        kind: ResourceKind,
        properties: &Value,
    ) -> Result<Attributes, ProvisionError> {
        self.record(Operation::Create, id, kind, properties.clone())?;
        self.attributes(id, kind, properties)
    }

    async fn update(
        &self,
        id: &LogicalId,
        kind: ResourceKind,
        properties: &Value,
        _current: &Attributes,
    ) -> Result<Attributes, ProvisionError> {
        self.record(Operation::Update, id, kind, properties.clone())?;
        self.attributes(id, kind, properties)
    }

    async fn delete(
        &self,
        id: &LogicalId,
        kind: ResourceKind,
        _attributes: &Attributes,
    ) -> Result<(), ProvisionError> {
        self.record(Operation::Delete, id, kind, Value::Null)
    }
}
