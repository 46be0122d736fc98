//! REST API proxying every path and verb to the function.
//!
//! Integrations are kept as their own nodes so the graph shows the
//! Method -> Integration -> Deployment chain. The CloudFormation template
//! folds each one back into its method's `Integration` property.

use serde_json::{json, Value};

use crate::graph::{GraphError, LogicalId, ResourceKind, ResourceSpec};
use crate::intrinsics::{get_att, reference};

pub const REST_API_ID: &str = "RagApi";
pub const PROXY_RESOURCE_ID: &str = "ProxyResource";
pub const ROOT_METHOD_ID: &str = "RootMethod";
pub const PROXY_METHOD_ID: &str = "ProxyMethod";
pub const ROOT_INTEGRATION_ID: &str = "RootLambdaIntegration";
pub const PROXY_INTEGRATION_ID: &str = "LambdaProxyIntegration";
pub const DEPLOYMENT_ID_PREFIX: &str = "ApiDeployment";
pub const STAGE_ID: &str = "ApiStage";

pub const PROXY_PATH_PART: &str = "{proxy+}";
pub const ANY_METHOD: &str = "ANY";
pub const NO_AUTHORIZATION: &str = "NONE";
pub const PROXY_INTEGRATION_TYPE: &str = "AWS_PROXY";
/// Lambda is always invoked with POST, whatever the client verb.
pub const INTEGRATION_HTTP_METHOD: &str = "POST";
pub const ENDPOINT_TYPE: &str = "REGIONAL";

pub struct GatewaySettings<'a> {
    pub name: &'a str,
    pub description: &'a str,
    pub stage_name: &'a str,
}

/// Everything under the RestApi that a deployment snapshots.
#[derive(Debug, Clone)]
pub struct Routing {
    pub rest_api: ResourceSpec,
    pub proxy_resource: ResourceSpec,
    pub root_method: ResourceSpec,
    pub proxy_method: ResourceSpec,
    pub root_integration: ResourceSpec,
    pub proxy_integration: ResourceSpec,
}

impl Routing {
    /// Root and `{proxy+}` routes, both `ANY` and both proxied to `invoke_arn`.
    pub fn new(settings: &GatewaySettings, invoke_arn: Value) -> Self {
        let api = LogicalId::known(REST_API_ID);
        let rest_api = ResourceSpec::new(
            api.clone(),
            ResourceKind::RestApi,
            json!({
                "Name": settings.name,
                "Description": settings.description,
                "EndpointConfiguration": { "Types": [ENDPOINT_TYPE] },
            }),
        );
        let root_resource = get_att(&api, "RootResourceId");

        let proxy = LogicalId::known(PROXY_RESOURCE_ID);
        let proxy_resource = ResourceSpec::new(
            proxy.clone(),
            ResourceKind::ApiResource,
            json!({
                "RestApiId": reference(&api),
                "ParentId": root_resource,
                "PathPart": PROXY_PATH_PART,
            }),
        );

        let root_method_id = LogicalId::known(ROOT_METHOD_ID);
        let proxy_method_id = LogicalId::known(PROXY_METHOD_ID);
        let root_method = method(&root_method_id, &api, root_resource.clone());
        let proxy_method = method(&proxy_method_id, &api, reference(&proxy));

        let root_integration = integration(
            LogicalId::known(ROOT_INTEGRATION_ID),
            &root_method_id,
            &api,
            root_resource,
            invoke_arn.clone(),
        );
        let proxy_integration = integration(
            LogicalId::known(PROXY_INTEGRATION_ID),
            &proxy_method_id,
            &api,
            reference(&proxy),
            invoke_arn,
        );

        Self {
            rest_api,
            proxy_resource,
            root_method,
            proxy_method,
            root_integration,
            proxy_integration,
        }
    }

    fn snapshot(&self) -> [&ResourceSpec; 5] {
        [
            &self.proxy_resource,
            &self.root_method,
            &self.proxy_method,
            &self.root_integration,
            &self.proxy_integration,
        ]
    }

    /// Checksum of the routing tree below the RestApi.
    pub fn fingerprint(&self) -> u32 {
        let snapshot: Vec<Value> = self
            .snapshot()
            .iter()
            .map(|spec| {
                json!({
                    "Id": spec.id.as_str(),
                    "Type": spec.kind.type_name(),
                    "Properties": spec.properties,
                    "DependsOn": spec.depends_on.iter().map(LogicalId::as_str).collect::<Vec<_>>(),
                })
            })
            .collect();
        adler::adler32_slice(Value::Array(snapshot).to_string().as_bytes())
    }

    /// Deployments are immutable, so the id changes with the routing tree and a
    /// new one replaces the old on every routing change.
    pub fn deployment_id(&self) -> Result<LogicalId, GraphError> {
        LogicalId::new(format!("{DEPLOYMENT_ID_PREFIX}{:08X}", self.fingerprint()))
    }

    /// The deployment waits on both integrations plus `extra` (the invoke grant
    /// under explicit ordering).
    pub fn deployment(&self, extra: &[&LogicalId]) -> Result<ResourceSpec, GraphError> {
        let mut spec = ResourceSpec::new(
            self.deployment_id()?,
            ResourceKind::Deployment,
            json!({
                "RestApiId": reference(&self.rest_api.id),
                "Description": format!("routing {:08x}", self.fingerprint()),
            }),
        )
        .depends_on(&self.root_integration.id)
        .depends_on(&self.proxy_integration.id);
        for id in extra {
            spec = spec.depends_on(id);
        }
        Ok(spec)
    }

    pub fn into_specs(self) -> Vec<ResourceSpec> {
        vec![
            self.rest_api,
            self.proxy_resource,
            self.root_method,
            self.proxy_method,
            self.root_integration,
            self.proxy_integration,
        ]
    }
}

fn method(id: &LogicalId, api: &LogicalId, resource: Value) -> ResourceSpec {
    ResourceSpec::new(
        id.clone(),
        ResourceKind::Method,
        json!({
            "RestApiId": reference(api),
            "ResourceId": resource,
            "HttpMethod": ANY_METHOD,
            "AuthorizationType": NO_AUTHORIZATION,
        }),
    )
}

fn integration(
    id: LogicalId,
    method: &LogicalId,
    api: &LogicalId,
    resource: Value,
    invoke_arn: Value,
) -> ResourceSpec {
    ResourceSpec::new(
        id,
        ResourceKind::Integration,
        json!({
            "RestApiId": reference(api),
            "ResourceId": resource,
            "HttpMethod": ANY_METHOD,
            "Type": PROXY_INTEGRATION_TYPE,
            "IntegrationHttpMethod": INTEGRATION_HTTP_METHOD,
            "Uri": invoke_arn,
        }),
    )
    .depends_on(method)
}

pub fn stage(settings: &GatewaySettings, api: &LogicalId, deployment: &LogicalId) -> ResourceSpec {
    ResourceSpec::new(
        LogicalId::known(STAGE_ID),
        ResourceKind::Stage,
        json!({
            "RestApiId": reference(api),
            "DeploymentId": reference(deployment),
            "StageName": settings.stage_name,
        }),
    )
}

/// The method an integration belongs to: the Method among its explicit
/// dependencies.
pub fn integration_method<'a>(
    integration: &ResourceSpec,
    lookup: impl Fn(&str) -> Option<&'a ResourceSpec>,
) -> Option<&'a ResourceSpec> {
    integration
        .depends_on
        .iter()
        .filter_map(|id| lookup(id.as_str()))
        .find(|spec| spec.kind == ResourceKind::Method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics::sub;

    fn settings() -> GatewaySettings<'static> {
        GatewaySettings {
            name: "rag",
            description: "d",
            stage_name: "prod",
        }
    }

    fn routing() -> Routing {
        Routing::new(&settings(), sub("arn:${AWS::Partition}:apigateway:${Fn.Arn}"))
    }

    #[test]
    fn methods_are_any_without_auth_and_integrations_are_proxy_posts() {
        let r = routing();
        for m in [&r.root_method, &r.proxy_method] {
            assert_eq!(m.properties["HttpMethod"], ANY_METHOD);
            assert_eq!(m.properties["AuthorizationType"], NO_AUTHORIZATION);
        }
        for i in [&r.root_integration, &r.proxy_integration] {
            assert_eq!(i.properties["Type"], PROXY_INTEGRATION_TYPE);
            assert_eq!(i.properties["IntegrationHttpMethod"], INTEGRATION_HTTP_METHOD);
            assert!(i.references().contains("Fn"));
        }
        assert_eq!(r.proxy_resource.properties["PathPart"], PROXY_PATH_PART);
        assert_eq!(
            r.root_method.properties["ResourceId"],
            json!({"Fn::GetAtt": ["RagApi", "RootResourceId"]})
        );
        assert_eq!(r.proxy_method.properties["ResourceId"], json!({"Ref": "ProxyResource"}));
    }

    #[test]
    fn deployment_id_follows_routing_changes() {
        let r = routing();
        let first = r.deployment_id().unwrap();
        assert_eq!(first, routing().deployment_id().unwrap());
        assert!(first.as_str().starts_with(DEPLOYMENT_ID_PREFIX));

        let mut changed = routing();
        changed.proxy_resource.properties["PathPart"] = json!("v1");
        assert_ne!(first, changed.deployment_id().unwrap());

        let mut renamed_api = routing();
        renamed_api.rest_api.properties["Description"] = json!("other");
        assert_eq!(first, renamed_api.deployment_id().unwrap());
    }

    #[test]
    fn deployment_waits_on_integrations_and_extras() {
        let r = routing();
        let grant = LogicalId::known("Grant");
        let deployment = r.deployment(&[&grant]).unwrap();
        for id in [ROOT_INTEGRATION_ID, PROXY_INTEGRATION_ID, "Grant", REST_API_ID] {
            assert!(deployment.dependencies().contains(id), "{id}");
        }
        let stage = stage(&settings(), &r.rest_api.id, &deployment.id);
        assert!(stage.dependencies().contains(deployment.id.as_str()));
    }

    #[test]
    fn finds_the_method_of_an_integration() {
        let r = routing();
        let specs = [r.root_method.clone(), r.proxy_method.clone()];
        let lookup = |id: &str| specs.iter().find(|s| s.id.as_str() == id);
        let m = integration_method(&r.proxy_integration, lookup).unwrap();
        assert_eq!(m.id.as_str(), PROXY_METHOD_ID);
    }
}
