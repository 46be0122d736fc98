use serde_json::{json, Map, Value};

use super::network::NetworkPlacement;
use crate::config::QdrantConfig;
use crate::graph::{LogicalId, ResourceKind, ResourceSpec};
use crate::intrinsics::{get_att, sub};

pub const FUNCTION_ID: &str = "RagFastApiLambda";

pub const ENV_QDRANT_HOST: &str = "QDRANT_HOST";
pub const ENV_QDRANT_API_KEY: &str = "QDRANT_API_KEY";
pub const ENV_QDRANT_COLLECTION: &str = "QDRANT_COLLECTION";

pub struct FunctionSettings<'a> {
    pub function_name: &'a str,
    pub image_uri: &'a str,
    pub timeout: u32,
    pub memory_size: u32,
    pub qdrant: Option<&'a QdrantConfig>,
}

impl FunctionSettings<'_> {
    /// The fixed environment map. The API key is always a dynamic reference
    /// so the provider resolves it at deploy time.
    pub fn environment(&self) -> Map<String, Value> {
        let (host, api_key, collection) = match self.qdrant {
            Some(q) => (q.host.clone(), q.api_key.dynamic_reference(), q.collection.clone()),
            None => (String::new(), String::new(), String::new()),
        };
        let mut vars = Map::new();
        vars.insert(ENV_QDRANT_HOST.into(), json!(host));
        vars.insert(ENV_QDRANT_API_KEY.into(), json!(api_key));
        vars.insert(ENV_QDRANT_COLLECTION.into(), json!(collection));
        vars
    }
}

/// The image-packaged function. `role` is the execution role, `policy` its
/// inline policy: creating VPC network interfaces needs the policy attached
/// first, and nothing in the properties says so.
pub fn function(
    settings: &FunctionSettings,
    placement: &NetworkPlacement,
    role: &LogicalId,
    policy: &LogicalId,
) -> ResourceSpec {
    ResourceSpec::new(
        LogicalId::known(FUNCTION_ID),
        ResourceKind::Function,
        json!({
            "FunctionName": settings.function_name,
            "PackageType": "Image",
            "Code": { "ImageUri": settings.image_uri },
            "Role": get_att(role, "Arn"),
            "Timeout": settings.timeout,
            "MemorySize": settings.memory_size,
            "VpcConfig": placement.vpc_config(),
            "Environment": { "Variables": settings.environment() },
        }),
    )
    .depends_on(policy)
}

/// ARN API Gateway calls to invoke `function` through a proxy integration.
pub fn invoke_arn(function: &LogicalId) -> Value {
    sub(format!(
        "arn:${{AWS::Partition}}:apigateway:${{AWS::Region}}:lambda:path/2015-03-31/functions/${{{function}.Arn}}/invocations"
    ))
}
