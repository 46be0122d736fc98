use serde_json::json;

use crate::graph::{LogicalId, ResourceKind, ResourceSpec};
use crate::intrinsics::{get_att, sub};

pub const GRANT_ID: &str = "AllowApiGatewayToInvokeLambda";
pub const INVOKE_ACTION: &str = "lambda:InvokeFunction";
pub const GATEWAY_SERVICE_PRINCIPAL: &str = "apigateway.amazonaws.com";

/// Any API, stage, method and path in the deploying account. Resolved from
/// pseudo parameters, never from configuration.
pub const SOURCE_ARN: &str =
    "arn:${AWS::Partition}:execute-api:${AWS::Region}:${AWS::AccountId}:*/*/*/*";

pub fn invoke_grant(function: &LogicalId) -> ResourceSpec {
    ResourceSpec::new(
        LogicalId::known(GRANT_ID),
        ResourceKind::Permission,
        json!({
            "Action": INVOKE_ACTION,
            "FunctionName": get_att(function, "Arn"),
            "Principal": GATEWAY_SERVICE_PRINCIPAL,
            "SourceArn": sub(SOURCE_ARN),
        }),
    )
}
