use serde_json::{json, Value};

use crate::graph::{LogicalId, Output};
use crate::intrinsics::{get_att, reference, sub};

pub const API_URL: &str = "api_url";
pub const LAMBDA_ARN: &str = "lambda_arn";
pub const LAMBDA_SG_ID: &str = "lambda_sg_id";

/// Projected when the stack owns no security group.
pub const EXISTING_SECURITY_GROUPS: &str = "N/A - using existing SGs";

pub fn api_url(api: &LogicalId, stage: &LogicalId) -> Output {
    Output {
        description: "Invoke URL of the API stage".into(),
        value: sub(format!(
            "https://${{{api}}}.execute-api.${{AWS::Region}}.${{AWS::URLSuffix}}/${{{stage}}}"
        )),
    }
}

pub fn lambda_arn(function: &LogicalId) -> Output {
    Output {
        description: "ARN of the API function".into(),
        value: get_att(function, "Arn"),
    }
}

pub fn lambda_sg_id(marker: Option<&LogicalId>) -> Output {
    let value: Value = match marker {
        Some(id) => reference(id),
        None => json!(EXISTING_SECURITY_GROUPS),
    };
    Output {
        description: "Security group owned by the stack".into(),
        value,
    }
}
