use serde_json::{json, Value};

use crate::graph::{LogicalId, ResourceKind, ResourceSpec};

pub const MARKER_SECURITY_GROUP_ID: &str = "LambdaSecurityGroup";
pub const MARKER_SECURITY_GROUP_DESCRIPTION: &str = "Temporary marker to retain";

/// Where the function's network interfaces live. All three ids are
/// pre-existing and only referenced, never created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlacement {
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
}

impl NetworkPlacement {
    pub fn new(
        vpc_id: impl Into<String>,
        subnet_ids: Vec<String>,
        security_group_ids: Vec<String>,
    ) -> Self {
        Self {
            vpc_id: vpc_id.into(),
            subnet_ids,
            security_group_ids,
        }
    }

    pub fn vpc_config(&self) -> Value {
        json!({
            "SubnetIds": self.subnet_ids,
            "SecurityGroupIds": self.security_group_ids,
        })
    }

    /// An empty all-egress group in the VPC. Only kept so the VPC has a
    /// group owned by this stack; the function does not use it.
    pub fn marker_security_group(&self) -> ResourceSpec {
        ResourceSpec::new(
            LogicalId::known(MARKER_SECURITY_GROUP_ID),
            ResourceKind::SecurityGroup,
            json!({
                "GroupDescription": MARKER_SECURITY_GROUP_DESCRIPTION,
                "VpcId": self.vpc_id,
                "SecurityGroupEgress": [{
                    "IpProtocol": "-1",
                    "CidrIp": "0.0.0.0/0",
                }],
            }),
        )
    }
}
