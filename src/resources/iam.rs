use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::graph::{LogicalId, ResourceKind, ResourceSpec};
use crate::intrinsics::{self, get_att, reference, sub, Lookup};

pub const POLICY_VERSION: &str = "2012-10-17";
pub const ASSUME_ROLE_ACTION: &str = "sts:AssumeRole";
/// The only principal allowed to assume the execution role.
pub const LAMBDA_SERVICE_PRINCIPAL: &str = "lambda.amazonaws.com";
/// `Fn::Sub` template; the partition differs in China and GovCloud.
pub const BASIC_EXECUTION_POLICY_ARN: &str =
    "arn:${AWS::Partition}:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";
pub const DEFAULT_POLICY_NAME: &str = "image-validation-service-policy";

pub const ROLE_ID: &str = "ValidationServiceRole";
pub const POLICY_ID: &str = "ImageValidationServicePolicy";

/// Services the function's runtime calls. Broader than least privilege;
/// analysis reports the wildcards.
pub const SERVICE_ACTIONS: &[&str] = &[
    "bedrock:*",
    "dynamodb:*",
    "s3:*",
    "cloudwatch:*",
    "secretsmanager:GetSecretValue",
    "iam:PassRole",
    "iam:GetRole",
    "tag:GetResources",
    "lambda:*",
    "kinesis:*",
    "ec2:DescribeVpcs",
    "ec2:DescribeSubnets",
    "ec2:DescribeSecurityGroups",
    "ec2:CreateNetworkInterface",
    "ec2:DescribeNetworkInterfaces",
    "ec2:DeleteNetworkInterface",
];

pub const LOG_STREAM_ACTIONS: &[&str] = &["logs:CreateLogStream", "logs:PutLogEvents"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Principal {
    #[serde(
        rename = "Service",
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub service: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "Sid", default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(rename = "Principal", default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    #[serde(rename = "Action", deserialize_with = "one_or_many")]
    pub actions: Vec<String>,
    /// Strings or intrinsics.
    #[serde(
        rename = "Resource",
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub resources: Vec<Value>,
}

impl Statement {
    pub fn allow<A: AsRef<str>>(actions: &[A], resources: Vec<Value>) -> Self {
        Self {
            sid: None,
            effect: Effect::Allow,
            principal: None,
            actions: actions.iter().map(|a| a.as_ref().to_string()).collect(),
            resources,
        }
    }

    fn matches_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| wildcard_match(a, action, true))
    }

    fn matches_resource(&self, resource: &str) -> bool {
        self.resources
            .iter()
            .filter_map(Value::as_str)
            .any(|r| wildcard_match(r, resource, false))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement", deserialize_with = "one_or_many")]
    pub statements: Vec<Statement>,
}

impl PolicyDocument {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            statements,
        }
    }

    /// Local evaluation of an identity policy: an explicit deny wins, otherwise
    /// any matching allow grants. Intrinsic resources never match.
    pub fn allows(&self, action: &str, resource: &str) -> bool {
        let mut allowed = false;
        for statement in &self.statements {
            if !statement.matches_action(action) || !statement.matches_resource(resource) {
                continue;
            }
            match statement.effect {
                Effect::Deny => return false,
                Effect::Allow => allowed = true,
            }
        }
        allowed
    }

    /// Copy with every resource `lookup` can resolve made concrete; the rest
    /// are kept as written.
    pub fn resolved(&self, lookup: &impl Lookup) -> PolicyDocument {
        let mut out = self.clone();
        for statement in &mut out.statements {
            for resource in &mut statement.resources {
                if let Ok(concrete) = intrinsics::resolve(resource, lookup) {
                    *resource = concrete;
                }
            }
        }
        out
    }

    /// Service principals allowed to assume a role carrying this trust policy.
    pub fn trusted_services(&self) -> BTreeSet<&str> {
        self.statements
            .iter()
            .filter(|s| s.effect == Effect::Allow && s.matches_action(ASSUME_ROLE_ACTION))
            .filter_map(|s| s.principal.as_ref())
            .flat_map(|p| p.service.iter().map(String::as_str))
            .collect()
    }

    /// Whether `service` may assume the role.
    pub fn trusts_service(&self, service: &str) -> bool {
        self.trusted_services().contains(service)
    }

    /// Problems that would make the provider reject the document. Identity
    /// policies need resources on every statement; trust policies need a principal.
    pub fn problems(&self, identity_policy: bool) -> Vec<String> {
        let mut out = vec![];
        if self.version != POLICY_VERSION {
            out.push(format!("policy version {:?} should be {POLICY_VERSION}", self.version));
        }
        if self.statements.is_empty() {
            out.push("policy has no statements".to_string());
        }
        for (i, s) in self.statements.iter().enumerate() {
            if s.actions.is_empty() {
                out.push(format!("statement {i} has no actions"));
            }
            for action in &s.actions {
                let qualified = action
                    .split_once(':')
                    .is_some_and(|(svc, act)| !svc.is_empty() && !act.is_empty());
                if action != "*" && !qualified {
                    out.push(format!(
                        "statement {i} action {action:?} is not of the form service:action"
                    ));
                }
            }
            if identity_policy && s.resources.is_empty() {
                out.push(format!("statement {i} has no resources"));
            }
            if !identity_policy && s.principal.is_none() {
                out.push(format!("statement {i} has no principal"));
            }
        }
        out
    }

    /// Actions that grant a whole service or everything.
    pub fn wildcard_actions(&self) -> Vec<&str> {
        self.statements
            .iter()
            .filter(|s| s.effect == Effect::Allow)
            .flat_map(|s| s.actions.iter())
            .filter(|a| a.as_str() == "*" || a.ends_with(":*"))
            .map(String::as_str)
            .collect()
    }
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(v) => v,
        OneOrMany::One(v) => vec![v],
    })
}

/// IAM-style glob: `*` matches any run, `?` a single character.
pub fn wildcard_match(pattern: &str, value: &str, case_insensitive: bool) -> bool {
    let norm = |s: &str| -> Vec<char> {
        if case_insensitive {
            s.to_lowercase().chars().collect()
        } else {
            s.chars().collect()
        }
    };
    let p = norm(pattern);
    let v = norm(value);
    let (mut pi, mut vi) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while vi < v.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
            pi += 1;
            vi += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, vi));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            vi = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Inputs to the execution role. Partition, region and account come from the
/// stack's pseudo parameters so the same graph deploys into any account.
#[derive(Debug, Clone)]
pub struct ExecutionRoleSettings<'a> {
    pub role_name: &'a str,
    pub function_name: &'a str,
}

const LOGS_ARN_PREFIX: &str = "arn:${AWS::Partition}:logs:${AWS::Region}:${AWS::AccountId}";

impl ExecutionRoleSettings<'_> {
    /// `Fn::Sub` template of the function's log group ARN.
    pub fn log_group_arn(&self) -> String {
        format!("{LOGS_ARN_PREFIX}:log-group:/aws/lambda/{}", self.function_name)
    }
}

/// Trust policy naming the compute runtime. There is no parameter: the
/// principal is fixed by construction.
pub fn trust_policy() -> PolicyDocument {
    PolicyDocument::new(vec![Statement {
        sid: None,
        effect: Effect::Allow,
        principal: Some(Principal {
            service: vec![LAMBDA_SERVICE_PRINCIPAL.to_string()],
        }),
        actions: vec![ASSUME_ROLE_ACTION.to_string()],
        resources: vec![],
    }])
}

pub fn execution_policy(settings: &ExecutionRoleSettings, role: &LogicalId) -> PolicyDocument {
    PolicyDocument::new(vec![
        Statement::allow(SERVICE_ACTIONS, vec![json!("*")]),
        Statement::allow(&["logs:CreateLogGroup"], vec![sub(format!("{LOGS_ARN_PREFIX}:*"))]),
        Statement::allow(
            LOG_STREAM_ACTIONS,
            vec![sub(format!("{}:*", settings.log_group_arn()))],
        ),
        Statement::allow(&["iam:PassRole"], vec![get_att(role, "Arn")]),
    ])
}

/// The role and its inline policy. The policy names the role, so it always
/// comes second.
pub fn execution_role(settings: &ExecutionRoleSettings) -> (ResourceSpec, ResourceSpec) {
    let role_id = LogicalId::known(ROLE_ID);
    let role = ResourceSpec::new(
        role_id.clone(),
        ResourceKind::Role,
        json!({
            "RoleName": settings.role_name,
            "AssumeRolePolicyDocument": trust_policy(),
            "ManagedPolicyArns": [sub(BASIC_EXECUTION_POLICY_ARN)],
        }),
    );
    let policy = ResourceSpec::new(
        LogicalId::known(POLICY_ID),
        ResourceKind::RolePolicy,
        json!({
            "PolicyName": DEFAULT_POLICY_NAME,
            "RoleName": reference(&role_id),
            "PolicyDocument": execution_policy(settings, &role_id),
        }),
    );
    (role, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics::PseudoParameters;

    fn settings() -> ExecutionRoleSettings<'static> {
        ExecutionRoleSettings {
            role_name: "validation-service-role",
            function_name: "ragFastApiLambda",
        }
    }

    fn pseudo(region: &str) -> PseudoParameters {
        PseudoParameters {
            region: region.into(),
            account_id: "777825471459".into(),
            stack_name: "s".into(),
        }
    }

    #[test]
    fn glob_matching() {
        assert!(wildcard_match("s3:*", "s3:GetObject", true));
        assert!(wildcard_match("S3:get*", "s3:GetObject", true));
        assert!(!wildcard_match("s3:Get*", "s3:getobject", false));
        assert!(wildcard_match(
            "arn:aws:logs:*:*:log-group:/aws/lambda/f:*",
            "arn:aws:logs:us-east-1:1:log-group:/aws/lambda/f:log-stream:x",
            false
        ));
        assert!(wildcard_match("ec2:Describe?pcs", "ec2:DescribeVpcs", true));
        assert!(!wildcard_match("lambda:Invoke", "lambda:InvokeFunction", true));
        assert!(wildcard_match("*", "", false));
    }

    #[test]
    fn trust_policy_names_only_the_lambda_service() {
        let trust = trust_policy();
        assert!(trust.trusts_service(LAMBDA_SERVICE_PRINCIPAL));
        assert!(!trust.trusts_service("ec2.amazonaws.com"));
        assert!(!trust.trusts_service("apigateway.amazonaws.com"));
        assert_eq!(
            trust.trusted_services().into_iter().collect::<Vec<_>>(),
            vec![LAMBDA_SERVICE_PRINCIPAL]
        );
        assert!(trust.problems(false).is_empty());
    }

    #[test]
    fn execution_policy_grants_scoped_logging() {
        let policy = execution_policy(&settings(), &LogicalId::known(ROLE_ID));
        assert!(policy.problems(true).is_empty());
        // unresolved templates grant nothing
        let group = "arn:aws:logs:us-east-1:777825471459:log-group:x";
        assert!(!policy.allows("logs:CreateLogGroup", group));

        let policy = policy.resolved(&pseudo("us-east-1"));
        let stream = "arn:aws:logs:us-east-1:777825471459:log-group:/aws/lambda/ragFastApiLambda\
                      :log-stream:2024/01/01/abc";
        assert!(policy.allows("logs:PutLogEvents", stream));
        assert!(policy.allows("logs:CreateLogStream", stream));
        assert!(!policy.allows(
            "logs:PutLogEvents",
            "arn:aws:logs:us-east-1:777825471459:log-group:/aws/lambda/other:log-stream:x"
        ));
        let group = "arn:aws:logs:us-east-1:777825471459:log-group:/aws/lambda/x";
        assert!(policy.allows("logs:CreateLogGroup", group));
        let elsewhere = "arn:aws:logs:eu-west-1:777825471459:log-group:x";
        assert!(!policy.allows("logs:CreateLogGroup", elsewhere));
        assert!(policy.allows("ec2:CreateNetworkInterface", "*"));
        assert!(policy.wildcard_actions().contains(&"bedrock:*"));
    }

    #[test]
    fn explicit_deny_wins() {
        let mut policy = PolicyDocument::new(vec![Statement::allow(&["s3:*"], vec![json!("*")])]);
        policy.statements.push(Statement {
            effect: Effect::Deny,
            ..Statement::allow(&["s3:DeleteObject"], vec![json!("*")])
        });
        assert!(policy.allows("s3:GetObject", "arn:aws:s3:::b/k"));
        assert!(!policy.allows("s3:DeleteObject", "arn:aws:s3:::b/k"));
    }

    #[test]
    fn parses_single_string_forms() {
        let doc: PolicyDocument = serde_json::from_value(json!({
            "Version": "2012-10-17",
            "Statement": {
                "Effect": "Allow",
                "Principal": {"Service": "lambda.amazonaws.com"},
                "Action": "sts:AssumeRole"
            }
        }))
        .unwrap();
        assert!(doc.trusts_service(LAMBDA_SERVICE_PRINCIPAL));

        let missing_effect = serde_json::from_value::<PolicyDocument>(json!({
            "Version": "2012-10-17",
            "Statement": [{"Action": "s3:*", "Resource": "*"}]
        }));
        assert!(missing_effect.is_err());
    }

    #[test]
    fn role_policy_attaches_to_role() {
        let (role, policy) = execution_role(&settings());
        assert_eq!(role.kind, ResourceKind::Role);
        assert_eq!(policy.property("RoleName"), Some(&json!({"Ref": ROLE_ID})));
        assert!(policy.references().contains(ROLE_ID));
        assert_eq!(
            role.property("ManagedPolicyArns"),
            Some(&json!([{"Fn::Sub": BASIC_EXECUTION_POLICY_ARN}]))
        );
    }

    #[test]
    fn managed_policy_follows_the_partition() {
        let (role, _) = execution_role(&settings());
        let arns = &role.properties["ManagedPolicyArns"];
        let partitions = [
            ("us-east-1", "aws"),
            ("cn-north-1", "aws-cn"),
            ("us-gov-west-1", "aws-us-gov"),
        ];
        for (region, partition) in partitions {
            let resolved = intrinsics::resolve(arns, &pseudo(region)).unwrap();
            assert_eq!(
                resolved,
                json!([format!(
                    "arn:{partition}:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"
                )]),
                "{region}"
            );
        }
    }
}
