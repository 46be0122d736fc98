//! Static checks over an assembled graph.
//!
//! None of these failures would surface at declaration time on the provider
//! side: a missing grant or a mis-trusted role only shows up when a request
//! reaches the API. Each rule inspects the graph and reports findings.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::graph::{ResourceGraph, ResourceKind, ResourceSpec};
use crate::intrinsics::PseudoParameters;
use crate::regions;
use crate::resources::apigateway::{
    ANY_METHOD, INTEGRATION_HTTP_METHOD, NO_AUTHORIZATION, PROXY_INTEGRATION_TYPE, PROXY_PATH_PART,
};
use crate::resources::iam::{PolicyDocument, LAMBDA_SERVICE_PRINCIPAL, LOG_STREAM_ACTIONS};
use crate::resources::lambda;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rule {
    RoleBeforeFunction,
    FunctionBeforeGrant,
    GrantBeforeDeployment,
    IntegrationsBeforeDeployment,
    DeploymentBeforeStage,
    TrustPrincipal,
    PolicyWellFormed,
    RuntimeLogging,
    ProxyInvariants,
    Unauthenticated,
    BroadPermissions,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub rule: Rule,
    pub severity: Severity,
    pub resource: Option<String>,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}", self.severity, self.rule)?;
        if let Some(resource) = &self.resource {
            write!(f, " {resource}")?;
        }
        write!(f, ": {}", self.message)
    }
}

pub fn has_errors(findings: &[Finding]) -> bool {
    findings.iter().any(|f| f.severity == Severity::Error)
}

struct Findings(Vec<Finding>);

impl Findings {
    fn push(
        &mut self,
        rule: Rule,
        severity: Severity,
        resource: Option<&ResourceSpec>,
        message: impl Into<String>,
    ) {
        self.0.push(Finding {
            rule,
            severity,
            resource: resource.map(|r| r.id.to_string()),
            message: message.into(),
        });
    }
}

/// Run every rule against `graph`.
pub fn analyze(graph: &ResourceGraph, pseudo: &PseudoParameters) -> Vec<Finding> {
    let mut findings = Findings(vec![]);
    check_ordering(graph, &mut findings);
    check_trust(graph, &mut findings);
    check_policies(graph, pseudo, &mut findings);
    check_proxy(graph, &mut findings);
    check_exposure(graph, &mut findings);
    findings.0
}

fn require_before(
    graph: &ResourceGraph,
    findings: &mut Findings,
    rule: Rule,
    severity: Severity,
    before: ResourceKind,
    after: ResourceKind,
) {
    for dependent in graph.of_kind(after) {
        let mut found = false;
        for dependency in graph.of_kind(before) {
            found = true;
            if !graph.depends_transitively(dependent.id.as_str(), dependency.id.as_str()) {
                findings.push(
                    rule,
                    severity,
                    Some(dependent),
                    format!("{} does not wait for {} {}", dependent.id, before, dependency.id),
                );
            }
        }
        if !found {
            findings.push(rule, severity, Some(dependent), format!("no {before} in the graph"));
        }
    }
}

/// Kind pairs where every resource of the first kind must precede every
/// resource of the second.
const REQUIRED_ORDER: &[(Rule, Severity, ResourceKind, ResourceKind)] = &[
    (Rule::RoleBeforeFunction, Severity::Error, ResourceKind::Role, ResourceKind::Function),
    (Rule::FunctionBeforeGrant, Severity::Error, ResourceKind::Function, ResourceKind::Permission),
    // Without the grant, the deployment goes live and every request fails
    // until the grant lands.
    (
        Rule::GrantBeforeDeployment,
        Severity::Warning,
        ResourceKind::Permission,
        ResourceKind::Deployment,
    ),
    (
        Rule::IntegrationsBeforeDeployment,
        Severity::Error,
        ResourceKind::Integration,
        ResourceKind::Deployment,
    ),
    (Rule::DeploymentBeforeStage, Severity::Error, ResourceKind::Deployment, ResourceKind::Stage),
];

fn check_ordering(graph: &ResourceGraph, findings: &mut Findings) {
    for &(rule, severity, before, after) in REQUIRED_ORDER {
        require_before(graph, findings, rule, severity, before, after);
    }
}

fn document(spec: &ResourceSpec, property: &str) -> Result<PolicyDocument, String> {
    let value = spec
        .property(property)
        .ok_or_else(|| format!("{property} is missing"))?;
    serde_json::from_value(value.clone())
        .map_err(|e| format!("{property} is not a policy document: {e}"))
}

fn check_trust(graph: &ResourceGraph, findings: &mut Findings) {
    for role in graph.of_kind(ResourceKind::Role) {
        match document(role, "AssumeRolePolicyDocument") {
            Ok(trust) => {
                let services = trust.trusted_services();
                if services.len() != 1 || !services.contains(LAMBDA_SERVICE_PRINCIPAL) {
                    findings.push(
                        Rule::TrustPrincipal,
                        Severity::Error,
                        Some(role),
                        format!(
                            "role must trust exactly {LAMBDA_SERVICE_PRINCIPAL}, trusts {services:?}"
                        ),
                    );
                }
                for problem in trust.problems(false) {
                    findings.push(Rule::PolicyWellFormed, Severity::Error, Some(role), problem);
                }
            }
            Err(e) => findings.push(Rule::TrustPrincipal, Severity::Error, Some(role), e),
        }
    }
}

fn check_policies(graph: &ResourceGraph, pseudo: &PseudoParameters, findings: &mut Findings) {
    let partition = regions::partition(&pseudo.region);
    for policy in graph.of_kind(ResourceKind::RolePolicy) {
        let document = match document(policy, "PolicyDocument") {
            Ok(d) => d.resolved(pseudo),
            Err(e) => {
                findings.push(Rule::PolicyWellFormed, Severity::Error, Some(policy), e);
                continue;
            }
        };
        for problem in document.problems(true) {
            findings.push(Rule::PolicyWellFormed, Severity::Error, Some(policy), problem);
        }

        for function in graph.of_kind(ResourceKind::Function) {
            let name = function
                .property("FunctionName")
                .and_then(Value::as_str)
                .unwrap_or(lambda::FUNCTION_ID);
            let stream = format!(
                "arn:{partition}:logs:{}:{}:log-group:/aws/lambda/{name}:log-stream:latest",
                pseudo.region, pseudo.account_id
            );
            for action in LOG_STREAM_ACTIONS {
                if !document.allows(action, &stream) {
                    findings.push(
                        Rule::RuntimeLogging,
                        Severity::Error,
                        Some(policy),
                        format!("{action} is not allowed on the log group of {}", function.id),
                    );
                }
            }
        }

        let wildcards = document.wildcard_actions();
        if !wildcards.is_empty() {
            findings.push(
                Rule::BroadPermissions,
                Severity::Warning,
                Some(policy),
                format!("wildcard actions granted: {}", wildcards.join(", ")),
            );
        }
    }
}

fn check_proxy(graph: &ResourceGraph, findings: &mut Findings) {
    for resource in graph.of_kind(ResourceKind::ApiResource) {
        if resource.property("PathPart").and_then(Value::as_str) != Some(PROXY_PATH_PART) {
            findings.push(
                Rule::ProxyInvariants,
                Severity::Error,
                Some(resource),
                format!("resource path is not {PROXY_PATH_PART}"),
            );
        }
    }
    for method in graph.of_kind(ResourceKind::Method) {
        if method.property("HttpMethod").and_then(Value::as_str) != Some(ANY_METHOD) {
            let message = "method is not ANY";
            findings.push(Rule::ProxyInvariants, Severity::Error, Some(method), message);
        }
    }
    for integration in graph.of_kind(ResourceKind::Integration) {
        let ty = integration.property("Type").and_then(Value::as_str);
        let verb = integration.property("IntegrationHttpMethod").and_then(Value::as_str);
        if ty != Some(PROXY_INTEGRATION_TYPE) || verb != Some(INTEGRATION_HTTP_METHOD) {
            findings.push(
                Rule::ProxyInvariants,
                Severity::Error,
                Some(integration),
                format!(
                    "integration must be {PROXY_INTEGRATION_TYPE} over {INTEGRATION_HTTP_METHOD}"
                ),
            );
        }
        let targets_function = graph
            .of_kind(ResourceKind::Function)
            .any(|f| integration.references().contains(f.id.as_str()));
        if !targets_function {
            findings.push(
                Rule::ProxyInvariants,
                Severity::Error,
                Some(integration),
                "integration URI does not point at a function in the graph",
            );
        }
    }
}

fn check_exposure(graph: &ResourceGraph, findings: &mut Findings) {
    for method in graph.of_kind(ResourceKind::Method) {
        if method.property("AuthorizationType").and_then(Value::as_str) == Some(NO_AUTHORIZATION) {
            findings.push(
                Rule::Unauthenticated,
                Severity::Info,
                Some(method),
                "method is publicly invocable without authorization",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::blueprint::Blueprint;
    use crate::config::tests::EXAMPLE;
    use crate::config::{GrantOrdering, StackConfig};
    use crate::resources::iam::{POLICY_ID, ROLE_ID};

    fn build(ordering: GrantOrdering) -> (ResourceGraph, PseudoParameters) {
        let mut config = StackConfig::from_toml_str(EXAMPLE, "test").unwrap();
        config.api_gateway_config.grant_ordering = ordering;
        let blueprint = Blueprint::new(&config);
        (blueprint.build().unwrap(), blueprint.pseudo_parameters())
    }

    fn rules(findings: &[Finding], severity: Severity) -> Vec<Rule> {
        findings.iter().filter(|f| f.severity == severity).map(|f| f.rule).collect()
    }

    #[test]
    fn assembled_stack_has_no_errors() {
        let (graph, pseudo) = build(GrantOrdering::Explicit);
        let findings = analyze(&graph, &pseudo);
        assert!(!has_errors(&findings), "{findings:#?}");
        assert_eq!(rules(&findings, Severity::Warning), vec![Rule::BroadPermissions]);
        assert_eq!(
            rules(&findings, Severity::Info),
            vec![Rule::Unauthenticated, Rule::Unauthenticated]
        );
    }

    #[test]
    fn provider_ordering_is_flagged() {
        let (graph, pseudo) = build(GrantOrdering::Provider);
        let findings = analyze(&graph, &pseudo);
        assert!(rules(&findings, Severity::Warning).contains(&Rule::GrantBeforeDeployment));
        assert!(!has_errors(&findings));
    }

    #[test]
    fn missing_grant_is_flagged() {
        let (mut graph, pseudo) = build(GrantOrdering::Explicit);
        graph.remove("AllowApiGatewayToInvokeLambda").unwrap();
        let findings = analyze(&graph, &pseudo);
        let grant = findings.iter().find(|f| f.rule == Rule::GrantBeforeDeployment).unwrap();
        assert!(grant.message.contains("no AWS::Lambda::Permission"), "{}", grant.message);
    }

    #[test]
    fn foreign_trust_principal_is_an_error() {
        let (mut graph, pseudo) = build(GrantOrdering::Explicit);
        let mut role = graph.remove(ROLE_ID).unwrap();
        role.properties["AssumeRolePolicyDocument"]["Statement"][0]["Principal"]["Service"] =
            json!(["lambda.amazonaws.com", "ec2.amazonaws.com"]);
        graph.add(role).unwrap();
        let findings = analyze(&graph, &pseudo);
        assert!(rules(&findings, Severity::Error).contains(&Rule::TrustPrincipal));
    }

    #[test]
    fn missing_log_permissions_are_an_error() {
        let (mut graph, pseudo) = build(GrantOrdering::Explicit);
        let mut policy = graph.remove(POLICY_ID).unwrap();
        let statements = policy.properties["PolicyDocument"]["Statement"].as_array_mut().unwrap();
        statements.retain(|s| s["Action"] != json!(LOG_STREAM_ACTIONS));
        graph.add(policy).unwrap();
        let findings = analyze(&graph, &pseudo);
        let logging: Vec<_> = findings.iter().filter(|f| f.rule == Rule::RuntimeLogging).collect();
        assert_eq!(logging.len(), 2);
    }
}
