use serde_json::{json, Value};

use ragstack::analysis::{self, Rule, Severity};
use ragstack::config::GrantOrdering;
use ragstack::intrinsics::PseudoParameters;
use ragstack::plan::Action;
use ragstack::resources::apigateway::{DEPLOYMENT_ID_PREFIX, STAGE_ID};
use ragstack::resources::iam::{PolicyDocument, LAMBDA_SERVICE_PRINCIPAL, POLICY_ID, ROLE_ID};
use ragstack::resources::lambda::{ENV_QDRANT_API_KEY, FUNCTION_ID};
use ragstack::provider::Operation;
use ragstack::resources::apigateway::{PROXY_INTEGRATION_ID, ROOT_INTEGRATION_ID};
use ragstack::resources::outputs::{API_URL, EXISTING_SECURITY_GROUPS, LAMBDA_ARN, LAMBDA_SG_ID};
use ragstack::resources::permission::GRANT_ID;
use ragstack::{
    ApplyBackend, Blueprint, Engine, FileStateStore, MemoryStateStore, Plan, ResourceGraph,
    ResourceKind, SimulatedProvider, StackConfig, StateStore,
};

const EXAMPLE: &str = r#"
vpcId = "vpc-1"
subnetIds = ["s-1"]
allowedSecurityGroupIds = ["sg-1"]

[lambdaConfig]
imageUri = "img:1"
timeout = 30
memorySize = 512

[apiGatewayConfig]
name = "rag"
description = "d"
stageName = "prod"
"#;

const WITH_QDRANT: &str = r#"
[qdrantConfig]
host = "https://qdrant.internal"
apiKey = "secretsmanager:rag/qdrant#apiKey"
collection = "documents"
"#;

fn config() -> StackConfig {
    StackConfig::from_toml_str(EXAMPLE, "example").unwrap()
}

fn build(config: &StackConfig) -> (ResourceGraph, PseudoParameters) {
    let blueprint = Blueprint::new(config);
    (blueprint.build().unwrap(), blueprint.pseudo_parameters())
}

fn engine(config: &StackConfig) -> Engine<SimulatedProvider, MemoryStateStore> {
    let blueprint = Blueprint::new(config);
    Engine::new(
        SimulatedProvider::new(config.aws.region.clone(), config.aws.account_id()),
        MemoryStateStore::new(),
        blueprint.pseudo_parameters(),
    )
}

fn only(graph: &ResourceGraph, kind: ResourceKind) -> String {
    let mut ids: Vec<_> = graph.of_kind(kind).map(|s| s.id.to_string()).collect();
    assert_eq!(ids.len(), 1, "{kind}");
    ids.remove(0)
}

fn position(order: &[ragstack::LogicalId], id: &str) -> usize {
    order.iter().position(|i| i.as_str() == id).unwrap()
}

#[test]
fn topological_order_respects_every_required_edge() {
    for ordering in [GrantOrdering::Explicit, GrantOrdering::Provider] {
        let mut config = config();
        config.api_gateway_config.grant_ordering = ordering;
        let (graph, _) = build(&config);
        let order = graph.topological_order().unwrap();
        assert_eq!(order, graph.topological_order().unwrap());

        let role = position(&order, ROLE_ID);
        let function = position(&order, FUNCTION_ID);
        let grant = position(&order, GRANT_ID);
        let deployment = position(&order, &only(&graph, ResourceKind::Deployment));
        let stage = position(&order, STAGE_ID);
        assert!(role < function);
        assert!(function < grant);
        assert!(deployment < stage);
        for integration in graph.of_kind(ResourceKind::Integration) {
            assert!(position(&order, integration.id.as_str()) < deployment);
        }
        if ordering == GrantOrdering::Explicit {
            assert!(grant < deployment);
        }
    }
}

#[test]
fn trust_policy_admits_only_the_lambda_service() {
    let (graph, _) = build(&config());
    let role = graph.get(ROLE_ID).unwrap();
    let trust: PolicyDocument =
        serde_json::from_value(role.properties["AssumeRolePolicyDocument"].clone()).unwrap();
    assert!(trust.trusts_service(LAMBDA_SERVICE_PRINCIPAL));
    let others = [
        "ec2.amazonaws.com",
        "apigateway.amazonaws.com",
        "lambda.amazonaws.com.evil",
        "*",
    ];
    for other in others {
        assert!(!trust.trusts_service(other), "{other}");
    }
}

#[test]
fn policy_statements_are_well_formed_and_log_scoped() {
    let (graph, pseudo) = build(&config());
    let policy = graph.get(POLICY_ID).unwrap();
    let document: PolicyDocument =
        serde_json::from_value(policy.properties["PolicyDocument"].clone()).unwrap();
    assert!(document.problems(true).is_empty());
    let document = document.resolved(&pseudo);
    for statement in &document.statements {
        assert!(!statement.actions.is_empty());
        assert!(!statement.resources.is_empty());
    }
    let log_resources: Vec<&Value> = document
        .statements
        .iter()
        .filter(|s| s.actions.iter().any(|a| a == "logs:PutLogEvents"))
        .flat_map(|s| s.resources.iter())
        .collect();
    assert_eq!(
        log_resources,
        vec![&json!("arn:aws:logs:us-east-1:777825471459:log-group:/aws/lambda/ragFastApiLambda:*")]
    );
}

#[test]
fn every_method_and_integration_is_an_unauthenticated_proxy() {
    let (graph, _) = build(&config());
    let methods: Vec<_> = graph.of_kind(ResourceKind::Method).collect();
    let integrations: Vec<_> = graph.of_kind(ResourceKind::Integration).collect();
    assert_eq!(methods.len(), 2);
    assert_eq!(integrations.len(), 2);
    for method in methods {
        assert_eq!(method.properties["AuthorizationType"], "NONE", "{}", method.id);
        assert_eq!(method.properties["HttpMethod"], "ANY", "{}", method.id);
    }
    for integration in integrations {
        assert_eq!(integration.properties["Type"], "AWS_PROXY", "{}", integration.id);
        assert_eq!(integration.properties["IntegrationHttpMethod"], "POST", "{}", integration.id);
    }
}

#[tokio::test]
async fn example_config_projects_outputs() {
    let config = config();
    let (graph, _) = build(&config);
    let mut engine = engine(&config);
    let report = engine.apply(&graph).await.unwrap();
    assert!(report.is_success(), "{report}");

    let api_url = &report.outputs[API_URL];
    assert!(api_url.starts_with("https://"));
    assert!(api_url.contains(".execute-api.us-east-1.amazonaws.com"));
    assert!(api_url.ends_with("/prod"), "{api_url}");
    assert!(!report.outputs[LAMBDA_ARN].is_empty());
    assert!(report.outputs[LAMBDA_ARN].starts_with("arn:aws:lambda:us-east-1:"));
    assert_eq!(report.outputs[LAMBDA_SG_ID], EXISTING_SECURITY_GROUPS);
}

#[tokio::test]
async fn missing_grant_still_provisions_but_is_flagged() {
    let config = config();
    let (mut graph, pseudo) = build(&config);
    graph.remove(GRANT_ID).unwrap();
    graph.validate().unwrap();

    let report = engine(&config).apply(&graph).await.unwrap();
    assert!(report.is_success(), "{report}");

    let findings = analysis::analyze(&graph, &pseudo);
    let flagged: Vec<_> = findings
        .iter()
        .filter(|f| f.rule == Rule::GrantBeforeDeployment)
        .collect();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].severity, Severity::Warning);
    assert!(!analysis::has_errors(&findings));
}

#[tokio::test]
async fn routing_change_replaces_the_deployment_and_repoints_the_stage() {
    let config = config();
    let blueprint = Blueprint::new(&config);
    let first = blueprint.build().unwrap();
    let mut engine = engine(&config);
    engine.apply(&first).await.unwrap();
    let old_deployment = only(&first, ResourceKind::Deployment);

    let mut routing = blueprint.routing();
    routing.proxy_resource.properties["PathPart"] = json!("api");
    let second = blueprint.assemble(routing).unwrap();
    let new_deployment = only(&second, ResourceKind::Deployment);
    assert_ne!(old_deployment, new_deployment);
    assert!(new_deployment.starts_with(DEPLOYMENT_ID_PREFIX));

    let plan = engine.plan(&second).unwrap();
    assert_eq!(plan.get(&new_deployment).unwrap().action, Action::Create);
    assert_eq!(plan.get(STAGE_ID).unwrap().action, Action::Update);
    assert_eq!(plan.get(&old_deployment).unwrap().action, Action::Delete);
    assert_eq!(plan.position(&old_deployment), Some(plan.changes.len() - 1));
    assert!(plan.position(STAGE_ID) < plan.position(&old_deployment));

    let report = engine.apply(&second).await.unwrap();
    assert!(report.is_success(), "{report}");
    let ids = engine.state().ids().unwrap();
    assert!(ids.iter().any(|i| i.as_str() == new_deployment));
    assert!(!ids.iter().any(|i| i.as_str() == old_deployment));
    let stage = engine.state().read(STAGE_ID).unwrap().unwrap();
    assert_eq!(stage.declared["DeploymentId"], json!({ "Ref": new_deployment }));
}

#[tokio::test]
async fn plaintext_api_key_never_reaches_state() {
    let config = StackConfig::from_toml_str(&format!("{EXAMPLE}{WITH_QDRANT}"), "example").unwrap();
    let (graph, _) = build(&config);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let blueprint = Blueprint::new(&config);
    let mut engine = Engine::new(
        SimulatedProvider::new("us-east-1", "777825471459"),
        FileStateStore::open(&path).unwrap(),
        blueprint.pseudo_parameters(),
    );
    engine.apply(&graph).await.unwrap();

    let stored = std::fs::read_to_string(&path).unwrap();
    assert!(stored.contains("{{resolve:secretsmanager:rag/qdrant:SecretString:apiKey}}"));
    let function = engine.state().read(FUNCTION_ID).unwrap().unwrap();
    let api_key = function.declared["Environment"]["Variables"][ENV_QDRANT_API_KEY]
        .as_str()
        .unwrap();
    assert!(api_key.starts_with("{{resolve:secretsmanager:"));

    let plaintext = format!("{EXAMPLE}[qdrantConfig]\nhost = \"h\"\napiKey = \"sk-live-123\"\n");
    let err = StackConfig::from_toml_str(&plaintext, "example").unwrap_err();
    assert!(!err.to_string().contains("sk-live-123"));
}

#[tokio::test]
async fn failed_function_halts_dependents_only() {
    let config = config();
    let (graph, _) = build(&config);
    let mut engine = engine(&config);
    engine.provider().fail_on(FUNCTION_ID);
    let report = engine.apply(&graph).await.unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id.as_str(), FUNCTION_ID);
    for blocked in [GRANT_ID, STAGE_ID] {
        assert!(report.was_skipped(blocked), "{blocked}");
    }
    let independents = [ROLE_ID, POLICY_ID, "RagApi", "ProxyResource", "RootMethod", "ProxyMethod"];
    for independent in independents {
        assert!(report.was_applied(independent), "{independent}");
    }
    assert!(engine.state().read(ROLE_ID).unwrap().is_some());
    assert!(engine.state().read(FUNCTION_ID).unwrap().is_none());
    assert!(!report.outputs.contains_key(LAMBDA_ARN));
}

#[tokio::test]
async fn destroy_runs_in_reverse_dependency_order() {
    let config = config();
    let (graph, _) = build(&config);
    let mut engine = engine(&config);
    engine.apply(&graph).await.unwrap();
    let report = engine.destroy(&graph).await.unwrap();
    assert!(report.is_success(), "{report}");

    let deleted: Vec<&str> = report.applied.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(deleted.len(), graph.len());
    for (before, after) in graph.edges().unwrap() {
        let b = deleted.iter().position(|i| *i == before.as_str()).unwrap();
        let a = deleted.iter().position(|i| *i == after.as_str()).unwrap();
        assert!(a < b, "{after} should be deleted before {before}");
    }
    assert!(engine.state().ids().unwrap().is_empty());
    let replan = Plan::compute(&graph, engine.state()).unwrap();
    assert!(replan.changes.iter().all(|c| c.action == Action::Create));
}

#[tokio::test]
async fn renamed_function_and_role_are_rewired_everywhere() {
    let config = config();
    let (first, _) = build(&config);
    let mut engine = engine(&config);
    engine.apply(&first).await.unwrap();
    let old_deployment = only(&first, ResourceKind::Deployment);

    let mut renamed = config.clone();
    renamed.lambda_config.function_name = "renamedFn".into();
    renamed.lambda_config.role_name = "renamed-role".into();
    let (second, _) = build(&renamed);
    // routing is unchanged, so the deployment keeps its id and is re-created in place
    assert_eq!(only(&second, ResourceKind::Deployment), old_deployment);

    let plan = engine.plan(&second).unwrap();
    let action = |id: &str| plan.get(id).unwrap().action;
    assert_eq!(action(ROLE_ID), Action::Replace);
    assert_eq!(action(FUNCTION_ID), Action::Replace);
    assert_eq!(action(POLICY_ID), Action::Update);
    for dependent in [GRANT_ID, ROOT_INTEGRATION_ID, PROXY_INTEGRATION_ID, STAGE_ID] {
        assert_eq!(action(dependent), Action::Update, "{dependent}");
    }
    assert_eq!(action(&old_deployment), Action::Replace);

    let report = engine.apply(&second).await.unwrap();
    assert!(report.is_success(), "{report}");
    let new_arn = "arn:aws:lambda:us-east-1:777825471459:function:renamedFn";
    assert_eq!(report.outputs[LAMBDA_ARN], new_arn);

    let calls = engine.provider().calls();
    let last_sent = |id: &str| {
        calls
            .iter()
            .rev()
            .find(|c| c.id.as_str() == id && c.operation != Operation::Delete)
            .map(|c| c.properties.clone())
            .unwrap()
    };
    assert_eq!(last_sent(GRANT_ID)["FunctionName"], new_arn);
    for integration in [ROOT_INTEGRATION_ID, PROXY_INTEGRATION_ID] {
        let uri = last_sent(integration)["Uri"].as_str().unwrap().to_string();
        assert!(uri.contains(&format!("/functions/{new_arn}/invocations")), "{uri}");
    }
    assert_eq!(
        last_sent(FUNCTION_ID)["Role"],
        "arn:aws:iam::777825471459:role/renamed-role"
    );

    let replan = engine.plan(&second).unwrap();
    assert!(!replan.has_changes(), "{replan}");
}
