use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::graph::{GraphError, ResourceGraph, ResourceKind};
use crate::resources::apigateway::integration_method;

pub const TEMPLATE_VERSION: &str = "2010-09-09";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateResource {
    #[serde(rename = "Type")]
    pub ty: String,
    #[serde(rename = "Properties")]
    pub properties: Value,
    #[serde(rename = "DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateOutput {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Value")]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub version: String,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Resources")]
    pub resources: BTreeMap<String, TemplateResource>,
    #[serde(rename = "Outputs", default)]
    pub outputs: BTreeMap<String, TemplateOutput>,
}

/// Output keys must be alphanumeric: `api_url` becomes `ApiUrl`.
pub fn output_key(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Integration properties that live inside `AWS::ApiGateway::Method`.
const FOLDED_INTEGRATION_PROPERTIES: &[&str] = &["Type", "IntegrationHttpMethod", "Uri"];

/// Render `graph` as a template. Integrations have no resource type of their
/// own in the template; each is folded into its method, and edges to it are
/// redirected to that method.
pub fn render(graph: &ResourceGraph, description: Option<String>) -> Result<Template, GraphError> {
    graph.validate()?;

    let mut folded_into: BTreeMap<String, String> = BTreeMap::new();
    let mut method_integrations: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for integration in graph.of_kind(ResourceKind::Integration) {
        let method = integration_method(integration, |id| graph.get(id)).ok_or_else(|| {
            GraphError::UnknownReference {
                from: integration.id.to_string(),
                to: ResourceKind::Method.type_name().to_string(),
            }
        })?;
        let mut body = Map::new();
        for key in FOLDED_INTEGRATION_PROPERTIES {
            if let Some(v) = integration.property(key) {
                body.insert(key.to_string(), v.clone());
            }
        }
        folded_into.insert(integration.id.to_string(), method.id.to_string());
        method_integrations.insert(method.id.to_string(), body);
    }

    let mut resources = BTreeMap::new();
    for spec in graph.resources() {
        if spec.kind == ResourceKind::Integration {
            continue;
        }
        let mut properties = spec.properties.clone();
        if let Some(integration) = method_integrations.remove(spec.id.as_str()) {
            if let Value::Object(props) = &mut properties {
                props.insert("Integration".into(), Value::Object(integration));
            }
        }
        let depends_on: BTreeSet<String> = spec
            .depends_on
            .iter()
            .map(|dep| folded_into.get(dep.as_str()).cloned().unwrap_or_else(|| dep.to_string()))
            .filter(|dep| dep != spec.id.as_str())
            .collect();
        resources.insert(
            spec.id.to_string(),
            TemplateResource {
                ty: spec.kind.type_name().to_string(),
                properties,
                depends_on: depends_on.into_iter().collect(),
            },
        );
    }

    let outputs = graph
        .outputs()
        .iter()
        .map(|(name, output)| {
            (
                output_key(name),
                TemplateOutput {
                    description: output.description.clone(),
                    value: output.value.clone(),
                },
            )
        })
        .collect();

    Ok(Template {
        version: TEMPLATE_VERSION.to_string(),
        description,
        resources,
        outputs,
    })
}
