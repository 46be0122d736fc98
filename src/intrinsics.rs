//! CloudFormation intrinsic functions inside resource properties.
//!
//! Properties are stored in the same JSON shape a template uses, so the
//! graph renders to a template verbatim. The local engine resolves the
//! supported subset (`Ref`, `Fn::GetAtt`, `Fn::Sub` string form, `Fn::Join`)
//! against recorded resource attributes.

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};

use crate::graph::LogicalId;
use crate::regions;

pub const REF: &str = "Ref";
pub const GET_ATT: &str = "Fn::GetAtt";
pub const SUB: &str = "Fn::Sub";
pub const JOIN: &str = "Fn::Join";

/// Attribute every resource exposes through `Ref`.
pub const REF_ATTRIBUTE: &str = "Ref";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("attribute '{attribute}' of '{id}' is not known yet")]
    MissingAttribute { id: String, attribute: String },
    #[error("unknown pseudo parameter '{0}'")]
    UnknownPseudo(String),
    #[error("malformed intrinsic: {0}")]
    Malformed(String),
}

pub fn reference(id: &LogicalId) -> Value {
    json!({ REF: id.as_str() })
}

pub fn get_att(id: &LogicalId, attribute: &str) -> Value {
    json!({ GET_ATT: [id.as_str(), attribute] })
}

pub fn sub(template: impl Into<String>) -> Value {
    let template: String = template.into();
    json!({ SUB: template })
}

pub fn is_pseudo_parameter(name: &str) -> bool {
    name.starts_with("AWS::")
}

/// Values for `AWS::*` pseudo parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PseudoParameters {
    pub region: String,
    pub account_id: String,
    pub stack_name: String,
}

impl PseudoParameters {
    pub fn get(&self, name: &str) -> Option<String> {
        let value = match name {
            "AWS::Region" => self.region.clone(),
            "AWS::AccountId" => self.account_id.clone(),
            "AWS::StackName" => self.stack_name.clone(),
            "AWS::Partition" => regions::partition(&self.region).to_string(),
            "AWS::URLSuffix" => regions::url_suffix(&self.region).to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Where resolution finds attributes of already-provisioned resources.
pub trait Lookup {
    fn attribute(&self, id: &str, attribute: &str) -> Option<String>;
    fn pseudo(&self, name: &str) -> Option<String>;
}

/// Pseudo parameters alone; every resource attribute is unknown.
impl Lookup for PseudoParameters {
    fn attribute(&self, _id: &str, _attribute: &str) -> Option<String> {
        None
    }

    fn pseudo(&self, name: &str) -> Option<String> {
        self.get(name)
    }
}

/// Logical ids named by the one-key object `{"Ref": ..}` or `{"Fn::GetAtt": ..}`,
/// if `value` is one.
pub fn referenced_id(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    if let Some(Value::String(name)) = obj.get(REF) {
        return (!is_pseudo_parameter(name)).then_some(name.as_str());
    }
    match obj.get(GET_ATT)? {
        Value::Array(parts) => parts.first()?.as_str(),
        Value::String(dotted) => dotted.split_once('.').map(|(id, _)| id),
        _ => None,
    }
}

/// Every logical id referenced anywhere inside `value`.
pub fn collect_references(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_into(value, &mut out);
    out
}

fn collect_into(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(obj) => {
            if obj.len() == 1 {
                if let Some(id) = referenced_id(value) {
                    out.insert(id.to_string());
                    return;
                }
                if let Some(Value::String(template)) = obj.get(SUB) {
                    for var in sub_variables(template) {
                        let id = var.split_once('.').map(|(id, _)| id).unwrap_or(var);
                        if !is_pseudo_parameter(id) {
                            out.insert(id.to_string());
                        }
                    }
                    return;
                }
            }
            for v in obj.values() {
                collect_into(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_into(v, out);
            }
        }
        _ => {}
    }
}

/// Variable names inside `${...}`, skipping `${!literal}` escapes.
fn sub_variables(template: &str) -> Vec<&str> {
    let mut vars = vec![];
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else { break };
        let name = &after[..end];
        if !name.starts_with('!') {
            vars.push(name);
        }
        rest = &after[end + 1..];
    }
    vars
}

/// Replace every supported intrinsic in `value` with its concrete value.
pub fn resolve(value: &Value, lookup: &impl Lookup) -> Result<Value, ResolveError> {
    match value {
        Value::Object(obj) if obj.len() == 1 => {
            if let Some(target) = obj.get(REF) {
                let name = target
                    .as_str()
                    .ok_or_else(|| ResolveError::Malformed(format!("Ref target {target}")))?;
                return resolve_ref(name, lookup).map(Value::String);
            }
            if let Some(args) = obj.get(GET_ATT) {
                let (id, attribute) = get_att_parts(args)?;
                return attribute_of(id, attribute, lookup).map(Value::String);
            }
            if let Some(args) = obj.get(SUB) {
                let template = args.as_str().ok_or_else(|| {
                    ResolveError::Malformed("only the string form of Fn::Sub is supported".into())
                })?;
                return resolve_sub(template, lookup).map(Value::String);
            }
            if let Some(args) = obj.get(JOIN) {
                return resolve_join(args, lookup).map(Value::String);
            }
            resolve_map(obj, lookup)
        }
        Value::Object(obj) => resolve_map(obj, lookup),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve(v, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn resolve_map(obj: &Map<String, Value>, lookup: &impl Lookup) -> Result<Value, ResolveError> {
    let mut out = Map::with_capacity(obj.len());
    for (k, v) in obj {
        out.insert(k.clone(), resolve(v, lookup)?);
    }
    Ok(Value::Object(out))
}

fn resolve_ref(name: &str, lookup: &impl Lookup) -> Result<String, ResolveError> {
    if is_pseudo_parameter(name) {
        return lookup
            .pseudo(name)
            .ok_or_else(|| ResolveError::UnknownPseudo(name.to_string()));
    }
    attribute_of(name, REF_ATTRIBUTE, lookup)
}

fn attribute_of(id: &str, attribute: &str, lookup: &impl Lookup) -> Result<String, ResolveError> {
    lookup
        .attribute(id, attribute)
        .ok_or_else(|| ResolveError::MissingAttribute {
            id: id.to_string(),
            attribute: attribute.to_string(),
        })
}

fn get_att_parts(args: &Value) -> Result<(&str, &str), ResolveError> {
    let parts = match args {
        Value::Array(parts) if parts.len() == 2 => (parts[0].as_str(), parts[1].as_str()),
        Value::String(dotted) => match dotted.split_once('.') {
            Some((id, attr)) => (Some(id), Some(attr)),
            None => (None, None),
        },
        _ => (None, None),
    };
    match parts {
        (Some(id), Some(attr)) => Ok((id, attr)),
        _ => Err(ResolveError::Malformed(format!("Fn::GetAtt arguments {args}"))),
    }
}

fn resolve_sub(template: &str, lookup: &impl Lookup) -> Result<String, ResolveError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(ResolveError::Malformed(format!(
                "unterminated variable in Fn::Sub {template:?}"
            )));
        };
        let name = &after[..end];
        if let Some(literal) = name.strip_prefix('!') {
            out.push_str("${");
            out.push_str(literal);
            out.push('}');
        } else if is_pseudo_parameter(name) {
            out.push_str(&resolve_ref(name, lookup)?);
        } else {
            match name.split_once('.') {
                Some((id, attr)) => out.push_str(&attribute_of(id, attr, lookup)?),
                None => out.push_str(&resolve_ref(name, lookup)?),
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve_join(args: &Value, lookup: &impl Lookup) -> Result<String, ResolveError> {
    let malformed = || ResolveError::Malformed(format!("Fn::Join arguments {args}"));
    let parts = args.as_array().filter(|p| p.len() == 2).ok_or_else(malformed)?;
    let delimiter = parts[0].as_str().ok_or_else(malformed)?;
    let items = parts[1].as_array().ok_or_else(malformed)?;
    let mut resolved = Vec::with_capacity(items.len());
    for item in items {
        match resolve(item, lookup)? {
            Value::String(s) => resolved.push(s),
            other => resolved.push(other.to_string()),
        }
    }
    Ok(resolved.join(delimiter))
}
