// Stack configuration
//
// Sources, lowest to highest priority:
// 1. Built-in defaults
// 2. Config file (--config, RAGSTACK_CONFIG, ./ragstack.toml)
// 3. Environment variables (RAGSTACK_* prefix)

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::secrets::{SecretRef, SecretRefError};

mod sources;
mod validation;

pub use sources::{
    apply_env_overrides, load, load_from_file_path, EnvSource, StdEnvSource, ENV_PREFIX,
};

pub const DEFAULT_STACK_NAME: &str = "indecx-infra";
pub const DEFAULT_REGION: &str = "us-east-1";
/// Account the stack was originally pinned to; used when `aws.accountId` is unset.
pub const DEFAULT_ACCOUNT_ID: &str = "777825471459";
pub const DEFAULT_FUNCTION_NAME: &str = "ragFastApiLambda";
pub const DEFAULT_ROLE_NAME: &str = "validation-service-role";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    // toml's own Display quotes the offending source line, which may hold a
    // plaintext secret, so only the message and position are kept.
    #[error("failed to parse config from {origin}: {message}")]
    Parse { origin: String, message: String },
    #[error("no config file found; pass --config, set RAGSTACK_CONFIG or create ./ragstack.toml")]
    NotFound,
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid secret reference in {field}: {source}")]
    Secret {
        field: &'static str,
        #[source]
        source: SecretRefError,
    },
}

/// Everything needed to assemble the stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackConfig {
    #[serde(default = "default_stack_name")]
    pub stack_name: String,

    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
    pub allowed_security_group_ids: Vec<String>,

    #[serde(default)]
    pub aws: AwsConfig,

    pub lambda_config: LambdaConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qdrant_config: Option<QdrantConfig>,

    pub api_gateway_config: ApiGatewayConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

fn default_stack_name() -> String {
    DEFAULT_STACK_NAME.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsConfig {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            account_id: None,
        }
    }
}

impl AwsConfig {
    pub fn account_id(&self) -> &str {
        self.account_id.as_deref().unwrap_or(DEFAULT_ACCOUNT_ID)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaConfig {
    pub image_uri: String,
    /// seconds, 1..=900
    pub timeout: u32,
    /// MB, 128..=10240
    pub memory_size: u32,
    #[serde(default = "default_function_name")]
    pub function_name: String,
    #[serde(default = "default_role_name")]
    pub role_name: String,
}

fn default_function_name() -> String {
    DEFAULT_FUNCTION_NAME.to_string()
}

fn default_role_name() -> String {
    DEFAULT_ROLE_NAME.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QdrantConfig {
    pub host: String,
    pub api_key: SecretRef,
    #[serde(default)]
    pub collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGatewayConfig {
    pub name: String,
    pub description: String,
    pub stage_name: String,
    #[serde(default)]
    pub grant_ordering: GrantOrdering,
}

/// Whether the deployment waits on the invocation grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantOrdering {
    /// Deployment depends on the grant.
    #[default]
    Explicit,
    /// No edge; ordering is left to the provider.
    Provider,
}

impl std::str::FromStr for GrantOrdering {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "explicit" => Ok(GrantOrdering::Explicit),
            "provider" => Ok(GrantOrdering::Provider),
            _ => Err(ConfigError::Invalid(format!(
                "unsupported grant ordering '{s}'. Supported: explicit, provider"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Create the all-egress marker security group in the VPC.
    #[serde(default)]
    pub retain_marker_security_group: bool,
}

impl StackConfig {
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| {
            let message = match e.span() {
                Some(span) => {
                    let line = content[..span.start.min(content.len())].matches('\n').count() + 1;
                    format!("line {line}: {}", e.message())
                }
                None => e.message().to_string(),
            };
            ConfigError::Parse {
                origin: origin.to_string(),
                message,
            }
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::validate_config(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const EXAMPLE: &str = r#"
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

    #[test]
    fn parses_camel_case_keys_with_defaults() {
        let config = StackConfig::from_toml_str(EXAMPLE, "test").unwrap();
        assert_eq!(config.vpc_id, "vpc-1");
        assert_eq!(config.subnet_ids, vec!["s-1"]);
        assert_eq!(config.allowed_security_group_ids, vec!["sg-1"]);
        assert_eq!(config.lambda_config.memory_size, 512);
        assert_eq!(config.lambda_config.function_name, DEFAULT_FUNCTION_NAME);
        assert_eq!(config.api_gateway_config.grant_ordering, GrantOrdering::Explicit);
        assert_eq!(config.aws.region, DEFAULT_REGION);
        assert_eq!(config.aws.account_id(), DEFAULT_ACCOUNT_ID);
        assert_eq!(config.stack_name, DEFAULT_STACK_NAME);
        assert!(config.qdrant_config.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn qdrant_api_key_must_be_a_secret_reference() {
        let with_plaintext = format!(
            "{EXAMPLE}\n[qdrantConfig]\nhost = \"https://q\"\napiKey = \"hunter2\"\n"
        );
        let err = StackConfig::from_toml_str(&with_plaintext, "test").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(!err.to_string().contains("hunter2"));

        let with_ref = format!(
            "{EXAMPLE}\n[qdrantConfig]\nhost = \"https://q\"\napiKey = \"secretsmanager:qdrant#apiKey\"\n"
        );
        let config = StackConfig::from_toml_str(&with_ref, "test").unwrap();
        let qdrant = config.qdrant_config.unwrap();
        assert_eq!(qdrant.api_key.secret_id(), "qdrant");
        assert_eq!(qdrant.collection, "");
    }

    #[test]
    fn missing_required_key_is_a_parse_error() {
        let without_vpc = EXAMPLE.replace("vpcId = \"vpc-1\"\n", "");
        let err = StackConfig::from_toml_str(&without_vpc, "test").unwrap_err();
        assert!(err.to_string().contains("vpcId"));
    }

    #[test]
    fn grant_ordering_parses_from_strings() {
        assert_eq!("Provider".parse::<GrantOrdering>().unwrap(), GrantOrdering::Provider);
        assert!("sometimes".parse::<GrantOrdering>().is_err());
    }
}
