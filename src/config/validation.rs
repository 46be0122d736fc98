// Configuration validation
//
// Checks what the provider would otherwise only reject mid-apply.

use tracing::warn;

use super::{ConfigError, StackConfig};
use crate::regions;

fn invalid(msg: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(msg.into()))
}

pub fn validate_config(config: &StackConfig) -> Result<(), ConfigError> {
    validate_stack_name(&config.stack_name)?;
    validate_aws(config)?;
    validate_network(config)?;
    validate_lambda(config)?;
    validate_qdrant(config)?;
    validate_api_gateway(config)?;
    Ok(())
}

// A stack name can contain only alphanumeric characters (case sensitive) and hyphens.
// It must start with an alphabetical character and can't be longer than 128 characters.
fn validate_stack_name(stack_name: &str) -> Result<(), ConfigError> {
    let starts_alpha = stack_name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    let charset = stack_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !starts_alpha || !charset || stack_name.len() > 128 {
        return invalid(format!(
            "stackName {stack_name:?} must start with a letter, contain only alphanumerics and hyphens, and be at most 128 characters"
        ));
    }
    Ok(())
}

fn validate_aws(config: &StackConfig) -> Result<(), ConfigError> {
    if !regions::is_valid_region(&config.aws.region) {
        return invalid(format!(
            "aws.region {:?} is not a known region. Must be one of {:?}",
            config.aws.region,
            regions::VALID_AWS_REGIONS
        ));
    }
    match &config.aws.account_id {
        Some(account) if !regions::is_valid_account_id(account) => {
            return invalid(format!("aws.accountId {account:?} must be 12 digits"));
        }
        Some(_) => {}
        None => warn!(
            account_id = config.aws.account_id(),
            "aws.accountId not set; log and invoke ARNs use the default account"
        ),
    }
    Ok(())
}

fn validate_network(config: &StackConfig) -> Result<(), ConfigError> {
    if config.vpc_id.trim().is_empty() {
        return invalid("vpcId must not be empty");
    }
    if config.subnet_ids.is_empty() {
        return invalid("subnetIds must list at least one subnet");
    }
    if config.subnet_ids.iter().any(|s| s.trim().is_empty()) {
        return invalid("subnetIds must not contain empty ids");
    }
    if config.allowed_security_group_ids.is_empty() {
        return invalid("allowedSecurityGroupIds must list at least one security group");
    }
    if config.allowed_security_group_ids.iter().any(|s| s.trim().is_empty()) {
        return invalid("allowedSecurityGroupIds must not contain empty ids");
    }
    // lambda VpcConfig limits
    if config.subnet_ids.len() > 16 {
        return invalid("subnetIds accepts at most 16 subnets");
    }
    if config.allowed_security_group_ids.len() > 5 {
        return invalid("allowedSecurityGroupIds accepts at most 5 security groups");
    }
    Ok(())
}

fn validate_lambda(config: &StackConfig) -> Result<(), ConfigError> {
    let lambda = &config.lambda_config;
    if lambda.image_uri.trim().is_empty() {
        return invalid("lambdaConfig.imageUri must not be empty");
    }
    if lambda.timeout < 1 || lambda.timeout > 900 {
        return invalid(format!(
            "lambdaConfig.timeout {} must be between 1 and 900",
            lambda.timeout
        ));
    }
    if lambda.memory_size < 128 || lambda.memory_size > 10240 {
        return invalid(format!(
            "lambdaConfig.memorySize {} must be between 128 and 10240",
            lambda.memory_size
        ));
    }
    let name = &lambda.function_name;
    if name.is_empty()
        || name.len() > 64
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return invalid(format!(
            "lambdaConfig.functionName {name:?} must be 1-64 characters of [A-Za-z0-9_-]"
        ));
    }
    let role = &lambda.role_name;
    if role.is_empty()
        || role.len() > 64
        || !role.chars().all(|c| c.is_ascii_alphanumeric() || "+=,.@_-".contains(c))
    {
        return invalid(format!(
            "lambdaConfig.roleName {role:?} must be 1-64 characters of [A-Za-z0-9+=,.@_-]"
        ));
    }
    Ok(())
}

fn validate_qdrant(config: &StackConfig) -> Result<(), ConfigError> {
    match &config.qdrant_config {
        Some(qdrant) if qdrant.host.trim().is_empty() => {
            invalid("qdrantConfig.host must not be empty")
        }
        Some(_) => Ok(()),
        None => {
            warn!(
                "qdrantConfig not set; the function environment will carry empty Qdrant settings"
            );
            Ok(())
        }
    }
}

fn validate_api_gateway(config: &StackConfig) -> Result<(), ConfigError> {
    let api = &config.api_gateway_config;
    if api.name.trim().is_empty() {
        return invalid("apiGatewayConfig.name must not be empty");
    }
    if api.stage_name.is_empty()
        || api.stage_name.len() > 128
        || !api
            .stage_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return invalid(format!(
            "apiGatewayConfig.stageName {:?} must be 1-128 characters of [A-Za-z0-9_-]",
            api.stage_name
        ));
    }
    Ok(())
}
