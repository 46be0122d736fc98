// Configuration source loading.
//
// Priority order:
// 1. Environment variables (RAGSTACK_* prefix)
// 2. Explicit path (CLI --config), then RAGSTACK_CONFIG
// 3. Default config file (./ragstack.toml)

use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ConfigError, GrantOrdering, QdrantConfig, StackConfig};
use crate::secrets::SecretRef;

pub const ENV_PREFIX: &str = "RAGSTACK_";
const DEFAULT_CONFIG_FILE: &str = "./ragstack.toml";

/// Read access to environment variables, without the prefix.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct StdEnvSource;

impl EnvSource for StdEnvSource {
    fn get(&self, key: &str) -> Option<String> {
        env::var(format!("{ENV_PREFIX}{key}")).ok()
    }
}

/// Load, override and validate the configuration.
pub fn load(explicit: Option<&Path>) -> Result<StackConfig, ConfigError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match StdEnvSource.get("CONFIG") {
            Some(p) => PathBuf::from(p),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => PathBuf::from(DEFAULT_CONFIG_FILE),
            None => return Err(ConfigError::NotFound),
        },
    };
    load_from_file_path(path)
}

/// Load configuration from a specific file path, then apply environment overrides.
pub fn load_from_file_path(path: impl AsRef<Path>) -> Result<StackConfig, ConfigError> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading config");
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = StackConfig::from_toml_str(&content, &path.display().to_string())?;
    apply_env_overrides(&mut config, &StdEnvSource)?;
    config.validate()?;
    Ok(config)
}

pub fn apply_env_overrides(
    config: &mut StackConfig,
    env: &impl EnvSource,
) -> Result<(), ConfigError> {
    if let Some(v) = env.get("STACK_NAME") {
        config.stack_name = v;
    }
    if let Some(v) = env.get("REGION") {
        config.aws.region = v;
    }
    if let Some(v) = env.get("ACCOUNT_ID") {
        config.aws.account_id = Some(v);
    }
    if let Some(v) = env.get("IMAGE_URI") {
        config.lambda_config.image_uri = v;
    }
    if let Some(v) = env.get("STAGE_NAME") {
        config.api_gateway_config.stage_name = v;
    }
    if let Some(v) = env.get("GRANT_ORDERING") {
        config.api_gateway_config.grant_ordering = v.parse::<GrantOrdering>()?;
    }

    let host = env.get("QDRANT_HOST");
    let api_key = env
        .get("QDRANT_API_KEY")
        .map(|v| v.parse::<SecretRef>())
        .transpose()
        .map_err(|source| ConfigError::Secret {
            field: "RAGSTACK_QDRANT_API_KEY",
            source,
        })?;
    if let Some(qdrant) = config.qdrant_config.as_mut() {
        if let Some(host) = host {
            qdrant.host = host;
        }
        if let Some(api_key) = api_key {
            qdrant.api_key = api_key;
        }
    } else {
        match (host, api_key) {
            (Some(host), Some(api_key)) => {
                config.qdrant_config = Some(QdrantConfig {
                    host,
                    api_key,
                    collection: String::new(),
                });
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "RAGSTACK_QDRANT_HOST and RAGSTACK_QDRANT_API_KEY must be set together \
                     when qdrantConfig is absent"
                        .into(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::tests::EXAMPLE;

    struct MapEnv(HashMap<&'static str, &'static str>);

    impl EnvSource for MapEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| v.to_string())
        }
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = StackConfig::from_toml_str(EXAMPLE, "test").unwrap();
        let env = MapEnv(HashMap::from([
            ("REGION", "eu-west-1"),
            ("STAGE_NAME", "staging"),
            ("GRANT_ORDERING", "provider"),
            ("QDRANT_HOST", "https://qdrant.internal"),
            ("QDRANT_API_KEY", "secretsmanager:qdrant"),
        ]));
        apply_env_overrides(&mut config, &env).unwrap();
        assert_eq!(config.aws.region, "eu-west-1");
        assert_eq!(config.api_gateway_config.stage_name, "staging");
        assert_eq!(config.api_gateway_config.grant_ordering, GrantOrdering::Provider);
        let qdrant = config.qdrant_config.unwrap();
        assert_eq!(qdrant.host, "https://qdrant.internal");
        assert_eq!(qdrant.api_key.secret_id(), "qdrant");
    }

    #[test]
    fn half_of_a_qdrant_override_is_rejected() {
        let mut config = StackConfig::from_toml_str(EXAMPLE, "test").unwrap();
        let env = MapEnv(HashMap::from([("QDRANT_HOST", "https://qdrant.internal")]));
        assert!(matches!(
            apply_env_overrides(&mut config, &env),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn plaintext_api_key_override_is_rejected() {
        let mut config = StackConfig::from_toml_str(EXAMPLE, "test").unwrap();
        let env = MapEnv(HashMap::from([
            ("QDRANT_HOST", "https://qdrant.internal"),
            ("QDRANT_API_KEY", "plain"),
        ]));
        assert!(matches!(
            apply_env_overrides(&mut config, &env),
            Err(ConfigError::Secret { .. })
        ));
    }

    #[test]
    fn loads_from_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragstack.toml");
        std::fs::write(&path, EXAMPLE).unwrap();
        let config = load_from_file_path(&path).unwrap();
        assert_eq!(config.api_gateway_config.name, "rag");

        let missing = load_from_file_path(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
