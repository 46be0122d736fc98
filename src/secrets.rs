//! Secret references.
//!
//! Credentials such as the Qdrant API key never enter the resource graph as
//! values. Configuration names a secret-store entry instead, and the graph
//! carries a CloudFormation dynamic reference that the provider resolves at
//! deploy time. Neither the rendered template nor the state file ever holds
//! the secret itself.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const SECRETS_MANAGER_SCHEME: &str = "secretsmanager:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretRefError {
    // never echo the rejected value, it may be the plaintext secret
    #[error("secret values must be given as 'secretsmanager:<secret id>[#<json key>]', plaintext is not accepted")]
    MissingScheme,
    #[error("secret reference has an empty secret id")]
    EmptyId,
    #[error("secret reference has an empty json key after '#'")]
    EmptyJsonKey,
    #[error("secret reference contains a character that cannot appear in a dynamic reference")]
    InvalidCharacter,
}

/// A pointer to a value held in AWS Secrets Manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretRef {
    secret_id: String,
    json_key: Option<String>,
}

impl SecretRef {
    pub fn new(
        secret_id: impl Into<String>,
        json_key: Option<String>,
    ) -> Result<Self, SecretRefError> {
        let secret_id = secret_id.into();
        if secret_id.is_empty() {
            return Err(SecretRefError::EmptyId);
        }
        if matches!(json_key.as_deref(), Some("")) {
            return Err(SecretRefError::EmptyJsonKey);
        }
        let bad = |s: &str| s.chars().any(|c| c.is_whitespace() || c == '{' || c == '}');
        if bad(&secret_id) || json_key.as_deref().is_some_and(bad) {
            return Err(SecretRefError::InvalidCharacter);
        }
        Ok(Self { secret_id, json_key })
    }

    pub fn secret_id(&self) -> &str {
        &self.secret_id
    }

    pub fn json_key(&self) -> Option<&str> {
        self.json_key.as_deref()
    }

    /// The `{{resolve:...}}` form understood by CloudFormation.
    pub fn dynamic_reference(&self) -> String {
        match &self.json_key {
            Some(key) => format!(
                "{{{{resolve:secretsmanager:{}:SecretString:{}}}}}",
                self.secret_id, key
            ),
            None => format!("{{{{resolve:secretsmanager:{}}}}}", self.secret_id),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SECRETS_MANAGER_SCHEME, self.secret_id)?;
        if let Some(key) = &self.json_key {
            write!(f, "#{key}")?;
        }
        Ok(())
    }
}

impl FromStr for SecretRef {
    type Err = SecretRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix(SECRETS_MANAGER_SCHEME)
            .ok_or(SecretRefError::MissingScheme)?;
        match rest.split_once('#') {
            Some((id, key)) => Self::new(id, Some(key.to_string())),
            None => Self::new(rest, None),
        }
    }
}

impl TryFrom<String> for SecretRef {
    type Error = SecretRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SecretRef> for String {
    fn from(value: SecretRef) -> Self {
        value.to_string()
    }
}
