use crate::config::ConfigError;
use crate::graph::{GraphError, LogicalId};
use crate::provider::ProvisionError;
use crate::state::StateError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("failed to provision '{id}': {source}")]
    Provision {
        id: LogicalId,
        #[source]
        source: ProvisionError,
    },

    #[error("cloudformation stack '{stack}': {message}")]
    CloudFormation { stack: String, message: String },

    #[error("failed to serialize template: {0}")]
    Serialize(#[from] serde_json::Error),
}
