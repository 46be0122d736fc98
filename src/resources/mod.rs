//! Builders for each resource of the stack. Every builder returns plain
//! [`ResourceSpec`](crate::graph::ResourceSpec)s; wiring them into a graph
//! is the blueprint's job.

pub mod apigateway;
pub mod iam;
pub mod lambda;
pub mod network;
pub mod outputs;
pub mod permission;

pub use apigateway::{GatewaySettings, Routing};
pub use iam::{ExecutionRoleSettings, PolicyDocument, Statement};
pub use lambda::FunctionSettings;
pub use network::NetworkPlacement;
