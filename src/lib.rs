//! Typed declaration of the RAG API stack: an execution role, a VPC attached
//! container-image function and an API Gateway REST proxy in front of it.
//!
//! [`Blueprint`] turns a [`StackConfig`] into a [`ResourceGraph`]. The graph
//! can be checked with [`analysis::analyze`], diffed against recorded state
//! with [`Plan`], rendered as a CloudFormation template, or handed to an
//! [`ApplyBackend`].

pub mod analysis;
pub mod backend;
pub mod blueprint;
pub mod config;
pub mod engine;
mod error;
pub mod graph;
pub mod intrinsics;
pub mod plan;
pub mod provider;
pub mod regions;
pub mod resources;
pub mod secrets;
pub mod stack;
pub mod state;

pub use backend::{ApplyBackend, ApplyReport};
pub use blueprint::Blueprint;
pub use config::StackConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use graph::{LogicalId, ResourceGraph, ResourceKind, ResourceSpec};
pub use plan::{Action, Plan};
pub use provider::{ResourceProvider, SimulatedProvider};
pub use secrets::SecretRef;
pub use stack::CloudFormationBackend;
pub use state::{FileStateStore, MemoryStateStore, StateStore};
