//! CloudFormation rendering and deployment.

mod cloudformation;
pub mod template;

pub use cloudformation::CloudFormationBackend;
pub use template::{output_key, render, Template};
