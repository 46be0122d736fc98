use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::graph::{LogicalId, ResourceGraph};
use crate::plan::Change;

/// Anything that can make a graph real, and tear it down again.
#[async_trait]
pub trait ApplyBackend: Send {
    async fn apply(&mut self, graph: &ResourceGraph) -> Result<ApplyReport>;

    async fn destroy(&mut self, graph: &ResourceGraph) -> Result<ApplyReport>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub id: LogicalId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub id: LogicalId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Changes that went through, in execution order.
    pub applied: Vec<Change>,
    pub unchanged: Vec<LogicalId>,
    pub failed: Vec<Failure>,
    pub skipped: Vec<Skipped>,
    pub outputs: BTreeMap<String, String>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn was_applied(&self, id: &str) -> bool {
        self.applied.iter().any(|c| c.id.as_str() == id)
    }

    pub fn was_skipped(&self, id: &str) -> bool {
        self.skipped.iter().any(|s| s.id.as_str() == id)
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for change in &self.applied {
            writeln!(f, "{:>8} {} ({})", change.action.to_string(), change.id, change.kind)?;
        }
        for failure in &self.failed {
            writeln!(f, "  failed {}: {}", failure.id, failure.error)?;
        }
        for skipped in &self.skipped {
            writeln!(f, " skipped {}: {}", skipped.id, skipped.reason)?;
        }
        for (name, value) in &self.outputs {
            writeln!(f, "{name} = {value}")?;
        }
        write!(
            f,
            "{} applied, {} unchanged, {} failed, {} skipped",
            self.applied.len(),
            self.unchanged.len(),
            self.failed.len(),
            self.skipped.len()
        )
    }
}
