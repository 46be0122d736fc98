use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_cloudformation::error::DisplayErrorContext;
use aws_sdk_cloudformation::types::{Capability, OnFailure, ResourceStatus, Stack, StackStatus};
use aws_sdk_cloudformation::Client;
use tracing::{debug, info};

use super::template::{output_key, render};
use crate::backend::{ApplyBackend, ApplyReport, Failure};
use crate::error::{Error, Result};
use crate::graph::{LogicalId, ResourceGraph};
use crate::plan::{Action, Change};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(700);

/// Where a stack stands while we wait on it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Progress {
    Settled,
    Gone,
    Pending,
    /// Terminal but not what was asked for, including completed rollbacks.
    Failed(String),
    /// No status reported at all.
    Unknown,
}

impl Progress {
    fn of(status: Option<&StackStatus>) -> Self {
        let Some(status) = status else {
            return Progress::Unknown;
        };
        match status {
            StackStatus::CreateComplete
            | StackStatus::UpdateComplete
            | StackStatus::ImportComplete => Progress::Settled,
            StackStatus::DeleteComplete => Progress::Gone,

            StackStatus::CreateInProgress
            | StackStatus::DeleteInProgress
            | StackStatus::ImportInProgress
            | StackStatus::ImportRollbackInProgress
            | StackStatus::ReviewInProgress
            | StackStatus::RollbackInProgress
            | StackStatus::UpdateCompleteCleanupInProgress
            | StackStatus::UpdateInProgress
            | StackStatus::UpdateRollbackCompleteCleanupInProgress
            | StackStatus::UpdateRollbackInProgress => Progress::Pending,

            other => Progress::Failed(other.as_str().to_string()),
        }
    }
}

/// Deploys the whole graph as one CloudFormation stack. The provider does the
/// ordering from `DependsOn` and intrinsic references.
pub struct CloudFormationBackend {
    client: Client,
    stack_name: String,
    poll_interval: Duration,
}

impl CloudFormationBackend {
    pub fn new(client: Client, stack_name: impl Into<String>) -> Self {
        Self {
            client,
            stack_name: stack_name.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Client from the default credential chain, pinned to `region`.
    pub async fn from_env(region: &str, stack_name: impl Into<String>) -> Self {
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self::new(Client::new(&shared_config), stack_name)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::CloudFormation {
            stack: self.stack_name.clone(),
            message: message.into(),
        }
    }

    /// `None` when the stack does not exist.
    async fn describe_stack(&self) -> Result<Option<Stack>> {
        match self.client.describe_stacks().stack_name(&self.stack_name).send().await {
            Ok(out) => Ok(out.stacks().first().cloned()),
            Err(e) => {
                let message = DisplayErrorContext(e).to_string();
                if message.contains("does not exist") {
                    return Ok(None);
                }
                Err(self.error(message))
            }
        }
    }

    /// Poll until the stack settles. `Ok(None)` once it is gone.
    async fn wait_for_stack(&self) -> Result<Option<Stack>> {
        loop {
            let Some(stack) = self.describe_stack().await? else {
                return Ok(None);
            };
            match Progress::of(stack.stack_status()) {
                Progress::Settled => return Ok(Some(stack)),
                Progress::Gone => return Ok(None),
                Progress::Pending => {
                    debug!(stack = %self.stack_name, status = ?stack.stack_status(), "waiting");
                    tokio::time::sleep(self.poll_interval).await;
                }
                Progress::Failed(status) => {
                    let reason = stack.stack_status_reason().unwrap_or("no reason reported");
                    return Err(self.error(format!("stack ended in {status}: {reason}")));
                }
                Progress::Unknown => {
                    return Err(self.error("describe_stacks returned a stack without a status"));
                }
            }
        }
    }

    /// Returns whether the stack was created (as opposed to updated), or
    /// `None` when there was nothing to update.
    async fn create_or_update(&self, body: &str) -> Result<Option<Action>> {
        if self.describe_stack().await?.is_some() {
            info!(stack = %self.stack_name, "updating stack");
            let sent = self
                .client
                .update_stack()
                .capabilities(Capability::CapabilityNamedIam)
                .capabilities(Capability::CapabilityIam)
                .stack_name(&self.stack_name)
                .template_body(body)
                .send()
                .await;
            if let Err(e) = sent {
                let message = DisplayErrorContext(e).to_string();
                if message.contains("No updates are to be performed") {
                    return Ok(None);
                }
                return Err(self.error(message));
            }
            Ok(Some(Action::Update))
        } else {
            info!(stack = %self.stack_name, "creating stack");
            self.client
                .create_stack()
                .on_failure(OnFailure::Delete)
                .capabilities(Capability::CapabilityNamedIam)
                .capabilities(Capability::CapabilityIam)
                .stack_name(&self.stack_name)
                .template_body(body)
                .send()
                .await
                .map_err(|e| self.error(DisplayErrorContext(e).to_string()))?;
            Ok(Some(Action::Create))
        }
    }

    async fn report_resources(
        &self,
        graph: &ResourceGraph,
        report: &mut ApplyReport,
    ) -> Result<()> {
        let out = self
            .client
            .describe_stack_resources()
            .stack_name(&self.stack_name)
            .send()
            .await
            .map_err(|e| self.error(DisplayErrorContext(e).to_string()))?;
        for resource in out.stack_resources() {
            let Some(id) = resource
                .logical_resource_id()
                .and_then(|id| LogicalId::new(id).ok())
            else {
                continue;
            };
            let Some(spec) = graph.get(id.as_str()) else { continue };
            let action = match resource.resource_status() {
                Some(ResourceStatus::CreateComplete) => Action::Create,
                Some(ResourceStatus::UpdateComplete) => Action::Update,
                Some(ResourceStatus::CreateFailed | ResourceStatus::UpdateFailed) => {
                    report.failed.push(Failure {
                        error: resource
                            .resource_status_reason()
                            .unwrap_or("no reason reported")
                            .to_string(),
                        id,
                    });
                    continue;
                }
                Some(_) => {
                    report.unchanged.push(id);
                    continue;
                }
                None => continue,
            };
            report.applied.push(Change {
                id,
                kind: spec.kind,
                action,
            });
        }
        Ok(())
    }

    /// Stack outputs, keyed by the graph's output names.
    fn outputs(graph: &ResourceGraph, stack: &Stack) -> BTreeMap<String, String> {
        let by_key: BTreeMap<String, &String> = graph
            .outputs()
            .keys()
            .map(|name| (output_key(name), name))
            .collect();
        let mut out = BTreeMap::new();
        for output in stack.outputs() {
            if let (Some(key), Some(value)) = (output.output_key(), output.output_value()) {
                let name = by_key
                    .get(key)
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| key.to_string());
                out.insert(name, value.to_string());
            }
        }
        out
    }
}

#[async_trait]
impl ApplyBackend for CloudFormationBackend {
    async fn apply(&mut self, graph: &ResourceGraph) -> Result<ApplyReport> {
        let template = render(graph, Some(format!("{} RAG API stack", self.stack_name)))?;
        // pretty so the template reads well in the console
        let body = serde_json::to_string_pretty(&template)?;
        let mut report = ApplyReport::default();
        match self.create_or_update(&body).await? {
            Some(_) => {
                let stack = self
                    .wait_for_stack()
                    .await?
                    .ok_or_else(|| self.error("stack disappeared while waiting"))?;
                self.report_resources(graph, &mut report).await?;
                report.outputs = Self::outputs(graph, &stack);
            }
            None => {
                info!(stack = %self.stack_name, "no changes");
                report.unchanged = graph.resources().map(|r| r.id.clone()).collect();
                if let Some(stack) = self.describe_stack().await? {
                    report.outputs = Self::outputs(graph, &stack);
                }
            }
        }
        Ok(report)
    }

    async fn destroy(&mut self, graph: &ResourceGraph) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        if self.describe_stack().await?.is_none() {
            info!(stack = %self.stack_name, "stack does not exist");
            return Ok(report);
        }
        info!(stack = %self.stack_name, "deleting stack");
        self.client
            .delete_stack()
            .stack_name(&self.stack_name)
            .send()
            .await
            .map_err(|e| self.error(DisplayErrorContext(e).to_string()))?;
        if self.wait_for_stack().await?.is_some() {
            return Err(self.error("stack still exists after deletion"));
        }
        let order = graph.topological_order()?;
        for id in order.into_iter().rev() {
            if let Some(spec) = graph.get(id.as_str()) {
                report.applied.push(Change {
                    kind: spec.kind,
                    id,
                    action: Action::Delete,
                });
            }
        }
        Ok(report)
    }
}
