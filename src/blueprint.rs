//! Assembles the stack's resource graph from configuration.

use tracing::debug;

use crate::config::{GrantOrdering, StackConfig};
use crate::error::Result;
use crate::graph::{LogicalId, ResourceGraph};
use crate::intrinsics::PseudoParameters;
use crate::resources::apigateway::{self, GatewaySettings, Routing};
use crate::resources::iam::{self, ExecutionRoleSettings};
use crate::resources::lambda::{self, FunctionSettings};
use crate::resources::network::NetworkPlacement;
use crate::resources::{outputs, permission};

pub struct Blueprint<'a> {
    config: &'a StackConfig,
}

impl<'a> Blueprint<'a> {
    pub fn new(config: &'a StackConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StackConfig {
        self.config
    }

    pub fn pseudo_parameters(&self) -> PseudoParameters {
        PseudoParameters {
            region: self.config.aws.region.clone(),
            account_id: self.config.aws.account_id().to_string(),
            stack_name: self.config.stack_name.clone(),
        }
    }

    fn gateway_settings(&self) -> GatewaySettings<'_> {
        let api = &self.config.api_gateway_config;
        GatewaySettings {
            name: &api.name,
            description: &api.description,
            stage_name: &api.stage_name,
        }
    }

    /// The routing tree on its own, before it is wired to a deployment.
    pub fn routing(&self) -> Routing {
        let function = LogicalId::known(lambda::FUNCTION_ID);
        Routing::new(&self.gateway_settings(), lambda::invoke_arn(&function))
    }

    /// Validate the configuration and assemble the whole graph.
    pub fn build(&self) -> Result<ResourceGraph> {
        self.config.validate()?;
        self.assemble(self.routing())
    }

    /// Assemble the graph around a given routing tree.
    pub fn assemble(&self, routing: Routing) -> Result<ResourceGraph> {
        let config = self.config;
        let mut graph = ResourceGraph::new();

        let (role, policy) = iam::execution_role(&ExecutionRoleSettings {
            role_name: &config.lambda_config.role_name,
            function_name: &config.lambda_config.function_name,
        });

        let placement = NetworkPlacement::new(
            config.vpc_id.clone(),
            config.subnet_ids.clone(),
            config.allowed_security_group_ids.clone(),
        );
        let marker = if config.network.retain_marker_security_group {
            let sg = placement.marker_security_group();
            let id = sg.id.clone();
            graph.add(sg)?;
            Some(id)
        } else {
            None
        };

        let lambda_config = &config.lambda_config;
        let function = lambda::function(
            &FunctionSettings {
                function_name: &lambda_config.function_name,
                image_uri: &lambda_config.image_uri,
                timeout: lambda_config.timeout,
                memory_size: lambda_config.memory_size,
                qdrant: config.qdrant_config.as_ref(),
            },
            &placement,
            &role.id,
            &policy.id,
        );

        let grant = permission::invoke_grant(&function.id);

        let ordering = config.api_gateway_config.grant_ordering;
        let deployment = match ordering {
            GrantOrdering::Explicit => routing.deployment(&[&grant.id])?,
            GrantOrdering::Provider => routing.deployment(&[])?,
        };
        let stage =
            apigateway::stage(&self.gateway_settings(), &routing.rest_api.id, &deployment.id);

        graph.add_output(outputs::API_URL, outputs::api_url(&routing.rest_api.id, &stage.id));
        graph.add_output(outputs::LAMBDA_ARN, outputs::lambda_arn(&function.id));
        graph.add_output(outputs::LAMBDA_SG_ID, outputs::lambda_sg_id(marker.as_ref()));

        graph.add(role)?;
        graph.add(policy)?;
        graph.add(function)?;
        graph.add(grant)?;
        for spec in routing.into_specs() {
            graph.add(spec)?;
        }
        graph.add(deployment)?;
        graph.add(stage)?;

        graph.validate()?;
        debug!(
            stack = %config.stack_name,
            resources = graph.len(),
            grant_ordering = ?ordering,
            "assembled resource graph"
        );
        Ok(graph)
    }
}
