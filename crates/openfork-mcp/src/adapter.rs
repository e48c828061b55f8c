// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`McpToolAdapter`] — exposes one remote MCP tool through the same
//! [`openfork_tools::Tool`] trait every built-in tool implements, so the
//! agent loop and permission engine never need to know a call is going over
//! the network.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use openfork_tools::{ApprovalPolicy, OutputCategory, Tool, ToolCall, ToolOutput, ToolOutputPart};

use crate::client::McpClient;
use crate::protocol::RemoteContent;

/// Adapts one tool exposed by a connected MCP server.
///
/// `name()` returns `mcp__{server}__{tool}`, matching the naming convention
/// used for every remote-tool adapter.
pub struct McpToolAdapter {
    client: Arc<McpClient>,
    remote_name: String,
    qualified_name: String,
    description: String,
    schema: Value,
}

impl McpToolAdapter {
    pub fn new(client: Arc<McpClient>, remote: &crate::protocol::RemoteTool) -> Self {
        let qualified_name = format!("mcp__{}__{}", client.server_name, remote.name);
        Self {
            client,
            remote_name: remote.name.clone(),
            qualified_name,
            description: remote.description.clone(),
            schema: remote.input_schema.clone(),
        }
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.qualified_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn default_policy(&self) -> ApprovalPolicy {
        // Remote tools run code we didn't write on a server we don't control —
        // ask by default, same posture as an unclassified shell command.
        ApprovalPolicy::Ask
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.client.call_tool(&self.remote_name, call.args.clone()).await {
            Ok(result) => {
                let parts: Vec<ToolOutputPart> = result
                    .content
                    .into_iter()
                    .filter_map(|c| match c {
                        RemoteContent::Text { text } => Some(ToolOutputPart::Text(text)),
                        RemoteContent::Image { data, mime_type } => Some(ToolOutputPart::Image(
                            format!("data:{mime_type};base64,{data}"),
                        )),
                        RemoteContent::Other => None,
                    })
                    .collect();
                let parts = if parts.is_empty() {
                    vec![ToolOutputPart::Text(String::new())]
                } else {
                    parts
                };
                let mut out = ToolOutput::with_parts(&call.id, parts);
                out.is_error = result.is_error;
                out
            }
            Err(e) => ToolOutput::err(&call.id, format!("mcp call to {} failed: {e}", self.qualified_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{McpServerConfig, McpTransportConfig};
    use crate::protocol::RemoteTool;

    async fn fake_client(server_name: &str) -> Arc<McpClient> {
        // McpClient::connect performs the initialize handshake; for pure
        // naming / schema tests we only need the server_name field, so build
        // the struct directly with a transport to a no-op process instead.
        let config = McpServerConfig {
            name: server_name.to_string(),
            transport: McpTransportConfig::Stdio {
                command: "true".to_string(),
                args: vec![],
                env: Default::default(),
            },
        };
        let transport = crate::transport::Transport::connect(&config.transport)
            .await
            .expect("spawn no-op process");
        Arc::new(McpClient {
            server_name: config.name,
            transport,
            ids: crate::transport::IdGen::new(),
        })
    }

    fn remote_tool(name: &str) -> RemoteTool {
        RemoteTool {
            name: name.to_string(),
            description: "does a thing".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn adapter_name_is_qualified_with_server_and_tool() {
        let client = fake_client("github").await;
        let adapter = McpToolAdapter::new(client, &remote_tool("search_issues"));
        assert_eq!(adapter.name(), "mcp__github__search_issues");
    }

    #[tokio::test]
    async fn adapter_default_policy_is_ask() {
        let client = fake_client("github").await;
        let adapter = McpToolAdapter::new(client, &remote_tool("search_issues"));
        assert_eq!(adapter.default_policy(), ApprovalPolicy::Ask);
    }

    #[tokio::test]
    async fn adapter_schema_passes_through_unmodified() {
        let client = fake_client("linear").await;
        let tool = remote_tool("create_ticket");
        let adapter = McpToolAdapter::new(client, &tool);
        assert_eq!(adapter.parameters_schema(), tool.input_schema);
    }
}
