// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`McpClient`] — a connection to one configured remote MCP server.
//!
//! Handles the `initialize` handshake, `tools/list`, and `tools/call`.  The
//! transport (stdio subprocess or HTTP) is chosen by [`crate::config::McpServerConfig`]
//! and hidden behind [`crate::transport::Transport`].

use serde_json::{json, Value};

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::protocol::{ToolCallResult, ToolsListResult, PROTOCOL_VERSION};
use crate::transport::{IdGen, Transport};

pub struct McpClient {
    pub server_name: String,
    pub(crate) transport: Transport,
    pub(crate) ids: IdGen,
}

impl McpClient {
    /// Connect to `config` and complete the MCP `initialize` handshake.
    pub async fn connect(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = Transport::connect(&config.transport).await?;
        let client = Self {
            server_name: config.name.clone(),
            transport,
            ids: IdGen::new(),
        };
        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&self) -> Result<(), McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "openfork", "version": env!("CARGO_PKG_VERSION") },
        });
        self.transport
            .roundtrip(self.ids.next(), "initialize", Some(params))
            .await?;
        self.transport.notify("notifications/initialized", None).await
    }

    pub async fn list_tools(&self) -> Result<Vec<crate::protocol::RemoteTool>, McpError> {
        let result = self
            .transport
            .roundtrip(self.ids.next(), "tools/list", None)
            .await?;
        let parsed: ToolsListResult =
            serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))?;
        Ok(parsed.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self
            .transport
            .roundtrip(self.ids.next(), "tools/call", Some(params))
            .await?;
        serde_json::from_value(result).map_err(|e| McpError::Protocol(e.to_string()))
    }
}
