// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `openfork-mcp` — MCP (Model Context Protocol) **client** support.
//!
//! OpenFork consumes tools exposed by remote MCP servers rather than serving
//! its own tools over MCP: each configured server is connected once at
//! startup, its `tools/list` result is wrapped in one [`McpToolAdapter`] per
//! tool (named `mcp__{server}__{tool}`), and those adapters register into
//! the same [`openfork_tools::ToolRegistry`] the built-in tools live in.
//!
//! # Configuration
//!
//! ```text
//! mcp_servers:
//!   - name: github
//!     transport: stdio
//!     command: npx
//!     args: ["-y", "mcp-server-github"]
//!     env:
//!       GITHUB_TOKEN: "${GITHUB_TOKEN}"
//!   - name: linear
//!     transport: http
//!     url: https://mcp.example.com/rpc
//!     auth:
//!       kind: bearer
//!       token: "${LINEAR_TOKEN}"
//! ```
//!
//! # Architecture
//!
//! ```text
//! openfork-core agent loop
//!       │
//!       ▼
//! ToolRegistry  ──►  McpToolAdapter::execute()
//!       │
//!       ▼
//! McpClient (per server)
//!       │  stdio (child process) or HTTP POST
//!       ▼
//! remote MCP server
//! ```

pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use adapter::McpToolAdapter;
pub use client::McpClient;
pub use config::{McpAuth, McpServerConfig, McpTransportConfig};
pub use error::McpError;

use std::sync::Arc;

/// Connect to every configured server and build one adapter per remote tool.
///
/// A server that fails to connect is skipped with a warning rather than
/// aborting discovery for the rest — one misconfigured MCP server shouldn't
/// take down every other tool source.
pub async fn discover_adapters(configs: &[McpServerConfig]) -> Vec<McpToolAdapter> {
    let mut adapters = Vec::new();
    for config in configs {
        let client = match McpClient::connect(config).await {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::warn!(server = %config.name, error = %e, "failed to connect to MCP server");
                continue;
            }
        };
        let tools = match client.list_tools().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(server = %config.name, error = %e, "failed to list tools from MCP server");
                continue;
            }
        };
        for tool in &tools {
            adapters.push(McpToolAdapter::new(client.clone(), tool));
        }
    }
    adapters
}
