// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Configuration for remote MCP servers this agent consumes.
//!
//! Deserialized straight out of the project/global config file alongside the
//! rest of `openfork-config`'s schema.  Kept here rather than in
//! `openfork-config` itself so that crate stays free of the `auth` header
//! vocabulary that only this crate needs.

use std::collections::HashMap;

use serde::Deserialize;

/// One configured remote MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    /// Short identifier used to build adapter tool names: `mcp__{name}__{tool}`.
    pub name: String,
    #[serde(flatten)]
    pub transport: McpTransportConfig,
}

/// How to reach a configured MCP server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum McpTransportConfig {
    /// Spawn a subprocess and speak newline-delimited JSON-RPC over its
    /// stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// POST each JSON-RPC request to a fixed URL and read the response body.
    Http {
        url: String,
        #[serde(default)]
        auth: Option<McpAuth>,
    },
}

/// Authentication to attach to HTTP transport requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum McpAuth {
    /// Sent as `X-API-Key: <value>`.
    ApiKey { value: String },
    /// Sent as `Authorization: Bearer <token>`.
    Bearer { token: String },
}

/// Expand `${VAR}` / `$VAR` references in a string against the process
/// environment, falling back to the literal string on any expansion error
/// (e.g. the variable is unset).
pub(crate) fn expand_env(s: &str) -> String {
    shellexpand::env(s)
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| s.to_string())
}
