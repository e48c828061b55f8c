// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors that can occur while talking to a remote MCP server.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to spawn MCP server process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("MCP server process exited before responding")]
    ProcessClosed,

    #[error("I/O error talking to MCP server: {0}")]
    Io(#[source] std::io::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[source] reqwest::Error),

    #[error("malformed JSON-RPC message: {0}")]
    Protocol(String),

    #[error("MCP server returned an error ({code}): {message}")]
    Remote { code: i64, message: String },

    #[error("request to MCP server timed out after {0:?}")]
    Timeout(std::time::Duration),
}
