// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The two transports a configured MCP server can use: a child process
//! speaking newline-delimited JSON-RPC over stdio, or a plain HTTP endpoint
//! that takes one JSON-RPC request per POST.
//!
//! Each transport exposes a single `roundtrip` operation: send a JSON-RPC
//! request, wait for the response with the matching `id`.  Notifications
//! (no response expected) go through `notify`.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::{expand_env, McpAuth, McpTransportConfig};
use crate::error::McpError;
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport {
    pub async fn connect(config: &McpTransportConfig) -> Result<Self, McpError> {
        match config {
            McpTransportConfig::Stdio { command, args, env } => {
                Ok(Transport::Stdio(StdioTransport::spawn(command, args, env)?))
            }
            McpTransportConfig::Http { url, auth } => {
                Ok(Transport::Http(HttpTransport::new(url.clone(), auth.clone())))
            }
        }
    }

    pub async fn roundtrip(&self, id: u64, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let raw = match self {
            Transport::Stdio(t) => t.roundtrip(id, method, params).await?,
            Transport::Http(t) => t.roundtrip(id, method, params).await?,
        };
        if let Some(err) = raw.error {
            return Err(McpError::Remote { code: err.code, message: err.message });
        }
        Ok(raw.result.unwrap_or(Value::Null))
    }

    pub async fn notify(&self, method: &'static str, params: Option<Value>) -> Result<(), McpError> {
        match self {
            Transport::Stdio(t) => t.notify(method, params).await,
            Transport::Http(t) => t.notify(method, params).await,
        }
    }
}

/// Spawned child process talking newline-delimited JSON-RPC.
pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
}

impl StdioTransport {
    fn spawn(
        command: &str,
        args: &[String],
        env: &std::collections::HashMap<String, String>,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(expand_env(command));
        for arg in args {
            cmd.arg(expand_env(arg));
        }
        for (k, v) in env {
            cmd.env(k, expand_env(v));
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(McpError::Spawn)?;
        let stdin = child.stdin.take().ok_or(McpError::ProcessClosed)?;
        let stdout = child.stdout.take().ok_or(McpError::ProcessClosed)?;

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
        })
    }

    async fn write_line(&self, line: String) -> Result<(), McpError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await.map_err(McpError::Io)?;
        stdin.write_all(b"\n").await.map_err(McpError::Io)?;
        stdin.flush().await.map_err(McpError::Io)
    }

    async fn read_response_for(&self, id: u64) -> Result<JsonRpcResponse, McpError> {
        let mut stdout = self.stdout.lock().await;
        let fut = async {
            loop {
                let mut line = String::new();
                let n = stdout.read_line(&mut line).await.map_err(McpError::Io)?;
                if n == 0 {
                    return Err(McpError::ProcessClosed);
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(resp) => {
                        let matches = resp
                            .id
                            .as_ref()
                            .and_then(|v| v.as_u64())
                            .map(|got| got == id)
                            .unwrap_or(false);
                        if matches {
                            return Ok(resp);
                        }
                        // Not our response (could be another in-flight id, or a
                        // server-initiated notification) — keep reading.
                    }
                    Err(e) => return Err(McpError::Protocol(e.to_string())),
                }
            }
        };
        tokio::time::timeout(REQUEST_TIMEOUT, fut)
            .await
            .map_err(|_| McpError::Timeout(REQUEST_TIMEOUT))?
    }

    async fn roundtrip(&self, id: u64, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, McpError> {
        let req = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&req).map_err(|e| McpError::Protocol(e.to_string()))?;
        self.write_line(line).await?;
        self.read_response_for(id).await
    }

    async fn notify(&self, method: &'static str, params: Option<Value>) -> Result<(), McpError> {
        let note = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&note).map_err(|e| McpError::Protocol(e.to_string()))?;
        self.write_line(line).await
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.try_lock() {
            let _ = child.start_kill();
        }
    }
}

/// One JSON-RPC request per HTTP POST, per the MCP HTTP transport.
pub struct HttpTransport {
    url: String,
    auth: Option<McpAuth>,
    http: reqwest::Client,
}

impl HttpTransport {
    fn new(url: String, auth: Option<McpAuth>) -> Self {
        Self { url, auth, http: reqwest::Client::new() }
    }

    fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(McpAuth::ApiKey { value }) => req.header("X-API-Key", expand_env(value)),
            Some(McpAuth::Bearer { token }) => {
                req = req.header("Authorization", format!("Bearer {}", expand_env(token)));
                req
            }
            None => req,
        }
    }

    async fn post(&self, body: Value) -> Result<reqwest::Response, McpError> {
        let req = self.http.post(&self.url).json(&body);
        let req = self.apply_auth(req);
        tokio::time::timeout(REQUEST_TIMEOUT, req.send())
            .await
            .map_err(|_| McpError::Timeout(REQUEST_TIMEOUT))?
            .map_err(McpError::Http)
    }

    async fn roundtrip(&self, id: u64, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, McpError> {
        let req = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_value(&req).map_err(|e| McpError::Protocol(e.to_string()))?;
        let resp = self.post(body).await?;
        let text = resp.text().await.map_err(McpError::Http)?;
        serde_json::from_str(&text).map_err(|e| McpError::Protocol(e.to_string()))
    }

    async fn notify(&self, method: &'static str, params: Option<Value>) -> Result<(), McpError> {
        let note = JsonRpcNotification::new(method, params);
        let body = serde_json::to_value(&note).map_err(|e| McpError::Protocol(e.to_string()))?;
        self.post(body).await?;
        Ok(())
    }
}

/// Monotonic per-client JSON-RPC id generator.
pub struct IdGen(AtomicU64);

impl IdGen {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
