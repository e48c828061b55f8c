// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ordered pre/post hook pipeline with veto semantics.
//!
//! Hooks are grouped by trigger, sorted by ascending priority, and run
//! sequentially. Pre-hooks can veto the action they guard; post-hooks
//! cannot (their `continue` is ignored).
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// The closed set of trigger points the pipeline fires at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum HookTrigger {
    PreTool,
    PostTool,
    PreEdit,
    PostEdit,
    PreCommand,
    PostCommand,
    PreMessage,
    PostMessage,
    SessionStart,
    SessionEnd,
    OnError,
    OnWarning,
    PreAgentLoop,
    PostAgentLoop,
    MaxIterations,
}

impl HookTrigger {
    /// Only pre-triggers participate in veto semantics.
    pub fn can_veto(self) -> bool {
        matches!(
            self,
            HookTrigger::PreTool
                | HookTrigger::PreEdit
                | HookTrigger::PreCommand
                | HookTrigger::PreMessage
                | HookTrigger::PreAgentLoop
        )
    }
}

/// Mutable context passed to every hook invocation for a given trigger firing.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub session_id: String,
    pub message_id: Option<String>,
    pub agent_slug: Option<String>,
    pub tool_name: Option<String>,
    pub command: Option<String>,
    pub file_path: Option<String>,
    pub error: Option<String>,
    pub data: HashMap<String, serde_json::Value>,
}

impl HookContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// What a single hook invocation returns.
#[derive(Debug, Clone, Default)]
pub struct HookResult {
    pub success: bool,
    pub continue_: bool,
    pub modified_context: Option<HookContext>,
    pub error: Option<String>,
}

impl HookResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            continue_: true,
            modified_context: None,
            error: None,
        }
    }

    pub fn veto(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            continue_: false,
            modified_context: None,
            error: Some(reason.into()),
        }
    }
}

/// Outcome of running a full trigger firing across every registered hook.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// `None` if no pre-hook vetoed; `Some(reason)` otherwise.
    pub vetoed: Option<String>,
    pub context: HookContext,
}

impl PipelineOutcome {
    pub fn vetoed(&self) -> bool {
        self.vetoed.is_some()
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, ctx: &HookContext) -> HookResult;
}

/// Declarative configuration for a registered hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    pub id: String,
    pub name: String,
    pub trigger: HookTrigger,
    pub priority: i64,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: HookKind,
    /// Shell command, script path, or webhook URL, depending on `kind`.
    /// Unused for `Builtin` and `Custom`.
    pub executable: Option<String>,
    /// Only run when this glob matches `ctx.tool_name`/`ctx.command`/`ctx.file_path`.
    pub pattern: Option<String>,
    pub timeout_secs: u64,
    pub continue_on_error: bool,
}

impl HookConfig {
    pub fn builtin(id: &str, name: &str, trigger: HookTrigger, priority: i64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            trigger,
            priority,
            enabled: true,
            kind: HookKind::Builtin,
            executable: None,
            pattern: None,
            timeout_secs: DEFAULT_HOOK_TIMEOUT_SECS,
            continue_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Builtin,
    Command,
    Script,
    Webhook,
    Custom,
}

const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 30;

struct RegisteredHook {
    config: HookConfig,
    implementation: HookImpl,
}

enum HookImpl {
    InProcess(Arc<dyn Hook>),
    /// Command/Script/Webhook are all driven through the same executable
    /// dispatch path, distinguished by `HookConfig::kind`.
    External,
}

/// Built-in hook: vetoes shell commands matching a small set of obviously
/// destructive patterns (e.g. `rm -rf /`).
pub struct CommandValidationHook;

#[async_trait]
impl Hook for CommandValidationHook {
    async fn run(&self, ctx: &HookContext) -> HookResult {
        let Some(command) = &ctx.command else {
            return HookResult::ok();
        };
        let normalized = command.trim();
        let dangerous = DANGEROUS_COMMAND_PATTERNS
            .iter()
            .any(|pat| normalized.contains(pat));
        if dangerous {
            HookResult::veto("Dangerous command pattern detected")
        } else {
            HookResult::ok()
        }
    }
}

const DANGEROUS_COMMAND_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf --no-preserve-root /",
    ":(){ :|:& };:",
    "mkfs.",
    "dd if=/dev/zero of=/dev/",
];

/// The pipeline: a priority-ordered set of hooks per trigger.
pub struct HookPipeline {
    hooks: Vec<RegisteredHook>,
}

impl Default for HookPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl HookPipeline {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// A pipeline with the built-in `CommandValidationHook` wired to
    /// `PreTool` (it inspects `ctx.command`, so it only fires for tool
    /// calls that populate that field, i.e. shell-executing tools).
    pub fn with_builtins() -> Self {
        let mut pipeline = Self::new();
        pipeline.register_in_process(
            HookConfig::builtin(
                "builtin-command-validation",
                "command-validation",
                HookTrigger::PreTool,
                0,
            ),
            Arc::new(CommandValidationHook),
        );
        pipeline
    }

    pub fn register_in_process(&mut self, config: HookConfig, hook: Arc<dyn Hook>) {
        self.hooks.push(RegisteredHook {
            config,
            implementation: HookImpl::InProcess(hook),
        });
    }

    pub fn register_external(&mut self, config: HookConfig) {
        self.hooks.push(RegisteredHook {
            config,
            implementation: HookImpl::External,
        });
    }

    /// Run every enabled, pattern-matching hook registered for `trigger`,
    /// in ascending-priority order. Stops at the first veto for
    /// veto-capable triggers; for non-veto triggers every hook still runs
    /// (its `continue` is ignored) but errors are still surfaced if
    /// `continue_on_error` is false.
    pub async fn fire(&self, trigger: HookTrigger, ctx: HookContext) -> PipelineOutcome {
        let mut matching: Vec<&RegisteredHook> = self
            .hooks
            .iter()
            .filter(|h| h.config.trigger == trigger && h.config.enabled)
            .filter(|h| pattern_matches(&h.config.pattern, &ctx))
            .collect();
        matching.sort_by_key(|h| h.config.priority);

        let mut current = ctx;
        for hook in matching {
            let result = self.run_one(hook, &current).await;
            if let Some(modified) = result.modified_context {
                current = modified;
            }
            if !result.success {
                if hook.config.continue_on_error {
                    continue;
                }
                let reason = result.error.unwrap_or_else(|| "hook failed".to_string());
                return PipelineOutcome {
                    vetoed: Some(reason),
                    context: current,
                };
            }
            if trigger.can_veto() && !result.continue_ {
                let reason = result.error.unwrap_or_else(|| "vetoed".to_string());
                return PipelineOutcome {
                    vetoed: Some(reason),
                    context: current,
                };
            }
        }

        PipelineOutcome {
            vetoed: None,
            context: current,
        }
    }

    async fn run_one(&self, hook: &RegisteredHook, ctx: &HookContext) -> HookResult {
        let budget = Duration::from_secs(hook.config.timeout_secs.max(1));
        let outcome = match &hook.implementation {
            HookImpl::InProcess(h) => timeout(budget, h.run(ctx)).await,
            HookImpl::External => timeout(budget, run_external(&hook.config, ctx)).await,
        };
        match outcome {
            Ok(result) => result,
            Err(_) => HookResult {
                success: false,
                continue_: false,
                modified_context: None,
                error: Some(format!(
                    "hook '{}' timed out after {}s",
                    hook.config.name, hook.config.timeout_secs
                )),
            },
        }
    }
}

fn pattern_matches(pattern: &Option<String>, ctx: &HookContext) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    let candidates = [&ctx.tool_name, &ctx.command, &ctx.file_path];
    candidates
        .into_iter()
        .flatten()
        .any(|c| glob_match(pattern, c))
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re)
        .map(|r| r.is_match(candidate))
        .unwrap_or(false)
}

/// Dispatch a Command/Script/Webhook hook. Command and Script both shell
/// out; the distinction is purely which interpreter invokes `executable`.
/// stdin carries the JSON-encoded context; stdout lines of the form
/// `HOOK_CANCEL:<reason>` are treated as a veto.
async fn run_external(config: &HookConfig, ctx: &HookContext) -> HookResult {
    match config.kind {
        HookKind::Webhook => run_webhook(config, ctx).await,
        HookKind::Command | HookKind::Script => run_shell(config, ctx).await,
        HookKind::Builtin | HookKind::Custom => HookResult::ok(),
    }
}

async fn run_shell(config: &HookConfig, ctx: &HookContext) -> HookResult {
    let Some(executable) = &config.executable else {
        return HookResult {
            success: false,
            continue_: false,
            modified_context: None,
            error: Some(format!("hook '{}' has no executable configured", config.name)),
        };
    };

    let interpreter = if config.kind == HookKind::Script {
        "sh"
    } else {
        "sh"
    };
    let mut cmd = Command::new(interpreter);
    cmd.arg("-c")
        .arg(executable)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.env("HOOK_SESSION_ID", &ctx.session_id);
    if let Some(tool) = &ctx.tool_name {
        cmd.env("HOOK_TOOL_NAME", tool);
    }
    if let Some(command) = &ctx.command {
        cmd.env("HOOK_COMMAND", command);
    }
    if let Some(file_path) = &ctx.file_path {
        cmd.env("HOOK_FILE_PATH", file_path);
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return HookResult {
                success: false,
                continue_: false,
                modified_context: None,
                error: Some(format!("failed to spawn hook '{}': {e}", config.name)),
            }
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::json!({
            "session_id": ctx.session_id,
            "message_id": ctx.message_id,
            "agent_slug": ctx.agent_slug,
            "tool_name": ctx.tool_name,
            "command": ctx.command,
            "file_path": ctx.file_path,
        });
        let _ = stdin.write_all(payload.to_string().as_bytes()).await;
    }

    let output = match child.wait_with_output().await {
        Ok(o) => o,
        Err(e) => {
            return HookResult {
                success: false,
                continue_: false,
                modified_context: None,
                error: Some(format!("hook '{}' failed: {e}", config.name)),
            }
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if let Some(reason) = line.strip_prefix("HOOK_CANCEL:") {
            return HookResult::veto(reason.trim().to_string());
        }
    }

    if output.status.success() {
        HookResult::ok()
    } else {
        HookResult {
            success: false,
            continue_: false,
            modified_context: None,
            error: Some(format!(
                "hook '{}' exited with status {}",
                config.name, output.status
            )),
        }
    }
}

async fn run_webhook(config: &HookConfig, ctx: &HookContext) -> HookResult {
    let Some(url) = &config.executable else {
        return HookResult {
            success: false,
            continue_: false,
            modified_context: None,
            error: Some(format!("hook '{}' has no webhook URL configured", config.name)),
        };
    };
    let payload = serde_json::json!({
        "session_id": ctx.session_id,
        "tool_name": ctx.tool_name,
        "command": ctx.command,
        "file_path": ctx.file_path,
    });
    let client = reqwest::Client::new();
    match client.post(url).json(&payload).send().await {
        Ok(resp) => {
            if resp.status().is_success() {
                HookResult::ok()
            } else {
                HookResult {
                    success: false,
                    continue_: false,
                    modified_context: None,
                    error: Some(format!(
                        "webhook hook '{}' returned status {}",
                        config.name,
                        resp.status()
                    )),
                }
            }
        }
        Err(e) => HookResult {
            success: false,
            continue_: false,
            modified_context: None,
            error: Some(format!("webhook hook '{}' request failed: {e}", config.name)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_validation_vetoes_root_rm() {
        let pipeline = HookPipeline::with_builtins();
        let ctx = HookContext::new("s1").with_command("rm -rf /");
        let outcome = pipeline.fire(HookTrigger::PreTool, ctx).await;
        assert!(outcome.vetoed());
        assert_eq!(outcome.vetoed.as_deref(), Some("Dangerous command pattern detected"));
    }

    #[tokio::test]
    async fn command_validation_allows_benign_command() {
        let pipeline = HookPipeline::with_builtins();
        let ctx = HookContext::new("s1").with_command("ls -la");
        let outcome = pipeline.fire(HookTrigger::PreTool, ctx).await;
        assert!(!outcome.vetoed());
    }

    #[tokio::test]
    async fn post_hook_cannot_veto() {
        struct AlwaysVetoes;
        #[async_trait]
        impl Hook for AlwaysVetoes {
            async fn run(&self, _ctx: &HookContext) -> HookResult {
                HookResult::veto("nope")
            }
        }
        let mut pipeline = HookPipeline::new();
        pipeline.register_in_process(
            HookConfig::builtin("t", "t", HookTrigger::PostTool, 0),
            Arc::new(AlwaysVetoes),
        );
        let ctx = HookContext::new("s1");
        let outcome = pipeline.fire(HookTrigger::PostTool, ctx).await;
        assert!(!outcome.vetoed());
    }

    #[tokio::test]
    async fn hooks_run_in_priority_order() {
        struct Recorder(Arc<std::sync::Mutex<Vec<&'static str>>>, &'static str);
        #[async_trait]
        impl Hook for Recorder {
            async fn run(&self, _ctx: &HookContext) -> HookResult {
                self.0.lock().unwrap().push(self.1);
                HookResult::ok()
            }
        }
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pipeline = HookPipeline::new();
        pipeline.register_in_process(
            HookConfig::builtin("second", "second", HookTrigger::PreMessage, 10),
            Arc::new(Recorder(order.clone(), "second")),
        );
        pipeline.register_in_process(
            HookConfig::builtin("first", "first", HookTrigger::PreMessage, 1),
            Arc::new(Recorder(order.clone(), "first")),
        );
        let ctx = HookContext::new("s1");
        pipeline.fire(HookTrigger::PreMessage, ctx).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn continue_on_error_allows_pipeline_to_proceed() {
        struct AlwaysErrors;
        #[async_trait]
        impl Hook for AlwaysErrors {
            async fn run(&self, _ctx: &HookContext) -> HookResult {
                HookResult {
                    success: false,
                    continue_: false,
                    modified_context: None,
                    error: Some("boom".into()),
                }
            }
        }
        let mut pipeline = HookPipeline::new();
        let mut config = HookConfig::builtin("e", "e", HookTrigger::PreTool, 0);
        config.continue_on_error = true;
        pipeline.register_in_process(config, Arc::new(AlwaysErrors));
        let ctx = HookContext::new("s1");
        let outcome = pipeline.fire(HookTrigger::PreTool, ctx).await;
        assert!(!outcome.vetoed());
    }

    #[tokio::test]
    async fn error_without_continue_on_error_vetoes() {
        struct AlwaysErrors;
        #[async_trait]
        impl Hook for AlwaysErrors {
            async fn run(&self, _ctx: &HookContext) -> HookResult {
                HookResult {
                    success: false,
                    continue_: false,
                    modified_context: None,
                    error: Some("boom".into()),
                }
            }
        }
        let mut pipeline = HookPipeline::new();
        pipeline.register_in_process(
            HookConfig::builtin("e", "e", HookTrigger::PreTool, 0),
            Arc::new(AlwaysErrors),
        );
        let ctx = HookContext::new("s1");
        let outcome = pipeline.fire(HookTrigger::PreTool, ctx).await;
        assert!(outcome.vetoed());
    }

    #[tokio::test]
    async fn pattern_filter_skips_non_matching_hooks() {
        struct Recorder(Arc<std::sync::atomic::AtomicBool>);
        #[async_trait]
        impl Hook for Recorder {
            async fn run(&self, _ctx: &HookContext) -> HookResult {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
                HookResult::ok()
            }
        }
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut pipeline = HookPipeline::new();
        let mut config = HookConfig::builtin("p", "p", HookTrigger::PreTool, 0);
        config.pattern = Some("bash".to_string());
        pipeline.register_in_process(config, Arc::new(Recorder(ran.clone())));
        let ctx = HookContext::new("s1").with_tool("read_file");
        pipeline.fire(HookTrigger::PreTool, ctx).await;
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
