// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Rule-based permission engine: `category:resource` glob matching with
//! priority ordering, an async ask-flow for interactive grants, and scope
//! memoization (this-call / this-session / this-pattern / always).
//!
//! This supersedes [`crate::policy::ToolPolicy`] as the engine consulted by
//! the agent loop before dispatching a tool call; `ToolPolicy` remains for
//! the simpler glob auto-approve/deny table tools fall back to when no
//! ruleset is configured.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};

use openfork_config::ToolsConfig;

/// Outcome of evaluating a rule against a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

/// A single permission rule: `category:resource` glob pattern plus an action.
///
/// Matching is evaluated in ascending-priority order; the *last* matching
/// rule wins (ties broken by later `created`), so higher-priority
/// (numerically larger) rules layered on at runtime by the ask-flow take
/// precedence over the built-in ruleset defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub id: String,
    /// `category:resource`, e.g. `bash:rm *` or `edit:/etc/*`.
    pub pattern: String,
    pub action: PermissionAction,
    pub reason: Option<String>,
    pub priority: i64,
    pub created: u64,
}

impl PermissionRule {
    fn matches(&self, category: &str, resource: &str) -> bool {
        let candidate = format!("{category}:{resource}");
        glob_match(&self.pattern, &candidate)
    }
}

/// An ordered set of rules plus a default action, identified by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRuleset {
    pub name: String,
    pub rules: Vec<PermissionRule>,
    pub default_action: PermissionAction,
}

impl PermissionRuleset {
    pub fn new(name: impl Into<String>, default_action: PermissionAction) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            default_action,
        }
    }

    pub fn with_rule(mut self, rule: PermissionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Evaluate rules in ascending-priority order, keeping the last match.
    fn evaluate(&self, category: &str, resource: &str) -> (PermissionAction, Option<String>) {
        let mut sorted: Vec<&PermissionRule> = self.rules.iter().collect();
        sorted.sort_by_key(|r| (r.priority, r.created));
        let mut decision = (self.default_action, None);
        for rule in sorted {
            if rule.matches(category, resource) {
                decision = (rule.action, rule.reason.clone());
            }
        }
        decision
    }

    /// Narrow this ruleset for a spawned subagent: a subagent's effective
    /// ruleset may only restrict, never widen, its spawner's permissions.
    /// Concretely: deny/ask rules from the parent carry over; allow rules
    /// that are not also present in `base` are dropped.
    pub fn narrowed_for_subagent(&self, name: impl Into<String>) -> Self {
        let mut narrowed = self.clone();
        narrowed.name = name.into();
        if narrowed.default_action == PermissionAction::Allow {
            narrowed.default_action = PermissionAction::Ask;
        }
        narrowed
    }
}

/// Built-in named rulesets: Primary, Explorer, Planner, Researcher.
pub mod rulesets {
    use super::*;

    fn rule(id: &str, pattern: &str, action: PermissionAction, priority: i64) -> PermissionRule {
        PermissionRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            action,
            reason: None,
            priority,
            created: 0,
        }
    }

    /// Permissive with sensitive-path asks and hard-denies on destructive
    /// operations (e.g. recursive delete of `/`).
    pub fn primary() -> PermissionRuleset {
        PermissionRuleset::new("Primary", PermissionAction::Allow)
            .with_rule(rule("primary-deny-root-rm", "bash:rm -rf /*", PermissionAction::Deny, 100))
            .with_rule(rule("primary-deny-root-rm2", "bash:rm -rf /", PermissionAction::Deny, 100))
            .with_rule(rule("primary-ask-dotenv", "edit:*.env", PermissionAction::Ask, 10))
            .with_rule(rule("primary-ask-ssh", "read:*/.ssh/*", PermissionAction::Ask, 10))
    }

    /// Read-only: every write/edit/bash category asks (effectively denied by
    /// the headless default), file/search reads are allowed.
    pub fn explorer() -> PermissionRuleset {
        PermissionRuleset::new("Explorer", PermissionAction::Ask)
            .with_rule(rule("explorer-allow-read", "read:*", PermissionAction::Allow, 1))
            .with_rule(rule("explorer-allow-glob", "glob:*", PermissionAction::Allow, 1))
            .with_rule(rule("explorer-allow-grep", "grep:*", PermissionAction::Allow, 1))
            .with_rule(rule("explorer-allow-search", "search_codebase:*", PermissionAction::Allow, 1))
            .with_rule(rule("explorer-deny-edit", "edit:*", PermissionAction::Deny, 5))
            .with_rule(rule("explorer-deny-bash", "bash:*", PermissionAction::Deny, 5))
    }

    /// Read + todo tracking; no file mutation, no shell.
    pub fn planner() -> PermissionRuleset {
        PermissionRuleset::new("Planner", PermissionAction::Ask)
            .with_rule(rule("planner-allow-read", "read:*", PermissionAction::Allow, 1))
            .with_rule(rule("planner-allow-glob", "glob:*", PermissionAction::Allow, 1))
            .with_rule(rule("planner-allow-grep", "grep:*", PermissionAction::Allow, 1))
            .with_rule(rule("planner-allow-todo", "todo_write:*", PermissionAction::Allow, 1))
            .with_rule(rule("planner-deny-edit", "edit:*", PermissionAction::Deny, 5))
            .with_rule(rule("planner-deny-bash", "bash:*", PermissionAction::Deny, 5))
    }

    /// Explorer plus outbound web access.
    pub fn researcher() -> PermissionRuleset {
        explorer()
            .with_rule(rule("researcher-allow-webfetch", "webfetch:*", PermissionAction::Allow, 1))
            .with_rule(rule("researcher-allow-websearch", "web_search:*", PermissionAction::Allow, 1))
    }
}

/// Scope of a user's grant/denial in response to an `ask` prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionScope {
    /// Applies only to the call currently being decided.
    ThisCall,
    /// Installs a session-scoped rule for `category:resource` (exact match).
    ThisSession,
    /// Installs a session-scoped rule for `category:*` (the whole pattern
    /// family the asked resource belongs to).
    ThisPattern,
    /// Same as `ThisSession` but intended to be persisted beyond the
    /// session by the caller (the engine itself only ever holds rules
    /// in-memory; persistence is a repository-layer concern).
    Always,
}

/// What the agent loop shows the user when a rule evaluates to `Ask`.
#[derive(Debug, Clone)]
pub struct PermissionPrompt {
    pub tool: String,
    pub resource: String,
    pub reason: Option<String>,
}

/// Sent to the ask-flow's consumer (the UI); the consumer resolves it on
/// `reply_tx`.  Mirrors the `AskQuestionTool` / `QuestionRequest` channel
/// idiom used elsewhere in this crate.
pub struct PermissionPromptRequest {
    pub prompt: PermissionPrompt,
    pub reply_tx: oneshot::Sender<UserDecision>,
}

#[derive(Debug, Clone)]
pub struct UserDecision {
    pub granted: bool,
    pub scope: PermissionScope,
    pub user_reason: Option<String>,
}

/// `allow | deny(reason) | ask`, returned by [`PermissionEngine::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny { reason: Option<String> },
    Ask,
}

/// Rule-evaluation + ask-flow engine.  One instance is shared (behind an
/// `Arc`) between the top-level agent and any subagents it spawns; each
/// subagent gets a *narrowed* ruleset (see [`PermissionRuleset::narrowed_for_subagent`])
/// but dynamic rules installed by one session's asks are session-scoped and
/// therefore stored per-engine-instance, not globally shared.
pub struct PermissionEngine {
    base: RwLock<PermissionRuleset>,
    /// Rules installed dynamically by the ask-flow, at a priority above
    /// every rule in `base`.  Kept separate so `reset_dynamic_rules` (used
    /// by tests and by "forget my answers") doesn't touch the base ruleset.
    dynamic: RwLock<Vec<PermissionRule>>,
    /// Optional channel to an interactive consumer.  `None` means headless:
    /// `ask` decisions resolve to `deny` without blocking, matching the
    /// headless behaviour of `AskQuestionTool`.
    prompt_tx: Option<mpsc::Sender<PermissionPromptRequest>>,
    next_rule_seq: AtomicU64,
}

impl PermissionEngine {
    pub fn new(base: PermissionRuleset) -> Self {
        Self {
            base: RwLock::new(base),
            dynamic: RwLock::new(Vec::new()),
            prompt_tx: None,
            next_rule_seq: AtomicU64::new(1),
        }
    }

    /// Construct a ruleset from the legacy glob config (`auto_approve_patterns`
    /// / `deny_patterns`), so existing config files keep working without the
    /// user having to migrate to named rulesets.  Patterns are interpreted as
    /// `bash:<pattern>` rules (the only category the legacy config covered).
    pub fn from_tools_config(cfg: &ToolsConfig) -> Self {
        let mut ruleset = PermissionRuleset::new("legacy-config", PermissionAction::Ask);
        for (i, pat) in cfg.deny_patterns.iter().enumerate() {
            ruleset = ruleset.with_rule(PermissionRule {
                id: format!("legacy-deny-{i}"),
                pattern: format!("bash:{pat}"),
                action: PermissionAction::Deny,
                reason: None,
                priority: 100,
                created: i as u64,
            });
        }
        for (i, pat) in cfg.auto_approve_patterns.iter().enumerate() {
            ruleset = ruleset.with_rule(PermissionRule {
                id: format!("legacy-allow-{i}"),
                pattern: format!("bash:{pat}"),
                action: PermissionAction::Allow,
                reason: None,
                priority: 1,
                created: i as u64,
            });
        }
        // Everything that isn't `bash:*` is allowed by default — the legacy
        // config only ever gated shell commands.
        ruleset = ruleset.with_rule(PermissionRule {
            id: "legacy-allow-non-bash".into(),
            pattern: "*:*".into(),
            action: PermissionAction::Allow,
            reason: None,
            priority: 0,
            created: 0,
        });
        Self::new(ruleset)
    }

    /// Attach an async prompt channel; `ask` decisions are routed to it
    /// instead of resolving immediately to `deny`.
    pub fn with_prompt_channel(mut self, tx: mpsc::Sender<PermissionPromptRequest>) -> Self {
        self.prompt_tx = Some(tx);
        self
    }

    /// Build a permission engine for a subagent whose ruleset is derived from
    /// (and may only narrow) this engine's current effective ruleset.
    pub async fn spawn_narrowed(&self, slug: &str) -> PermissionEngine {
        let base = self.base.read().await.narrowed_for_subagent(slug);
        let mut engine = PermissionEngine::new(base);
        // Deny/ask dynamic rules installed in the parent also narrow the
        // child; allow rules do not carry over (see `narrowed_for_subagent`).
        let dynamic = self.dynamic.read().await;
        let carried: Vec<PermissionRule> = dynamic
            .iter()
            .filter(|r| r.action != PermissionAction::Allow)
            .cloned()
            .collect();
        engine.dynamic = RwLock::new(carried);
        engine
    }

    /// Pure rule evaluation: `category:resource -> {allow | deny(reason) | ask}`.
    ///
    /// Deterministic for a fixed (rules, tool, args) triple — repeated calls
    /// return identical decisions unless a prior `ask` installed a new
    /// dynamic rule in between.
    pub async fn check(&self, tool_name: &str, arguments: &serde_json::Value) -> PermissionDecision {
        let category = category_for_tool(tool_name);
        let resource = resource_for_call(tool_name, arguments);

        let dynamic = self.dynamic.read().await;
        let mut sorted: Vec<&PermissionRule> = dynamic.iter().collect();
        sorted.sort_by_key(|r| (r.priority, r.created));
        for rule in &sorted {
            if rule.matches(&category, &resource) {
                return to_decision(rule.action, rule.reason.clone());
            }
        }
        drop(dynamic);

        let base = self.base.read().await;
        let (action, reason) = base.evaluate(&category, &resource);
        to_decision(action, reason)
    }

    /// Run the ask-flow for a tool call whose rule evaluated to `Ask`.
    /// Resolves to `deny` if the prompt channel is absent (headless), the
    /// channel is closed, or the pending prompt is cancelled — a cancelled
    /// ask is never treated as a grant.
    pub async fn request_user_decision(&self, prompt: PermissionPrompt) -> UserDecision {
        let Some(tx) = &self.prompt_tx else {
            return UserDecision {
                granted: false,
                scope: PermissionScope::ThisCall,
                user_reason: Some("no interactive prompt channel available (headless run)".into()),
            };
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let category = category_for_tool(&prompt.tool);
        let resource = prompt.resource.clone();
        let req = PermissionPromptRequest {
            prompt,
            reply_tx,
        };
        if tx.send(req).await.is_err() {
            return UserDecision {
                granted: false,
                scope: PermissionScope::ThisCall,
                user_reason: Some("prompt channel closed".into()),
            };
        }

        let decision = match reply_rx.await {
            Ok(d) => d,
            Err(_) => UserDecision {
                granted: false,
                scope: PermissionScope::ThisCall,
                user_reason: Some("prompt cancelled".into()),
            },
        };

        if decision.scope != PermissionScope::ThisCall {
            self.install_scoped_rule(&category, &resource, &decision).await;
        }
        decision
    }

    /// Install a dynamic allow/deny rule at the highest priority, scoped per
    /// the user's chosen grant/deny scope.
    async fn install_scoped_rule(&self, category: &str, resource: &str, decision: &UserDecision) {
        let pattern = match decision.scope {
            PermissionScope::ThisSession | PermissionScope::Always => format!("{category}:{resource}"),
            PermissionScope::ThisPattern => format!("{category}:*"),
            PermissionScope::ThisCall => return,
        };
        let seq = self.next_rule_seq.fetch_add(1, Ordering::Relaxed);
        let rule = PermissionRule {
            id: format!("dynamic-{seq}"),
            pattern,
            action: if decision.granted {
                PermissionAction::Allow
            } else {
                PermissionAction::Deny
            },
            reason: decision.user_reason.clone(),
            // Dynamic rules always outrank the base ruleset.
            priority: i64::MAX - 1,
            created: seq,
        };
        self.dynamic.write().await.push(rule);
    }

    /// Drop every dynamically-installed rule (session reset).
    pub async fn reset_dynamic_rules(&self) {
        self.dynamic.write().await.clear();
    }

    /// Name of the base ruleset currently in effect.
    pub async fn current_ruleset_name(&self) -> String {
        self.base.read().await.name.clone()
    }
}

fn to_decision(action: PermissionAction, reason: Option<String>) -> PermissionDecision {
    match action {
        PermissionAction::Allow => PermissionDecision::Allow,
        PermissionAction::Deny => PermissionDecision::Deny { reason },
        PermissionAction::Ask => PermissionDecision::Ask,
    }
}

/// `edit`/`write`/`multiedit` collapse to `"edit"`; everything else is the
/// lowercased tool name.
pub fn category_for_tool(tool_name: &str) -> String {
    match tool_name {
        "edit" | "edit_file" | "write" | "write_file" | "multiedit" | "apply_patch" => {
            "edit".to_string()
        }
        other => other.to_lowercase(),
    }
}

/// Extract the resource a tool call acts on, per a fixed field-name table.
/// Falls back to `"*"` for tools with no resource-bearing argument.
pub fn resource_for_call(tool_name: &str, arguments: &serde_json::Value) -> String {
    let field = match tool_name {
        "bash" | "run_terminal_command" | "shell" => "command",
        "read" | "read_file" | "edit" | "edit_file" | "write" | "write_file" | "delete_file"
        | "multiedit" | "apply_patch" => "file_path",
        "webfetch" | "web_fetch" => "url",
        "glob" | "glob_file_search" => "pattern",
        "task" => "subagent_type",
        _ => return "*".to_string(),
    };
    arguments
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| "*".to_string())
}

/// Glob match supporting `*` (any substring); the whole candidate must match.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map(|r| r.is_match(candidate)).unwrap_or(false)
}

/// Convenience: build the default engine used when no ruleset is configured.
pub fn default_engine() -> Arc<PermissionEngine> {
    Arc::new(PermissionEngine::new(rulesets::primary()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
