use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, Notify, Semaphore};
use tracing::debug;

use openfork_config::{AgentConfig, AgentMode, Config};
use openfork_tools::{
    events::{TodoItem, ToolEvent},
    policy::ApprovalPolicy,
    tool::{Tool, ToolCall, ToolOutput},
    AskQuestionTool, ApplyPatchTool, DeleteFileTool, EditFileTool,
    GlobFileSearchTool, GrepTool, ListDirTool, ReadFileTool, ReadLintsTool,
    RunTerminalCommandTool, SearchCodebaseTool, SwitchModeTool, TodoWriteTool,
    UpdateMemoryTool, WebFetchTool, WebSearchTool, WriteTool,
    PermissionEngine, ToolRegistry,
};

use crate::agent::Agent;
use crate::event_bus::{Event, EventBus};
use crate::events::AgentEvent;
use crate::hooks::HookPipeline;
use crate::runtime_context::AgentRuntimeContext;

const MAX_DEPTH: usize = 3;
/// Default per-slug concurrency limit; `0` means unlimited.
const DEFAULT_MAX_CONCURRENT_PER_SLUG: usize = 2;

/// A hand-rolled hierarchical cancellation token. Cancelling a parent token
/// cancels every child derived from it via [`CancellationToken::child_token`];
/// cancelling a child never affects its parent.
///
/// (Deliberately not `tokio_util::sync::CancellationToken`: this crate does
/// not otherwise depend on `tokio-util`, and the hierarchy needed here —
/// propagate-down-only, no token reuse after cancel — is small enough to not
/// warrant the extra dependency.)
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A child token that is cancelled whenever `self` is cancelled (and can
    /// also be cancelled independently, without affecting `self`).
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        let parent = self.clone();
        let child_for_task = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child_for_task.cancel();
        });
        child
    }

    /// Resolves once this token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Bridge this token into the paired oneshot channel `Agent::submit_with_cancel`
    /// expects, without changing that API.
    fn into_cancel_receiver(self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            self.cancelled().await;
            let _ = tx.send(());
        });
        rx
    }
}

/// Lifecycle status of a spawned subagent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubSessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One invocation of the `task` tool: a tracked child session with its own
/// narrowed permission ruleset, iteration budget, and cancellation scope.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubSession {
    pub id: String,
    pub parent_session_id: String,
    pub parent_message_id: Option<String>,
    pub agent_slug: String,
    pub status: SubSessionStatus,
    pub prompt: String,
    pub description: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub max_iterations: u32,
    pub iterations_used: u32,
    pub effective_ruleset_name: String,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

pub struct TaskTool {
    model: Arc<dyn openfork_model::ModelProvider>,
    config: Arc<Config>,
    agent_config: Arc<AgentConfig>,
    depth: Arc<AtomicUsize>,
    permission_engine: Arc<PermissionEngine>,
    hooks: Arc<HookPipeline>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
    /// One semaphore per agent slug, created lazily, bounding how many
    /// subagents of that slug may run concurrently (FIFO-fair via
    /// `tokio::sync::Semaphore`'s own queue). `0` permits means unlimited
    /// and is modeled by simply not installing a semaphore for that slug.
    slug_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_concurrent_per_slug: usize,
    sessions: Mutex<Vec<SubSession>>,
}

impl TaskTool {
    pub fn new(
        model: Arc<dyn openfork_model::ModelProvider>,
        config: Arc<Config>,
        agent_config: Arc<AgentConfig>,
        depth: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            model,
            config,
            agent_config,
            depth,
            permission_engine: openfork_tools::permission::default_engine(),
            hooks: Arc::new(HookPipeline::with_builtins()),
            event_bus: EventBus::new(),
            cancel: CancellationToken::new(),
            slug_semaphores: Mutex::new(HashMap::new()),
            max_concurrent_per_slug: DEFAULT_MAX_CONCURRENT_PER_SLUG,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Share the parent agent's permission engine, hooks, and event bus so
    /// subagents inherit (narrowed) permissions and surface events on the
    /// same bus rather than an isolated one.
    pub fn with_parent_context(
        mut self,
        permission_engine: Arc<PermissionEngine>,
        hooks: Arc<HookPipeline>,
        event_bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        self.permission_engine = permission_engine;
        self.hooks = hooks;
        self.event_bus = event_bus;
        self.cancel = cancel;
        self
    }

    pub fn with_max_concurrent_per_slug(mut self, limit: usize) -> Self {
        self.max_concurrent_per_slug = limit;
        self
    }

    /// Snapshot of every subsession this tool instance has tracked.
    pub async fn sessions(&self) -> Vec<SubSession> {
        self.sessions.lock().await.clone()
    }

    /// Cancel every subagent currently running under this tool (cascades to
    /// their own child tokens, if any).
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    async fn semaphore_for(&self, slug: &str) -> Option<Arc<Semaphore>> {
        if self.max_concurrent_per_slug == 0 {
            return None;
        }
        let mut map = self.slug_semaphores.lock().await;
        Some(
            map.entry(slug.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_concurrent_per_slug)))
                .clone(),
        )
    }

    fn build_sub_registry(
        &self,
        mode: AgentMode,
    ) -> (
        ToolRegistry,
        Arc<Mutex<AgentMode>>,
        mpsc::Receiver<ToolEvent>,
    ) {
        let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));
        let mode_lock: Arc<Mutex<AgentMode>> = Arc::new(Mutex::new(mode));
        let (tx, rx) = mpsc::channel::<ToolEvent>(64);

        let mut reg = ToolRegistry::new();
        reg.register(ReadFileTool);
        reg.register(ListDirTool);
        reg.register(GlobFileSearchTool);
        reg.register(GrepTool);
        reg.register(SearchCodebaseTool);
        reg.register(ReadLintsTool);
        reg.register(AskQuestionTool::new());
        reg.register(WebFetchTool);
        reg.register(WebSearchTool {
            api_key: self.config.tools.web.search.api_key.clone(),
        });
        reg.register(UpdateMemoryTool {
            memory_file: self.config.tools.memory.memory_file.clone(),
        });
        reg.register(TodoWriteTool::new(todos, tx.clone()));
        reg.register(SwitchModeTool::new(mode_lock.clone(), tx.clone()));
        reg.register(WriteTool);
        reg.register(EditFileTool);
        reg.register(DeleteFileTool);
        reg.register(ApplyPatchTool);
        reg.register(RunTerminalCommandTool {
            timeout_secs: self.config.tools.timeout_secs,
        });
        // TaskTool is intentionally NOT registered here to limit nesting.
        (reg, mode_lock, rx)
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to complete a focused task and return its final text output. \
         Useful for delegating isolated sub-tasks. The sub-agent has access to all standard \
         tools, under a permission ruleset that can only be as restrictive as or more \
         restrictive than the caller's. Maximum nesting depth is 3."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                },
                "mode": {
                    "type": "string",
                    "enum": ["research", "plan", "agent"],
                    "description": "Operating mode for the sub-agent (default: agent)"
                },
                "max_rounds": {
                    "type": "integer",
                    "description": "Maximum tool-call rounds (default: from config)"
                }
            },
            "required": ["prompt"]
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'prompt'"),
        };
        let mode_str = call.args.get("mode").and_then(|v| v.as_str()).unwrap_or("agent");
        let mode = match mode_str {
            "research" => AgentMode::Research,
            "plan" => AgentMode::Plan,
            "agent" => AgentMode::Agent,
            other => return ToolOutput::err(&call.id, format!("unknown mode: {other}")),
        };
        let slug = mode_str.to_string();

        let current_depth = self.depth.load(Ordering::Relaxed);
        if current_depth >= MAX_DEPTH {
            return ToolOutput::err(
                &call.id,
                format!("maximum sub-agent depth ({MAX_DEPTH}) reached"),
            );
        }

        if self.cancel.is_cancelled() {
            return ToolOutput::err(&call.id, "subagent supervisor already cancelled");
        }

        // FIFO-fair: acquiring a permit queues this call behind any other
        // in-flight subagent of the same slug once the limit is reached.
        let _permit = match self.semaphore_for(&slug).await {
            Some(sem) => match sem.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return ToolOutput::err(&call.id, "subagent semaphore closed"),
            },
            None => None,
        };

        let now_ms = monotonic_ms();
        let sub_session_id = format!("sub-{}-{now_ms}", call.id);
        let mut max_iterations = self.agent_config.max_tool_rounds;
        if let Some(max_rounds) = call.args.get("max_rounds").and_then(|v| v.as_u64()) {
            max_iterations = max_rounds as u32;
        }

        let narrowed_engine = self.permission_engine.spawn_narrowed(&slug).await;
        let mut sub_session = SubSession {
            id: sub_session_id.clone(),
            parent_session_id: String::new(),
            parent_message_id: None,
            agent_slug: slug.clone(),
            status: SubSessionStatus::Pending,
            prompt: prompt.clone(),
            description: None,
            result: None,
            error: None,
            max_iterations,
            iterations_used: 0,
            effective_ruleset_name: narrowed_engine.current_ruleset_name().await,
            created_at_ms: now_ms,
            completed_at_ms: None,
        };

        let _ = self.event_bus.publish(
            "supervisor",
            Event::SubSessionCreated {
                sub_session_id: sub_session_id.clone(),
                slug: slug.clone(),
                parent_id: String::new(),
            },
        );

        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(prompt = %prompt, mode = %mode, depth = current_depth + 1, "task: spawning sub-agent");
        sub_session.status = SubSessionStatus::Running;
        {
            let mut sessions = self.sessions.lock().await;
            sessions.push(sub_session.clone());
        }

        let mut sub_config = (*self.agent_config).clone();
        sub_config.max_tool_rounds = max_iterations;

        let (sub_registry, mode_lock, tool_event_rx) = self.build_sub_registry(mode);
        let tools = Arc::new(sub_registry);

        let mut agent = Agent::new(
            self.model.clone(),
            tools,
            Arc::new(sub_config),
            AgentRuntimeContext::default(),
            mode_lock,
            tool_event_rx,
            128_000,
        )
        .with_permission_engine(Arc::new(narrowed_engine))
        .with_hooks(self.hooks.clone())
        .with_event_bus(self.event_bus.clone());

        let child_token = self.cancel.child_token();
        let cancel_rx = child_token.clone().into_cancel_receiver();

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let submit_result = agent.submit_with_cancel(&prompt, tx, cancel_rx).await;

        let mut output = String::new();
        let mut aborted = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                AgentEvent::TextDelta(delta) => output.push_str(&delta),
                AgentEvent::Aborted { partial_text } => {
                    aborted = true;
                    if !partial_text.is_empty() {
                        output.push_str(&partial_text);
                    }
                }
                _ => {}
            }
        }

        self.depth.fetch_sub(1, Ordering::Relaxed);

        let (status, final_result, final_error) = match (&submit_result, aborted) {
            (Ok(_), true) => (
                SubSessionStatus::Cancelled,
                Some(output.clone()),
                Some("cancelled".to_string()),
            ),
            (Ok(_), false) => (SubSessionStatus::Completed, Some(output.clone()), None),
            (Err(e), _) => (SubSessionStatus::Failed, None, Some(e.to_string())),
        };

        {
            let mut sessions = self.sessions.lock().await;
            if let Some(tracked) = sessions.iter_mut().find(|s| s.id == sub_session_id) {
                tracked.status = status;
                tracked.result = final_result.clone();
                tracked.error = final_error.clone();
                tracked.completed_at_ms = Some(monotonic_ms());
            }
        }

        let _ = self.event_bus.publish(
            "supervisor",
            Event::SubSessionEnded {
                sub_session_id: sub_session_id.clone(),
                status: format!("{status:?}"),
            },
        );

        match status {
            SubSessionStatus::Completed => {
                if output.is_empty() {
                    ToolOutput::ok(&call.id, "(sub-agent produced no text output)")
                } else {
                    ToolOutput::ok(&call.id, output)
                }
            }
            SubSessionStatus::Cancelled => {
                ToolOutput::err(&call.id, "sub-agent cancelled")
            }
            _ => ToolOutput::err(
                &call.id,
                format!(
                    "sub-agent error: {}",
                    final_error.unwrap_or_else(|| "unknown error".to_string())
                ),
            ),
        }
    }
}

fn monotonic_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_token_cancelled_when_parent_cancels() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        assert!(!child.is_cancelled());
        parent.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn child_cancel_does_not_cancel_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn semaphore_limits_same_slug_concurrency() {
        let sem = Arc::new(Semaphore::new(1));
        let first = sem.clone().acquire_owned().await.unwrap();
        assert_eq!(sem.available_permits(), 0);
        drop(first);
        assert_eq!(sem.available_permits(), 1);
    }
}
