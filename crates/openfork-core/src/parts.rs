// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `MessagePart`: the structural unit a message is made of.
//!
//! This is deliberately separate from [`openfork_model::MessageContent`],
//! which is the provider-facing wire format the agent loop sends to the
//! chat provider. `MessagePart` is the richer, persisted/observable model:
//! the loop tracks a part's lifecycle (pending → running → completed/error
//! for tool parts) and publishes a [`crate::event_bus::Event::PartUpdated`]
//! at each transition, in addition to pushing the corresponding wire
//! message onto the session.
use serde::{Deserialize, Serialize};

/// Dense, stable position of a part within its owning message.
pub type OrderIndex = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Plain,
    Markdown,
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPartStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolPartStatus {
    /// `pending -> running -> (completed | error)`, no regressions.
    pub fn can_transition_to(self, next: ToolPartStatus) -> bool {
        use ToolPartStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Completed)
                | (Pending, Error)
                | (Running, Completed)
                | (Running, Error)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPartError {
    pub message: String,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// The tagged sum of structural content a message can be built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePartKind {
    Text {
        content: String,
        content_type: ContentType,
    },
    Reasoning {
        content: String,
        visible: bool,
    },
    Tool {
        call_id: String,
        tool_name: String,
        title: Option<String>,
        status: ToolPartStatus,
        input: serde_json::Value,
        output: Option<String>,
        pruned: bool,
        started_at_ms: Option<u64>,
        completed_at_ms: Option<u64>,
        error: Option<ToolPartError>,
        attachments: Vec<String>,
        spill_path: Option<String>,
    },
    File {
        path: String,
        name: String,
        content_type: String,
        size: u64,
        inline: bool,
        content: Option<String>,
    },
    Patch {
        file_path: String,
        old: String,
        new: String,
        unified_diff: String,
        additions: u32,
        deletions: u32,
    },
    Step {
        step_number: u32,
        description: String,
        status: StepStatus,
    },
    Subtask {
        sub_session_id: String,
        agent_type: String,
        prompt: String,
        status: SubtaskStatus,
        result: Option<String>,
        error: Option<String>,
    },
    Snapshot {
        label: String,
        description: String,
        state: serde_json::Value,
        git_commit: Option<String>,
    },
    Compaction {
        summary: String,
        compacted_message_count: u32,
        compacted_token_count: u64,
        timestamp_ms: u64,
    },
    Retry {
        attempt: u32,
        reason: String,
    },
    Agent {
        slug: String,
        label: String,
    },
}

/// A part plus its identity/ownership/ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePart {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    pub order_index: OrderIndex,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub kind: MessagePartKind,
}

impl MessagePart {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        order_index: OrderIndex,
        now_ms: u64,
        kind: MessagePartKind,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            message_id: message_id.into(),
            order_index,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            kind,
        }
    }

    /// Attempt to advance a `Tool` part's status, enforcing the
    /// no-regression invariant. Returns `false` (no-op) for any other kind
    /// or an illegal transition.
    pub fn advance_tool_status(&mut self, next: ToolPartStatus, now_ms: u64) -> bool {
        if let MessagePartKind::Tool { status, .. } = &mut self.kind {
            if status.can_transition_to(next) {
                *status = next;
                self.updated_at_ms = now_ms;
                return true;
            }
        }
        false
    }
}

/// Assigns dense, stable order indices to a freshly-built list of parts for
/// one message. Call once when a message's parts are first materialized;
/// later mutations (status transitions) must not renumber.
pub fn assign_order_indices(parts: &mut [MessagePart]) {
    for (i, part) in parts.iter_mut().enumerate() {
        part.order_index = i as OrderIndex;
    }
}
