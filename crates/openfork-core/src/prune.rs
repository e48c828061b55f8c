// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token Manager L2: cross-message pruning of old tool outputs, invoked
//! ahead of L3 compaction whenever the session crosses a soft token
//! threshold independent of the compaction threshold.
use openfork_model::{Message, MessageContent, Role, ToolResultContent};

/// Estimated-token soft threshold that triggers a pruning pass.
pub const DEFAULT_SOFT_THRESHOLD_TOKENS: u64 = 40_000;
/// How many of the most recent tool-result messages are always kept intact.
pub const DEFAULT_RETAIN_RECENT: usize = 4;
/// How many leading characters of a pruned tool output survive as a preview.
pub const PRUNE_OUTPUT_RETAIN_CHARS: usize = 200;
/// Stop pruning once this many estimated tokens have been reclaimed.
pub const PRUNE_MINIMUM_TOKENS: u64 = 2_000;

/// Outcome of a pruning pass.
#[derive(Debug, Clone, Default)]
pub struct PruneOutcome {
    pub pruned_count: usize,
    pub reclaimed_tokens: u64,
}

impl PruneOutcome {
    pub fn did_prune(&self) -> bool {
        self.pruned_count > 0
    }
}

/// Prune completed tool-result messages older than the most recent `retain_recent`
/// ones, replacing their content with a short head plus a spill-style pointer.
/// Never touches user/assistant text, the current (last) message, or a tool
/// result already pruned. Stops once `PRUNE_MINIMUM_TOKENS` has been
/// reclaimed or no eligible message remains.
pub fn prune_old_tool_outputs(messages: &mut [Message], retain_recent: usize) -> PruneOutcome {
    let last_index = messages.len().saturating_sub(1);

    // Indices of tool-result messages, oldest first, excluding the most
    // recent `retain_recent` and the very last message in the session.
    let tool_indices: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(i, m)| *i != last_index && matches!(m.content, MessageContent::ToolResult { .. }))
        .map(|(i, _)| i)
        .collect();

    let eligible_count = tool_indices.len().saturating_sub(retain_recent);
    let eligible = &tool_indices[..eligible_count];

    let mut outcome = PruneOutcome::default();
    for &idx in eligible {
        if outcome.reclaimed_tokens >= PRUNE_MINIMUM_TOKENS {
            break;
        }
        let message = &mut messages[idx];
        let MessageContent::ToolResult { tool_call_id, content } = &message.content else {
            continue;
        };
        let original_text = content.as_text().map(str::to_string).unwrap_or_default();
        if already_pruned(&original_text) {
            continue;
        }
        let before_tokens = estimate_tokens(&original_text);
        let head: String = original_text.chars().take(PRUNE_OUTPUT_RETAIN_CHARS).collect();
        let pointer = format!("{head}\n[pruned: spill=in-memory, original_len={}]", original_text.len());
        let after_tokens = estimate_tokens(&pointer);

        *message = Message {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: tool_call_id.clone(),
                content: ToolResultContent::Text(pointer),
            },
        };

        outcome.pruned_count += 1;
        outcome.reclaimed_tokens += before_tokens.saturating_sub(after_tokens) as u64;
    }

    outcome
}

fn already_pruned(text: &str) -> bool {
    text.contains("[pruned: spill=")
}

/// 4 chars/token heuristic, consistent with the rest of the token manager.
fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}
