// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use openfork_model::Message;
use uuid::Uuid;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list, as
    /// measured by [`openfork_model::Message::approx_tokens`].
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Maximum output tokens the model may generate; subtracted from
    /// `max_tokens` to get the usable input budget.
    pub max_output_tokens: usize,
    /// Token overhead for content sent with every request but not tracked in
    /// `messages`: tool schemas and the dynamic (uncached) context block.
    /// Recomputed by the caller before every model call.
    pub schema_overhead: usize,
    /// Running correction factor applied to the chars/4 token approximation,
    /// derived from actual provider-reported usage on prior turns.
    pub calibration_factor: f32,
    /// Lifetime count of tokens served from the provider's prompt cache.
    pub cache_read_total: u64,
    /// Lifetime count of tokens written into the provider's prompt cache.
    pub cache_write_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// Usable input budget: context window minus the model's maximum output
    /// tokens.  Returns 0 when the context window is unknown, which callers
    /// treat as "skip budget checks".
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Calibrated estimate of tokens actually sent on the next request:
    /// the raw approximation, corrected by `calibration_factor`, plus the
    /// schema/dynamic-context overhead.
    pub fn effective_tokens(&self) -> usize {
        let calibrated = (self.token_count as f32 * self.calibration_factor) as usize;
        calibrated + self.schema_overhead
    }

    /// Fraction of the usable input budget consumed (0.0–1.0), using the
    /// calibrated effective token estimate rather than the raw approximation.
    pub fn context_fraction(&self) -> f32 {
        let budget = self.input_budget();
        if budget == 0 {
            return 0.0;
        }
        (self.effective_tokens() as f32) / (budget as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Fold newly reported cache usage into the lifetime totals.
    pub fn add_cache_usage(&mut self, cache_read: u32, cache_write: u32) {
        self.cache_read_total += cache_read as u64;
        self.cache_write_total += cache_write as u64;
    }

    /// Update `calibration_factor` from a provider's actual reported input
    /// token count versus this session's own estimate for the same request.
    ///
    /// The factor is an exponential moving average (not a plain ratio
    /// overwrite) so one unusual turn cannot swing the estimate wildly: the
    /// weight below favours the running value, which stabilises quickly
    /// because most of a session's requests share a similar shape.
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 {
            return;
        }
        let ratio = actual_input as f32 / estimated as f32;
        // Ignore wildly implausible ratios (e.g. a provider reporting usage
        // for an unrelated request) rather than letting them corrupt the
        // running calibration.
        if !(0.1..=10.0).contains(&ratio) {
            return;
        }
        const SMOOTHING: f32 = 0.2;
        self.calibration_factor =
            self.calibration_factor * (1.0 - SMOOTHING) + ratio * SMOOTHING;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
