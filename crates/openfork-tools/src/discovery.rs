// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared handles for skills, subagents, and knowledge documents discovered
//! from the project's standard search hierarchy (global config dir, then
//! workspace-local `.openfork/`).
//!
//! Discovery itself lives in the CLI binary, which walks the filesystem once
//! at startup and on `/refresh`.  The types here carry the results: a cheap,
//! clonable [`Arc<[T]>`] snapshot behind a lock so the agent loop can pick up
//! a fresh list on every turn without blocking the discovery side, plus the
//! content the `load_skill` / `search_knowledge` tools serve on demand.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Frontmatter metadata parsed from a skill's `SKILL.md` header.
#[derive(Debug, Clone, Default)]
pub struct SkillMeta {
    /// Always include this skill's summary in the system prompt, bypassing
    /// the character budget used for the rest of the skill list.
    pub always: bool,
    /// Only expose this skill as a `/name` slash command; never mention it
    /// to the model in the system prompt's skill list.
    pub user_invocable_only: bool,
}

/// One discovered skill, including its full body for on-demand loading.
#[derive(Debug, Clone)]
pub struct SkillInfo {
    /// Slash-command invocation form, e.g. `review` or `review/security`.
    pub command: String,
    pub name: String,
    pub description: String,
    /// `version:` frontmatter field, if present.
    pub version: Option<String>,
    /// Absolute path to the skill's `SKILL.md` file.
    pub skill_md_path: PathBuf,
    /// Absolute path to the skill's base directory (bundled resources are
    /// resolved relative to this).
    pub skill_dir: PathBuf,
    /// Full body of `SKILL.md`, after the frontmatter fence.
    pub content: String,
    pub openfork_meta: Option<SkillMeta>,
}

/// One discovered subagent definition.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
    /// Model override for this subagent, if it pins one.
    pub model: Option<String>,
    /// Runs without attaching to the interactive session (fire-and-forget).
    pub is_background: bool,
    /// Restricted to read-only tools regardless of the invoking mode.
    pub readonly: bool,
}

/// One discovered knowledge document (a spec for a subsystem of the project).
#[derive(Debug, Clone)]
pub struct KnowledgeInfo {
    pub subsystem: String,
    /// File glob patterns this document is authoritative for.
    pub files: Vec<String>,
    /// `updated:` frontmatter date, used for drift detection against `files`.
    pub updated: Option<String>,
    /// Absolute path to the knowledge document.
    pub path: PathBuf,
    /// Full body, after the frontmatter fence.
    pub body: String,
}

/// A live, refreshable snapshot of discovered items shared between the
/// discovery side (filesystem walk) and the agent loop (prompt building).
#[derive(Debug, Clone)]
pub struct Shared<T> {
    inner: Arc<RwLock<Arc<[T]>>>,
}

impl<T> Default for Shared<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::from(Vec::new()))),
        }
    }
}

impl<T: Clone> Shared<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::from(items))),
        }
    }

    /// An empty snapshot. Equivalent to `Default::default`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Current snapshot.  Cheap: clones the `Arc`, not the items.
    pub fn get(&self) -> Arc<[T]> {
        self.inner.read().unwrap().clone()
    }

    /// Replace the snapshot, e.g. after a `/refresh` re-walks the filesystem.
    pub fn set(&self, items: Vec<T>) {
        *self.inner.write().unwrap() = Arc::from(items);
    }
}

pub type SharedSkills = Shared<SkillInfo>;
pub type SharedAgents = Shared<AgentInfo>;
pub type SharedKnowledge = Shared<KnowledgeInfo>;
