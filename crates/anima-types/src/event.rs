//! Event types published on the supervisor's event bus.
//!
//! Every observable state change becomes an [`AnimaEvent`]. Subscribers are
//! single-producer-single-consumer sequences; `agent_stream_chunk` events may
//! be dropped under back-pressure, everything else is delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{MilestoneStatus, ProjectStatus};

/// Agent role within an iteration round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Developer,
    Acceptor,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Developer => write!(f, "developer"),
            AgentRole::Acceptor => write!(f, "acceptor"),
        }
    }
}

/// Stable error kind carried on error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientAgent,
    Quota,
    PersistenceStale,
    PersistenceIo,
    VersionControl,
    CorruptState,
    FatalMilestone,
    FatalEngine,
}

/// Quota signal severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaStatus {
    RateLimited,
    QuotaExhausted,
}

/// An event on the supervisor bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimaEvent {
    pub event_id: Uuid,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventKind {
    /// Project status changed.
    StatusChange {
        from: ProjectStatus,
        to: ProjectStatus,
    },
    /// A milestone moved through its lifecycle.
    MilestoneStatusChange {
        milestone_id: String,
        from: MilestoneStatus,
        to: MilestoneStatus,
    },
    /// An iteration round began.
    RoundStarted {
        milestone_id: String,
        round: u32,
        role: AgentRole,
    },
    /// An iteration round finished with a verdict (or timeout).
    RoundFinished {
        milestone_id: String,
        round: u32,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        elapsed_ms: u64,
        tokens: u64,
        cost_usd: f64,
    },
    /// A raw verdict extracted from agent output.
    Verdict {
        milestone_id: String,
        role: AgentRole,
        verdict: String,
    },
    /// A chunk of raw agent output (droppable under back-pressure).
    AgentStreamChunk { role: AgentRole, text: String },
    /// A summarized tool invocation surfaced from agent output.
    ToolUse { role: AgentRole, name: String, brief: String },
    /// A quota or rate-limit signal was detected.
    QuotaEvent {
        status: QuotaStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reset_at: Option<DateTime<Utc>>,
    },
    /// The project recovered state after a restart.
    Recovered {
        milestone_id: String,
        dirty_worktree: bool,
    },
    /// An error surfaced to observers.
    Error {
        error: ErrorKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl AnimaEvent {
    /// Create a new event stamped with the current time.
    pub fn new(project_id: &str, kind: EventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Stream chunks are the only events a slow subscriber may lose.
    pub fn is_droppable(&self) -> bool {
        matches!(self.kind, EventKind::AgentStreamChunk { .. })
    }
}
