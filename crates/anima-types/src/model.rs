//! On-disk data model for a managed project.
//!
//! Everything inside a project's `.anima/` directory is described here:
//! the project state file, per-milestone records, inbox items, the milestone
//! order list, and the project configuration with its wake schedule.
//!
//! All records carry an optional `schema_version` (absence = latest) and
//! preserve unknown fields across read-modify-write cycles via a flattened
//! extras map, so newer tools can add fields without the core dropping them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AnimaError;

/// Branch name prefix for milestone branches (`milestone/{id}`).
pub const MILESTONE_BRANCH_PREFIX: &str = "milestone/";

/// Tag name prefix applied on milestone completion (`milestone-{id}`).
pub const MILESTONE_TAG_PREFIX: &str = "milestone-";

/// Lifecycle status of a managed project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Waiting for the next scheduled wake-up.
    Sleeping,
    /// Evaluating whether a ready milestone exists.
    Checking,
    /// An iteration engine is driving a milestone.
    Awake,
    /// Waiting for human input (rejection threshold, review, or error).
    Paused,
    /// Suspended until the provider quota window resets.
    RateLimited,
}

impl ProjectStatus {
    /// Whether this status requires a current milestone to be set.
    pub fn requires_milestone(self) -> bool {
        matches!(
            self,
            ProjectStatus::Awake | ProjectStatus::Paused | ProjectStatus::RateLimited
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectStatus::Sleeping => write!(f, "sleeping"),
            ProjectStatus::Checking => write!(f, "checking"),
            ProjectStatus::Awake => write!(f, "awake"),
            ProjectStatus::Paused => write!(f, "paused"),
            ProjectStatus::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// Persistent per-project state (`.anima/state.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    /// Schema version; absent means latest known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    /// Current lifecycle status.
    pub status: ProjectStatus,
    /// The milestone being worked on. Non-empty iff status is awake,
    /// paused, or rate_limited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_milestone_id: Option<String>,
    /// Absolute time at which the quota window resets. Persisted so a
    /// restart respects the back-off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
    /// Cumulative tokens consumed across all iterations. Monotonic.
    #[serde(default)]
    pub tokens_used: u64,
    /// Cumulative agent cost in USD. Monotonic.
    #[serde(default)]
    pub cost_usd: f64,
    /// First time this project ever left `sleeping`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_activated_at: Option<DateTime<Utc>>,
    /// Last time the project did any work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
    /// Unknown fields, preserved on write.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ProjectState {
    fn default() -> Self {
        Self {
            schema_version: None,
            status: ProjectStatus::Sleeping,
            current_milestone_id: None,
            rate_limit_reset_at: None,
            tokens_used: 0,
            cost_usd: 0.0,
            first_activated_at: None,
            last_active_at: None,
            extra: BTreeMap::new(),
        }
    }
}

impl ProjectState {
    /// Check the status/milestone invariant: a milestone id must be present
    /// exactly when the status requires one.
    pub fn check_invariant(&self) -> Result<(), AnimaError> {
        let has_milestone = self
            .current_milestone_id
            .as_deref()
            .is_some_and(|id| !id.is_empty());
        if self.status.requires_milestone() != has_milestone {
            return Err(AnimaError::EngineError(format!(
                "status {} with currentMilestoneId {:?}",
                self.status, self.current_milestone_id
            )));
        }
        Ok(())
    }

    /// Record activity: bumps `last_active_at` and sets `first_activated_at`
    /// on the first call.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if self.first_activated_at.is_none() {
            self.first_activated_at = Some(now);
        }
        self.last_active_at = Some(now);
    }

    /// Add token/cost telemetry to the cumulative counters.
    pub fn add_usage(&mut self, tokens: u64, cost_usd: f64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        self.cost_usd += cost_usd;
    }
}

/// When a project wakes up to look for ready milestones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WakeSchedule {
    /// Wake every N minutes, measured from the completion of the last check.
    Interval { interval_minutes: u32 },
    /// Wake at fixed wall-clock times ("HH:MM", local day re-derived per tick).
    Times { times: Vec<String> },
    /// Only external control signals or quota-resume timers wake the project.
    Manual,
}

impl Default for WakeSchedule {
    fn default() -> Self {
        WakeSchedule::Interval {
            interval_minutes: 30,
        }
    }
}

impl WakeSchedule {
    /// Validate the schedule parameters.
    pub fn validate(&self) -> Result<(), AnimaError> {
        match self {
            WakeSchedule::Interval { interval_minutes } => {
                if *interval_minutes == 0 {
                    return Err(AnimaError::ConfigError(
                        "wakeSchedule.intervalMinutes must be > 0".into(),
                    ));
                }
            }
            WakeSchedule::Times { times } => {
                if times.is_empty() {
                    return Err(AnimaError::ConfigError(
                        "wakeSchedule.times must not be empty".into(),
                    ));
                }
                for t in times {
                    parse_hhmm(t)?;
                }
            }
            WakeSchedule::Manual => {}
        }
        Ok(())
    }
}

/// Parse an "HH:MM" wall-clock time into (hour, minute).
pub fn parse_hhmm(s: &str) -> Result<(u8, u8), AnimaError> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| AnimaError::ConfigError(format!("invalid time {s:?}: expected HH:MM")))?;
    let hour: u8 = h
        .parse()
        .map_err(|_| AnimaError::ConfigError(format!("invalid hour in {s:?}")))?;
    let minute: u8 = m
        .parse()
        .map_err(|_| AnimaError::ConfigError(format!("invalid minute in {s:?}")))?;
    if hour >= 24 {
        return Err(AnimaError::ConfigError(format!("hour must be 0-23 in {s:?}")));
    }
    if minute >= 60 {
        return Err(AnimaError::ConfigError(format!("minute must be 0-59 in {s:?}")));
    }
    Ok((hour, minute))
}

fn default_agent_timeout_ms() -> u64 {
    600_000
}

fn default_max_iterations() -> u32 {
    50
}

/// Per-project configuration (`.anima/config.json`). Read-only to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Display name of the project.
    #[serde(default)]
    pub name: String,
    /// When the project wakes up.
    #[serde(default)]
    pub wake_schedule: WakeSchedule,
    /// Whether new milestones default to requiring human review.
    #[serde(default)]
    pub default_requires_human_review: bool,
    /// Per-round deadline for an agent verdict, in milliseconds.
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    /// Accepted-round budget per milestone before pausing for a human.
    #[serde(default = "default_max_iterations")]
    pub max_iterations_per_milestone: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            wake_schedule: WakeSchedule::default(),
            default_requires_human_review: false,
            agent_timeout_ms: default_agent_timeout_ms(),
            max_iterations_per_milestone: default_max_iterations(),
            extra: BTreeMap::new(),
        }
    }
}

impl ProjectConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), AnimaError> {
        self.wake_schedule.validate()
    }
}

/// Kind of work an inbox item describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxKind {
    Bug,
    Feature,
    Optimization,
}

/// Priority of an inbox item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Where an inbox item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxSource {
    Manual,
    Github,
}

/// Lifecycle status of an inbox item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Pending,
    Included,
    Dismissed,
}

/// A unit of requested work dropped into the project inbox
/// (`.anima/inbox/{id}.json`). Created by external tools; the core only
/// transitions its status when milestones are assembled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: InboxKind,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    pub source: InboxSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    pub status: InboxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_in_milestone: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl InboxItem {
    /// Mark this item as included in a milestone. Only valid from `pending`.
    pub fn include_in(&mut self, milestone_id: &str) -> Result<(), AnimaError> {
        if self.status != InboxStatus::Pending {
            return Err(AnimaError::EngineError(format!(
                "inbox item {} cannot move from {:?} to included",
                self.id, self.status
            )));
        }
        self.status = InboxStatus::Included;
        self.included_in_milestone = Some(milestone_id.to_string());
        Ok(())
    }

    /// Dismiss this item. Only valid from `pending`.
    pub fn dismiss(&mut self) -> Result<(), AnimaError> {
        if self.status != InboxStatus::Pending {
            return Err(AnimaError::EngineError(format!(
                "inbox item {} cannot move from {:?} to dismissed",
                self.id, self.status
            )));
        }
        self.status = InboxStatus::Dismissed;
        Ok(())
    }
}

/// Lifecycle status of a milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Draft,
    Ready,
    InProgress,
    AwaitingReview,
    Completed,
    Cancelled,
    Failed,
}

impl MilestoneStatus {
    /// Completed, cancelled, and failed milestones never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MilestoneStatus::Completed | MilestoneStatus::Cancelled | MilestoneStatus::Failed
        )
    }

    /// Only draft and ready milestones may be deleted outright; everything
    /// else must go through cancel (which triggers rollback).
    pub fn is_deletable(self) -> bool {
        matches!(self, MilestoneStatus::Draft | MilestoneStatus::Ready)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: MilestoneStatus) -> bool {
        use MilestoneStatus::*;
        matches!(
            (self, next),
            (Draft, Ready)
                | (Ready, Draft)
                | (Ready, InProgress)
                | (InProgress, AwaitingReview)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (InProgress, Failed)
                | (AwaitingReview, Completed)
                | (AwaitingReview, InProgress)
                | (AwaitingReview, Cancelled)
        )
    }
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MilestoneStatus::Draft => "draft",
            MilestoneStatus::Ready => "ready",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::AwaitingReview => "awaiting_review",
            MilestoneStatus::Completed => "completed",
            MilestoneStatus::Cancelled => "cancelled",
            MilestoneStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Where the iteration engine was within a round. Persisted on the milestone
/// record so crash recovery can re-enter the loop at the right point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RoundPhase {
    /// Waiting on the developer to implement the next feature.
    Developer,
    /// Waiting on the acceptor to review a specific commit.
    Acceptor { commit: String },
    /// Waiting on the acceptor's final whole-milestone review.
    FinalReview,
}

/// A milestone record (`.anima/milestones/{id}.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    pub id: String,
    pub title: String,
    /// Path (relative to `.anima/milestones/`) of the milestone document.
    pub doc_path: String,
    #[serde(default)]
    pub requires_human_review: bool,
    pub status: MilestoneStatus,
    pub branch_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub consecutive_rejections: u32,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Mid-round position for crash recovery; absent when idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<RoundPhase>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Milestone {
    /// Create a fresh draft milestone.
    pub fn new_draft(id: &str, title: &str, requires_human_review: bool, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: None,
            id: id.to_string(),
            title: title.to_string(),
            doc_path: format!("{id}.md"),
            requires_human_review,
            status: MilestoneStatus::Draft,
            branch_name: branch_for(id),
            base_commit: None,
            iteration_count: 0,
            consecutive_rejections: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            round: None,
            extra: BTreeMap::new(),
        }
    }

    /// Transition to a new status, enforcing the lifecycle graph.
    pub fn transition_to(&mut self, next: MilestoneStatus) -> Result<(), AnimaError> {
        if !self.status.can_transition_to(next) {
            return Err(AnimaError::EngineError(format!(
                "milestone {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Add token/cost telemetry to this milestone's counters.
    pub fn add_usage(&mut self, tokens: u64, cost_usd: f64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        self.cost_usd += cost_usd;
    }
}

/// Branch name for a milestone id.
pub fn branch_for(milestone_id: &str) -> String {
    format!("{MILESTONE_BRANCH_PREFIX}{milestone_id}")
}

/// Tag name applied when a milestone completes.
pub fn tag_for(milestone_id: &str) -> String {
    format!("{MILESTONE_TAG_PREFIX}{milestone_id}")
}

/// Ordered list of ready milestone ids (`.anima/milestones/order.json`).
/// Ids of milestones that are not `ready` at read time are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneOrder {
    #[serde(default)]
    pub milestone_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_state_default_is_sleeping() {
        let state = ProjectState::default();
        assert_eq!(state.status, ProjectStatus::Sleeping);
        assert!(state.current_milestone_id.is_none());
        assert!(state.check_invariant().is_ok());
    }

    #[test]
    fn invariant_rejects_awake_without_milestone() {
        let state = ProjectState {
            status: ProjectStatus::Awake,
            ..Default::default()
        };
        assert!(state.check_invariant().is_err());
    }

    #[test]
    fn invariant_rejects_sleeping_with_milestone() {
        let state = ProjectState {
            current_milestone_id: Some("m1".into()),
            ..Default::default()
        };
        assert!(state.check_invariant().is_err());
    }

    #[test]
    fn invariant_accepts_rate_limited_with_milestone() {
        let state = ProjectState {
            status: ProjectStatus::RateLimited,
            current_milestone_id: Some("m1".into()),
            ..Default::default()
        };
        assert!(state.check_invariant().is_ok());
    }

    #[test]
    fn touch_sets_first_activation_once() {
        let mut state = ProjectState::default();
        let t1 = Utc::now();
        state.touch(t1);
        assert_eq!(state.first_activated_at, Some(t1));

        let t2 = t1 + chrono::Duration::seconds(60);
        state.touch(t2);
        assert_eq!(state.first_activated_at, Some(t1));
        assert_eq!(state.last_active_at, Some(t2));
    }

    #[test]
    fn state_json_roundtrip_preserves_unknown_fields() {
        let json = r#"{
            "status": "sleeping",
            "tokensUsed": 12,
            "costUsd": 0.5,
            "futureField": {"nested": true}
        }"#;
        let state: ProjectState = serde_json::from_str(json).unwrap();
        assert_eq!(state.tokens_used, 12);
        assert!(state.extra.contains_key("futureField"));

        let out = serde_json::to_string(&state).unwrap();
        assert!(out.contains("futureField"));
    }

    #[test]
    fn wake_schedule_validation() {
        assert!(WakeSchedule::Interval { interval_minutes: 0 }.validate().is_err());
        assert!(WakeSchedule::Interval { interval_minutes: 5 }.validate().is_ok());
        assert!(WakeSchedule::Times { times: vec![] }.validate().is_err());
        assert!(WakeSchedule::Times {
            times: vec!["09:30".into(), "18:00".into()]
        }
        .validate()
        .is_ok());
        assert!(WakeSchedule::Times {
            times: vec!["25:00".into()]
        }
        .validate()
        .is_err());
        assert!(WakeSchedule::Manual.validate().is_ok());
    }

    #[test]
    fn parse_hhmm_rejects_garbage() {
        assert!(parse_hhmm("12:60").is_err());
        assert!(parse_hhmm("noon").is_err());
        assert!(parse_hhmm("7").is_err());
        assert_eq!(parse_hhmm("07:05").unwrap(), (7, 5));
    }

    #[test]
    fn empty_config_parses_with_defaults() {
        let config: ProjectConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.agent_timeout_ms, 600_000);
        assert_eq!(config.max_iterations_per_milestone, 50);
        assert!(!config.default_requires_human_review);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inbox_transitions() {
        let mut item = InboxItem {
            id: "i1".into(),
            kind: InboxKind::Bug,
            title: "crash on empty input".into(),
            description: String::new(),
            priority: Priority::High,
            source: InboxSource::Manual,
            source_ref: None,
            status: InboxStatus::Pending,
            included_in_milestone: None,
            created_at: Utc::now(),
            extra: BTreeMap::new(),
        };

        item.include_in("m1").unwrap();
        assert_eq!(item.status, InboxStatus::Included);
        assert_eq!(item.included_in_milestone.as_deref(), Some("m1"));

        // Included items can be neither re-included nor dismissed.
        assert!(item.include_in("m2").is_err());
        assert!(item.dismiss().is_err());
    }

    #[test]
    fn inbox_dismiss_from_pending() {
        let mut item = InboxItem {
            id: "i2".into(),
            kind: InboxKind::Feature,
            title: "dark mode".into(),
            description: String::new(),
            priority: Priority::Low,
            source: InboxSource::Github,
            source_ref: Some("#42".into()),
            status: InboxStatus::Pending,
            included_in_milestone: None,
            created_at: Utc::now(),
            extra: BTreeMap::new(),
        };
        item.dismiss().unwrap();
        assert_eq!(item.status, InboxStatus::Dismissed);
        assert!(item.included_in_milestone.is_none());
    }

    #[test]
    fn milestone_lifecycle_graph() {
        use MilestoneStatus::*;
        assert!(Draft.can_transition_to(Ready));
        assert!(Ready.can_transition_to(InProgress));
        assert!(Ready.can_transition_to(Draft)); // demote
        assert!(InProgress.can_transition_to(AwaitingReview));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Failed));
        assert!(AwaitingReview.can_transition_to(Completed));
        assert!(AwaitingReview.can_transition_to(InProgress)); // human reject

        assert!(!Draft.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Cancelled.can_transition_to(InProgress));
    }

    #[test]
    fn terminal_and_deletable() {
        assert!(MilestoneStatus::Completed.is_terminal());
        assert!(MilestoneStatus::Cancelled.is_terminal());
        assert!(MilestoneStatus::Failed.is_terminal());
        assert!(!MilestoneStatus::InProgress.is_terminal());

        assert!(MilestoneStatus::Draft.is_deletable());
        assert!(MilestoneStatus::Ready.is_deletable());
        assert!(!MilestoneStatus::InProgress.is_deletable());
        assert!(!MilestoneStatus::AwaitingReview.is_deletable());
    }

    #[test]
    fn new_draft_has_branch_name() {
        let m = Milestone::new_draft("m-auth", "Auth flow", true, Utc::now());
        assert_eq!(m.branch_name, "milestone/m-auth");
        assert_eq!(m.status, MilestoneStatus::Draft);
        assert!(m.requires_human_review);
        assert_eq!(m.doc_path, "m-auth.md");
    }

    #[test]
    fn transition_to_enforces_graph() {
        let mut m = Milestone::new_draft("m1", "t", false, Utc::now());
        assert!(m.transition_to(MilestoneStatus::InProgress).is_err());
        m.transition_to(MilestoneStatus::Ready).unwrap();
        m.transition_to(MilestoneStatus::InProgress).unwrap();
        m.transition_to(MilestoneStatus::Completed).unwrap();
        assert!(m.transition_to(MilestoneStatus::InProgress).is_err());
    }

    #[test]
    fn milestone_roundtrip_with_phase() {
        let mut m = Milestone::new_draft("m1", "t", false, Utc::now());
        m.round = Some(RoundPhase::Acceptor {
            commit: "abc123".into(),
        });
        let json = serde_json::to_string_pretty(&m).unwrap();
        let back: Milestone = serde_json::from_str(&json).unwrap();
        assert_eq!(back.round, m.round);
        assert_eq!(back.branch_name, m.branch_name);
    }

    #[test]
    fn tag_and_branch_names() {
        assert_eq!(branch_for("m1"), "milestone/m1");
        assert_eq!(tag_for("m1"), "milestone-m1");
    }

    #[test]
    fn order_default_is_empty() {
        let order = MilestoneOrder::default();
        assert!(order.milestone_ids.is_empty());
        let parsed: MilestoneOrder = serde_json::from_str("{}").unwrap();
        assert!(parsed.milestone_ids.is_empty());
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }
}
