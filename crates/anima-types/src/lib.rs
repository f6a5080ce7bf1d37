//! Core types shared across all Anima crates.
//!
//! Defines the on-disk data model (project state, milestones, inbox items,
//! wake schedules), the event types published on the supervisor bus, the
//! `.anima/` directory layout, and the error type used by every subsystem.

pub mod error;
pub mod event;
pub mod model;
pub mod paths;
pub mod registry;

pub use error::AnimaError;
pub use event::{AgentRole, AnimaEvent, ErrorKind, EventKind, QuotaStatus};
pub use model::{
    branch_for, parse_hhmm, tag_for, InboxItem, InboxKind, InboxSource, InboxStatus, Milestone,
    MilestoneOrder, MilestoneStatus, Priority, ProjectConfig, ProjectState, ProjectStatus,
    RoundPhase, WakeSchedule, MILESTONE_BRANCH_PREFIX, MILESTONE_TAG_PREFIX,
};
pub use paths::AnimaPaths;
pub use registry::{AppConfig, ProjectRegistration};
