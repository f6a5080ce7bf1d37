//! Startup crash recovery.
//!
//! On startup every registered project's persisted state is examined. A
//! project that was mid-milestone when the process died is positioned back
//! on its branch and resumed; a rate-limited project gets its timer
//! re-armed from the persisted absolute reset time; inconsistent state is
//! repaired toward `sleeping` rather than guessed at.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use anima_git::GitDriver;
use anima_store::ProjectStore;
use anima_types::{AnimaError, MilestoneStatus, ProjectStatus};

use crate::clock::Clock;

/// What the scheduler should do after assessing persisted state.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Nothing was interrupted; run the normal startup check.
    CheckNow,
    /// Resume the iteration engine for an interrupted milestone.
    ResumeAwake {
        milestone_id: String,
        dirty_worktree: bool,
    },
    /// The project was paused for a human; stay paused.
    StayPaused { milestone_id: String },
    /// Quota back-off is still in effect; re-arm the timer.
    WaitQuota {
        milestone_id: String,
        reset_at: DateTime<Utc>,
    },
}

/// Assess persisted state and position the working tree for resumption.
pub fn assess(
    store: &ProjectStore,
    git: &GitDriver,
    clock: &dyn Clock,
) -> Result<RecoveryAction, AnimaError> {
    let state = store.read_project_state()?.value;

    if !state.status.requires_milestone() {
        // Sleeping or checking: a check was at most interrupted; re-run it.
        return Ok(RecoveryAction::CheckNow);
    }

    let Some(milestone_id) = state.current_milestone_id.clone() else {
        warn!(
            status = %state.status,
            "state requires a milestone but none is recorded; repairing to sleeping"
        );
        repair_to_sleeping(store)?;
        return Ok(RecoveryAction::CheckNow);
    };

    let milestone = match store.read_milestone(&milestone_id) {
        Ok(v) => v.value,
        Err(e) => {
            warn!(milestone = milestone_id, error = %e, "current milestone unreadable; repairing to sleeping");
            repair_to_sleeping(store)?;
            return Err(e);
        }
    };

    if milestone.status != MilestoneStatus::InProgress {
        warn!(
            milestone = milestone_id,
            status = %milestone.status,
            "current milestone is not in_progress; repairing to sleeping"
        );
        repair_to_sleeping(store)?;
        return Ok(RecoveryAction::CheckNow);
    }

    match state.status {
        ProjectStatus::RateLimited => {
            let reset_at = state.rate_limit_reset_at.unwrap_or_else(|| clock.now());
            if reset_at > clock.now() {
                info!(milestone = milestone_id, %reset_at, "re-arming persisted quota timer");
                Ok(RecoveryAction::WaitQuota {
                    milestone_id,
                    reset_at,
                })
            } else {
                info!(milestone = milestone_id, "persisted quota window already over");
                Ok(RecoveryAction::ResumeAwake {
                    milestone_id,
                    dirty_worktree: position_worktree(git, &milestone.branch_name)?,
                })
            }
        }
        ProjectStatus::Paused => {
            let _ = position_worktree(git, &milestone.branch_name)?;
            Ok(RecoveryAction::StayPaused { milestone_id })
        }
        ProjectStatus::Awake => {
            let dirty_worktree = position_worktree(git, &milestone.branch_name)?;
            info!(
                milestone = milestone_id,
                dirty_worktree, "resuming interrupted milestone"
            );
            Ok(RecoveryAction::ResumeAwake {
                milestone_id,
                dirty_worktree,
            })
        }
        _ => unreachable!("requires_milestone covered awake/paused/rate_limited"),
    }
}

/// Ensure the working tree sits on the milestone branch; report dirtiness
/// (ignoring the `.anima/` state tree).
fn position_worktree(git: &GitDriver, branch: &str) -> Result<bool, AnimaError> {
    if git.current_branch()? != branch {
        git.switch_branch(branch)?;
    }
    Ok(crate::engine::worktree_dirty(&git.status()?))
}

fn repair_to_sleeping(store: &ProjectStore) -> Result<(), AnimaError> {
    loop {
        let read = store.read_project_state()?;
        let mut state = read.value.clone();
        state.status = ProjectStatus::Sleeping;
        state.current_milestone_id = None;
        match store.write_project_state(&state, &read.version) {
            Ok(_) => return Ok(()),
            Err(AnimaError::StaleWrite(_)) => continue,
            Err(e) => return Err(e),
        }
    }
}
