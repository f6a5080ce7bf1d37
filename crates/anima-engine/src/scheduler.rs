//! Per-project wake/sleep scheduler.
//!
//! Runs on the project's worker thread. Decides when the project leaves
//! `sleeping`, performs the `checking` pass over the milestone order, hands
//! ready milestones to the iteration engine, and services control commands
//! (wake, resume, approve, reject, guidance) between runs. Pause and cancel
//! arrive as control flags so they also interrupt an in-flight round.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use anima_git::GitDriver;
use anima_store::ProjectStore;
use anima_types::{AnimaError, EventKind, MilestoneStatus, ProjectStatus};

use crate::clock::Clock;
use crate::controls::{EventSink, ProjectControls};
use crate::engine::{EngineOutcome, EntryPoint, IterationEngine};
use crate::port::AgentLauncher;
use crate::recovery::{self, RecoveryAction};
use crate::schedule;

/// Commands serviced while the worker is between engine runs.
#[derive(Debug, Clone)]
pub enum ProjectCommand {
    /// Check for ready milestones immediately.
    WakeNow,
    /// Resume a paused project, optionally with guidance for the developer.
    Resume { guidance: Option<String> },
    /// Approve an awaiting-review milestone (merge + tag).
    Approve { milestone_id: String },
    /// Reject an awaiting-review milestone back to the developer.
    Reject { milestone_id: String, reason: String },
    /// Queue guidance text for the next developer prompt.
    Guidance { text: String },
}

/// Poll granularity for waits that also watch control flags.
const WAIT_CHUNK: Duration = Duration::from_millis(500);

/// The per-project scheduler loop.
pub struct WakeScheduler {
    project_id: String,
    root: PathBuf,
    controls: Arc<ProjectControls>,
    commands: Receiver<ProjectCommand>,
    events: EventSink,
    launcher: Arc<dyn AgentLauncher>,
    clock: Arc<dyn Clock>,

    // Loop state.
    last_check_completed: Option<DateTime<Utc>>,
    check_now: bool,
    /// Feedback saved from a quota-interrupted round, so resumption rebuilds
    /// the exact same prompt.
    quota_feedback: Option<String>,
    /// Guidance queued while no engine run could receive it.
    pending_guidance: Option<String>,
}

impl WakeScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: &str,
        root: PathBuf,
        controls: Arc<ProjectControls>,
        commands: Receiver<ProjectCommand>,
        events: EventSink,
        launcher: Arc<dyn AgentLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            root,
            controls,
            commands,
            events,
            launcher,
            clock,
            last_check_completed: None,
            check_now: true, // startup check regardless of schedule type
            quota_feedback: None,
            pending_guidance: None,
        }
    }

    /// Run until shutdown. Intended as a worker thread body.
    pub fn run(mut self) {
        let store = ProjectStore::new(&self.root);
        let git = GitDriver::new(&self.root);

        let mut resume_entry: Option<(String, EntryPoint)> = None;
        match recovery::assess(&store, &git, self.clock.as_ref()) {
            Ok(RecoveryAction::CheckNow) => {
                self.check_now = true;
            }
            Ok(RecoveryAction::ResumeAwake {
                milestone_id,
                dirty_worktree,
            }) => {
                self.emit(EventKind::Recovered {
                    milestone_id: milestone_id.clone(),
                    dirty_worktree,
                });
                resume_entry = Some((milestone_id, EntryPoint::Recovered { dirty_worktree }));
            }
            Ok(RecoveryAction::StayPaused { milestone_id }) => {
                info!(project = self.project_id, milestone = milestone_id, "recovered into paused");
            }
            Ok(RecoveryAction::WaitQuota {
                milestone_id,
                reset_at,
            }) => {
                info!(
                    project = self.project_id,
                    milestone = milestone_id,
                    %reset_at,
                    "recovered into rate_limited"
                );
            }
            Err(e) => {
                self.report_error(&e);
            }
        }

        loop {
            if self.controls.shutdown.is_cancelled() {
                break;
            }

            let state = match store.read_project_state() {
                Ok(v) => v.value,
                Err(e) => {
                    self.handle_store_failure(&store, e);
                    if self.controls.shutdown.wait_timeout(WAIT_CHUNK) {
                        break;
                    }
                    continue;
                }
            };

            match state.status {
                ProjectStatus::Sleeping | ProjectStatus::Checking => {
                    if self.check_now {
                        self.check_now = false;
                        self.run_check(&store);
                    } else {
                        self.sleep_until_tick(&store);
                    }
                }
                ProjectStatus::Awake => {
                    // Only reachable on recovery (a normal run returns with a
                    // different persisted status).
                    let (milestone_id, entry) = match resume_entry.take() {
                        Some(pair) => pair,
                        None => match state.current_milestone_id {
                            Some(id) => (id, EntryPoint::Recovered { dirty_worktree: false }),
                            None => {
                                // Invariant repair: awake without a milestone.
                                if let Err(e) = self.set_status(&store, ProjectStatus::Sleeping) {
                                    self.handle_store_failure(&store, e);
                                }
                                self.check_now = true;
                                continue;
                            }
                        },
                    };
                    self.run_engine(&store, &milestone_id, entry);
                }
                ProjectStatus::Paused => {
                    self.wait_while_paused(&store, state.current_milestone_id.as_deref());
                }
                ProjectStatus::RateLimited => {
                    self.wait_for_quota_reset(
                        &store,
                        state.current_milestone_id.as_deref(),
                        state.rate_limit_reset_at,
                    );
                }
            }
        }

        debug!(project = self.project_id, "scheduler stopped");
    }

    // ------------------------------------------------------------------
    // Checking
    // ------------------------------------------------------------------

    /// One `checking` pass: pick the first ready milestone from the order.
    fn run_check(&mut self, store: &ProjectStore) {
        if let Err(e) = self.set_status(store, ProjectStatus::Checking) {
            self.handle_store_failure(store, e);
            return;
        }

        let order = match store.read_order() {
            Ok(v) => v.value,
            Err(e) => {
                self.handle_store_failure(store, e);
                return;
            }
        };

        let mut picked: Option<String> = None;
        for id in &order.milestone_ids {
            match store.read_milestone(id) {
                Ok(v) if v.value.status == MilestoneStatus::Ready => {
                    picked = Some(id.clone());
                    break;
                }
                Ok(v) => {
                    debug!(milestone = id, status = %v.value.status, "order entry not ready, ignored");
                }
                Err(e) => {
                    warn!(milestone = id, error = %e, "order entry unreadable, ignored");
                }
            }
        }

        match picked {
            Some(milestone_id) => {
                info!(project = self.project_id, milestone = milestone_id, "ready milestone picked up");
                self.run_engine(store, &milestone_id, EntryPoint::Fresh);
            }
            None => {
                debug!(project = self.project_id, "no ready milestone");
                if let Err(e) = self.set_status(store, ProjectStatus::Sleeping) {
                    self.handle_store_failure(store, e);
                }
                self.last_check_completed = Some(self.clock.now());
            }
        }
    }

    /// Wait for the next scheduled tick, servicing commands meanwhile.
    fn sleep_until_tick(&mut self, store: &ProjectStore) {
        let config = self.read_config(store);
        let next = schedule::next_wake(
            &config.wake_schedule,
            self.clock.now(),
            self.last_check_completed,
        );

        loop {
            if self.controls.shutdown.is_cancelled() || self.check_now {
                return;
            }
            // Cancel/pause flags are meaningless while sleeping; drop them.
            let _ = self.controls.take_cancel();
            let _ = self.controls.take_pause();
            self.controls.clear_interrupt();

            if let Some(due) = next {
                if self.clock.now() >= due {
                    self.check_now = true;
                    return;
                }
            }

            match self.commands.recv_timeout(WAIT_CHUNK) {
                Ok(cmd) => {
                    if self.handle_idle_command(store, cmd) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.controls.shutdown.cancel();
                    return;
                }
            }
        }
    }

    /// Handle a command while sleeping. Returns `true` when the loop should
    /// re-read state (a check or engine run happened).
    fn handle_idle_command(&mut self, store: &ProjectStore, cmd: ProjectCommand) -> bool {
        match cmd {
            ProjectCommand::WakeNow => {
                self.check_now = true;
                true
            }
            ProjectCommand::Resume { guidance } => {
                // Not paused; treat as a wake with queued guidance.
                if let Some(text) = guidance {
                    self.pending_guidance = Some(text);
                }
                self.check_now = true;
                true
            }
            ProjectCommand::Approve { milestone_id } => {
                let engine = self.make_engine(store);
                match engine.finalize_after_approval(&milestone_id) {
                    Ok(()) => info!(milestone = milestone_id, "review approved, milestone completed"),
                    Err(e) => self.report_error(&e),
                }
                true
            }
            ProjectCommand::Reject { milestone_id, reason } => {
                let engine = self.make_engine(store);
                match engine.reopen_after_review_rejection(&milestone_id) {
                    Ok(()) => {
                        self.run_engine(
                            store,
                            &milestone_id,
                            EntryPoint::HumanReject { reason },
                        );
                    }
                    Err(e) => self.report_error(&e),
                }
                true
            }
            ProjectCommand::Guidance { text } => {
                self.pending_guidance = Some(text);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Paused / rate-limited waits
    // ------------------------------------------------------------------

    fn wait_while_paused(&mut self, store: &ProjectStore, milestone_id: Option<&str>) {
        loop {
            if self.controls.shutdown.is_cancelled() {
                return;
            }
            if self.controls.take_cancel() {
                self.controls.clear_interrupt();
                if let Some(id) = milestone_id {
                    let engine = self.make_engine(store);
                    if let Err(e) = engine.cancel_idle(id) {
                        self.report_error(&e);
                    }
                }
                return;
            }
            let _ = self.controls.take_pause();
            self.controls.clear_interrupt();

            match self.commands.recv_timeout(WAIT_CHUNK) {
                Ok(ProjectCommand::Resume { guidance }) => {
                    let Some(id) = milestone_id else {
                        // Paused without a milestone (configuration error
                        // recovery); resume just means sleep again.
                        if let Err(e) = self.set_status(store, ProjectStatus::Sleeping) {
                            self.handle_store_failure(store, e);
                        }
                        self.check_now = true;
                        return;
                    };
                    let merged = merge_guidance(self.pending_guidance.take(), guidance);
                    self.run_engine(store, id, EntryPoint::Resume { guidance: merged });
                    return;
                }
                Ok(ProjectCommand::Guidance { text }) => {
                    self.pending_guidance = Some(text);
                }
                Ok(ProjectCommand::WakeNow) => {
                    debug!("wake ignored while paused; resume is required");
                }
                Ok(other) => {
                    debug!(?other, "command ignored while paused");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.controls.shutdown.cancel();
                    return;
                }
            }
        }
    }

    fn wait_for_quota_reset(
        &mut self,
        store: &ProjectStore,
        milestone_id: Option<&str>,
        reset_at: Option<DateTime<Utc>>,
    ) {
        let reset_at = reset_at.unwrap_or_else(|| self.clock.now());

        loop {
            if self.controls.shutdown.is_cancelled() {
                return;
            }
            if self.controls.take_cancel() {
                self.controls.clear_interrupt();
                if let Some(id) = milestone_id {
                    let engine = self.make_engine(store);
                    if let Err(e) = engine.cancel_idle(id) {
                        self.report_error(&e);
                    }
                }
                return;
            }
            self.controls.clear_interrupt();

            if self.clock.now() >= reset_at {
                info!(project = self.project_id, "quota window over, resuming");
                if let Some(id) = milestone_id {
                    let feedback = self.quota_feedback.take();
                    self.run_engine(
                        store,
                        id,
                        EntryPoint::QuotaRestored {
                            pending_feedback: feedback,
                        },
                    );
                } else {
                    self.check_now = true;
                }
                return;
            }

            match self.commands.recv_timeout(WAIT_CHUNK) {
                Ok(ProjectCommand::Guidance { text }) => {
                    self.pending_guidance = Some(text);
                }
                Ok(ProjectCommand::WakeNow) => {
                    // Explicit wake short-circuits the back-off.
                    if let Some(id) = milestone_id {
                        let feedback = self.quota_feedback.take();
                        self.run_engine(
                            store,
                            id,
                            EntryPoint::QuotaRestored {
                                pending_feedback: feedback,
                            },
                        );
                    }
                    return;
                }
                Ok(other) => debug!(?other, "command ignored while rate-limited"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.controls.shutdown.cancel();
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Engine invocation
    // ------------------------------------------------------------------

    fn make_engine(&self, store: &ProjectStore) -> IterationEngine {
        IterationEngine::new(
            &self.project_id,
            store.paths().project_root(),
            self.read_config(store),
            Arc::clone(&self.controls),
            Arc::clone(&self.events),
            Arc::clone(&self.launcher),
            Arc::clone(&self.clock),
        )
    }

    fn run_engine(&mut self, store: &ProjectStore, milestone_id: &str, mut entry: EntryPoint) {
        // Queued guidance rides along on whatever entry happens next.
        if let Some(text) = self.pending_guidance.take() {
            entry = match entry {
                EntryPoint::Resume { guidance } => EntryPoint::Resume {
                    guidance: Some(merge_guidance(guidance, Some(text)).unwrap_or_default()),
                },
                EntryPoint::Fresh => EntryPoint::Resume {
                    guidance: Some(text),
                },
                other => {
                    self.pending_guidance = Some(text);
                    other
                }
            };
        }

        let mut engine = self.make_engine(store);
        match engine.run(milestone_id, entry) {
            Ok(EngineOutcome::Completed) => {
                // Completed: sleep, then immediately re-check for more work.
                self.last_check_completed = Some(self.clock.now());
                self.check_now = true;
            }
            Ok(EngineOutcome::AwaitingReview) | Ok(EngineOutcome::Cancelled) => {
                self.last_check_completed = Some(self.clock.now());
            }
            Ok(EngineOutcome::Paused { reason }) => {
                info!(project = self.project_id, milestone = milestone_id, reason, "project paused");
            }
            Ok(EngineOutcome::RateLimited {
                reset_at,
                pending_feedback,
            }) => {
                info!(project = self.project_id, %reset_at, "project rate-limited");
                self.quota_feedback = pending_feedback;
            }
            Ok(EngineOutcome::Failed { reason }) => {
                warn!(project = self.project_id, milestone = milestone_id, reason, "milestone failed");
                self.last_check_completed = Some(self.clock.now());
            }
            Ok(EngineOutcome::Shutdown) => {}
            Err(e) => self.handle_engine_failure(store, milestone_id, e),
        }
    }

    fn handle_engine_failure(&mut self, store: &ProjectStore, milestone_id: &str, error: AnimaError) {
        self.report_error(&error);
        match error.kind() {
            "fatal_engine" => {
                let engine = self.make_engine(store);
                if let Err(e) = engine.fail_milestone(milestone_id, &error.to_string()) {
                    warn!(error = %e, "fail_milestone after fatal engine error also failed");
                }
            }
            _ => {
                // Surface and park the project for a human. When the
                // milestone never started, paused would break the
                // state/milestone invariant, so fall back to sleeping.
                let in_progress = store
                    .read_milestone(milestone_id)
                    .map(|m| m.value.status == MilestoneStatus::InProgress)
                    .unwrap_or(false);
                let target = if in_progress {
                    ProjectStatus::Paused
                } else {
                    ProjectStatus::Sleeping
                };
                if let Err(e) = self.set_status_with_milestone(
                    store,
                    target,
                    in_progress.then(|| milestone_id.to_string()),
                ) {
                    warn!(error = %e, "failed to park project after engine error");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // State plumbing
    // ------------------------------------------------------------------

    fn set_status(&self, store: &ProjectStore, to: ProjectStatus) -> Result<(), AnimaError> {
        self.set_status_with_milestone(store, to, None)
    }

    fn set_status_with_milestone(
        &self,
        store: &ProjectStore,
        to: ProjectStatus,
        milestone_id: Option<String>,
    ) -> Result<(), AnimaError> {
        loop {
            let read = store.read_project_state()?;
            let from = read.value.status;
            if from == to {
                return Ok(());
            }
            let mut state = read.value.clone();
            state.status = to;
            state.current_milestone_id = if to.requires_milestone() {
                milestone_id.clone().or(state.current_milestone_id)
            } else {
                None
            };
            match store.write_project_state(&state, &read.version) {
                Ok(_) => {
                    self.emit(EventKind::StatusChange { from, to });
                    return Ok(());
                }
                Err(AnimaError::StaleWrite(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn read_config(&self, store: &ProjectStore) -> anima_types::ProjectConfig {
        match store.read_config() {
            Ok(config) => config,
            Err(e) => {
                warn!(project = self.project_id, error = %e, "config unreadable, using defaults");
                anima_types::ProjectConfig::default()
            }
        }
    }

    /// Corrupt or unwritable state parks the project with an event.
    fn handle_store_failure(&mut self, store: &ProjectStore, error: AnimaError) {
        self.report_error(&error);
        if matches!(error, AnimaError::CorruptState { .. }) {
            // The corrupt file was quarantined; a default state file parks
            // the project as paused-equivalent sleeping for a human look.
            if let Err(e) = self.set_status(store, ProjectStatus::Sleeping) {
                warn!(error = %e, "could not rewrite state after quarantine");
            }
        }
    }

    fn report_error(&self, error: &AnimaError) {
        let kind = match error.kind() {
            "persistence_io" => anima_types::ErrorKind::PersistenceIo,
            "persistence_stale" => anima_types::ErrorKind::PersistenceStale,
            "corrupt_state" => anima_types::ErrorKind::CorruptState,
            "version_control" => anima_types::ErrorKind::VersionControl,
            "fatal_engine" => anima_types::ErrorKind::FatalEngine,
            _ => anima_types::ErrorKind::TransientAgent,
        };
        self.emit(EventKind::Error {
            error: kind,
            message: error.to_string(),
            detail: None,
        });
    }

    fn emit(&self, kind: EventKind) {
        (self.events)(kind);
    }
}

fn merge_guidance(a: Option<String>, b: Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => Some(format!("{a}\n\n{b}")),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
