//! The Developer/Acceptor iteration engine.
//!
//! Drives one milestone from `in_progress` to a terminal status through an
//! alternating loop: the Developer implements and commits one feature, the
//! Acceptor reviews the commit against the acceptance criteria. Three
//! consecutive rejections pause the project for a human; a quota signal
//! suspends it until the provider window resets; `ALL_FEATURES_COMPLETE`
//! triggers a final whole-milestone review and, when it passes,
//! version-control finalization (merge + tag) or hand-off to human review.
//!
//! Every state transition is persisted through the store's milestone-then-
//! state pair protocol, so observers never see a forbidden combination.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use anima_agent::{RoundOutcome, RoundTerminal, StreamItem, Verdict};
use anima_git::{GitDriver, MergeStrategy};
use anima_store::{IterationRecord, ProjectLog, ProjectStore};
use anima_types::{
    tag_for, AgentRole, AnimaError, EventKind, Milestone, MilestoneStatus, ProjectState,
    ProjectStatus, QuotaStatus, RoundPhase,
};

use crate::clock::Clock;
use crate::controls::{EventSink, ProjectControls};
use crate::port::{AgentLauncher, AgentPort};
use crate::prompts::{self, DeveloperContext, RecoveryContext};

/// Rejections in a row before the project pauses for a human.
pub const REJECTION_THRESHOLD: u32 = 3;

/// Default quota back-off when no reset time could be extracted.
const DEFAULT_BACKOFF_MINUTES: i64 = 60;

/// How the engine is (re-)entered for a milestone.
#[derive(Debug, Clone)]
pub enum EntryPoint {
    /// Scheduler picked up a ready milestone.
    Fresh,
    /// Human resumed a paused project, optionally with guidance.
    Resume { guidance: Option<String> },
    /// Quota back-off expired; re-enter with the interrupted round's
    /// feedback so the same prompt is rebuilt.
    QuotaRestored { pending_feedback: Option<String> },
    /// Startup crash recovery.
    Recovered { dirty_worktree: bool },
    /// Human rejected an awaiting-review milestone with a reason.
    HumanReject { reason: String },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    Completed,
    AwaitingReview,
    Paused { reason: String },
    RateLimited {
        reset_at: DateTime<Utc>,
        pending_feedback: Option<String>,
    },
    Cancelled,
    Failed { reason: String },
    /// Process shutdown interrupted the run; state stays resumable.
    Shutdown,
}

enum Phase {
    Developer,
    Acceptor { commit: String },
    Final,
}

/// The per-milestone iteration engine.
pub struct IterationEngine {
    project_id: String,
    store: ProjectStore,
    git: GitDriver,
    config: anima_types::ProjectConfig,
    controls: Arc<ProjectControls>,
    events: EventSink,
    launcher: Arc<dyn AgentLauncher>,
    clock: Arc<dyn Clock>,
    log: ProjectLog,
}

impl IterationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: &str,
        project_root: &std::path::Path,
        config: anima_types::ProjectConfig,
        controls: Arc<ProjectControls>,
        events: EventSink,
        launcher: Arc<dyn AgentLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = ProjectStore::new(project_root);
        let log = ProjectLog::new(store.paths().clone());
        Self {
            project_id: project_id.to_string(),
            store,
            git: GitDriver::new(project_root),
            config,
            controls,
            events,
            launcher,
            clock,
            log,
        }
    }

    /// Drive the milestone until a terminal outcome. Agent sessions are
    /// closed (with grace) before this returns, whatever the outcome.
    pub fn run(&mut self, milestone_id: &str, entry: EntryPoint) -> Result<EngineOutcome, AnimaError> {
        let milestone = self.store.read_milestone(milestone_id)?.value;

        let mut dirty_worktree = false;
        match milestone.status {
            MilestoneStatus::Ready => {
                dirty_worktree = self.prepare_fresh(milestone_id)?;
            }
            MilestoneStatus::InProgress => {
                self.position_on_branch(&milestone)?;
                if let EntryPoint::Recovered { dirty_worktree: d } = &entry {
                    dirty_worktree = *d;
                }
                self.persist_pair(milestone_id, |_m, s| {
                    let now = Utc::now();
                    s.status = ProjectStatus::Awake;
                    s.current_milestone_id = Some(milestone_id.to_string());
                    s.touch(now);
                })?;
            }
            other => {
                return Err(AnimaError::EngineError(format!(
                    "milestone {milestone_id} cannot be iterated from status {other}"
                )));
            }
        }

        // Resume-specific bookkeeping.
        let mut repair: Option<String> = None;
        let mut guidance: Option<String> = None;
        let mut recovered = false;
        match &entry {
            EntryPoint::Fresh => {}
            EntryPoint::Resume { guidance: g } => {
                guidance = g.clone();
                self.persist_pair(milestone_id, |m, _s| m.consecutive_rejections = 0)?;
            }
            EntryPoint::QuotaRestored { pending_feedback } => {
                repair = pending_feedback.clone();
            }
            EntryPoint::Recovered { .. } => recovered = true,
            EntryPoint::HumanReject { reason } => {
                repair = Some(reason.clone());
            }
        }

        let milestone = self.store.read_milestone(milestone_id)?.value;
        // Crash recovery and quota restoration re-enter at the persisted
        // phase. A dirty worktree always goes back to the developer first:
        // reconciliation precedes review.
        let resumes_phase = matches!(
            entry,
            EntryPoint::Recovered { .. } | EntryPoint::QuotaRestored { .. }
        ) && !dirty_worktree;
        let mut phase = match &milestone.round {
            Some(RoundPhase::Acceptor { commit }) if resumes_phase => Phase::Acceptor {
                commit: commit.clone(),
            },
            Some(RoundPhase::FinalReview) if resumes_phase => Phase::Final,
            _ => Phase::Developer,
        };

        let mut developer = self.launcher.launch(AgentRole::Developer, self.root())?;
        let mut acceptor = self.launcher.launch(AgentRole::Acceptor, self.root())?;

        let outcome = self.run_loop(
            milestone_id,
            &mut phase,
            &mut developer,
            &mut acceptor,
            &mut repair,
            &mut guidance,
            recovered,
            dirty_worktree,
        );

        developer.close();
        acceptor.close();

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn run_loop(
        &mut self,
        milestone_id: &str,
        phase: &mut Phase,
        developer: &mut Box<dyn AgentPort>,
        acceptor: &mut Box<dyn AgentPort>,
        repair: &mut Option<String>,
        guidance: &mut Option<String>,
        mut recovered: bool,
        mut dirty_worktree: bool,
    ) -> Result<EngineOutcome, AnimaError> {
        loop {
            if let Some(outcome) = self.handle_interrupts(milestone_id)? {
                return Ok(outcome);
            }

            match std::mem::replace(phase, Phase::Developer) {
                Phase::Developer => {
                    let milestone = self.store.read_milestone(milestone_id)?.value;
                    if milestone.iteration_count >= self.config.max_iterations_per_milestone {
                        return self.pause(
                            milestone_id,
                            "iteration budget for this milestone is exhausted",
                        );
                    }

                    let round = milestone.iteration_count + 1;
                    let prompt = self.developer_prompt(
                        &milestone,
                        round,
                        repair.as_deref(),
                        guidance.take().as_deref(),
                        recovered,
                        dirty_worktree,
                    )?;
                    recovered = false;
                    dirty_worktree = false;

                    self.persist_pair(milestone_id, |m, _s| {
                        m.round = Some(RoundPhase::Developer)
                    })?;
                    self.emit(EventKind::RoundStarted {
                        milestone_id: milestone_id.to_string(),
                        round,
                        role: AgentRole::Developer,
                    });

                    let outcome =
                        self.dispatch(developer.as_mut(), AgentRole::Developer, &prompt)?;
                    self.record_usage(milestone_id, &outcome)?;

                    match outcome.terminal {
                        RoundTerminal::Cancelled => continue, // interrupts handled at loop top
                        RoundTerminal::Quota(q) => {
                            return self.rate_limited(milestone_id, q.status, q.reset_at, repair.take());
                        }
                        RoundTerminal::Timeout => {
                            *repair = Some("the previous attempt timed out".into());
                            if let Some(outcome) = self.record_rejection(
                                milestone_id,
                                round,
                                "developer round timed out",
                                &outcome,
                            )? {
                                return Ok(outcome);
                            }
                            *phase = Phase::Developer;
                        }
                        RoundTerminal::SessionDead { exit_code } => {
                            *repair = Some("the previous session died before finishing".into());
                            if let Some(outcome) = self.record_rejection(
                                milestone_id,
                                round,
                                &format!("developer session died (exit {exit_code:?})"),
                                &outcome,
                            )? {
                                return Ok(outcome);
                            }
                            *developer = self.launcher.launch(AgentRole::Developer, self.root())?;
                            *phase = Phase::Developer;
                        }
                        RoundTerminal::Verdict(Verdict::AllFeaturesComplete { commits, .. }) => {
                            info!(
                                project = self.project_id,
                                milestone = milestone_id,
                                commits = commits.len(),
                                "developer reports milestone complete"
                            );
                            self.emit(EventKind::Verdict {
                                milestone_id: milestone_id.to_string(),
                                role: AgentRole::Developer,
                                verdict: "ALL_FEATURES_COMPLETE".into(),
                            });
                            *phase = Phase::Final;
                        }
                        RoundTerminal::Report | RoundTerminal::Verdict(_) => {
                            // A per-round implementation report. The review
                            // target is the newest commit on the branch.
                            let milestone = self.store.read_milestone(milestone_id)?.value;
                            let base = milestone.base_commit.clone().ok_or_else(|| {
                                AnimaError::EngineError(format!(
                                    "milestone {milestone_id} is in_progress without baseCommit"
                                ))
                            })?;
                            match self.git.commits_since(&base)?.first() {
                                Some(commit) => {
                                    *phase = Phase::Acceptor {
                                        commit: commit.hash.clone(),
                                    };
                                }
                                None => {
                                    *repair = Some(
                                        "no commit was produced; commit your work before reporting"
                                            .into(),
                                    );
                                    if let Some(outcome) = self.record_rejection(
                                        milestone_id,
                                        round,
                                        "developer reported work but produced no commit",
                                        &outcome,
                                    )? {
                                        return Ok(outcome);
                                    }
                                    *phase = Phase::Developer;
                                }
                            }
                        }
                    }
                }

                Phase::Acceptor { commit } => {
                    let milestone = self.store.read_milestone(milestone_id)?.value;
                    let round = milestone.iteration_count + 1;
                    let doc = self.milestone_doc(&milestone);
                    let soul = self.read_doc(self.store.paths().soul_doc());
                    let prompt = prompts::acceptor_review_prompt(soul.as_deref(), &doc, &commit);

                    self.persist_pair(milestone_id, |m, _s| {
                        m.round = Some(RoundPhase::Acceptor {
                            commit: commit.clone(),
                        })
                    })?;
                    self.emit(EventKind::RoundStarted {
                        milestone_id: milestone_id.to_string(),
                        round,
                        role: AgentRole::Acceptor,
                    });

                    let outcome = self.dispatch(acceptor.as_mut(), AgentRole::Acceptor, &prompt)?;
                    self.record_usage(milestone_id, &outcome)?;

                    match outcome.terminal {
                        RoundTerminal::Cancelled => {
                            *phase = Phase::Acceptor { commit };
                            continue;
                        }
                        RoundTerminal::Quota(q) => {
                            return self.rate_limited(milestone_id, q.status, q.reset_at, repair.take());
                        }
                        RoundTerminal::Verdict(Verdict::Accepted) => {
                            self.accept_round(milestone_id, round, &commit, &outcome)?;
                            *repair = None;
                            *phase = Phase::Developer;
                        }
                        RoundTerminal::Verdict(Verdict::Rejected { ref reason }) => {
                            *repair = Some(reason.clone());
                            if let Some(outcome) =
                                self.record_rejection(milestone_id, round, reason, &outcome)?
                            {
                                return Ok(outcome);
                            }
                            *phase = Phase::Developer;
                        }
                        RoundTerminal::Verdict(Verdict::AllFeaturesComplete { .. })
                        | RoundTerminal::Report => {
                            // Not a legal acceptor verdict; ask again via the
                            // developer with an explanation.
                            *repair =
                                Some("reviewer produced no usable verdict; re-submit".into());
                            if let Some(outcome) = self.record_rejection(
                                milestone_id,
                                round,
                                "acceptor emitted a malformed verdict",
                                &outcome,
                            )? {
                                return Ok(outcome);
                            }
                            *phase = Phase::Developer;
                        }
                        RoundTerminal::Timeout => {
                            *repair = Some("the review timed out; re-submit".into());
                            if let Some(outcome) = self.record_rejection(
                                milestone_id,
                                round,
                                "acceptor round timed out",
                                &outcome,
                            )? {
                                return Ok(outcome);
                            }
                            *phase = Phase::Developer;
                        }
                        RoundTerminal::SessionDead { exit_code } => {
                            if let Some(outcome) = self.record_rejection(
                                milestone_id,
                                round,
                                &format!("acceptor session died (exit {exit_code:?})"),
                                &outcome,
                            )? {
                                return Ok(outcome);
                            }
                            *acceptor = self.launcher.launch(AgentRole::Acceptor, self.root())?;
                            *phase = Phase::Acceptor { commit };
                        }
                    }
                }

                Phase::Final => {
                    let milestone = self.store.read_milestone(milestone_id)?.value;
                    let base = milestone.base_commit.clone().ok_or_else(|| {
                        AnimaError::EngineError(format!(
                            "milestone {milestone_id} reached final review without baseCommit"
                        ))
                    })?;
                    let commits: Vec<String> = self
                        .git
                        .commits_since(&base)?
                        .iter()
                        .map(|c| format!("{} {}", c.hash, c.subject))
                        .collect();
                    let doc = self.milestone_doc(&milestone);
                    let soul = self.read_doc(self.store.paths().soul_doc());
                    let prompt = prompts::acceptor_final_prompt(soul.as_deref(), &doc, &commits);

                    self.persist_pair(milestone_id, |m, _s| {
                        m.round = Some(RoundPhase::FinalReview)
                    })?;
                    self.emit(EventKind::RoundStarted {
                        milestone_id: milestone_id.to_string(),
                        round: milestone.iteration_count,
                        role: AgentRole::Acceptor,
                    });

                    let outcome = self.dispatch(acceptor.as_mut(), AgentRole::Acceptor, &prompt)?;
                    self.record_usage(milestone_id, &outcome)?;

                    match outcome.terminal {
                        RoundTerminal::Cancelled => {
                            *phase = Phase::Final;
                            continue;
                        }
                        RoundTerminal::Quota(q) => {
                            return self.rate_limited(milestone_id, q.status, q.reset_at, repair.take());
                        }
                        RoundTerminal::Verdict(Verdict::Accepted) => {
                            return self.finish_milestone(milestone_id);
                        }
                        RoundTerminal::Verdict(Verdict::Rejected { reason }) => {
                            // Final-review rejections are forwarded without
                            // consuming rejection budget.
                            self.log_line(&format!(
                                "final review rejected milestone {milestone_id}: {reason}"
                            ));
                            self.emit(EventKind::Verdict {
                                milestone_id: milestone_id.to_string(),
                                role: AgentRole::Acceptor,
                                verdict: format!("REJECTED: {reason}"),
                            });
                            *repair = Some(reason);
                            *phase = Phase::Developer;
                        }
                        RoundTerminal::Verdict(Verdict::AllFeaturesComplete { .. })
                        | RoundTerminal::Report
                        | RoundTerminal::Timeout => {
                            *repair = Some("final review produced no verdict; re-submit".into());
                            *phase = Phase::Developer;
                        }
                        RoundTerminal::SessionDead { .. } => {
                            *acceptor = self.launcher.launch(AgentRole::Acceptor, self.root())?;
                            *phase = Phase::Final;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Round plumbing
    // ------------------------------------------------------------------

    fn dispatch(
        &self,
        port: &mut dyn AgentPort,
        role: AgentRole,
        prompt: &str,
    ) -> Result<RoundOutcome, AnimaError> {
        let deadline = Duration::from_millis(self.config.agent_timeout_ms);
        let events = self.events.clone();
        let mut sink = move |item: StreamItem| match item {
            StreamItem::Chunk(text) => events(EventKind::AgentStreamChunk { role, text }),
            StreamItem::ToolUse { name, brief } => {
                events(EventKind::ToolUse { role, name, brief })
            }
        };

        match port.send_frame(prompt) {
            Ok(()) => {}
            Err(AnimaError::SessionDead(detail)) => {
                // Surface as a dead round; the loop relaunches the session.
                warn!(project = self.project_id, role = %role, detail = %detail, "send to dead session");
                return Ok(RoundOutcome {
                    terminal: RoundTerminal::SessionDead { exit_code: None },
                    tokens: 0,
                    cost_usd: 0.0,
                    elapsed: Duration::ZERO,
                });
            }
            Err(e) => return Err(e),
        }

        port.collect_round(deadline, &self.controls.round_interrupt, &mut sink)
    }

    fn record_usage(&self, milestone_id: &str, outcome: &RoundOutcome) -> Result<(), AnimaError> {
        if outcome.tokens == 0 && outcome.cost_usd == 0.0 {
            return Ok(());
        }
        let now = self.clock.now();
        self.persist_pair(milestone_id, |m, s| {
            m.add_usage(outcome.tokens, outcome.cost_usd);
            s.add_usage(outcome.tokens, outcome.cost_usd);
            s.touch(now);
        })
        .map(|_| ())
    }

    /// Accepted per-round verdict: reset the rejection counter, count the
    /// iteration, clear the persisted phase.
    fn accept_round(
        &self,
        milestone_id: &str,
        round: u32,
        commit: &str,
        outcome: &RoundOutcome,
    ) -> Result<(), AnimaError> {
        let now = self.clock.now();
        self.persist_pair(milestone_id, |m, s| {
            m.consecutive_rejections = 0;
            m.iteration_count += 1;
            m.round = None;
            s.touch(now);
        })?;

        self.emit(EventKind::RoundFinished {
            milestone_id: milestone_id.to_string(),
            round,
            accepted: true,
            reason: None,
            elapsed_ms: outcome.elapsed.as_millis() as u64,
            tokens: outcome.tokens,
            cost_usd: outcome.cost_usd,
        });
        self.log_line(&format!(
            "round {round} accepted for milestone {milestone_id} (commit {commit})"
        ));

        IterationRecord {
            milestone_id,
            round,
            phase: "acceptor",
            verdict: "ACCEPTED",
            detail: &format!("commit {commit} accepted"),
            tokens: outcome.tokens,
            cost_usd: outcome.cost_usd,
            finished_at: now,
        }
        .write(self.store.paths())
        .unwrap_or_else(|e| warn!(error = %e, "failed to write iteration record"));

        Ok(())
    }

    /// Count a rejection (verdict, timeout, or dead session). Returns the
    /// paused outcome when the threshold is reached.
    fn record_rejection(
        &self,
        milestone_id: &str,
        round: u32,
        reason: &str,
        outcome: &RoundOutcome,
    ) -> Result<Option<EngineOutcome>, AnimaError> {
        let now = self.clock.now();
        let (milestone, _state) = self.persist_pair(milestone_id, |m, s| {
            m.consecutive_rejections += 1;
            s.touch(now);
        })?;

        self.emit(EventKind::RoundFinished {
            milestone_id: milestone_id.to_string(),
            round,
            accepted: false,
            reason: Some(reason.to_string()),
            elapsed_ms: outcome.elapsed.as_millis() as u64,
            tokens: outcome.tokens,
            cost_usd: outcome.cost_usd,
        });
        self.log_line(&format!(
            "round {round} rejected for milestone {milestone_id}: {reason}"
        ));

        IterationRecord {
            milestone_id,
            round,
            phase: "acceptor",
            verdict: "REJECTED",
            detail: reason,
            tokens: outcome.tokens,
            cost_usd: outcome.cost_usd,
            finished_at: now,
        }
        .write(self.store.paths())
        .unwrap_or_else(|e| warn!(error = %e, "failed to write iteration record"));

        if milestone.consecutive_rejections >= REJECTION_THRESHOLD {
            let paused = self.pause(
                milestone_id,
                &format!(
                    "{} consecutive rejections; waiting for human input",
                    milestone.consecutive_rejections
                ),
            )?;
            return Ok(Some(paused));
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Terminal paths
    // ------------------------------------------------------------------

    fn pause(&self, milestone_id: &str, reason: &str) -> Result<EngineOutcome, AnimaError> {
        self.transition_state(milestone_id, ProjectStatus::Paused, Some(milestone_id))?;
        self.log_line(&format!("paused: {reason}"));
        Ok(EngineOutcome::Paused {
            reason: reason.to_string(),
        })
    }

    fn rate_limited(
        &self,
        milestone_id: &str,
        status: QuotaStatus,
        reset_at: Option<DateTime<Utc>>,
        pending_feedback: Option<String>,
    ) -> Result<EngineOutcome, AnimaError> {
        let reset_at =
            reset_at.unwrap_or_else(|| self.clock.now() + chrono::Duration::minutes(DEFAULT_BACKOFF_MINUTES));

        self.persist_pair(milestone_id, |_m, s| {
            s.rate_limit_reset_at = Some(reset_at);
        })?;
        self.transition_state(milestone_id, ProjectStatus::RateLimited, Some(milestone_id))?;

        self.emit(EventKind::QuotaEvent {
            status,
            reset_at: Some(reset_at),
        });
        self.log_line(&format!(
            "quota signal ({status:?}); suspended until {reset_at}"
        ));

        Ok(EngineOutcome::RateLimited {
            reset_at,
            pending_feedback,
        })
    }

    fn finish_milestone(&self, milestone_id: &str) -> Result<EngineOutcome, AnimaError> {
        let milestone = self.store.read_milestone(milestone_id)?.value;

        if milestone.requires_human_review {
            let now = self.clock.now();
            self.persist_transition(milestone_id, MilestoneStatus::AwaitingReview, |m, s| {
                m.round = None;
                s.status = ProjectStatus::Sleeping;
                s.current_milestone_id = None;
                s.touch(now);
            })?;
            self.log_line(&format!("milestone {milestone_id} awaiting human review"));
            return Ok(EngineOutcome::AwaitingReview);
        }

        match self.finalize_version_control(&milestone) {
            Ok(()) => {
                let now = self.clock.now();
                self.persist_transition(milestone_id, MilestoneStatus::Completed, |m, s| {
                    m.round = None;
                    m.completed_at = Some(now);
                    s.status = ProjectStatus::Sleeping;
                    s.current_milestone_id = None;
                    s.touch(now);
                })?;
                self.log_line(&format!("milestone {milestone_id} completed, merged and tagged"));
                Ok(EngineOutcome::Completed)
            }
            Err(e) => {
                // Finalization failures are fatal for the milestone run but
                // leave it in_progress for a human to untangle.
                self.emit(EventKind::Error {
                    error: anima_types::ErrorKind::FatalMilestone,
                    message: format!("version-control finalization failed for {milestone_id}"),
                    detail: Some(e.to_string()),
                });
                self.pause(milestone_id, &format!("finalization failed: {e}"))
            }
        }
    }

    /// Merge the milestone branch into the integration branch and tag it.
    /// The milestone branch is kept (deletion is an explicit user action).
    fn finalize_version_control(&self, milestone: &Milestone) -> Result<(), AnimaError> {
        let integration = self.git.default_branch()?;
        self.git.switch_branch(&integration)?;
        if self
            .git
            .merge(&milestone.branch_name, MergeStrategy::FastForward)
            .is_err()
        {
            self.git.merge(&milestone.branch_name, MergeStrategy::Merge)?;
        }
        self.git.tag(&tag_for(&milestone.id), "HEAD")?;
        Ok(())
    }

    /// Roll the milestone branch back to its base and mark it cancelled.
    fn cancel_in_progress(&self, milestone_id: &str) -> Result<EngineOutcome, AnimaError> {
        self.rollback_branch(milestone_id)?;
        let now = self.clock.now();
        self.persist_transition(milestone_id, MilestoneStatus::Cancelled, |m, s| {
            m.round = None;
            m.completed_at = Some(now);
            s.status = ProjectStatus::Sleeping;
            s.current_milestone_id = None;
            s.touch(now);
        })?;
        self.log_line(&format!("milestone {milestone_id} cancelled, branch rolled back"));
        Ok(EngineOutcome::Cancelled)
    }

    /// Fatal failure: roll back and mark failed.
    pub fn fail_milestone(&self, milestone_id: &str, reason: &str) -> Result<EngineOutcome, AnimaError> {
        if let Err(e) = self.rollback_branch(milestone_id) {
            warn!(project = self.project_id, error = %e, "rollback failed during fail_milestone");
        }
        let now = self.clock.now();
        self.persist_transition(milestone_id, MilestoneStatus::Failed, |m, s| {
            m.round = None;
            m.completed_at = Some(now);
            s.status = ProjectStatus::Sleeping;
            s.current_milestone_id = None;
            s.touch(now);
        })?;
        self.emit(EventKind::Error {
            error: anima_types::ErrorKind::FatalEngine,
            message: format!("milestone {milestone_id} failed: {reason}"),
            detail: None,
        });
        self.log_line(&format!("milestone {milestone_id} failed: {reason}"));
        Ok(EngineOutcome::Failed {
            reason: reason.to_string(),
        })
    }

    fn rollback_branch(&self, milestone_id: &str) -> Result<(), AnimaError> {
        let milestone = self.store.read_milestone(milestone_id)?.value;
        let Some(base) = milestone.base_commit.as_deref() else {
            return Ok(()); // never started; nothing to roll back
        };
        if self.git.current_branch()? != milestone.branch_name {
            self.git.switch_branch(&milestone.branch_name)?;
        }
        // The integration branch is never touched here.
        self.git.reset(base, true)
    }

    // ------------------------------------------------------------------
    // Control-plane hooks (used by the scheduler)
    // ------------------------------------------------------------------

    /// Human approved an awaiting-review milestone: merge, tag, complete.
    pub fn finalize_after_approval(&self, milestone_id: &str) -> Result<(), AnimaError> {
        let milestone = self.store.read_milestone(milestone_id)?.value;
        if milestone.status != MilestoneStatus::AwaitingReview {
            return Err(AnimaError::EngineError(format!(
                "approve: milestone {milestone_id} is {}, not awaiting_review",
                milestone.status
            )));
        }

        match self.finalize_version_control(&milestone) {
            Ok(()) => {
                let now = self.clock.now();
                self.persist_transition(milestone_id, MilestoneStatus::Completed, |m, s| {
                    m.completed_at = Some(now);
                    s.touch(now);
                })?;
                self.log_line(&format!("milestone {milestone_id} approved and completed"));
                Ok(())
            }
            Err(e) => {
                self.emit(EventKind::Error {
                    error: anima_types::ErrorKind::FatalMilestone,
                    message: format!("finalization after approval failed for {milestone_id}"),
                    detail: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    /// Human rejected an awaiting-review milestone: back to in_progress with
    /// a fresh rejection budget; the caller re-enters `run`.
    pub fn reopen_after_review_rejection(&self, milestone_id: &str) -> Result<(), AnimaError> {
        let milestone = self.store.read_milestone(milestone_id)?.value;
        if milestone.status != MilestoneStatus::AwaitingReview {
            return Err(AnimaError::EngineError(format!(
                "reject: milestone {milestone_id} is {}, not awaiting_review",
                milestone.status
            )));
        }
        self.persist_transition(milestone_id, MilestoneStatus::InProgress, |m, s| {
            m.consecutive_rejections = 0;
            s.status = ProjectStatus::Awake;
            s.current_milestone_id = Some(milestone_id.to_string());
        })
        .map(|_| ())
    }

    /// Cancel a milestone while no engine run is active (paused or
    /// rate-limited project, or awaiting review).
    pub fn cancel_idle(&self, milestone_id: &str) -> Result<(), AnimaError> {
        let milestone = self.store.read_milestone(milestone_id)?.value;
        match milestone.status {
            MilestoneStatus::InProgress | MilestoneStatus::AwaitingReview => {
                self.cancel_in_progress(milestone_id).map(|_| ())
            }
            other => Err(AnimaError::EngineError(format!(
                "cancel: milestone {milestone_id} is {other}; only in_progress or awaiting_review can be cancelled"
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Preparation and helpers
    // ------------------------------------------------------------------

    /// First pickup of a ready milestone: branch from the integration head
    /// and persist the in_progress/awake pair.
    fn prepare_fresh(&self, milestone_id: &str) -> Result<bool, AnimaError> {
        let dirty = worktree_dirty(&self.git.status()?);

        let integration = self.git.default_branch()?;
        if self.git.current_branch()? != integration {
            self.git.switch_branch(&integration)?;
        }
        let base = self.git.current_commit()?;

        let milestone = self.store.read_milestone(milestone_id)?.value;
        if !self.git.ref_exists(&format!("refs/heads/{}", milestone.branch_name)) {
            self.git.create_branch(&milestone.branch_name, &integration)?;
        } else {
            self.git.switch_branch(&milestone.branch_name)?;
        }

        let now = self.clock.now();
        self.persist_transition(milestone_id, MilestoneStatus::InProgress, |m, s| {
            m.base_commit = Some(base.clone());
            m.started_at = Some(now);
            s.status = ProjectStatus::Awake;
            s.current_milestone_id = Some(milestone_id.to_string());
            s.touch(now);
        })?;

        self.log_line(&format!(
            "milestone {milestone_id} picked up on branch milestone/{milestone_id}"
        ));
        Ok(dirty)
    }

    fn position_on_branch(&self, milestone: &Milestone) -> Result<(), AnimaError> {
        if self.git.current_branch()? != milestone.branch_name {
            self.git.switch_branch(&milestone.branch_name)?;
        }
        Ok(())
    }

    fn developer_prompt(
        &self,
        milestone: &Milestone,
        round: u32,
        repair: Option<&str>,
        guidance: Option<&str>,
        recovered: bool,
        dirty_worktree: bool,
    ) -> Result<String, AnimaError> {
        let doc = self.milestone_doc(milestone);
        let vision = self.read_doc(self.store.paths().vision_doc());
        let soul = self.read_doc(self.store.paths().soul_doc());
        let memory = self.read_doc(self.store.paths().project_memory());

        let completed: Vec<String> = match &milestone.base_commit {
            Some(base) => self
                .git
                .commits_since(base)?
                .iter()
                .map(|c| c.subject.clone())
                .collect(),
            None => Vec::new(),
        };

        let commit_lines: Vec<String> = match &milestone.base_commit {
            Some(base) => self
                .git
                .commits_since(base)?
                .iter()
                .map(|c| format!("{} {}", c.hash, c.subject))
                .collect(),
            None => Vec::new(),
        };

        let recovery = recovered.then(|| RecoveryContext {
            iteration_count: milestone.iteration_count,
            commits: &commit_lines,
        });

        let ctx = DeveloperContext {
            vision: vision.as_deref(),
            soul: soul.as_deref(),
            milestone_doc: &doc,
            memory: memory.as_deref(),
            branch: &milestone.branch_name,
            round,
            completed: &completed,
            rejection: repair,
            guidance,
            dirty_worktree,
            recovery,
        };
        Ok(prompts::developer_round_prompt(&ctx))
    }

    fn milestone_doc(&self, milestone: &Milestone) -> String {
        self.store
            .read_milestone_doc(&milestone.doc_path)
            .unwrap_or_else(|e| {
                warn!(milestone = milestone.id, error = %e, "milestone document unreadable");
                format!("(milestone document {} is missing)", milestone.doc_path)
            })
    }

    fn read_doc(&self, path: std::path::PathBuf) -> Option<String> {
        std::fs::read_to_string(path).ok().filter(|s| !s.trim().is_empty())
    }

    fn root(&self) -> &std::path::Path {
        self.store.paths().project_root()
    }

    /// Check pause/cancel/shutdown flags; returns the outcome that ends the
    /// run, if any. Clears the round interrupt after consuming flags.
    fn handle_interrupts(&self, milestone_id: &str) -> Result<Option<EngineOutcome>, AnimaError> {
        if self.controls.shutdown.is_cancelled() {
            // Leave state as persisted; recovery resumes after restart.
            return Ok(Some(EngineOutcome::Shutdown));
        }
        if self.controls.take_cancel() {
            self.controls.clear_interrupt();
            return self.cancel_in_progress(milestone_id).map(Some);
        }
        if self.controls.take_pause() {
            self.controls.clear_interrupt();
            return self.pause(milestone_id, "paused by user").map(Some);
        }
        self.controls.clear_interrupt();
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Persistence helpers
    // ------------------------------------------------------------------

    /// Read-modify-write both records under the project lock, retrying on
    /// stale-token conflicts.
    fn persist_pair(
        &self,
        milestone_id: &str,
        mutate: impl Fn(&mut Milestone, &mut ProjectState),
    ) -> Result<(Milestone, ProjectState), AnimaError> {
        loop {
            let milestone = self.store.read_milestone(milestone_id)?;
            let state = self.store.read_project_state()?;
            let mut m = milestone.value.clone();
            let mut s = state.value.clone();
            mutate(&mut m, &mut s);

            match self
                .store
                .write_milestone_and_state(&m, &milestone.version, &s, &state.version)
            {
                Ok(_) => return Ok((m, s)),
                Err(AnimaError::StaleWrite(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Like `persist_pair`, but routes the milestone through its lifecycle
    /// graph and emits the status-change event.
    fn persist_transition(
        &self,
        milestone_id: &str,
        to: MilestoneStatus,
        mutate: impl Fn(&mut Milestone, &mut ProjectState),
    ) -> Result<(Milestone, ProjectState), AnimaError> {
        let from = self.store.read_milestone(milestone_id)?.value.status;
        let result = self.persist_pair(milestone_id, |m, s| {
            if m.status != to {
                // transition_to validated the graph in tests; a violation
                // here is an engine invariant bug surfaced loudly.
                if let Err(e) = m.transition_to(to) {
                    warn!(error = %e, "illegal milestone transition requested");
                    return;
                }
            }
            mutate(m, s);
        })?;

        if result.0.status != to {
            return Err(AnimaError::EngineError(format!(
                "milestone {milestone_id} transition {from} -> {to} was rejected"
            )));
        }

        self.emit(EventKind::MilestoneStatusChange {
            milestone_id: milestone_id.to_string(),
            from,
            to,
        });
        Ok(result)
    }

    /// Persist a project-status change and emit the event.
    fn transition_state(
        &self,
        milestone_id: &str,
        to: ProjectStatus,
        current_milestone: Option<&str>,
    ) -> Result<(), AnimaError> {
        let before = self.store.read_project_state()?.value.status;
        self.persist_pair(milestone_id, |_m, s| {
            s.status = to;
            s.current_milestone_id = if to.requires_milestone() {
                current_milestone.map(|s| s.to_string())
            } else {
                None
            };
        })?;
        if before != to {
            self.emit(EventKind::StatusChange { from: before, to });
        }
        Ok(())
    }

    fn emit(&self, kind: EventKind) {
        (self.events)(kind);
    }

    fn log_line(&self, message: &str) {
        if let Err(e) = self.log.append(message) {
            warn!(project = self.project_id, error = %e, "project log append failed");
        }
    }
}

/// Whether the working tree is dirty, ignoring the `.anima/` state tree
/// (which lives inside the repository and is written by the core itself).
pub(crate) fn worktree_dirty(status: &anima_git::WorktreeStatus) -> bool {
    let is_project_file = |p: &String| !p.starts_with(".anima/") && p != ".anima";
    status.staged.iter().any(is_project_file)
        || status.unstaged.iter().any(is_project_file)
        || status.untracked.iter().any(is_project_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anima_git::WorktreeStatus;

    #[test]
    fn state_tree_does_not_count_as_dirt() {
        let status = WorktreeStatus {
            staged: vec![],
            unstaged: vec![],
            untracked: vec![".anima/".into(), ".anima/state.json".into()],
        };
        assert!(!worktree_dirty(&status));
    }

    #[test]
    fn project_files_count_as_dirt() {
        let status = WorktreeStatus {
            staged: vec![],
            unstaged: vec!["src/lib.rs".into()],
            untracked: vec![],
        };
        assert!(worktree_dirty(&status));
    }
}
