//! End-to-end iteration-engine scenarios over real git repositories with
//! scripted agent ports.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use anima_agent::{QuotaSignal, RoundOutcome, RoundTerminal, StreamItem, Verdict};
use anima_engine::controls::EventSink;
use anima_engine::{
    CancellationToken, Clock, EngineOutcome, EntryPoint, IterationEngine, ProjectControls,
    SystemClock,
};
use anima_engine::port::{AgentLauncher, AgentPort};
use anima_store::{initialize_project, ProjectStore, Version};
use anima_types::{
    AgentRole, AnimaError, EventKind, Milestone, MilestoneStatus, ProjectState, ProjectStatus,
    QuotaStatus, RoundPhase,
};

// ----------------------------------------------------------------------
// Git helpers
// ----------------------------------------------------------------------

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git spawn");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "anima@example.com"]);
    git(dir, &["config", "user.name", "Anima"]);
    std::fs::write(dir.join("README.md"), "# project\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "initial commit"]);
}

// ----------------------------------------------------------------------
// Scripted agent port
// ----------------------------------------------------------------------

#[derive(Clone)]
enum Step {
    /// Write a file, commit it, end the round as a report.
    Commit { file: &'static str, message: &'static str },
    /// End the round as a report without committing anything.
    ReportOnly,
    /// Claim the milestone is done.
    AllComplete,
    Accept,
    Reject(&'static str),
    Quota { minutes: i64 },
    Timeout,
    /// Exit before any verdict.
    Die,
    /// Spin until the round is cancelled.
    Block,
}

type Script = Arc<Mutex<VecDeque<Step>>>;
type PromptLog = Arc<Mutex<Vec<(AgentRole, String)>>>;

struct ScriptedPort {
    role: AgentRole,
    repo: PathBuf,
    script: Script,
    prompts: PromptLog,
    dead: bool,
}

impl AgentPort for ScriptedPort {
    fn send_frame(&mut self, text: &str) -> Result<(), AnimaError> {
        if self.dead {
            return Err(AnimaError::SessionDead("scripted death".into()));
        }
        self.prompts.lock().unwrap().push((self.role, text.to_string()));
        Ok(())
    }

    fn collect_round(
        &mut self,
        _deadline: Duration,
        cancel: &CancellationToken,
        _sink: &mut dyn FnMut(StreamItem),
    ) -> Result<RoundOutcome, AnimaError> {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Timeout);

        let terminal = match step {
            Step::Commit { file, message } => {
                std::fs::write(self.repo.join(file), format!("// {message}\n")).unwrap();
                git(&self.repo, &["add", "-A"]);
                git(&self.repo, &["commit", "-m", message]);
                RoundTerminal::Report
            }
            Step::ReportOnly => RoundTerminal::Report,
            Step::AllComplete => RoundTerminal::Verdict(Verdict::AllFeaturesComplete {
                summary: "all features done".into(),
                commits: vec![],
            }),
            Step::Accept => RoundTerminal::Verdict(Verdict::Accepted),
            Step::Reject(reason) => RoundTerminal::Verdict(Verdict::Rejected {
                reason: reason.to_string(),
            }),
            Step::Quota { minutes } => RoundTerminal::Quota(QuotaSignal {
                status: QuotaStatus::RateLimited,
                reset_at: Some(Utc::now() + chrono::Duration::minutes(minutes)),
                message: "rate limit exceeded".into(),
            }),
            Step::Timeout => RoundTerminal::Timeout,
            Step::Die => {
                self.dead = true;
                RoundTerminal::SessionDead { exit_code: Some(1) }
            }
            Step::Block => loop {
                if cancel.is_cancelled() {
                    break RoundTerminal::Cancelled;
                }
                std::thread::sleep(Duration::from_millis(20));
            },
        };

        Ok(RoundOutcome {
            terminal,
            tokens: 100,
            cost_usd: 0.01,
            elapsed: Duration::from_millis(5),
        })
    }

    fn close(&mut self) {}
    fn kill(&mut self) {}
    fn is_alive(&self) -> bool {
        !self.dead
    }
}

struct ScriptedLauncher {
    repo: PathBuf,
    developer: Script,
    acceptor: Script,
    prompts: PromptLog,
}

impl ScriptedLauncher {
    fn new(repo: &Path, dev: Vec<Step>, acc: Vec<Step>) -> Self {
        Self {
            repo: repo.to_path_buf(),
            developer: Arc::new(Mutex::new(dev.into())),
            acceptor: Arc::new(Mutex::new(acc.into())),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push_dev(&self, steps: Vec<Step>) {
        self.developer.lock().unwrap().extend(steps);
    }

    fn push_acc(&self, steps: Vec<Step>) {
        self.acceptor.lock().unwrap().extend(steps);
    }

    fn prompts(&self) -> Vec<(AgentRole, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

impl AgentLauncher for ScriptedLauncher {
    fn launch(
        &self,
        role: AgentRole,
        _project_root: &Path,
    ) -> Result<Box<dyn AgentPort>, AnimaError> {
        let script = match role {
            AgentRole::Developer => Arc::clone(&self.developer),
            AgentRole::Acceptor => Arc::clone(&self.acceptor),
        };
        Ok(Box::new(ScriptedPort {
            role,
            repo: self.repo.clone(),
            script,
            prompts: Arc::clone(&self.prompts),
            dead: false,
        }))
    }
}

// ----------------------------------------------------------------------
// Fixture
// ----------------------------------------------------------------------

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    store: ProjectStore,
    controls: Arc<ProjectControls>,
    events: Arc<Mutex<Vec<EventKind>>>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        init_repo(&root);
        initialize_project(&root).unwrap();
        let store = ProjectStore::new(&root);
        Self {
            _dir: dir,
            root,
            store,
            controls: ProjectControls::new(CancellationToken::new()),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn add_ready_milestone(&self, id: &str, requires_review: bool) {
        let mut milestone = Milestone::new_draft(id, &format!("milestone {id}"), requires_review, Utc::now());
        milestone.transition_to(MilestoneStatus::Ready).unwrap();
        self.store.write_milestone(&milestone, &Version::absent()).unwrap();
        std::fs::write(
            self.store.paths().milestone_doc(&milestone.doc_path),
            "## Features\n- the function returns 42\n",
        )
        .unwrap();

        let order = self.store.read_order().unwrap();
        let mut value = order.value.clone();
        value.milestone_ids.push(id.to_string());
        self.store.write_order(&value, &order.version).unwrap();
    }

    fn engine(&self, launcher: &Arc<ScriptedLauncher>) -> IterationEngine {
        let events = Arc::clone(&self.events);
        let sink: EventSink = Arc::new(move |kind| events.lock().unwrap().push(kind));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        IterationEngine::new(
            "proj-1",
            &self.root,
            self.store.read_config().unwrap(),
            Arc::clone(&self.controls),
            sink,
            Arc::clone(launcher) as Arc<dyn AgentLauncher>,
            clock,
        )
    }

    fn state(&self) -> ProjectState {
        self.store.read_project_state().unwrap().value
    }

    fn milestone(&self, id: &str) -> Milestone {
        self.store.read_milestone(id).unwrap().value
    }

    fn events(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().clone()
    }
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[test]
fn happy_path_without_review() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![
            Step::Commit { file: "answer.rs", message: "feat: return 42" },
            Step::AllComplete,
        ],
        vec![Step::Accept, Step::Accept],
    ));

    let outcome = fx.engine(&launcher).run("m1", EntryPoint::Fresh).unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    let milestone = fx.milestone("m1");
    assert_eq!(milestone.status, MilestoneStatus::Completed);
    assert_eq!(milestone.iteration_count, 1);
    assert!(milestone.base_commit.is_some());
    assert!(milestone.completed_at.is_some());

    let state = fx.state();
    assert_eq!(state.status, ProjectStatus::Sleeping);
    assert!(state.current_milestone_id.is_none());
    assert!(state.tokens_used > 0);

    // Merge landed on main and the tag exists.
    assert_eq!(git(&fx.root, &["rev-parse", "--abbrev-ref", "HEAD"]), "main");
    let log = git(&fx.root, &["log", "--oneline", "main"]);
    assert!(log.contains("feat: return 42"));
    let tags = git(&fx.root, &["tag", "--list"]);
    assert!(tags.contains("milestone-m1"));

    // Exactly one accepted round, and a completed transition.
    let accepted = fx
        .events()
        .iter()
        .filter(|e| matches!(e, EventKind::RoundFinished { accepted: true, .. }))
        .count();
    assert_eq!(accepted, 1);
    assert!(fx.events().iter().any(|e| matches!(
        e,
        EventKind::MilestoneStatusChange { to: MilestoneStatus::Completed, .. }
    )));
}

#[test]
fn rejection_threshold_pauses_then_resume_recovers() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![
            Step::Commit { file: "a.rs", message: "feat: attempt 1" },
            Step::Commit { file: "b.rs", message: "feat: attempt 2" },
            Step::Commit { file: "c.rs", message: "feat: attempt 3" },
        ],
        vec![
            Step::Reject("missing X"),
            Step::Reject("missing X"),
            Step::Reject("missing X"),
        ],
    ));

    let outcome = fx.engine(&launcher).run("m1", EntryPoint::Fresh).unwrap();
    assert!(matches!(outcome, EngineOutcome::Paused { .. }));

    let milestone = fx.milestone("m1");
    assert_eq!(milestone.status, MilestoneStatus::InProgress);
    assert_eq!(milestone.consecutive_rejections, 3);
    assert_eq!(fx.state().status, ProjectStatus::Paused);
    assert!(!git(&fx.root, &["tag", "--list"]).contains("milestone-m1"));
    assert_eq!(git(&fx.root, &["rev-parse", "--abbrev-ref", "HEAD"]), "milestone/m1");

    // Resume with guidance: counter resets and a new developer prompt goes out.
    let before = launcher.prompts().len();
    launcher.push_dev(vec![
        Step::Commit { file: "d.rs", message: "feat: fixed X" },
        Step::AllComplete,
    ]);
    launcher.push_acc(vec![Step::Accept, Step::Accept]);

    let outcome = fx
        .engine(&launcher)
        .run("m1", EntryPoint::Resume { guidance: Some("focus on X".into()) })
        .unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    let prompts = launcher.prompts();
    assert!(prompts.len() > before);
    let (role, text) = &prompts[before];
    assert_eq!(*role, AgentRole::Developer);
    assert!(text.contains("focus on X"));
    assert_eq!(fx.milestone("m1").consecutive_rejections, 0);
}

#[test]
fn quota_backoff_suspends_and_resumes_same_prompt() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![Step::Quota { minutes: 15 }],
        vec![],
    ));

    let before = Utc::now();
    let outcome = fx.engine(&launcher).run("m1", EntryPoint::Fresh).unwrap();
    let EngineOutcome::RateLimited { reset_at, .. } = outcome else {
        panic!("expected RateLimited, got {outcome:?}");
    };

    let lower = before + chrono::Duration::minutes(14);
    let upper = before + chrono::Duration::minutes(16);
    assert!(reset_at > lower && reset_at < upper);

    let state = fx.state();
    assert_eq!(state.status, ProjectStatus::RateLimited);
    assert_eq!(state.current_milestone_id.as_deref(), Some("m1"));
    assert!(state.rate_limit_reset_at.is_some());
    // No rejection was counted for the quota retry.
    assert_eq!(fx.milestone("m1").consecutive_rejections, 0);

    // Resume: the developer receives the exact same prompt again.
    launcher.push_dev(vec![
        Step::Commit { file: "a.rs", message: "feat: a" },
        Step::AllComplete,
    ]);
    launcher.push_acc(vec![Step::Accept, Step::Accept]);

    let outcome = fx
        .engine(&launcher)
        .run("m1", EntryPoint::QuotaRestored { pending_feedback: None })
        .unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    let prompts = launcher.prompts();
    let dev_prompts: Vec<&String> = prompts
        .iter()
        .filter(|(r, _)| *r == AgentRole::Developer)
        .map(|(_, p)| p)
        .collect();
    assert!(dev_prompts.len() >= 2);
    assert_eq!(dev_prompts[0], dev_prompts[1]);
}

#[test]
fn crash_recovery_reprompts_acceptor_with_pending_commit() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    // Simulate an interrupted run: milestone in_progress, one commit on the
    // branch, acceptor never answered, then the process died.
    let base = git(&fx.root, &["rev-parse", "HEAD"]);
    git(&fx.root, &["checkout", "-b", "milestone/m1"]);
    std::fs::write(fx.root.join("wip.rs"), "// wip\n").unwrap();
    git(&fx.root, &["add", "-A"]);
    git(&fx.root, &["commit", "-m", "feat: wip feature"]);
    let c1 = git(&fx.root, &["rev-parse", "HEAD"]);

    let read = fx.store.read_milestone("m1").unwrap();
    let mut milestone = read.value.clone();
    milestone.transition_to(MilestoneStatus::InProgress).unwrap();
    milestone.base_commit = Some(base.clone());
    milestone.started_at = Some(Utc::now());
    milestone.round = Some(RoundPhase::Acceptor { commit: c1.clone() });
    let state = ProjectState {
        status: ProjectStatus::Awake,
        current_milestone_id: Some("m1".into()),
        ..Default::default()
    };
    let sv = fx.store.read_project_state().unwrap().version;
    fx.store
        .write_milestone_and_state(&milestone, &read.version, &state, &sv)
        .unwrap();

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![Step::AllComplete],
        vec![Step::Accept, Step::Accept],
    ));

    let outcome = fx
        .engine(&launcher)
        .run("m1", EntryPoint::Recovered { dirty_worktree: false })
        .unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    // The first prompt after recovery was the acceptor review of c1.
    let prompts = launcher.prompts();
    let (role, text) = &prompts[0];
    assert_eq!(*role, AgentRole::Acceptor);
    assert!(text.contains(&c1));
}

#[test]
fn crash_recovery_dirty_tree_reconciles_with_developer_first() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    let base = git(&fx.root, &["rev-parse", "HEAD"]);
    git(&fx.root, &["checkout", "-b", "milestone/m1"]);
    std::fs::write(fx.root.join("wip.rs"), "// uncommitted\n").unwrap();

    let read = fx.store.read_milestone("m1").unwrap();
    let mut milestone = read.value.clone();
    milestone.transition_to(MilestoneStatus::InProgress).unwrap();
    milestone.base_commit = Some(base);
    milestone.round = Some(RoundPhase::Developer);
    let state = ProjectState {
        status: ProjectStatus::Awake,
        current_milestone_id: Some("m1".into()),
        ..Default::default()
    };
    let sv = fx.store.read_project_state().unwrap().version;
    fx.store
        .write_milestone_and_state(&milestone, &read.version, &state, &sv)
        .unwrap();

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![
            Step::Commit { file: "wip.rs", message: "feat: reconciled wip" },
            Step::AllComplete,
        ],
        vec![Step::Accept, Step::Accept],
    ));

    let outcome = fx
        .engine(&launcher)
        .run("m1", EntryPoint::Recovered { dirty_worktree: true })
        .unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    let prompts = launcher.prompts();
    let (role, text) = &prompts[0];
    assert_eq!(*role, AgentRole::Developer);
    assert!(text.contains("Worktree Reconciliation"));
    assert!(text.contains("RESUMES"));
}

#[test]
fn cancellation_rolls_branch_back_to_base() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![
            Step::Commit { file: "one.rs", message: "feat: one" },
            Step::Commit { file: "two.rs", message: "feat: two" },
        ],
        vec![Step::Accept, Step::Block],
    ));

    let controls = Arc::clone(&fx.controls);
    let mut engine = fx.engine(&launcher);
    let handle = std::thread::spawn(move || engine.run("m1", EntryPoint::Fresh));

    // Let the run reach the blocked acceptor round, then cancel.
    std::thread::sleep(Duration::from_millis(400));
    controls.request_cancel();
    let outcome = handle.join().unwrap().unwrap();
    assert_eq!(outcome, EngineOutcome::Cancelled);

    let milestone = fx.milestone("m1");
    assert_eq!(milestone.status, MilestoneStatus::Cancelled);
    let base = milestone.base_commit.unwrap();

    // Branch reset to base; integration branch untouched.
    assert_eq!(git(&fx.root, &["rev-parse", "milestone/m1"]), base);
    assert_eq!(git(&fx.root, &["rev-parse", "main"]), base);
    assert_eq!(fx.state().status, ProjectStatus::Sleeping);
}

#[test]
fn human_review_flow_approve() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", true);

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![
            Step::Commit { file: "f.rs", message: "feat: reviewed feature" },
            Step::AllComplete,
        ],
        vec![Step::Accept, Step::Accept],
    ));

    let outcome = fx.engine(&launcher).run("m1", EntryPoint::Fresh).unwrap();
    assert_eq!(outcome, EngineOutcome::AwaitingReview);

    let milestone = fx.milestone("m1");
    assert_eq!(milestone.status, MilestoneStatus::AwaitingReview);
    assert_eq!(fx.state().status, ProjectStatus::Sleeping);
    // No merge or tag before the human approves.
    assert!(!git(&fx.root, &["log", "--oneline", "main"]).contains("reviewed feature"));
    assert!(!git(&fx.root, &["tag", "--list"]).contains("milestone-m1"));

    fx.engine(&launcher).finalize_after_approval("m1").unwrap();
    assert_eq!(fx.milestone("m1").status, MilestoneStatus::Completed);
    assert!(git(&fx.root, &["log", "--oneline", "main"]).contains("reviewed feature"));
    assert!(git(&fx.root, &["tag", "--list"]).contains("milestone-m1"));
}

#[test]
fn human_review_flow_reject_reopens_with_reason() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", true);

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![
            Step::Commit { file: "f.rs", message: "feat: first cut" },
            Step::AllComplete,
        ],
        vec![Step::Accept, Step::Accept],
    ));

    let outcome = fx.engine(&launcher).run("m1", EntryPoint::Fresh).unwrap();
    assert_eq!(outcome, EngineOutcome::AwaitingReview);

    let engine = fx.engine(&launcher);
    engine.reopen_after_review_rejection("m1").unwrap();
    let milestone = fx.milestone("m1");
    assert_eq!(milestone.status, MilestoneStatus::InProgress);
    assert_eq!(milestone.consecutive_rejections, 0);
    assert_eq!(fx.state().status, ProjectStatus::Awake);

    let before = launcher.prompts().len();
    launcher.push_dev(vec![
        Step::Commit { file: "g.rs", message: "feat: added Y" },
        Step::AllComplete,
    ]);
    launcher.push_acc(vec![Step::Accept, Step::Accept]);

    let outcome = fx
        .engine(&launcher)
        .run("m1", EntryPoint::HumanReject { reason: "need Y".into() })
        .unwrap();
    assert_eq!(outcome, EngineOutcome::AwaitingReview);

    let prompts = launcher.prompts();
    let (role, text) = &prompts[before];
    assert_eq!(*role, AgentRole::Developer);
    assert!(text.contains("need Y"));
}

// ----------------------------------------------------------------------
// Boundary behaviors
// ----------------------------------------------------------------------

#[test]
fn zero_iteration_budget_pauses_immediately() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    // Shrink the budget to zero.
    let config_path = fx.store.paths().config_file();
    let mut config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
    config["maxIterationsPerMilestone"] = serde_json::json!(0);
    std::fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let launcher = Arc::new(ScriptedLauncher::new(&fx.root, vec![], vec![]));
    let outcome = fx.engine(&launcher).run("m1", EntryPoint::Fresh).unwrap();
    assert!(matches!(outcome, EngineOutcome::Paused { .. }));
    assert_eq!(fx.state().status, ProjectStatus::Paused);
    // No prompt was ever sent.
    assert!(launcher.prompts().is_empty());
}

#[test]
fn dead_developer_counts_as_rejection_and_relaunches() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![
            Step::Die,
            Step::Commit { file: "f.rs", message: "feat: after respawn" },
            Step::AllComplete,
        ],
        vec![Step::Accept, Step::Accept],
    ));

    let outcome = fx.engine(&launcher).run("m1", EntryPoint::Fresh).unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    // One rejection event was recorded for the dead session.
    let rejected = fx
        .events()
        .iter()
        .filter(|e| matches!(e, EventKind::RoundFinished { accepted: false, .. }))
        .count();
    assert_eq!(rejected, 1);
    assert_eq!(fx.milestone("m1").consecutive_rejections, 0);
}

#[test]
fn developer_without_commit_is_rejected() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    // First dev round reports without committing anything.
    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![
            Step::ReportOnly, // reported done, but nothing was committed
            Step::Commit { file: "f.rs", message: "feat: real work" },
            Step::AllComplete,
        ],
        vec![Step::Accept, Step::Accept],
    ));

    let outcome = fx.engine(&launcher).run("m1", EntryPoint::Fresh).unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    let rejected = fx
        .events()
        .iter()
        .filter(|e| matches!(e, EventKind::RoundFinished { accepted: false, .. }))
        .count();
    assert_eq!(rejected, 1);
}

#[test]
fn final_review_rejection_does_not_consume_budget() {
    let fx = Fixture::new();
    fx.add_ready_milestone("m1", false);

    let launcher = Arc::new(ScriptedLauncher::new(
        &fx.root,
        vec![
            Step::Commit { file: "f.rs", message: "feat: almost" },
            Step::AllComplete,
            Step::Commit { file: "g.rs", message: "feat: the rest" },
            Step::AllComplete,
        ],
        vec![
            Step::Accept,               // per-round
            Step::Reject("missing docs"), // final review
            Step::Accept,               // per-round after repair
            Step::Accept,               // final review
        ],
    ));

    let outcome = fx.engine(&launcher).run("m1", EntryPoint::Fresh).unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);
    assert_eq!(fx.milestone("m1").consecutive_rejections, 0);

    // The repair round's developer prompt carried the missing criteria.
    let carried = launcher
        .prompts()
        .iter()
        .any(|(role, text)| *role == AgentRole::Developer && text.contains("missing docs"));
    assert!(carried);
}
