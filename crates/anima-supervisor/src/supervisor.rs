//! The supervisor: process-wide owner of registered projects.
//!
//! Initialized once at startup and torn down at shutdown; all per-project
//! state is reachable through it. Control-API methods are safe to call from
//! any thread: fast mutations go through per-project control flags, slower
//! ones through the worker mailboxes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use anima_engine::controls::EventSink;
use anima_engine::{
    AgentLauncher, CancellationToken, Clock, IterationEngine, ProjectCommand, SystemClock,
};
use anima_store::ProjectStore;
use anima_types::{
    AnimaError, AnimaEvent, EventKind, Milestone, MilestoneStatus, ProjectRegistration,
    ProjectState,
};

use crate::bus::{EventBus, EventStream};
use crate::registry::AppRegistry;
use crate::worker::ProjectWorker;

/// Worker join grace on shutdown/removal.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// A point-in-time view of one project for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub registration: ProjectRegistration,
    pub state: ProjectState,
    pub milestones: Vec<Milestone>,
}

/// The process-wide supervisor.
pub struct Supervisor {
    registry: Mutex<AppRegistry>,
    workers: Mutex<HashMap<String, ProjectWorker>>,
    bus: Arc<EventBus>,
    launcher: Arc<dyn AgentLauncher>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Load the registry and construct the supervisor. Workers are spawned
    /// by [`Supervisor::start`].
    pub fn new(
        registry_path: PathBuf,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Result<Arc<Self>, AnimaError> {
        let registry = AppRegistry::load(registry_path)?;
        Ok(Arc::new(Self {
            registry: Mutex::new(registry),
            workers: Mutex::new(HashMap::new()),
            bus: EventBus::new(),
            launcher,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Spawn a worker for every registered project (startup). Each worker
    /// runs crash recovery before its first check.
    pub fn start(&self) -> Result<(), AnimaError> {
        let registrations: Vec<ProjectRegistration> = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .projects()
            .to_vec();

        for registration in registrations {
            if let Err(e) = self.spawn_worker(registration) {
                warn!(error = %e, "worker failed to start");
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, registration: ProjectRegistration) -> Result<(), AnimaError> {
        let project_id = registration.id.clone();
        let worker = ProjectWorker::spawn(
            registration,
            self.sink_for(&project_id),
            Arc::clone(&self.launcher),
            Arc::clone(&self.clock),
        )?;
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(project_id, worker);
        Ok(())
    }

    fn sink_for(&self, project_id: &str) -> EventSink {
        let bus = Arc::clone(&self.bus);
        let project_id = project_id.to_string();
        Arc::new(move |kind: EventKind| {
            bus.publish(AnimaEvent::new(&project_id, kind));
        })
    }

    // ------------------------------------------------------------------
    // Control API
    // ------------------------------------------------------------------

    /// Register a project and start supervising it immediately.
    pub fn register_project(&self, path: &Path) -> Result<ProjectRegistration, AnimaError> {
        let registration = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .register(path)?;
        self.spawn_worker(registration.clone())?;
        Ok(registration)
    }

    /// Stop supervising a project and drop its registration. The on-disk
    /// state tree is left untouched.
    pub fn remove_project(&self, project_id: &str) -> Result<(), AnimaError> {
        if let Some(mut worker) = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(project_id)
        {
            worker.stop(STOP_GRACE);
        }
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(project_id)
            .map(|_| ())
    }

    /// All registered projects.
    pub fn list_projects(&self) -> Vec<ProjectRegistration> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .projects()
            .to_vec()
    }

    /// Read a consistent snapshot of one project's state and milestones.
    pub fn get_project_snapshot(&self, project_id: &str) -> Result<ProjectSnapshot, AnimaError> {
        let registration = self.registration(project_id)?;
        let store = ProjectStore::new(&registration.path);

        let (state, milestones) = store.with_project_lock(|s| {
            let state = s.read_project_state()?.value;
            let mut milestones = Vec::new();
            let dir = s.paths().milestones_dir();
            if dir.exists() {
                for entry in std::fs::read_dir(&dir)
                    .map_err(|e| AnimaError::StoreError(format!("read_dir {}: {e}", dir.display())))?
                    .flatten()
                {
                    let path = entry.path();
                    let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    if path.extension().and_then(|s| s.to_str()) != Some("json")
                        || name == "order"
                    {
                        continue;
                    }
                    match s.read_milestone(name) {
                        Ok(v) => milestones.push(v.value),
                        Err(e) => warn!(milestone = name, error = %e, "snapshot skipping milestone"),
                    }
                }
            }
            milestones.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok((state, milestones))
        })?;

        Ok(ProjectSnapshot {
            registration,
            state,
            milestones,
        })
    }

    /// Trigger an immediate check for ready milestones.
    pub fn wake_now(&self, project_id: &str) -> Result<(), AnimaError> {
        self.send(project_id, ProjectCommand::WakeNow)
    }

    /// Pause the project, interrupting any in-flight round.
    pub fn pause(&self, project_id: &str) -> Result<(), AnimaError> {
        self.with_worker(project_id, |worker| {
            worker.controls.request_pause();
            Ok(())
        })
    }

    /// Resume a paused project.
    pub fn resume(&self, project_id: &str) -> Result<(), AnimaError> {
        self.send(project_id, ProjectCommand::Resume { guidance: None })
    }

    /// Cancel a milestone. In-flight work is interrupted and the branch is
    /// rolled back to its base commit.
    pub fn cancel_milestone(&self, project_id: &str, milestone_id: &str) -> Result<(), AnimaError> {
        let registration = self.registration(project_id)?;
        let store = ProjectStore::new(&registration.path);
        let milestone = store.read_milestone(milestone_id)?.value;
        let state = store.read_project_state()?.value;

        match milestone.status {
            MilestoneStatus::InProgress
                if state.current_milestone_id.as_deref() == Some(milestone_id) =>
            {
                // The worker owns it (running, paused, or rate-limited):
                // the flag interrupts whatever wait it is in.
                self.with_worker(project_id, |worker| {
                    worker.controls.request_cancel();
                    Ok(())
                })
            }
            MilestoneStatus::AwaitingReview => {
                self.make_engine(&registration)?.cancel_idle(milestone_id)
            }
            other => Err(AnimaError::EngineError(format!(
                "milestone {milestone_id} cannot be cancelled from status {other}"
            ))),
        }
    }

    /// Approve an awaiting-review milestone: merge, tag, complete.
    pub fn approve_awaiting_review(
        &self,
        project_id: &str,
        milestone_id: &str,
    ) -> Result<(), AnimaError> {
        self.send(
            project_id,
            ProjectCommand::Approve {
                milestone_id: milestone_id.to_string(),
            },
        )
    }

    /// Reject an awaiting-review milestone back to the developer.
    pub fn reject_awaiting_review(
        &self,
        project_id: &str,
        milestone_id: &str,
        reason: &str,
    ) -> Result<(), AnimaError> {
        self.send(
            project_id,
            ProjectCommand::Reject {
                milestone_id: milestone_id.to_string(),
                reason: reason.to_string(),
            },
        )
    }

    /// Queue guidance text for the project's next developer prompt.
    pub fn provide_human_guidance(&self, project_id: &str, text: &str) -> Result<(), AnimaError> {
        self.send(
            project_id,
            ProjectCommand::Guidance {
                text: text.to_string(),
            },
        )
    }

    /// Subscribe to events for one project, or all of them.
    pub fn subscribe_events(&self, project_id: Option<&str>) -> EventStream {
        self.bus.subscribe(project_id)
    }

    /// Cancel everything, flush state, and join all workers.
    pub fn shutdown(&self) {
        info!("supervisor shutting down");
        self.shutdown.cancel();

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, worker) in workers.iter_mut() {
            worker.stop(STOP_GRACE);
        }
        workers.clear();
    }

    /// The process-wide shutdown token (observed by the control server).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn registration(&self, project_id: &str) -> Result<ProjectRegistration, AnimaError> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .find(project_id)
            .cloned()
            .ok_or_else(|| AnimaError::ConfigError(format!("unknown project: {project_id}")))
    }

    fn send(&self, project_id: &str, command: ProjectCommand) -> Result<(), AnimaError> {
        self.with_worker(project_id, |worker| worker.send(command.clone()))
    }

    fn with_worker<T>(
        &self,
        project_id: &str,
        f: impl Fn(&ProjectWorker) -> Result<T, AnimaError>,
    ) -> Result<T, AnimaError> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let worker = workers
            .get(project_id)
            .ok_or_else(|| AnimaError::ConfigError(format!("unknown project: {project_id}")))?;
        f(worker)
    }

    fn make_engine(&self, registration: &ProjectRegistration) -> Result<IterationEngine, AnimaError> {
        let store = ProjectStore::new(&registration.path);
        let config = store.read_config()?;
        let controls = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&registration.id)
            .map(|w| Arc::clone(&w.controls))
            .ok_or_else(|| AnimaError::ConfigError(format!("unknown project: {}", registration.id)))?;

        Ok(IterationEngine::new(
            &registration.id,
            &registration.path,
            config,
            controls,
            self.sink_for(&registration.id),
            Arc::clone(&self.launcher),
            Arc::clone(&self.clock),
        ))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown();
        }
    }
}
