//! Per-project worker threads.
//!
//! One thread per registered project runs its wake scheduler. The worker
//! owns the command channel and control flags; stopping cancels the
//! worker's token and joins with a bounded wait so a hung project can never
//! wedge the supervisor.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use anima_engine::controls::EventSink;
use anima_engine::{
    AgentLauncher, CancellationToken, Clock, ProjectCommand, ProjectControls, WakeScheduler,
};
use anima_types::{AnimaError, ProjectRegistration};

/// Handle to one project's scheduler thread.
pub struct ProjectWorker {
    pub registration: ProjectRegistration,
    pub controls: Arc<ProjectControls>,
    commands: Sender<ProjectCommand>,
    stop_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProjectWorker {
    /// Spawn the scheduler thread for a registered project.
    pub fn spawn(
        registration: ProjectRegistration,
        events: EventSink,
        launcher: Arc<dyn AgentLauncher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AnimaError> {
        let stop_token = CancellationToken::new();
        let controls = ProjectControls::new(stop_token.clone());
        let (tx, rx) = mpsc::channel();

        let scheduler = WakeScheduler::new(
            &registration.id,
            registration.path.clone(),
            Arc::clone(&controls),
            rx,
            events,
            launcher,
            clock,
        );

        let thread_name = format!("project-{}", registration.id);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || scheduler.run())
            .map_err(|e| AnimaError::EngineError(format!("spawn worker thread: {e}")))?;

        info!(project = registration.id, "project worker started");
        Ok(Self {
            registration,
            controls,
            commands: tx,
            stop_token,
            handle: Some(handle),
        })
    }

    /// Send a command to the scheduler's mailbox.
    pub fn send(&self, command: ProjectCommand) -> Result<(), AnimaError> {
        self.commands.send(command).map_err(|_| {
            AnimaError::EngineError(format!(
                "worker for project {} is gone",
                self.registration.id
            ))
        })
    }

    /// Stop the worker: cancel its token and join with a bounded wait.
    pub fn stop(&mut self, grace: Duration) {
        self.stop_token.cancel();

        let Some(handle) = self.handle.take() else {
            return;
        };

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(50));
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                error!(project = self.registration.id, "worker thread panicked");
            } else {
                info!(project = self.registration.id, "project worker stopped");
            }
        } else {
            // Detach rather than wedge the supervisor on a hung worker.
            warn!(project = self.registration.id, "worker did not stop in time, detaching");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}
