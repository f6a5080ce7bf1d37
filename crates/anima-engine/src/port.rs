//! The seam between the iteration engine and agent sessions.
//!
//! The engine only talks to [`AgentPort`], so loop tests can script verdicts
//! without spawning processes. Production ports are [`AgentHost`] PTY
//! sessions created by a launcher that knows the agent CLI invocation.

use std::path::Path;
use std::time::Duration;

use anima_agent::{AgentHost, RoundOutcome, StreamItem};
use anima_types::{AgentRole, AnimaError};

use crate::cancel::CancellationToken;
use crate::prompts;

/// One role's interactive session, as the engine sees it.
pub trait AgentPort: Send {
    /// Send one input frame.
    fn send_frame(&mut self, text: &str) -> Result<(), AnimaError>;

    /// Wait for the round to conclude, mirroring output to `sink`.
    fn collect_round(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
        sink: &mut dyn FnMut(StreamItem),
    ) -> Result<RoundOutcome, AnimaError>;

    /// Graceful shutdown with grace-period escalation.
    fn close(&mut self);

    /// Forced shutdown.
    fn kill(&mut self);

    /// Whether the session child is alive.
    fn is_alive(&self) -> bool;
}

impl AgentPort for AgentHost {
    fn send_frame(&mut self, text: &str) -> Result<(), AnimaError> {
        AgentHost::send_frame(self, text)
    }

    fn collect_round(
        &mut self,
        deadline: Duration,
        cancel: &CancellationToken,
        sink: &mut dyn FnMut(StreamItem),
    ) -> Result<RoundOutcome, AnimaError> {
        let token = cancel.clone();
        AgentHost::collect_round(self, deadline, &move || token.is_cancelled(), sink)
    }

    fn close(&mut self) {
        AgentHost::close(self)
    }

    fn kill(&mut self) {
        AgentHost::kill(self)
    }

    fn is_alive(&self) -> bool {
        matches!(self.health(), anima_agent::HealthStatus::Alive { .. })
    }
}

/// Creates agent sessions for a project. One launcher per supervisor; the
/// agent command path lives here, not in project state.
pub trait AgentLauncher: Send + Sync {
    fn launch(
        &self,
        role: AgentRole,
        project_root: &Path,
    ) -> Result<Box<dyn AgentPort>, AnimaError>;
}

/// Launches the configured agent CLI in a PTY with a role system prompt.
pub struct CliAgentLauncher {
    command: String,
    base_args: Vec<String>,
}

impl CliAgentLauncher {
    pub fn new(command: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            base_args,
        }
    }
}

impl AgentLauncher for CliAgentLauncher {
    fn launch(
        &self,
        role: AgentRole,
        project_root: &Path,
    ) -> Result<Box<dyn AgentPort>, AnimaError> {
        let mut args = self.base_args.clone();
        args.push("--system-prompt".into());
        args.push(prompts::system_prompt(role).to_string());

        let host = AgentHost::spawn(
            &role.to_string(),
            &self.command,
            &args,
            project_root,
            &[],
        )?;
        Ok(Box::new(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_launcher_passes_role_prompt() {
        // Launch a trivially-exiting command and only assert the spawn path.
        let launcher = CliAgentLauncher::new("/bin/true", vec![]);
        let port = launcher.launch(AgentRole::Developer, Path::new("/tmp"));
        assert!(port.is_ok());
    }
}
