//! Error types shared across all Anima crates.

/// Errors that can occur across the Anima runtime.
///
/// Each variant corresponds to a failure class from a different subsystem:
/// configuration, persistence, version control, agent sessions, or the
/// iteration engine itself.
#[derive(Debug, thiserror::Error)]
pub enum AnimaError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Persistence store read/write failure (disk full, permissions, lock).
    #[error("persistence error: {0}")]
    StoreError(String),

    /// Optimistic-concurrency conflict: the file changed since it was read.
    #[error("stale write: {0}")]
    StaleWrite(String),

    /// Malformed JSON on disk. Carries the raw content for diagnostics.
    #[error("corrupt state file {path}: {detail}")]
    CorruptState {
        path: String,
        detail: String,
        raw: String,
    },

    /// A version-control command exited non-zero. Output is verbatim.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitError {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// Agent process host failure (spawn, PTY, I/O).
    #[error("agent session error: {0}")]
    SessionError(String),

    /// The agent child process exited while a send or round was pending.
    #[error("agent session dead: {0}")]
    SessionDead(String),

    /// Unreachable invariant violation inside the iteration engine.
    #[error("engine invariant violated: {0}")]
    EngineError(String),
}

impl AnimaError {
    /// Stable kind string for bus events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AnimaError::ConfigError(_) => "config",
            AnimaError::StoreError(_) => "persistence_io",
            AnimaError::StaleWrite(_) => "persistence_stale",
            AnimaError::CorruptState { .. } => "corrupt_state",
            AnimaError::GitError { .. } => "version_control",
            AnimaError::SessionError(_) => "transient_agent",
            AnimaError::SessionDead(_) => "transient_agent",
            AnimaError::EngineError(_) => "fatal_engine",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            AnimaError::ConfigError("missing field".into()).to_string(),
            "configuration error: missing field"
        );
        assert_eq!(
            AnimaError::StoreError("disk full".into()).to_string(),
            "persistence error: disk full"
        );
        assert_eq!(
            AnimaError::StaleWrite("state.json".into()).to_string(),
            "stale write: state.json"
        );
        assert_eq!(
            AnimaError::SessionDead("developer exited".into()).to_string(),
            "agent session dead: developer exited"
        );
    }

    #[test]
    fn git_error_carries_verbatim_output() {
        let err = AnimaError::GitError {
            command: "merge milestone/m1".into(),
            code: 1,
            stdout: "".into(),
            stderr: "CONFLICT (content): Merge conflict in src/lib.rs".into(),
        };
        let text = err.to_string();
        assert!(text.contains("merge milestone/m1"));
        assert!(text.contains("exit 1"));
        assert!(text.contains("CONFLICT"));
    }

    #[test]
    fn error_kinds_are_stable() {
        assert_eq!(AnimaError::StoreError(String::new()).kind(), "persistence_io");
        assert_eq!(AnimaError::StaleWrite(String::new()).kind(), "persistence_stale");
        assert_eq!(
            AnimaError::CorruptState {
                path: "x".into(),
                detail: "y".into(),
                raw: "z".into()
            }
            .kind(),
            "corrupt_state"
        );
        assert_eq!(AnimaError::EngineError(String::new()).kind(), "fatal_engine");
        assert_eq!(AnimaError::SessionDead(String::new()).kind(), "transient_agent");
    }
}
