//! Wire protocol for the control socket.
//!
//! NDJSON over a Unix domain socket: one JSON command per line, one JSON
//! response per line. `subscribe_events` switches the connection into a
//! one-way event stream.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use anima_types::ProjectRegistration;

use crate::supervisor::ProjectSnapshot;

/// A command from a control client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    RegisterProject { path: PathBuf },
    RemoveProject { project_id: String },
    ListProjects,
    GetProjectSnapshot { project_id: String },
    WakeNow { project_id: String },
    Pause { project_id: String },
    Resume { project_id: String },
    CancelMilestone { project_id: String, milestone_id: String },
    ApproveAwaitingReview { project_id: String, milestone_id: String },
    RejectAwaitingReview {
        project_id: String,
        milestone_id: String,
        reason: String,
    },
    ProvideHumanGuidance { project_id: String, text: String },
    /// Switch this connection to a one-way event stream.
    SubscribeEvents {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
    },
}

/// A response to a control client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },
    Error { message: String },
}

/// Payloads carried on successful responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Registration(ProjectRegistration),
    Projects(Vec<ProjectRegistration>),
    Snapshot(Box<ProjectSnapshot>),
}

impl ControlResponse {
    pub fn ok() -> Self {
        ControlResponse::Ok { data: None }
    }

    pub fn with_data(data: ResponseData) -> Self {
        ControlResponse::Ok { data: Some(data) }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format() {
        let json = r#"{"command":"wake_now","projectId":"p1"}"#;
        // Commands use snake_case tags and camelCase fields.
        let parsed: Result<ControlCommand, _> = serde_json::from_str(json);
        assert!(parsed.is_err(), "field casing should be snake_case");

        let json = r#"{"command":"wake_now","project_id":"p1"}"#;
        let cmd: ControlCommand = serde_json::from_str(json).unwrap();
        assert!(matches!(cmd, ControlCommand::WakeNow { project_id } if project_id == "p1"));
    }

    #[test]
    fn command_roundtrip() {
        let commands = vec![
            ControlCommand::RegisterProject {
                path: PathBuf::from("/work/proj"),
            },
            ControlCommand::ListProjects,
            ControlCommand::CancelMilestone {
                project_id: "p1".into(),
                milestone_id: "m1".into(),
            },
            ControlCommand::RejectAwaitingReview {
                project_id: "p1".into(),
                milestone_id: "m1".into(),
                reason: "need Y".into(),
            },
            ControlCommand::SubscribeEvents { project_id: None },
            ControlCommand::SubscribeEvents {
                project_id: Some("p1".into()),
            },
        ];
        for cmd in commands {
            let json = serde_json::to_string(&cmd).unwrap();
            let back: ControlCommand = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&back).unwrap();
            assert_eq!(json, json2);
        }
    }

    #[test]
    fn response_shapes() {
        let ok = serde_json::to_string(&ControlResponse::ok()).unwrap();
        assert_eq!(ok, r#"{"status":"ok"}"#);

        let err = serde_json::to_string(&ControlResponse::error("nope")).unwrap();
        assert!(err.contains(r#""status":"error""#));
        assert!(err.contains("nope"));
    }
}
