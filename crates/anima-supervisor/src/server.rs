//! Control socket server.
//!
//! A current-thread tokio runtime on a background thread serves NDJSON
//! commands over a Unix domain socket. The supervisor is thread-safe, so
//! handlers call it directly; `subscribe_events` turns the connection into
//! a one-way stream pumped from the bus by a bridge thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use anima_types::AnimaError;

use crate::control::{ControlCommand, ControlResponse, ResponseData};
use crate::supervisor::Supervisor;

/// Spawn the control server on a background thread. It stops when the
/// supervisor's shutdown token fires.
pub fn spawn_control_server(
    socket_path: PathBuf,
    supervisor: Arc<Supervisor>,
) -> Result<std::thread::JoinHandle<()>, AnimaError> {
    std::thread::Builder::new()
        .name("control-server".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "control server runtime failed to start");
                    return;
                }
            };
            rt.block_on(serve(&socket_path, supervisor));
        })
        .map_err(|e| AnimaError::ConfigError(format!("spawn control server: {e}")))
}

async fn serve(socket_path: &Path, supervisor: Arc<Supervisor>) {
    if let Some(parent) = socket_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(error = %e, "failed to create socket directory");
            return;
        }
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }

    let listener = match UnixListener::bind(socket_path) {
        Ok(l) => l,
        Err(e) => {
            warn!(path = %socket_path.display(), error = %e, "failed to bind control socket");
            return;
        }
    };
    info!(path = %socket_path.display(), "control socket listening");

    let shutdown = supervisor.shutdown_token();
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        // Accept with a timeout so the shutdown flag is observed.
        let accept = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            listener.accept(),
        )
        .await;

        match accept {
            Ok(Ok((stream, _addr))) => {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, supervisor).await {
                        debug!(error = %e, "control connection ended");
                    }
                });
            }
            Ok(Err(e)) => warn!(error = %e, "control socket accept error"),
            Err(_) => {} // timeout; re-check shutdown
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!("control socket stopped");
}

async fn handle_connection(
    stream: tokio::net::UnixStream,
    supervisor: Arc<Supervisor>,
) -> Result<(), String> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await.map_err(|e| e.to_string())? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let command: ControlCommand = match serde_json::from_str(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                write_response(&mut writer, &ControlResponse::error(format!("invalid JSON: {e}")))
                    .await?;
                continue;
            }
        };

        // Subscriptions consume the connection.
        let command = match command {
            ControlCommand::SubscribeEvents { project_id } => {
                return stream_events(writer, supervisor, project_id).await;
            }
            other => other,
        };

        let response = dispatch(&supervisor, command);
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

fn dispatch(supervisor: &Supervisor, command: ControlCommand) -> ControlResponse {
    let result = match command {
        ControlCommand::RegisterProject { path } => supervisor
            .register_project(&path)
            .map(|r| Some(ResponseData::Registration(r))),
        ControlCommand::RemoveProject { project_id } => {
            supervisor.remove_project(&project_id).map(|()| None)
        }
        ControlCommand::ListProjects => {
            Ok(Some(ResponseData::Projects(supervisor.list_projects())))
        }
        ControlCommand::GetProjectSnapshot { project_id } => supervisor
            .get_project_snapshot(&project_id)
            .map(|s| Some(ResponseData::Snapshot(Box::new(s)))),
        ControlCommand::WakeNow { project_id } => supervisor.wake_now(&project_id).map(|()| None),
        ControlCommand::Pause { project_id } => supervisor.pause(&project_id).map(|()| None),
        ControlCommand::Resume { project_id } => supervisor.resume(&project_id).map(|()| None),
        ControlCommand::CancelMilestone {
            project_id,
            milestone_id,
        } => supervisor
            .cancel_milestone(&project_id, &milestone_id)
            .map(|()| None),
        ControlCommand::ApproveAwaitingReview {
            project_id,
            milestone_id,
        } => supervisor
            .approve_awaiting_review(&project_id, &milestone_id)
            .map(|()| None),
        ControlCommand::RejectAwaitingReview {
            project_id,
            milestone_id,
            reason,
        } => supervisor
            .reject_awaiting_review(&project_id, &milestone_id, &reason)
            .map(|()| None),
        ControlCommand::ProvideHumanGuidance { project_id, text } => supervisor
            .provide_human_guidance(&project_id, &text)
            .map(|()| None),
        ControlCommand::SubscribeEvents { .. } => {
            unreachable!("subscriptions are handled by the connection loop")
        }
    };

    match result {
        Ok(Some(data)) => ControlResponse::with_data(data),
        Ok(None) => ControlResponse::ok(),
        Err(e) => ControlResponse::error(e.to_string()),
    }
}

/// Pump bus events to the client as NDJSON until it disconnects.
async fn stream_events(
    mut writer: tokio::net::unix::OwnedWriteHalf,
    supervisor: Arc<Supervisor>,
    project_id: Option<String>,
) -> Result<(), String> {
    let stream = supervisor.subscribe_events(project_id.as_deref());
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);

    // Bridge the blocking bus iterator into the async writer.
    std::thread::Builder::new()
        .name("event-bridge".into())
        .spawn(move || {
            for event in stream {
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| e.to_string())?;

    while let Some(event) = rx.recv().await {
        let mut json = serde_json::to_string(&event).map_err(|e| e.to_string())?;
        json.push('\n');
        if writer.write_all(json.as_bytes()).await.is_err() {
            break; // client went away; bridge thread unwinds on next send
        }
    }

    Ok(())
}

async fn write_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &ControlResponse,
) -> Result<(), String> {
    let mut json = serde_json::to_string(response).map_err(|e| e.to_string())?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| e.to_string())
}
