//! Project skeleton initialization.
//!
//! Called when a project is registered: creates the `.anima/` tree and
//! writes a default state and config if none exist. Human-authored files
//! (VISION.md, soul.md, milestone documents) are never created or touched.

use std::path::Path;

use tracing::info;

use anima_types::{AnimaError, AnimaPaths, ProjectConfig, ProjectState};

use crate::store::ProjectStore;

/// Ensure the `.anima/` tree exists for a project, creating default state
/// and config files if absent. Idempotent.
pub fn initialize_project(project_root: &Path) -> Result<(), AnimaError> {
    if !project_root.is_dir() {
        return Err(AnimaError::ConfigError(format!(
            "project path {} is not a directory",
            project_root.display()
        )));
    }

    let paths = AnimaPaths::new(project_root);
    for dir in [
        paths.anima_dir(),
        paths.inbox_dir(),
        paths.milestones_dir(),
        paths.memory_dir(),
        paths.iterations_dir(),
        paths.logs_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .map_err(|e| AnimaError::StoreError(format!("mkdir {}: {e}", dir.display())))?;
    }

    let store = ProjectStore::new(project_root);

    if !paths.state_file().exists() {
        let read = store.read_project_state()?;
        store.write_project_state(&read.value, &read.version)?;
    }

    if !paths.config_file().exists() {
        let name = project_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let config = ProjectConfig {
            name,
            ..Default::default()
        };
        write_default_config(&paths, &config)?;
    }

    info!(project = %project_root.display(), "project state tree initialized");
    Ok(())
}

fn write_default_config(paths: &AnimaPaths, config: &ProjectConfig) -> Result<(), AnimaError> {
    let path = paths.config_file();
    let mut json = serde_json::to_string_pretty(config)
        .map_err(|e| AnimaError::StoreError(format!("serialize config: {e}")))?;
    json.push('\n');
    std::fs::write(&path, json)
        .map_err(|e| AnimaError::StoreError(format!("write {}: {e}", path.display())))
}

/// A default state value, for callers that need one without touching disk.
pub fn default_state() -> ProjectState {
    ProjectState::default()
}
