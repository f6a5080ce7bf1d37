//! The application-level project registry.
//!
//! Backs `~/.config/anima/config.json`: which projects Anima manages.
//! Registration validates the path, bootstraps the `.anima/` tree, and
//! survives restarts; removal is explicit and leaves the project's state
//! tree on disk untouched.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use anima_store::initialize_project;
use anima_types::{AnimaError, AppConfig, ProjectRegistration};

/// Loads, mutates, and persists the registry file.
pub struct AppRegistry {
    path: PathBuf,
    config: AppConfig,
}

impl AppRegistry {
    /// Load the registry, defaulting to empty when the file is absent.
    pub fn load(path: PathBuf) -> Result<Self, AnimaError> {
        let config = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| AnimaError::CorruptState {
                path: path.display().to_string(),
                detail: e.to_string(),
                raw: String::from_utf8_lossy(&bytes).into_owned(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(e) => {
                return Err(AnimaError::StoreError(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self { path, config })
    }

    /// All registered projects.
    pub fn projects(&self) -> &[ProjectRegistration] {
        &self.config.projects
    }

    pub fn find(&self, project_id: &str) -> Option<&ProjectRegistration> {
        self.config.find(project_id)
    }

    /// Register a project directory. Validates it is a writable directory,
    /// bootstraps `.anima/`, and persists the registration.
    pub fn register(&mut self, path: &Path) -> Result<ProjectRegistration, AnimaError> {
        let path = path
            .canonicalize()
            .map_err(|e| AnimaError::ConfigError(format!("{}: {e}", path.display())))?;

        if !path.is_dir() {
            return Err(AnimaError::ConfigError(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        if self.config.find_by_path(&path).is_some() {
            return Err(AnimaError::ConfigError(format!(
                "{} is already registered",
                path.display()
            )));
        }

        // Writability probe: the state tree lives inside the project.
        let probe = path.join(".anima-write-probe");
        fs::write(&probe, b"probe")
            .map_err(|e| AnimaError::ConfigError(format!("{} is not writable: {e}", path.display())))?;
        let _ = fs::remove_file(&probe);

        initialize_project(&path)?;

        let registration = ProjectRegistration {
            id: Uuid::new_v4().to_string(),
            display_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            path,
            added_at: Utc::now(),
        };
        self.config.projects.push(registration.clone());
        self.save()?;

        info!(project = registration.id, path = %registration.path.display(), "project registered");
        Ok(registration)
    }

    /// Remove a registration. The project's `.anima/` tree stays on disk.
    pub fn remove(&mut self, project_id: &str) -> Result<ProjectRegistration, AnimaError> {
        let Some(registration) = self.config.find(project_id).cloned() else {
            return Err(AnimaError::ConfigError(format!(
                "unknown project: {project_id}"
            )));
        };
        self.config.remove(project_id);
        self.save()?;
        info!(project = project_id, "project removed from registry");
        Ok(registration)
    }

    fn save(&self) -> Result<(), AnimaError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AnimaError::StoreError(format!("mkdir {}: {e}", parent.display())))?;
        }
        let mut json = serde_json::to_string_pretty(&self.config)
            .map_err(|e| AnimaError::StoreError(format!("serialize registry: {e}")))?;
        json.push('\n');

        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|e| AnimaError::StoreError(format!("create {}: {e}", tmp.display())))?;
        file.write_all(json.as_bytes())
            .map_err(|e| AnimaError::StoreError(format!("write {}: {e}", tmp.display())))?;
        file.sync_all()
            .map_err(|e| AnimaError::StoreError(format!("fsync {}: {e}", tmp.display())))?;
        drop(file);
        fs::rename(&tmp, &self.path)
            .map_err(|e| AnimaError::StoreError(format!("rename {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> AppRegistry {
        AppRegistry::load(dir.join("config.json")).unwrap()
    }

    #[test]
    fn register_creates_state_tree_and_persists() {
        let app_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();

        let mut reg = registry(app_dir.path());
        let registration = reg.register(project_dir.path()).unwrap();
        assert!(!registration.id.is_empty());
        assert!(project_dir.path().join(".anima/state.json").is_file());

        // Survives reload.
        let reg2 = registry(app_dir.path());
        assert_eq!(reg2.projects().len(), 1);
        assert_eq!(reg2.projects()[0].id, registration.id);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let app_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();

        let mut reg = registry(app_dir.path());
        reg.register(project_dir.path()).unwrap();
        assert!(reg.register(project_dir.path()).is_err());
    }

    #[test]
    fn register_missing_path_rejected() {
        let app_dir = tempfile::tempdir().unwrap();
        let mut reg = registry(app_dir.path());
        assert!(reg.register(Path::new("/nonexistent/nope")).is_err());
    }

    #[test]
    fn remove_keeps_state_tree() {
        let app_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();

        let mut reg = registry(app_dir.path());
        let registration = reg.register(project_dir.path()).unwrap();
        reg.remove(&registration.id).unwrap();

        assert!(reg.projects().is_empty());
        assert!(project_dir.path().join(".anima").is_dir());
        assert!(reg.remove(&registration.id).is_err());
    }
}
