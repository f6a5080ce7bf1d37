//! Application-level project registry.
//!
//! The global `config.json` lists every project Anima manages. Registrations
//! survive restarts; removal is always explicit.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One registered project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRegistration {
    /// Stable identifier, assigned at registration.
    pub id: String,
    /// Absolute path of the project root.
    pub path: PathBuf,
    /// Human-readable name shown in UIs.
    pub display_name: String,
    pub added_at: DateTime<Utc>,
}

/// The application registry (`~/.config/anima/config.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub projects: Vec<ProjectRegistration>,
    /// UI theme preference; opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl AppConfig {
    /// Look up a registration by project id.
    pub fn find(&self, project_id: &str) -> Option<&ProjectRegistration> {
        self.projects.iter().find(|p| p.id == project_id)
    }

    /// Look up a registration by project path.
    pub fn find_by_path(&self, path: &std::path::Path) -> Option<&ProjectRegistration> {
        self.projects.iter().find(|p| p.path == path)
    }

    /// Remove a registration by id. Returns true if one was removed.
    pub fn remove(&mut self, project_id: &str) -> bool {
        let before = self.projects.len();
        self.projects.retain(|p| p.id != project_id);
        self.projects.len() < before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(id: &str, path: &str) -> ProjectRegistration {
        ProjectRegistration {
            id: id.into(),
            path: PathBuf::from(path),
            display_name: id.into(),
            added_at: Utc::now(),
        }
    }

    #[test]
    fn find_and_remove() {
        let mut config = AppConfig::default();
        config.projects.push(reg("p1", "/work/one"));
        config.projects.push(reg("p2", "/work/two"));

        assert!(config.find("p1").is_some());
        assert!(config.find_by_path(std::path::Path::new("/work/two")).is_some());
        assert!(config.find("p3").is_none());

        assert!(config.remove("p1"));
        assert!(!config.remove("p1"));
        assert_eq!(config.projects.len(), 1);
    }

    #[test]
    fn empty_config_parses() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert!(config.projects.is_empty());
        assert!(config.theme.is_none());
    }

    #[test]
    fn registry_roundtrip() {
        let mut config = AppConfig::default();
        config.projects.push(reg("p1", "/work/one"));
        config.theme = Some("dark".into());

        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.projects.len(), 1);
        assert_eq!(back.projects[0].id, "p1");
        assert_eq!(back.theme.as_deref(), Some("dark"));
    }
}
