//! Versioned, atomic JSON persistence.
//!
//! Every read returns the deserialized value plus an opaque [`Version`]
//! token (a digest of the file bytes). A write that passes a stale token
//! fails with `StaleWrite` and the caller re-reads. Single-file writes are
//! atomic: serialize to a temp sibling, flush to disk, then rename over the
//! target. The cross-file invariant between `state.json` and the current
//! milestone record is maintained by writing the milestone file first,
//! inside the project lock.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use anima_types::{
    AnimaError, AnimaPaths, InboxItem, Milestone, MilestoneOrder, ProjectConfig, ProjectState,
};

use crate::lock::ProjectLock;

/// Opaque version token for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(String);

impl Version {
    /// Version of a file that does not exist yet.
    pub fn absent() -> Self {
        Version(String::new())
    }

    fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Version(format!("{:x}", hasher.finalize()))
    }
}

/// A value read from disk together with its version token.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Persistence store for one project's `.anima/` tree.
pub struct ProjectStore {
    paths: AnimaPaths,
}

impl ProjectStore {
    /// Create a store rooted at a project directory.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            paths: AnimaPaths::new(project_root),
        }
    }

    /// Path helpers for this project.
    pub fn paths(&self) -> &AnimaPaths {
        &self.paths
    }

    /// Acquire the advisory project lock. Held for the duration of the
    /// returned guard; serializes multi-file updates per project.
    pub fn lock(&self) -> Result<ProjectLock, AnimaError> {
        ProjectLock::acquire(&self.paths.lock_file())
    }

    /// Run a closure while holding the project lock.
    pub fn with_project_lock<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, AnimaError>,
    ) -> Result<T, AnimaError> {
        let _guard = self.lock()?;
        f(self)
    }

    // ------------------------------------------------------------------
    // Project state
    // ------------------------------------------------------------------

    /// Read `state.json`, defaulting to a fresh state when absent.
    pub fn read_project_state(&self) -> Result<Versioned<ProjectState>, AnimaError> {
        self.read_or_default(&self.paths.state_file())
    }

    /// Write `state.json`, failing on a stale version token.
    pub fn write_project_state(
        &self,
        state: &ProjectState,
        expected: &Version,
    ) -> Result<Version, AnimaError> {
        self.write_json(&self.paths.state_file(), state, expected)
    }

    // ------------------------------------------------------------------
    // Milestones
    // ------------------------------------------------------------------

    /// Read a milestone record.
    pub fn read_milestone(&self, id: &str) -> Result<Versioned<Milestone>, AnimaError> {
        self.read_required(&self.paths.milestone_record(id))
    }

    /// Write a milestone record, failing on a stale version token.
    pub fn write_milestone(
        &self,
        milestone: &Milestone,
        expected: &Version,
    ) -> Result<Version, AnimaError> {
        self.write_json(&self.paths.milestone_record(&milestone.id), milestone, expected)
    }

    /// Write the milestone record and then the project state, in that order,
    /// under the project lock. This is the only way the cross-file pair is
    /// allowed to change, so no observer ever sees a mismatched combination.
    pub fn write_milestone_and_state(
        &self,
        milestone: &Milestone,
        milestone_version: &Version,
        state: &ProjectState,
        state_version: &Version,
    ) -> Result<(Version, Version), AnimaError> {
        state.check_invariant()?;
        let _guard = self.lock()?;
        let mv = self.write_json(
            &self.paths.milestone_record(&milestone.id),
            milestone,
            milestone_version,
        )?;
        let sv = self.write_json(&self.paths.state_file(), state, state_version)?;
        Ok((mv, sv))
    }

    /// Read the milestone document (markdown). Read-only to the core.
    pub fn read_milestone_doc(&self, doc_path: &str) -> Result<String, AnimaError> {
        let path = self.paths.milestone_doc(doc_path);
        fs::read_to_string(&path)
            .map_err(|e| AnimaError::StoreError(format!("read {}: {e}", path.display())))
    }

    // ------------------------------------------------------------------
    // Inbox
    // ------------------------------------------------------------------

    /// Read a single inbox item.
    pub fn read_inbox_item(&self, id: &str) -> Result<Versioned<InboxItem>, AnimaError> {
        self.read_required(&self.paths.inbox_item(id))
    }

    /// Write an inbox item, failing on a stale version token.
    pub fn write_inbox_item(
        &self,
        item: &InboxItem,
        expected: &Version,
    ) -> Result<Version, AnimaError> {
        self.write_json(&self.paths.inbox_item(&item.id), item, expected)
    }

    /// List all inbox items. Corrupt entries are skipped with a warning so
    /// one bad file cannot hide the rest of the inbox.
    pub fn list_inbox_items(&self) -> Result<Vec<InboxItem>, AnimaError> {
        let dir = self.paths.inbox_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir)
            .map_err(|e| AnimaError::StoreError(format!("read_dir {}: {e}", dir.display())))?;

        let mut items = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| AnimaError::StoreError(format!("read_dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match self.read_required::<InboxItem>(&path) {
                Ok(v) => items.push(v.value),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable inbox item"),
            }
        }
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Order
    // ------------------------------------------------------------------

    /// Read `order.json`, defaulting to an empty order when absent.
    pub fn read_order(&self) -> Result<Versioned<MilestoneOrder>, AnimaError> {
        self.read_or_default(&self.paths.order_file())
    }

    /// Write `order.json`, failing on a stale version token.
    pub fn write_order(
        &self,
        order: &MilestoneOrder,
        expected: &Version,
    ) -> Result<Version, AnimaError> {
        self.write_json(&self.paths.order_file(), order, expected)
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    /// Read `config.json`, defaulting when absent. The core never writes it.
    pub fn read_config(&self) -> Result<ProjectConfig, AnimaError> {
        let config: ProjectConfig = self.read_or_default(&self.paths.config_file())?.value;
        config.validate()?;
        Ok(config)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn read_required<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Versioned<T>, AnimaError> {
        let bytes = fs::read(path)
            .map_err(|e| AnimaError::StoreError(format!("read {}: {e}", path.display())))?;
        self.parse(path, bytes)
    }

    fn read_or_default<T: serde::de::DeserializeOwned + Default>(
        &self,
        path: &Path,
    ) -> Result<Versioned<T>, AnimaError> {
        match fs::read(path) {
            Ok(bytes) => self.parse(path, bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Versioned {
                value: T::default(),
                version: Version::absent(),
            }),
            Err(e) => Err(AnimaError::StoreError(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
        bytes: Vec<u8>,
    ) -> Result<Versioned<T>, AnimaError> {
        let version = Version::of_bytes(&bytes);
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Versioned { value, version }),
            Err(e) => {
                let quarantined = self.quarantine(path);
                Err(AnimaError::CorruptState {
                    path: quarantined
                        .unwrap_or_else(|| path.to_path_buf())
                        .display()
                        .to_string(),
                    detail: e.to_string(),
                    raw: String::from_utf8_lossy(&bytes).into_owned(),
                })
            }
        }
    }

    /// Rename a corrupt file aside with a timestamped suffix so it can be
    /// inspected later. Returns the quarantine path when the rename worked.
    fn quarantine(&self, path: &Path) -> Option<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let name = path.file_name()?.to_string_lossy();
        let target = path.with_file_name(format!("{name}.corrupt-{stamp}"));
        match fs::rename(path, &target) {
            Ok(()) => {
                warn!(from = %path.display(), to = %target.display(), "quarantined corrupt state file");
                Some(target)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to quarantine corrupt file");
                None
            }
        }
    }

    fn current_version(&self, path: &Path) -> Result<Version, AnimaError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Version::of_bytes(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Version::absent()),
            Err(e) => Err(AnimaError::StoreError(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    fn write_json<T: serde::Serialize>(
        &self,
        path: &Path,
        value: &T,
        expected: &Version,
    ) -> Result<Version, AnimaError> {
        let current = self.current_version(path)?;
        if &current != expected {
            return Err(AnimaError::StaleWrite(format!(
                "{} changed since it was read",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AnimaError::StoreError(format!("mkdir {}: {e}", parent.display())))?;
        }

        let mut json = serde_json::to_string_pretty(value)
            .map_err(|e| AnimaError::StoreError(format!("serialize {}: {e}", path.display())))?;
        json.push('\n');

        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|e| AnimaError::StoreError(format!("create {}: {e}", tmp.display())))?;
        file.write_all(json.as_bytes())
            .map_err(|e| AnimaError::StoreError(format!("write {}: {e}", tmp.display())))?;
        // Flush file data to disk before the rename makes it visible.
        file.sync_all()
            .map_err(|e| AnimaError::StoreError(format!("fsync {}: {e}", tmp.display())))?;
        drop(file);

        fs::rename(&tmp, path)
            .map_err(|e| AnimaError::StoreError(format!("rename {}: {e}", path.display())))?;

        Ok(Version::of_bytes(json.as_bytes()))
    }
}
