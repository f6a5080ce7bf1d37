//! The `.anima/` directory layout and application paths.
//!
//! Every managed project keeps its state under `<project>/.anima/`. The
//! application-level registry lives under the user's config directory.

use std::path::{Path, PathBuf};

/// Directory name of the per-project state tree.
pub const ANIMA_DIR: &str = ".anima";

/// Path helpers for one project's `.anima/` tree.
#[derive(Debug, Clone)]
pub struct AnimaPaths {
    root: PathBuf,
}

impl AnimaPaths {
    /// Create path helpers rooted at a project directory.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            root: project_root.into(),
        }
    }

    /// The project root directory.
    pub fn project_root(&self) -> &Path {
        &self.root
    }

    /// `<project>/.anima/`
    pub fn anima_dir(&self) -> PathBuf {
        self.root.join(ANIMA_DIR)
    }

    /// `<project>/VISION.md` (human-authored, read-only to the core).
    pub fn vision_doc(&self) -> PathBuf {
        self.root.join("VISION.md")
    }

    /// `<project>/.anima/soul.md` (human-authored, read-only to the core).
    pub fn soul_doc(&self) -> PathBuf {
        self.anima_dir().join("soul.md")
    }

    /// `<project>/.anima/state.json`
    pub fn state_file(&self) -> PathBuf {
        self.anima_dir().join("state.json")
    }

    /// `<project>/.anima/config.json`
    pub fn config_file(&self) -> PathBuf {
        self.anima_dir().join("config.json")
    }

    /// `<project>/.anima/anima.lock`
    pub fn lock_file(&self) -> PathBuf {
        self.anima_dir().join("anima.lock")
    }

    /// `<project>/.anima/inbox/`
    pub fn inbox_dir(&self) -> PathBuf {
        self.anima_dir().join("inbox")
    }

    /// `<project>/.anima/inbox/{id}.json`
    pub fn inbox_item(&self, id: &str) -> PathBuf {
        self.inbox_dir().join(format!("{id}.json"))
    }

    /// `<project>/.anima/milestones/`
    pub fn milestones_dir(&self) -> PathBuf {
        self.anima_dir().join("milestones")
    }

    /// `<project>/.anima/milestones/{id}.json`
    pub fn milestone_record(&self, id: &str) -> PathBuf {
        self.milestones_dir().join(format!("{id}.json"))
    }

    /// `<project>/.anima/milestones/{id}.md` (read-only to the core).
    pub fn milestone_doc(&self, doc_path: &str) -> PathBuf {
        self.milestones_dir().join(doc_path)
    }

    /// `<project>/.anima/milestones/order.json`
    pub fn order_file(&self) -> PathBuf {
        self.milestones_dir().join("order.json")
    }

    /// `<project>/.anima/memory/`
    pub fn memory_dir(&self) -> PathBuf {
        self.anima_dir().join("memory")
    }

    /// `<project>/.anima/memory/project.md` (agent-maintained).
    pub fn project_memory(&self) -> PathBuf {
        self.memory_dir().join("project.md")
    }

    /// `<project>/.anima/memory/iterations/`
    pub fn iterations_dir(&self) -> PathBuf {
        self.memory_dir().join("iterations")
    }

    /// `<project>/.anima/memory/iterations/{timestamp}-{milestoneId}.md`
    pub fn iteration_record(&self, timestamp: &str, milestone_id: &str) -> PathBuf {
        self.iterations_dir()
            .join(format!("{timestamp}-{milestone_id}.md"))
    }

    /// `<project>/.anima/logs/`
    pub fn logs_dir(&self) -> PathBuf {
        self.anima_dir().join("logs")
    }

    /// `<project>/.anima/logs/anima.log`
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("anima.log")
    }
}

/// Application config directory (`~/.config/anima`).
pub fn app_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".config").join("anima")
}

/// Application registry file (`~/.config/anima/config.json`).
pub fn app_config_file() -> PathBuf {
    app_config_dir().join("config.json")
}

/// Control socket path (`~/.config/anima/anima.sock`).
pub fn control_socket_path() -> PathBuf {
    app_config_dir().join("anima.sock")
}

/// Application-level log file (`~/.config/anima/anima.log`).
pub fn app_log_file() -> PathBuf {
    app_config_dir().join("anima.log")
}
