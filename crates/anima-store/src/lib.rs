//! Durable persistence for a project's `.anima/` tree.
//!
//! Provides atomic single-file writes (temp sibling + fsync + rename),
//! optimistic-concurrency version tokens, an advisory per-project file lock
//! for multi-file updates, quarantine of corrupt files, and the append-only
//! project activity log.

pub mod init;
pub mod lock;
pub mod log;
pub mod store;

pub use init::initialize_project;
pub use lock::ProjectLock;
pub use log::{IterationRecord, ProjectLog};
pub use store::{ProjectStore, Version, Versioned};
