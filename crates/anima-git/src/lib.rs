//! Version-control driver.
//!
//! A command-level wrapper over the `git` binary for one project's working
//! tree. All policy (when to branch, merge, roll back) lives in the
//! iteration engine; this crate only runs commands, serializes them with a
//! per-driver lock, and surfaces failures verbatim -- it never silently
//! recovers.

mod driver;

pub use driver::{CommitInfo, GitDriver, MergeStrategy, WorktreeStatus};
