//! Git command execution for a single working tree.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use tracing::debug;

use anima_types::AnimaError;

/// How to merge a milestone branch into the integration branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Fast-forward only; fails if the branches diverged.
    FastForward,
    /// Always create a merge commit.
    Merge,
}

/// Parsed `git status --porcelain` summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeStatus {
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
}

impl WorktreeStatus {
    /// Whether the working tree has no local modifications at all.
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty() && self.unstaged.is_empty() && self.untracked.is_empty()
    }
}

/// One commit from `git log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    pub subject: String,
}

/// Command-level git wrapper bound to one working tree.
///
/// Commands are serialized by an internal lock so concurrent callers cannot
/// interleave index operations.
pub struct GitDriver {
    worktree: PathBuf,
    cmd_lock: Mutex<()>,
}

impl GitDriver {
    /// Create a driver for the given working tree.
    pub fn new(worktree: impl Into<PathBuf>) -> Self {
        Self {
            worktree: worktree.into(),
            cmd_lock: Mutex::new(()),
        }
    }

    /// The working tree this driver operates on.
    pub fn worktree(&self) -> &std::path::Path {
        &self.worktree
    }

    fn run(&self, args: &[&str]) -> Result<String, AnimaError> {
        let _guard = self
            .cmd_lock
            .lock()
            .map_err(|e| AnimaError::GitError {
                command: args.join(" "),
                code: -1,
                stdout: String::new(),
                stderr: format!("command lock poisoned: {e}"),
            })?;

        debug!(worktree = %self.worktree.display(), command = args.join(" "), "git");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.worktree)
            .output()
            .map_err(|e| AnimaError::GitError {
                command: args.join(" "),
                code: -1,
                stdout: String::new(),
                stderr: format!("failed to spawn git: {e}"),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(AnimaError::GitError {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }

        Ok(stdout.trim_end().to_string())
    }

    /// Current branch name (`HEAD` when detached).
    pub fn current_branch(&self) -> Result<String, AnimaError> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    /// Current HEAD commit hash.
    pub fn current_commit(&self) -> Result<String, AnimaError> {
        self.run(&["rev-parse", "HEAD"])
    }

    /// The repository's default integration branch.
    ///
    /// Reads `origin/HEAD` when a remote exists, otherwise verifies `main`
    /// and falls back to `master`. Never hard-coded.
    pub fn default_branch(&self) -> Result<String, AnimaError> {
        if let Ok(symref) = self.run(&["symbolic-ref", "refs/remotes/origin/HEAD"]) {
            if let Some(name) = symref.rsplit('/').next() {
                if !name.is_empty() {
                    return Ok(name.to_string());
                }
            }
        }
        if self.run(&["rev-parse", "--verify", "main"]).is_ok() {
            return Ok("main".to_string());
        }
        Ok("master".to_string())
    }

    /// Create a branch at `from_ref` and switch to it.
    pub fn create_branch(&self, name: &str, from_ref: &str) -> Result<(), AnimaError> {
        self.run(&["checkout", "-b", name, from_ref]).map(|_| ())
    }

    /// Switch to an existing branch.
    pub fn switch_branch(&self, name: &str) -> Result<(), AnimaError> {
        self.run(&["checkout", name]).map(|_| ())
    }

    /// Working-tree status via `git status --porcelain`.
    pub fn status(&self) -> Result<WorktreeStatus, AnimaError> {
        let raw = self.run(&["status", "--porcelain"])?;
        let mut status = WorktreeStatus::default();
        for line in raw.lines() {
            if line.len() < 3 {
                continue;
            }
            let (code, path) = line.split_at(2);
            let path = path.trim().to_string();
            let index = code.as_bytes()[0];
            let tree = code.as_bytes()[1];
            if code == "??" {
                status.untracked.push(path);
            } else {
                if index != b' ' {
                    status.staged.push(path.clone());
                }
                if tree != b' ' {
                    status.unstaged.push(path);
                }
            }
        }
        Ok(status)
    }

    /// Commits on `branch`, newest first, optionally bounded below by
    /// `since` (exclusive).
    pub fn log(&self, branch: &str, since: Option<&str>) -> Result<Vec<CommitInfo>, AnimaError> {
        let range = match since {
            Some(base) => format!("{base}..{branch}"),
            None => branch.to_string(),
        };
        let raw = self.run(&["log", "--format=%H%x09%s", &range])?;
        Ok(parse_log(&raw))
    }

    /// Commits on HEAD since `base` (exclusive), newest first.
    pub fn commits_since(&self, base: &str) -> Result<Vec<CommitInfo>, AnimaError> {
        let raw = self.run(&["log", "--format=%H%x09%s", &format!("{base}..HEAD")])?;
        Ok(parse_log(&raw))
    }

    /// Full `git show` output for one commit.
    pub fn show_commit(&self, hash: &str) -> Result<String, AnimaError> {
        self.run(&["show", "--stat", "--format=%H%n%an%n%s%n%b", hash])
    }

    /// Diff between two refs.
    pub fn diff(&self, from_ref: &str, to_ref: &str) -> Result<String, AnimaError> {
        self.run(&["diff", &format!("{from_ref}..{to_ref}")])
    }

    /// Merge `branch` into the current branch.
    pub fn merge(&self, branch: &str, strategy: MergeStrategy) -> Result<(), AnimaError> {
        match strategy {
            MergeStrategy::FastForward => self.run(&["merge", "--ff-only", branch]).map(|_| ()),
            MergeStrategy::Merge => self
                .run(&[
                    "merge",
                    "--no-ff",
                    branch,
                    "-m",
                    &format!("Merge {branch}"),
                ])
                .map(|_| ()),
        }
    }

    /// Create a tag at `git_ref`.
    pub fn tag(&self, name: &str, git_ref: &str) -> Result<(), AnimaError> {
        self.run(&["tag", name, git_ref]).map(|_| ())
    }

    /// Reset the current branch to `git_ref`.
    pub fn reset(&self, git_ref: &str, hard: bool) -> Result<(), AnimaError> {
        if hard {
            self.run(&["reset", "--hard", git_ref]).map(|_| ())
        } else {
            self.run(&["reset", git_ref]).map(|_| ())
        }
    }

    /// Delete a branch.
    pub fn delete_branch(&self, name: &str, force: bool) -> Result<(), AnimaError> {
        let flag = if force { "-D" } else { "-d" };
        self.run(&["branch", flag, name]).map(|_| ())
    }

    /// Whether a ref resolves in this repository.
    pub fn ref_exists(&self, git_ref: &str) -> bool {
        self.run(&["rev-parse", "--verify", "--quiet", git_ref]).is_ok()
    }
}

fn parse_log(raw: &str) -> Vec<CommitInfo> {
    raw.lines()
        .filter_map(|line| {
            let (hash, subject) = line.split_once('\t')?;
            Some(CommitInfo {
                hash: hash.to_string(),
                subject: subject.to_string(),
            })
        })
        .collect()
}
