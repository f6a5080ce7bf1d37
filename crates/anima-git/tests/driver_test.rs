//! Driver tests against real temporary repositories.

use std::path::Path;
use std::process::Command;

use anima_git::{GitDriver, MergeStrategy};
use anima_types::AnimaError;

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git spawn");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test"]);
    std::fs::write(dir.join("README.md"), "# test\n").unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", "initial commit"]);
}

fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
    std::fs::write(dir.join(name), content).unwrap();
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
}

#[test]
fn current_branch_and_commit() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let driver = GitDriver::new(dir.path());

    assert_eq!(driver.current_branch().unwrap(), "main");
    let head = driver.current_commit().unwrap();
    assert_eq!(head.len(), 40);
}

#[test]
fn default_branch_detection_without_remote() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let driver = GitDriver::new(dir.path());
    assert_eq!(driver.default_branch().unwrap(), "main");
}

#[test]
fn branch_create_switch_and_log() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let driver = GitDriver::new(dir.path());
    let base = driver.current_commit().unwrap();

    driver.create_branch("milestone/m1", "main").unwrap();
    assert_eq!(driver.current_branch().unwrap(), "milestone/m1");

    commit_file(dir.path(), "a.txt", "one", "feat: first");
    commit_file(dir.path(), "b.txt", "two", "feat: second");

    let commits = driver.commits_since(&base).unwrap();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits[0].subject, "feat: second");
    assert_eq!(commits[1].subject, "feat: first");

    driver.switch_branch("main").unwrap();
    assert_eq!(driver.current_branch().unwrap(), "main");
}

#[test]
fn status_reports_untracked_and_staged() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let driver = GitDriver::new(dir.path());

    assert!(driver.status().unwrap().is_clean());

    std::fs::write(dir.path().join("new.txt"), "x").unwrap();
    let status = driver.status().unwrap();
    assert_eq!(status.untracked, vec!["new.txt"]);
    assert!(!status.is_clean());

    git(dir.path(), &["add", "new.txt"]);
    let status = driver.status().unwrap();
    assert_eq!(status.staged, vec!["new.txt"]);
    assert!(status.untracked.is_empty());
}

#[test]
fn merge_fast_forward_and_tag() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let driver = GitDriver::new(dir.path());

    driver.create_branch("milestone/m1", "main").unwrap();
    commit_file(dir.path(), "f.txt", "work", "feat: work");
    let tip = driver.current_commit().unwrap();

    driver.switch_branch("main").unwrap();
    driver.merge("milestone/m1", MergeStrategy::FastForward).unwrap();
    assert_eq!(driver.current_commit().unwrap(), tip);

    driver.tag("milestone-m1", "HEAD").unwrap();
    assert!(driver.ref_exists("refs/tags/milestone-m1"));
}

#[test]
fn merge_commit_when_diverged() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let driver = GitDriver::new(dir.path());

    driver.create_branch("milestone/m1", "main").unwrap();
    commit_file(dir.path(), "branch.txt", "b", "feat: on branch");

    driver.switch_branch("main").unwrap();
    commit_file(dir.path(), "main.txt", "m", "chore: on main");

    // Fast-forward is impossible now.
    let err = driver.merge("milestone/m1", MergeStrategy::FastForward);
    assert!(err.is_err());

    driver.merge("milestone/m1", MergeStrategy::Merge).unwrap();
    let log = driver.log("main", None).unwrap();
    assert!(log[0].subject.starts_with("Merge "));
}

#[test]
fn reset_hard_rolls_back_to_base() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let driver = GitDriver::new(dir.path());
    let base = driver.current_commit().unwrap();

    driver.create_branch("milestone/m1", "main").unwrap();
    commit_file(dir.path(), "x.txt", "1", "feat: one");
    commit_file(dir.path(), "y.txt", "2", "feat: two");
    assert_ne!(driver.current_commit().unwrap(), base);

    driver.reset(&base, true).unwrap();
    assert_eq!(driver.current_commit().unwrap(), base);
    assert!(!dir.path().join("x.txt").exists());
}

#[test]
fn failed_command_surfaces_verbatim_output() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let driver = GitDriver::new(dir.path());

    let err = driver.switch_branch("does-not-exist").unwrap_err();
    match err {
        AnimaError::GitError { command, code, stderr, .. } => {
            assert!(command.contains("checkout"));
            assert_ne!(code, 0);
            assert!(!stderr.is_empty());
        }
        other => panic!("expected GitError, got {other:?}"),
    }
}

#[test]
fn delete_branch_after_merge() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    let driver = GitDriver::new(dir.path());

    driver.create_branch("milestone/m1", "main").unwrap();
    commit_file(dir.path(), "z.txt", "z", "feat: z");
    driver.switch_branch("main").unwrap();
    driver.merge("milestone/m1", MergeStrategy::FastForward).unwrap();

    driver.delete_branch("milestone/m1", false).unwrap();
    assert!(!driver.ref_exists("refs/heads/milestone/m1"));
}
