//! Process-tree termination for agent sessions.
//!
//! Agents spawn their own children (shells, test runners, dev servers).
//! Closing a session must not leave that tree running, so teardown walks the
//! process tree from the agent's PID, signals leaves first, and escalates
//! from SIGTERM to SIGKILL after a grace period.
//!
//! Safety rails: PID 0/1 are never targeted, and only processes owned by the
//! current user are signaled.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use anima_types::AnimaError;

/// Grace and polling configuration for tree termination.
#[derive(Debug, Clone)]
pub struct ReapConfig {
    /// Wait between SIGTERM and SIGKILL escalation.
    pub grace_period: Duration,
    /// Poll interval while waiting for processes to exit.
    pub poll_interval: Duration,
}

impl Default for ReapConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
struct ProcEntry {
    pid: i32,
    ppid: i32,
    uid: u32,
}

fn is_protected(pid: i32) -> bool {
    pid == 0 || pid == 1
}

fn current_uid() -> u32 {
    // Safety: getuid() cannot fail.
    unsafe { libc::getuid() }
}

/// Enumerate processes from /proc (pid, ppid, uid).
fn enumerate() -> Result<Vec<ProcEntry>, AnimaError> {
    let entries = std::fs::read_dir("/proc")
        .map_err(|e| AnimaError::SessionError(format!("read /proc: {e}")))?;

    let mut procs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let pid: i32 = match name.to_string_lossy().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let status = match std::fs::read_to_string(format!("/proc/{pid}/status")) {
            Ok(s) => s,
            Err(_) => continue, // exited between readdir and read
        };

        let mut ppid = 0i32;
        let mut uid = u32::MAX;
        for line in status.lines() {
            if let Some(val) = line.strip_prefix("PPid:\t") {
                ppid = val.trim().parse().unwrap_or(0);
            } else if let Some(val) = line.strip_prefix("Uid:\t") {
                uid = val
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(u32::MAX);
            }
        }
        procs.push(ProcEntry { pid, ppid, uid });
    }
    Ok(procs)
}

/// Descendants of `root`, leaves first.
fn descendants(root: i32, procs: &[ProcEntry]) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for p in procs {
        children.entry(p.ppid).or_default().push(p.pid);
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if kid == root {
                    continue;
                }
                found.push(kid);
                queue.push_back(kid);
            }
        }
    }
    found.reverse();
    found
}

fn owned_by(pid: i32, uid: u32, procs: &[ProcEntry]) -> bool {
    procs.iter().find(|p| p.pid == pid).is_some_and(|p| p.uid == uid)
}

fn alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

fn send(pid: i32, sig: Signal) {
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) => debug!(pid, signal = ?sig, "signal sent"),
        Err(nix::errno::Errno::ESRCH) => debug!(pid, "process already gone"),
        Err(nix::errno::Errno::EPERM) => warn!(pid, "permission denied, skipping"),
        Err(e) => warn!(pid, error = %e, "signal failed"),
    }
}

/// Terminate the process tree rooted at `root_pid`, leaves first, with
/// SIGTERM then SIGKILL escalation after the grace period.
pub fn reap_tree(root_pid: i32, config: &ReapConfig) -> Result<(), AnimaError> {
    if is_protected(root_pid) || root_pid < 0 {
        return Err(AnimaError::SessionError(format!(
            "refusing to reap protected or invalid PID {root_pid}"
        )));
    }

    let procs = enumerate()?;
    let uid = current_uid();

    if !owned_by(root_pid, uid, &procs) {
        if !alive(root_pid) {
            debug!(root_pid, "root already exited");
            return Ok(());
        }
        return Err(AnimaError::SessionError(format!(
            "PID {root_pid} is not owned by uid {uid}"
        )));
    }

    let mut kill_list: Vec<i32> = descendants(root_pid, &procs)
        .into_iter()
        .filter(|&pid| !is_protected(pid) && owned_by(pid, uid, &procs))
        .collect();
    kill_list.push(root_pid);

    info!(root_pid, count = kill_list.len(), "terminating agent process tree");

    for &pid in &kill_list {
        send(pid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + config.grace_period;
    loop {
        let survivors: Vec<i32> = kill_list.iter().copied().filter(|&p| alive(p)).collect();
        if survivors.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            warn!(root_pid, survivors = survivors.len(), "escalating to SIGKILL");
            for &pid in &survivors {
                send(pid, Signal::SIGKILL);
            }
            return Ok(());
        }
        std::thread::sleep(config.poll_interval);
    }
}
