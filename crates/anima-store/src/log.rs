//! Per-project activity log and iteration memory records.
//!
//! The core never prints to standard streams. Project-scoped activity is
//! appended to `.anima/logs/anima.log` so a project directory stays
//! self-describing; each finished round also leaves a markdown record under
//! `.anima/memory/iterations/` for the agents to consult in later sessions.

use std::fs::OpenOptions;
use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};

use anima_types::{AnimaError, AnimaPaths};

/// Append-only writer for a project's `anima.log`.
pub struct ProjectLog {
    paths: AnimaPaths,
}

impl ProjectLog {
    pub fn new(paths: AnimaPaths) -> Self {
        Self { paths }
    }

    /// Append one timestamped line. Failures are reported, never panicked.
    pub fn append(&self, message: &str) -> Result<(), AnimaError> {
        let dir = self.paths.logs_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| AnimaError::StoreError(format!("mkdir {}: {e}", dir.display())))?;

        let path = self.paths.log_file();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AnimaError::StoreError(format!("open {}: {e}", path.display())))?;

        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        writeln!(file, "{stamp} {message}")
            .map_err(|e| AnimaError::StoreError(format!("append {}: {e}", path.display())))
    }
}

/// One finished round, written as an iteration memory record.
pub struct IterationRecord<'a> {
    pub milestone_id: &'a str,
    pub round: u32,
    pub phase: &'a str,
    pub verdict: &'a str,
    pub detail: &'a str,
    pub tokens: u64,
    pub cost_usd: f64,
    pub finished_at: DateTime<Utc>,
}

impl IterationRecord<'_> {
    /// Write this record to `.anima/memory/iterations/{timestamp}-{id}.md`.
    pub fn write(&self, paths: &AnimaPaths) -> Result<(), AnimaError> {
        let dir = paths.iterations_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| AnimaError::StoreError(format!("mkdir {}: {e}", dir.display())))?;

        let stamp = self.finished_at.format("%Y%m%dT%H%M%SZ").to_string();
        let path = paths.iteration_record(&stamp, self.milestone_id);

        let body = format!(
            "# Round {round} — {milestone}\n\n\
             - finished: {finished}\n\
             - phase: {phase}\n\
             - verdict: {verdict}\n\
             - tokens: {tokens}\n\
             - cost: ${cost:.4}\n\n\
             {detail}\n",
            round = self.round,
            milestone = self.milestone_id,
            finished = self.finished_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            phase = self.phase,
            verdict = self.verdict,
            tokens = self.tokens,
            cost = self.cost_usd,
            detail = self.detail,
        );

        std::fs::write(&path, body)
            .map_err(|e| AnimaError::StoreError(format!("write {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_creates_and_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AnimaPaths::new(dir.path());
        let log = ProjectLog::new(paths.clone());

        log.append("milestone m1 picked up").unwrap();
        log.append("round 1 accepted").unwrap();

        let content = std::fs::read_to_string(paths.log_file()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("milestone m1 picked up"));
        // ISO-8601 UTC with second precision.
        assert!(lines[0].contains('T'));
        assert!(lines[0].split(' ').next().unwrap().ends_with('Z'));
    }

    #[test]
    fn iteration_record_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AnimaPaths::new(dir.path());

        let finished_at = Utc::now();
        IterationRecord {
            milestone_id: "m1",
            round: 3,
            phase: "acceptor",
            verdict: "REJECTED",
            detail: "missing error handling on empty input",
            tokens: 420,
            cost_usd: 0.0123,
            finished_at,
        }
        .write(&paths)
        .unwrap();

        let entries: Vec<_> = std::fs::read_dir(paths.iterations_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries[0].path()).unwrap();
        assert!(content.contains("# Round 3 — m1"));
        assert!(content.contains("verdict: REJECTED"));
        assert!(content.contains("missing error handling"));
    }
}
