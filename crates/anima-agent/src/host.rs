//! Long-lived agent session host.
//!
//! One `AgentHost` wraps one role's PTY child (developer or acceptor) and
//! keeps it alive across many rounds. Input goes in as UTF-8 frames
//! terminated by a blank line; output is read in chunks, split into lines,
//! parsed for structured signals, and mirrored to a sink for UI streaming.
//!
//! A round ends on the first of: a verdict followed by the idle window (the
//! last verdict before idle wins), a quota signal, the deadline, session
//! death, or cancellation.

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use anima_types::AnimaError;

use crate::line::LineBuffer;
use crate::parser::{QuotaSignal, StreamParser, StreamSignal, Verdict};
use crate::pty::PtySession;
use crate::reap::{reap_tree, ReapConfig};

/// How a round concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundTerminal {
    /// The agent produced a verdict (last one before idle wins).
    Verdict(Verdict),
    /// The agent produced output but no verdict, then went quiet: a
    /// per-round implementation report (normal for developer rounds).
    Report,
    /// A quota/rate-limit signal ended the round.
    Quota(QuotaSignal),
    /// The deadline expired with no verdict.
    Timeout,
    /// The child exited before producing a verdict.
    SessionDead { exit_code: Option<i32> },
    /// The caller cancelled the wait.
    Cancelled,
}

/// Everything collected during one round.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub terminal: RoundTerminal,
    /// Tokens reported by telemetry lines during this round.
    pub tokens: u64,
    /// Cost reported by telemetry lines during this round.
    pub cost_usd: f64,
    pub elapsed: Duration,
}

/// Items mirrored to the caller's sink while a round runs.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// One ANSI-stripped output line.
    Chunk(String),
    /// A summarized tool invocation.
    ToolUse { name: String, brief: String },
}

/// Liveness of the hosted child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Alive { pid: u32 },
    Exited { code: i32 },
}

/// Poll granularity inside a round.
const POLL_MS: i32 = 100;

/// No-output window after a verdict before the round is concluded.
const IDLE_WINDOW: Duration = Duration::from_millis(500);

/// No-output window after verdict-less output before the round counts as a
/// report. Longer than the verdict window: agents pause mid-work.
const REPORT_IDLE: Duration = Duration::from_secs(10);

/// Grace period when closing a session before SIGKILL escalation.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A long-lived interactive agent session for one role.
pub struct AgentHost {
    role: String,
    session: PtySession,
    lines: LineBuffer,
    parser: StreamParser,
    report_idle: Duration,
}

impl AgentHost {
    /// Spawn the agent CLI in a PTY bound to the project working tree.
    pub fn spawn(
        role: &str,
        command: &str,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
    ) -> Result<Self, AnimaError> {
        let session = PtySession::spawn(command, args, working_dir, env)?;
        info!(role, pid = session.pid(), command, "agent session spawned");
        Ok(Self {
            role: role.to_string(),
            session,
            lines: LineBuffer::new(2000),
            parser: StreamParser::new(),
            report_idle: REPORT_IDLE,
        })
    }

    /// Override the report-idle window (tests use a short one).
    pub fn set_report_idle(&mut self, idle: Duration) {
        self.report_idle = idle;
    }

    /// The hosted child's process id.
    pub fn pid(&self) -> u32 {
        self.session.pid()
    }

    /// Liveness and exit code.
    pub fn health(&self) -> HealthStatus {
        if self.session.is_alive() {
            HealthStatus::Alive {
                pid: self.session.pid(),
            }
        } else {
            HealthStatus::Exited {
                code: self.session.exit_code().unwrap_or(-1),
            }
        }
    }

    /// Send one input frame: the text followed by the blank-line sentinel.
    pub fn send_frame(&self, text: &str) -> Result<(), AnimaError> {
        if !self.session.is_alive() {
            return Err(AnimaError::SessionDead(format!(
                "{} session exited with {:?}",
                self.role,
                self.session.exit_code()
            )));
        }
        let mut data = text.as_bytes().to_vec();
        if !text.ends_with('\n') {
            data.push(b'\n');
        }
        data.push(b'\n');
        self.session.write_all(&data)
    }

    /// Run one round: read output until a terminal condition, mirroring
    /// lines and tool-use summaries to `sink`.
    ///
    /// `cancelled` is polled between reads so a pause/cancel from the
    /// control plane interrupts the wait promptly.
    pub fn collect_round(
        &mut self,
        deadline: Duration,
        cancelled: &dyn Fn() -> bool,
        sink: &mut dyn FnMut(StreamItem),
    ) -> Result<RoundOutcome, AnimaError> {
        let start = Instant::now();
        let mut read_buf = [0u8; 8192];
        let mut tokens: u64 = 0;
        let mut cost_usd: f64 = 0.0;
        let mut last_verdict: Option<Verdict> = None;
        let mut last_output = Instant::now();
        let mut saw_output = false;

        let conclude = |terminal: RoundTerminal, tokens: u64, cost_usd: f64, start: Instant| {
            RoundOutcome {
                terminal,
                tokens,
                cost_usd,
                elapsed: start.elapsed(),
            }
        };

        loop {
            if cancelled() {
                debug!(role = self.role, "round cancelled");
                return Ok(conclude(RoundTerminal::Cancelled, tokens, cost_usd, start));
            }

            if start.elapsed() >= deadline {
                // A verdict that arrived right at the deadline still counts.
                let flushed = self.parser.finish();
                if let Some(v) = Self::apply_signals(
                    &self.role,
                    flushed,
                    &mut tokens,
                    &mut cost_usd,
                    sink,
                ) {
                    last_verdict = Some(v);
                }
                let terminal = match last_verdict {
                    Some(v) => RoundTerminal::Verdict(v),
                    None => RoundTerminal::Timeout,
                };
                return Ok(conclude(terminal, tokens, cost_usd, start));
            }

            let readable = self.session.poll_readable(POLL_MS)?;

            if readable {
                let n = self.session.read(&mut read_buf)?;
                if n > 0 {
                    last_output = Instant::now();
                    saw_output = true;
                    let lines = self.lines.feed(&read_buf[..n]);
                    for line in lines {
                        sink(StreamItem::Chunk(line.clone()));
                        let signals = self.parser.push_line(&line);
                        if let Some(q) = Self::check_quota(&signals) {
                            return Ok(conclude(
                                RoundTerminal::Quota(q),
                                tokens,
                                cost_usd,
                                start,
                            ));
                        }
                        if let Some(v) = Self::apply_signals(
                            &self.role,
                            signals,
                            &mut tokens,
                            &mut cost_usd,
                            sink,
                        ) {
                            last_verdict = Some(v);
                        }
                    }
                    continue;
                }
            }

            // No data this tick. Check the idle window and child liveness.
            if !self.session.is_alive() {
                return Ok(self.finish_dead_session(
                    tokens,
                    cost_usd,
                    last_verdict,
                    start,
                    sink,
                ));
            }

            if last_output.elapsed() >= IDLE_WINDOW {
                // Flush a verdict printed without a trailing newline.
                if let Some(partial) = self.lines.flush_partial() {
                    sink(StreamItem::Chunk(partial.clone()));
                    let signals = self.parser.push_line(&partial);
                    if let Some(q) = Self::check_quota(&signals) {
                        return Ok(conclude(RoundTerminal::Quota(q), tokens, cost_usd, start));
                    }
                    if let Some(v) = Self::apply_signals(
                        &self.role,
                        signals,
                        &mut tokens,
                        &mut cost_usd,
                        sink,
                    ) {
                        last_verdict = Some(v);
                    }
                }
                let flushed = self.parser.finish();
                if let Some(v) = Self::apply_signals(
                    &self.role,
                    flushed,
                    &mut tokens,
                    &mut cost_usd,
                    sink,
                ) {
                    last_verdict = Some(v);
                }
                if let Some(v) = last_verdict.take() {
                    return Ok(conclude(RoundTerminal::Verdict(v), tokens, cost_usd, start));
                }
                if saw_output && last_output.elapsed() >= self.report_idle {
                    return Ok(conclude(RoundTerminal::Report, tokens, cost_usd, start));
                }
            }
        }
    }

    /// Drain remaining output from a dead child and decide the terminal.
    fn finish_dead_session(
        &mut self,
        mut tokens: u64,
        mut cost_usd: f64,
        mut last_verdict: Option<Verdict>,
        start: Instant,
        sink: &mut dyn FnMut(StreamItem),
    ) -> RoundOutcome {
        let mut read_buf = [0u8; 8192];
        loop {
            match self.session.read(&mut read_buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for line in self.lines.feed(&read_buf[..n]) {
                        sink(StreamItem::Chunk(line.clone()));
                        let signals = self.parser.push_line(&line);
                        if let Some(v) = Self::apply_signals(
                            &self.role,
                            signals,
                            &mut tokens,
                            &mut cost_usd,
                            sink,
                        ) {
                            last_verdict = Some(v);
                        }
                    }
                }
            }
        }
        if let Some(partial) = self.lines.flush_partial() {
            sink(StreamItem::Chunk(partial.clone()));
            let signals = self.parser.push_line(&partial);
            if let Some(v) =
                Self::apply_signals(&self.role, signals, &mut tokens, &mut cost_usd, sink)
            {
                last_verdict = Some(v);
            }
        }
        let flushed = self.parser.finish();
        if let Some(v) = Self::apply_signals(&self.role, flushed, &mut tokens, &mut cost_usd, sink)
        {
            last_verdict = Some(v);
        }

        let exit_code = self.session.wait().ok();
        warn!(role = self.role, exit_code = ?exit_code, "agent exited during round");

        let terminal = match last_verdict {
            // The child may legitimately exit right after its verdict.
            Some(v) => RoundTerminal::Verdict(v),
            None => RoundTerminal::SessionDead { exit_code },
        };
        RoundOutcome {
            terminal,
            tokens,
            cost_usd,
            elapsed: start.elapsed(),
        }
    }

    fn check_quota(signals: &[StreamSignal]) -> Option<QuotaSignal> {
        signals.iter().find_map(|s| match s {
            StreamSignal::Quota(q) => Some(q.clone()),
            _ => None,
        })
    }

    /// Fold non-quota signals into round state; returns the last verdict seen.
    fn apply_signals(
        role: &str,
        signals: Vec<StreamSignal>,
        tokens: &mut u64,
        cost_usd: &mut f64,
        sink: &mut dyn FnMut(StreamItem),
    ) -> Option<Verdict> {
        let mut verdict = None;
        for signal in signals {
            match signal {
                StreamSignal::Verdict(v) => {
                    debug!(role, verdict = v.keyword(), "verdict extracted");
                    verdict = Some(v);
                }
                StreamSignal::Telemetry {
                    tokens: t,
                    cost_usd: c,
                } => {
                    *tokens = tokens.saturating_add(t);
                    *cost_usd += c;
                }
                StreamSignal::ToolUse { name, brief } => {
                    sink(StreamItem::ToolUse { name, brief });
                }
                StreamSignal::Quota(_) => {}
            }
        }
        verdict
    }

    /// Graceful shutdown: SIGTERM to the process tree, escalate after the
    /// grace window, and reap the child before releasing the handle.
    pub fn close(&mut self) {
        let pid = self.session.pid() as i32;
        if self.session.is_alive() {
            let config = ReapConfig {
                grace_period: CLOSE_GRACE,
                poll_interval: Duration::from_millis(100),
            };
            if let Err(e) = reap_tree(pid, &config) {
                warn!(role = self.role, pid, error = %e, "tree reap failed on close");
                let _ = self.session.terminate();
            }
        }
        let _ = self.session.wait();
        info!(role = self.role, pid, "agent session closed");
    }

    /// Forced shutdown: SIGKILL the tree immediately, then reap.
    pub fn kill(&mut self) {
        let pid = self.session.pid() as i32;
        if self.session.is_alive() {
            let config = ReapConfig {
                grace_period: Duration::from_millis(0),
                poll_interval: Duration::from_millis(20),
            };
            if let Err(e) = reap_tree(pid, &config) {
                warn!(role = self.role, pid, error = %e, "tree reap failed on kill");
                let _ = self.session.kill();
            }
        }
        let _ = self.session.wait();
        info!(role = self.role, pid, "agent session killed");
    }
}

impl Drop for AgentHost {
    fn drop(&mut self) {
        // Zombie reaping is guaranteed before the handle is released.
        if self.session.is_alive() {
            self.kill();
        } else {
            let _ = self.session.wait();
        }
    }
}
