//! Structured signal extraction from agent output.
//!
//! Scans ANSI-stripped output lines for three kinds of tokens: verdicts
//! (`ACCEPTED`, `REJECTED: ...`, `ALL_FEATURES_COMPLETE` with a commit
//! list), cost/token telemetry, and quota/rate-limit signals with optional
//! reset-time hints. Raw text passthrough for UIs happens in the host; the
//! parser only sees completed lines.
//!
//! Verdict anchors are case-insensitive and must start a line (after
//! optional whitespace). Quota detection is conservative: a pattern match
//! counts only when the same line also reads as a failure, so a passing
//! mention of "rate limits" in prose does not suspend the project.

use chrono::{DateTime, Duration, TimeZone, Utc};
use regex::Regex;

use anima_types::QuotaStatus;

/// A terminal verdict extracted from agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected { reason: String },
    AllFeaturesComplete { summary: String, commits: Vec<String> },
}

impl Verdict {
    /// Wire spelling of the verdict keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Verdict::Accepted => "ACCEPTED",
            Verdict::Rejected { .. } => "REJECTED",
            Verdict::AllFeaturesComplete { .. } => "ALL_FEATURES_COMPLETE",
        }
    }
}

/// A quota or rate-limit signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSignal {
    pub status: QuotaStatus,
    pub reset_at: Option<DateTime<Utc>>,
    /// The line that triggered detection, for diagnostics.
    pub message: String,
}

/// One structured signal from the output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    Verdict(Verdict),
    Telemetry { tokens: u64, cost_usd: f64 },
    Quota(QuotaSignal),
    ToolUse { name: String, brief: String },
}

/// Exhaustion phrases: the provider will not serve again this billing window.
const EXHAUSTION_PATTERNS: &[&str] = &[
    "quota exceeded",
    "quota exhausted",
    "usage limit",
    "spending limit",
    "out of credits",
    "out of extra usage",
    "billing",
];

/// Rate-limit phrases: the provider wants a pause, not money.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "429",
    "too many requests",
    "overloaded",
];

/// A quota phrase only counts when the line also reads as a failure.
const FAILURE_INDICATORS: &[&str] = &[
    "error",
    "failed",
    "exceeded",
    "exhausted",
    "denied",
    "reached",
    "try again",
    "please wait",
    "unavailable",
    "429",
];

/// Stateful line scanner. One per agent session.
///
/// State accumulates across lines for multi-line `REJECTED` reasons and the
/// commit list following `ALL_FEATURES_COMPLETE`; call [`StreamParser::finish`]
/// when the stream goes idle to flush a pending accumulation.
pub struct StreamParser {
    pending: Pending,
    re_try_again: Regex,
    re_resets_at: Regex,
    re_tokens: Regex,
    re_cost: Regex,
    re_tool: Regex,
    re_commit_hash: Regex,
}

enum Pending {
    None,
    /// Accumulating a multi-line rejection reason.
    Rejection { reason: String },
    /// Accumulating the summary and commit list after ALL_FEATURES_COMPLETE.
    Completion {
        summary: String,
        commits: Vec<String>,
        in_commits: bool,
    },
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            pending: Pending::None,
            re_try_again: Regex::new(r"(?i)try again in\s+(\d+)\s*(minute|min|hour|hr)s?")
                .expect("valid regex"),
            re_resets_at: Regex::new(r"(?i)resets?\s+at\s+(\d{1,2}):(\d{2})").expect("valid regex"),
            re_tokens: Regex::new(r"(?i)(?:^|\b)([\d,]+)\s*tokens\b|\btokens?\s*[:=]\s*([\d,]+)")
                .expect("valid regex"),
            re_cost: Regex::new(r"(?i)\bcost\s*[:=]?\s*\$\s*(\d+(?:\.\d+)?)").expect("valid regex"),
            re_tool: Regex::new(r"^\[tool:call\]\s+(\S+):?\s*(.*)$").expect("valid regex"),
            re_commit_hash: Regex::new(r"\b([0-9a-f]{7,40})\b").expect("valid regex"),
        }
    }

    /// Scan one completed line; returns any signals it produced.
    pub fn push_line(&mut self, line: &str) -> Vec<StreamSignal> {
        self.push_line_at(line, Utc::now())
    }

    /// Scan one line with an explicit clock (for deterministic tests).
    pub fn push_line_at(&mut self, line: &str, now: DateTime<Utc>) -> Vec<StreamSignal> {
        let mut signals = Vec::new();
        let trimmed = line.trim();

        // A verdict-like line always terminates any pending accumulation.
        if is_verdict_line(trimmed) {
            if let Some(v) = self.take_pending() {
                signals.push(StreamSignal::Verdict(v));
            }
            match classify_verdict(trimmed) {
                VerdictStart::Accepted => {
                    signals.push(StreamSignal::Verdict(Verdict::Accepted));
                }
                VerdictStart::Rejected(first) => {
                    self.pending = Pending::Rejection { reason: first };
                }
                VerdictStart::AllComplete => {
                    self.pending = Pending::Completion {
                        summary: String::new(),
                        commits: Vec::new(),
                        in_commits: false,
                    };
                }
                VerdictStart::None => unreachable!("is_verdict_line was true"),
            }
            return signals;
        }

        // Continue a pending accumulation. Take ownership so completing it
        // does not fight the borrow checker.
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::Rejection { mut reason } => {
                if trimmed.is_empty() {
                    signals.push(StreamSignal::Verdict(Verdict::Rejected {
                        reason: reason.trim().to_string(),
                    }));
                } else {
                    if !reason.is_empty() {
                        reason.push('\n');
                    }
                    reason.push_str(trimmed);
                    self.pending = Pending::Rejection { reason };
                }
                return signals;
            }
            Pending::Completion {
                mut summary,
                mut commits,
                mut in_commits,
            } => {
                let lower = trimmed.to_ascii_lowercase();
                if lower.starts_with("commits") {
                    in_commits = true;
                    // Inline form: "Commits: abc123, def456"
                    for cap in self.re_commit_hash.captures_iter(trimmed) {
                        commits.push(cap[1].to_string());
                    }
                    self.pending = Pending::Completion {
                        summary,
                        commits,
                        in_commits,
                    };
                    return signals;
                }
                if in_commits {
                    let before = commits.len();
                    if !trimmed.is_empty() {
                        for cap in self.re_commit_hash.captures_iter(trimmed) {
                            commits.push(cap[1].to_string());
                        }
                    }
                    if trimmed.is_empty() || commits.len() == before {
                        // Blank line or a non-hash line ends the list.
                        signals.push(StreamSignal::Verdict(Verdict::AllFeaturesComplete {
                            summary: summary.trim().to_string(),
                            commits,
                        }));
                    } else {
                        self.pending = Pending::Completion {
                            summary,
                            commits,
                            in_commits,
                        };
                    }
                    return signals;
                }
                if !trimmed.is_empty() {
                    if !summary.is_empty() {
                        summary.push('\n');
                    }
                    summary.push_str(trimmed);
                }
                self.pending = Pending::Completion {
                    summary,
                    commits,
                    in_commits,
                };
                // Completion summaries may still carry telemetry lines,
                // scanned below.
            }
            Pending::None => {}
        }

        if let Some(cap) = self.re_tool.captures(trimmed) {
            signals.push(StreamSignal::ToolUse {
                name: cap[1].to_string(),
                brief: cap[2].trim().to_string(),
            });
            return signals;
        }

        if let Some(signal) = self.parse_telemetry(trimmed) {
            signals.push(signal);
        }

        if let Some(quota) = self.parse_quota(trimmed, now) {
            signals.push(StreamSignal::Quota(quota));
        }

        signals
    }

    /// Flush pending state at stream idle or round end.
    pub fn finish(&mut self) -> Vec<StreamSignal> {
        self.take_pending()
            .map(|v| vec![StreamSignal::Verdict(v)])
            .unwrap_or_default()
    }

    fn take_pending(&mut self) -> Option<Verdict> {
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None => None,
            Pending::Rejection { reason } => Some(Verdict::Rejected {
                reason: reason.trim().to_string(),
            }),
            Pending::Completion {
                summary, commits, ..
            } => Some(Verdict::AllFeaturesComplete {
                summary: summary.trim().to_string(),
                commits,
            }),
        }
    }

    fn parse_telemetry(&self, line: &str) -> Option<StreamSignal> {
        let tokens = self.re_tokens.captures(line).and_then(|cap| {
            let text = cap.get(1).or_else(|| cap.get(2))?.as_str().replace(',', "");
            text.parse::<u64>().ok()
        });
        let cost = self
            .re_cost
            .captures(line)
            .and_then(|cap| cap[1].parse::<f64>().ok());

        if tokens.is_none() && cost.is_none() {
            return None;
        }
        Some(StreamSignal::Telemetry {
            tokens: tokens.unwrap_or(0),
            cost_usd: cost.unwrap_or(0.0),
        })
    }

    fn parse_quota(&self, line: &str, now: DateTime<Utc>) -> Option<QuotaSignal> {
        let lower = line.to_ascii_lowercase();

        let status = if EXHAUSTION_PATTERNS.iter().any(|p| lower.contains(p)) {
            QuotaStatus::QuotaExhausted
        } else if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
            QuotaStatus::RateLimited
        } else {
            return None;
        };

        // Error surface, not a passing mention.
        if !FAILURE_INDICATORS.iter().any(|p| lower.contains(p)) {
            return None;
        }

        let reset_at = self.parse_reset_time(&lower, now);
        Some(QuotaSignal {
            status,
            reset_at,
            message: line.trim().to_string(),
        })
    }

    fn parse_reset_time(&self, lower: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(cap) = self.re_try_again.captures(lower) {
            let amount: i64 = cap[1].parse().ok()?;
            let unit = &cap[2];
            let duration = if unit.starts_with("hour") || unit.starts_with("hr") {
                Duration::hours(amount)
            } else {
                Duration::minutes(amount)
            };
            return Some(now + duration);
        }

        if let Some(cap) = self.re_resets_at.captures(lower) {
            let hour: u32 = cap[1].parse().ok()?;
            let minute: u32 = cap[2].parse().ok()?;
            if hour >= 24 || minute >= 60 {
                return None;
            }
            let today = now.date_naive().and_hms_opt(hour, minute, 0)?;
            let candidate = Utc.from_utc_datetime(&today);
            if candidate > now {
                return Some(candidate);
            }
            // Already past today's time: next occurrence is tomorrow.
            let tomorrow = now.date_naive().succ_opt()?.and_hms_opt(hour, minute, 0)?;
            return Some(Utc.from_utc_datetime(&tomorrow));
        }

        None
    }
}

enum VerdictStart {
    None,
    Accepted,
    Rejected(String),
    AllComplete,
}

fn is_verdict_line(trimmed: &str) -> bool {
    !matches!(classify_verdict(trimmed), VerdictStart::None)
}

fn classify_verdict(trimmed: &str) -> VerdictStart {
    let upper = trimmed.to_ascii_uppercase();

    if let Some(rest) = upper.strip_prefix("ALL_FEATURES_COMPLETE") {
        if rest.is_empty() || !rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
            return VerdictStart::AllComplete;
        }
    }

    if let Some(rest) = upper.strip_prefix("REJECTED") {
        if rest.is_empty() || rest.starts_with(':') || rest.starts_with(' ') {
            // Preserve the original casing of the reason text.
            let reason = trimmed[("REJECTED".len()).min(trimmed.len())..]
                .trim_start_matches(':')
                .trim()
                .to_string();
            return VerdictStart::Rejected(reason);
        }
    }

    if let Some(rest) = upper.strip_prefix("ACCEPTED") {
        // Tolerate trailing punctuation but not a longer word.
        if rest.is_empty() || !rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
            return VerdictStart::Accepted;
        }
    }

    VerdictStart::None
}
