//! Agent process host and stream parser.
//!
//! Launches an AI agent CLI in a pseudo-terminal (agent CLIs detect
//! interactive terminals and change their output behavior on plain pipes),
//! keeps the process alive across many rounds, and converts its raw output
//! stream into structured signals: verdicts, cost/token telemetry, tool-use
//! summaries, and quota/rate-limit events.

pub mod ansi;
pub mod host;
pub mod line;
pub mod parser;
pub mod pty;
pub mod reap;

pub use host::{AgentHost, HealthStatus, RoundOutcome, RoundTerminal, StreamItem};
pub use parser::{QuotaSignal, StreamParser, StreamSignal, Verdict};
pub use pty::PtySession;
