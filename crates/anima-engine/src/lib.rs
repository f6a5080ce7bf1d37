//! Per-project autonomy: the wake scheduler and the iteration engine.
//!
//! The wake scheduler decides when a project leaves `sleeping` and hands
//! ready milestones to the iteration engine. The engine drives the
//! Developer/Acceptor loop over agent PTY sessions, commits work on a
//! milestone branch, and verifies it against acceptance criteria, persisting
//! every transition through the store.

pub mod cancel;
pub mod clock;
pub mod controls;
pub mod engine;
pub mod port;
pub mod prompts;
pub mod recovery;
pub mod schedule;
pub mod scheduler;

pub use cancel::CancellationToken;
pub use clock::{Clock, SystemClock};
pub use controls::{EventSink, ProjectControls};
pub use engine::{EngineOutcome, EntryPoint, IterationEngine};
pub use port::{AgentLauncher, AgentPort, CliAgentLauncher};
pub use scheduler::{ProjectCommand, WakeScheduler};
