//! The Anima supervisor: the process-wide singleton owning every managed
//! project.
//!
//! Holds the project registry, spawns one wake-scheduler worker per
//! project, fans events out to subscribers, and exposes the control API --
//! both as Rust methods and as an NDJSON Unix-socket protocol for external
//! shells.

pub mod bus;
pub mod control;
pub mod registry;
pub mod server;
pub mod supervisor;
pub mod worker;

pub use bus::{EventBus, EventStream};
pub use control::{ControlCommand, ControlResponse};
pub use registry::AppRegistry;
pub use supervisor::{ProjectSnapshot, Supervisor};
