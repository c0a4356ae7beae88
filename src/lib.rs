//! Rollout: A Resumable Multi-Node SSH Script Runner.

// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to parse, store, and remove pending hosts.
pub mod host;
// Append-only logs and their owner tasks.
pub mod journal;
// The round loop.
pub mod orchestrator;
// Remote collaborator over SSH.
pub mod session;
// Per-host state machine.
pub mod task;

pub use config::{Config, Settings};
pub use error::{ConfigError, HostError, RemoteError, RolloutError};
pub use host::{Host, HostList};
pub use journal::{AppendLog, Event, EventSender};
pub use orchestrator::{Rollout, RoundOutcome, RoundSummary};
pub use session::{Remote, SshRemote};
pub use task::{HostOutcome, HostTask, TaskContext};
