//! `sokrates-daemon`: the background queue worker and its process controller.
//!
//! - [`config`]: environment-driven configuration.
//! - [`daemon`]: the polling loop around a [`Processor`](sokrates_queue::Processor).
//! - [`controller`]: start / stop / restart / status from a short-lived CLI process.
//! - [`command_handler`]: the shell-command subtask handler the daemon runs with.

pub mod command_handler;
pub mod config;
pub mod controller;
pub mod daemon;

pub use command_handler::CommandSubtaskHandler;
pub use config::{ConfigError, DaemonConfig};
pub use controller::{
    ControlError, DaemonLauncher, DaemonStatus, DetachedLauncher, PgrepDiscovery,
    ProcessController, ProcessDiscovery, ProcessSignals, RestartOutcome, StartOutcome,
    StopOutcome, StopTiming, UnixSignals, DISCOVERY_KEYS,
};
pub use daemon::{Daemon, DaemonState};
