//! Run-time bootstrap: turns an immutable [`ServerConfig`] into the
//! container's foreground server process.

pub mod command;
pub mod config;
pub mod probe;
pub mod state;
pub mod supervisor;

pub use command::StartupCommand;
pub use config::ServerConfig;
pub use probe::wait_until_listening;
pub use state::{RunState, RunStatus};
pub use supervisor::{DEFAULT_GRACE_PERIOD, LaunchSpec, Launcher, RunOutcome};
