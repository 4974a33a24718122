//! Router-side fleet agent.
//!
//! Keeps one authenticated socket to the hub ([`ConnectionManager`]),
//! reports telemetry on a schedule and runs the hub's commands through the
//! [`firmware`] layer on a bounded [`WorkerPool`].

pub mod backoff;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod firmware;
pub mod pool;
pub mod session;
pub mod telemetry;

pub use backoff::Backoff;
pub use config::{AgentArgs, AgentConfig};
pub use connection::ConnectionManager;
pub use dispatcher::{Dispatcher, FirmwareCommand};
pub use firmware::{CommandRunner, Firmware, FirmwareError, FirmwarePaths, TokioCommandRunner};
pub use pool::WorkerPool;
pub use session::{AgentSession, SessionEvent, SocketState};
pub use telemetry::ProcProbe;
