//! Remote shell sessions to fleet machines.
//!
//! [`Connector`] opens an authenticated [`RemoteShell`] for a
//! [`ConnectionDescriptor`](fleetcheck_common::ConnectionDescriptor).
//! [`Ssh2Connector`] talks to real hosts; [`ScriptedConnector`] replays
//! canned outputs for tests.

pub mod command;
pub mod error;
pub mod scripted;
pub mod session;
pub mod ssh;

pub use command::{CommandOutput, Elevation, ExecOptions};
pub use error::SessionError;
pub use scripted::{ExecutedCommand, ScriptedConnector, ScriptedHost};
pub use session::{Connector, RemoteShell};
pub use ssh::Ssh2Connector;
pub use tokio_util::sync::CancellationToken;
