use std::path::Path;

use async_trait::async_trait;
use fleetcheck_common::ConnectionDescriptor;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandOutput, ExecOptions};
use crate::error::SessionError;

/// An authenticated shell on one machine.
///
/// Dropping the shell releases the transport. `close` additionally performs
/// a graceful protocol disconnect.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// `host:port` this shell is connected to.
    fn host(&self) -> &str;

    /// Runs `command` under `bash -lc` with strict mode.
    ///
    /// A non-zero exit is reported through [`CommandOutput::exit_code`], not
    /// as an error. When `cancel` fires or `opts.timeout` elapses the remote
    /// process group is killed and `Cancelled` / `Timeout` is returned.
    async fn exec(
        &self,
        command: &str,
        opts: ExecOptions,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SessionError>;

    /// Copies a local file to `remote` with the given permission bits.
    async fn upload(&self, local: &Path, remote: &str, mode: i32) -> Result<(), SessionError>;

    async fn close(&self);

    /// Short unprivileged command with the default timeout.
    async fn run(&self, command: &str) -> Result<CommandOutput, SessionError> {
        self.exec(command, ExecOptions::default(), &CancellationToken::new())
            .await
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        conn: &ConnectionDescriptor,
    ) -> Result<Box<dyn RemoteShell>, SessionError>;
}
