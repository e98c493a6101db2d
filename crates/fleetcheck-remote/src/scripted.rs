use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetcheck_common::ConnectionDescriptor;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandOutput, ExecOptions};
use crate::error::SessionError;
use crate::session::{Connector, RemoteShell};

/// In-process stand-in for a fleet. Each host answers commands from rules
/// matched by substring, first match wins; unmatched commands succeed with
/// empty output.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    hosts: Arc<Mutex<HashMap<String, Arc<ScriptedHost>>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The host entry for `host`, created on first use.
    pub fn host(&self, host: &str) -> Arc<ScriptedHost> {
        self.hosts
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(ScriptedHost::new(host)))
            .clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        conn: &ConnectionDescriptor,
    ) -> Result<Box<dyn RemoteShell>, SessionError> {
        let host = self.host(&conn.host);
        if let Some(err) = host.state.lock().connect_error.clone() {
            return Err(err);
        }
        host.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedShell {
            endpoint: conn.endpoint(),
            host,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub command: String,
    pub elevated: bool,
}

#[derive(Clone)]
enum Reply {
    Output(CommandOutput, Duration),
    Fail(SessionError),
}

#[derive(Default)]
struct HostState {
    connect_error: Option<SessionError>,
    rules: Vec<(String, Reply)>,
    executed: Vec<ExecutedCommand>,
    uploads: Vec<String>,
}

pub struct ScriptedHost {
    name: String,
    state: Mutex<HostState>,
    running: AtomicUsize,
    opened: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptedHost {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(HostState::default()),
            running: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fail_connect(&self, err: SessionError) -> &Self {
        self.state.lock().connect_error = Some(err);
        self
    }

    /// Commands containing `pattern` print `stdout` and exit 0.
    pub fn on(&self, pattern: &str, stdout: &str) -> &Self {
        self.on_output(pattern, CommandOutput::new(0, stdout, ""))
    }

    pub fn on_output(&self, pattern: &str, output: CommandOutput) -> &Self {
        self.push(pattern, Reply::Output(output, Duration::ZERO))
    }

    /// Like [`on`](Self::on) but the remote process runs for `delay`.
    pub fn on_slow(&self, pattern: &str, stdout: &str, delay: Duration) -> &Self {
        self.push(pattern, Reply::Output(CommandOutput::new(0, stdout, ""), delay))
    }

    pub fn on_error(&self, pattern: &str, err: SessionError) -> &Self {
        self.push(pattern, Reply::Fail(err))
    }

    fn push(&self, pattern: &str, reply: Reply) -> &Self {
        self.state.lock().rules.push((pattern.to_string(), reply));
        self
    }

    pub fn executed(&self) -> Vec<ExecutedCommand> {
        self.state.lock().executed.clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.state
            .lock()
            .executed
            .iter()
            .any(|c| c.command.contains(pattern))
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().uploads.clone()
    }

    /// Remote processes currently executing.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn sessions_released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn reply_for(&self, command: &str, elevated: bool) -> Reply {
        let mut state = self.state.lock();
        state.executed.push(ExecutedCommand {
            command: command.to_string(),
            elevated,
        });
        state
            .rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| Reply::Output(CommandOutput::default(), Duration::ZERO))
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedShell {
    endpoint: String,
    host: Arc<ScriptedHost>,
}

impl Drop for ScriptedShell {
    fn drop(&mut self) {
        self.host.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    fn host(&self) -> &str {
        &self.endpoint
    }

    async fn exec(
        &self,
        command: &str,
        opts: ExecOptions,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        let (output, delay) = match self.host.reply_for(command, opts.elevate) {
            Reply::Fail(e) => return Err(e),
            Reply::Output(output, delay) => (output, delay),
        };
        if delay.is_zero() {
            return Ok(output);
        }

        let _running = RunningGuard::new(&self.host.running);
        tokio::select! {
            _ = tokio::time::sleep(delay.min(opts.timeout)) => {
                if delay > opts.timeout {
                    Err(SessionError::Timeout(opts.timeout))
                } else {
                    Ok(output)
                }
            }
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
        }
    }

    async fn upload(&self, _local: &Path, remote: &str, _mode: i32) -> Result<(), SessionError> {
        self.host.state.lock().uploads.push(remote.to_string());
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(host: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::password(host, "root", "pw")
    }

    #[tokio::test]
    async fn test_rules_match_first_substring() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("n1")
            .on("hostname", "gpu-node-1\n")
            .on("host", "never");
        let shell = fleet.connect(&conn("n1")).await.unwrap();
        let out = shell.run("hostname").await.unwrap();
        assert_eq!(out.stdout_trimmed(), "gpu-node-1");
        let out = shell.run("uname -r").await.unwrap();
        assert_eq!(out, CommandOutput::default());
        assert!(fleet.host("n1").ran("uname"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("n2")
            .fail_connect(SessionError::network("n2:22", "no route to host"));
        let err = fleet.connect(&conn("n2")).await.err().unwrap();
        assert!(err.is_network());
        assert_eq!(fleet.host("n2").sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_process() {
        let fleet = ScriptedConnector::new();
        let host = fleet.host("n3");
        host.on_slow("sleep", "", Duration::from_secs(60));
        let shell = fleet.connect(&conn("n3")).await.unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let watcher = host.clone();
        tokio::spawn(async move {
            while watcher.running() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        let err = shell
            .exec("sleep 60", ExecOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Cancelled);
        assert_eq!(host.running(), 0);
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let fleet = ScriptedConnector::new();
        fleet.host("n4").on_slow("nccl", "", Duration::from_secs(30));
        let shell = fleet.connect(&conn("n4")).await.unwrap();
        let opts = ExecOptions::with_timeout(Duration::from_millis(20)).elevated();
        let quick = shell
            .exec("all_reduce_perf", opts, &CancellationToken::new())
            .await;
        assert!(quick.is_ok(), "pattern does not match, command is instant");

        let err = shell
            .exec("nccl-tests", opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Timeout(Duration::from_millis(20)));
        assert!(fleet.host("n4").executed()[1].elevated);
    }

    #[tokio::test]
    async fn test_drop_releases_session() {
        let fleet = ScriptedConnector::new();
        let shell = fleet.connect(&conn("n5")).await.unwrap();
        drop(shell);
        let host = fleet.host("n5");
        assert_eq!(host.sessions_opened(), 1);
        assert_eq!(host.sessions_released(), 1);
    }
}
