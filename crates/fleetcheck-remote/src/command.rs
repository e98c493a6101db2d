use std::fmt;
use std::time::Duration;

use fleetcheck_common::ConnectionDescriptor;

use crate::error::SessionError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    pub timeout: Duration,
    /// Run with root privileges (sudo for non-root logins).
    pub elevate: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            elevate: false,
        }
    }
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            elevate: false,
        }
    }

    pub fn elevated(mut self) -> Self {
        self.elevate = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// stdout followed by stderr, for parsers that accept either stream.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// How privileged commands are run for one login.
#[derive(Clone, PartialEq, Eq)]
pub enum Elevation {
    Root,
    Sudo { secret: Option<String> },
}

impl fmt::Debug for Elevation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str("Root"),
            Self::Sudo { secret } => f
                .debug_struct("Sudo")
                .field("secret", &secret.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

impl Elevation {
    pub fn for_connection(conn: &ConnectionDescriptor) -> Self {
        if !conn.needs_elevation() {
            return Self::Root;
        }
        Self::Sudo {
            secret: conn.elevation_secret().map(str::to_string),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Root => "",
            Self::Sudo { secret: Some(_) } => "sudo -S -p '' ",
            Self::Sudo { secret: None } => "sudo -n ",
        }
    }

    /// Bytes to write to the channel's stdin for `sudo -S`.
    pub fn stdin_secret(&self) -> Option<String> {
        match self {
            Self::Sudo { secret: Some(s) } => Some(format!("{s}\n")),
            _ => None,
        }
    }
}

pub fn quote(s: &str) -> Result<String, SessionError> {
    shlex::try_quote(s)
        .map(|q| q.into_owned())
        .map_err(|e| SessionError::Channel(format!("cannot quote command: {e}")))
}

/// Login shell with strict mode, so profile PATHs (CUDA, MPI) apply.
pub fn wrap_bash(command: &str) -> Result<String, SessionError> {
    Ok(format!("bash -lc {}", quote(&format!("set -euo pipefail; {command}"))?))
}

/// Wire-level command lines for one remote invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    /// Runs the command in a fresh process group whose id lands in `pid_file`.
    pub line: String,
    /// Terminates that process group.
    pub kill_line: String,
    /// Written to stdin right after the channel opens.
    pub stdin: Option<String>,
}

impl Launch {
    pub fn prepare(
        command: &str,
        opts: &ExecOptions,
        elevation: &Elevation,
        pid_file: &str,
    ) -> Result<Self, SessionError> {
        let pid = quote(pid_file)?;
        let group = format!(
            "echo $$ > {pid}; {inner}; rc=$?; rm -f {pid}; exit $rc",
            inner = wrap_bash(command)?
        );
        let kill = format!(
            "if [ -f {pid} ]; then pg=$(cat {pid}); kill -TERM -- -$pg 2>/dev/null; sleep 1; \
             kill -KILL -- -$pg 2>/dev/null; rm -f {pid}; fi; true"
        );

        let (prefix, stdin) = if opts.elevate {
            (elevation.prefix(), elevation.stdin_secret())
        } else {
            ("", None)
        };

        Ok(Self {
            line: format!("{prefix}setsid -w bash -c {}", quote(&group)?),
            kill_line: format!("{prefix}bash -c {}", quote(&kill)?),
            stdin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_bash_quotes_single_quotes() {
        let w = wrap_bash("echo 'hi'").unwrap();
        assert!(w.starts_with("bash -lc "));
        let args = shlex::split(&w).unwrap();
        assert_eq!(args, vec!["bash", "-lc", "set -euo pipefail; echo 'hi'"]);
    }

    #[test]
    fn test_elevation_for_connections() {
        let root = ConnectionDescriptor::password("h", "root", "pw");
        assert_eq!(Elevation::for_connection(&root), Elevation::Root);

        let ops = ConnectionDescriptor::password("h", "ops", "pw");
        let e = Elevation::for_connection(&ops);
        assert_eq!(e.prefix(), "sudo -S -p '' ");
        assert_eq!(e.stdin_secret().as_deref(), Some("pw\n"));

        let key = ConnectionDescriptor::private_key("h", "ops", "pem", None);
        assert_eq!(Elevation::for_connection(&key).prefix(), "sudo -n ");
        assert!(!format!("{e:?}").contains("pw"));
    }

    #[test]
    fn test_launch_elevated_runs_in_own_group() {
        let e = Elevation::Sudo {
            secret: Some("pw".into()),
        };
        let opts = ExecOptions::with_timeout(Duration::from_secs(5)).elevated();
        let l = Launch::prepare("dcgmi diag -r 1", &opts, &e, "/tmp/.fc-1.pid").unwrap();
        assert!(l.line.starts_with("sudo -S -p '' setsid -w bash -c "));
        assert!(l.kill_line.starts_with("sudo -S -p '' bash -c "));
        assert_eq!(l.stdin.as_deref(), Some("pw\n"));

        let args = shlex::split(&l.line).unwrap();
        let group = args.last().unwrap();
        assert!(group.starts_with("echo $$ > "));
        assert!(group.contains("/tmp/.fc-1.pid"));
        assert!(group.contains("dcgmi diag -r 1"));
        assert!(l.kill_line.contains("kill -TERM"));
    }

    #[test]
    fn test_launch_unelevated_sends_no_secret() {
        let e = Elevation::Sudo {
            secret: Some("pw".into()),
        };
        let l = Launch::prepare("hostname", &ExecOptions::default(), &e, "/tmp/x.pid").unwrap();
        assert!(l.line.starts_with("setsid -w bash -c "));
        assert_eq!(l.stdin, None);
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput::new(1, "a", "b");
        assert!(!out.success());
        assert_eq!(out.combined(), "a\nb");
        assert_eq!(CommandOutput::new(0, " x \n", "").stdout_trimmed(), "x");
    }
}
