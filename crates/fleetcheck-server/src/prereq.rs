use std::collections::BTreeMap;
use std::sync::OnceLock;

use fleetcheck_common::{PrerequisiteReport, VersionInfo};
use fleetcheck_remote::command::quote;
use fleetcheck_remote::{CancellationToken, ExecOptions, RemoteShell, SessionError};
use regex::Regex;

/// How one requested prerequisite is verified on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Probe {
    OnPath(String),
    Executable(String),
    Package(String),
    ModuleLoaded(&'static str),
    ModuleAbsent(&'static str),
    AcsDisabled,
    ServiceActive(&'static str),
    Unlimited(&'static str),
}

impl Probe {
    fn for_name(name: &str) -> Self {
        match name {
            "nvidia_peermem" => Self::ModuleLoaded("nvidia_peermem"),
            "nouveau_unloaded" => Self::ModuleAbsent("nouveau"),
            "acsctl_disabled" => Self::AcsDisabled,
            "nvidia_fabricmanager_active" => Self::ServiceActive("nvidia-fabricmanager"),
            "ulimit_max_locked_memory" => Self::Unlimited("max locked memory"),
            "ulimit_max_memory_size" => Self::Unlimited("max memory size"),
            n if n.contains('/') => Self::Executable(n.to_string()),
            n if n.starts_with("lib") => Self::Package(n.to_string()),
            n => Self::OnPath(n.to_string()),
        }
    }

    fn command(&self) -> Result<String, SessionError> {
        Ok(match self {
            Self::OnPath(name) => {
                format!("command -v {} >/dev/null 2>&1 && echo OK || echo MISSING", quote(name)?)
            }
            Self::Executable(path) => format!("test -x {} && echo OK || echo MISSING", quote(path)?),
            Self::Package(name) => {
                let q = quote(name)?;
                format!(
                    "(dpkg-query -W -f='${{Status}}' {q} 2>/dev/null | grep -q 'install ok installed' \
                     || rpm -q {q} >/dev/null 2>&1) && echo OK || echo MISSING"
                )
            }
            Self::ModuleLoaded(module) => {
                format!("lsmod | awk '{{print $1}}' | grep -qx {module} && echo OK || echo MISSING")
            }
            Self::ModuleAbsent(module) => {
                format!("lsmod | awk '{{print $1}}' | grep -qx {module} && echo LOADED || echo OK")
            }
            Self::AcsDisabled => "lspci -vvv 2>/dev/null | grep -i 'ACSCtl' || true".to_string(),
            Self::ServiceActive(unit) => format!("systemctl is-active {unit} 2>/dev/null || true"),
            Self::Unlimited(_) => "ulimit -a".to_string(),
        })
    }

    fn elevated(&self) -> bool {
        matches!(self, Self::AcsDisabled | Self::Unlimited(_))
    }

    fn evaluate(&self, stdout: &str) -> bool {
        match self {
            Self::AcsDisabled => stdout
                .lines()
                .filter(|l| l.contains("ACSCtl"))
                .all(|l| !l.contains('+')),
            Self::ServiceActive(_) => stdout.trim() == "active",
            Self::Unlimited(row) => stdout
                .lines()
                .find(|l| l.trim_start().starts_with(row))
                .and_then(|l| l.split_whitespace().last())
                .is_some_and(|v| v == "unlimited"),
            _ => stdout.lines().rev().find(|l| !l.trim().is_empty()).map(str::trim) == Some("OK"),
        }
    }
}

const NVCC_CMD: &str = "/usr/local/cuda/bin/nvcc --version 2>/dev/null || nvcc --version 2>/dev/null || true";
const NCCL_PACKAGES_CMD: &str = "apt list --installed 2>/dev/null | grep -E '^libnccl' \
     || rpm -qa 2>/dev/null | grep -E '^libnccl' || true";

fn nvcc_release() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"release\s+(\d+\.\d+)|V(\d+\.\d+)")
            .unwrap_or_else(|e| unreachable!("nvcc release pattern is valid: {e}"))
    })
}

fn nccl_flavour() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+\.\d+\.\d+)-\d+\+cuda(\d+\.\d+)")
            .unwrap_or_else(|e| unreachable!("nccl package pattern is valid: {e}"))
    })
}

pub fn parse_nvcc_version(output: &str) -> Option<String> {
    let caps = nvcc_release().captures(output)?;
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
}

/// CUDA flavours of the runtime and development NCCL packages, from either
/// an `apt list --installed` or an `rpm -qa` listing.
pub fn parse_nccl_packages(listing: &str) -> (Option<String>, Option<String>) {
    let mut runtime = None;
    let mut dev = None;
    for line in listing.lines().map(str::trim) {
        let Some(caps) = nccl_flavour().captures(line) else {
            continue;
        };
        let cuda = caps[2].to_string();
        if line.starts_with("libnccl-dev") {
            dev.get_or_insert(cuda);
        } else if line.starts_with("libnccl2/")
            || line
                .strip_prefix("libnccl-")
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        {
            runtime.get_or_insert(cuda);
        }
    }
    (runtime, dev)
}

/// Checks each requested command on a node. Probe failures count as absent.
#[derive(Debug, Clone, Default)]
pub struct PrereqChecker;

impl PrereqChecker {
    pub async fn check(
        &self,
        shell: &dyn RemoteShell,
        commands: &[String],
        cancel: &CancellationToken,
    ) -> PrerequisiteReport {
        PrerequisiteReport {
            commands: self.probe_all(shell, commands, cancel).await,
            versions: self.versions(shell, cancel).await,
        }
    }

    /// Per-command probes only, keyed by the name exactly as requested.
    /// Blank names are reported absent without touching the node.
    pub async fn probe_all(
        &self,
        shell: &dyn RemoteShell,
        commands: &[String],
        cancel: &CancellationToken,
    ) -> BTreeMap<String, bool> {
        let mut report = BTreeMap::new();
        for requested in commands {
            if report.contains_key(requested) {
                continue;
            }
            let name = requested.trim();
            let ok = !name.is_empty() && self.probe(shell, name, cancel).await;
            report.insert(requested.clone(), ok);
        }
        report
    }

    async fn probe(&self, shell: &dyn RemoteShell, name: &str, cancel: &CancellationToken) -> bool {
        let probe = Probe::for_name(name);
        let command = match probe.command() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(host = shell.host(), name, error = %e, "invalid prerequisite name");
                return false;
            }
        };
        let opts = if probe.elevated() {
            ExecOptions::default().elevated()
        } else {
            ExecOptions::default()
        };
        match shell.exec(&command, opts, cancel).await {
            Ok(out) => probe.evaluate(&out.stdout),
            Err(e) => {
                tracing::warn!(host = shell.host(), name, error = %e, "prerequisite probe failed");
                false
            }
        }
    }

    async fn versions(&self, shell: &dyn RemoteShell, cancel: &CancellationToken) -> VersionInfo {
        let nvcc = match shell.exec(NVCC_CMD, ExecOptions::default(), cancel).await {
            Ok(out) => parse_nvcc_version(&out.stdout),
            Err(e) => {
                tracing::warn!(host = shell.host(), error = %e, "nvcc version probe failed");
                None
            }
        };
        if nvcc.is_none() {
            return VersionInfo::new(None, None, None);
        }
        let (runtime, dev) = match shell.exec(NCCL_PACKAGES_CMD, ExecOptions::default(), cancel).await {
            Ok(out) => parse_nccl_packages(&out.stdout),
            Err(e) => {
                tracing::warn!(host = shell.host(), error = %e, "nccl package probe failed");
                (None, None)
            }
        };
        VersionInfo::new(nvcc, runtime, dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_common::ConnectionDescriptor;
    use fleetcheck_remote::{Connector, ScriptedConnector};

    #[test]
    fn test_probe_selection() {
        assert_eq!(Probe::for_name("nvidia-smi"), Probe::OnPath("nvidia-smi".into()));
        assert_eq!(
            Probe::for_name("/usr/bin/dcgmi"),
            Probe::Executable("/usr/bin/dcgmi".into())
        );
        assert_eq!(Probe::for_name("libnccl2"), Probe::Package("libnccl2".into()));
        assert_eq!(Probe::for_name("acsctl_disabled"), Probe::AcsDisabled);
    }

    #[test]
    fn test_acs_and_ulimit_evaluation() {
        let acs = Probe::AcsDisabled;
        assert!(acs.evaluate(""));
        assert!(acs.evaluate("\t\tACSCtl:\tSrcValid- TransBlk- ReqRedir-\n"));
        assert!(!acs.evaluate("\t\tACSCtl:\tSrcValid+ TransBlk- ReqRedir+\n"));

        let ulimit = Probe::Unlimited("max locked memory");
        assert!(ulimit.evaluate("core file size (blocks, -c) 0\nmax locked memory (kbytes, -l) unlimited\n"));
        assert!(!ulimit.evaluate("max locked memory (kbytes, -l) 8192\n"));
    }

    #[test]
    fn test_version_parsing() {
        let nvcc = "nvcc: NVIDIA (R) Cuda compiler driver\nCuda compilation tools, release 12.2, V12.2.140\n";
        assert_eq!(parse_nvcc_version(nvcc).as_deref(), Some("12.2"));

        let apt = "libnccl-dev/unknown,now 2.18.3-1+cuda12.2 amd64 [installed]\n\
                   libnccl2/unknown,now 2.18.3-1+cuda12.2 amd64 [installed]\n";
        assert_eq!(
            parse_nccl_packages(apt),
            (Some("12.2".into()), Some("12.2".into()))
        );

        let rpm = "libnccl-2.19.3-1+cuda12.3.x86_64\nlibnccl-devel-2.19.3-1+cuda12.3.x86_64\n";
        assert_eq!(
            parse_nccl_packages(rpm),
            (Some("12.3".into()), Some("12.3".into()))
        );
    }

    #[tokio::test]
    async fn test_absent_compiler_still_reports() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("n1")
            .on("command -v 'nvidia-smi'", "OK")
            .on("command -v nvidia-smi", "OK")
            .on("command -v", "MISSING");
        let shell = fleet
            .connect(&ConnectionDescriptor::password("n1", "root", "pw"))
            .await
            .unwrap();

        let names = vec!["nvidia-smi".to_string(), "mpirun".to_string(), "nvidia-smi".to_string()];
        let report = PrereqChecker.check(&*shell, &names, &CancellationToken::new()).await;
        assert_eq!(report.commands.len(), 2);
        assert_eq!(report.commands["nvidia-smi"], true);
        assert_eq!(report.commands["mpirun"], false);
        assert_eq!(report.versions.nvcc, None);
        assert!(!report.versions.version_match);
        assert!(!fleet.host("n1").ran("apt list"));
    }

    #[tokio::test]
    async fn test_matching_versions() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("n2")
            .on("nvcc --version", "Cuda compilation tools, release 12.2, V12.2.140")
            .on(
                "libnccl",
                "libnccl-dev/unknown,now 2.18.3-1+cuda12.2 amd64\nlibnccl2/unknown,now 2.18.3-1+cuda12.2 amd64\n",
            );
        let shell = fleet
            .connect(&ConnectionDescriptor::password("n2", "root", "pw"))
            .await
            .unwrap();

        let report = PrereqChecker.check(&*shell, &[], &CancellationToken::new()).await;
        assert!(report.commands.is_empty());
        assert!(report.versions.version_match);
    }

    #[tokio::test]
    async fn test_report_keys_follow_request() {
        let fleet = ScriptedConnector::new();
        fleet.host("n3").on("command -v 'nvidia-smi'", "OK").on("command -v nvidia-smi", "OK");
        let shell = fleet
            .connect(&ConnectionDescriptor::password("n3", "root", "pw"))
            .await
            .unwrap();

        let names = vec![" nvidia-smi".to_string(), "".to_string()];
        let report = PrereqChecker
            .probe_all(&*shell, &names, &CancellationToken::new())
            .await;
        assert_eq!(report.len(), 2);
        assert_eq!(report[" nvidia-smi"], true);
        assert_eq!(report[""], false);
        assert!(!fleet.host("n3").ran("nvcc"));
    }
}
