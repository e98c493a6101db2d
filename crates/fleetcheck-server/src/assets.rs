use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetcheck_remote::command::quote;
use fleetcheck_remote::{CancellationToken, ExecOptions, RemoteShell};

use crate::bench::BenchError;

const STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Binaries and archives shipped to nodes before a test runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    Nvbandwidth,
    P2pBandwidthLatency,
    NcclTests,
    IbHealthCheck,
    GpuBurn,
}

impl Asset {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Nvbandwidth => "nvbandwidth",
            Self::P2pBandwidthLatency => "p2pBandwidthLatencyTest",
            Self::NcclTests => "nccl-tests.tgz",
            Self::IbHealthCheck => "ib_health_check.sh",
            Self::GpuBurn => "gpu-burn.tgz",
        }
    }

    /// For archives: directory the tarball unpacks into, and the executable
    /// inside it that proves the unpack happened.
    fn unpacked(self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::NcclTests => Some(("nccl-tests", "build/all_reduce_perf")),
            Self::GpuBurn => Some(("gpu-burn", "gpu_burn")),
            _ => None,
        }
    }
}

/// Places tools in the remote work directory. A local copy under the assets
/// directory is always uploaded; without one the remote copy must already be
/// there.
#[derive(Debug, Clone)]
pub struct ToolStager {
    assets_dir: Option<PathBuf>,
    workdir: String,
}

impl ToolStager {
    pub fn new(assets_dir: Option<PathBuf>, workdir: impl Into<String>) -> Self {
        let workdir: String = workdir.into();
        Self {
            assets_dir,
            workdir: workdir.trim_end_matches('/').to_string(),
        }
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn remote_path(&self, name: &str) -> String {
        format!("{}/{}", self.workdir, name)
    }

    fn local(&self, asset: Asset) -> Option<PathBuf> {
        let path = self.assets_dir.as_deref()?.join(asset.file_name());
        path.is_file().then_some(path)
    }

    pub async fn prepare_workdir(
        &self,
        shell: &dyn RemoteShell,
        cancel: &CancellationToken,
    ) -> Result<(), BenchError> {
        let cmd = format!("mkdir -p {}", quote(&self.workdir)?);
        let out = shell
            .exec(&cmd, ExecOptions::with_timeout(STAGE_TIMEOUT), cancel)
            .await?;
        if !out.success() {
            return Err(BenchError::ToolExecution {
                tool: "mkdir".into(),
                code: out.exit_code,
                detail: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Remote path of a ready-to-run single-file tool.
    pub async fn ensure_executable(
        &self,
        shell: &dyn RemoteShell,
        asset: Asset,
        cancel: &CancellationToken,
    ) -> Result<String, BenchError> {
        let remote = self.remote_path(asset.file_name());
        if let Some(local) = self.local(asset) {
            self.prepare_workdir(shell, cancel).await?;
            self.upload(shell, &local, &remote, 0o755).await?;
            return Ok(remote);
        }
        if is_executable(shell, &remote, cancel).await? {
            Ok(remote)
        } else {
            Err(BenchError::ToolMissing(asset.file_name().to_string()))
        }
    }

    /// Remote directory of an unpacked archive tool, unpacking it when the
    /// executable inside is not present yet.
    pub async fn ensure_unpacked(
        &self,
        shell: &dyn RemoteShell,
        asset: Asset,
        cancel: &CancellationToken,
    ) -> Result<String, BenchError> {
        let (dir_name, probe) = asset
            .unpacked()
            .ok_or_else(|| BenchError::Precondition(format!("{} is not an archive", asset.file_name())))?;
        let dir = self.remote_path(dir_name);
        let probe_path = format!("{dir}/{probe}");
        if is_executable(shell, &probe_path, cancel).await? {
            return Ok(dir);
        }

        let Some(local) = self.local(asset) else {
            return Err(BenchError::ToolMissing(asset.file_name().to_string()));
        };
        self.prepare_workdir(shell, cancel).await?;
        let tgz = self.remote_path(asset.file_name());
        self.upload(shell, &local, &tgz, 0o644).await?;

        let unpack = format!(
            "rm -rf {dir} && tar -xzf {tgz} -C {wd} && rm -f {tgz} && chmod +x {probe}",
            dir = quote(&dir)?,
            tgz = quote(&tgz)?,
            wd = quote(&self.workdir)?,
            probe = quote(&probe_path)?,
        );
        let out = shell
            .exec(&unpack, ExecOptions::with_timeout(STAGE_TIMEOUT), cancel)
            .await?;
        if !out.success() {
            return Err(BenchError::ToolExecution {
                tool: "tar".into(),
                code: out.exit_code,
                detail: out.stderr.trim().to_string(),
            });
        }
        if !is_executable(shell, &probe_path, cancel).await? {
            return Err(BenchError::ToolMissing(format!(
                "{probe} not found after unpacking {}",
                asset.file_name()
            )));
        }
        Ok(dir)
    }

    async fn upload(
        &self,
        shell: &dyn RemoteShell,
        local: &Path,
        remote: &str,
        mode: i32,
    ) -> Result<(), BenchError> {
        tracing::debug!(host = shell.host(), local = %local.display(), remote, "uploading tool");
        shell.upload(local, remote, mode).await?;
        Ok(())
    }
}

async fn is_executable(
    shell: &dyn RemoteShell,
    path: &str,
    cancel: &CancellationToken,
) -> Result<bool, BenchError> {
    let cmd = format!("test -x {} && echo OK || echo MISSING", quote(path)?);
    let out = shell.exec(&cmd, ExecOptions::default(), cancel).await?;
    Ok(out.stdout_trimmed() == "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_common::ConnectionDescriptor;
    use fleetcheck_remote::{Connector, ScriptedConnector};

    fn conn(host: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::password(host, "root", "pw")
    }

    #[tokio::test]
    async fn test_missing_local_asset_uses_preinstalled_copy() {
        let fleet = ScriptedConnector::new();
        fleet.host("n1").on("test -x", "OK");
        let shell = fleet.connect(&conn("n1")).await.unwrap();
        let stager = ToolStager::new(None, "/tmp/fleetcheck/");

        let path = stager
            .ensure_executable(&*shell, Asset::Nvbandwidth, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(path, "/tmp/fleetcheck/nvbandwidth");
        assert!(fleet.host("n1").uploads().is_empty());
    }

    #[tokio::test]
    async fn test_missing_everywhere_is_tool_missing() {
        let fleet = ScriptedConnector::new();
        fleet.host("n2").on("test -x", "MISSING");
        let shell = fleet.connect(&conn("n2")).await.unwrap();
        let stager = ToolStager::new(None, "/tmp/fleetcheck");

        let err = stager
            .ensure_unpacked(&*shell, Asset::NcclTests, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::ToolMissing(ref t) if t == "nccl-tests.tgz"));
    }

    #[tokio::test]
    async fn test_local_asset_is_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ib_health_check.sh"), "#!/bin/bash\n").unwrap();
        let fleet = ScriptedConnector::new();
        let shell = fleet.connect(&conn("n3")).await.unwrap();
        let stager = ToolStager::new(Some(dir.path().to_path_buf()), "/tmp/fleetcheck");

        let path = stager
            .ensure_executable(&*shell, Asset::IbHealthCheck, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fleet.host("n3").uploads(), vec![path]);
        assert!(fleet.host("n3").ran("mkdir -p"));
    }
}
