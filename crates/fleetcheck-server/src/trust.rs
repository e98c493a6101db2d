//! Passwordless root SSH between the nodes of a multi-node run.

use std::sync::Arc;

use fleetcheck_common::{ConnectionDescriptor, TrustReport, TrustResult, TrustStatus};
use fleetcheck_remote::command::quote;
use fleetcheck_remote::{CancellationToken, Connector, ExecOptions, RemoteShell, SessionError};
use futures_util::future::join_all;

use crate::error::OrchestratorError;
use crate::probe;

const SSH_DIR_CMD: &str = "mkdir -p /root/.ssh && chmod 700 /root/.ssh";
// Guarded on the private key: ssh-keygen prompts before overwriting one.
const KEYGEN_CMD: &str = "test -f /root/.ssh/id_rsa \
     || ssh-keygen -t rsa -b 2048 -f /root/.ssh/id_rsa -N '' -q; \
     test -f /root/.ssh/id_rsa.pub \
     || ssh-keygen -y -f /root/.ssh/id_rsa > /root/.ssh/id_rsa.pub";
const READ_PUBKEY_CMD: &str = "cat /root/.ssh/id_rsa.pub";

pub enum TrustOutcome {
    Completed(TrustReport),
    /// Fewer than two nodes produced a public key; nothing was distributed.
    InsufficientKeys(TrustReport),
}

struct Collected {
    internal_ip: String,
    pubkey: String,
}

pub struct TrustProvisioner {
    connector: Arc<dyn Connector>,
}

impl TrustProvisioner {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub async fn setup(&self, nodes: Vec<ConnectionDescriptor>) -> Result<TrustOutcome, OrchestratorError> {
        if nodes.len() < 2 {
            return Err(OrchestratorError::Validation(
                "ssh trust requires at least 2 nodes".into(),
            ));
        }
        for (idx, node) in nodes.iter().enumerate() {
            node.validate()
                .map_err(|e| OrchestratorError::Validation(format!("node {}: {e}", idx + 1)))?;
        }

        let collected = join_all(nodes.iter().map(|n| self.collect(n))).await;
        let mut results: Vec<TrustResult> = nodes
            .iter()
            .zip(&collected)
            .map(|(node, c)| match c {
                Ok(c) => TrustResult {
                    host: node.host.clone(),
                    status: TrustStatus::PubkeyCollected,
                    message: "public key collected".into(),
                    internal_ip: Some(c.internal_ip.clone()),
                },
                Err(e) => TrustResult {
                    host: node.host.clone(),
                    status: TrustStatus::Error,
                    message: e.to_string(),
                    internal_ip: None,
                },
            })
            .collect();

        let keys: Vec<&str> = collected
            .iter()
            .filter_map(|c| c.as_ref().ok())
            .map(|c| c.pubkey.as_str())
            .collect();
        if keys.len() < 2 {
            tracing::warn!(collected = keys.len(), "not enough public keys for ssh trust");
            return Ok(TrustOutcome::InsufficientKeys(TrustReport::new(results)));
        }
        let peers: Vec<&str> = collected
            .iter()
            .filter_map(|c| c.as_ref().ok())
            .map(|c| c.internal_ip.as_str())
            .collect();

        let distributed = join_all(
            nodes
                .iter()
                .zip(&collected)
                .filter(|(_, c)| c.is_ok())
                .map(|(node, _)| self.distribute(node, &keys, &peers)),
        )
        .await;
        let ok_idx: Vec<usize> = collected
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_ok())
            .map(|(i, _)| i)
            .collect();
        for (&idx, outcome) in ok_idx.iter().zip(distributed) {
            let entry = &mut results[idx];
            match outcome {
                Ok(()) => {
                    entry.status = TrustStatus::Success;
                    entry.message = format!("trusted by {} peers", keys.len() - 1);
                }
                Err(e) => {
                    entry.status = TrustStatus::Error;
                    entry.message = format!("key distribution failed: {e}");
                }
            }
        }

        let Some(&launcher_idx) = ok_idx
            .iter()
            .find(|&&i| results[i].status == TrustStatus::Success)
        else {
            return Ok(TrustOutcome::Completed(TrustReport::new(results)));
        };
        let verdicts = self
            .verify_from(&nodes[launcher_idx], launcher_idx, &results)
            .await;
        for (idx, reachable) in verdicts {
            if !reachable {
                let entry = &mut results[idx];
                entry.status = TrustStatus::Error;
                entry.message = format!(
                    "{} cannot reach {} over ssh",
                    nodes[launcher_idx].display_name(),
                    entry.internal_ip.as_deref().unwrap_or(&entry.host)
                );
            }
        }

        let report = TrustReport::new(results);
        tracing::info!(success = report.success_count, total = report.total_count, "ssh trust configured");
        Ok(TrustOutcome::Completed(report))
    }

    async fn collect(&self, node: &ConnectionDescriptor) -> Result<Collected, SessionError> {
        let shell = self.connector.connect(node).await?;
        let result = async {
            let cancel = CancellationToken::new();
            let root = ExecOptions::default().elevated();
            checked(&*shell, SSH_DIR_CMD, root, &cancel).await?;
            let internal_ip = probe::internal_ip(&*shell, &cancel)
                .await
                .unwrap_or_else(|| node.host.clone());
            checked(&*shell, KEYGEN_CMD, root, &cancel).await?;
            let pubkey = checked(&*shell, READ_PUBKEY_CMD, root, &cancel).await?;
            let pubkey = pubkey.trim().to_string();
            if !pubkey.starts_with("ssh-") {
                return Err(SessionError::Channel("no RSA public key found".into()));
            }
            Ok::<_, SessionError>(Collected { internal_ip, pubkey })
        }
        .await;
        shell.close().await;
        result
    }

    async fn distribute(
        &self,
        node: &ConnectionDescriptor,
        keys: &[&str],
        peers: &[&str],
    ) -> Result<(), SessionError> {
        let shell = self.connector.connect(node).await?;
        let result = async {
            let cancel = CancellationToken::new();
            let root = ExecOptions::default().elevated();
            for key in keys {
                let key = quote(key)?;
                let cmd = format!(
                    "touch /root/.ssh/authorized_keys && \
                     (grep -qxF {key} /root/.ssh/authorized_keys || echo {key} >> /root/.ssh/authorized_keys) && \
                     chmod 600 /root/.ssh/authorized_keys"
                );
                checked(&*shell, &cmd, root, &cancel).await?;
            }

            let host_line = quote(&format!("Host {}", peers.join(" ")))?;
            let config = format!(
                "touch /root/.ssh/config && \
                 (grep -qxF {host_line} /root/.ssh/config || printf '%s\\n' {host_line} '    StrictHostKeyChecking no' >> /root/.ssh/config) && \
                 chmod 600 /root/.ssh/config"
            );
            checked(&*shell, &config, root, &cancel).await?;

            let quoted: Vec<String> = peers.iter().map(|p| quote(p)).collect::<Result<_, _>>()?;
            let scan = format!(
                "(ssh-keyscan -t rsa {} >> /root/.ssh/known_hosts 2>/dev/null || true) && \
                 sort -u /root/.ssh/known_hosts -o /root/.ssh/known_hosts",
                quoted.join(" ")
            );
            checked(&*shell, &scan, root, &cancel).await?;
            Ok::<_, SessionError>(())
        }
        .await;
        shell.close().await;
        result
    }

    /// `(result index, reachable)` for every other trusted node.
    async fn verify_from(
        &self,
        launcher: &ConnectionDescriptor,
        launcher_idx: usize,
        results: &[TrustResult],
    ) -> Vec<(usize, bool)> {
        let targets: Vec<(usize, String)> = results
            .iter()
            .enumerate()
            .filter(|(i, r)| *i != launcher_idx && r.status == TrustStatus::Success)
            .filter_map(|(i, r)| r.internal_ip.clone().map(|ip| (i, ip)))
            .collect();

        let shell = match self.connector.connect(launcher).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(host = %launcher.host, error = %e, "launcher unreachable for ssh verification");
                return targets.into_iter().map(|(i, _)| (i, false)).collect();
            }
        };
        let cancel = CancellationToken::new();
        let mut verdicts = Vec::with_capacity(targets.len());
        for (idx, ip) in targets {
            let reachable = match quote(&ip) {
                Ok(q) => {
                    let cmd = format!(
                        "ssh -o BatchMode=yes -o ConnectTimeout=5 {q} true >/dev/null 2>&1 && echo OK || echo FAIL"
                    );
                    shell
                        .exec(&cmd, ExecOptions::default().elevated(), &cancel)
                        .await
                        .is_ok_and(|out| out.stdout_trimmed() == "OK")
                }
                Err(_) => false,
            };
            verdicts.push((idx, reachable));
        }
        shell.close().await;
        verdicts
    }
}

async fn checked(
    shell: &dyn RemoteShell,
    cmd: &str,
    opts: ExecOptions,
    cancel: &CancellationToken,
) -> Result<String, SessionError> {
    let out = shell.exec(cmd, opts, cancel).await?;
    if out.success() {
        Ok(out.stdout)
    } else {
        Err(SessionError::Channel(format!(
            "exit {}: {}",
            out.exit_code,
            out.stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_remote::ScriptedConnector;

    fn node(host: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::password(host, "root", "pw")
    }

    fn ready(fleet: &ScriptedConnector, host: &str, ip: &str) {
        fleet
            .host(host)
            .on("ip route get", ip)
            .on("id_rsa.pub", &format!("ssh-rsa AAAAB3Nza{host} root@{host}\n"))
            .on("BatchMode=yes", "OK");
    }

    #[tokio::test]
    async fn test_trust_with_one_unreachable_node() {
        let fleet = ScriptedConnector::new();
        ready(&fleet, "gpu-1", "192.168.0.1");
        ready(&fleet, "gpu-2", "192.168.0.2");
        fleet
            .host("gpu-3")
            .fail_connect(SessionError::auth("gpu-3:22", "password rejected"));
        let trust = TrustProvisioner::new(Arc::new(fleet.clone()));

        let outcome = trust
            .setup(vec![node("gpu-1"), node("gpu-2"), node("gpu-3")])
            .await
            .unwrap();
        let TrustOutcome::Completed(report) = outcome else {
            panic!("expected completed trust setup");
        };
        assert_eq!(report.total_count, 3);
        assert_eq!(report.success_count, 2);
        assert_eq!(report.results[2].status, TrustStatus::Error);
        assert_eq!(report.results[0].internal_ip.as_deref(), Some("192.168.0.1"));

        let gpu2 = fleet.host("gpu-2");
        assert!(gpu2.ran("AAAAB3Nzagpu-1"));
        assert!(gpu2.ran("ssh-keyscan"));
        assert!(gpu2.executed().iter().all(|c| c.elevated || c.command.contains("ip route")));
        assert!(fleet.host("gpu-1").ran("192.168.0.2"));
    }

    #[tokio::test]
    async fn test_single_key_is_insufficient() {
        let fleet = ScriptedConnector::new();
        ready(&fleet, "gpu-1", "192.168.1.1");
        fleet
            .host("gpu-2")
            .fail_connect(SessionError::network("gpu-2:22", "no route to host"));
        let trust = TrustProvisioner::new(Arc::new(fleet.clone()));

        let outcome = trust.setup(vec![node("gpu-1"), node("gpu-2")]).await.unwrap();
        let TrustOutcome::InsufficientKeys(report) = outcome else {
            panic!("expected insufficient keys");
        };
        assert_eq!(report.results[0].status, TrustStatus::PubkeyCollected);
        assert!(!fleet.host("gpu-1").ran("authorized_keys"));
    }

    #[tokio::test]
    async fn test_unverified_peer_is_reported() {
        let fleet = ScriptedConnector::new();
        fleet
            .host("gpu-1")
            .on("ip route get", "192.168.2.1")
            .on("id_rsa.pub", "ssh-rsa AAAAB3Nzagpu-1 root@gpu-1\n")
            .on("BatchMode=yes", "FAIL");
        ready(&fleet, "gpu-2", "192.168.2.2");
        let trust = TrustProvisioner::new(Arc::new(fleet.clone()));

        let outcome = trust.setup(vec![node("gpu-1"), node("gpu-2")]).await.unwrap();
        let TrustOutcome::Completed(report) = outcome else {
            panic!("expected completed trust setup");
        };
        assert_eq!(report.results[0].status, TrustStatus::Success);
        assert_eq!(report.results[1].status, TrustStatus::Error);
        assert!(report.results[1].message.contains("192.168.2.2"));
    }

    #[tokio::test]
    async fn test_keygen_keeps_existing_private_key() {
        let fleet = ScriptedConnector::new();
        ready(&fleet, "gpu-1", "192.168.3.1");
        ready(&fleet, "gpu-2", "192.168.3.2");
        let trust = TrustProvisioner::new(Arc::new(fleet.clone()));
        trust.setup(vec![node("gpu-1"), node("gpu-2")]).await.unwrap();

        let exec = fleet.host("gpu-1").executed();
        let keygen = exec
            .iter()
            .find(|c| c.command.contains("ssh-keygen -t rsa"))
            .unwrap();
        assert!(keygen.command.starts_with("test -f /root/.ssh/id_rsa ||"));
        assert!(keygen.command.contains("ssh-keygen -y -f /root/.ssh/id_rsa"));
    }

    #[tokio::test]
    async fn test_requires_two_nodes() {
        let fleet = ScriptedConnector::new();
        let trust = TrustProvisioner::new(Arc::new(fleet.clone()));
        assert!(matches!(
            trust.setup(vec![node("gpu-1")]).await,
            Err(OrchestratorError::Validation(_))
        ));
        assert_eq!(fleet.host("gpu-1").sessions_opened(), 0);
    }
}
