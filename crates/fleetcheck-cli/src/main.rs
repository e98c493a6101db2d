mod args;
mod client;
mod output;
mod request;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleetcheck_common::{
    BurninJob, Job, MultiNodeRun, NodeActivity, NodeSummary, PrerequisiteReport, ReferenceTable,
    TrustReport,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::args::{Args, BurninCommand, Command, MemoryKind, MultiNodeCommand};
use crate::client::ApiClient;
use crate::output::{
    print_benchmarks, print_burnin, print_burnins, print_job, print_jobs, print_multi_node,
    print_node_status, print_prereq, print_summary, print_trust,
};
use crate::request::{build_connection, load_nodes};

#[derive(Deserialize)]
struct Benchmarks {
    benchmarks: ReferenceTable,
    source: String,
}

#[derive(Deserialize)]
struct NodeStatusView {
    nodes: Vec<NodeActivity>,
}

async fn watch_job(client: &ApiClient, job_id: &str, interval: Duration) -> Result<()> {
    loop {
        let job: Job = client.get(&format!("/gpu-inspection/job/{job_id}")).await?;
        if job.status.is_terminal() {
            print_job(&job);
            return Ok(());
        }
        let done = job.nodes.iter().filter(|n| n.status.is_terminal()).count();
        println!("… {job_id}: {:?} ({done}/{} nodes finished)", job.status, job.nodes.len());
        tokio::time::sleep(interval).await;
    }
}

async fn watch_multi_node(client: &ApiClient, test_id: &str, interval: Duration) -> Result<()> {
    loop {
        let run: MultiNodeRun = client
            .get(&format!("/gpu-inspection/multi-node-nccl/{test_id}"))
            .await?;
        if run.status.is_terminal() {
            print_multi_node(&run);
            return Ok(());
        }
        println!("… {test_id}: {:?}", run.status);
        tokio::time::sleep(interval).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = ApiClient::new(&args.server_url, args.token);

    match args.command {
        Command::Probe { conn } => {
            let body = json!({"connection": build_connection(&conn)?});
            let summary: NodeSummary = client.post("/ssh/test-connection", &body).await?;
            print_summary(&summary);
        }
        Command::Check { conn, commands } => {
            let body = json!({"connection": build_connection(&conn)?, "commands": commands});
            let report: PrerequisiteReport = client.post("/ssh/check-commands", &body).await?;
            print_prereq(&report);
        }
        Command::Run {
            nodes_file,
            tests,
            dcgm_level,
            name,
            watch,
            interval,
        } => {
            let body = json!({
                "jobName": name,
                "nodes": load_nodes(&nodes_file)?,
                "tests": tests,
                "dcgmLevel": dcgm_level,
            });
            let created: Value = client.post("/gpu-inspection/create-job", &body).await?;
            let job_id = created["jobId"]
                .as_str()
                .context("response carried no jobId")?
                .to_string();
            println!("✓ Job created: {job_id}");
            if watch {
                watch_job(&client, &job_id, Duration::from_secs(interval.max(1))).await?;
            }
        }
        Command::Job { id } => {
            let job: Job = client.get(&format!("/gpu-inspection/job/{id}")).await?;
            print_job(&job);
        }
        Command::Jobs => {
            let jobs: Vec<Job> = client.get("/gpu-inspection/jobs").await?;
            print_jobs(&jobs);
        }
        Command::Stop { id } => {
            let job: Job = client
                .post(&format!("/gpu-inspection/stop-job/{id}"), &json!({}))
                .await?;
            println!("✓ Stop requested for {} ({:?})", job.job_id, job.status);
        }
        Command::MultiNode { subcommand } => match subcommand {
            MultiNodeCommand::Start {
                launcher,
                hosts,
                hostfile,
                gpu_per_node,
                btl_tcp_if,
                nccl_socket_ifname,
                nccl_ib_hca,
                parser,
                watch,
                interval,
            } => {
                let hostfile_content = match hostfile {
                    Some(path) => Some(
                        std::fs::read_to_string(&path)
                            .with_context(|| format!("read hostfile {}", path.display()))?,
                    ),
                    None => None,
                };
                let body = json!({
                    "hosts": hosts,
                    "hostfileContent": hostfile_content,
                    "connection": build_connection(&launcher)?,
                    "parser": parser,
                    "mpiParams": {
                        "gpuPerNode": gpu_per_node,
                        "btl_tcp_if": btl_tcp_if,
                        "nccl_socket_ifname": nccl_socket_ifname,
                        "nccl_ib_hca": nccl_ib_hca,
                    },
                });
                let started: Value = client.post("/gpu-inspection/multi-node-nccl", &body).await?;
                let test_id = started["testId"]
                    .as_str()
                    .context("response carried no testId")?
                    .to_string();
                println!("✓ Multi-node test started: {test_id}");
                if watch {
                    watch_multi_node(&client, &test_id, Duration::from_secs(interval.max(1))).await?;
                }
            }
            MultiNodeCommand::Poll { id } => {
                let run: MultiNodeRun = client
                    .get(&format!("/gpu-inspection/multi-node-nccl/{id}"))
                    .await?;
                print_multi_node(&run);
            }
            MultiNodeCommand::Cancel { id } => {
                let run: MultiNodeRun = client
                    .post(&format!("/gpu-inspection/multi-node-nccl/{id}/cancel"), &json!({}))
                    .await?;
                println!("✓ Cancel requested for {} ({:?})", run.test_id, run.status);
            }
        },
        Command::Trust { nodes_file } => {
            let body = json!({"nodes": load_nodes(&nodes_file)?});
            let report: TrustReport = client.post("/gpu-inspection/setup-ssh-trust", &body).await?;
            print_trust(&report);
        }
        Command::Burnin { subcommand } => match subcommand {
            BurninCommand::Create {
                conn,
                memory_type,
                memory_value,
                duration,
                node_name,
            } => {
                let memory_type = match memory_type {
                    MemoryKind::Percentage => "percentage",
                    MemoryKind::Fixed => "fixed",
                };
                let body = json!({
                    "connection": build_connection(&conn)?,
                    "nodeName": node_name,
                    "memoryType": memory_type,
                    "memoryValue": memory_value,
                    "duration": duration,
                });
                let created: Value = client.post("/burnin/create", &body).await?;
                println!("✓ Burn-in created: {}", created["jobId"].as_str().unwrap_or("?"));
            }
            BurninCommand::Status { id } => {
                let job: BurninJob = client.get(&format!("/burnin/jobs/{id}")).await?;
                print_burnin(&job);
            }
            BurninCommand::List => {
                let jobs: Vec<BurninJob> = client.get("/burnin/jobs").await?;
                print_burnins(&jobs);
            }
            BurninCommand::Stop { id } => {
                let job: BurninJob = client
                    .post("/burnin/stop", &json!({"jobId": id}))
                    .await?;
                println!("✓ Stop requested for {} ({:?})", job.job_id, job.status);
            }
        },
        Command::Benchmarks => {
            let b: Benchmarks = client.get("/config/gpu-benchmarks").await?;
            print_benchmarks(&b.benchmarks, &b.source);
        }
        Command::NodeStatus => {
            let view: NodeStatusView = client.get("/gpu-inspection/node-status").await?;
            print_node_status(&view.nodes);
        }
    }
    Ok(())
}
