use fleetcheck_common::{
    BurninJob, Job, Metric, MetricStatus, MetricValue, MultiNodeRun, NodeActivity, NodeState,
    NodeSummary, PrerequisiteReport, ReferenceTable, TrustReport, TrustStatus,
};

fn mark(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}

fn metric_cell(m: &Metric) -> String {
    let value = match &m.value {
        Some(MetricValue::Number(v)) => format!("{v:.1}{}", m.unit.as_deref().map(|u| format!(" {u}")).unwrap_or_default()),
        Some(MetricValue::Token(t)) => t.clone(),
        None => String::new(),
    };
    match m.status {
        MetricStatus::Passed | MetricStatus::Failed => format!("{} {value}", mark(m.passed)),
        other => format!("{} {value}", other.as_str()).trim_end().to_string(),
    }
}

pub fn print_summary(s: &NodeSummary) {
    println!("\n=== Node ===\n");
    println!("  Hostname:  {}", s.hostname);
    println!("  GPU model: {}", s.gpu_model);
    println!("  GPUs:      {}", s.gpu_count);
    println!("  Driver:    {}", s.driver_version);
    println!("  Internal:  {}", s.internal_ip.as_deref().unwrap_or("N/A"));
    for gpu in &s.gpus {
        println!("    {gpu}");
    }
    println!();
}

pub fn print_prereq(r: &PrerequisiteReport) {
    println!("\n=== Prerequisites ===\n");
    for (name, ok) in &r.commands {
        println!("  {} {name}", mark(*ok));
    }
    let v = &r.versions;
    println!(
        "\n  nvcc {} / libnccl2 {} / libnccl-dev {}  {}",
        v.nvcc.as_deref().unwrap_or("-"),
        v.libnccl2.as_deref().unwrap_or("-"),
        v.libnccl_dev.as_deref().unwrap_or("-"),
        mark(v.version_match)
    );
    println!();
}

pub fn print_job(job: &Job) {
    println!(
        "\n=== Job {} ({:?}) ===\n",
        job.job_id, job.status
    );
    if let Some(name) = &job.job_name {
        println!("  Name: {name}");
    }
    let tests: Vec<&str> = job.tests.iter().map(|t| t.as_str()).collect();
    print!("  {:<18} {:<12} {:<10}", "Node", "Status", "GPU");
    for t in &tests {
        print!(" {:<18}", t);
    }
    println!();
    println!("  {:-<1$}", "", 42 + 19 * tests.len());
    for node in &job.nodes {
        print!(
            "  {:<18} {:<12} {:<10}",
            node.alias,
            format!("{:?}", node.status),
            node.gpu_model.as_deref().unwrap_or("-")
        );
        for t in &job.tests {
            let cell = node.results.get(t).map(metric_cell).unwrap_or_default();
            print!(" {:<18}", cell);
        }
        println!();
        if let Some(msg) = &node.message {
            println!("      {msg}");
        }
    }
    println!();
}

pub fn print_jobs(jobs: &[Job]) {
    println!("\n=== Jobs ===\n");
    if jobs.is_empty() {
        println!("No jobs found.");
        return;
    }
    println!("{:<20} {:<12} {:<7} {:<25}", "Job ID", "Status", "Nodes", "Created");
    println!("{:-<70}", "");
    for job in jobs {
        println!(
            "{:<20} {:<12} {:<7} {:<25}",
            job.job_id,
            format!("{:?}", job.status),
            job.nodes.len(),
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
}

pub fn print_multi_node(run: &MultiNodeRun) {
    println!("\n=== Multi-node {} ({:?}) ===\n", run.test_id, run.status);
    println!("  Launcher:  {}", run.launcher);
    println!("  Hosts:     {}", run.hosts.join(", "));
    println!("  Parser:    {}", run.parser);
    if let Some(bw) = run.bandwidth {
        println!(
            "  Bandwidth: {bw:.1} GB/s {}",
            run.passed.map(mark).unwrap_or("")
        );
    }
    if let Some(msg) = &run.message {
        println!("  Message:   {msg}");
    }
    println!();
}

pub fn print_trust(report: &TrustReport) {
    println!("\n=== SSH trust ({}/{}) ===\n", report.success_count, report.total_count);
    for r in &report.results {
        println!(
            "  {} {:<18} {:<16} {}",
            mark(r.status == TrustStatus::Success),
            r.host,
            r.internal_ip.as_deref().unwrap_or("-"),
            r.message
        );
    }
    println!();
}

pub fn print_burnin(job: &BurninJob) {
    println!("\n=== Burn-in {} ({:?}) ===\n", job.job_id, job.status);
    println!("  Node:     {} ({})", job.node_name, job.host);
    println!("  Memory:   {}", job.memory_param);
    println!("  Duration: {}s", job.duration);
    println!("  Progress: {:.0}%", job.progress * 100.0);
    for r in &job.gpu_results {
        println!("    {} {r}", mark(r.ends_with("OK")));
    }
    if let Some(msg) = &job.message {
        println!("  Message:  {msg}");
    }
    println!();
}

pub fn print_burnins(jobs: &[BurninJob]) {
    println!("\n=== Burn-in jobs ===\n");
    if jobs.is_empty() {
        println!("No burn-in jobs found.");
        return;
    }
    println!("{:<28} {:<18} {:<10} {:<8}", "Job ID", "Node", "Status", "Progress");
    println!("{:-<68}", "");
    for j in jobs {
        println!(
            "{:<28} {:<18} {:<10} {:>6.0}%",
            j.job_id,
            j.node_name,
            format!("{:?}", j.status),
            j.progress * 100.0
        );
    }
    println!();
}

pub fn print_benchmarks(table: &ReferenceTable, source: &str) {
    println!("\n=== GPU reference table ({source}) ===\n");
    println!("{:<12} {:>10} {:>10} {:>10}", "Model", "p2p", "nccl", "bw");
    println!("{:-<45}", "");
    for model in table.models() {
        if let Some(r) = table.get(model) {
            println!("{:<12} {:>10.1} {:>10.1} {:>10.1}", model, r.p2p, r.nccl, r.bw);
        }
    }
    println!();
}

pub fn print_node_status(nodes: &[NodeActivity]) {
    println!("\n=== Nodes ===\n");
    if nodes.is_empty() {
        println!("No nodes seen yet.");
        return;
    }
    println!("{:<18} {:<18} {:<6} {:<30}", "Host", "Alias", "State", "Activity");
    println!("{:-<75}", "");
    for n in nodes {
        let state = match n.status {
            NodeState::Busy => "busy",
            NodeState::Idle => "idle",
        };
        println!(
            "{:<18} {:<18} {:<6} {:<30}",
            n.host,
            n.alias,
            state,
            n.activity.as_deref().unwrap_or("")
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_cell() {
        let m = Metric::numeric(450.0, "GB/s", Some(420.0));
        assert_eq!(metric_cell(&m), "✓ 450.0 GB/s");
        let skipped = Metric {
            status: MetricStatus::Skipped,
            ..Default::default()
        };
        assert_eq!(metric_cell(&skipped), "skipped");
    }
}
