//! Text parsers for the diagnostic tools' stdout.

use std::sync::OnceLock;

use regex::Regex;

/// Plausible host/device copy bandwidth in GB/s. Anything outside is a
/// column index, a latency or a sum row.
const NVBANDWIDTH_RANGE: std::ops::RangeInclusive<f64> = 10.0..=1200.0;

/// Minimum bandwidth over the per-GPU rows of an nvbandwidth matrix.
pub fn parse_nvbandwidth(output: &str) -> Option<f64> {
    let mut values = Vec::new();
    for line in output.lines().map(str::trim) {
        if !line.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        for chunk in line.split_whitespace().skip(1) {
            let Ok(v) = chunk.parse::<f64>() else {
                break;
            };
            if NVBANDWIDTH_RANGE.contains(&v) {
                values.push(v);
            }
        }
    }
    min_of(values)
}

/// Minimum off-diagonal entry of the bidirectional P2P-enabled bandwidth
/// matrix printed by p2pBandwidthLatencyTest.
pub fn parse_p2p(output: &str) -> Option<f64> {
    let mut collecting = false;
    let mut row = 0usize;
    let mut values = Vec::new();
    for line in output.lines() {
        if line.contains("Bidirectional P2P=Enabled Bandwidth Matrix") {
            collecting = true;
            row = 0;
            continue;
        }
        if line.contains("P2P=Disabled Latency Matrix") {
            break;
        }
        if !collecting {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(head) = parts.next() else {
            continue;
        };
        // column header row, e.g. "D\D 0 1 2 3"
        if !head.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        for (col, chunk) in parts.enumerate() {
            if let Ok(v) = chunk.parse::<f64>() {
                if v > 0.0 && col != row {
                    values.push(v);
                }
            }
        }
        row += 1;
    }
    min_of(values)
}

/// Value of the `# Avg bus bandwidth : N` summary line of nccl-tests.
pub fn parse_avg_busbw(output: &str) -> Option<f64> {
    output
        .lines()
        .filter(|l| l.contains("Avg bus bandwidth"))
        .find_map(|l| l.split_whitespace().find_map(|c| c.parse::<f64>().ok()))
        .filter(|v| *v > 0.0)
}

/// Highest out-of-place or in-place busbw across the nccl-tests result rows.
pub fn parse_peak_busbw(output: &str) -> Option<f64> {
    let mut values = Vec::new();
    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line.split_whitespace().collect();
        // with and without the `root` column
        let idx: &[usize] = match cols.len() {
            13 => &[7, 11],
            12 => &[6, 10],
            _ => continue,
        };
        if cols[0].parse::<u64>().is_err() {
            continue;
        }
        values.extend(idx.iter().filter_map(|&i| cols[i].parse::<f64>().ok()));
    }
    values
        .into_iter()
        .filter(|v| *v > 0.0)
        .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
}

/// `Pass` when dcgmi exited cleanly and no test row reports `Fail`.
/// `Warn` rows do not fail the diagnostic.
pub fn dcgm_token(output: &str, exit_code: i32) -> &'static str {
    if exit_code == 0 && !output.contains("| Fail") {
        "Pass"
    } else {
        "Fail"
    }
}

fn module_summary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:通过模块|passed modules)\s*[:：]\s*(\d+)\s*/\s*(\d+)").unwrap_or_else(|e| {
            unreachable!("module summary pattern is valid: {e}")
        })
    })
}

/// `Pass` iff the health script's module summary reports every module
/// passed. Without a summary line the exit code decides.
pub fn ib_token(output: &str, exit_code: i32) -> &'static str {
    let summary = module_summary()
        .captures_iter(output)
        .last()
        .and_then(|c| Some((c[1].parse::<u32>().ok()?, c[2].parse::<u32>().ok()?)));
    let passed = match summary {
        Some((ok, total)) => total > 0 && ok == total,
        None => exit_code == 0,
    };
    if passed {
        "Pass"
    } else {
        "Fail"
    }
}

/// `GPU n: <name> (UUID: ...)` lines of `nvidia-smi -L`.
pub fn gpu_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("GPU "))
        .map(str::to_string)
        .collect()
}

fn min_of(values: Vec<f64>) -> Option<f64> {
    values.into_iter().reduce(f64::min)
}
