use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-model bandwidth thresholds in GB/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpuReference {
    pub p2p: f64,
    pub nccl: f64,
    pub bw: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    P2p,
    Nccl,
    Bw,
}

impl GpuReference {
    pub fn get(&self, dim: Dimension) -> f64 {
        match dim {
            Dimension::P2p => self.p2p,
            Dimension::Nccl => self.nccl,
            Dimension::Bw => self.bw,
        }
    }
}

/// Hardware model name to reference thresholds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceTable(BTreeMap<String, GpuReference>);

impl ReferenceTable {
    pub fn new(entries: BTreeMap<String, GpuReference>) -> Self {
        Self(entries)
    }

    /// Built-in thresholds used when no reference file is available.
    pub fn fallback() -> Self {
        let rows: [(&str, f64, f64, f64); 8] = [
            ("RTX 3090", 18.0, 7.0, 20.0),
            ("L40S", 28.0, 9.0, 20.0),
            ("RTX 4090", 18.0, 7.0, 20.0),
            ("A100", 420.0, 70.0, 20.0),
            ("A800", 340.0, 55.0, 20.0),
            ("H100", 700.0, 139.0, 40.0),
            ("H800", 340.0, 65.0, 47.0),
            ("H200", 730.0, 145.0, 54.0),
        ];
        Self(
            rows.into_iter()
                .map(|(name, p2p, nccl, bw)| (name.to_string(), GpuReference { p2p, nccl, bw }))
                .collect(),
        )
    }

    pub fn get(&self, model: &str) -> Option<&GpuReference> {
        self.0.get(model)
    }

    pub fn threshold(&self, model: &str, dim: Dimension) -> Option<f64> {
        self.get(model).map(|r| r.get(dim))
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Maps a raw `nvidia-smi -L` line onto a table key.
    pub fn normalize(&self, raw: &str) -> String {
        normalize_gpu_name(raw, self.models())
    }
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Picks the longest known model whose space-stripped, lowercase form occurs
/// in the device name. The `GPU n:` prefix and the `(UUID: …)` suffix are
/// dropped first, and unmatched names are returned in that form.
pub fn normalize_gpu_name<'a, I>(raw: &str, known: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut name = raw.trim();
    if let Some((prefix, rest)) = name.split_once(':') {
        if prefix.trim_start().starts_with("GPU ") {
            name = rest;
        }
    }
    if let Some(idx) = name.find("(UUID") {
        name = &name[..idx];
    }
    let name = name.trim();
    if name.is_empty() {
        return "Unknown".to_string();
    }

    let haystack = squash(name);
    known
        .into_iter()
        .filter(|k| !k.trim().is_empty() && haystack.contains(&squash(k)))
        .max_by_key(|k| squash(k).len())
        .map_or_else(|| name.to_string(), str::to_string)
}
