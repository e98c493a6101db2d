use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use fleetcheck_common::{GpuReference, ReferenceTable};
use parking_lot::RwLock;

pub const BUILTIN_SOURCE: &str = "builtin";

/// Current reference table plus where it came from. Readers take an `Arc`
/// snapshot; a reload swaps the whole table.
pub struct ReferenceStore {
    path: Option<PathBuf>,
    table: RwLock<Arc<ReferenceTable>>,
    source: RwLock<String>,
    modified: RwLock<Option<SystemTime>>,
}

fn read_table(path: &Path) -> Result<ReferenceTable> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read benchmark file {}", path.display()))?;
    let entries: BTreeMap<String, GpuReference> = serde_json::from_str(&raw)
        .with_context(|| format!("parse benchmark file {}", path.display()))?;
    anyhow::ensure!(!entries.is_empty(), "benchmark file {} is empty", path.display());
    Ok(ReferenceTable::new(entries))
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl ReferenceStore {
    /// Loads `path`, or the built-in table when it is absent or unusable.
    pub fn load(path: Option<PathBuf>) -> Self {
        let store = Self {
            path: path.clone(),
            table: RwLock::new(Arc::new(ReferenceTable::fallback())),
            source: RwLock::new(BUILTIN_SOURCE.to_string()),
            modified: RwLock::new(None),
        };
        if let Some(path) = path {
            match read_table(&path) {
                Ok(table) => store.install(table, &path),
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), "using built-in GPU reference table")
                }
            }
        }
        store
    }

    pub fn builtin() -> Self {
        Self::load(None)
    }

    pub fn snapshot(&self) -> Arc<ReferenceTable> {
        self.table.read().clone()
    }

    pub fn source(&self) -> String {
        self.source.read().clone()
    }

    fn install(&self, table: ReferenceTable, path: &Path) {
        tracing::info!(path = %path.display(), models = table.len(), "loaded GPU reference table");
        *self.table.write() = Arc::new(table);
        *self.source.write() = path.display().to_string();
        *self.modified.write() = mtime(path);
    }

    /// Re-reads the file when its modification time moved. An unreadable or
    /// invalid file keeps the current table.
    pub fn reload_if_changed(&self) -> bool {
        let Some(path) = self.path.as_deref() else {
            return false;
        };
        let current = mtime(path);
        if current.is_none() || current == *self.modified.read() {
            return false;
        }
        match read_table(path) {
            Ok(table) => {
                self.install(table, path);
                true
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "keeping previous GPU reference table");
                *self.modified.write() = current;
                false
            }
        }
    }
}

pub async fn reference_watch_loop(store: Arc<ReferenceStore>, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let store = store.clone();
        tokio::task::spawn_blocking(move || store.reload_if_changed())
            .await
            .context("reference reload task")?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{"B200": {"p2p": 800.0, "nccl": 180.0, "bw": 55.0}}"#;

    #[test]
    fn test_missing_file_falls_back() {
        let store = ReferenceStore::load(Some("/nonexistent/benchmarks.json".into()));
        assert_eq!(store.source(), BUILTIN_SOURCE);
        assert!(store.snapshot().get("A100").is_some());
    }

    #[test]
    fn test_loads_file_and_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchmarks.json");
        std::fs::write(&path, TABLE).unwrap();

        let store = ReferenceStore::load(Some(path.clone()));
        let before = store.snapshot();
        assert_eq!(before.len(), 1);
        assert_eq!(store.source(), path.display().to_string());
        assert!(!store.reload_if_changed());

        std::fs::write(
            &path,
            r#"{"B200": {"p2p": 800.0, "nccl": 180.0, "bw": 55.0}, "GB200": {"p2p": 900.0, "nccl": 200.0, "bw": 60.0}}"#,
        )
        .unwrap();
        let f = std::fs::File::options().write(true).open(&path).unwrap();
        f.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();

        assert!(store.reload_if_changed());
        assert_eq!(store.snapshot().len(), 2);
        assert_eq!(before.len(), 1, "held snapshots are not mutated");
    }

    #[test]
    fn test_invalid_update_keeps_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("benchmarks.json");
        std::fs::write(&path, TABLE).unwrap();
        let store = ReferenceStore::load(Some(path.clone()));

        std::fs::write(&path, "{not json").unwrap();
        let f = std::fs::File::options().write(true).open(&path).unwrap();
        f.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();

        assert!(!store.reload_if_changed());
        assert!(store.snapshot().get("B200").is_some());
    }
}
