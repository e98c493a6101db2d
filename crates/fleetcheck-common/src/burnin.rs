use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionDescriptor;

pub const MIN_DURATION_SECS: u64 = 60;
pub const MAX_DURATION_SECS: u64 = 86_400;
pub const MAX_FIXED_MEMORY_MB: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemoryType {
    Fixed,
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BurninStatus {
    Creating,
    Running,
    Completed,
    Failed,
    Stopping,
    Stopped,
}

impl BurninStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// Body of `POST /api/burnin/create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBurninRequest {
    pub connection: ConnectionDescriptor,
    #[serde(default)]
    pub node_name: Option<String>,
    pub memory_type: MemoryType,
    pub memory_value: u64,
    pub duration: u64,
}

impl CreateBurninRequest {
    pub fn validate(&self) -> Result<(), String> {
        self.connection.validate()?;
        match self.memory_type {
            MemoryType::Percentage if !(1..=100).contains(&self.memory_value) => {
                return Err("memory percentage must be between 1 and 100".into());
            }
            MemoryType::Fixed if !(1..=MAX_FIXED_MEMORY_MB).contains(&self.memory_value) => {
                return Err(format!(
                    "fixed memory must be between 1 and {MAX_FIXED_MEMORY_MB} MB"
                ));
            }
            _ => {}
        }
        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&self.duration) {
            return Err(format!(
                "duration must be between {MIN_DURATION_SECS} and {MAX_DURATION_SECS} seconds"
            ));
        }
        Ok(())
    }

    /// Human-readable memory setting, e.g. `90%` or `40000MB`.
    pub fn memory_param(&self) -> String {
        match self.memory_type {
            MemoryType::Percentage => format!("{}%", self.memory_value),
            MemoryType::Fixed => format!("{}MB", self.memory_value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurninJob {
    pub job_id: String,
    pub node_name: String,
    pub host: String,
    pub memory_type: MemoryType,
    pub memory_value: u64,
    pub memory_param: String,
    pub duration: u64,
    pub status: BurninStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpu_results: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BurninJob {
    /// Fraction of the configured duration elapsed so far.
    pub fn progress_at(&self, now: DateTime<Utc>) -> f64 {
        match self.status {
            BurninStatus::Completed => 1.0,
            BurninStatus::Creating => 0.0,
            _ => {
                let Some(started) = self.started_at else {
                    return 0.0;
                };
                let end = self.completed_at.unwrap_or(now);
                let elapsed = (end - started).num_milliseconds().max(0) as f64 / 1000.0;
                (elapsed / self.duration.max(1) as f64).clamp(0.0, 1.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request(memory_type: MemoryType, memory_value: u64, duration: u64) -> CreateBurninRequest {
        CreateBurninRequest {
            connection: ConnectionDescriptor::password("10.0.0.9", "root", "pw"),
            node_name: None,
            memory_type,
            memory_value,
            duration,
        }
    }

    #[test]
    fn test_validate_bounds() {
        assert!(make_request(MemoryType::Percentage, 90, 600).validate().is_ok());
        assert!(make_request(MemoryType::Percentage, 101, 600).validate().is_err());
        assert!(make_request(MemoryType::Fixed, 0, 600).validate().is_err());
        assert!(make_request(MemoryType::Fixed, 40_000, 59).validate().is_err());
        assert!(make_request(MemoryType::Fixed, 40_000, 86_400).validate().is_ok());
    }

    #[test]
    fn test_memory_param() {
        assert_eq!(make_request(MemoryType::Percentage, 90, 600).memory_param(), "90%");
        assert_eq!(make_request(MemoryType::Fixed, 2048, 600).memory_param(), "2048MB");
    }

    #[test]
    fn test_progress_is_clamped() {
        let now = Utc::now();
        let job = BurninJob {
            job_id: "burnin-1".into(),
            node_name: "n".into(),
            host: "h".into(),
            memory_type: MemoryType::Percentage,
            memory_value: 90,
            memory_param: "90%".into(),
            duration: 100,
            status: BurninStatus::Running,
            progress: 0.0,
            created_at: now,
            started_at: Some(now - chrono::Duration::seconds(50)),
            completed_at: None,
            exit_code: None,
            gpu_results: Vec::new(),
            message: None,
        };
        let p = job.progress_at(now);
        assert!((p - 0.5).abs() < 0.01);
        assert_eq!(job.progress_at(now + chrono::Duration::seconds(500)), 1.0);
    }
}
