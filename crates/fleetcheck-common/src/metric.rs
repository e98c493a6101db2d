use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw tool output kept on a metric is capped to the trailing bytes.
pub const RAW_OUTPUT_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricStatus {
    #[default]
    NotRun,
    Running,
    Passed,
    Failed,
    Error,
    Skipped,
    Unknown,
}

impl MetricStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRun => "notRun",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Unknown => "unknown",
        }
    }

    /// Statuses that do not fail the owning node.
    pub fn is_acceptable(self) -> bool {
        matches!(self, Self::Passed | Self::Skipped | Self::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Token(String),
}

/// Normalized result of one diagnostic test on one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub status: MetricStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<MetricValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_value: Option<f64>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

impl Metric {
    pub fn running() -> Self {
        Self {
            status: MetricStatus::Running,
            ..Default::default()
        }
    }

    /// Numeric judgment: `value >= reference`. Without a reference the
    /// hardware is unknown and the metric cannot be judged.
    pub fn numeric(value: f64, unit: &str, reference: Option<f64>) -> Self {
        let (status, passed, message) = match reference {
            Some(r) if value >= r => (MetricStatus::Passed, true, None),
            Some(r) => (
                MetricStatus::Failed,
                false,
                Some(format!("{value:.2} {unit} below reference {r:.2} {unit}")),
            ),
            None => (
                MetricStatus::Unknown,
                false,
                Some("no reference value for this GPU model".to_string()),
            ),
        };
        Self {
            status,
            value: Some(MetricValue::Number(value)),
            unit: Some(unit.to_string()),
            reference_value: reference,
            passed,
            message,
            ..Default::default()
        }
    }

    /// Token judgment: only the literal `Pass` passes.
    pub fn token(token: &str) -> Self {
        let passed = token == "Pass";
        Self {
            status: if passed {
                MetricStatus::Passed
            } else {
                MetricStatus::Failed
            },
            value: Some(MetricValue::Token(token.to_string())),
            passed,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: MetricStatus::Error,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: MetricStatus::Skipped,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_raw_output(mut self, raw: &str) -> Self {
        self.raw_output = Some(tail(raw, RAW_OUTPUT_LIMIT).to_string());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn number(&self) -> Option<f64> {
        match self.value {
            Some(MetricValue::Number(v)) => Some(v),
            _ => None,
        }
    }
}

/// Last `max` bytes of `s`, cut on a char boundary.
pub fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
