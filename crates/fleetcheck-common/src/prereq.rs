use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nvcc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libnccl2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libnccl_dev: Option<String>,
    pub version_match: bool,
}

impl VersionInfo {
    pub fn new(nvcc: Option<String>, libnccl2: Option<String>, libnccl_dev: Option<String>) -> Self {
        let version_match = match (&nvcc, &libnccl2, &libnccl_dev) {
            (Some(a), Some(b), Some(c)) => a == b && b == c,
            _ => false,
        };
        Self {
            nvcc,
            libnccl2,
            libnccl_dev,
            version_match,
        }
    }
}

/// One boolean per requested prerequisite, plus toolchain versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrerequisiteReport {
    pub commands: BTreeMap<String, bool>,
    pub versions: VersionInfo,
}

impl PrerequisiteReport {
    pub fn missing(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_match_requires_all_three() {
        let v = VersionInfo::new(Some("12.4".into()), Some("12.4".into()), Some("12.4".into()));
        assert!(v.version_match);
        let v = VersionInfo::new(Some("12.4".into()), Some("12.2".into()), Some("12.4".into()));
        assert!(!v.version_match);
        let v = VersionInfo::new(None, Some("12.4".into()), Some("12.4".into()));
        assert!(!v.version_match);
    }

    #[test]
    fn test_missing_lists_false_entries() {
        let mut r = PrerequisiteReport::default();
        r.commands.insert("nvidia-smi".into(), true);
        r.commands.insert("dcgmi".into(), false);
        assert_eq!(r.missing(), vec!["dcgmi"]);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["versions"]["versionMatch"], false);
    }
}
