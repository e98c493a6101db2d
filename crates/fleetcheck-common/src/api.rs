use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Machine-readable failure class carried in error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthError,
    NetworkError,
    Timeout,
    ValidationError,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    Internal,
}

/// JSON envelope returned by every API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
            code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
            code: Some(code),
            timestamp: Utc::now(),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err("response carried no data".to_string()),
            (false, _) => Err(self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_shape() {
        let r: ApiResponse<()> = ApiResponse::error(ErrorCode::NetworkError, "host unreachable");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["code"], "network_error");
        assert!(v.get("data").is_none());
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn test_into_result() {
        let ok = ApiResponse::ok(5u32, "done");
        assert_eq!(ok.into_result(), Ok(5));
        let err: ApiResponse<u32> = ApiResponse::error(ErrorCode::NotFound, "no such job");
        assert_eq!(err.into_result(), Err("no such job".to_string()));
    }
}
