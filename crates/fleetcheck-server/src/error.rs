use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleetcheck_common::{ApiResponse, ErrorCode};
use fleetcheck_remote::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Rejected before any remote call was made.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("{0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::Session(e) if e.is_auth() => ErrorCode::AuthError,
            Self::Session(SessionError::Network { .. }) => ErrorCode::NetworkError,
            Self::Session(SessionError::Timeout(_)) => ErrorCode::Timeout,
            Self::Session(SessionError::Cancelled) => ErrorCode::Conflict,
            Self::Session(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code() {
            ErrorCode::ValidationError
            | ErrorCode::AuthError
            | ErrorCode::NetworkError
            | ErrorCode::Timeout => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error=%self, "request failed");
        }
        let body = ApiResponse::<()>::error(self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_errors_map_to_distinct_codes() {
        let auth = OrchestratorError::from(SessionError::auth("h:22", "denied"));
        assert_eq!(auth.code(), ErrorCode::AuthError);
        assert_eq!(auth.status(), StatusCode::BAD_REQUEST);

        let net = OrchestratorError::from(SessionError::network("h:22", "refused"));
        assert_eq!(net.code(), ErrorCode::NetworkError);
        assert_eq!(net.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_not_found_and_conflict_statuses() {
        assert_eq!(
            OrchestratorError::NotFound("job".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            OrchestratorError::Conflict("done".into()).status(),
            StatusCode::CONFLICT
        );
    }
}
