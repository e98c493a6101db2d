use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::api::{ApiResponse, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Read-only: polls, listings, reference table.
    Viewer,
    /// May open sessions, start and stop workflows.
    Operator,
}

impl Role {
    pub fn allows(self, required: Role) -> bool {
        matches!(
            (self, required),
            (Role::Operator, _) | (Role::Viewer, Role::Viewer)
        )
    }
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub tokens: Arc<HashMap<String, Role>>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Parses `token:role,token:role`. Malformed entries are skipped.
    pub fn from_tokens(raw: &str) -> Self {
        let mut tokens = HashMap::new();
        for entry in raw.split(',') {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some((token, role_raw)) = trimmed.split_once(':') else {
                tracing::warn!("invalid FLEETCHECK_AUTH_TOKENS entry, expected token:role");
                continue;
            };
            let role = match role_raw.trim().to_ascii_lowercase().as_str() {
                "operator" | "admin" => Role::Operator,
                "viewer" => Role::Viewer,
                other => {
                    tracing::warn!(role=%other, "unknown role in FLEETCHECK_AUTH_TOKENS, skipping");
                    continue;
                }
            };
            tokens.insert(token.trim().to_string(), role);
        }
        Self {
            enabled: true,
            tokens: Arc::new(tokens),
        }
    }
}

pub fn parse_auth_from_env() -> AuthConfig {
    match std::env::var("FLEETCHECK_AUTH_TOKENS") {
        Ok(raw) => AuthConfig::from_tokens(&raw),
        Err(_) => {
            tracing::warn!("auth disabled: FLEETCHECK_AUTH_TOKENS not set");
            AuthConfig::disabled()
        }
    }
}

// Generic over any state type S that implements AsRef<AuthConfig>.
// Usage: `middleware::from_fn_with_state(app_state, auth_middleware::<MyAppState>)`
pub async fn auth_middleware<S>(
    State(state): State<S>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible>
where
    S: AsRef<AuthConfig> + Clone + Send + Sync + 'static,
{
    let auth = state.as_ref();

    if !auth.enabled {
        req.extensions_mut().insert(AuthContext {
            principal: "anonymous".into(),
            role: Role::Operator,
        });
        return Ok(next.run(req).await);
    }

    let Some(token) = extract_token(&req) else {
        return Ok(unauthorized("missing token"));
    };

    let Some(role) = auth.tokens.get(&token).copied() else {
        return Ok(forbidden("invalid token"));
    };

    req.extensions_mut().insert(AuthContext {
        principal: principal_of(&token),
        role,
    });

    Ok(next.run(req).await)
}

/// Log-safe identity for a token: a short prefix, never the whole secret.
fn principal_of(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("token:{prefix}…")
}

fn extract_token(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
        .or_else(|| {
            req.headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
}

/// None when the caller may proceed, else the 403 to return.
pub fn require_role(ctx: &AuthContext, required: Role) -> Option<Response> {
    if ctx.role.allows(required) {
        None
    } else {
        Some(forbidden("insufficient permissions"))
    }
}

pub fn unauthorized(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse::<()>::error(ErrorCode::Unauthorized, msg)),
    )
        .into_response()
}

pub fn forbidden(msg: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ApiResponse::<()>::error(ErrorCode::Forbidden, msg)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tokens_parses_roles() {
        let cfg = AuthConfig::from_tokens("abc:viewer, def:operator,bad,ghi:root");
        assert!(cfg.enabled);
        assert_eq!(cfg.tokens.get("abc"), Some(&Role::Viewer));
        assert_eq!(cfg.tokens.get("def"), Some(&Role::Operator));
        assert_eq!(cfg.tokens.len(), 2);
    }

    #[test]
    fn test_role_allows() {
        assert!(Role::Operator.allows(Role::Viewer));
        assert!(Role::Viewer.allows(Role::Viewer));
        assert!(!Role::Viewer.allows(Role::Operator));
    }

    #[test]
    fn test_principal_never_contains_full_token() {
        let p = principal_of("supersecrettoken");
        assert!(!p.contains("supersecrettoken"));
        assert!(p.starts_with("token:supe"));
    }
}
