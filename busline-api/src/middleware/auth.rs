use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminClaims {
    pub sub: String,
    pub email: String,
    pub role: String,
    pub exp: usize,
}

/// Travel agent selling on behalf of customers.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentClaims {
    pub sub: String,
    pub agency: Option<String>,
    pub role: String,
    pub exp: usize,
}

// ============================================================================
// Admin Authentication Middleware
// ============================================================================

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<AdminClaims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    if token_data.claims.role != "ADMIN" && token_data.claims.role != "SUPER_ADMIN" {
        return Err(StatusCode::FORBIDDEN);
    }

    req.extensions_mut().insert(token_data.claims);

    Ok(next.run(req).await)
}

// ============================================================================
// Agent Identity
// ============================================================================

/// Bearer tokens on public booking routes are optional; when present they
/// must be a valid agent token.
pub fn decode_agent(token: &str, secret: &str) -> Result<AgentClaims, AppError> {
    let token_data = decode::<AgentClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AppError::AuthenticationError("Invalid agent token".to_string()))?;

    if token_data.claims.role != "AGENT" {
        return Err(AppError::AuthorizationError("Token is not an agent token".to_string()));
    }
    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(role: &str, secret: &str) -> String {
        let claims = AgentClaims {
            sub: "agent-7".to_string(),
            agency: Some("Nord Travel".to_string()),
            role: role.to_string(),
            exp: (chrono::Utc::now().timestamp() + 600) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_agent_token_roles() {
        let claims = decode_agent(&token("AGENT", "s3cret"), "s3cret").unwrap();
        assert_eq!(claims.sub, "agent-7");

        assert!(matches!(
            decode_agent(&token("ADMIN", "s3cret"), "s3cret"),
            Err(AppError::AuthorizationError(_))
        ));
        assert!(matches!(
            decode_agent(&token("AGENT", "other"), "s3cret"),
            Err(AppError::AuthenticationError(_))
        ));
    }
}
