//! Bearer-token authentication for the admin API
//!
//! Two accepted credentials: the `ADMIN_API_KEY` shared secret, or an HS256
//! JWT whose subject is registered in the admin table or whose email is on
//! the configured allowlist.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use shared::error::AppError;

use crate::db::admins;
use crate::state::AppState;

/// JWT claims for admin authentication
#[derive(Debug, Serialize, Deserialize)]
pub struct AdminClaims {
    /// Operator subject (admin table key)
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Expiration (Unix timestamp seconds)
    pub exp: usize,
}

/// Authenticated operator identity, recorded as `performed_by` on audit rows.
#[derive(Debug, Clone)]
pub struct AdminIdentity {
    pub subject: String,
    pub email: Option<String>,
}

impl AdminIdentity {
    pub fn performed_by(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.subject)
    }
}

/// Middleware: extract and verify the bearer token, insert [`AdminIdentity`].
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized().into_response())?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::unauthorized().into_response())?;

    // Shared-secret fast path.
    if let Some(api_key) = &state.admin_api_key {
        if token == api_key {
            request.extensions_mut().insert(AdminIdentity {
                subject: "api-key".to_string(),
                email: None,
            });
            return Ok(next.run(request).await);
        }
    }

    let token_data = jsonwebtoken::decode::<AdminClaims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        tracing::debug!("JWT validation failed: {e}");
        AppError::unauthorized().into_response()
    })?;

    let claims = token_data.claims;
    let email = claims.email.as_deref().map(str::to_ascii_lowercase);

    let allowlisted = email
        .as_deref()
        .is_some_and(|e| state.admin_emails.iter().any(|a| a == e));

    let admin = if allowlisted {
        true
    } else {
        admins::is_admin_subject(&state.business, &claims.sub)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "admin lookup failed");
                AppError::internal("admin lookup failed").into_response()
            })?
    };

    if !admin {
        return Err(AppError::not_admin().into_response());
    }

    request.extensions_mut().insert(AdminIdentity {
        subject: claims.sub,
        email,
    });

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_performed_by_prefers_email() {
        let identity = AdminIdentity {
            subject: "42".to_string(),
            email: Some("ops@example.com".to_string()),
        };
        assert_eq!(identity.performed_by(), "ops@example.com");

        let key_identity = AdminIdentity {
            subject: "api-key".to_string(),
            email: None,
        };
        assert_eq!(key_identity.performed_by(), "api-key");
    }
}
