use axum::{
    body::Body,
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::{mapref::entry::Entry, DashMap};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::hub::PushHub;

pub const ADMIN_ROLE: &str = "admin";

/// Claims carried by a push-channel credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
}

impl PushClaims {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("invalid credential: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// HS256 token validation for push connections
#[derive(Clone)]
pub struct PushAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl PushAuth {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.required_spec_claims = ["exp", "sub"].iter().map(|s| s.to_string()).collect();

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<PushClaims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = jsonwebtoken::decode::<PushClaims>(token, &self.decoding, &self.validation)?;
        Ok(data.claims)
    }

    pub fn issue(&self, claims: &PushClaims) -> Result<String, AuthError> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.encoding,
        )?)
    }
}

/// Holds one of a user's connection slots; released on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    user_id: String,
    counts: Arc<DashMap<String, usize>>,
}

impl ConnectionSlot {
    pub(crate) fn acquire(
        counts: &Arc<DashMap<String, usize>>,
        user_id: &str,
        max: usize,
    ) -> Option<Self> {
        let mut count = counts.entry(user_id.to_string()).or_insert(0);
        if *count >= max {
            return None;
        }
        *count += 1;
        Some(Self {
            user_id: user_id.to_string(),
            counts: counts.clone(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if let Entry::Occupied(mut e) = self.counts.entry(self.user_id.clone()) {
            let remaining = e.get().saturating_sub(1);
            if remaining == 0 {
                e.remove();
            } else {
                *e.get_mut() = remaining;
            }
        }
    }
}

/// Authenticated identity handed to the upgrade handler
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub claims: PushClaims,
    pub slot: Arc<ConnectionSlot>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.get(..7)
                .filter(|p| p.eq_ignore_ascii_case("bearer "))
                .map(|_| v[7..].trim().to_string())
        })
        .filter(|t| !t.is_empty())
}

fn reject(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

/// Handshake gate for `/ws`: 503 while draining or when push auth is not
/// configured, 401 without a valid credential, 429 over the per-user cap.
pub async fn push_auth_middleware(
    State(hub): State<Arc<PushHub>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if hub.is_shutting_down() {
        return reject(StatusCode::SERVICE_UNAVAILABLE, "server shutting down");
    }
    let Some(auth) = hub.auth() else {
        return reject(StatusCode::SERVICE_UNAVAILABLE, "push channel not configured");
    };

    let token = extract_bearer_token(req.headers()).or_else(|| {
        Query::<TokenQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.token)
    });
    let Some(token) = token else {
        return reject(StatusCode::UNAUTHORIZED, "missing credential");
    };

    let claims = match auth.validate(&token) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "Push handshake rejected");
            return reject(StatusCode::UNAUTHORIZED, "invalid credential");
        }
    };

    let Some(slot) = hub.try_acquire_slot(&claims.sub) else {
        tracing::warn!(user_id = %claims.sub, "Connection limit reached");
        return reject(StatusCode::TOO_MANY_REQUESTS, "connection limit reached");
    };

    req.extensions_mut().insert(AuthenticatedClient {
        claims,
        slot: Arc::new(slot),
    });
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn claims(exp_offset: i64) -> PushClaims {
        PushClaims {
            sub: "user-1".to_string(),
            tenant_id: Some("T1".to_string()),
            roles: vec!["viewer".to_string()],
            exp: Utc::now().timestamp() + exp_offset,
        }
    }

    #[test]
    fn test_issue_and_validate() {
        let auth = PushAuth::new("push-secret");
        let token = auth.issue(&claims(300)).unwrap();
        let decoded = auth.validate(&token).unwrap();
        assert_eq!(decoded.sub, "user-1");
        assert_eq!(decoded.tenant_id.as_deref(), Some("T1"));
        assert!(!decoded.is_admin());
    }

    #[test]
    fn test_rejects_expired_and_foreign_tokens() {
        let auth = PushAuth::new("push-secret");
        let expired = auth.issue(&claims(-60)).unwrap();
        assert!(auth.validate(&expired).is_err());

        let foreign = PushAuth::new("other").issue(&claims(300)).unwrap();
        assert!(auth.validate(&foreign).is_err());
        assert!(matches!(auth.validate(""), Err(AuthError::Missing)));
    }

    #[test]
    fn test_slots_are_capped_and_released() {
        let counts = Arc::new(DashMap::new());
        let a = ConnectionSlot::acquire(&counts, "u", 2).unwrap();
        let _b = ConnectionSlot::acquire(&counts, "u", 2).unwrap();
        assert!(ConnectionSlot::acquire(&counts, "u", 2).is_none());

        drop(a);
        assert!(ConnectionSlot::acquire(&counts, "u", 2).is_some());
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert!(extract_bearer_token(&headers).is_none());
    }
}
