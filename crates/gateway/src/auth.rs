//! Authentication Middleware: two gates — an API key for hosts, a bearer
//! token or session cookie for browser clients — both validated against
//! the opaque identity provider interface.

use async_trait::async_trait;
use axum::http::HeaderMap;
use hub_protocol::ids::UserId;
use hub_protocol::HubError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// `verifyApiKey(key) → {valid, key:{userId}}`.
pub struct ApiKeyVerdict {
    pub valid: bool,
    pub user_id: Option<UserId>,
}

/// `getSession({headers}) → {user:{id,email}}`.
#[derive(Debug)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub email: String,
}

/// The identity provider is an external collaborator; the gateway core
/// only knows this trait's shape, never a concrete backend.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify_api_key(&self, key: &str) -> ApiKeyVerdict;
    async fn get_session(&self, headers: &HeaderMap) -> Option<SessionIdentity>;
}

#[derive(Debug, Serialize, Deserialize)]
struct HubClaims {
    sub: String,
    email: String,
    #[allow(dead_code)]
    exp: usize,
}

/// A self-contained identity provider for deployments without an
/// external account service: host API keys are a static env-configured
/// map, browser sessions are HS256 JWTs signed with a shared secret.
pub struct StaticIdentityProvider {
    api_keys: std::collections::HashMap<String, UserId>,
    jwt_secret: String,
}

impl StaticIdentityProvider {
    /// Parses `HUB_API_KEYS` as `key1:user1,key2:user2` and reads
    /// `HUB_JWT_SECRET` for bearer token verification.
    pub fn from_env() -> Self {
        let api_keys = std::env::var("HUB_API_KEYS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| {
                let (key, user) = pair.split_once(':')?;
                Some((key.to_string(), user.to_string()))
            })
            .collect();
        let jwt_secret = std::env::var("HUB_JWT_SECRET").unwrap_or_else(|_| "dev-secret".to_string());
        Self { api_keys, jwt_secret }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify_api_key(&self, key: &str) -> ApiKeyVerdict {
        match self.api_keys.get(key) {
            Some(user_id) => ApiKeyVerdict { valid: true, user_id: Some(user_id.clone()) },
            None => ApiKeyVerdict { valid: false, user_id: None },
        }
    }

    async fn get_session(&self, headers: &HeaderMap) -> Option<SessionIdentity> {
        let bearer = bearer_token(headers);
        let token = bearer.or_else(|| session_cookie(headers))?;
        let claims = decode::<HubClaims>(
            &token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .ok()?;
        Some(SessionIdentity {
            user_id: claims.claims.sub,
            email: claims.claims.email,
        })
    }
}

/// Extracts `Authorization: Bearer <token>`, taking precedence over a
/// cookie when both are present.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|s| s.to_string())
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookie = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookie.split(';').map(|kv| kv.trim()).find_map(|kv| kv.strip_prefix("hub_session=")).map(|s| s.to_string())
}

/// Validates a host's connect-time API key. Failure drops the connection
/// with `INVALID_KEY`.
pub async fn authenticate_host(provider: &dyn IdentityProvider, api_key: &str) -> Result<UserId, HubError> {
    let verdict = provider.verify_api_key(api_key).await;
    if !verdict.valid {
        return Err(HubError::invalid_key("host API key rejected by identity provider"));
    }
    verdict.user_id.ok_or_else(|| HubError::internal("identity provider accepted key but returned no userId"))
}

/// Validates a client request. Rejection is `AUTH_REQUIRED`.
pub async fn authenticate_client(provider: &dyn IdentityProvider, headers: &HeaderMap) -> Result<SessionIdentity, HubError> {
    provider.get_session(headers).await.ok_or_else(|| HubError::auth_required("no bearer token or session cookie present"))
}

/// Same lookup as [`authenticate_client`] but never fails — used by
/// optional-auth endpoints that surface a user id when present but don't
/// need one to function.
pub async fn identify_client_optional(provider: &dyn IdentityProvider, headers: &HeaderMap) -> Option<SessionIdentity> {
    provider.get_session(headers).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StaticIdentityProvider {
        let mut api_keys = std::collections::HashMap::new();
        api_keys.insert("key-a".to_string(), "user-a".to_string());
        StaticIdentityProvider { api_keys, jwt_secret: "test-secret".to_string() }
    }

    #[tokio::test]
    async fn valid_api_key_resolves_to_its_user() {
        let user_id = authenticate_host(&provider(), "key-a").await.unwrap();
        assert_eq!(user_id, "user-a");
    }

    #[tokio::test]
    async fn unknown_api_key_is_invalid_key() {
        let err = authenticate_host(&provider(), "nope").await.unwrap_err();
        assert_eq!(err.code, hub_protocol::ErrorCode::InvalidKey);
    }

    #[tokio::test]
    async fn missing_auth_header_is_auth_required() {
        let headers = HeaderMap::new();
        let err = authenticate_client(&provider(), &headers).await.unwrap_err();
        assert_eq!(err.code, hub_protocol::ErrorCode::AuthRequired);
    }

    #[tokio::test]
    async fn optional_identify_returns_none_without_failing() {
        let headers = HeaderMap::new();
        assert!(identify_client_optional(&provider(), &headers).await.is_none());
    }

    #[test]
    fn bearer_takes_precedence_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer from-header".parse().unwrap());
        headers.insert(axum::http::header::COOKIE, "hub_session=from-cookie".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "from-header");
    }
}
