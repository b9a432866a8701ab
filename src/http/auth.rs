//! Cookie token authentication
//!
//! Tokens have the form `{id}.{signature}`, where `id` is a random UUID and
//! `signature` is the hex HMAC-SHA256 of the id under the server secret. The
//! whole string is the user's [`UserToken`]. Passwords are hashed separately
//! by [`PasswordHasher`](super::password::PasswordHasher).

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use super::errors::ApiError;
use super::AppState;
use crate::types::{LoyaltyError, UserToken};

/// Name of the authentication cookie
pub const TOKEN_COOKIE: &str = "user_token";

type HmacSha256 = Hmac<Sha256>;

/// Issues and verifies signed user tokens
#[derive(Clone)]
pub struct TokenSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Create a signer keyed by `secret`
    ///
    /// # Returns
    ///
    /// * `Err(LoyaltyError::Config)` if the secret is empty
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, LoyaltyError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(LoyaltyError::config("token secret is empty"));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(secret)
            .map_err(|e| LoyaltyError::config(format!("unusable token secret: {}", e)))?;
        Ok(Self { mac })
    }

    /// Signer with a random secret; tokens do not survive a restart
    pub fn ephemeral() -> Result<Self, LoyaltyError> {
        Self::new(Uuid::new_v4().as_bytes())
    }

    fn mac(&self) -> HmacSha256 {
        self.mac.clone()
    }

    /// Issue a fresh token
    pub fn issue(&self) -> UserToken {
        let id = Uuid::new_v4().simple().to_string();
        let mut mac = self.mac();
        mac.update(id.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        UserToken::new(format!("{}.{}", id, signature))
    }

    /// Check the signature of a presented token
    pub fn verify(&self, raw: &str) -> Option<UserToken> {
        let (id, signature) = raw.split_once('.')?;
        if id.is_empty() {
            return None;
        }
        let signature = hex::decode(signature).ok()?;

        let mut mac = self.mac();
        mac.update(id.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(UserToken::new(raw))
    }
}

/// `Set-Cookie` header carrying a user token
pub fn token_cookie(token: &UserToken) -> Result<[(HeaderName, HeaderValue); 1], ApiError> {
    let value = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", TOKEN_COOKIE, token);
    let value = HeaderValue::from_str(&value)
        .map_err(|e| ApiError::internal(format!("invalid cookie value: {}", e)))?;
    Ok([(SET_COOKIE, value)])
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
}

/// User whose request carried a valid token cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserToken);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let raw = cookie_value(&parts.headers, TOKEN_COOKIE).ok_or(ApiError::Unauthorized)?;
        match state.signer.verify(raw) {
            Some(token) => Ok(Self(token)),
            None => {
                tracing::debug!("rejected token with bad signature");
                Err(ApiError::Unauthorized)
            }
        }
    }
}
