//! Push-endpoint authentication: bearer OIDC tokens checked against the
//! configured audience.
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const TOKEN_INFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";
const TRUSTED_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token verification unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str, audience: &str) -> Result<(), AuthError>;
}

/// Extract the token from an `Authorization: Bearer …` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Enforce push authentication. Without a configured audience every request
/// passes.
pub async fn check_push_auth(
    verifier: &dyn TokenVerifier,
    audience: Option<&str>,
    authorization: Option<&str>,
) -> Result<(), AuthError> {
    let Some(audience) = audience.filter(|a| !a.trim().is_empty()) else {
        return Ok(());
    };
    let token = bearer_token(authorization).ok_or(AuthError::MissingToken)?;
    verifier.verify(token, audience).await
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    aud: String,
    #[serde(default)]
    iss: String,
    /// Seconds since epoch, sent as a string.
    #[serde(default)]
    exp: String,
}

/// Verifies ID tokens through the OIDC `tokeninfo` endpoint.
#[derive(Debug, Clone)]
pub struct TokenInfoVerifier {
    http: Client,
    endpoint: Url,
}

impl TokenInfoVerifier {
    pub fn new(endpoint: Option<&str>) -> Result<Self, AuthError> {
        let endpoint = Url::parse(endpoint.unwrap_or(TOKEN_INFO_URL))
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        let http = Client::builder()
            .user_agent("tg-curator/0.1")
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(Self { http, endpoint })
    }
}

fn check_claims(info: &TokenInfo, audience: &str, now: i64) -> Result<(), AuthError> {
    if info.aud != audience {
        return Err(AuthError::Invalid("audience mismatch".into()));
    }
    if !TRUSTED_ISSUERS.contains(&info.iss.as_str()) {
        return Err(AuthError::Invalid(format!("untrusted issuer {}", info.iss)));
    }
    let exp: i64 = info
        .exp
        .parse()
        .map_err(|_| AuthError::Invalid("missing expiry".into()))?;
    if exp <= now {
        return Err(AuthError::Invalid("token expired".into()));
    }
    Ok(())
}

#[async_trait]
impl TokenVerifier for TokenInfoVerifier {
    async fn verify(&self, token: &str, audience: &str) -> Result<(), AuthError> {
        let res = self
            .http
            .get(self.endpoint.clone())
            .query(&[("id_token", token)])
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        if !res.status().is_success() {
            warn!(status = %res.status(), "token rejected by tokeninfo");
            return Err(AuthError::Invalid(format!("tokeninfo status {}", res.status())));
        }
        let info: TokenInfo = res
            .json()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        check_claims(&info, audience, chrono::Utc::now().timestamp())
    }
}
