//! Clients for the hosted authentication service.
//!
//! [`RestAuth`] talks to the auth REST API (password grant, user lookup,
//! logout). [`MemoryAuth`] keeps accounts and tokens in process and backs
//! demo mode and the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::StoreConfig;
use crate::error::{AuthError, BlotterError, Result};

/// Authenticated identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
}

/// An authenticated identity plus the token used for store calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: User,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Operations the session manager needs from the auth service
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange an email/password pair for a session
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;

    /// Resolve the user owning `access_token`; fails if the token is no longer valid
    async fn get_user(&self, access_token: &str) -> Result<User>;

    /// Exchange a refresh token for a new session
    ///
    /// Returns `AuthError::Expired` when the refresh token is no longer accepted.
    async fn refresh(&self, refresh_token: &str) -> Result<Session>;

    /// Invalidate the session server-side
    ///
    /// Returns `AuthError::MissingSession` when the server has no session for the token.
    async fn sign_out(&self, access_token: &str) -> Result<()>;
}

/// Token grant response of the auth REST API
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: User,
}

impl From<TokenResponse> for Session {
    fn from(token: TokenResponse) -> Self {
        Session {
            user: token.user,
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
        }
    }
}

/// Error body of the auth REST API; older and newer servers use different keys
#[derive(Debug, Default, Deserialize)]
struct AuthErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl AuthErrorBody {
    fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }

    fn code(&self) -> &str {
        self.error_code
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or_default()
    }

    fn text(&self, fallback: &str) -> String {
        self.error_description
            .as_ref()
            .or(self.msg.as_ref())
            .or(self.message.as_ref())
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// HTTP client for the hosted auth REST API
#[derive(Clone)]
pub struct RestAuth {
    base_url: String,
    api_key: String,
    http_client: reqwest::Client,
}

impl RestAuth {
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: &StoreConfig, http_client: reqwest::Client) -> Self {
        RestAuth {
            base_url: format!("{}/auth/v1", config.url),
            api_key: config.api_key.clone(),
            http_client,
        }
    }

    async fn error_body(response: reqwest::Response) -> (u16, AuthErrorBody, String) {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        (status, AuthErrorBody::parse(&text), text)
    }
}

#[async_trait]
impl AuthBackend for RestAuth {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let url = format!("{}/token?grant_type=password", self.base_url);
        debug!("[AUTH] Password sign-in for {}", email);

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, body, raw) = Self::error_body(response).await;
            let code = body.code();
            if status == 400 && matches!(code, "invalid_grant" | "invalid_credentials") {
                return Err(AuthError::InvalidCredentials.into());
            }
            warn!("[AUTH] Sign-in failed: status={} body={}", status, raw);
            return Err(BlotterError::Transport {
                status: Some(status),
                message: body.text("Sign-in failed"),
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.into())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let url = format!("{}/token?grant_type=refresh_token", self.base_url);
        debug!("[AUTH] Refreshing session");

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        if !response.status().is_success() {
            let (status, body, _) = Self::error_body(response).await;
            if matches!(status, 400 | 401 | 403) {
                return Err(AuthError::Expired(body.text("Refresh token rejected")).into());
            }
            return Err(BlotterError::Transport {
                status: Some(status),
                message: body.text("Session refresh failed"),
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.into())
    }

    async fn get_user(&self, access_token: &str) -> Result<User> {
        let url = format!("{}/user", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        match response.status().as_u16() {
            200..=299 => Ok(response.json().await?),
            401 | 403 => {
                let (_, body, _) = Self::error_body(response).await;
                Err(AuthError::Expired(body.text("Token rejected")).into())
            }
            _ => {
                let (status, body, _) = Self::error_body(response).await;
                Err(BlotterError::Transport {
                    status: Some(status),
                    message: body.text("User lookup failed"),
                })
            }
        }
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        let url = format!("{}/logout", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let (status, body, _) = Self::error_body(response).await;
        let missing = matches!(status, 401 | 404)
            || matches!(body.code(), "session_not_found" | "no_authorization")
            || body.text("").to_lowercase().contains("session missing");
        if missing {
            Err(AuthError::MissingSession.into())
        } else {
            Err(BlotterError::Transport {
                status: Some(status),
                message: body.text("Sign-out failed"),
            })
        }
    }
}

/// Fault injected into the next [`MemoryAuth::sign_out`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutFault {
    MissingSession,
    Transport,
}

/// In-process auth backend with a fixed set of accounts
pub struct MemoryAuth {
    accounts: HashMap<String, String>,
    sessions: Mutex<HashMap<String, User>>,
    // refresh token -> access token it was issued with
    refresh_tokens: Mutex<HashMap<String, String>>,
    token_lifetime: Duration,
    next_token: AtomicU64,
    sign_out_fault: Mutex<Option<SignOutFault>>,
}

impl MemoryAuth {
    /// Create a backend accepting the given `(email, password)` pairs
    pub fn new<I, E, P>(accounts: I) -> Self
    where
        I: IntoIterator<Item = (E, P)>,
        E: Into<String>,
        P: Into<String>,
    {
        MemoryAuth {
            accounts: accounts
                .into_iter()
                .map(|(e, p)| (e.into(), p.into()))
                .collect(),
            sessions: Mutex::new(HashMap::new()),
            refresh_tokens: Mutex::new(HashMap::new()),
            token_lifetime: Duration::hours(1),
            next_token: AtomicU64::new(1),
            sign_out_fault: Mutex::new(None),
        }
    }

    /// Issue sessions that expire `lifetime` after they are granted
    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    /// Make the next sign-out fail with `fault`
    pub fn fail_next_sign_out(&self, fault: SignOutFault) {
        if let Ok(mut slot) = self.sign_out_fault.lock() {
            *slot = Some(fault);
        }
    }

    /// Forget a token server-side, as an expiry would; its refresh token dies with it
    pub fn revoke(&self, access_token: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(access_token);
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn lock_sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, User>>> {
        self.sessions
            .lock()
            .map_err(|_| BlotterError::transport("auth session table poisoned"))
    }

    fn issue(&self, user: User) -> Result<Session> {
        let n = self.next_token.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            user: user.clone(),
            access_token: format!("memory-token-{}", n),
            refresh_token: Some(format!("memory-refresh-{}", n)),
            expires_at: Some(Utc::now() + self.token_lifetime),
        };
        self.lock_sessions()?
            .insert(session.access_token.clone(), user);
        if let Some(refresh) = &session.refresh_token {
            self.refresh_tokens
                .lock()
                .map_err(|_| BlotterError::transport("auth refresh table poisoned"))?
                .insert(refresh.clone(), session.access_token.clone());
        }
        Ok(session)
    }
}

#[async_trait]
impl AuthBackend for MemoryAuth {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        match self.accounts.get(email) {
            Some(expected) if expected == password => {}
            _ => return Err(AuthError::InvalidCredentials.into()),
        }

        self.issue(User {
            id: format!("user-{}", email),
            email: email.to_string(),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let access_token = self
            .refresh_tokens
            .lock()
            .map_err(|_| BlotterError::transport("auth refresh table poisoned"))?
            .remove(refresh_token);
        // Refresh tokens are single use and die with a revoked access token.
        let user = access_token.and_then(|token| {
            self.lock_sessions()
                .ok()
                .and_then(|mut sessions| sessions.remove(&token))
        });

        match user {
            Some(user) => self.issue(user),
            None => Err(AuthError::Expired("Invalid Refresh Token".to_string()).into()),
        }
    }

    async fn get_user(&self, access_token: &str) -> Result<User> {
        self.lock_sessions()?
            .get(access_token)
            .cloned()
            .ok_or_else(|| AuthError::Expired("Token rejected".to_string()).into())
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        let fault = self
            .sign_out_fault
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        match fault {
            Some(SignOutFault::MissingSession) => return Err(AuthError::MissingSession.into()),
            Some(SignOutFault::Transport) => {
                return Err(BlotterError::transport("connection reset by peer"));
            }
            None => {}
        }

        match self.lock_sessions()?.remove(access_token) {
            Some(_) => Ok(()),
            None => Err(AuthError::MissingSession.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_auth_accepts_known_credentials() {
        let auth = MemoryAuth::new([("a@example.com", "pw")]);
        let session = auth.sign_in_with_password("a@example.com", "pw").await.unwrap();
        assert_eq!(session.user.email, "a@example.com");

        let user = auth.get_user(&session.access_token).await.unwrap();
        assert_eq!(user, session.user);
    }

    #[tokio::test]
    async fn memory_auth_rejects_bad_password() {
        let auth = MemoryAuth::new([("a@example.com", "pw")]);
        let err = auth
            .sign_in_with_password("a@example.com", "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, BlotterError::Auth(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn signing_out_twice_reports_missing_session() {
        let auth = MemoryAuth::new([("a@example.com", "pw")]);
        let session = auth.sign_in_with_password("a@example.com", "pw").await.unwrap();

        auth.sign_out(&session.access_token).await.unwrap();
        let err = auth.sign_out(&session.access_token).await.unwrap_err();
        assert!(matches!(err, BlotterError::Auth(AuthError::MissingSession)));
    }

    #[tokio::test]
    async fn memory_refresh_rotates_tokens_once() {
        let auth = MemoryAuth::new([("a@example.com", "pw")]);
        let session = auth.sign_in_with_password("a@example.com", "pw").await.unwrap();
        let refresh = session.refresh_token.clone().unwrap();

        let fresh = auth.refresh(&refresh).await.unwrap();
        assert_ne!(fresh.access_token, session.access_token);
        assert!(auth.get_user(&session.access_token).await.is_err());
        assert!(auth.get_user(&fresh.access_token).await.is_ok());

        let err = auth.refresh(&refresh).await.unwrap_err();
        assert!(matches!(err, BlotterError::Auth(AuthError::Expired(_))));
    }

    #[tokio::test]
    async fn revoked_session_cannot_refresh() {
        let auth = MemoryAuth::new([("a@example.com", "pw")]);
        let session = auth.sign_in_with_password("a@example.com", "pw").await.unwrap();
        auth.revoke(&session.access_token);

        let err = auth
            .refresh(session.refresh_token.as_deref().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BlotterError::Auth(AuthError::Expired(_))));
    }

    #[test]
    fn error_body_prefers_description() {
        let body = AuthErrorBody::parse(
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        );
        assert_eq!(body.code(), "invalid_grant");
        assert_eq!(body.text("fallback"), "Invalid login credentials");

        let body = AuthErrorBody::parse("not json");
        assert_eq!(body.code(), "");
        assert_eq!(body.text("fallback"), "fallback");
    }

    #[test]
    fn session_expiry() {
        let now = Utc::now();
        let session = Session {
            user: User {
                id: "u".into(),
                email: "e".into(),
            },
            access_token: "t".into(),
            refresh_token: None,
            expires_at: Some(now - Duration::seconds(1)),
        };
        assert!(session.is_expired(now));
    }
}
