use serde::{Deserialize, Serialize};
use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::{
    error::{Result, SmartWindowError},
    store::{load_json, save_json, KeyValueStore, AUTH_STORAGE_KEY},
    types::SessionState,
};

/// Bearer credentials of the signed-in user
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    /// Short-lived access token
    pub access_token: Option<String>,
    /// Long-lived refresh token
    pub refresh_token: Option<String>,
}

impl AuthSession {
    /// Whether an access token is present
    #[must_use]
    pub const fn is_logged_in(&self) -> bool {
        self.access_token.is_some()
    }

    /// Whether a silent renewal can be attempted
    #[must_use]
    pub const fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |token: &Option<String>| token.as_ref().map(|_| "<redacted>");
        f.debug_struct("AuthSession")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

/// Token pair returned by the reissue endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    /// New access token
    pub access_token: String,
    /// Rotated refresh token; the previous one stays valid when absent
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("rotated", &self.refresh_token.is_some())
            .finish()
    }
}

/// Owner of the access/refresh token pair
///
/// The pair is the single source of truth for the `Authorization` header: requests
/// read a snapshot right before sending, and reissues replace it under a single-flight
/// lock so a burst of 401s triggers one renewal.
pub struct SessionManager {
    session: RwLock<AuthSession>,
    store: Arc<dyn KeyValueStore>,
    reissue_lock: Mutex<()>,
    reissuing: AtomicBool,
}

impl SessionManager {
    /// Create a logged-out manager persisting into `store`
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            session: RwLock::new(AuthSession::default()),
            store,
            reissue_lock: Mutex::new(()),
            reissuing: AtomicBool::new(false),
        }
    }

    /// Load the persisted session, if any. The tokens are installed unverified.
    ///
    /// # Errors
    ///
    /// Returns store errors. Unparseable stored sessions are discarded and reported as
    /// "nothing restored".
    pub async fn restore(&self) -> Result<bool> {
        let restored = match load_json::<AuthSession>(self.store.as_ref(), AUTH_STORAGE_KEY).await
        {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(false),
            Err(SmartWindowError::Serialization(e)) => {
                warn!("Discarding unreadable persisted session: {}", e);
                self.store.remove(AUTH_STORAGE_KEY).await?;
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let logged_in = restored.is_logged_in();
        *self.session.write().await = restored;
        Ok(logged_in)
    }

    /// Install a new token pair; the only way into the logged-in state
    ///
    /// # Errors
    ///
    /// Returns store errors if the pair cannot be persisted. The in-memory session is
    /// updated regardless.
    pub async fn login(&self, access_token: String, refresh_token: String) -> Result<()> {
        let mut session = self.session.write().await;
        *session = AuthSession {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
        };
        save_json(self.store.as_ref(), AUTH_STORAGE_KEY, &*session).await?;
        info!("Session established");
        Ok(())
    }

    /// Drop both tokens locally and from storage
    ///
    /// # Errors
    ///
    /// Returns store errors. The in-memory session is cleared regardless.
    pub async fn clear(&self) -> Result<()> {
        let mut session = self.session.write().await;
        *session = AuthSession::default();
        self.store.remove(AUTH_STORAGE_KEY).await?;
        info!("Session cleared");
        Ok(())
    }

    /// Copy of the current session
    pub async fn snapshot(&self) -> AuthSession {
        self.session.read().await.clone()
    }

    /// Current access token
    pub async fn access_token(&self) -> Option<String> {
        self.session.read().await.access_token.clone()
    }

    /// `Bearer <token>` header value, if logged in
    pub async fn bearer_header(&self) -> Option<String> {
        self.access_token().await.map(|token| format!("Bearer {token}"))
    }

    /// Whether a refresh token is available
    pub async fn can_refresh(&self) -> bool {
        self.session.read().await.can_refresh()
    }

    /// Current lifecycle phase
    pub async fn state(&self) -> SessionState {
        if self.reissuing.load(Ordering::Acquire) {
            return SessionState::Reissuing;
        }
        if self.session.read().await.is_logged_in() {
            SessionState::LoggedIn
        } else {
            SessionState::LoggedOut
        }
    }

    /// Renew the access token after a request carrying `failed_token` was rejected
    ///
    /// Calls are serialized. A caller that arrives after another caller already
    /// replaced `failed_token` gets the new token without a second renewal.
    ///
    /// # Errors
    ///
    /// - [`SmartWindowError::Unauthorized`] when there is no refresh token.
    /// - [`SmartWindowError::SessionExpired`] when `reissue` fails (the session is
    ///   cleared) or when a concurrent failure already cleared it.
    pub async fn reissue<F, Fut>(&self, failed_token: Option<&str>, reissue: F) -> Result<String>
    where
        F: FnOnce(String) -> Fut + Send,
        Fut: Future<Output = Result<TokenPair>> + Send,
    {
        let _guard = self.reissue_lock.lock().await;
        let current = self.snapshot().await;

        match (current.access_token.as_deref(), failed_token) {
            (Some(token), Some(failed)) if token != failed => {
                info!("Access token already renewed by a concurrent request");
                return Ok(token.to_string());
            }
            (Some(token), None) => return Ok(token.to_string()),
            (None, Some(_)) => return Err(SmartWindowError::SessionExpired),
            _ => {}
        }

        let Some(refresh_token) = current.refresh_token else {
            return Err(SmartWindowError::Unauthorized);
        };

        info!("Reissuing access token");
        let outcome = {
            let _flag = ReissueFlag::raise(&self.reissuing);
            reissue(refresh_token.clone()).await
        };

        match outcome {
            Ok(pair) => {
                let refresh = pair.refresh_token.unwrap_or(refresh_token);
                self.login(pair.access_token.clone(), refresh).await?;
                Ok(pair.access_token)
            }
            Err(e) => {
                warn!("Token reissue failed: {}", e);
                if let Err(clear_err) = self.clear().await {
                    warn!("Failed to clear persisted session: {}", clear_err);
                }
                Err(SmartWindowError::SessionExpired)
            }
        }
    }
}

/// Keeps `reissuing` raised for as long as the renewal future is alive, including
/// when the caller drops it mid-flight
struct ReissueFlag<'a>(&'a AtomicBool);

impl<'a> ReissueFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ReissueFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("reissuing", &self.reissuing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
