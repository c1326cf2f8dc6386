use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::AUTHORIZATION, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::{Result, SmartWindowError},
    session::{SessionManager, TokenPair},
    store::{KeyValueStore, PUSH_TOKEN_KEY},
    types::ApiConfig,
};

/// Token renewal endpoint
pub const REISSUE_PATH: &str = "/tokens/reissue";

/// Server-side session invalidation endpoint
pub const LOGOUT_PATH: &str = "/tokens/logout";

/// Profile of the signed-in user
pub const ME_PATH: &str = "/users/me";

/// Outbound API request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method
    pub method: Method,
    /// Path relative to the API base URL
    pub path: String,
    /// JSON body
    pub body: Option<Value>,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// Set once the request has been replayed after a token reissue
    pub retried: bool,
}

impl ApiRequest {
    /// Build a request
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
            retried: false,
        }
    }

    /// `GET path`
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST path` with a JSON body
    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    /// `PUT path` with a JSON body
    #[must_use]
    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    /// `PATCH path` with a JSON body
    #[must_use]
    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    /// `DELETE path`
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Set `Authorization: Bearer <token>`
    #[must_use]
    pub fn with_bearer(mut self, token: &str) -> Self {
        self.set_header(AUTHORIZATION.as_str(), format!("Bearer {token}"));
        self
    }

    /// Set a header, replacing any previous value (names compare case-insensitively)
    pub fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value));
    }

    /// Value of a header
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Token carried in the `Authorization` header
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        self.header(AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// Raw response from the backend
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Bytes,
}

impl ApiResponse {
    /// Create a response
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Whether the status is 2xx
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Decode the enveloped payload
    ///
    /// Bodies shaped `{"status": .., "data": ..}` are unwrapped; anything else is
    /// decoded as-is. An empty body decodes as JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::Serialization`] if the body does not match `T`.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        let value: Value = if self.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&self.body)?
        };

        match serde_json::from_value::<Envelope<Value>>(value.clone()) {
            Ok(envelope) => Ok(serde_json::from_value(envelope.data)?),
            Err(_) => Ok(serde_json::from_value(value)?),
        }
    }

    /// Convert a non-success response into an error, preferring the server message
    #[must_use]
    pub fn into_error(self) -> SmartWindowError {
        if self.status == 401 {
            return SmartWindowError::Unauthorized;
        }

        let message = serde_json::from_slice::<ErrorBody>(&self.body)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| "Request failed".to_string());

        SmartWindowError::Http {
            status: self.status,
            message,
        }
    }
}

/// Success envelope wrapping every backend payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Application status code
    pub status: u16,
    /// Payload
    pub data: T,
}

/// Error body returned by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// HTTP status mirrored in the body
    #[serde(default)]
    pub status: Option<u16>,
    /// Application error code
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Executes requests against the backend
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send the request and return whatever the server answered
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// [`HttpTransport`] backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: ApiConfig,
}

impl ReqwestTransport {
    /// Build a client for `config`
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::Network`] if the TLS backend cannot be initialized.
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = self.config.url(&request.path);
        debug!("{} {}", request.method, url);

        let mut builder = self.client.request(request.method.clone(), &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SmartWindowError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }
            } else {
                SmartWindowError::from(e)
            }
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        debug!("{} {} -> {}", request.method, url, status);

        Ok(ApiResponse { status, body })
    }
}

/// Cached GET payloads, keyed by request path
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl QueryCache {
    /// Cached payload for `path`
    pub async fn get(&self, path: &str) -> Option<Value> {
        self.entries.read().await.get(path).cloned()
    }

    /// Store a payload
    pub async fn insert(&self, path: &str, value: Value) {
        self.entries.write().await.insert(path.to_string(), value);
    }

    /// Drop every entry whose path starts with `prefix`
    pub async fn invalidate(&self, prefix: &str) {
        self.entries
            .write()
            .await
            .retain(|path, _| !path.starts_with(prefix));
    }

    /// Drop everything
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing is cached
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Where the app should land after cold start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRoute {
    /// No usable session
    Login,
    /// Session verified against the backend
    Home(UserInfo),
}

/// `GET /users/me`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// User id
    pub id: i64,
    /// Account email
    pub email: String,
    /// Display name
    pub nickname: String,
}

/// Operating mode of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceMode {
    /// Menu display
    MenuMode,
    /// User-arranged widgets
    CustomMode,
    /// Sensor-driven automation
    AutoMode,
    /// Opaque glass
    PrivacyMode,
    /// Plain transparent glass
    GlassMode,
}

/// Backend view of a registered window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetail {
    /// Backend id
    pub device_id: i64,
    /// User-chosen name
    pub device_name: String,
    /// Hardware serial
    pub device_unique_id: String,
    /// Power on/off
    pub power_status: bool,
    /// Pane open/closed
    pub open_status: bool,
    /// Glass opaque/clear; not reported by every backend version
    #[serde(default)]
    pub opacity_status: bool,
    /// Current mode
    pub mode_status: DeviceMode,
    /// Per-mode settings
    #[serde(default, deserialize_with = "null_as_empty")]
    pub mode_settings: HashMap<String, Value>,
    /// Media shown on the glass
    #[serde(default)]
    pub media_id: Option<i64>,
    /// Music attached to the media
    #[serde(default)]
    pub music_id: Option<i64>,
    /// Registration time
    pub created_at: String,
}

impl DeviceDetail {
    /// Whether the displayed media changed since `previous`, e.g. because a
    /// generated image finished processing
    #[must_use]
    pub fn media_changed(&self, previous: &Self) -> bool {
        self.device_id == previous.device_id && self.media_id != previous.media_id
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<HashMap<String, Value>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Reply to a power or open toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Backend id
    pub device_id: i64,
    /// New value of the toggled flag
    pub status: bool,
}

/// Reply to a mode change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModeStatus {
    /// Backend id
    pub device_id: i64,
    /// Mode now active
    pub mode_status: DeviceMode,
}

/// Authenticated client for the smart-window backend
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    session: Arc<SessionManager>,
    store: Arc<dyn KeyValueStore>,
    cache: QueryCache,
}

impl ApiClient {
    /// Create a client over an arbitrary transport
    #[must_use]
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        session: Arc<SessionManager>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            transport,
            session,
            store,
            cache: QueryCache::default(),
        }
    }

    /// Create a client talking HTTP through reqwest
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::Network`] if the HTTP client cannot be built.
    pub fn with_config(
        config: ApiConfig,
        session: Arc<SessionManager>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let transport = ReqwestTransport::new(config)?;
        Ok(Self::new(Arc::new(transport), session, store))
    }

    /// Session this client authenticates with
    #[must_use]
    pub const fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Response cache
    #[must_use]
    pub const fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Put the current access token on the request; no-op when logged out
    pub async fn attach_auth_header(&self, request: &mut ApiRequest) {
        if let Some(header) = self.session.bearer_header().await {
            request.set_header(AUTHORIZATION.as_str(), header);
        }
    }

    /// Send an authenticated request, renewing the token once on 401
    ///
    /// Non-2xx responses other than 401 are returned as-is.
    ///
    /// # Errors
    ///
    /// Transport errors, or the outcome of [`ApiClient::handle_unauthorized`].
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse> {
        self.attach_auth_header(&mut request).await;
        let response = self.transport.execute(&request).await?;

        if response.status == 401 {
            return self.handle_unauthorized(request, response).await;
        }

        Ok(response)
    }

    /// Recover from a 401 by reissuing the access token and replaying the request once
    ///
    /// # Errors
    ///
    /// - [`SmartWindowError::Unauthorized`] if the request was already replayed, no
    ///   refresh token exists, or the replay is rejected again.
    /// - [`SmartWindowError::SessionExpired`] if the refresh token was rejected; the
    ///   session and cache are cleared.
    pub async fn handle_unauthorized(
        &self,
        mut failed: ApiRequest,
        response: ApiResponse,
    ) -> Result<ApiResponse> {
        if failed.retried {
            warn!("{} {} rejected after token reissue", failed.method, failed.path);
            return Err(response.into_error());
        }

        if !self.session.can_refresh().await {
            debug!("401 without refresh token for {}", failed.path);
            return Err(response.into_error());
        }

        let failed_token = failed.bearer_token().map(ToString::to_string);
        let token = match self
            .session
            .reissue(failed_token.as_deref(), |refresh| self.request_reissue(refresh))
            .await
        {
            Ok(token) => token,
            Err(e) => {
                if matches!(e, SmartWindowError::SessionExpired) {
                    self.cache.clear().await;
                }
                return Err(e);
            }
        };

        failed.retried = true;
        failed.set_header(AUTHORIZATION.as_str(), format!("Bearer {token}"));
        info!("Replaying {} {} with renewed token", failed.method, failed.path);

        let replay = self.transport.execute(&failed).await?;
        if replay.status == 401 {
            return Err(SmartWindowError::Unauthorized);
        }
        Ok(replay)
    }

    async fn request_reissue(&self, refresh_token: String) -> Result<TokenPair> {
        let request = ApiRequest::post(REISSUE_PATH, json!({ "refreshToken": refresh_token }));
        let response = self.transport.execute(&request).await?;

        if !response.is_success() {
            return Err(response.into_error());
        }
        response.data()
    }

    /// Send and decode an enveloped payload
    ///
    /// # Errors
    ///
    /// Errors from [`ApiClient::send`], [`SmartWindowError::Http`] for non-2xx
    /// responses, or decoding errors.
    pub async fn request<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        response.data()
    }

    /// `GET path`, served from the cache when possible
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::request`].
    pub async fn get_cached<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        if let Some(value) = self.cache.get(path).await {
            return Ok(serde_json::from_value(value)?);
        }

        let value: Value = self.request(ApiRequest::get(path)).await?;
        self.cache.insert(path, value.clone()).await;
        Ok(serde_json::from_value(value)?)
    }

    /// Enter the logged-in state with tokens from the OAuth callback or dev bypass
    ///
    /// # Errors
    ///
    /// Returns store errors if the session cannot be persisted.
    pub async fn login(&self, access_token: String, refresh_token: String) -> Result<()> {
        self.session.login(access_token, refresh_token).await
    }

    /// Invalidate the session on the server (best effort) and always clear it locally
    pub async fn logout(&self) {
        if let Some(token) = self.session.access_token().await {
            let request = ApiRequest::post(LOGOUT_PATH, json!({})).with_bearer(&token);
            match self.transport.execute(&request).await {
                Ok(response) if response.is_success() => info!("Server session invalidated"),
                Ok(response) => warn!("Logout rejected by server: HTTP {}", response.status),
                Err(e) => warn!("Logout request failed: {}", e),
            }
        }

        self.clear_local_state().await;
    }

    async fn clear_local_state(&self) {
        if let Err(e) = self.session.clear().await {
            warn!("Failed to clear persisted session: {}", e);
        }
        self.cache.clear().await;
    }

    /// Restore persisted tokens and verify them with one authenticated call
    pub async fn validate_on_startup(&self) -> StartupRoute {
        match self.session.restore().await {
            Ok(true) => {}
            Ok(false) => return StartupRoute::Login,
            Err(e) => {
                warn!("Could not read persisted session: {}", e);
                return StartupRoute::Login;
            }
        }

        match self.me().await {
            Ok(user) => {
                info!("Restored session for {}", user.nickname);
                StartupRoute::Home(user)
            }
            Err(e) => {
                warn!("Persisted session rejected: {}", e);
                self.clear_local_state().await;
                StartupRoute::Login
            }
        }
    }

    /// Delete the account, then clear the session
    ///
    /// # Errors
    ///
    /// Returns request errors; local state is kept when the server refuses.
    pub async fn delete_account(&self) -> Result<()> {
        let response = self.send(ApiRequest::delete(ME_PATH)).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        self.clear_local_state().await;
        Ok(())
    }

    /// Profile of the signed-in user
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::request`].
    pub async fn me(&self) -> Result<UserInfo> {
        self.request(ApiRequest::get(ME_PATH)).await
    }

    /// Change the display name
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::request`].
    pub async fn update_nickname(&self, nickname: &str) -> Result<UserInfo> {
        self.request(ApiRequest::put(ME_PATH, json!({ "nickname": nickname })))
            .await
    }

    /// Windows registered to the user
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::request`].
    pub async fn devices(&self) -> Result<Vec<DeviceDetail>> {
        self.get_cached("/devices").await
    }

    /// One registered window
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::request`].
    pub async fn device_detail(&self, device_id: i64) -> Result<DeviceDetail> {
        self.get_cached(&format!("/devices/{device_id}")).await
    }

    async fn update_device<T: DeserializeOwned>(
        &self,
        device_id: i64,
        suffix: &str,
        body: Value,
    ) -> Result<T> {
        let reply = self
            .request(ApiRequest::patch(
                format!("/devices/{device_id}/{suffix}"),
                body,
            ))
            .await?;
        self.cache.invalidate("/devices").await;
        Ok(reply)
    }

    /// Switch the window on or off
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::request`].
    pub async fn set_power(&self, device_id: i64, on: bool) -> Result<DeviceStatus> {
        self.update_device(device_id, "power", json!({ "status": on }))
            .await
    }

    /// Record the pane as open or closed on the backend
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::request`].
    pub async fn set_open(&self, device_id: i64, open: bool) -> Result<DeviceStatus> {
        self.update_device(device_id, "open", json!({ "status": open }))
            .await
    }

    /// Change the operating mode
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::request`].
    pub async fn set_mode(&self, device_id: i64, mode: DeviceMode) -> Result<DeviceModeStatus> {
        self.update_device(device_id, "mode/status", json!({ "mode": mode }))
            .await
    }

    /// Show a stored media item on the window
    ///
    /// # Errors
    ///
    /// Same as [`ApiClient::request`].
    pub async fn set_device_media(&self, device_id: i64, media_id: i64) -> Result<DeviceDetail> {
        self.update_device(device_id, "media", json!({ "mediaId": media_id }))
            .await
    }

    /// Cache the push token locally and register it with the backend
    ///
    /// # Errors
    ///
    /// Returns store errors, or request errors from the registration call.
    pub async fn register_push_token(&self, token: &str) -> Result<()> {
        self.store.set(PUSH_TOKEN_KEY, token).await?;

        let response = self
            .send(ApiRequest::post("/devices/fcm", json!({ "fcmToken": token })))
            .await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        info!("Push token registered");
        Ok(())
    }
}
