//! Session-authenticated HTTPS client for the vSphere REST API.
//!
//! Owns the authentication token for `https://{host}/api/...` calls.
//! `open()` / `close()` bracket the session lifetime; `ensure_valid()`
//! probes the session and performs exactly one reconnect cycle when the
//! platform has expired it server-side.

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::types::{SessionInfo, VsphereConfig};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Header carrying the session token on every authenticated call.
pub const SESSION_HEADER: &str = "vmware-api-session-id";

/// Authenticated connection to the control plane.
///
/// One instance is shared per process (behind the facade mutex); the token
/// is rotated in place on re-authentication so every subsequent call sees
/// the fresh session immediately.
#[derive(Debug)]
pub struct VsphereSession {
    client: Client,
    base_url: String,
    token: Option<String>,
    config: VsphereConfig,
    last_used_at: Option<DateTime<Utc>>,
}

impl VsphereSession {
    /// Build a new session from config (does NOT authenticate yet).
    pub fn new(config: &VsphereConfig) -> VsphereResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .cookie_store(true)
            .build()
            .map_err(|e| VsphereError::connection(format!("Failed to build HTTP client: {e}")))?;

        let base_url = format!("https://{}:{}", config.host, config.port);

        Ok(Self {
            client,
            base_url,
            token: None,
            config: config.clone(),
            last_used_at: None,
        })
    }

    /// Base URL for API calls.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether we hold a session token.
    pub fn is_open(&self) -> bool {
        self.token.is_some()
    }

    /// Current session token (if any).
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Current config.
    pub fn config(&self) -> &VsphereConfig {
        &self.config
    }

    /// When an authenticated call last went out.
    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        self.last_used_at
    }

    /// The underlying HTTP client, for device-URL streaming and the
    /// lease keep-alive task.
    pub fn http(&self) -> &Client {
        &self.client
    }

    // ── Session lifecycle ───────────────────────────────────────────

    /// Authenticate and store the session token (POST /api/session).
    pub async fn open(&mut self) -> VsphereResult<()> {
        let url = format!("{}/api/session", self.base_url);

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(VsphereError::auth("Invalid credentials"));
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VsphereError::api(status.as_u16(), format!("Login failed: {body}")));
        }

        // Token comes back as a quoted JSON string
        let token: String = resp
            .json()
            .await
            .map_err(|e| VsphereError::parse(format!("Failed to parse session response: {e}")))?;

        info!("Session opened for {}@{}", self.config.username, self.config.host);
        self.token = Some(token);
        self.last_used_at = Some(Utc::now());
        Ok(())
    }

    /// Log out and clear the token (DELETE /api/session).
    pub async fn close(&mut self) -> VsphereResult<()> {
        if let Some(ref token) = self.token {
            let url = format!("{}/api/session", self.base_url);
            let _ = self
                .client
                .delete(&url)
                .header(SESSION_HEADER, token.as_str())
                .send()
                .await;
            debug!("Session closed for {}", self.config.host);
        }
        self.token = None;
        Ok(())
    }

    /// Cheap read-only probe of the current session (GET /api/session).
    pub async fn probe(&self) -> VsphereResult<SessionInfo> {
        self.get::<SessionInfo>("/api/session").await
    }

    /// User the current session authenticates as.
    pub async fn current_user(&self) -> VsphereResult<String> {
        Ok(self.probe().await?.user)
    }

    /// Make sure the session is usable, re-authenticating at most once.
    ///
    /// Probes the session; on an auth failure it performs one logout+login
    /// cycle and probes again. A second failure is surfaced, never retried.
    pub async fn ensure_valid(&mut self) -> VsphereResult<()> {
        if self.token.is_none() {
            self.open().await?;
        }

        match self.probe().await {
            Ok(_) => {
                self.last_used_at = Some(Utc::now());
                return Ok(());
            }
            Err(e) if e.kind == VsphereErrorKind::Authentication => {
                warn!("Session expired on {}; reconnecting once", self.config.host);
            }
            Err(e) => return Err(e),
        }

        self.close().await?;
        self.open().await?;
        self.probe().await.map_err(|e| {
            VsphereError::connection(format!("Session unusable after reconnect: {e}"))
        })?;
        self.last_used_at = Some(Utc::now());
        Ok(())
    }

    // ── HTTP helpers ────────────────────────────────────────────────

    fn require_token(&self) -> VsphereResult<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| VsphereError::auth("Not logged in — no active session"))
    }

    /// GET a JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> VsphereResult<T> {
        let resp = self.get_raw(path).await?;
        Self::parse_response(resp).await
    }

    /// GET raw `Response`.
    pub async fn get_raw(&self, path: &str) -> VsphereResult<Response> {
        let token = self.require_token()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .header(SESSION_HEADER, token)
            .send()
            .await?;
        Self::check_status(resp).await
    }

    /// POST with JSON body, return parsed response.
    pub async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> VsphereResult<T> {
        let resp = self.post_raw(path, body).await?;
        Self::parse_response(resp).await
    }

    /// POST with JSON body, return raw `Response`.
    pub async fn post_raw<B: serde::Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> VsphereResult<Response> {
        let token = self.require_token()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header(SESSION_HEADER, token)
            .json(body)
            .send()
            .await?;
        Self::check_status(resp).await
    }

    /// POST with no body, discarding the response.
    pub async fn post_empty(&self, path: &str) -> VsphereResult<()> {
        let token = self.require_token()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .header(SESSION_HEADER, token)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    /// PATCH with JSON body.
    pub async fn patch<B: serde::Serialize>(&self, path: &str, body: &B) -> VsphereResult<()> {
        let token = self.require_token()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .patch(&url)
            .header(SESSION_HEADER, token)
            .json(body)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    /// DELETE, ignoring the response body.
    pub async fn delete(&self, path: &str) -> VsphereResult<()> {
        let token = self.require_token()?;
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .delete(&url)
            .header(SESSION_HEADER, token)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn check_status(resp: Response) -> VsphereResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let code = status.as_u16();
        let body = resp.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED => {
                Err(VsphereError::auth(format!("Session expired or invalid: {body}")))
            }
            StatusCode::NOT_FOUND => {
                Err(VsphereError::not_found(format!("Resource not found: {body}")))
            }
            _ => Err(VsphereError::api(code, format!("API error {code}: {body}"))),
        }
    }

    async fn parse_response<T: DeserializeOwned>(resp: Response) -> VsphereResult<T> {
        let text = resp
            .text()
            .await
            .map_err(|e| VsphereError::parse(format!("Failed to read response body: {e}")))?;

        if text.is_empty() {
            // Some endpoints return an empty body for success
            return serde_json::from_str("null")
                .map_err(|e| VsphereError::parse(format!("Cannot deserialise empty response: {e}")));
        }

        serde_json::from_str(&text).map_err(|e| {
            VsphereError::parse(format!(
                "JSON parse error: {e} — body: {}",
                &text[..text.len().min(500)]
            ))
        })
    }
}
