use crate::credentials::{Credential, CredentialProvider, TokenRefresher};
use crate::error::{CredentialError, SyncError};
use crate::model::OutboxEvent;
use crate::outbox::SyncExecutor;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const USER_AGENT: &str = "lume-sync/0.1";

fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder().user_agent(USER_AGENT).no_proxy().build()
}

/// Pushes every event type to `{base_url}/v1/sync/{event_type}/{entity_id}`.
#[derive(Clone)]
pub struct HttpSyncExecutor {
    http: Client,
    base_url: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl fmt::Debug for HttpSyncExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSyncExecutor")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpSyncExecutor {
    pub fn new(base_url: Url, credentials: Arc<dyn CredentialProvider>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: http_client()?,
            base_url,
            credentials,
        })
    }

    pub fn build_request(
        &self,
        event: &OutboxEvent,
        token: Option<&str>,
    ) -> Result<reqwest::Request, SyncError> {
        let endpoint = self
            .base_url
            .join(&format!("v1/sync/{}/{}", event.event_type, event.entity_id))
            .map_err(|e| SyncError::Terminal(format!("invalid sync endpoint: {e}")))?;
        let method = if event.is_new_record {
            Method::POST
        } else {
            Method::PUT
        };
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Content-Type", "application/json")
            .json(&sync_body(event));
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        builder
            .build()
            .map_err(|e| SyncError::Terminal(format!("failed to build sync request: {e}")))
    }

    async fn send(&self, event: &OutboxEvent, token: Option<&str>) -> Result<StatusCode, SyncError> {
        let request = self.build_request(event, token)?;
        debug!(url = %request.url(), method = %request.method(), id = %event.id, "sending sync request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| SyncError::Retryable(format!("failed to reach backend: {e}")))?;
        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status.is_success() {
            return Ok(status);
        }
        let body = res.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

fn sync_body(event: &OutboxEvent) -> Value {
    json!({
        "event_id": event.id,
        "user_id": event.user_id,
        "entity_id": event.entity_id,
        "is_new_record": event.is_new_record,
        "metadata": event.metadata,
    })
}

/// Maps a non-success, non-401 status to the sync error the outbox records.
pub fn classify_status(status: StatusCode, body: &str) -> SyncError {
    let message = format!("backend returned {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        SyncError::Retryable(message)
    } else {
        SyncError::Terminal(message)
    }
}

fn refresh_failure(err: CredentialError) -> SyncError {
    match err {
        CredentialError::Transport(msg) => SyncError::Retryable(msg),
        CredentialError::MissingRefreshToken | CredentialError::Rejected(_) => {
            SyncError::Unauthorized
        }
    }
}

#[async_trait]
impl SyncExecutor for HttpSyncExecutor {
    async fn execute(&self, event: &OutboxEvent) -> Result<(), SyncError> {
        let token = self.credentials.current_access_token().await;
        if self.send(event, token.as_deref()).await? != StatusCode::UNAUTHORIZED {
            return Ok(());
        }

        warn!(id = %event.id, "backend rejected token; refreshing");
        let fresh = self.credentials.refresh().await.map_err(refresh_failure)?;
        match self.send(event, Some(&fresh.access_token)).await? {
            StatusCode::UNAUTHORIZED => Err(SyncError::Unauthorized),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchanges the refresh token at `{base_url}/v1/auth/refresh`.
#[derive(Debug, Clone)]
pub struct RemoteTokenRefresher {
    http: Client,
    base_url: Url,
}

impl RemoteTokenRefresher {
    pub fn new(base_url: Url) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: http_client()?,
            base_url,
        })
    }
}

#[async_trait]
impl TokenRefresher for RemoteTokenRefresher {
    async fn refresh(&self, refresh_token: Option<String>) -> Result<Credential, CredentialError> {
        let refresh_token = refresh_token.ok_or(CredentialError::MissingRefreshToken)?;
        let endpoint = self
            .base_url
            .join("v1/auth/refresh")
            .map_err(|e| CredentialError::Transport(e.to_string()))?;
        let res = self
            .http
            .post(endpoint)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| CredentialError::Transport(e.to_string()))?;

        let status = res.status();
        if status.is_client_error() {
            let body = res.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(CredentialError::Transport(format!("auth endpoint returned {status}")));
        }
        let payload: RefreshResponse = res
            .json()
            .await
            .map_err(|e| CredentialError::Transport(format!("invalid refresh response: {e}")))?;
        Ok(Credential {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token,
            expires_at: payload.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        })
    }
}
