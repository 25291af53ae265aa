//! Access credentials with single-flight refresh.
//!
//! Every sync executor that hits a 401 asks the provider to refresh. Concurrent
//! requests share one in-flight refresh instead of racing the auth endpoint
//! with the same refresh token.

use crate::error::CredentialError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Token to send now, if one is known and not expired.
    async fn current_access_token(&self) -> Option<String>;

    async fn refresh(&self) -> Result<Credential, CredentialError>;
}

/// Exchanges a refresh token for a new credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: Option<String>) -> Result<Credential, CredentialError>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, CredentialError>>>;

pub struct SingleFlightCredentials {
    refresher: Arc<dyn TokenRefresher>,
    current: RwLock<Option<Credential>>,
    // generation of the refresh that owns the slot
    inflight: Mutex<Option<(u64, RefreshFuture)>>,
    generation: Mutex<u64>,
}

impl SingleFlightCredentials {
    pub fn new(refresher: Arc<dyn TokenRefresher>, initial: Option<Credential>) -> Self {
        Self {
            refresher,
            current: RwLock::new(initial),
            inflight: Mutex::new(None),
            generation: Mutex::new(0),
        }
    }

    pub fn current(&self) -> Option<Credential> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn join_or_start(&self) -> (u64, RefreshFuture) {
        let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((generation, fut)) = slot.as_ref() {
            debug!(generation, "joining in-flight credential refresh");
            return (*generation, fut.clone());
        }

        let generation = {
            let mut counter = self.generation.lock().unwrap_or_else(|e| e.into_inner());
            *counter += 1;
            *counter
        };
        let refresh_token = self.current().and_then(|c| c.refresh_token);
        let refresher = self.refresher.clone();
        let fut = async move { refresher.refresh(refresh_token).await }
            .boxed()
            .shared();
        *slot = Some((generation, fut.clone()));
        info!(generation, "starting credential refresh");
        (generation, fut)
    }
}

#[async_trait]
impl CredentialProvider for SingleFlightCredentials {
    async fn current_access_token(&self) -> Option<String> {
        self.current()
            .filter(|c| !c.access_token.is_empty() && !c.is_expired(Utc::now()))
            .map(|c| c.access_token)
    }

    async fn refresh(&self) -> Result<Credential, CredentialError> {
        let (generation, fut) = self.join_or_start();
        let result = fut.await;

        // The first waiter to finish publishes the result and frees the slot.
        let mut slot = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(slot.as_ref(), Some((owner, _)) if *owner == generation) {
            *slot = None;
            match &result {
                Ok(credential) => {
                    let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
                    let refresh_token = credential
                        .refresh_token
                        .clone()
                        .or_else(|| current.as_ref().and_then(|c| c.refresh_token.clone()));
                    *current = Some(Credential {
                        refresh_token,
                        ..credential.clone()
                    });
                }
                Err(err) => warn!(generation, %err, "credential refresh failed"),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRefresher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(
            &self,
            refresh_token: Option<String>,
        ) -> Result<Credential, CredentialError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            match refresh_token {
                Some(_) => Ok(Credential::new(format!("access-{n}"), None)),
                None => Err(CredentialError::MissingRefreshToken),
            }
        }
    }

    fn provider(initial: Option<Credential>) -> (Arc<CountingRefresher>, SingleFlightCredentials) {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
        });
        let creds = SingleFlightCredentials::new(refresher.clone(), initial);
        (refresher, creds)
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_call() {
        let (refresher, creds) =
            provider(Some(Credential::new("stale", Some("refresh-1".into()))));

        let results =
            futures::future::join_all((0..8).map(|_| creds.refresh())).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap().access_token, "access-1");
        }

        // refresh token survives a response that omits it
        let current = creds.current().unwrap();
        assert_eq!(current.access_token, "access-1");
        assert_eq!(current.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(creds.current_access_token().await.as_deref(), Some("access-1"));

        // the slot is free again afterwards
        assert_eq!(creds.refresh().await.unwrap().access_token, "access-2");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_refresh_token_is_shared_error() {
        let (refresher, creds) = provider(None);
        let (a, b) = tokio::join!(creds.refresh(), creds.refresh());
        assert_eq!(a.unwrap_err(), CredentialError::MissingRefreshToken);
        assert_eq!(b.unwrap_err(), CredentialError::MissingRefreshToken);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(creds.current_access_token().await.is_none());
    }

    #[tokio::test]
    async fn expired_token_is_not_offered() {
        let mut cred = Credential::new("old", None);
        cred.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let (_, creds) = provider(Some(cred));
        assert!(creds.current_access_token().await.is_none());
    }
}
